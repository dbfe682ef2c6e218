//! WebSocket broadcast server: every message a client sends is fanned out
//! to every connected client.
//!
//! Each module focuses on a concrete responsibility:
//!
//! - [`cli`] parses the `start` and `connect` subcommands.
//! - [`config`] holds the server, hub, session and client settings.
//! - [`message`] defines the chat message and its JSON wire format.
//! - [`connection`] adapts axum and tungstenite sockets to a common frame
//!   stream and sink.
//! - [`session`] binds one connection to an identity and runs the inbound
//!   and outbound pumps.
//! - [`hub`] owns the registry of live sessions. A single task processes
//!   register, unregister and broadcast requests one at a time, so the
//!   registry needs no lock.
//! - [`service`] is the facade the transport layer talks to instead of the
//!   hub directly.
//! - [`server`] accepts WebSocket upgrades and drives graceful shutdown.
//! - [`client`] is the interactive terminal client.

pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod message;
pub mod server;
pub mod service;
pub mod session;
