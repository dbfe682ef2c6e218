use std::{net::IpAddr, time::Duration};

use anyhow::{Context, Result};
use url::Url;

/// Fallback identity for clients that connect without a name.
pub const DEFAULT_USERNAME: &str = "anonymous";

/// Timing and sizing for one client session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capacity of the outbound queue. A client that falls this far behind is dropped.
    pub send_buffer: usize,
    /// Largest inbound payload accepted, in bytes.
    pub max_message_size: usize,
    /// Deadline for a single write to the peer.
    pub write_wait: Duration,
    /// Read deadline, refreshed by every frame received from the peer.
    pub pong_wait: Duration,
    /// How often the outbound pump pings the peer. Must be shorter than `pong_wait`.
    pub ping_period: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            send_buffer: 256,
            max_message_size: 4096,
            write_wait: Duration::from_secs(10),
            pong_wait,
            ping_period: pong_wait * 9 / 10,
        }
    }
}

/// Whether a sender receives its own broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EchoPolicy {
    /// Deliver to every registered session, the sender included.
    #[default]
    All,
    /// Skip the session the message came from.
    ExcludeSender,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Pending register/unregister/broadcast requests before producers wait.
    pub inbox_capacity: usize,
    pub echo: EchoPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 1024,
            echo: EchoPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    /// How long shutdown waits for sessions to flush their close frames.
    pub shutdown_grace: Duration,
    pub hub: HubConfig,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            port: 8080,
            shutdown_grace: Duration::from_secs(5),
            hub: HubConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the server.
    pub server_addr: String,
    pub username: String,
}

impl ClientConfig {
    /// WebSocket endpoint for this client, with the username percent-encoded.
    pub fn endpoint(&self) -> Result<Url> {
        let mut url = Url::parse(&format!("ws://{}/ws", self.server_addr))
            .with_context(|| format!("invalid server address '{}'", self.server_addr))?;
        url.query_pairs_mut().append_pair("username", &self.username);
        Ok(url)
    }
}
