use std::net::IpAddr;

use clap::{Args, Parser, Subcommand};

use crate::config::{ClientConfig, EchoPolicy, HubConfig, ServerConfig, DEFAULT_USERNAME};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the broadcast server.
    Start(StartArgs),
    /// Connect to a broadcast server and chat from the terminal.
    Connect(ConnectArgs),
}

#[derive(Args, Debug, Clone)]
pub struct StartArgs {
    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Interface to bind.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Do not send clients their own messages back.
    #[arg(long)]
    pub no_echo: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// Server address to connect to.
    #[arg(long, default_value = "localhost:8080")]
    pub server: String,

    /// Your display name.
    #[arg(long, default_value = DEFAULT_USERNAME)]
    pub name: String,
}

impl From<StartArgs> for ServerConfig {
    fn from(args: StartArgs) -> Self {
        let echo = if args.no_echo {
            EchoPolicy::ExcludeSender
        } else {
            EchoPolicy::All
        };
        ServerConfig {
            host: args.host,
            port: args.port,
            hub: HubConfig {
                echo,
                ..HubConfig::default()
            },
            ..ServerConfig::default()
        }
    }
}

impl From<ConnectArgs> for ClientConfig {
    fn from(args: ConnectArgs) -> Self {
        ClientConfig {
            server_addr: args.server,
            username: args.name,
        }
    }
}
