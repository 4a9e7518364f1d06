use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Host the live room, relaying every message to all participants.
    Serve(ServeArgs),
    /// Join a live room from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address to bind. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:3000")]
    pub listen: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Name attached to every message you send.
    #[arg(long)]
    pub name: String,

    /// Websocket URL of the live room.
    #[arg(long, default_value = "ws://127.0.0.1:3000/ws")]
    pub server: String,
}
