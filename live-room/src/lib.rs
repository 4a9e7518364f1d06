//! A live room: a websocket broadcast relay where every message one
//! participant sends is forwarded, verbatim, to everyone connected.
//!
//! - [`relay`] owns the set of open connections and the fan-out. It is
//!   transport-agnostic and driven entirely by [`relay::Event`]s.
//! - [`server`] is the websocket transport: it accepts connections, turns
//!   socket activity into relay events and serves a `/health` probe.
//! - [`client`] joins a room from the terminal.
//! - [`message`] holds the conventional `{name, text}` shape and payload
//!   decoding.
//! - [`cli`] parses the command-line interface for serve and client modes.

pub mod cli;
pub mod client;
pub mod message;
pub mod relay;
pub mod server;
