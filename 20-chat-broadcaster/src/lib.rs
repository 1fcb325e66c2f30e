//! Single-room chat broadcaster.
//!
//! Clients connect over WebSocket (or plain TCP), pick a name with their first
//! line, and every later line is relayed to everyone in the room.
//!
//! - [`hub`] owns room membership and fans messages out from one task.
//! - [`session`] drives a client through `Connecting -> Active -> Draining ->
//!   Closed`, including the idle timeout.
//! - [`connection`] is the line-oriented seam between sessions and
//!   transports, with an adapter for raw byte streams.
//! - [`ws`] adapts axum WebSockets to that seam.
//! - [`server`] binds the listeners, serves the landing page and `/chat`.
//! - [`cli`] parses the command line into a [`server::ServerConfig`].

pub mod cli;
pub mod connection;
pub mod hub;
pub mod server;
pub mod session;
pub mod ws;
