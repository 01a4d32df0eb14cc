//! Network module - Handles RPC endpoints over byte-stream connections
//!
//! Provides:
//! - Server for serving accepted connections through an `Invoker`
//! - Router, a name-based `Invoker`
//! - Client for issuing multiplexed calls over one connection
//! - Connection handshake and state

mod client;
mod connection;
mod router;
mod server;

pub use client::*;
pub use connection::*;
pub use router::*;
pub use server::*;
