//! CoreRPC - Minimal multiplexed RPC runtime
//!
//! A client invokes named operations on a remote server over one persistent
//! connection, with any number of calls in flight at once.

pub mod config;
pub mod network;
pub mod protocol;

pub use network::{Call, CallError, Client, ClientError, InvokeError, Invoker, Router, Server, ServerConfig};
pub use protocol::{CodecType, Options, Payload};
