//! Protocol module - Defines the wire protocol for CoreRPC communication
//!
//! Every connection starts with a handshake preamble (a single JSON line) that
//! selects the codec. After that each message is a frame:
//! - 4 bytes header length (big-endian) followed by the encoded header
//! - 4 bytes body length (big-endian) followed by the encoded body

mod codec;
mod handshake;
mod header;
mod payload;

pub use codec::*;
pub use handshake::*;
pub use header::*;
pub use payload::*;

/// Magic number identifying this protocol family
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

/// Default port for CoreRPC servers
pub const DEFAULT_PORT: u16 = 9999;

/// Maximum size of a single header or body (10 MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;
