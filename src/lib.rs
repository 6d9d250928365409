//! SCOM: serial command link
//!
//! Master side of SCOM 2.0, a stop-and-wait protocol that moves 16-bit
//! messages over a serial line. Every message is confirmed by the peer
//! echoing its digit-sum checksum, and a stalled link is probed with ABF/ANT
//! heartbeats before it is given up.
pub mod core;
pub mod link;
pub mod protocol;
pub mod util;

// Re-export commonly used items
pub use core::{Config, Error, Result, TextEncoding};
pub use link::Connection;

/// Library version
pub const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");
