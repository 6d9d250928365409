//! Core types for the SCOM link
//!
//! Errors, configuration and the protocol constants shared by every layer.

pub mod error;
pub mod types;
pub mod serde;

pub use self::error::{Error, Result};
pub use self::types::{Config, TextEncoding};

/// Protocol version announced during the handshake (SCOM 2.0 rev. 1206)
pub const VERSION: u16 = 1206;

/// Length of a frame on the wire
pub const FRAME_LEN: usize = 4;

/// Default serial baud rate
pub const DEFAULT_BAUD_RATE: u32 = 115200;
