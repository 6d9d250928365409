//! Protocol implementation module
//!
//! This module defines the SCOM frame, its codec and checksum, and the
//! master-side protocol state machine.

pub mod codec;
pub mod event;
pub mod signal;
pub mod state;

pub use self::codec::{checksum, decode, encode, SignalCodec};
pub use self::event::{LinkEvent, Notice};
pub use self::signal::{Control, Signal};
pub use self::state::{ProtocolConfig, ProtocolState, Status, StatusKind};
