//! Link management module
//!
//! This module provides the byte channels an SCOM link runs over and the
//! [`Connection`] that drives the protocol engine on top of them.

mod channel;
mod connection;
mod driver;
mod serial;

#[cfg(test)]
pub(crate) mod mock;

pub use self::channel::{Channel, DataSink};
pub use self::connection::Connection;
pub use self::serial::SerialChannel;
