use std::fmt;
use std::time::{Duration, Instant};

use crate::core::TextEncoding;
use super::codec;

/// Reserved message values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Control {
    /// Start of handshake
    Soh = 1,
    /// Reserved, unused in rev. 1206
    Stx = 2,
    /// Handshake complete, normal exchange begins
    Etx = 3,
    /// Terminate, or incompatible version
    Eot = 4,
    /// Asking for heartbeat
    Abf = 5,
    /// Checksum echoed correctly
    Ack = 6,
    /// Heartbeat reply
    Ant = 7,
}

impl Control {
    /// Maps a raw message value onto a control code
    pub fn from_message(message: u16) -> Option<Self> {
        match message {
            1 => Some(Control::Soh),
            2 => Some(Control::Stx),
            3 => Some(Control::Etx),
            4 => Some(Control::Eot),
            5 => Some(Control::Abf),
            6 => Some(Control::Ack),
            7 => Some(Control::Ant),
            _ => None,
        }
    }

    /// Wire value
    pub fn value(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        match self {
            Control::Soh => "SOH",
            Control::Stx => "STX",
            Control::Etx => "ETX",
            Control::Eot => "EOT",
            Control::Abf => "ABF",
            Control::Ack => "ACK",
            Control::Ant => "ANT",
        }
    }

    /// Whether a message value is reserved
    pub fn is_reserved(message: u16) -> bool {
        Self::from_message(message).is_some()
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single protocol frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal {
    message: u16,
    sequence_id: u16,
    /// Local construction time, never transmitted
    created_at: Instant,
}

impl Signal {
    /// Creates a signal stamped with the current time
    pub fn new(message: u16, sequence_id: u16) -> Self {
        Self::at(message, sequence_id, Instant::now())
    }

    /// Creates a signal stamped with the given time
    pub fn at(message: u16, sequence_id: u16, created_at: Instant) -> Self {
        Signal {
            message,
            sequence_id,
            created_at,
        }
    }

    pub fn message(&self) -> u16 {
        self.message
    }

    pub fn sequence_id(&self) -> u16 {
        self.sequence_id
    }

    /// Time since construction
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Control code carried by this signal, if any
    pub fn control(&self) -> Option<Control> {
        Control::from_message(self.message)
    }

    /// Whether the signal carries the given control code
    pub fn is(&self, control: Control) -> bool {
        self.message == control.value()
    }

    /// Digit-sum checksum the peer is expected to echo for this signal
    pub fn checksum(&self, encoding: TextEncoding) -> u16 {
        codec::checksum(self.message, encoding)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.control() {
            Some(control) => write!(f, "{}#{}", control, self.sequence_id),
            None => write!(f, "{}#{}", self.message, self.sequence_id),
        }
    }
}
