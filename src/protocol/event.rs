use super::signal::Signal;
use super::state::StatusKind;

/// Observable link activity, published on a broadcast channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A frame was handed to the channel
    FrameSent { signal: Signal },
    /// A whole frame was decoded from the channel
    FrameReceived { signal: Signal },
    /// The engine moved between states
    StatusChanged { from: StatusKind, to: StatusKind },
    /// A wait expired in the given state
    TimedOut { status: StatusKind },
    /// Bytes were discarded because they never formed a frame
    MalformedFrame { len: usize },
    /// A confirmed inbound message was handed to the application
    Delivered { message: u16 },
    /// The channel was released
    Closed,
}

/// Outcomes the engine reports to its driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    /// Handshake finished, normal exchange may begin
    Established,
    /// An application message was confirmed and its guard window has passed
    Sent(u16),
    /// An inbound message was confirmed by the peer's ACK
    Received(u16),
}
