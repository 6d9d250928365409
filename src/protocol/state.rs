use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, error, info, warn};

use crate::core::{Error, Result, TextEncoding, FRAME_LEN, VERSION};
use crate::link::Channel;
use super::codec::SignalCodec;
use super::event::{LinkEvent, Notice};
use super::signal::{Control, Signal};

/// Protocol timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Wait for a checksum echo before probing with ABF
    #[serde(serialize_with = "crate::core::serde::serialize_millis")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_millis")]
    pub timeout: Duration,
    /// Wait for the peer's ACK after echoing its checksum
    #[serde(serialize_with = "crate::core::serde::serialize_millis")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_millis")]
    pub ack_timeout: Duration,
    /// Guard window after sending ACK
    #[serde(serialize_with = "crate::core::serde::serialize_millis")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_millis")]
    pub ack_wait: Duration,
    /// Wait for ANT before probing again
    #[serde(serialize_with = "crate::core::serde::serialize_millis")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_millis")]
    pub abf_interval: Duration,
    /// Quiet period that ends a burst of ANT frames
    #[serde(serialize_with = "crate::core::serde::serialize_millis")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_millis")]
    pub refresh_interval: Duration,
    /// Wait for the peer's version during the handshake
    #[serde(serialize_with = "crate::core::serde::serialize_millis")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_millis")]
    pub signal_timeout: Duration,
    /// Period of the timer that evaluates the waits above
    #[serde(serialize_with = "crate::core::serde::serialize_millis")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_millis")]
    pub tick_interval: Duration,
    /// ABF probes allowed for one stalled exchange
    pub max_abf_attempts: u8,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            timeout: Duration::from_millis(1000),
            ack_timeout: Duration::from_millis(400),
            ack_wait: Duration::from_millis(550),
            abf_interval: Duration::from_millis(1000),
            refresh_interval: Duration::from_millis(10),
            signal_timeout: Duration::from_millis(10000),
            tick_interval: Duration::from_millis(10),
            max_abf_attempts: 10,
        }
    }
}

impl ProtocolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_abf_attempts == 0 {
            return Err(Error::config("max_abf_attempts must be at least 1"));
        }
        if self.tick_interval.is_zero() {
            return Err(Error::config("tick_interval must be positive"));
        }
        Ok(())
    }
}

/// Link state
///
/// Each waiting state carries the instant its wait began.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Idle, ready for the next message
    OkContinue,
    /// Handshake: waiting for the peer's version
    WaitingForSignal { since: Instant },
    /// Sent a message, waiting for its checksum
    WaitingForAsciiSum { expected: u16, since: Instant },
    /// Echoed a checksum, waiting for ACK
    WaitingForAck { since: Instant },
    /// Sent ACK, holding the guard window
    InAckTimeoutBuffer { since: Instant, confirmed: Signal },
    /// Sent ABF, waiting for ANT
    WaitingForAnt { since: Instant },
    /// Saw or sent ANT, waiting for the burst to end
    WaitingForMoreAnt { since: Instant },
    /// Heartbeat settled, waiting for the peer to repeat its message
    WaitingForRepMessage { since: Instant },
    /// Terminal
    ConnectionClosed,
}

impl Status {
    pub fn kind(&self) -> StatusKind {
        match self {
            Status::OkContinue => StatusKind::OkContinue,
            Status::WaitingForSignal { .. } => StatusKind::WaitingForSignal,
            Status::WaitingForAsciiSum { .. } => StatusKind::WaitingForAsciiSum,
            Status::WaitingForAck { .. } => StatusKind::WaitingForAck,
            Status::InAckTimeoutBuffer { .. } => StatusKind::InAckTimeoutBuffer,
            Status::WaitingForAnt { .. } => StatusKind::WaitingForAnt,
            Status::WaitingForMoreAnt { .. } => StatusKind::WaitingForMoreAnt,
            Status::WaitingForRepMessage { .. } => StatusKind::WaitingForRepMessage,
            Status::ConnectionClosed => StatusKind::ConnectionClosed,
        }
    }
}

/// Data-free view of [`Status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusKind {
    OkContinue,
    WaitingForSignal,
    WaitingForAsciiSum,
    WaitingForAck,
    InAckTimeoutBuffer,
    WaitingForAnt,
    WaitingForMoreAnt,
    WaitingForRepMessage,
    ConnectionClosed,
}

impl StatusKind {
    pub fn name(&self) -> &'static str {
        match self {
            StatusKind::OkContinue => "OK_CONTINUE",
            StatusKind::WaitingForSignal => "WAITING_FOR_SIGNAL",
            StatusKind::WaitingForAsciiSum => "WAITING_FOR_ASCII_SUM",
            StatusKind::WaitingForAck => "WAITING_FOR_ACK",
            StatusKind::InAckTimeoutBuffer => "IN_ACK_TIMEOUT_BUFFER",
            StatusKind::WaitingForAnt => "WAITING_FOR_ANT",
            StatusKind::WaitingForMoreAnt => "WAITING_FOR_MORE_ANT",
            StatusKind::WaitingForRepMessage => "WAITING_FOR_REP_MESSAGE",
            StatusKind::ConnectionClosed => "CONNECTION_CLOSED",
        }
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Handshake not started
    Idle,
    /// SOH in flight
    Greeting,
    /// Own version in flight
    Announcing,
    /// Waiting for the peer's version
    AwaitingPeer,
    /// ETX in flight
    Accepting,
    Established,
}

/// Master-side SCOM engine
///
/// Purely event driven: the owner feeds it received bytes and timer ticks, one
/// at a time, and it writes frames to the channel it owns. Every write happens
/// after the state it implies has been entered.
pub struct ProtocolState {
    channel: Box<dyn Channel>,
    config: ProtocolConfig,
    encoding: TextEncoding,
    status: Status,
    phase: Phase,
    next_sequence_id: u16,
    /// Application-level message awaiting its checksum
    last_sent: Option<Signal>,
    /// Inbound message awaiting the peer's ACK
    last_received: Option<u16>,
    abf_attempts: u8,
    /// Start of the wait for the peer's version
    awaiting_since: Option<Instant>,
    codec: SignalCodec,
    buffer: BytesMut,
    partial_since: Option<Instant>,
    notices: VecDeque<Notice>,
    events: broadcast::Sender<LinkEvent>,
}

impl ProtocolState {
    /// Creates an engine around an already opened channel
    pub fn new(
        channel: Box<dyn Channel>,
        config: ProtocolConfig,
        encoding: TextEncoding,
        events: broadcast::Sender<LinkEvent>,
    ) -> Self {
        ProtocolState {
            channel,
            config,
            encoding,
            status: Status::OkContinue,
            phase: Phase::Idle,
            next_sequence_id: 0,
            last_sent: None,
            last_received: None,
            abf_attempts: 0,
            awaiting_since: None,
            codec: SignalCodec::new(),
            buffer: BytesMut::with_capacity(FRAME_LEN),
            partial_since: None,
            notices: VecDeque::new(),
            events,
        }
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn kind(&self) -> StatusKind {
        self.status.kind()
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.status == Status::ConnectionClosed
    }

    pub fn is_established(&self) -> bool {
        self.phase == Phase::Established && !self.is_closed()
    }

    /// Whether an application message can be sent right now
    pub fn is_ready(&self) -> bool {
        self.is_established() && self.status == Status::OkContinue
    }

    pub fn abf_attempts(&self) -> u8 {
        self.abf_attempts
    }

    /// Message still waiting for its checksum, if any
    pub fn last_sent(&self) -> Option<&Signal> {
        self.last_sent.as_ref()
    }

    /// Outcomes produced since the last call
    pub fn drain_notices(&mut self) -> impl Iterator<Item = Notice> + '_ {
        self.notices.drain(..)
    }

    /// Begins the handshake by sending SOH
    pub fn start(&mut self, now: Instant) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        if self.phase != Phase::Idle {
            return Err(Error::invalid_state("handshake already started"));
        }
        info!(version = VERSION, "starting SCOM handshake");
        self.phase = Phase::Greeting;
        self.begin_exchange(Control::Soh.value(), now);
        Ok(())
    }

    /// Starts the exchange of one application message
    pub fn send(&mut self, message: u16, now: Instant) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        if Control::is_reserved(message) {
            return Err(Error::ReservedMessage(message));
        }
        if !self.is_established() {
            return Err(Error::invalid_state("handshake not complete"));
        }
        if self.status != Status::OkContinue {
            return Err(Error::invalid_state(format!("link busy in {}", self.kind())));
        }
        self.begin_exchange(message, now);
        Ok(())
    }

    /// Feeds bytes delivered by the channel
    ///
    /// Returns an error only when the connection has just ended.
    pub fn handle_data(&mut self, bytes: &[u8], now: Instant) -> Result<()> {
        if self.is_closed() || bytes.is_empty() {
            return Ok(());
        }
        self.buffer.extend_from_slice(bytes);
        let mut decoded = false;
        while let Some(signal) = self.codec.decode(&mut self.buffer)? {
            decoded = true;
            self.handle_signal(signal, now)?;
            if self.is_closed() {
                return Ok(());
            }
        }
        self.partial_since = match (self.buffer.is_empty(), decoded) {
            (true, _) => None,
            (false, true) => Some(now),
            (false, false) => self.partial_since.or(Some(now)),
        };
        Ok(())
    }

    /// Evaluates time-based transitions
    ///
    /// Returns an error only when the connection has just ended.
    pub fn handle_tick(&mut self, now: Instant) -> Result<()> {
        self.expire_partial(now);
        let elapsed = |since: Instant| now.saturating_duration_since(since);

        match self.status {
            Status::OkContinue | Status::ConnectionClosed => Ok(()),
            Status::WaitingForSignal { since } => {
                if elapsed(since) >= self.config.signal_timeout {
                    self.timed_out();
                    return Err(self.fail(Error::ConnectionTimeout, false));
                }
                Ok(())
            }
            Status::WaitingForAsciiSum { since, .. } => {
                if elapsed(since) >= self.config.timeout {
                    self.timed_out();
                    return self.probe(now);
                }
                Ok(())
            }
            Status::WaitingForAck { since } => {
                if elapsed(since) >= self.config.ack_timeout {
                    self.timed_out();
                    return self.probe(now);
                }
                Ok(())
            }
            Status::InAckTimeoutBuffer { since, confirmed } => {
                if elapsed(since) >= self.config.ack_wait {
                    self.transition(Status::OkContinue);
                    self.exchange_complete(confirmed.message(), now);
                }
                Ok(())
            }
            Status::WaitingForAnt { since } => {
                if elapsed(since) >= self.config.abf_interval {
                    self.timed_out();
                    return self.probe(now);
                }
                Ok(())
            }
            Status::WaitingForMoreAnt { since } => {
                if elapsed(since) >= self.config.refresh_interval {
                    self.settle(now, true);
                }
                Ok(())
            }
            Status::WaitingForRepMessage { since } => {
                if elapsed(since) >= self.config.timeout {
                    self.timed_out();
                    if let Some(message) = self.last_received.take() {
                        warn!(message, "peer never repeated its message, dropping it");
                    }
                    self.settle(now, false);
                }
                Ok(())
            }
        }
    }

    /// Sends EOT best-effort and releases the channel
    pub fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        info!(status = %self.kind(), "closing SCOM connection");
        self.shutdown(true);
    }

    fn handle_signal(&mut self, signal: Signal, now: Instant) -> Result<()> {
        debug!(message = signal.message(), sequence_id = signal.sequence_id(), status = %self.kind(), "frame received");
        self.emit(LinkEvent::FrameReceived { signal });

        match signal.control() {
            Some(Control::Eot) => {
                info!("peer terminated the connection");
                self.shutdown(false);
                Err(Error::ConnectionClosed)
            }
            Some(Control::Abf) => {
                self.answer_heartbeat(now);
                Ok(())
            }
            _ => self.dispatch(signal, now),
        }
    }

    fn dispatch(&mut self, signal: Signal, now: Instant) -> Result<()> {
        let control = signal.control();
        match self.status {
            // The peer's ACK can trail our echo past a heartbeat
            Status::WaitingForRepMessage { .. }
                if signal.is(Control::Ack) && self.last_received.is_some() =>
            {
                self.inbound_confirmed(now)
            }
            Status::OkContinue
            | Status::WaitingForSignal { .. }
            | Status::WaitingForRepMessage { .. } => {
                if control.is_none() {
                    self.echo_inbound(signal, now);
                } else {
                    debug!(%signal, "ignoring control frame");
                }
                Ok(())
            }
            Status::WaitingForAck { .. } => match control {
                Some(Control::Ack) => self.inbound_confirmed(now),
                None => {
                    self.echo_inbound(signal, now);
                    Ok(())
                }
                Some(_) => Ok(()),
            },
            Status::WaitingForAsciiSum { expected, .. } => {
                match control {
                    None if signal.message() == expected => self.confirm_outbound(now),
                    None => {
                        warn!(expected, got = signal.message(), "checksum mismatch, resending");
                        self.retransmit(now);
                    }
                    Some(_) => debug!(%signal, "ignoring control frame"),
                }
                Ok(())
            }
            Status::InAckTimeoutBuffer { .. } => {
                debug!(%signal, "discarding frame inside guard window");
                Ok(())
            }
            Status::WaitingForAnt { .. } | Status::WaitingForMoreAnt { .. } => match control {
                Some(Control::Ant) => {
                    self.transition(Status::WaitingForMoreAnt { since: now });
                    Ok(())
                }
                Some(Control::Ack) if self.last_received.is_some() => self.inbound_confirmed(now),
                None => {
                    // A data frame proves the peer alive as well as ANT does
                    self.settle(now, false);
                    self.dispatch(signal, now)
                }
                Some(_) => Ok(()),
            },
            Status::ConnectionClosed => Ok(()),
        }
    }

    fn begin_exchange(&mut self, message: u16, now: Instant) {
        let signal = self.next_signal(message, now);
        let expected = signal.checksum(self.encoding);
        self.last_sent = Some(signal);
        self.transition(Status::WaitingForAsciiSum { expected, since: now });
        self.write(signal);
    }

    /// Resends the pending message inside the current wait
    fn retransmit(&mut self, now: Instant) {
        let Some(previous) = self.last_sent else { return };
        debug!(message = previous.message(), outstanding = ?previous.age(now), "retransmitting");
        let signal = self.next_signal(previous.message(), now);
        self.last_sent = Some(signal);
        self.write(signal);
    }

    fn confirm_outbound(&mut self, now: Instant) {
        let Some(confirmed) = self.last_sent.take() else { return };
        self.abf_attempts = 0;
        let ack = self.next_signal(Control::Ack.value(), now);
        self.transition(Status::InAckTimeoutBuffer { since: now, confirmed });
        self.write(ack);
    }

    fn echo_inbound(&mut self, signal: Signal, now: Instant) {
        self.last_received = Some(signal.message());
        let echo = self.next_signal(signal.checksum(self.encoding), now);
        self.transition(Status::WaitingForAck { since: now });
        self.write(echo);
    }

    fn inbound_confirmed(&mut self, now: Instant) -> Result<()> {
        self.abf_attempts = 0;
        self.transition(Status::OkContinue);
        let Some(message) = self.last_received.take() else { return Ok(()) };

        match self.phase {
            Phase::AwaitingPeer => self.negotiate(message, now),
            Phase::Established => {
                debug!(message, "inbound message confirmed");
                self.notices.push_back(Notice::Received(message));
                self.emit(LinkEvent::Delivered { message });
                Ok(())
            }
            _ => {
                debug!(message, "dropping inbound message received mid-handshake");
                Ok(())
            }
        }
    }

    fn negotiate(&mut self, peer: u16, now: Instant) -> Result<()> {
        self.awaiting_since = None;
        if peer != VERSION {
            error!(local = VERSION, peer, "incompatible protocol version");
            self.shutdown(true);
            return Err(Error::IncompatibleProtocolVersion { local: VERSION, peer });
        }
        info!(version = peer, "peer version accepted");
        self.phase = Phase::Accepting;
        self.begin_exchange(Control::Etx.value(), now);
        Ok(())
    }

    /// Called when a confirmed message leaves its guard window
    fn exchange_complete(&mut self, message: u16, now: Instant) {
        match self.phase {
            Phase::Greeting => {
                debug!("SOH confirmed");
                self.phase = Phase::Announcing;
                self.begin_exchange(VERSION, now);
            }
            Phase::Announcing => {
                debug!("version confirmed, waiting for peer version");
                self.phase = Phase::AwaitingPeer;
                self.awaiting_since = Some(now);
                self.transition(Status::WaitingForSignal { since: now });
            }
            Phase::Accepting => {
                info!("SCOM handshake complete");
                self.phase = Phase::Established;
                self.notices.push_back(Notice::Established);
            }
            Phase::Established => self.notices.push_back(Notice::Sent(message)),
            Phase::Idle | Phase::AwaitingPeer => {}
        }
    }

    fn probe(&mut self, now: Instant) -> Result<()> {
        if self.abf_attempts >= self.config.max_abf_attempts {
            warn!(attempts = self.abf_attempts, "heartbeat attempts exhausted");
            return Err(self.fail(Error::ConnectionTimeout, false));
        }
        self.abf_attempts += 1;
        debug!(attempt = self.abf_attempts, "probing peer");
        let abf = self.next_signal(Control::Abf.value(), now);
        self.transition(Status::WaitingForAnt { since: now });
        self.write(abf);
        Ok(())
    }

    fn answer_heartbeat(&mut self, now: Instant) {
        // ABF inside the guard window: the peer missed our ACK, so the message goes again
        if let Status::InAckTimeoutBuffer { confirmed, .. } = self.status {
            self.last_sent = Some(confirmed);
        }
        let ant = self.next_signal(Control::Ant.value(), now);
        self.transition(Status::WaitingForMoreAnt { since: now });
        self.write(ant);
    }

    /// Leaves the heartbeat states once the peer is known to be alive
    fn settle(&mut self, now: Instant, resend: bool) {
        if let Some(pending) = self.last_sent {
            if resend {
                self.begin_exchange(pending.message(), now);
            } else {
                let expected = pending.checksum(self.encoding);
                self.transition(Status::WaitingForAsciiSum { expected, since: now });
            }
            return;
        }
        if self.last_received.is_some() {
            self.transition(Status::WaitingForRepMessage { since: now });
            return;
        }

        self.abf_attempts = 0;
        match (self.phase, self.awaiting_since) {
            (Phase::AwaitingPeer, Some(since)) => {
                self.transition(Status::WaitingForSignal { since })
            }
            _ => self.transition(Status::OkContinue),
        }
    }

    fn expire_partial(&mut self, now: Instant) {
        let Some(since) = self.partial_since else { return };
        if now.saturating_duration_since(since) < self.config.timeout {
            return;
        }
        let err = Error::MalformedFrame { len: self.buffer.len() };
        warn!(error = %err, "discarding stale partial frame");
        self.emit(LinkEvent::MalformedFrame { len: self.buffer.len() });
        self.buffer.clear();
        self.partial_since = None;
    }

    fn fail(&mut self, err: Error, send_eot: bool) -> Error {
        error!(error = %err, status = %self.kind(), "SCOM connection failed");
        self.shutdown(send_eot);
        err
    }

    /// Enters the terminal state and releases the channel, once
    fn shutdown(&mut self, send_eot: bool) {
        if self.is_closed() {
            return;
        }
        self.last_sent = None;
        self.last_received = None;
        self.awaiting_since = None;
        self.buffer.clear();
        self.partial_since = None;
        self.transition(Status::ConnectionClosed);
        if send_eot {
            let eot = self.next_signal(Control::Eot.value(), Instant::now());
            self.write(eot);
        }
        if let Err(e) = self.channel.close() {
            warn!(error = %e, "failed to close channel");
        }
        self.emit(LinkEvent::Closed);
    }

    fn timed_out(&mut self) {
        warn!(status = %self.kind(), "wait expired");
        self.emit(LinkEvent::TimedOut { status: self.kind() });
    }

    fn next_signal(&mut self, message: u16, now: Instant) -> Signal {
        let signal = Signal::at(message, self.next_sequence_id, now);
        self.next_sequence_id = self.next_sequence_id.wrapping_add(1);
        signal
    }

    fn transition(&mut self, status: Status) {
        let from = self.status.kind();
        self.status = status;
        let to = status.kind();
        if from != to {
            debug!(%from, %to, "status changed");
            self.emit(LinkEvent::StatusChanged { from, to });
        }
    }

    fn write(&mut self, signal: Signal) {
        debug!(message = signal.message(), sequence_id = signal.sequence_id(), status = %self.kind(), "frame sent");
        let mut frame = BytesMut::with_capacity(FRAME_LEN);
        let written = self
            .codec
            .encode(signal, &mut frame)
            .and_then(|()| self.channel.write(&frame));
        if let Err(e) = written {
            warn!(error = %e, %signal, "channel write failed");
        }
        self.emit(LinkEvent::FrameSent { signal });
    }

    fn emit(&self, event: LinkEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
