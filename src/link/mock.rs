//! In-memory channels for tests

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::core::{Result, TextEncoding, VERSION};
use crate::protocol::{checksum, decode, encode, Control, Signal};
use super::channel::{Channel, DataSink};

#[derive(Default)]
struct WireLog {
    written: Vec<Signal>,
    opens: usize,
    closes: usize,
    sink: Option<DataSink>,
}

/// Shared view of everything written to a test channel
#[derive(Clone, Default)]
pub(crate) struct Wire {
    log: Arc<Mutex<WireLog>>,
}

impl Wire {
    fn lock(&self) -> MutexGuard<'_, WireLog> {
        self.log.lock().unwrap()
    }

    pub(crate) fn sent(&self) -> Vec<Signal> {
        self.lock().written.clone()
    }

    pub(crate) fn sent_messages(&self) -> Vec<u16> {
        self.lock().written.iter().map(Signal::message).collect()
    }

    pub(crate) fn last_message(&self) -> Option<u16> {
        self.lock().written.last().map(Signal::message)
    }

    pub(crate) fn count(&self, message: u16) -> usize {
        self.lock().written.iter().filter(|s| s.message() == message).count()
    }

    pub(crate) fn clear(&self) {
        self.lock().written.clear();
    }

    pub(crate) fn opens(&self) -> usize {
        self.lock().opens
    }

    pub(crate) fn closes(&self) -> usize {
        self.lock().closes
    }

    fn record(&self, bytes: &[u8]) -> Vec<Signal> {
        let signals: Vec<Signal> = bytes.chunks(4).filter_map(|c| decode(c).ok()).collect();
        self.lock().written.extend(signals.iter().copied());
        signals
    }
}

/// Channel that only records what the engine writes
pub(crate) struct RecordingChannel {
    wire: Wire,
}

impl RecordingChannel {
    pub(crate) fn new() -> (Self, Wire) {
        let wire = Wire::default();
        (RecordingChannel { wire: wire.clone() }, wire)
    }
}

impl Channel for RecordingChannel {
    fn open(&mut self, sink: DataSink) -> Result<()> {
        let mut log = self.wire.lock();
        log.opens += 1;
        log.sink = Some(sink);
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.wire.record(bytes);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut log = self.wire.lock();
        log.closes += 1;
        log.sink = None;
        Ok(())
    }
}

/// How a simulated device answers
#[derive(Debug, Clone)]
pub(crate) struct PeerScript {
    /// Version announced after the master's version is confirmed
    pub version: u16,
    /// Wrong checksum echoes sent before the right one, per message, after the handshake
    pub wrong_echoes: usize,
    /// Stop answering entirely once the handshake is done
    pub mute_after_handshake: bool,
    /// Copies of ANT sent for every ABF
    pub ant_copies: usize,
    /// Pause before announcing the version, to clear the master's guard window
    pub version_delay: Duration,
    pub encoding: TextEncoding,
}

impl Default for PeerScript {
    fn default() -> Self {
        PeerScript {
            version: VERSION,
            wrong_echoes: 0,
            mute_after_handshake: false,
            ant_copies: 1,
            version_delay: Duration::from_millis(600),
            encoding: TextEncoding::Ascii,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    Idle,
    /// Echoed the checksum of a master message, waiting for ACK
    AwaitAck(u16),
    /// Sent an own message, waiting for its checksum
    AwaitChecksum(u16),
}

struct PeerInner {
    script: PeerScript,
    state: PeerState,
    established: bool,
    wrong_left: usize,
    delivered: Vec<u16>,
    next_id: u16,
    sink: Option<DataSink>,
}

impl PeerInner {
    fn reply(&mut self, message: u16) {
        let signal = Signal::new(message, self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        if let Some(sink) = &self.sink {
            sink.on_data(&encode(&signal));
        }
    }

    fn handle(&mut self, signal: Signal) {
        if self.established && self.script.mute_after_handshake {
            return;
        }
        match signal.control() {
            Some(Control::Abf) => {
                for _ in 0..self.script.ant_copies {
                    self.reply(Control::Ant.value());
                }
            }
            Some(Control::Ack) => {
                if let PeerState::AwaitAck(message) = self.state {
                    self.state = PeerState::Idle;
                    self.wrong_left = self.script.wrong_echoes;
                    self.confirmed(message);
                }
            }
            Some(Control::Eot) | Some(Control::Ant) => {}
            _ => self.message(signal.message()),
        }
    }

    fn message(&mut self, message: u16) {
        if let PeerState::AwaitChecksum(expected) = self.state {
            if message == expected {
                self.state = PeerState::Idle;
                self.reply(Control::Ack.value());
            }
            return;
        }
        let sum = checksum(message, self.script.encoding);
        self.state = PeerState::AwaitAck(message);
        if self.established && self.wrong_left > 0 {
            self.wrong_left -= 1;
            self.reply(sum.wrapping_add(1));
        } else {
            self.reply(sum);
        }
    }

    fn confirmed(&mut self, message: u16) {
        if message == Control::Etx.value() && !self.established {
            self.established = true;
            self.wrong_left = self.script.wrong_echoes;
            return;
        }
        if message == VERSION && !self.established {
            self.announce_version();
            return;
        }
        if self.established {
            self.delivered.push(message);
        }
    }

    fn announce_version(&mut self) {
        let version = self.script.version;
        self.state = PeerState::AwaitChecksum(checksum(version, self.script.encoding));
        let frame = encode(&Signal::new(version, self.next_id));
        self.next_id = self.next_id.wrapping_add(1);
        let Some(sink) = self.sink.clone() else { return };
        let delay = self.script.version_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            sink.on_data(&frame);
        });
    }
}

/// Test-side handle on a simulated device
#[derive(Clone)]
pub(crate) struct PeerHandle {
    inner: Arc<Mutex<PeerInner>>,
    pub(crate) wire: Wire,
}

impl PeerHandle {
    /// Sends an unsolicited message from the device
    pub(crate) fn send(&self, message: u16) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = PeerState::AwaitChecksum(checksum(message, inner.script.encoding));
        inner.reply(message);
    }

    /// Messages the device has seen confirmed
    pub(crate) fn delivered(&self) -> Vec<u16> {
        self.inner.lock().unwrap().delivered.clone()
    }

    pub(crate) fn is_established(&self) -> bool {
        self.inner.lock().unwrap().established
    }
}

/// Channel wired to a simulated device running the firmware side of SCOM
pub(crate) struct PeerChannel {
    inner: Arc<Mutex<PeerInner>>,
    wire: Wire,
}

impl PeerChannel {
    pub(crate) fn new(script: PeerScript) -> (Self, PeerHandle) {
        let inner = Arc::new(Mutex::new(PeerInner {
            wrong_left: script.wrong_echoes,
            script,
            state: PeerState::Idle,
            established: false,
            delivered: Vec::new(),
            next_id: 0,
            sink: None,
        }));
        let wire = Wire::default();
        let handle = PeerHandle {
            inner: inner.clone(),
            wire: wire.clone(),
        };
        (PeerChannel { inner, wire }, handle)
    }
}

impl Channel for PeerChannel {
    fn open(&mut self, sink: DataSink) -> Result<()> {
        self.wire.lock().opens += 1;
        self.inner.lock().unwrap().sink = Some(sink);
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let signals = self.wire.record(bytes);
        let mut inner = self.inner.lock().unwrap();
        for signal in signals {
            inner.handle(signal);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.wire.lock().closes += 1;
        self.inner.lock().unwrap().sink = None;
        Ok(())
    }
}
