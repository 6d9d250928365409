use bytes::Bytes;
use tokio::sync::mpsc;

use crate::core::Result;

/// Byte transport underneath an SCOM connection
///
/// Implementations move raw bytes and never interpret them. Arrived bytes are
/// pushed into the [`DataSink`] handed over by `open`, in any chunking.
pub trait Channel: Send {
    /// Opens the transport and starts delivering received bytes to `sink`
    fn open(&mut self, sink: DataSink) -> Result<()>;

    /// Writes bytes in order; no confirmation is awaited
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Stops delivery and releases the transport
    fn close(&mut self) -> Result<()>;
}

impl<C: Channel + ?Sized> Channel for Box<C> {
    fn open(&mut self, sink: DataSink) -> Result<()> {
        (**self).open(sink)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).write(bytes)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Receiving end of the "data arrived" notification
#[derive(Debug, Clone)]
pub struct DataSink {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl DataSink {
    /// Creates a sink and the receiver its data flows into
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (DataSink { tx }, rx)
    }

    /// Delivers newly arrived bytes
    ///
    /// Returns `false` once the connection has gone away, after which the
    /// caller should stop reading.
    pub fn on_data(&self, bytes: &[u8]) -> bool {
        if bytes.is_empty() {
            return !self.tx.is_closed();
        }
        self.tx.send(Bytes::copy_from_slice(bytes)).is_ok()
    }

    /// Whether the connection stopped listening
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
