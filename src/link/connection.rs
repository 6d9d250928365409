use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::core::{Config, Error, Result};
use crate::protocol::{Control, LinkEvent, ProtocolState, StatusKind};
use super::channel::{Channel, DataSink};
use super::driver::{Driver, Request};
use super::serial::SerialChannel;

const REQUEST_QUEUE: usize = 32;
const EVENT_CAPACITY: usize = 1024;

/// Master side of an SCOM link
///
/// `open` runs the handshake; afterwards messages are exchanged with `send`
/// and `receive`. The link is driven by a background task that ends when the
/// connection closes, fails, or this handle is dropped.
pub struct Connection {
    config: Config,
    channel: Option<Box<dyn Channel>>,
    requests: Option<mpsc::Sender<Request>>,
    inbox: Option<mpsc::UnboundedReceiver<u16>>,
    status: watch::Receiver<StatusKind>,
    status_tx: Option<watch::Sender<StatusKind>>,
    events: broadcast::Sender<LinkEvent>,
    task: Option<JoinHandle<()>>,
}

impl Connection {
    /// Creates a connection over any channel; nothing is opened yet
    pub fn new(channel: impl Channel + 'static, config: Config) -> Self {
        let (status_tx, status) = watch::channel(StatusKind::OkContinue);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Connection {
            config,
            channel: Some(Box::new(channel)),
            requests: None,
            inbox: None,
            status,
            status_tx: Some(status_tx),
            events,
            task: None,
        }
    }

    /// Creates a connection over the serial port named in `config`
    pub fn serial(config: Config) -> Result<Self> {
        let channel = SerialChannel::from_config(&config)?;
        Ok(Self::new(channel, config))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Opens the channel and runs the handshake
    ///
    /// Resolves once the link is established. On failure the connection is
    /// closed and cannot be reopened.
    pub async fn open(&mut self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        self.config.validate()?;
        let status_tx = self
            .status_tx
            .take()
            .ok_or_else(|| Error::invalid_state("connection already opened"))?;
        let mut channel = self
            .channel
            .take()
            .ok_or_else(|| Error::invalid_state("connection already opened"))?;

        let (sink, data_rx) = DataSink::channel();
        if let Err(e) = channel.open(sink) {
            status_tx.send_replace(StatusKind::ConnectionClosed);
            return Err(e);
        }
        info!(encoding = %self.config.encoding, "channel opened");

        let (requests, request_rx) = mpsc::channel(REQUEST_QUEUE);
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (setup_tx, setup_rx) = oneshot::channel();

        let state = ProtocolState::new(
            channel,
            self.config.protocol.clone(),
            self.config.encoding,
            self.events.clone(),
        );
        let driver = Driver::new(state, data_rx, request_rx, inbox_tx, status_tx, setup_tx);
        self.task = Some(tokio::spawn(driver.run()));
        self.requests = Some(requests);
        self.inbox = Some(inbox);

        setup_rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Sends one application message and waits for its confirmation
    ///
    /// Sends are queued and go out one at a time in call order.
    pub async fn send(&self, message: u16) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        if Control::is_reserved(message) {
            return Err(Error::ReservedMessage(message));
        }
        let requests = self
            .requests
            .as_ref()
            .ok_or_else(|| Error::invalid_state("connection not opened"))?;

        let (reply, rx) = oneshot::channel();
        requests
            .send(Request::Send { message, reply })
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Next confirmed inbound message, if one is waiting
    pub fn try_receive(&mut self) -> Option<u16> {
        self.inbox.as_mut()?.try_recv().ok()
    }

    /// Waits for the next confirmed inbound message
    ///
    /// Returns `None` once the link is gone and every delivered message was read.
    pub async fn receive(&mut self) -> Option<u16> {
        self.inbox.as_mut()?.recv().await
    }

    /// Sends EOT and releases the channel; closing twice is a no-op
    pub async fn close(&mut self) -> Result<()> {
        if let Some(requests) = self.requests.take() {
            let (reply, rx) = oneshot::channel();
            if requests.send(Request::Close { reply }).await.is_ok() {
                let _ = rx.await;
            }
        }
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| Error::invalid_state(format!("link task failed: {}", e)))?;
        }
        if let Some(status_tx) = self.status_tx.take() {
            // Never opened, so there is no channel to release
            self.channel = None;
            status_tx.send_replace(StatusKind::ConnectionClosed);
        }
        debug!("connection closed");
        Ok(())
    }

    /// Current protocol status
    pub fn status(&self) -> StatusKind {
        *self.status.borrow()
    }

    /// Receiver that sees every status change
    pub fn watch_status(&self) -> watch::Receiver<StatusKind> {
        self.status.clone()
    }

    /// Subscribes to link activity from now on
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.status() == StatusKind::ConnectionClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    use crate::core::{TextEncoding, VERSION};
    use crate::link::mock::{PeerChannel, PeerHandle, PeerScript};
    use crate::protocol::checksum;

    async fn connected(script: PeerScript) -> (Connection, PeerHandle) {
        let (channel, peer) = PeerChannel::new(script);
        let mut conn = Connection::new(channel, Config::default());
        assert_ok!(conn.open().await);
        (conn, peer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_runs_handshake() {
        let (conn, peer) = connected(PeerScript::default()).await;

        assert!(peer.is_established());
        assert_eq!(conn.status(), StatusKind::OkContinue);
        assert_eq!(peer.wire.opens(), 1);
        assert_eq!(
            peer.wire.sent_messages(),
            vec![
                Control::Soh.value(),
                Control::Ack.value(),
                VERSION,
                Control::Ack.value(),
                checksum(VERSION, TextEncoding::Ascii),
                Control::Etx.value(),
                Control::Ack.value(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_other_version() {
        let (channel, peer) = PeerChannel::new(PeerScript {
            version: 1205,
            ..PeerScript::default()
        });
        let mut conn = Connection::new(channel, Config::default());

        let err = conn.open().await.unwrap_err();
        assert!(matches!(
            err,
            Error::IncompatibleProtocolVersion { local: VERSION, peer: 1205 }
        ));
        assert!(conn.is_closed());
        assert_eq!(peer.wire.closes(), 1);
        assert_eq!(peer.wire.count(Control::Eot.value()), 1);

        assert!(matches!(conn.send(4242).await, Err(Error::ConnectionClosed)));
        // Closed wins over the reserved-value check
        assert!(matches!(conn.send(5).await, Err(Error::ConnectionClosed)));
        assert!(matches!(conn.open().await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_is_confirmed() {
        let (conn, peer) = connected(PeerScript::default()).await;

        assert_ok!(conn.send(4242).await);
        assert_ok!(conn.send(17).await);
        assert_eq!(peer.delivered(), vec![4242, 17]);
        assert_eq!(conn.status(), StatusKind::OkContinue);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_sends_keep_order() {
        let (conn, peer) = connected(PeerScript::default()).await;

        let (a, b, c) = tokio::join!(conn.send(10), conn.send(20), conn.send(30));
        assert_ok!(a);
        assert_ok!(b);
        assert_ok!(c);
        assert_eq!(peer.delivered(), vec![10, 20, 30]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_echo_retransmits_once() {
        let (conn, peer) = connected(PeerScript {
            wrong_echoes: 1,
            ..PeerScript::default()
        })
        .await;

        assert_ok!(conn.send(4242).await);
        assert_eq!(peer.wire.count(4242), 2);
        assert_eq!(peer.delivered(), vec![4242]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let (conn, peer) = connected(PeerScript {
            mute_after_handshake: true,
            ..PeerScript::default()
        })
        .await;

        let err = assert_err!(conn.send(500).await);
        assert!(matches!(err, Error::ConnectionTimeout));
        assert_eq!(peer.wire.count(Control::Abf.value()), 10);
        assert_eq!(peer.wire.closes(), 1);
        assert!(conn.is_closed());

        let frames = peer.wire.sent().len();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(peer.wire.sent().len(), frames);
        assert!(matches!(conn.send(501).await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_message_received() {
        let (mut conn, peer) = connected(PeerScript::default()).await;
        assert_eq!(conn.try_receive(), None);

        peer.send(900);
        assert_eq!(conn.receive().await, Some(900));
        assert_eq!(conn.try_receive(), None);
        assert_eq!(peer.wire.last_message(), Some(checksum(900, TextEncoding::Ascii)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_sends_eot_once() {
        let (mut conn, peer) = connected(PeerScript::default()).await;

        assert_ok!(conn.close().await);
        assert_ok!(conn.close().await);
        assert_eq!(peer.wire.count(Control::Eot.value()), 1);
        assert_eq!(peer.wire.closes(), 1);
        assert!(matches!(conn.send(4242).await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_connection_closes_link() {
        let (conn, peer) = connected(PeerScript::default()).await;
        drop(conn);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(peer.wire.last_message(), Some(Control::Eot.value()));
        assert_eq!(peer.wire.closes(), 1);
    }

    #[tokio::test]
    async fn test_send_before_open() {
        let (channel, peer) = PeerChannel::new(PeerScript::default());
        let mut conn = Connection::new(channel, Config::default());

        assert!(matches!(conn.send(4242).await, Err(Error::InvalidState(_))));
        assert!(matches!(conn.send(5).await, Err(Error::ReservedMessage(5))));
        assert_eq!(peer.wire.opens(), 0);

        assert_ok!(conn.close().await);
        assert!(conn.is_closed());
        assert!(matches!(conn.open().await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserved_message_rejected_without_io() {
        let (conn, peer) = connected(PeerScript::default()).await;
        let frames = peer.wire.sent().len();

        for message in 1..=7 {
            assert!(matches!(conn.send(message).await, Err(Error::ReservedMessage(m)) if m == message));
        }
        assert_eq!(peer.wire.sent().len(), frames);
        assert_ok!(conn.send(0).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_and_events_observable() {
        let (channel, _peer) = PeerChannel::new(PeerScript::default());
        let mut conn = Connection::new(channel, Config::default());
        let mut events = conn.subscribe();
        let status = conn.watch_status();

        assert_ok!(conn.open().await);
        assert_eq!(*status.borrow(), StatusKind::OkContinue);

        let mut sent = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let LinkEvent::FrameSent { signal } = event {
                sent.push(signal.message());
            }
        }
        assert_eq!(sent.first(), Some(&Control::Soh.value()));
        assert_eq!(sent.last(), Some(&Control::Ack.value()));
    }

    #[test]
    fn test_serial_requires_port() {
        assert!(matches!(Connection::serial(Config::default()), Err(Error::Config(_))));
    }
}
