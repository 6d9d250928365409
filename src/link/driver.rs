use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::core::{Error, Result};
use crate::protocol::{Notice, ProtocolState, StatusKind};

/// Requests from a [`Connection`](super::Connection) to its driver
pub(crate) enum Request {
    Send {
        message: u16,
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

type Pending = (u16, oneshot::Sender<Result<()>>);

/// Owns the protocol engine and serializes everything that touches it
///
/// Channel data, application requests and the periodic tick are handled
/// one at a time from a single task.
pub(crate) struct Driver {
    state: ProtocolState,
    data_rx: mpsc::UnboundedReceiver<Bytes>,
    requests: mpsc::Receiver<Request>,
    inbox: mpsc::UnboundedSender<u16>,
    status_tx: watch::Sender<StatusKind>,
    setup: Option<oneshot::Sender<Result<()>>>,
    queue: VecDeque<Pending>,
    current: Option<Pending>,
    tick_interval: Duration,
}

enum Step {
    Continue(Result<()>),
    Close(oneshot::Sender<()>),
    Detached,
}

impl Driver {
    pub(crate) fn new(
        state: ProtocolState,
        data_rx: mpsc::UnboundedReceiver<Bytes>,
        requests: mpsc::Receiver<Request>,
        inbox: mpsc::UnboundedSender<u16>,
        status_tx: watch::Sender<StatusKind>,
        setup: oneshot::Sender<Result<()>>,
    ) -> Self {
        let tick_interval = state.config().tick_interval;
        Driver {
            state,
            data_rx,
            requests,
            inbox,
            status_tx,
            setup: Some(setup),
            queue: VecDeque::new(),
            current: None,
            tick_interval,
        }
    }

    /// Runs the handshake and then the link until it ends
    pub(crate) async fn run(mut self) {
        if let Err(e) = self.state.start(now()) {
            self.finish(e);
            return;
        }
        self.settle();

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                Some(bytes) = self.data_rx.recv() => {
                    Step::Continue(self.state.handle_data(&bytes, now()))
                }
                request = self.requests.recv() => match request {
                    Some(Request::Send { message, reply }) => {
                        self.queue.push_back((message, reply));
                        Step::Continue(Ok(()))
                    }
                    Some(Request::Close { reply }) => Step::Close(reply),
                    None => Step::Detached,
                },
                _ = ticker.tick() => {
                    Step::Continue(self.state.handle_tick(now()))
                }
            };

            match step {
                Step::Continue(Ok(())) => {
                    self.settle();
                    if self.state.is_closed() {
                        self.finish(Error::ConnectionClosed);
                        break;
                    }
                }
                Step::Continue(Err(e)) => {
                    self.settle();
                    self.finish(e);
                    break;
                }
                Step::Close(reply) => {
                    self.finish(Error::ConnectionClosed);
                    let _ = reply.send(());
                    break;
                }
                Step::Detached => {
                    debug!("connection handle dropped");
                    self.finish(Error::ConnectionClosed);
                    break;
                }
            }
        }
        debug!("link driver stopped");
    }

    /// Routes engine notices and starts the next queued send when the link is free
    fn settle(&mut self) {
        let notices: Vec<Notice> = self.state.drain_notices().collect();
        for notice in notices {
            match notice {
                Notice::Established => {
                    if let Some(setup) = self.setup.take() {
                        let _ = setup.send(Ok(()));
                    }
                }
                Notice::Sent(message) => match self.current.take() {
                    Some((pending, reply)) => {
                        if pending != message {
                            warn!(expected = pending, message, "confirmation for another message");
                        }
                        let _ = reply.send(Ok(()));
                    }
                    None => warn!(message, "confirmation without a pending send"),
                },
                Notice::Received(message) => {
                    if self.inbox.send(message).is_err() {
                        debug!(message, "inbox gone, message dropped");
                    }
                }
            }
        }

        while self.current.is_none() && self.state.is_ready() {
            let Some((message, reply)) = self.queue.pop_front() else {
                break;
            };
            if reply.is_closed() {
                continue;
            }
            match self.state.send(message, now()) {
                Ok(()) => self.current = Some((message, reply)),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            }
        }

        self.status_tx.send_replace(self.state.kind());
    }

    /// Closes the engine and answers everyone still waiting
    ///
    /// `err` goes to whoever the failure belongs to: the open call while the
    /// handshake runs, the message in flight otherwise. Everything else
    /// gets `ConnectionClosed`.
    fn finish(&mut self, err: Error) {
        self.state.close();
        self.status_tx.send_replace(StatusKind::ConnectionClosed);
        info!(error = %err, "link finished");

        let mut err = Some(err);
        if let Some(setup) = self.setup.take() {
            let _ = setup.send(Err(err.take().unwrap_or(Error::ConnectionClosed)));
        }
        if let Some((_, reply)) = self.current.take() {
            let _ = reply.send(Err(err.take().unwrap_or(Error::ConnectionClosed)));
        }
        for (_, reply) in self.queue.drain(..) {
            let _ = reply.send(Err(Error::ConnectionClosed));
        }
        self.requests.close();
    }
}

/// Engine time, taken from tokio so a paused test clock drives it too
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}
