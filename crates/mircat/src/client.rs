// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outbound client engine.
//!
//! Every connection is dialed once by [`OutboundEngine::open`] and keeps its
//! index for the life of the registry. A connection that fails while open is
//! redialed forever at a fixed interval, reusing the same index, address and
//! send queue. Only [`OutboundEngine::close`] and [`OutboundEngine::close_all`]
//! end it.

use crate::link::{LinkReader, PeerLink, ReadOutcome};
use crate::notify::{Event, Identity, Notifier, Reporter, Scope};
use crate::reconnect::{redial, ReconnectPolicy};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Idle wake-up of the write task between two sends.
const KEEPALIVE_TICK: Duration = Duration::from_secs(1);

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid client index {0}")]
    InvalidIndex(usize),

    #[error("connection {0} is closed")]
    ConnectionClosed(usize),
}

impl ClientError {
    /// Whether the engine already emitted a notification for this error.
    pub fn is_notified(&self) -> bool {
        matches!(self, Self::Dial { .. } | Self::ConnectionClosed(_))
    }
}

/// Payload waiting for the write task.
struct Outgoing {
    payload: Vec<u8>,
    dequeued: oneshot::Sender<()>,
}

/// One outbound connection.
struct OutboundConnection {
    index: usize,
    address: String,
    queue_tx: mpsc::Sender<Outgoing>,
    queue_rx: Mutex<mpsc::Receiver<Outgoing>>,
    closed: watch::Sender<bool>,
    /// Socket currently in use. Replaced on reconnect.
    session: Mutex<Option<Arc<PeerLink>>>,
    reporter: Reporter,
    policy: ReconnectPolicy,
}

impl OutboundConnection {
    fn new(index: usize, address: String, reporter: Reporter, policy: ReconnectPolicy) -> Self {
        // One slot: the write task takes each payload as soon as it arrives,
        // the sender then waits for that hand-off to be acknowledged.
        let (queue_tx, queue_rx) = mpsc::channel(1);
        let (closed, _) = watch::channel(false);
        Self {
            index,
            address,
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
            closed,
            session: Mutex::new(None),
            reporter,
            policy,
        }
    }

    /// Whether the connection was explicitly closed.
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn identity(&self) -> Identity {
        Identity::Index(self.index)
    }

    /// Install a freshly dialed socket and start its read and write tasks.
    ///
    /// `announce` is emitted before the tasks start so it precedes any data
    /// from the new socket. Returns `false` if the connection was closed in
    /// the meantime, in which case the socket is dropped.
    async fn start_session(self: &Arc<Self>, stream: TcpStream, announce: Event) -> bool {
        let (link, reader) = PeerLink::new(stream, self.address.clone());
        {
            let mut session = self.session.lock().await;
            if self.is_closed() {
                link.close().await;
                return false;
            }
            *session = Some(link.clone());
        }

        self.reporter.emit(self.identity(), announce);
        tokio::spawn(self.clone().read_loop(link.clone(), reader));
        tokio::spawn(self.clone().write_loop(link));
        true
    }

    async fn read_loop(self: Arc<Self>, link: Arc<PeerLink>, mut reader: LinkReader) {
        loop {
            match reader.read().await {
                ReadOutcome::Data(bytes) => {
                    debug!("Client #{} received {} bytes", self.index, bytes.len());
                    self.reporter.emit(self.identity(), Event::Data(bytes));
                }
                ReadOutcome::Closed => return,
                ReadOutcome::Eof => {
                    self.session_failed(&link, "connection closed: EOF".into())
                        .await;
                    return;
                }
                ReadOutcome::Failed(e) => {
                    self.session_failed(&link, format!("connection closed: {}", e))
                        .await;
                    return;
                }
            }
        }
    }

    async fn write_loop(self: Arc<Self>, link: Arc<PeerLink>) {
        let mut queue = self.queue_rx.lock().await;
        let mut tick = tokio::time::interval(KEEPALIVE_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = link.closed() => return,
                item = queue.recv() => {
                    let Some(Outgoing { payload, dequeued }) = item else {
                        return;
                    };
                    let _ = dequeued.send(());
                    if let Err(e) = link.write(&payload).await {
                        self.session_failed(&link, format!("write failed: {}", e)).await;
                        return;
                    }
                }
                _ = tick.tick() => {}
            }
        }
    }

    /// Tear down a failed socket and start reconnecting.
    ///
    /// The read and write tasks may both observe the same failure; only the
    /// one that closes the link reports it and spawns the reconnect.
    async fn session_failed(self: &Arc<Self>, link: &Arc<PeerLink>, reason: String) {
        if !link.close().await || self.is_closed() {
            return;
        }
        warn!("Client #{} to {} lost: {}", self.index, self.address, reason);
        self.reporter.emit(self.identity(), Event::Error(reason));
        tokio::spawn(self.clone().reconnect());
    }

    // Boxed: the session tasks and the reconnect task spawn each other.
    fn reconnect(self: Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let mut closed = self.closed.subscribe();
            let cancelled = async move {
                let _ = closed.wait_for(|c| *c).await;
            };

            let identity = self.identity();
            let reporter = self.reporter.clone();
            let index = self.index;
            let stream = redial(&self.address, self.policy, cancelled, |attempt, err| {
                debug!("Client #{} reconnect attempt {} failed: {}", index, attempt, err);
                reporter.emit(identity.clone(), Event::Reconnecting { attempt });
            })
            .await;

            if let Some(stream) = stream {
                if self.start_session(stream, Event::Reconnected).await {
                    info!("Client #{} reconnected to {}", self.index, self.address);
                }
            }
        })
    }

    async fn send(&self, payload: Vec<u8>) -> Result<(), ClientError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(self.closed_error());
        }

        let (dequeued, ack) = oneshot::channel();
        let handoff = async {
            self.queue_tx
                .send(Outgoing { payload, dequeued })
                .await
                .map_err(|_| ())?;
            ack.await.map_err(|_| ())
        };

        // Waiting on the closed flag alongside the hand-off means a send that
        // overlaps a close always ends as ConnectionClosed.
        let delivered = tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => false,
            result = handoff => result.is_ok(),
        };

        if delivered {
            Ok(())
        } else {
            Err(self.closed_error())
        }
    }

    fn closed_error(&self) -> ClientError {
        self.reporter
            .emit(self.identity(), Event::Error("connection closed".into()));
        ClientError::ConnectionClosed(self.index)
    }

    /// Close the connection. Returns `false` if it was already closed.
    async fn shutdown(&self) -> bool {
        if self.closed.send_replace(true) {
            return false;
        }
        if let Some(link) = self.session.lock().await.take() {
            link.close().await;
        }
        info!("Client #{} to {} closed", self.index, self.address);
        self.reporter
            .emit(self.identity(), Event::Closed("connection closed".into()));
        true
    }
}

/// Manages outbound client connections.
#[derive(Clone)]
pub struct OutboundEngine {
    reporter: Reporter,
    policy: ReconnectPolicy,
    connections: Arc<RwLock<Vec<Arc<OutboundConnection>>>>,
}

impl OutboundEngine {
    /// Create an engine with the default reconnect policy.
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self::with_policy(notifier, ReconnectPolicy::default())
    }

    /// Create an engine with a custom reconnect policy.
    pub fn with_policy(notifier: Arc<dyn Notifier>, policy: ReconnectPolicy) -> Self {
        Self {
            reporter: Reporter::new(Scope::Client, notifier),
            policy,
            connections: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Dial `address` once and register the connection.
    ///
    /// A failed dial is reported and returned; it is not retried.
    pub async fn open(&self, address: &str) -> Result<usize, ClientError> {
        let stream = match TcpStream::connect(address).await {
            Ok(stream) => stream,
            Err(source) => {
                warn!("Failed to connect to {}: {}", address, source);
                self.reporter.emit(
                    Identity::Engine,
                    Event::Error(format!("failed to connect to {}: {}", address, source)),
                );
                return Err(ClientError::Dial {
                    address: address.to_string(),
                    source,
                });
            }
        };

        let conn = {
            let mut connections = self.connections.write().await;
            let conn = Arc::new(OutboundConnection::new(
                connections.len(),
                address.to_string(),
                self.reporter.clone(),
                self.policy,
            ));
            connections.push(conn.clone());
            conn
        };

        info!("Client #{} connected to {}", conn.index, address);
        conn.start_session(stream, Event::Opened("connection opened".into()))
            .await;
        Ok(conn.index)
    }

    /// Hand `payload` to connection `index`.
    ///
    /// Returns once the write task has taken the payload. While a reconnect is
    /// in progress this waits for the new socket.
    pub async fn send(&self, index: usize, payload: Vec<u8>) -> Result<(), ClientError> {
        self.connection(index).await?.send(payload).await
    }

    /// Close connection `index`. Closing twice is a no-op.
    pub async fn close(&self, index: usize) -> Result<(), ClientError> {
        self.connection(index).await?.shutdown().await;
        Ok(())
    }

    /// Close every connection and reset numbering to zero.
    ///
    /// Returns how many connections were still open.
    pub async fn close_all(&self) -> usize {
        let mut connections = self.connections.write().await;
        let mut closed = 0;
        for conn in connections.iter() {
            if conn.shutdown().await {
                closed += 1;
            }
        }
        connections.clear();
        closed
    }

    /// Number of slots, closed ones included.
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// True when no connection was opened since the last reset.
    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Whether connection `index` exists and is still open.
    pub async fn is_open(&self, index: usize) -> bool {
        self.connections
            .read()
            .await
            .get(index)
            .is_some_and(|conn| !conn.is_closed())
    }

    async fn connection(&self, index: usize) -> Result<Arc<OutboundConnection>, ClientError> {
        self.connections
            .read()
            .await
            .get(index)
            .cloned()
            .ok_or(ClientError::InvalidIndex(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{ChannelNotifier, Notification};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn engine() -> (OutboundEngine, mpsc::UnboundedReceiver<Notification>) {
        let (notifier, rx) = ChannelNotifier::new();
        let engine = OutboundEngine::with_policy(
            Arc::new(notifier),
            ReconnectPolicy::fixed(Duration::from_millis(20)),
        );
        (engine, rx)
    }

    #[test]
    fn test_client_error_display() {
        assert_eq!(
            ClientError::InvalidIndex(4).to_string(),
            "invalid client index 4"
        );
        assert_eq!(
            ClientError::ConnectionClosed(1).to_string(),
            "connection 1 is closed"
        );
    }

    #[tokio::test]
    async fn test_open_failure_is_not_registered() {
        let (engine, mut rx) = engine();
        let vacant = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = vacant.local_addr().unwrap().to_string();
        drop(vacant);

        let result = engine.open(&addr).await;
        assert!(matches!(result, Err(ClientError::Dial { .. })));
        assert!(engine.is_empty().await);

        let n = rx.recv().await.unwrap();
        assert_eq!(n.identity, Identity::Engine);
        assert!(matches!(n.event, Event::Error(_)));
    }

    #[tokio::test]
    async fn test_invalid_index() {
        let (engine, mut rx) = engine();
        let err = engine.send(3, b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidIndex(3)));
        assert!(!err.is_notified());
        assert!(matches!(
            engine.close(0).await,
            Err(ClientError::InvalidIndex(0))
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_after_close_is_reported() {
        let (engine, mut rx) = engine();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let index = engine.open(&addr).await.unwrap();
        let (_peer, _) = listener.accept().await.unwrap();
        engine.close(index).await.unwrap();
        assert!(!engine.is_open(index).await);

        assert!(matches!(
            engine.send(index, b"late".to_vec()).await,
            Err(ClientError::ConnectionClosed(0))
        ));

        let mut events = Vec::new();
        while let Ok(n) = rx.try_recv() {
            events.push(n.event);
        }
        assert_eq!(events[0], Event::Opened("connection opened".into()));
        assert_eq!(events[1], Event::Closed("connection closed".into()));
        assert_eq!(events[2], Event::Error("connection closed".into()));
    }

    #[tokio::test]
    async fn test_send_reaches_peer() {
        let (engine, _rx) = engine();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let index = engine.open(&addr).await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        engine.send(index, b"ping".to_vec()).await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
