// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Inbound multi-peer server engine.
//!
//! One accept task, one read task per peer and one event task. The event
//! task owns the [`RegistryWriter`] and is the only place peers are added,
//! removed or cleared. Point sends look peers up through the read side and
//! write directly, broadcasts go through the event task.

use crate::link::{is_disconnect, LinkReader, PeerLink, ReadOutcome};
use crate::notify::{Event, Identity, Notifier, Reporter, Scope};
use crate::registry::{registry, RegistryView, RegistryWriter};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Depth of the event task's queue.
const EVENT_QUEUE_DEPTH: usize = 64;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to listen on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("server already running")]
    AlreadyRunning,

    #[error("server not started")]
    NotRunning,

    #[error("client {0} not found")]
    PeerNotFound(String),

    #[error("error writing to client {peer}: {source}")]
    Write {
        peer: String,
        #[source]
        source: io::Error,
    },
}

impl ServerError {
    /// Whether the engine already emitted a notification for this error.
    pub fn is_notified(&self) -> bool {
        matches!(self, Self::PeerNotFound(_))
    }
}

/// Messages handled by the event task.
enum ServerEvent {
    Stop,
    Register(TcpStream, SocketAddr),
    Deregister(Arc<PeerLink>),
    Broadcast {
        payload: Vec<u8>,
        reply: oneshot::Sender<usize>,
    },
}

struct Running {
    local_addr: SocketAddr,
    events: mpsc::Sender<ServerEvent>,
    peers: RegistryView<Arc<PeerLink>>,
    accept_task: JoinHandle<()>,
    event_task: JoinHandle<()>,
}

/// Accepts and tracks inbound peers.
#[derive(Clone)]
pub struct InboundEngine {
    reporter: Reporter,
    running: Arc<Mutex<Option<Running>>>,
}

impl InboundEngine {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            reporter: Reporter::new(Scope::Server, notifier),
            running: Arc::new(Mutex::new(None)),
        }
    }

    /// Bind `address` and start accepting peers.
    ///
    /// Returns the bound address (useful with port 0).
    pub async fn start(&self, address: &str) -> Result<SocketAddr, ServerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| ServerError::Bind {
                address: address.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            address: address.to_string(),
            source,
        })?;
        info!("Server listening on {}", local_addr);

        let (writer, peers) = registry();
        let (events, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

        let event_task = tokio::spawn(event_loop(
            writer,
            events_rx,
            events.downgrade(),
            self.reporter.clone(),
        ));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            events.clone(),
            self.reporter.clone(),
        ));

        *running = Some(Running {
            local_addr,
            events,
            peers,
            accept_task,
            event_task,
        });
        Ok(local_addr)
    }

    /// Close every peer and the listener.
    ///
    /// Returns `false` when the server was not running.
    pub async fn stop(&self) -> bool {
        let Some(running) = self.running.lock().await.take() else {
            return false;
        };

        // The listener is dropped only once the accept task has finished.
        running.accept_task.abort();
        let _ = running.accept_task.await;

        let _ = running.events.send(ServerEvent::Stop).await;
        drop(running.events);
        let _ = running.event_task.await;
        info!("Server on {} stopped", running.local_addr);
        true
    }

    /// Write `payload` to one peer.
    pub async fn send_to(&self, key: &str, payload: &[u8]) -> Result<(), ServerError> {
        let peers = self.peers().await?;
        let Some(link) = peers.get(key).await else {
            self.reporter.emit(
                Identity::Peer(key.to_string()),
                Event::Error(format!("client {} not found", key)),
            );
            return Err(ServerError::PeerNotFound(key.to_string()));
        };

        link.write(payload)
            .await
            .map_err(|source| ServerError::Write {
                peer: key.to_string(),
                source,
            })
    }

    /// Write `payload` to every connected peer.
    ///
    /// Failures on individual peers are reported and skipped. Returns the
    /// number of peers written to.
    pub async fn broadcast(&self, payload: Vec<u8>) -> Result<usize, ServerError> {
        let events = {
            let running = self.running.lock().await;
            running
                .as_ref()
                .map(|r| r.events.clone())
                .ok_or(ServerError::NotRunning)?
        };

        let (reply, delivered) = oneshot::channel();
        events
            .send(ServerEvent::Broadcast { payload, reply })
            .await
            .map_err(|_| ServerError::NotRunning)?;
        delivered.await.map_err(|_| ServerError::NotRunning)
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Address the listener is bound to.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Keys of the connected peers, sorted.
    pub async fn peer_keys(&self) -> Vec<String> {
        match self.peers().await {
            Ok(peers) => peers.keys().await,
            Err(_) => Vec::new(),
        }
    }

    pub async fn peer_count(&self) -> usize {
        match self.peers().await {
            Ok(peers) => peers.len().await,
            Err(_) => 0,
        }
    }

    async fn peers(&self) -> Result<RegistryView<Arc<PeerLink>>, ServerError> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| r.peers.clone())
            .ok_or(ServerError::NotRunning)
    }
}

async fn accept_loop(listener: TcpListener, events: mpsc::Sender<ServerEvent>, reporter: Reporter) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                info!("New client connected: {}", peer_addr);
                reporter.emit(
                    Identity::Peer(peer_addr.to_string()),
                    Event::Opened(format!("client connected: {}", peer_addr)),
                );
                if events
                    .send(ServerEvent::Register(stream, peer_addr))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                error!("Accept error: {}", e);
                reporter.emit(
                    Identity::Engine,
                    Event::Error(format!("error accepting connection: {}", e)),
                );
                return;
            }
        }
    }
}

async fn event_loop(
    mut peers: RegistryWriter<Arc<PeerLink>>,
    mut events_rx: mpsc::Receiver<ServerEvent>,
    events: mpsc::WeakSender<ServerEvent>,
    reporter: Reporter,
) {
    let mut stopped = false;

    while let Some(event) = events_rx.recv().await {
        match event {
            ServerEvent::Stop => {
                for (key, link) in peers.drain().await {
                    link.close().await;
                    info!("Close connection {}", key);
                    reporter.emit(
                        Identity::Peer(key.clone()),
                        Event::Closed(format!("close connection {}", key)),
                    );
                }
                stopped = true;
                // Whatever is still queued is handled as "after stop".
                events_rx.close();
            }

            ServerEvent::Register(stream, peer_addr) => {
                let key = peer_addr.to_string();
                let Some(events) = events.upgrade().filter(|_| !stopped) else {
                    debug!("Rejecting {} accepted during shutdown", key);
                    drop(stream);
                    reporter.emit(
                        Identity::Peer(key.clone()),
                        Event::Closed(format!("close connection {}", key)),
                    );
                    continue;
                };

                let (link, reader) = PeerLink::new(stream, key.clone());
                if let Some(previous) = peers.insert(key, link.clone()).await {
                    previous.close().await;
                }
                tokio::spawn(peer_loop(link, reader, events, reporter.clone()));
            }

            ServerEvent::Deregister(link) => {
                if stopped {
                    continue;
                }
                // Only remove the entry if it still belongs to this link.
                if let Some(current) = peers.remove(link.remote()).await {
                    if !Arc::ptr_eq(&current, &link) {
                        peers.insert(link.remote().to_string(), current).await;
                    }
                }
            }

            ServerEvent::Broadcast { payload, reply } => {
                let mut delivered = 0;
                for (key, link) in peers.view().snapshot().await {
                    match link.write(&payload).await {
                        Ok(()) => delivered += 1,
                        Err(e) => {
                            warn!("Error broadcasting message to client {}: {}", key, e);
                            reporter.emit(
                                Identity::Peer(key.clone()),
                                Event::Error(format!(
                                    "error broadcasting message to client {} : {}",
                                    key, e
                                )),
                            );
                        }
                    }
                }
                let _ = reply.send(delivered);
            }
        }
    }
    debug!("Server event task finished");
}

async fn peer_loop(
    link: Arc<PeerLink>,
    mut reader: LinkReader,
    events: mpsc::Sender<ServerEvent>,
    reporter: Reporter,
) {
    let key = link.remote().to_string();
    loop {
        match reader.read().await {
            ReadOutcome::Data(bytes) => {
                debug!("Received {} bytes from {}", bytes.len(), key);
                reporter.emit(Identity::Peer(key.clone()), Event::Data(bytes));
            }
            // Closed by the event task, which already reported it.
            ReadOutcome::Closed => return,
            ReadOutcome::Eof => break,
            ReadOutcome::Failed(e) => {
                if !is_disconnect(&e) {
                    warn!("Error reading from client {}: {}", key, e);
                    reporter.emit(
                        Identity::Peer(key.clone()),
                        Event::Error(format!("error reading from client {} : {}", key, e)),
                    );
                }
                break;
            }
        }
    }

    if !link.close().await {
        return;
    }
    info!("Client disconnected: {}", key);
    reporter.emit(
        Identity::Peer(key.clone()),
        Event::Closed(format!("client disconnected: {}", key)),
    );
    let _ = events.send(ServerEvent::Deregister(link)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{ChannelNotifier, Notification};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn engine() -> (InboundEngine, mpsc::UnboundedReceiver<Notification>) {
        let (notifier, rx) = ChannelNotifier::new();
        (InboundEngine::new(Arc::new(notifier)), rx)
    }

    async fn wait_for_peers(engine: &InboundEngine, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.peer_count().await != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("peer count not reached");
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (engine, _rx) = engine();
        engine.start("127.0.0.1:0").await.unwrap();
        assert!(matches!(
            engine.start("127.0.0.1:0").await,
            Err(ServerError::AlreadyRunning)
        ));
        assert!(engine.stop().await);
        assert!(!engine.stop().await);
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let (engine, _rx) = engine();
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let err = engine.start(&addr).await.unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
        assert!(!engine.is_running().await);
    }

    #[tokio::test]
    async fn test_not_running() {
        let (engine, _rx) = engine();
        assert!(matches!(
            engine.broadcast(b"x".to_vec()).await,
            Err(ServerError::NotRunning)
        ));
        assert!(matches!(
            engine.send_to("127.0.0.1:1", b"x").await,
            Err(ServerError::NotRunning)
        ));
        assert!(engine.peer_keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let (engine, mut rx) = engine();
        engine.start("127.0.0.1:0").await.unwrap();

        let err = engine.send_to("10.0.0.1:9", b"x").await.unwrap_err();
        assert!(matches!(err, ServerError::PeerNotFound(_)));
        assert!(err.is_notified());

        let n = rx.recv().await.unwrap();
        assert_eq!(n.channel(), "server-tcp-error");
        assert_eq!(n.identity, Identity::Peer("10.0.0.1:9".into()));
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_send_to_and_disconnect() {
        let (engine, mut rx) = engine();
        let addr = engine.start("127.0.0.1:0").await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let key = client.local_addr().unwrap().to_string();
        wait_for_peers(&engine, 1).await;
        assert_eq!(engine.peer_keys().await, vec![key.clone()]);

        engine.send_to(&key, b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        drop(client);
        wait_for_peers(&engine, 0).await;

        let mut closed = false;
        while let Ok(n) = rx.try_recv() {
            if n.event == Event::Closed(format!("client disconnected: {}", key)) {
                closed = true;
            }
        }
        assert!(closed);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_peers() {
        let (engine, _rx) = engine();
        let addr = engine.start("127.0.0.1:0").await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        wait_for_peers(&engine, 1).await;

        assert!(engine.stop().await);
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(engine.peer_count().await, 0);

        // Restart on a fresh registry.
        engine.start("127.0.0.1:0").await.unwrap();
        assert_eq!(engine.peer_count().await, 0);
        engine.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_restart_on_same_address() {
        let (engine, _rx) = engine();
        let addr = engine.start("127.0.0.1:0").await.unwrap().to_string();

        for round in 0..100 {
            assert!(engine.stop().await);
            if let Err(e) = engine.start(&addr).await {
                panic!("restart {} on {} failed: {}", round, addr, e);
            }
        }
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_register_without_sender_closes_stream() {
        let (notifier, mut rx) = ChannelNotifier::new();
        let reporter = Reporter::new(Scope::Server, Arc::new(notifier));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, peer_addr) = listener.accept().await.unwrap();

        // Queue a registration, then drop the last strong sender.
        let (writer, _view) = registry();
        let (events, events_rx) = mpsc::channel(4);
        let weak = events.downgrade();
        events
            .send(ServerEvent::Register(stream, peer_addr))
            .await
            .unwrap();
        drop(events);

        tokio::time::timeout(
            Duration::from_secs(5),
            event_loop(writer, events_rx, weak, reporter),
        )
        .await
        .unwrap();

        let key = peer_addr.to_string();
        let n = rx.try_recv().unwrap();
        assert_eq!(n.identity, Identity::Peer(key.clone()));
        assert_eq!(n.event, Event::Closed(format!("close connection {}", key)));

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(read, 0);
    }
}
