// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relay engine.
//!
//! Every accepted client is paired with a fresh connection to one fixed
//! downstream address. Bytes are not forwarded automatically: each leg
//! reports what it reads and the caller decides where it goes.
//!
//! Lifecycle rules:
//! - the inbound leg owns the pair. When it ends, the pair is removed and
//!   both legs are closed;
//! - a downstream failure keeps the pair registered and redials the same
//!   address until it succeeds or the pair is removed;
//! - if the first downstream dial fails, the client is disconnected and no
//!   pair is created.

mod pair;

use crate::link::{is_disconnect, LinkReader, PeerLink, ReadOutcome};
use crate::notify::{Event, Identity, Notifier, Reporter, Scope};
use crate::reconnect::{redial, ReconnectPolicy};
use crate::registry::{registry, RegistryView, RegistryWriter};
use pair::RelayPair;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_QUEUE_DEPTH: usize = 64;

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to listen on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("relay already running")]
    AlreadyRunning,

    #[error("relay not started")]
    NotRunning,

    #[error("pair {0} not found")]
    PairNotFound(String),

    #[error("destination of pair {0} is reconnecting")]
    DownstreamUnavailable(String),

    #[error("error writing to {peer}: {source}")]
    Write {
        peer: String,
        #[source]
        source: io::Error,
    },
}

impl RelayError {
    /// Whether the engine already emitted a notification for this error.
    pub fn is_notified(&self) -> bool {
        matches!(self, Self::PairNotFound(_))
    }
}

/// Which side of the pairs a broadcast targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leg {
    Upstream,
    Downstream,
}

enum RelayEvent {
    Stop,
    Register {
        pair: Arc<RelayPair>,
        inbound: LinkReader,
        downstream: LinkReader,
    },
    Deregister(Arc<RelayPair>),
    Broadcast {
        leg: Leg,
        payload: Vec<u8>,
        reply: oneshot::Sender<usize>,
    },
}

struct Running {
    local_addr: SocketAddr,
    downstream_addr: String,
    events: mpsc::Sender<RelayEvent>,
    pairs: RegistryView<Arc<RelayPair>>,
    accept_task: JoinHandle<()>,
    event_task: JoinHandle<()>,
}

/// Shared context for the tasks of one relay run.
#[derive(Clone)]
struct Legs {
    upstream: Reporter,
    downstream: Reporter,
    downstream_addr: String,
    policy: ReconnectPolicy,
}

/// Pairs inbound clients with a fixed downstream endpoint.
#[derive(Clone)]
pub struct RelayEngine {
    upstream: Reporter,
    downstream: Reporter,
    policy: ReconnectPolicy,
    running: Arc<Mutex<Option<Running>>>,
}

impl RelayEngine {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self::with_policy(notifier, ReconnectPolicy::default())
    }

    /// Engine whose downstream legs redial at the given policy.
    pub fn with_policy(notifier: Arc<dyn Notifier>, policy: ReconnectPolicy) -> Self {
        let upstream = Reporter::new(Scope::RelayUpstream, notifier);
        Self {
            downstream: upstream.with_scope(Scope::RelayDownstream),
            upstream,
            policy,
            running: Arc::new(Mutex::new(None)),
        }
    }

    /// Listen on `bind` and pair every client with `downstream`.
    pub async fn start(&self, bind: &str, downstream: &str) -> Result<SocketAddr, RelayError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(RelayError::AlreadyRunning);
        }

        let bind_err = |source| RelayError::Bind {
            address: bind.to_string(),
            source,
        };
        let listener = TcpListener::bind(bind).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        info!("Relay listening on {} -> {}", local_addr, downstream);

        let legs = Legs {
            upstream: self.upstream.clone(),
            downstream: self.downstream.clone(),
            downstream_addr: downstream.to_string(),
            policy: self.policy,
        };
        let (writer, pairs) = registry();
        let (events, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

        let event_task = tokio::spawn(event_loop(
            writer,
            events_rx,
            events.downgrade(),
            legs.clone(),
        ));
        let accept_task = tokio::spawn(accept_loop(listener, events.clone(), legs));

        *running = Some(Running {
            local_addr,
            downstream_addr: downstream.to_string(),
            events,
            pairs,
            accept_task,
            event_task,
        });
        Ok(local_addr)
    }

    /// Close every pair and the listener.
    pub async fn stop(&self) -> bool {
        let Some(running) = self.running.lock().await.take() else {
            return false;
        };

        // The listener is dropped only once the accept task has finished.
        running.accept_task.abort();
        let _ = running.accept_task.await;

        let _ = running.events.send(RelayEvent::Stop).await;
        drop(running.events);
        let _ = running.event_task.await;
        info!("Relay on {} stopped", running.local_addr);
        true
    }

    /// Write to the downstream leg of one pair.
    pub async fn send_to_downstream(&self, key: &str, payload: &[u8]) -> Result<(), RelayError> {
        let pair = self.pair(key, &self.downstream).await?;
        let link = pair
            .downstream()
            .await
            .ok_or_else(|| RelayError::DownstreamUnavailable(key.to_string()))?;
        link.write(payload).await.map_err(|source| RelayError::Write {
            peer: link.remote().to_string(),
            source,
        })
    }

    /// Write to the inbound client of one pair.
    pub async fn send_to_upstream(&self, key: &str, payload: &[u8]) -> Result<(), RelayError> {
        let pair = self.pair(key, &self.upstream).await?;
        pair.inbound()
            .write(payload)
            .await
            .map_err(|source| RelayError::Write {
                peer: key.to_string(),
                source,
            })
    }

    /// Write to every downstream leg. Returns how many were written to.
    pub async fn broadcast_to_downstream(&self, payload: Vec<u8>) -> Result<usize, RelayError> {
        self.broadcast(Leg::Downstream, payload).await
    }

    /// Write to every inbound client. Returns how many were written to.
    pub async fn broadcast_to_upstream(&self, payload: Vec<u8>) -> Result<usize, RelayError> {
        self.broadcast(Leg::Upstream, payload).await
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Downstream address of the current run.
    pub async fn downstream_addr(&self) -> Option<String> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| r.downstream_addr.clone())
    }

    /// Keys of the registered pairs, sorted.
    pub async fn pair_keys(&self) -> Vec<String> {
        match self.pairs().await {
            Ok(pairs) => pairs.keys().await,
            Err(_) => Vec::new(),
        }
    }

    pub async fn pair_count(&self) -> usize {
        match self.pairs().await {
            Ok(pairs) => pairs.len().await,
            Err(_) => 0,
        }
    }

    /// Whether the downstream leg of a pair is currently connected.
    pub async fn is_downstream_connected(&self, key: &str) -> bool {
        let Ok(pairs) = self.pairs().await else {
            return false;
        };
        match pairs.get(key).await {
            Some(pair) => pair.downstream().await.is_some(),
            None => false,
        }
    }

    async fn broadcast(&self, leg: Leg, payload: Vec<u8>) -> Result<usize, RelayError> {
        let events = {
            let running = self.running.lock().await;
            running
                .as_ref()
                .map(|r| r.events.clone())
                .ok_or(RelayError::NotRunning)?
        };

        let (reply, delivered) = oneshot::channel();
        events
            .send(RelayEvent::Broadcast {
                leg,
                payload,
                reply,
            })
            .await
            .map_err(|_| RelayError::NotRunning)?;
        delivered.await.map_err(|_| RelayError::NotRunning)
    }

    async fn pair(&self, key: &str, reporter: &Reporter) -> Result<Arc<RelayPair>, RelayError> {
        match self.pairs().await?.get(key).await {
            Some(pair) => Ok(pair),
            None => {
                reporter.emit(
                    Identity::Peer(key.to_string()),
                    Event::Error(format!("pair {} not found", key)),
                );
                Err(RelayError::PairNotFound(key.to_string()))
            }
        }
    }

    async fn pairs(&self) -> Result<RegistryView<Arc<RelayPair>>, RelayError> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| r.pairs.clone())
            .ok_or(RelayError::NotRunning)
    }
}

async fn accept_loop(listener: TcpListener, events: mpsc::Sender<RelayEvent>, legs: Legs) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                info!("New relay client connected: {}", peer_addr);
                legs.upstream.emit(
                    Identity::Peer(peer_addr.to_string()),
                    Event::Opened(format!("client connected: {}", peer_addr)),
                );
                // Dial off the accept loop.
                tokio::spawn(open_pair(stream, peer_addr, events.clone(), legs.clone()));
            }
            Err(e) => {
                error!("Relay accept error: {}", e);
                legs.upstream.emit(
                    Identity::Engine,
                    Event::Error(format!("error accepting connection: {}", e)),
                );
                return;
            }
        }
    }
}

async fn open_pair(
    inbound: TcpStream,
    peer_addr: SocketAddr,
    events: mpsc::Sender<RelayEvent>,
    legs: Legs,
) {
    let key = peer_addr.to_string();
    let downstream = match TcpStream::connect(&legs.downstream_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                "Failed to connect to destination {} for {}: {}",
                legs.downstream_addr, key, e
            );
            drop(inbound);
            legs.downstream.emit(
                Identity::Peer(key.clone()),
                Event::Error(format!(
                    "error connecting to destination {}: {}",
                    legs.downstream_addr, e
                )),
            );
            legs.upstream.emit(
                Identity::Peer(key.clone()),
                Event::Closed(format!("client disconnected: {}", key)),
            );
            return;
        }
    };

    let (inbound, inbound_reader) = PeerLink::new(inbound, key.clone());
    let (downstream, downstream_reader) = PeerLink::new(downstream, legs.downstream_addr.clone());
    let pair = RelayPair::new(key.clone(), inbound, downstream);

    let register = RelayEvent::Register {
        pair: pair.clone(),
        inbound: inbound_reader,
        downstream: downstream_reader,
    };
    if events.send(register).await.is_err() {
        pair.close().await;
        legs.upstream.emit(
            Identity::Peer(key.clone()),
            Event::Closed(format!("close connection {}", key)),
        );
    }
}

async fn event_loop(
    mut pairs: RegistryWriter<Arc<RelayPair>>,
    mut events_rx: mpsc::Receiver<RelayEvent>,
    events: mpsc::WeakSender<RelayEvent>,
    legs: Legs,
) {
    let mut stopped = false;

    while let Some(event) = events_rx.recv().await {
        match event {
            RelayEvent::Stop => {
                for (key, pair) in pairs.drain().await {
                    pair.close().await;
                    info!("Close relay pair {}", key);
                    legs.upstream.emit(
                        Identity::Peer(key.clone()),
                        Event::Closed(format!("close connection {}", key)),
                    );
                }
                stopped = true;
                events_rx.close();
            }

            RelayEvent::Register {
                pair,
                inbound,
                downstream,
            } => {
                let key = pair.key().to_string();
                let Some(events) = events.upgrade().filter(|_| !stopped) else {
                    pair.close().await;
                    legs.upstream.emit(
                        Identity::Peer(key.clone()),
                        Event::Closed(format!("close connection {}", key)),
                    );
                    continue;
                };

                debug!("Relay pair registered: {} <-> {}", key, legs.downstream_addr);
                legs.downstream.emit(
                    Identity::Peer(key.clone()),
                    Event::Opened(format!(
                        "connected to destination {}",
                        legs.downstream_addr
                    )),
                );
                if let Some(previous) = pairs.insert(key, pair.clone()).await {
                    previous.close().await;
                }
                tokio::spawn(inbound_leg(pair.clone(), inbound, events, legs.clone()));
                tokio::spawn(downstream_leg(pair, downstream, legs.clone()));
            }

            RelayEvent::Deregister(pair) => {
                if stopped {
                    continue;
                }
                let key = pair.key().to_string();
                if let Some(current) = pairs.remove(&key).await {
                    if !Arc::ptr_eq(&current, &pair) {
                        pairs.insert(key.clone(), current).await;
                    }
                }
                if pair.retire().await {
                    legs.downstream.emit(
                        Identity::Peer(key.clone()),
                        Event::Closed(format!("destination connection closed for {}", key)),
                    );
                }
            }

            RelayEvent::Broadcast {
                leg,
                payload,
                reply,
            } => {
                let mut delivered = 0;
                for (key, pair) in pairs.view().snapshot().await {
                    let (link, reporter) = match leg {
                        Leg::Upstream => (Some(pair.inbound().clone()), &legs.upstream),
                        Leg::Downstream => (pair.downstream().await, &legs.downstream),
                    };
                    let result = match link {
                        Some(link) => link.write(&payload).await,
                        None => Err(io::Error::new(
                            io::ErrorKind::NotConnected,
                            "destination reconnecting",
                        )),
                    };
                    match result {
                        Ok(()) => delivered += 1,
                        Err(e) => {
                            warn!("Relay broadcast to {} failed: {}", key, e);
                            reporter.emit(
                                Identity::Peer(key.clone()),
                                Event::Error(format!("error broadcasting to {}: {}", key, e)),
                            );
                        }
                    }
                }
                let _ = reply.send(delivered);
            }
        }
    }
    debug!("Relay event task finished");
}

/// Reads the client side. Its end is the end of the pair.
async fn inbound_leg(
    pair: Arc<RelayPair>,
    mut reader: LinkReader,
    events: mpsc::Sender<RelayEvent>,
    legs: Legs,
) {
    let key = pair.key().to_string();
    loop {
        match reader.read().await {
            ReadOutcome::Data(bytes) => {
                legs.upstream.emit(Identity::Peer(key.clone()), Event::Data(bytes));
            }
            ReadOutcome::Closed => return,
            ReadOutcome::Eof => break,
            ReadOutcome::Failed(e) => {
                if !is_disconnect(&e) {
                    warn!("Error reading from relay client {}: {}", key, e);
                    legs.upstream.emit(
                        Identity::Peer(key.clone()),
                        Event::Error(format!("error reading from client {} : {}", key, e)),
                    );
                }
                break;
            }
        }
    }

    if !pair.inbound().close().await {
        return;
    }
    info!("Relay client disconnected: {}", key);
    legs.upstream.emit(
        Identity::Peer(key.clone()),
        Event::Closed(format!("client disconnected: {}", key)),
    );
    let _ = events.send(RelayEvent::Deregister(pair)).await;
}

/// Reads the destination side and redials it while the pair lives.
async fn downstream_leg(pair: Arc<RelayPair>, mut reader: LinkReader, legs: Legs) {
    let key = pair.key().to_string();
    let identity = Identity::Peer(key.clone());

    loop {
        let Some(link) = pair.downstream().await else {
            return;
        };

        let failure = loop {
            match reader.read().await {
                ReadOutcome::Data(bytes) => {
                    legs.downstream.emit(identity.clone(), Event::Data(bytes));
                }
                ReadOutcome::Closed => return,
                ReadOutcome::Eof => break "destination closed the connection".to_string(),
                ReadOutcome::Failed(e) => break format!("error reading from destination: {}", e),
            }
        };

        link.close().await;
        pair.clear_downstream(&link).await;
        if pair.is_retired() {
            return;
        }
        warn!("Relay pair {}: {}", key, failure);
        legs.downstream.emit(identity.clone(), Event::Error(failure));

        let stream = redial(
            &legs.downstream_addr,
            legs.policy,
            pair.retired(),
            |attempt, e| {
                debug!("Redial {} for {} failed: {}", legs.downstream_addr, key, e);
                legs.downstream
                    .emit(identity.clone(), Event::Reconnecting { attempt });
            },
        )
        .await;
        let Some(stream) = stream else {
            return;
        };

        let (fresh, fresh_reader) = PeerLink::new(stream, legs.downstream_addr.clone());
        if !pair.install_downstream(fresh.clone()).await {
            fresh.close().await;
            return;
        }
        info!("Relay pair {} reconnected to {}", key, legs.downstream_addr);
        legs.downstream.emit(identity.clone(), Event::Reconnected);
        reader = fresh_reader;
    }
}
