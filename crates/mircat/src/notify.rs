// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lifecycle, data and error notifications.
//!
//! Engines never call back into their caller. Everything they observe is
//! reported through a [`Notifier`], keyed by the connection [`Identity`].

use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Which engine (and for the relay, which leg) produced a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Outbound client connections.
    Client,
    /// Inbound server peers.
    Server,
    /// Relay inbound leg (the client side of a pair).
    RelayUpstream,
    /// Relay downstream leg (the fixed endpoint side of a pair).
    RelayDownstream,
}

/// Handle used to address a connection from outside the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// Outbound connection index.
    Index(usize),
    /// Peer address key (inbound peers and relay pairs).
    Peer(String),
    /// The engine itself (listener lifecycle, failed opens).
    Engine,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "#{}", i),
            Self::Peer(key) => write!(f, "{}", key),
            Self::Engine => write!(f, "engine"),
        }
    }
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Connection established, peer accepted or listener started.
    Opened(String),
    /// Connection closed, peer gone or listener stopped.
    Closed(String),
    /// A reconnect attempt failed; another one follows after the interval.
    Reconnecting { attempt: u32 },
    /// The connection was re-established.
    Reconnected,
    /// Bytes read from a socket.
    Data(Vec<u8>),
    /// Something failed.
    Error(String),
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opened(detail) => write!(f, "{}", detail),
            Self::Closed(detail) => write!(f, "{}", detail),
            Self::Reconnecting { attempt } => {
                write!(f, "trying to reconnect... (attempt {})", attempt)
            }
            Self::Reconnected => write!(f, "connection reconnected"),
            Self::Data(bytes) => write!(f, "{} bytes", bytes.len()),
            Self::Error(message) => write!(f, "{}", message),
        }
    }
}

/// A single observation reported by an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub scope: Scope,
    pub identity: Identity,
    pub event: Event,
}

impl Notification {
    pub fn new(scope: Scope, identity: Identity, event: Event) -> Self {
        Self {
            scope,
            identity,
            event,
        }
    }

    /// Channel name in the fixed event vocabulary of the front end.
    pub fn channel(&self) -> &'static str {
        match (self.scope, &self.event) {
            (Scope::Client, Event::Data(_)) => "client-tcp-data",
            (Scope::Client, Event::Error(_)) => "client-tcp-error",
            (Scope::Client, _) => "client-tcp-info",
            (Scope::Server, Event::Data(_)) => "server-tcp-data",
            (Scope::Server, Event::Error(_)) => "server-tcp-error",
            (Scope::Server, _) => "server-tcp-info",
            (Scope::RelayUpstream, Event::Data(_)) => "transfer-src-data",
            (Scope::RelayDownstream, Event::Data(_)) => "transfer-dst-data",
            (Scope::RelayUpstream | Scope::RelayDownstream, Event::Error(_)) => {
                "transfer-tcp-error"
            }
            (Scope::RelayUpstream | Scope::RelayDownstream, _) => "transfer-tcp-info",
        }
    }
}

/// Sink for engine notifications.
///
/// Delivery is fire-and-forget: implementations must not block for long and
/// have no way to report failure back to the engine.
pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, notification: Notification);
}

impl<F> Notifier for F
where
    F: Fn(Notification) + Send + Sync + 'static,
{
    fn notify(&self, notification: Notification) {
        self(notification)
    }
}

/// Notifier that only writes to the `tracing` log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, n: Notification) {
        match &n.event {
            Event::Error(_) => warn!("[{}] {}: {}", n.channel(), n.identity, n.event),
            Event::Data(_) => debug!("[{}] {}: {}", n.channel(), n.identity, n.event),
            _ => info!("[{}] {}: {}", n.channel(), n.identity, n.event),
        }
    }
}

/// Notifier that forwards every notification into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    /// Create a notifier and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        // Receiver gone means nobody is listening anymore.
        let _ = self.tx.send(notification);
    }
}

/// Engine-side helper binding a notifier to a scope.
#[derive(Clone)]
pub(crate) struct Reporter {
    scope: Scope,
    notifier: std::sync::Arc<dyn Notifier>,
}

impl Reporter {
    pub(crate) fn new(scope: Scope, notifier: std::sync::Arc<dyn Notifier>) -> Self {
        Self { scope, notifier }
    }

    pub(crate) fn with_scope(&self, scope: Scope) -> Self {
        Self {
            scope,
            notifier: self.notifier.clone(),
        }
    }

    pub(crate) fn emit(&self, identity: Identity, event: Event) {
        self.notifier
            .notify(Notification::new(self.scope, identity, event));
    }
}
