// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Boundary-facing front of the three engines.
//!
//! Callers on the other side of the boundary deal in base64 strings, integer
//! indices and peer keys, and never see a Rust error: every failure becomes
//! an error notification. Addresses come from the current [`AppConfig`].

use crate::client::{ClientError, OutboundEngine};
use crate::config::{AppConfig, ConfigError};
use crate::notify::{Event, Identity, Notification, Notifier, Reporter, Scope};
use crate::relay::{RelayEngine, RelayError};
use crate::server::{InboundEngine, ServerError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Errors surfaced by the coordinator itself.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("{0} decode failed")]
    Decode(String),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Identity as seen across the boundary: an index for client connections,
/// a key for everything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BoundaryIdentity {
    Index(i64),
    Key(String),
}

/// A notification in the shape of the external event transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundaryEvent {
    /// Event channel, e.g. `client-tcp-data`.
    pub name: String,
    pub identity: BoundaryIdentity,
    /// Base64 for data events, human-readable text otherwise.
    pub payload: String,
}

impl From<&Notification> for BoundaryEvent {
    fn from(n: &Notification) -> Self {
        let identity = match (&n.identity, n.scope) {
            (Identity::Index(i), _) => BoundaryIdentity::Index(*i as i64),
            (Identity::Peer(key), _) => BoundaryIdentity::Key(key.clone()),
            (Identity::Engine, Scope::Client) => BoundaryIdentity::Index(-1),
            (Identity::Engine, _) => BoundaryIdentity::Key("server".to_string()),
        };
        let payload = match &n.event {
            Event::Data(bytes) => STANDARD.encode(bytes),
            other => other.to_string(),
        };
        Self {
            name: n.channel().to_string(),
            identity,
            payload,
        }
    }
}

impl BoundaryEvent {
    /// One-line JSON form.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Owns the configuration and the three engines.
pub struct ConnectionCoordinator {
    config: RwLock<AppConfig>,
    config_path: Option<PathBuf>,
    client: OutboundEngine,
    server: InboundEngine,
    relay: RelayEngine,
    client_reporter: Reporter,
    server_reporter: Reporter,
    relay_reporter: Reporter,
}

impl ConnectionCoordinator {
    /// Build the engines. The reconnect interval is taken from `config` once,
    /// here.
    pub fn new(config: AppConfig, notifier: Arc<dyn Notifier>) -> Self {
        let policy = config.reconnect_policy();
        let client_reporter = Reporter::new(Scope::Client, notifier.clone());
        Self {
            client: OutboundEngine::with_policy(notifier.clone(), policy),
            server: InboundEngine::new(notifier.clone()),
            relay: RelayEngine::with_policy(notifier, policy),
            server_reporter: client_reporter.with_scope(Scope::Server),
            relay_reporter: client_reporter.with_scope(Scope::RelayUpstream),
            client_reporter,
            config: RwLock::new(config),
            config_path: None,
        }
    }

    /// Save every accepted [`set_config`](Self::set_config) to `path`.
    pub fn persist_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub async fn config(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// Replace the configuration.
    ///
    /// Invalid configurations are rejected. Running engines keep the
    /// addresses they were started with.
    pub async fn set_config(&self, config: AppConfig) -> Result<(), CoordinatorError> {
        config.validate()?;
        let mut current = self.config.write().await;
        if *current == config {
            return Ok(());
        }
        if let Some(path) = &self.config_path {
            config.to_file(path)?;
        }
        *current = config;
        debug!("Configuration updated");
        Ok(())
    }

    pub fn client(&self) -> &OutboundEngine {
        &self.client
    }

    pub fn server(&self) -> &InboundEngine {
        &self.server
    }

    pub fn relay(&self) -> &RelayEngine {
        &self.relay
    }

    // ---- client ----

    /// Open a connection to the configured server. Returns its index, or -1.
    pub async fn client_open(&self) -> i64 {
        let address = self.config.read().await.client_address();
        match self.client.open(&address).await {
            Ok(index) => index as i64,
            Err(e) => {
                self.report_client(Identity::Engine, e.into());
                -1
            }
        }
    }

    pub async fn client_send(&self, index: i64, data: &str) {
        let Some(index) = self.client_index(index).await else {
            return;
        };
        let identity = Identity::Index(index);
        let payload = match decode(data) {
            Ok(payload) => payload,
            Err(e) => return self.report_client(identity, e),
        };
        if let Err(e) = self.client.send(index, payload).await {
            self.report_client(identity, e.into());
        }
    }

    pub async fn client_close(&self, index: i64) {
        let Some(index) = self.client_index(index).await else {
            return;
        };
        if let Err(e) = self.client.close(index).await {
            self.report_client(Identity::Index(index), e.into());
        }
    }

    /// Close every connection; numbering restarts at 0.
    pub async fn client_close_all(&self) -> usize {
        self.client.close_all().await
    }

    // ---- server ----

    pub async fn server_start(&self) -> bool {
        let address = self.config.read().await.server_address();
        match self.server.start(&address).await {
            Ok(local) => {
                info!("TCP server listening on {}", local);
                self.server_reporter.emit(
                    Identity::Engine,
                    Event::Opened(format!("listening on {}", local)),
                );
                true
            }
            Err(e) => {
                self.report_server(Identity::Engine, e.into());
                false
            }
        }
    }

    pub async fn server_stop(&self) -> bool {
        if !self.server.stop().await {
            return false;
        }
        self.server_reporter
            .emit(Identity::Engine, Event::Closed("tcp server stopped".into()));
        true
    }

    pub async fn server_send(&self, peer: &str, data: &str) {
        let identity = Identity::Peer(peer.to_string());
        if !self.server.is_running().await {
            return self.report_server(identity, ServerError::NotRunning.into());
        }
        let payload = match decode(data) {
            Ok(payload) => payload,
            Err(e) => return self.report_server(identity, e),
        };
        if let Err(e) = self.server.send_to(peer, &payload).await {
            self.report_server(identity, e.into());
        }
    }

    /// Returns how many peers were written to.
    pub async fn server_broadcast(&self, data: &str) -> usize {
        if !self.server.is_running().await {
            self.report_server(Identity::Engine, ServerError::NotRunning.into());
            return 0;
        }
        let payload = match decode(data) {
            Ok(payload) => payload,
            Err(e) => {
                self.report_server(Identity::Engine, e);
                return 0;
            }
        };
        match self.server.broadcast(payload).await {
            Ok(delivered) => delivered,
            Err(e) => {
                self.report_server(Identity::Engine, e.into());
                0
            }
        }
    }

    // ---- relay ----

    pub async fn relay_start(&self) -> bool {
        let (bind, downstream) = {
            let config = self.config.read().await;
            (config.transfer_src_address(), config.transfer_dst_address())
        };
        match self.relay.start(&bind, &downstream).await {
            Ok(local) => {
                info!("Relay listening on {} towards {}", local, downstream);
                self.relay_reporter.emit(
                    Identity::Engine,
                    Event::Opened(format!("listening on {}", local)),
                );
                true
            }
            Err(e) => {
                self.report_relay(Identity::Engine, e.into());
                false
            }
        }
    }

    pub async fn relay_stop(&self) -> bool {
        if !self.relay.stop().await {
            return false;
        }
        self.relay_reporter.emit(
            Identity::Engine,
            Event::Closed("transfer server stopped".into()),
        );
        true
    }

    pub async fn relay_send_to_downstream(&self, peer: &str, data: &str) {
        let identity = Identity::Peer(peer.to_string());
        let Some(payload) = self.relay_payload(identity.clone(), data).await else {
            return;
        };
        if let Err(e) = self.relay.send_to_downstream(peer, &payload).await {
            self.report_relay(identity, e.into());
        }
    }

    pub async fn relay_send_to_upstream(&self, peer: &str, data: &str) {
        let identity = Identity::Peer(peer.to_string());
        let Some(payload) = self.relay_payload(identity.clone(), data).await else {
            return;
        };
        if let Err(e) = self.relay.send_to_upstream(peer, &payload).await {
            self.report_relay(identity, e.into());
        }
    }

    pub async fn relay_broadcast_to_downstream(&self, data: &str) -> usize {
        let Some(payload) = self.relay_payload(Identity::Engine, data).await else {
            return 0;
        };
        match self.relay.broadcast_to_downstream(payload).await {
            Ok(delivered) => delivered,
            Err(e) => {
                self.report_relay(Identity::Engine, e.into());
                0
            }
        }
    }

    pub async fn relay_broadcast_to_upstream(&self, data: &str) -> usize {
        let Some(payload) = self.relay_payload(Identity::Engine, data).await else {
            return 0;
        };
        match self.relay.broadcast_to_upstream(payload).await {
            Ok(delivered) => delivered,
            Err(e) => {
                self.report_relay(Identity::Engine, e.into());
                0
            }
        }
    }

    /// Shut everything down.
    pub async fn shutdown(&self) {
        self.client_close_all().await;
        self.server_stop().await;
        self.relay_stop().await;
    }

    async fn client_index(&self, index: i64) -> Option<usize> {
        let valid = usize::try_from(index).ok();
        match valid {
            Some(i) if i < self.client.len().await => Some(i),
            _ => {
                let identity = valid.map_or(Identity::Engine, Identity::Index);
                self.client_reporter
                    .emit(identity, Event::Error("invalid client index".into()));
                None
            }
        }
    }

    async fn relay_payload(&self, identity: Identity, data: &str) -> Option<Vec<u8>> {
        if !self.relay.is_running().await {
            self.relay_reporter.emit(
                identity,
                Event::Error("transfer server not started".into()),
            );
            return None;
        }
        match decode(data) {
            Ok(payload) => Some(payload),
            Err(e) => {
                self.report_relay(identity, e);
                None
            }
        }
    }

    fn report_client(&self, identity: Identity, err: CoordinatorError) {
        report(&self.client_reporter, identity, err);
    }

    fn report_server(&self, identity: Identity, err: CoordinatorError) {
        report(&self.server_reporter, identity, err);
    }

    fn report_relay(&self, identity: Identity, err: CoordinatorError) {
        report(&self.relay_reporter, identity, err);
    }
}

fn decode(data: &str) -> Result<Vec<u8>, CoordinatorError> {
    STANDARD
        .decode(data)
        .map_err(|_| CoordinatorError::Decode(data.to_string()))
}

/// Emit an error unless the engine already did.
fn report(reporter: &Reporter, identity: Identity, err: CoordinatorError) {
    let notified = match &err {
        CoordinatorError::Client(e) => e.is_notified(),
        CoordinatorError::Server(e) => e.is_notified(),
        CoordinatorError::Relay(e) => e.is_notified(),
        CoordinatorError::Decode(_) | CoordinatorError::Config(_) => false,
    };
    if !notified {
        reporter.emit(identity, Event::Error(err.to_string()));
    }
}
