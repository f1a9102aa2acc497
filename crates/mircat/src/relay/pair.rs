// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One inbound client bound to its downstream connection.

use crate::link::PeerLink;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

/// An inbound leg and the downstream leg opened for it.
///
/// The inbound link is fixed for the life of the pair. The downstream slot is
/// empty while a reconnect is in progress. Once retired, the pair accepts no
/// new downstream link.
#[derive(Debug)]
pub(crate) struct RelayPair {
    key: String,
    inbound: Arc<PeerLink>,
    downstream: RwLock<Option<Arc<PeerLink>>>,
    retired: watch::Sender<bool>,
}

impl RelayPair {
    pub(crate) fn new(key: String, inbound: Arc<PeerLink>, downstream: Arc<PeerLink>) -> Arc<Self> {
        let (retired, _) = watch::channel(false);
        Arc::new(Self {
            key,
            inbound,
            downstream: RwLock::new(Some(downstream)),
            retired,
        })
    }

    /// Inbound peer address, used as the registry key.
    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn inbound(&self) -> &Arc<PeerLink> {
        &self.inbound
    }

    /// Current downstream link, `None` while reconnecting.
    pub(crate) async fn downstream(&self) -> Option<Arc<PeerLink>> {
        self.downstream.read().await.clone()
    }

    /// Empty the downstream slot if it still holds `link`.
    pub(crate) async fn clear_downstream(&self, link: &Arc<PeerLink>) {
        let mut slot = self.downstream.write().await;
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, link)) {
            *slot = None;
        }
    }

    /// Install a reconnected downstream link.
    ///
    /// Returns `false` when the pair was retired in the meantime; the caller
    /// then owns the link and must close it.
    pub(crate) async fn install_downstream(&self, link: Arc<PeerLink>) -> bool {
        let mut slot = self.downstream.write().await;
        if self.is_retired() {
            return false;
        }
        *slot = Some(link);
        true
    }

    pub(crate) fn is_retired(&self) -> bool {
        *self.retired.borrow()
    }

    /// Resolve once the pair is retired.
    pub(crate) async fn retired(&self) {
        let mut rx = self.retired.subscribe();
        let _ = rx.wait_for(|r| *r).await;
    }

    /// Stop the downstream leg for good and close its current link.
    ///
    /// Returns `true` for the call that retired the pair.
    pub(crate) async fn retire(&self) -> bool {
        let first = !self.retired.send_replace(true);
        // Taken after the flag so a concurrent install either sees the flag
        // or has its link closed here.
        let current = self.downstream.write().await.take();
        if let Some(link) = current {
            link.close().await;
        }
        first
    }

    /// Close both legs.
    pub(crate) async fn close(&self) {
        self.inbound.close().await;
        self.retire().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn link(name: &str) -> (Arc<PeerLink>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (link, _reader) = PeerLink::new(client.unwrap(), name);
        (link, accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_retire_closes_downstream_and_blocks_install() {
        let (inbound, _i) = link("in").await;
        let (down, _d) = link("down").await;
        let pair = RelayPair::new("in".into(), inbound, down.clone());
        assert_eq!(pair.key(), "in");

        assert!(pair.retire().await);
        assert!(!pair.retire().await);
        assert!(down.is_closed());
        assert!(pair.downstream().await.is_none());
        assert!(!pair.inbound().is_closed());

        let (fresh, _f) = link("fresh").await;
        assert!(!pair.install_downstream(fresh).await);
        pair.retired().await;
    }

    #[tokio::test]
    async fn test_clear_only_matching_link() {
        let (inbound, _i) = link("in").await;
        let (down, _d) = link("down").await;
        let (other, _o) = link("other").await;
        let pair = RelayPair::new("in".into(), inbound, down.clone());

        pair.clear_downstream(&other).await;
        assert!(pair.downstream().await.is_some());

        pair.clear_downstream(&down).await;
        assert!(pair.downstream().await.is_none());

        assert!(pair.install_downstream(other.clone()).await);
        let current = pair.downstream().await.unwrap();
        assert!(Arc::ptr_eq(&current, &other));

        pair.close().await;
        assert!(pair.inbound().is_closed());
        assert!(other.is_closed());
    }
}
