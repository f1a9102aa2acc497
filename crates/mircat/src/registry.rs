// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Keyed connection registry with a single structural writer.
//!
//! [`registry`] returns two halves sharing one map:
//! - [`RegistryWriter`] inserts, removes and clears. It is not `Clone` and is
//!   moved into the engine's event task, which makes that task the only actor
//!   able to change the key set.
//! - [`RegistryView`] is cheap to clone and only does point lookups and
//!   snapshots under the read lock.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

type Shared<V> = Arc<RwLock<HashMap<String, V>>>;

/// Create an empty registry.
pub(crate) fn registry<V>() -> (RegistryWriter<V>, RegistryView<V>) {
    let map: Shared<V> = Arc::new(RwLock::new(HashMap::new()));
    (
        RegistryWriter { map: map.clone() },
        RegistryView { map },
    )
}

/// Structural access. Owned by exactly one task.
pub(crate) struct RegistryWriter<V> {
    map: Shared<V>,
}

impl<V> RegistryWriter<V> {
    /// Insert an entry, returning the previous one under the same key.
    pub(crate) async fn insert(&mut self, key: String, value: V) -> Option<V> {
        self.map.write().await.insert(key, value)
    }

    /// Remove an entry.
    pub(crate) async fn remove(&mut self, key: &str) -> Option<V> {
        self.map.write().await.remove(key)
    }

    /// Remove every entry and hand them back.
    pub(crate) async fn drain(&mut self) -> Vec<(String, V)> {
        self.map.write().await.drain().collect()
    }

    /// A read-only view onto the same map.
    pub(crate) fn view(&self) -> RegistryView<V> {
        RegistryView {
            map: self.map.clone(),
        }
    }
}

/// Read-only access for point lookups.
pub(crate) struct RegistryView<V> {
    map: Shared<V>,
}

impl<V> Clone for RegistryView<V> {
    fn clone(&self) -> Self {
        Self {
            map: self.map.clone(),
        }
    }
}

impl<V: Clone> RegistryView<V> {
    /// Look up one entry.
    pub async fn get(&self, key: &str) -> Option<V> {
        self.map.read().await.get(key).cloned()
    }

    /// Copy out every entry. The lock is released before the caller uses them.
    pub async fn snapshot(&self) -> Vec<(String, V)> {
        self.map
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl<V> RegistryView<V> {
    /// Number of entries.
    pub async fn len(&self) -> usize {
        self.map.read().await.len()
    }

    /// Sorted list of registered keys.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.map.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writer_and_view_share_map() {
        let (mut writer, view) = registry::<u32>();
        assert_eq!(view.len().await, 0);

        writer.insert("a".into(), 1).await;
        writer.insert("b".into(), 2).await;
        assert_eq!(view.len().await, 2);
        assert_eq!(view.get("a").await, Some(1));
        assert_eq!(view.keys().await, vec!["a".to_string(), "b".to_string()]);

        assert_eq!(writer.remove("a").await, Some(1));
        assert_eq!(view.get("a").await, None);
        assert_eq!(writer.remove("a").await, None);
    }

    #[tokio::test]
    async fn test_insert_replaces() {
        let (mut writer, view) = registry::<&'static str>();
        assert_eq!(writer.insert("k".into(), "old").await, None);
        assert_eq!(writer.insert("k".into(), "new").await, Some("old"));
        assert_eq!(view.get("k").await, Some("new"));
    }

    #[tokio::test]
    async fn test_drain_and_snapshot() {
        let (mut writer, view) = registry::<u8>();
        for (i, key) in ["x", "y", "z"].iter().enumerate() {
            writer.insert((*key).into(), i as u8).await;
        }

        let mut snap = view.snapshot().await;
        snap.sort();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[0], ("x".to_string(), 0));

        let drained = writer.drain().await;
        assert_eq!(drained.len(), 3);
        assert_eq!(writer.view().len().await, 0);
    }
}
