// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed-interval reconnect policy.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;

/// Default delay between two dial attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// How a lost connection is re-established.
///
/// Retries never stop on their own and the delay never grows. The loop ends
/// only when the owning connection is closed or its pair removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Delay after each failed attempt.
    pub interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RECONNECT_INTERVAL,
        }
    }
}

impl ReconnectPolicy {
    /// Policy with a custom fixed interval.
    pub fn fixed(interval: Duration) -> Self {
        Self { interval }
    }
}

/// Dial `address` until it succeeds or `cancelled` resolves.
///
/// `on_retry` runs once per failed attempt, before the sleep. Returns `None`
/// when cancelled.
pub(crate) async fn redial<C, F>(
    address: &str,
    policy: ReconnectPolicy,
    cancelled: C,
    mut on_retry: F,
) -> Option<TcpStream>
where
    C: Future<Output = ()>,
    F: FnMut(u32, &io::Error),
{
    tokio::pin!(cancelled);
    let mut attempt: u32 = 0;

    loop {
        tokio::select! {
            biased;
            _ = &mut cancelled => return None,
            result = TcpStream::connect(address) => match result {
                Ok(stream) => return Some(stream),
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    on_retry(attempt, &e);
                }
            },
        }

        tokio::select! {
            biased;
            _ = &mut cancelled => return None,
            _ = tokio::time::sleep(policy.interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_default_policy() {
        assert_eq!(ReconnectPolicy::default().interval, Duration::from_secs(1));
        assert_eq!(
            ReconnectPolicy::fixed(Duration::from_millis(20)).interval,
            Duration::from_millis(20)
        );
    }

    #[tokio::test]
    async fn test_redial_connects_first_try() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let mut retries = 0;
        let stream = redial(
            &addr,
            ReconnectPolicy::default(),
            std::future::pending(),
            |_, _| retries += 1,
        )
        .await;
        assert!(stream.is_some());
        assert_eq!(retries, 0);
    }

    #[tokio::test]
    async fn test_redial_retries_until_reachable() {
        // Reserve a port, then free it so the first attempts are refused.
        let vacant = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = vacant.local_addr().unwrap();
        drop(vacant);

        let policy = ReconnectPolicy::fixed(Duration::from_millis(20));
        let (retry_tx, mut retry_rx) = tokio::sync::mpsc::unbounded_channel();
        let target = addr.to_string();
        let dialer = tokio::spawn(async move {
            redial(&target, policy, std::future::pending(), move |attempt, _| {
                let _ = retry_tx.send(attempt);
            })
            .await
        });

        assert_eq!(retry_rx.recv().await, Some(1));
        let _listener = TcpListener::bind(addr).await.unwrap();

        let stream = tokio::time::timeout(Duration::from_secs(5), dialer)
            .await
            .unwrap()
            .unwrap();
        assert!(stream.is_some());
    }

    #[tokio::test]
    async fn test_redial_cancelled() {
        let vacant = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = vacant.local_addr().unwrap().to_string();
        drop(vacant);

        let stream = redial(
            &addr,
            ReconnectPolicy::fixed(Duration::from_secs(60)),
            async {},
            |_, _| {},
        )
        .await;
        assert!(stream.is_none());
    }
}
