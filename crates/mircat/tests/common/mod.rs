// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared helpers for the loopback integration tests.

#![allow(dead_code)]

use mircat::{ChannelNotifier, Event, Identity, Notification, Notifier, ReconnectPolicy, Scope};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;

/// Upper bound for anything a test waits on.
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Reconnect quickly so tests stay short.
pub fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy::fixed(Duration::from_millis(20))
}

/// Notifications received so far, plus the channel they arrive on.
pub struct Events {
    rx: UnboundedReceiver<Notification>,
    seen: Vec<Notification>,
}

pub fn notifier() -> (Arc<dyn Notifier>, Events) {
    let (notifier, rx) = ChannelNotifier::new();
    (
        Arc::new(notifier),
        Events {
            rx,
            seen: Vec::new(),
        },
    )
}

impl Events {
    /// Wait for the next notification matching `pred`.
    pub async fn expect<P>(&mut self, pred: P) -> Notification
    where
        P: Fn(&Notification) -> bool,
    {
        let wait = async {
            loop {
                let n = self.rx.recv().await.expect("notifier dropped");
                self.seen.push(n.clone());
                if pred(&n) {
                    return n;
                }
            }
        };
        tokio::time::timeout(TIMEOUT, wait)
            .await
            .expect("timed out waiting for notification")
    }

    /// Pull in whatever is already queued.
    pub fn drain(&mut self) {
        while let Ok(n) = self.rx.try_recv() {
            self.seen.push(n);
        }
    }

    pub fn seen(&self) -> &[Notification] {
        &self.seen
    }
}

pub fn is(scope: Scope, identity: &Identity, event: &Event) -> impl Fn(&Notification) -> bool {
    let identity = identity.clone();
    let event = event.clone();
    move |n| n.scope == scope && n.identity == identity && n.event == event
}

pub fn is_error(scope: Scope, identity: &Identity) -> impl Fn(&Notification) -> bool {
    let identity = identity.clone();
    move |n| n.scope == scope && n.identity == identity && matches!(n.event, Event::Error(_))
}

/// Poll `check` until it holds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(TIMEOUT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

pub async fn listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

/// An address nothing listens on.
pub async fn dead_address() -> String {
    let (listener, addr) = listener().await;
    drop(listener);
    addr
}

pub async fn accept(listener: &TcpListener) -> TcpStream {
    tokio::time::timeout(TIMEOUT, listener.accept())
        .await
        .expect("accept timed out")
        .unwrap()
        .0
}

pub async fn read_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    tokio::time::timeout(TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    buf
}

/// Wait until the remote end closes `stream`.
pub async fn expect_eof(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    let closed = tokio::time::timeout(TIMEOUT, async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "connection was not closed");
}
