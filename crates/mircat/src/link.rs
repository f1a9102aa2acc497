// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One TCP socket split into a shared write side and a task-owned read side.
//!
//! Closing a link flips a `watch` flag. Every task parked on the link (a
//! pending read, a pending write, a reconnect sleep) observes the flag and
//! returns, then the socket is released once both halves are dropped.

use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

/// Size of the per-read buffer.
const READ_BUFFER_SIZE: usize = 4096;

/// Write side and closed flag of a socket.
#[derive(Debug)]
pub(crate) struct PeerLink {
    remote: String,
    writer: Mutex<Option<OwnedWriteHalf>>,
    closed: watch::Sender<bool>,
}

/// Read side of a socket, owned by exactly one read task.
#[derive(Debug)]
pub(crate) struct LinkReader {
    half: OwnedReadHalf,
    closed: watch::Receiver<bool>,
    buf: Vec<u8>,
}

/// Result of one read.
#[derive(Debug)]
pub(crate) enum ReadOutcome {
    /// Bytes received.
    Data(Vec<u8>),
    /// Peer closed its side.
    Eof,
    /// The socket failed.
    Failed(io::Error),
    /// The link was closed locally.
    Closed,
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed")
}

impl PeerLink {
    /// Split a stream into a link and its reader.
    pub(crate) fn new(stream: TcpStream, remote: impl Into<String>) -> (Arc<Self>, LinkReader) {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let (closed, closed_rx) = watch::channel(false);

        let link = Arc::new(Self {
            remote: remote.into(),
            writer: Mutex::new(Some(write_half)),
            closed,
        });
        let reader = LinkReader {
            half: read_half,
            closed: closed_rx,
            buf: vec![0u8; READ_BUFFER_SIZE],
        };
        (link, reader)
    }

    /// Address of the remote end.
    pub(crate) fn remote(&self) -> &str {
        &self.remote
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Write the whole buffer.
    ///
    /// Fails with `NotConnected` once the link is closed, including when the
    /// close happens while the write is pending.
    pub(crate) async fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let mut closed = self.closed.subscribe();
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(closed_error)?;

        tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => Err(closed_error()),
            result = async {
                writer.write_all(bytes).await?;
                writer.flush().await
            } => result,
        }
    }

    /// Close the link.
    ///
    /// Returns `true` for the call that actually closed it, `false` if it was
    /// already closed.
    pub(crate) async fn close(&self) -> bool {
        let first = !self.closed.send_replace(true);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        first
    }

    /// Resolve once the link has been closed.
    pub(crate) async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }
}

impl LinkReader {
    /// Read the next chunk, or report why the link is done.
    pub(crate) async fn read(&mut self) -> ReadOutcome {
        tokio::select! {
            biased;
            _ = self.closed.wait_for(|c| *c) => ReadOutcome::Closed,
            result = self.half.read(&mut self.buf) => match result {
                Ok(0) => ReadOutcome::Eof,
                Ok(n) => ReadOutcome::Data(self.buf[..n].to_vec()),
                Err(e) => ReadOutcome::Failed(e),
            },
        }
    }
}

/// Whether a read error is the ordinary end of a connection.
pub(crate) fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::NotConnected
    )
}
