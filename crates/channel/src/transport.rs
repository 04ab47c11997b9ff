//! Transport abstraction
//!
//! A transport is a bidirectional message pipe with text, binary and close
//! frames. [`memory_pair`] gives two connected in-process endpoints.

use crate::error::{ChannelError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Close codes
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const ABNORMAL: u16 = 1006;
}

/// Clean closures never trigger reconnection
pub fn is_clean_close(code: u16) -> bool {
    code == close_code::NORMAL || code == close_code::GOING_AWAY
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, frame: Frame) -> Result<()>;

    /// Next frame; `None` means the peer vanished without a close frame
    async fn recv(&self) -> Option<Frame>;

    async fn close(&self, code: u16, reason: &str) -> Result<()>;
}

/// Opens fresh transports for (re)connection
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Transport>>;
}

/// In-process transport endpoint
#[derive(Debug)]
pub struct MemoryTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
}

impl MemoryTransport {
    /// Drop the outgoing half without a close frame, as a crashed peer would
    pub fn abort(&self) {
        self.tx.lock().take();
    }

    pub fn is_open(&self) -> bool {
        self.tx.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

/// Two connected in-memory endpoints
pub fn memory_pair() -> (Arc<MemoryTransport>, Arc<MemoryTransport>) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();

    let a = MemoryTransport {
        tx: Mutex::new(Some(a_tx)),
        rx: tokio::sync::Mutex::new(a_rx),
    };
    let b = MemoryTransport {
        tx: Mutex::new(Some(b_tx)),
        rx: tokio::sync::Mutex::new(b_rx),
    };
    (Arc::new(a), Arc::new(b))
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, frame: Frame) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or_else(|| ChannelError::Transport("transport is closed".to_string()))?;
        tx.send(frame)
            .map_err(|_| ChannelError::Transport("peer has gone away".to_string()))
    }

    async fn recv(&self) -> Option<Frame> {
        self.rx.lock().await.recv().await
    }

    async fn close(&self, code: u16, reason: &str) -> Result<()> {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(Frame::Close {
                code,
                reason: reason.to_string(),
            });
        }
        Ok(())
    }
}
