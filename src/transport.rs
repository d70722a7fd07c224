use crate::error::{RelayError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryMethod {
    Unreliable,
    Sequenced,
    ReliableOrdered,
}

/// Handle to one connected client, owned by the transport layer.
///
/// `send` hands an already framed buffer to the connection's own queue and
/// must not block on the network.
pub trait Peer: Send + Sync {
    fn send(&self, data: Bytes, channel: u8, method: DeliveryMethod) -> Result<()>;
    fn pending_count(&self, channel: u8, method: DeliveryMethod) -> usize;
    fn is_connected(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentPacket {
    pub data: Bytes,
    pub channel: u8,
    pub method: DeliveryMethod,
}

/// In-process peer that records everything sent to it.
pub struct MemoryPeer {
    sent: Mutex<Vec<SentPacket>>,
    pending: AtomicUsize,
    connected: AtomicBool,
}

impl MemoryPeer {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            pending: AtomicUsize::new(0),
            connected: AtomicBool::new(true),
        }
    }

    /// Simulates a backed-up outbound queue.
    pub fn set_pending(&self, pending: usize) {
        self.pending.store(pending, Ordering::Relaxed);
    }

    pub fn take_sent(&self) -> Vec<SentPacket> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn close(&self) {
        self.connected.store(false, Ordering::Release);
    }
}

impl Default for MemoryPeer {
    fn default() -> Self {
        Self::new()
    }
}

impl Peer for MemoryPeer {
    fn send(&self, data: Bytes, channel: u8, method: DeliveryMethod) -> Result<()> {
        if !self.is_connected() {
            return Err(RelayError::ConnectionClosed);
        }
        self.sent.lock().push(SentPacket { data, channel, method });
        Ok(())
    }

    fn pending_count(&self, _channel: u8, _method: DeliveryMethod) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}
