//! Deferred encrypt-then-send handoff
//!
//! Packet protection can run on a worker thread; finished packets come
//! back through [`EncryptedTail::encrypted_tail`] and a single per-
//! connection task drains them onto the wire under the connection lock.
//! One task per connection means scheduling is naturally single-flight:
//! re-queuing while the task is busy just grows its channel.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::error::{QuicError, Result};
use crate::events::EventSink;
use crate::outq::Egress;
use crate::packet::{EncryptedPacket, PacketBuilder};

/// Handle for queueing encrypted packets to a connection's send task.
#[derive(Debug, Clone)]
pub struct EncryptedTail {
    tx: mpsc::UnboundedSender<EncryptedPacket>,
}

impl EncryptedTail {
    /// Queue one encrypted packet. Fails once the send task has shut
    /// down with the connection.
    pub fn encrypted_tail(&self, packet: EncryptedPacket) -> Result<()> {
        self.tx
            .send(packet)
            .map_err(|_| QuicError::ConnectionClosed)
    }
}

/// Spawn the send task for `egress` and return its queue handle.
///
/// The task locks the connection per batch, drops everything if the
/// connection died, otherwise transmits each packet and flushes. Must be
/// called from within a tokio runtime.
pub fn spawn_crypto_tail<B, E>(egress: Arc<Mutex<Egress<B, E>>>) -> EncryptedTail
where
    B: PacketBuilder + Send + 'static,
    E: EventSink + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<EncryptedPacket>();
    tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            let mut egress = egress.lock().await;
            if egress.is_dead() {
                let mut dropped = 1usize;
                while rx.try_recv().is_ok() {
                    dropped += 1;
                }
                debug!("connection dead, dropped {} encrypted packets", dropped);
                break;
            }
            egress.xmit_encrypted(packet);
            // Drain whatever else queued up while we waited for the lock.
            while let Ok(more) = rx.try_recv() {
                egress.xmit_encrypted(more);
            }
            egress.flush_encrypted();
        }
    });
    EncryptedTail { tx }
}
