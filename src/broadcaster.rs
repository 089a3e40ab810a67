//! Per-relay connection registry and fan-out broadcaster.
//!
//! A newly accepted event is delivered to every connection attached to the
//! same relay except the one that submitted it. Delivery to a single
//! connection is FIFO with respect to the order `broadcast` was called; a
//! slow connection never blocks delivery to others — its bounded outbound
//! queue is handed the event with `try_send`, and a full queue closes that
//! connection instead of stalling the broadcaster.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::warn;

use crate::event::Event;

pub type ConnectionId = u64;

/// A connection's outbound mailbox, as seen by the broadcaster. The
/// connection task itself owns the receiving end and is responsible for
/// serializing `Event`s into wire frames.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    sender: mpsc::Sender<Event>,
}

impl ConnectionHandle {
    fn try_deliver(&self, event: &Event) -> bool {
        match self.sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => false,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Tracks the live connections for one relay and fans events out to all of
/// them except the source.
#[derive(Clone)]
pub struct Broadcaster {
    connections: Arc<RwLock<Vec<ConnectionHandle>>>,
    next_id: Arc<AtomicU64>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a new connection, returning its id and the bounded
    /// outbound channel it should receive broadcast events on.
    pub async fn attach(&self, queue_bound: usize) -> (ConnectionId, mpsc::Receiver<Event>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(queue_bound.max(1));
        let handle = ConnectionHandle { id, sender: tx };
        self.connections.write().await.push(handle);
        (id, rx)
    }

    pub async fn detach(&self, id: ConnectionId) {
        let mut conns = self.connections.write().await;
        conns.retain(|c| c.id != id);
    }

    /// Deliver `event` to every connection except `source`. Connections
    /// whose outbound queue is full are dropped from the registry (their
    /// receive loop will observe the channel closing and terminate) rather
    /// than stalling this call.
    pub async fn broadcast(&self, source: ConnectionId, event: &Event) {
        // Snapshot under a read lock so a slow/long broadcast never blocks
        // concurrent attach/detach, and attach/detach never blocks this.
        let snapshot = self.connections.read().await.clone();

        let mut overflowed = Vec::new();
        for conn in &snapshot {
            if conn.id == source {
                continue;
            }
            if !conn.try_deliver(event) {
                overflowed.push(conn.id);
            }
        }

        if !overflowed.is_empty() {
            warn!(
                "dropping {} connection(s) with full outbound queue",
                overflowed.len()
            );
            let mut conns = self.connections.write().await;
            conns.retain(|c| !overflowed.contains(&c.id));
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::fixtures::signed_event;

    #[tokio::test]
    async fn broadcast_excludes_source_connection() {
        let b = Broadcaster::new();
        let (id1, mut rx1) = b.attach(10).await;
        let (_id2, mut rx2) = b.attach(10).await;

        let e = signed_event(1, 1, vec![], "hi");
        b.broadcast(id1, &e).await;

        assert!(rx1.try_recv().is_err());
        let got = rx2.try_recv().unwrap();
        assert_eq!(got.id, e.id);
    }

    #[tokio::test]
    async fn detach_removes_connection_from_future_broadcasts() {
        let b = Broadcaster::new();
        let (id1, _rx1) = b.attach(10).await;
        let (id2, mut rx2) = b.attach(10).await;
        b.detach(id2).await;

        let e = signed_event(1, 1, vec![], "hi");
        b.broadcast(id1, &e).await;

        assert!(rx2.try_recv().is_err());
        assert_eq!(b.connection_count().await, 1);
    }

    #[tokio::test]
    async fn full_outbound_queue_drops_the_connection() {
        let b = Broadcaster::new();
        let (id1, _rx1) = b.attach(10).await;
        let (_id2, rx2) = b.attach(1).await;
        // Don't drain rx2; fill its single-slot queue then overflow it.
        let e = signed_event(1, 1, vec![], "hi");
        b.broadcast(id1, &e).await;
        b.broadcast(id1, &e).await;

        assert_eq!(b.connection_count().await, 1);
        drop(rx2);
    }

    #[tokio::test]
    async fn fifo_delivery_order_per_connection() {
        let b = Broadcaster::new();
        let (id1, _rx1) = b.attach(10).await;
        let (_id2, mut rx2) = b.attach(10).await;

        let e1 = signed_event(100, 1, vec![], "first");
        let e2 = signed_event(200, 1, vec![], "second");
        b.broadcast(id1, &e1).await;
        b.broadcast(id1, &e2).await;

        assert_eq!(rx2.recv().await.unwrap().id, e1.id);
        assert_eq!(rx2.recv().await.unwrap().id, e2.id);
    }
}
