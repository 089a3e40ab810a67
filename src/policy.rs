//! Relay policy: per-kind size caps, per-pubkey storage quota, prune, and
//! the kind-5 deletion side effect.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::event::Event;
use crate::filter::Filter;
use crate::store::EventStore;

/// Default maximum size, in bytes, for an event whose kind has no entry in
/// `max_event_bytes_by_kind`.
const DEFAULT_MAX_EVENT_BYTES: i64 = 64 * 1024;

/// Per-relay quota policy, persisted as the `relays.meta` JSON blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySpec {
    /// Total bytes a single pubkey may occupy on this relay.
    pub pubkey_quota_bytes: i64,
    /// Per-kind maximum event size; falls back to `DEFAULT_MAX_EVENT_BYTES`
    /// for kinds not listed here.
    #[serde(default)]
    pub max_event_bytes_by_kind: HashMap<u64, i64>,
    #[serde(default = "default_true")]
    pub prune_enabled: bool,
    /// Bound on each connection's outbound delivery queue; overflow closes
    /// the connection rather than blocking the broadcaster.
    #[serde(default = "default_queue_bound")]
    pub outbound_queue_bound: usize,
}

fn default_true() -> bool {
    true
}

fn default_queue_bound() -> usize {
    100
}

impl Default for RelaySpec {
    fn default() -> Self {
        Self {
            pubkey_quota_bytes: 50 * 1024 * 1024,
            max_event_bytes_by_kind: HashMap::new(),
            prune_enabled: true,
            outbound_queue_bound: default_queue_bound(),
        }
    }
}

impl RelaySpec {
    fn max_bytes_for_kind(&self, kind: u64) -> i64 {
        self.max_event_bytes_by_kind
            .get(&kind)
            .copied()
            .unwrap_or(DEFAULT_MAX_EVENT_BYTES)
    }
}

pub struct RelayPolicy {
    spec: RelaySpec,
}

impl RelayPolicy {
    pub fn new(spec: RelaySpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &RelaySpec {
        &self.spec
    }

    /// Admit `event` for persistence: reject oversize events, then enforce
    /// the pubkey's storage quota (pruning the oldest events first, if
    /// enabled). Does not persist the event itself; the caller calls
    /// `store.put` once this returns `Ok`.
    pub async fn admit(
        &self,
        store: &dyn EventStore,
        relay_id: &str,
        event: &Event,
    ) -> Result<()> {
        let max_bytes = self.spec.max_bytes_for_kind(event.kind);
        if event.size_bytes > max_bytes {
            return Err(RelayError::QuotaExceeded);
        }

        let used = store.storage_bytes(relay_id, &event.pubkey).await?;
        let projected = used + event.size_bytes;
        if projected <= self.spec.pubkey_quota_bytes {
            return Ok(());
        }

        if !self.spec.prune_enabled {
            return Err(RelayError::QuotaExceeded);
        }

        let deficit = projected - self.spec.pubkey_quota_bytes;
        let prunable = store.prunable(relay_id, &event.pubkey).await?;

        let mut to_prune = Vec::new();
        let mut reclaimed = 0i64;
        for (id, size) in prunable {
            to_prune.push(id);
            reclaimed += size;
            if reclaimed >= deficit {
                break;
            }
        }

        if !to_prune.is_empty() {
            // `prunable`/`storage_bytes` count soft-deleted rows the same
            // as live ones, so `delete` must be able to hard-delete an
            // already-soft-deleted row here too, or pruning under-reclaims
            // and this event gets rejected even though `apply_deletion`
            // already relinquished that storage.
            let filter = Filter {
                ids: Some(to_prune),
                ..Default::default()
            };
            store.delete(relay_id, &filter).await?;
        }

        let used_after = store.storage_bytes(relay_id, &event.pubkey).await?;
        if used_after + event.size_bytes > self.spec.pubkey_quota_bytes {
            return Err(RelayError::QuotaExceeded);
        }

        Ok(())
    }

    /// NIP-09-style deletion: an event of kind 5 deletes the events named
    /// by its `e` tags, restricted to events authored by the same pubkey —
    /// a client may only delete its own events.
    pub async fn apply_deletion(
        &self,
        store: &dyn EventStore,
        relay_id: &str,
        event: &Event,
    ) -> Result<()> {
        if !event.is_deletion() {
            return Ok(());
        }
        let ids = event.referenced_event_ids();
        if ids.is_empty() {
            return Ok(());
        }
        let filter = Filter {
            ids: Some(ids),
            authors: Some(vec![event.pubkey.clone()]),
            ..Default::default()
        };
        store.mark_deleted(relay_id, &filter).await
    }
}
