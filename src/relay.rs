//! Relay configuration and the per-process registry of logical relays.
//!
//! A single process hosts multiple relays, each identified by `id` and
//! resolved from the URL path at WebSocket-upgrade time — there is no
//! hardcoded default relay identity; the id is always explicit.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::{Pool, Postgres, Row};
use tokio::sync::RwLock;

use crate::broadcaster::Broadcaster;
use crate::error::Result;
use crate::policy::{RelayPolicy, RelaySpec};

/// Id of the relay served at `/` when the URL path carries no explicit
/// relay segment.
pub const DEFAULT_RELAY_ID: &str = "default";

/// `(id, name, description, pubkey, contact, active, spec)` — matches the
/// `relays` table. CRUD over this type is out of scope; the core only
/// reads it.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub id: String,
    pub name: String,
    pub description: String,
    pub pubkey: String,
    pub contact: String,
    pub active: bool,
    pub spec: RelaySpec,
}

impl RelayConfig {
    /// The capabilities payload returned from the `Accept:
    /// application/nostr+json` info endpoint.
    pub fn info_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "description": self.description,
            "pubkey": self.pubkey,
            "contact": self.contact,
            "supported_nips": [1, 9, 11, 40],
            "software": "nostr-relay-core",
            "version": env!("CARGO_PKG_VERSION"),
        })
    }
}

/// Everything a connection needs for the relay it was upgraded against:
/// its config/policy and its broadcaster. The store is shared across all
/// relays (it is relay-scoped by an explicit `relay_id` parameter on every
/// call, not by a separate connection pool).
pub struct RelayContext {
    pub config: RelayConfig,
    pub policy: RelayPolicy,
    pub broadcaster: Broadcaster,
}

/// Tracks all active relays for this process. Looked up once per
/// WebSocket upgrade by the relay id in the URL path.
#[derive(Clone, Default)]
pub struct RelayRegistry {
    relays: Arc<RwLock<HashMap<String, Arc<RelayContext>>>>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, config: RelayConfig) -> Arc<RelayContext> {
        let ctx = Arc::new(RelayContext {
            policy: RelayPolicy::new(config.spec.clone()),
            broadcaster: Broadcaster::new(),
            config,
        });
        self.relays
            .write()
            .await
            .insert(ctx.config.id.clone(), ctx.clone());
        ctx
    }

    pub async fn get(&self, relay_id: &str) -> Option<Arc<RelayContext>> {
        self.relays.read().await.get(relay_id).cloned()
    }

    pub async fn relay_ids(&self) -> Vec<String> {
        self.relays.read().await.keys().cloned().collect()
    }
}

/// Read every active relay's config from the `relays` table, parsing
/// `meta` into a `RelaySpec` — the generalization of `crud.py`'s
/// `get_config_for_all_active_relays` to a registry the connection layer
/// can resolve by URL path instead of a single hardcoded relay id.
pub async fn load_active_relays(pool: &Pool<Postgres>) -> Result<Vec<RelayConfig>> {
    let rows = sqlx::query(
        "SELECT id, name, description, pubkey, contact, active, meta FROM relays WHERE active = true",
    )
    .fetch_all(pool)
    .await?;

    let mut configs = Vec::with_capacity(rows.len());
    for row in rows {
        let meta: serde_json::Value = row.try_get("meta")?;
        let spec: RelaySpec = serde_json::from_value(meta).unwrap_or_default();
        configs.push(RelayConfig {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            pubkey: row.try_get("pubkey")?,
            contact: row.try_get("contact")?,
            active: row.try_get("active")?,
            spec,
        });
    }
    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config(id: &str) -> RelayConfig {
        RelayConfig {
            id: id.to_string(),
            name: "Test Relay".to_string(),
            description: "a relay".to_string(),
            pubkey: "ab".repeat(32),
            contact: "admin@example.com".to_string(),
            active: true,
            spec: RelaySpec::default(),
        }
    }

    #[tokio::test]
    async fn registry_resolves_relay_by_id() {
        let registry = RelayRegistry::new();
        registry.insert(sample_config("r1")).await;
        registry.insert(sample_config("r2")).await;

        assert!(registry.get("r1").await.is_some());
        assert!(registry.get("missing").await.is_none());
        assert_eq!(registry.relay_ids().await.len(), 2);
    }

    #[test]
    fn info_json_carries_relay_identity() {
        let config = sample_config("r1");
        let info = config.info_json();
        assert_eq!(info["id"], "r1");
        assert_eq!(info["name"], "Test Relay");
    }
}
