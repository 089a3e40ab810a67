//! Event persistence, tag indexing, filtered range queries.

use async_trait::async_trait;
use sqlx::{postgres::PgRow, Pool, Postgres, Row};

use crate::error::{RelayError, Result};
use crate::event::{Event, Tag};
use crate::filter::{Filter, SqlValue};

/// The oldest-10000-events cap on `prunable`: intended as input to the
/// prune policy, not as a general API.
const PRUNABLE_LIMIT: i64 = 10_000;

/// Relay-scoped event persistence. One implementation talks to Postgres
/// (`PgEventStore`); a second, in-memory one (`FakeEventStore`, test-only)
/// backs the pure-logic tests that exercise the connection/broadcaster/policy
/// layers without a live database.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn put(&self, relay_id: &str, event: &Event) -> Result<()>;

    /// Most-recent-first by `created_at`, tie-broken by `id` ascending.
    /// Honors `filter.limit` if present and positive; otherwise unbounded.
    async fn query(&self, relay_id: &str, filter: &Filter) -> Result<Vec<Event>>;

    async fn mark_deleted(&self, relay_id: &str, filter: &Filter) -> Result<()>;

    async fn delete(&self, relay_id: &str, filter: &Filter) -> Result<()>;

    /// Sum of `size_bytes` over all events (including soft-deleted) by
    /// `pubkey` for this relay.
    async fn storage_bytes(&self, relay_id: &str, pubkey: &str) -> Result<i64>;

    /// The oldest events by `created_at` ascending for `pubkey`, capped at
    /// 10 000 rows.
    async fn prunable(&self, relay_id: &str, pubkey: &str) -> Result<Vec<(String, i64)>>;
}

/// Schema for the relay/event/tag tables. Startup-time bootstrap
/// (`CREATE TABLE IF NOT EXISTS` + explicit indexes), not a migration
/// framework.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS relays (
    user_id TEXT NOT NULL,
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    pubkey TEXT NOT NULL DEFAULT '',
    contact TEXT NOT NULL DEFAULT '',
    active BOOLEAN NOT NULL DEFAULT true,
    meta JSONB NOT NULL DEFAULT '{}'::jsonb
);

CREATE TABLE IF NOT EXISTS events (
    relay_id TEXT NOT NULL REFERENCES relays(id),
    id TEXT NOT NULL,
    pubkey TEXT NOT NULL,
    created_at BIGINT NOT NULL,
    kind BIGINT NOT NULL,
    content TEXT NOT NULL,
    sig TEXT NOT NULL,
    size BIGINT NOT NULL,
    deleted BOOLEAN NOT NULL DEFAULT false,
    PRIMARY KEY (relay_id, id)
);

CREATE INDEX IF NOT EXISTS events_pubkey_idx ON events (relay_id, pubkey);
CREATE INDEX IF NOT EXISTS events_created_at_idx ON events (relay_id, created_at);
CREATE INDEX IF NOT EXISTS events_kind_idx ON events (relay_id, kind);

CREATE TABLE IF NOT EXISTS event_tags (
    relay_id TEXT NOT NULL,
    event_id TEXT NOT NULL,
    name TEXT NOT NULL,
    value TEXT NOT NULL,
    extra TEXT
);

CREATE INDEX IF NOT EXISTS event_tags_lookup_idx ON event_tags (relay_id, name, value);
CREATE INDEX IF NOT EXISTS event_tags_event_idx ON event_tags (relay_id, event_id);
"#;

pub struct PgEventStore {
    pool: Pool<Postgres>,
}

impl PgEventStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Create the schema if it doesn't already exist. Called once at
    /// startup, before the relay registry is loaded.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    fn row_to_event(row: &PgRow) -> Result<Event> {
        let id: String = row.try_get("id")?;
        let pubkey: String = row.try_get("pubkey")?;
        let created_at: i64 = row.try_get("created_at")?;
        let kind: i64 = row.try_get("kind")?;
        let content: String = row.try_get("content")?;
        let sig: String = row.try_get("sig")?;
        Ok(Event::new(
            id,
            pubkey,
            created_at,
            kind as u64,
            Vec::new(),
            content,
            sig,
        ))
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn put(&self, relay_id: &str, event: &Event) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO events (relay_id, id, pubkey, created_at, kind, content, sig, size, deleted)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, false)
            ON CONFLICT (relay_id, id) DO NOTHING
            "#,
        )
        .bind(relay_id)
        .bind(&event.id)
        .bind(&event.pubkey)
        .bind(event.created_at)
        .bind(event.kind as i64)
        .bind(&event.content)
        .bind(&event.sig)
        .bind(event.size_bytes)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(RelayError::Duplicate);
        }

        for tag in &event.tags {
            let name = tag.first().cloned().unwrap_or_default();
            let value = tag.get(1).cloned().unwrap_or_default();
            let extra: Option<String> = if tag.len() > 2 {
                Some(serde_json::to_string(&tag[2..]).unwrap_or_default())
            } else {
                None
            };

            sqlx::query(
                r#"
                INSERT INTO event_tags (relay_id, event_id, name, value, extra)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(relay_id)
            .bind(&event.id)
            .bind(name)
            .bind(value)
            .bind(extra)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn query(&self, relay_id: &str, filter: &Filter) -> Result<Vec<Event>> {
        let (joins, where_clauses, values) = filter.to_sql_components(relay_id, true);

        let mut sql = String::from("SELECT DISTINCT events.id, events.pubkey, events.created_at, events.kind, events.content, events.sig FROM events ");
        sql.push_str(&joins.join(" "));
        sql.push_str(" WHERE ");
        sql.push_str(&where_clauses.join(" AND "));
        sql.push_str(" ORDER BY events.created_at DESC, events.id ASC");

        if let Some(limit) = filter.limit {
            if limit > 0 {
                sql.push_str(&format!(" LIMIT {limit}"));
            }
        }

        let mut query = sqlx::query(&sql);
        for v in &values {
            query = match v {
                SqlValue::Text(s) => query.bind(s),
                SqlValue::BigInt(n) => query.bind(n),
            };
        }

        let rows = query.fetch_all(&self.pool).await?;
        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut event = Self::row_to_event(row)?;
            event.tags = fetch_tags(&self.pool, relay_id, &event.id).await?;
            events.push(event);
        }
        Ok(events)
    }

    async fn mark_deleted(&self, relay_id: &str, filter: &Filter) -> Result<()> {
        if filter.is_empty() {
            return Err(RelayError::EmptyFilter);
        }
        // Not `live_only`: marking deletion must reach rows regardless of
        // their current `deleted` state, or an already-soft-deleted row
        // can never be matched again (e.g. by a later, broader filter).
        let (joins, where_clauses, values) = filter.to_sql_components(relay_id, false);

        let mut sql = String::from("UPDATE events SET deleted = true FROM (SELECT events.id FROM events ");
        sql.push_str(&joins.join(" "));
        sql.push_str(" WHERE ");
        sql.push_str(&where_clauses.join(" AND "));
        sql.push_str(") AS matched WHERE events.id = matched.id AND events.relay_id = $1");
        // relay_id is already bound as $1 inside where_clauses' first value; reuse it.

        let mut query = sqlx::query(&sql);
        for v in &values {
            query = match v {
                SqlValue::Text(s) => query.bind(s),
                SqlValue::BigInt(n) => query.bind(n),
            };
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn delete(&self, relay_id: &str, filter: &Filter) -> Result<()> {
        if filter.is_empty() {
            return Err(RelayError::EmptyFilter);
        }
        // Not `live_only`: the prune policy (policy.rs's `admit`) deletes
        // by id from `prunable`, which counts soft-deleted rows toward
        // `storage_bytes` same as live ones — a hard delete must be able
        // to reclaim an already-soft-deleted row, not just live ones.
        let (joins, where_clauses, values) = filter.to_sql_components(relay_id, false);

        let select_ids_sql = format!(
            "SELECT events.id FROM events {} WHERE {}",
            joins.join(" "),
            where_clauses.join(" AND ")
        );

        let mut tx = self.pool.begin().await?;

        let mut id_query = sqlx::query(&select_ids_sql);
        for v in &values {
            id_query = match v {
                SqlValue::Text(s) => id_query.bind(s),
                SqlValue::BigInt(n) => id_query.bind(n),
            };
        }
        let rows = id_query.fetch_all(&mut *tx).await?;
        let ids: Vec<String> = rows
            .iter()
            .map(|r| r.try_get::<String, _>("id"))
            .collect::<std::result::Result<_, _>>()?;

        if !ids.is_empty() {
            sqlx::query("DELETE FROM event_tags WHERE relay_id = $1 AND event_id = ANY($2)")
                .bind(relay_id)
                .bind(&ids)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM events WHERE relay_id = $1 AND id = ANY($2)")
                .bind(relay_id)
                .bind(&ids)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn storage_bytes(&self, relay_id: &str, pubkey: &str) -> Result<i64> {
        let sum: Option<i64> = sqlx::query_scalar(
            "SELECT SUM(size)::bigint FROM events WHERE relay_id = $1 AND pubkey = $2",
        )
        .bind(relay_id)
        .bind(pubkey)
        .fetch_one(&self.pool)
        .await?;
        Ok(sum.unwrap_or(0))
    }

    async fn prunable(&self, relay_id: &str, pubkey: &str) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT id, size FROM events WHERE relay_id = $1 AND pubkey = $2 ORDER BY created_at ASC LIMIT $3",
        )
        .bind(relay_id)
        .bind(pubkey)
        .bind(PRUNABLE_LIMIT)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| Ok((r.try_get::<String, _>("id")?, r.try_get::<i64, _>("size")?)))
            .collect()
    }
}

async fn fetch_tags(pool: &Pool<Postgres>, relay_id: &str, event_id: &str) -> Result<Vec<Tag>> {
    let rows = sqlx::query(
        "SELECT name, value, extra FROM event_tags WHERE relay_id = $1 AND event_id = $2",
    )
    .bind(relay_id)
    .bind(event_id)
    .fetch_all(pool)
    .await?;

    let mut tags = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row.try_get("name")?;
        let value: String = row.try_get("value")?;
        let extra: Option<String> = row.try_get("extra")?;
        let mut tag = vec![name, value];
        if let Some(extra) = extra {
            if let Ok(rest) = serde_json::from_str::<Vec<String>>(&extra) {
                tag.extend(rest);
            }
        }
        tags.push(tag);
    }
    Ok(tags)
}

/// In-memory `EventStore` used by tests that don't have a live Postgres
/// available. Implements the same matching semantics as `PgEventStore` by
/// delegating to `Filter::matches`, so the match/query agreement property
/// is exercised against real code rather than restated.
#[cfg(any(test, feature = "test-fakes"))]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RelayData {
        events: Vec<(Event, bool)>, // (event, deleted)
    }

    #[derive(Default)]
    pub struct FakeEventStore {
        relays: Mutex<std::collections::HashMap<String, RelayData>>,
    }

    impl FakeEventStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn event_count(&self, relay_id: &str) -> usize {
            self.relays
                .lock()
                .unwrap()
                .get(relay_id)
                .map(|d| d.events.len())
                .unwrap_or(0)
        }
    }

    #[async_trait]
    impl EventStore for FakeEventStore {
        async fn put(&self, relay_id: &str, event: &Event) -> Result<()> {
            let mut relays = self.relays.lock().unwrap();
            let data = relays.entry(relay_id.to_string()).or_default();
            if data.events.iter().any(|(e, _)| e.id == event.id) {
                return Err(RelayError::Duplicate);
            }
            data.events.push((event.clone(), false));
            Ok(())
        }

        async fn query(&self, relay_id: &str, filter: &Filter) -> Result<Vec<Event>> {
            let relays = self.relays.lock().unwrap();
            let mut matched: Vec<Event> = relays
                .get(relay_id)
                .map(|d| {
                    d.events
                        .iter()
                        .filter(|(_, deleted)| !deleted)
                        .filter(|(e, _)| filter.matches(e))
                        .map(|(e, _)| e.clone())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();

            matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

            if let Some(limit) = filter.limit {
                if limit > 0 {
                    matched.truncate(limit as usize);
                }
            }
            Ok(matched)
        }

        async fn mark_deleted(&self, relay_id: &str, filter: &Filter) -> Result<()> {
            if filter.is_empty() {
                return Err(RelayError::EmptyFilter);
            }
            let mut relays = self.relays.lock().unwrap();
            if let Some(data) = relays.get_mut(relay_id) {
                for (event, deleted) in data.events.iter_mut() {
                    if filter.matches(event) {
                        *deleted = true;
                    }
                }
            }
            Ok(())
        }

        async fn delete(&self, relay_id: &str, filter: &Filter) -> Result<()> {
            if filter.is_empty() {
                return Err(RelayError::EmptyFilter);
            }
            let mut relays = self.relays.lock().unwrap();
            if let Some(data) = relays.get_mut(relay_id) {
                data.events.retain(|(e, _)| !filter.matches(e));
            }
            Ok(())
        }

        async fn storage_bytes(&self, relay_id: &str, pubkey: &str) -> Result<i64> {
            let relays = self.relays.lock().unwrap();
            Ok(relays
                .get(relay_id)
                .map(|d| {
                    d.events
                        .iter()
                        .filter(|(e, _)| e.pubkey == pubkey)
                        .map(|(e, _)| e.size_bytes)
                        .sum()
                })
                .unwrap_or(0))
        }

        async fn prunable(&self, relay_id: &str, pubkey: &str) -> Result<Vec<(String, i64)>> {
            let relays = self.relays.lock().unwrap();
            let mut rows: Vec<(String, i64, i64)> = relays
                .get(relay_id)
                .map(|d| {
                    d.events
                        .iter()
                        .filter(|(e, _)| e.pubkey == pubkey)
                        .map(|(e, _)| (e.id.clone(), e.size_bytes, e.created_at))
                        .collect()
                })
                .unwrap_or_default();
            rows.sort_by_key(|(_, _, created_at)| *created_at);
            rows.truncate(PRUNABLE_LIMIT as usize);
            Ok(rows.into_iter().map(|(id, size, _)| (id, size)).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeEventStore;
    use super::*;
    use crate::event::fixtures::signed_event;

    #[tokio::test]
    async fn put_then_query_roundtrips() {
        let store = FakeEventStore::new();
        let e = signed_event(100, 1, vec![], "hi");
        store.put("r1", &e).await.unwrap();

        let got = store.query("r1", &Filter::default()).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, e.id);
    }

    #[tokio::test]
    async fn put_rejects_duplicate_id() {
        let store = FakeEventStore::new();
        let e = signed_event(100, 1, vec![], "hi");
        store.put("r1", &e).await.unwrap();
        let err = store.put("r1", &e).await.unwrap_err();
        assert!(matches!(err, RelayError::Duplicate));
    }

    #[tokio::test]
    async fn query_orders_most_recent_first_tie_broken_by_id() {
        let store = FakeEventStore::new();
        let e1 = signed_event(100, 1, vec![], "a");
        let e2 = signed_event(200, 1, vec![], "b");
        let e3 = signed_event(300, 2, vec![], "c");
        store.put("r1", &e1).await.unwrap();
        store.put("r1", &e2).await.unwrap();
        store.put("r1", &e3).await.unwrap();

        let mut f = Filter::default();
        f.kinds = Some(vec![1]);
        f.limit = Some(10);
        let got = store.query("r1", &f).await.unwrap();
        assert_eq!(got.iter().map(|e| e.id.clone()).collect::<Vec<_>>(), vec![e2.id, e1.id]);
    }

    #[tokio::test]
    async fn filter_limit_caps_result_count() {
        let store = FakeEventStore::new();
        for i in 0..5 {
            store
                .put("r1", &signed_event(i, 1, vec![], "x"))
                .await
                .unwrap();
        }
        let mut f = Filter::default();
        f.limit = Some(2);
        let got = store.query("r1", &f).await.unwrap();
        assert_eq!(got.len(), 2);
    }

    #[tokio::test]
    async fn mark_deleted_hides_from_query_but_keeps_row() {
        let store = FakeEventStore::new();
        let e = signed_event(100, 1, vec![], "hi");
        store.put("r1", &e).await.unwrap();

        let mut f = Filter::default();
        f.ids = Some(vec![e.id.clone()]);
        store.mark_deleted("r1", &f).await.unwrap();

        let got = store.query("r1", &Filter::default()).await.unwrap();
        assert!(got.is_empty());
        assert_eq!(store.event_count("r1"), 1);
        assert_eq!(
            store.storage_bytes("r1", &e.pubkey).await.unwrap(),
            e.size_bytes
        );
    }

    #[tokio::test]
    async fn mark_deleted_refuses_empty_filter() {
        let store = FakeEventStore::new();
        let err = store.mark_deleted("r1", &Filter::default()).await.unwrap_err();
        assert!(matches!(err, RelayError::EmptyFilter));
    }

    #[tokio::test]
    async fn delete_refuses_empty_filter() {
        let store = FakeEventStore::new();
        let err = store.delete("r1", &Filter::default()).await.unwrap_err();
        assert!(matches!(err, RelayError::EmptyFilter));
    }

    #[tokio::test]
    async fn delete_removes_event_entirely() {
        let store = FakeEventStore::new();
        let e = signed_event(100, 1, vec![], "hi");
        store.put("r1", &e).await.unwrap();

        let mut f = Filter::default();
        f.ids = Some(vec![e.id.clone()]);
        store.delete("r1", &f).await.unwrap();

        assert_eq!(store.event_count("r1"), 0);
    }

    #[tokio::test]
    async fn storage_bytes_increases_monotonically_on_put() {
        let store = FakeEventStore::new();
        let e = signed_event(100, 1, vec![], "hello world");
        let before = store.storage_bytes("r1", &e.pubkey).await.unwrap();
        store.put("r1", &e).await.unwrap();
        let after = store.storage_bytes("r1", &e.pubkey).await.unwrap();
        assert_eq!(after, before + e.size_bytes);
    }

    #[tokio::test]
    async fn match_query_agreement() {
        let store = FakeEventStore::new();
        let kind1 = signed_event(100, 1, vec![vec!["e".into(), "abc".into()]], "a");
        let kind2 = signed_event(200, 2, vec![], "b");
        store.put("r1", &kind1).await.unwrap();
        store.put("r1", &kind2).await.unwrap();

        let filters = vec![
            Filter::default(),
            Filter {
                kinds: Some(vec![1]),
                ..Default::default()
            },
            {
                let mut f = Filter::default();
                f.tags.insert("#e".to_string(), vec!["abc".to_string()]);
                f
            },
            {
                let mut f = Filter::default();
                f.tags.insert("#e".to_string(), vec!["zzz".to_string()]);
                f
            },
        ];

        for f in &filters {
            let queried = store.query("r1", f).await.unwrap();
            let expected: Vec<&Event> = [&kind1, &kind2]
                .into_iter()
                .filter(|e| f.matches(e))
                .collect();
            assert_eq!(queried.len(), expected.len());
            for e in expected {
                assert!(queried.iter().any(|q| q.id == e.id));
            }
        }
    }
}
