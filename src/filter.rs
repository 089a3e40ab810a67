//! Filter representation, live-match evaluation, and storage query lowering.
//!
//! `matches` and `to_sql_components` must agree: an event is returned by the
//! storage query for a filter if and only if `matches` is true for it. See
//! `src/store.rs`'s `match_query_agreement` test for the property check.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::event::Event;

/// A conjunction of optional predicates. Any subset may be populated; an
/// absent predicate imposes no constraint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,

    /// `#<letter>` predicates, e.g. `{"e": ["abc"]}` for an `#e` filter.
    /// Flattened into the wire object's `#e`, `#p`, ... keys.
    #[serde(flatten)]
    pub tags: HashMap<String, Vec<String>>,

    /// Assigned when this filter is installed for live delivery. Not part
    /// of the wire filter object; set by the connection layer.
    #[serde(skip)]
    pub subscription_id: Option<String>,
}

impl Filter {
    pub fn is_empty(&self) -> bool {
        self.ids.is_none()
            && self.authors.is_none()
            && self.kinds.is_none()
            && self.since.is_none()
            && self.until.is_none()
            && self.tags.is_empty()
    }

    /// True when `event` satisfies every populated predicate.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|prefix| event.id.starts_with(prefix)) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors
                .iter()
                .any(|prefix| event.pubkey.starts_with(prefix))
            {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        for (letter, values) in &self.tags {
            let letter = letter.strip_prefix('#').unwrap_or(letter);
            let accepted: HashSet<&str> = values.iter().map(String::as_str).collect();
            let has_match = event.tags.iter().any(|tag| {
                tag.first().map(String::as_str) == Some(letter)
                    && tag.get(1).map(|v| accepted.contains(v.as_str())) == Some(true)
            });
            if !has_match {
                return false;
            }
        }
        true
    }

    /// Lower this filter to `(inner_joins, where_clauses, bind_values)`
    /// against a relay-scoped `events`/`event_tags` schema, using `$N`
    /// positional placeholders. One inner join per `#<letter>` predicate,
    /// with bound values throughout rather than inline string interpolation.
    ///
    /// `live_only` adds `events.deleted = false`, matching `query`'s
    /// contract (`E ∈ query(F) ⇔ matches(F, E) ∧ ¬E.deleted`) — `matches`
    /// itself never inspects `deleted`, so callers that want to affect
    /// already-deleted rows (`mark_deleted`, `delete`) must pass `false`
    /// here or they would never be able to touch a row twice.
    pub fn to_sql_components(
        &self,
        relay_id: &str,
        live_only: bool,
    ) -> (Vec<String>, Vec<String>, Vec<SqlValue>) {
        let mut joins = Vec::new();
        let mut clauses = vec!["events.relay_id = $1".to_string()];
        let mut values = vec![SqlValue::Text(relay_id.to_string())];

        let bind = |v: SqlValue, values: &mut Vec<SqlValue>| -> usize {
            values.push(v);
            values.len()
        };

        if live_only {
            clauses.push("events.deleted = false".to_string());
        }

        // A populated-but-empty predicate (e.g. `{"ids": []}`) matches no
        // event under `matches` (an `any()` over an empty set is always
        // false), so the lowered query must be equally unsatisfiable
        // rather than silently dropping the constraint.
        if let Some(ids) = &self.ids {
            if ids.is_empty() {
                clauses.push("(false)".to_string());
            } else {
                let mut ors = Vec::new();
                for prefix in ids {
                    let n = bind(SqlValue::Text(prefix.clone()), &mut values);
                    ors.push(format!("events.id LIKE ${n} || '%'"));
                }
                clauses.push(format!("({})", ors.join(" OR ")));
            }
        }

        if let Some(authors) = &self.authors {
            if authors.is_empty() {
                clauses.push("(false)".to_string());
            } else {
                let mut ors = Vec::new();
                for prefix in authors {
                    let n = bind(SqlValue::Text(prefix.clone()), &mut values);
                    ors.push(format!("events.pubkey LIKE ${n} || '%'"));
                }
                clauses.push(format!("({})", ors.join(" OR ")));
            }
        }

        if let Some(kinds) = &self.kinds {
            if kinds.is_empty() {
                clauses.push("(false)".to_string());
            } else {
                let mut ors = Vec::new();
                for kind in kinds {
                    let n = bind(SqlValue::BigInt(*kind as i64), &mut values);
                    ors.push(format!("events.kind = ${n}"));
                }
                clauses.push(format!("({})", ors.join(" OR ")));
            }
        }

        if let Some(since) = self.since {
            let n = bind(SqlValue::BigInt(since), &mut values);
            clauses.push(format!("events.created_at >= ${n}"));
        }
        if let Some(until) = self.until {
            let n = bind(SqlValue::BigInt(until), &mut values);
            clauses.push(format!("events.created_at <= ${n}"));
        }

        for (idx, (letter, vals)) in self.tags.iter().enumerate() {
            let letter = letter.strip_prefix('#').unwrap_or(letter);
            if vals.is_empty() {
                // Same reasoning as the `ids`/`authors`/`kinds` predicates
                // above: an empty value set can never match, so no join is
                // needed — just an unsatisfiable clause.
                clauses.push("(false)".to_string());
                continue;
            }
            let alias = format!("t{idx}");
            let name_n = bind(SqlValue::Text(letter.to_string()), &mut values);
            joins.push(format!(
                "INNER JOIN event_tags {alias} ON {alias}.relay_id = events.relay_id AND {alias}.event_id = events.id AND {alias}.name = ${name_n}"
            ));
            let mut ors = Vec::new();
            for v in vals {
                let n = bind(SqlValue::Text(v.clone()), &mut values);
                ors.push(format!("{alias}.value = ${n}"));
            }
            clauses.push(format!("({})", ors.join(" OR ")));
        }

        (joins, clauses, values)
    }
}

/// A bound value for the `to_sql_components` lowering. Kept as a small enum
/// rather than a trait object so the store layer can bind each variant with
/// `sqlx`'s typed `.bind()` without a dynamic-dispatch encoder.
#[derive(Debug, Clone)]
pub enum SqlValue {
    Text(String),
    BigInt(i64),
}
