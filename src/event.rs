//! Event model: canonicalization, content-addressed id, Schnorr verification.

use secp256k1::{schnorr, Message, Secp256k1, Signing, Verification, XOnlyPublicKey};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{RelayError, Result};

/// A single tag row: `[name, value, ...extra]`.
pub type Tag = Vec<String>;

/// Signed, content-addressed protocol record.
///
/// `id`/`pubkey`/`sig` are kept as lowercase hex strings rather than typed
/// byte wrappers: the whole point of this module is to own the
/// canonicalization/hashing/verification engineering, not delegate it to a
/// crate that already did it for us.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u64,
    pub tags: Vec<Tag>,
    pub content: String,
    pub sig: String,

    /// Storage-accounting size in bytes. Derived, not authenticated: it is
    /// never part of the canonical serialization and never transmitted.
    #[serde(skip)]
    pub size_bytes: i64,
}

/// Mirrors `Event`'s wire fields, minus `size_bytes`, which has no wire
/// representation and must be recomputed on every deserialization rather
/// than defaulted — see `Event`'s manual `Deserialize` impl below.
#[derive(Deserialize)]
struct EventWire {
    id: String,
    pubkey: String,
    created_at: i64,
    kind: u64,
    tags: Vec<Tag>,
    content: String,
    sig: String,
}

impl<'de> Deserialize<'de> for Event {
    /// Deserializing directly via `#[derive(Deserialize)]` would leave
    /// `size_bytes` at its `#[serde(skip)]` default of `0` for every
    /// wire-admitted event, which would make the quota/prune policy inert.
    /// Route through `Event::new` instead, which computes it from the wire
    /// form's byte length.
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let wire = EventWire::deserialize(deserializer)?;
        Ok(Event::new(
            wire.id,
            wire.pubkey,
            wire.created_at,
            wire.kind,
            wire.tags,
            wire.content,
            wire.sig,
        ))
    }
}

impl Event {
    /// Build an `Event` from wire fields, computing `size_bytes`. Does not
    /// verify the id or signature — call [`Event::verify`] for that.
    pub fn new(
        id: String,
        pubkey: String,
        created_at: i64,
        kind: u64,
        tags: Vec<Tag>,
        content: String,
        sig: String,
    ) -> Self {
        let mut event = Event {
            id,
            pubkey,
            created_at,
            kind,
            tags,
            content,
            sig,
            size_bytes: 0,
        };
        event.size_bytes = event.wire_json().len() as i64;
        event
    }

    /// The six-element canonical array used to compute `id`: `[0, pubkey,
    /// created_at, kind, tags, content]`, serialized with no insignificant
    /// whitespace. `serde_json`'s default `Serializer` already produces
    /// compact output with the escaping rules the protocol requires.
    fn canonical_json(&self) -> String {
        let arr = Value::Array(vec![
            Value::from(0),
            Value::String(self.pubkey.clone()),
            Value::from(self.created_at),
            Value::from(self.kind),
            serde_json::to_value(&self.tags).unwrap_or(Value::Null),
            Value::String(self.content.clone()),
        ]);
        arr.to_string()
    }

    /// The compact wire-form JSON object, used only for storage accounting.
    fn wire_json(&self) -> String {
        serde_json::json!({
            "id": self.id,
            "pubkey": self.pubkey,
            "created_at": self.created_at,
            "kind": self.kind,
            "tags": self.tags,
            "content": self.content,
            "sig": self.sig,
        })
        .to_string()
    }

    /// SHA-256 of the canonical serialization, as lowercase hex.
    pub fn compute_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_json().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Recompute the id and check it against the advertised id
    /// (case-insensitive), then verify the Schnorr signature over the id
    /// bytes under the x-only pubkey.
    pub fn verify(&self) -> Result<()> {
        let computed = self.compute_id();
        if !computed.eq_ignore_ascii_case(&self.id) {
            return Err(RelayError::BadId);
        }

        let id_bytes = hex::decode(&self.id)
            .map_err(|e| RelayError::BadSignature(format!("bad id hex: {e}")))?;
        let msg = Message::from_slice(&id_bytes)
            .map_err(|e| RelayError::BadSignature(format!("bad id length: {e}")))?;

        let pubkey = XOnlyPublicKey::from_slice(
            &hex::decode(&self.pubkey)
                .map_err(|e| RelayError::BadSignature(format!("bad pubkey hex: {e}")))?,
        )
        .map_err(|e| RelayError::BadSignature(format!("bad pubkey: {e}")))?;

        let sig = schnorr::Signature::from_slice(
            &hex::decode(&self.sig)
                .map_err(|e| RelayError::BadSignature(format!("bad sig hex: {e}")))?,
        )
        .map_err(|e| RelayError::BadSignature(format!("bad sig: {e}")))?;

        let secp = Secp256k1::verification_only();
        verify_schnorr(&secp, &sig, &msg, &pubkey)
            .map_err(|e| RelayError::BadSignature(e.to_string()))
    }

    /// Whether this event is soft-deletable/hard-deletable by `pubkey`
    /// (used by the kind-5 deletion path: a client may only delete its own
    /// events).
    pub fn is_authored_by(&self, pubkey: &str) -> bool {
        self.pubkey.eq_ignore_ascii_case(pubkey)
    }

    /// The referenced event ids from this event's `e` tags, in order.
    pub fn referenced_event_ids(&self) -> Vec<String> {
        self.tags
            .iter()
            .filter(|t| t.first().map(|s| s.as_str()) == Some("e"))
            .filter_map(|t| t.get(1).cloned())
            .collect()
    }

    pub fn is_deletion(&self) -> bool {
        self.kind == 5
    }
}

fn verify_schnorr<C: Verification>(
    secp: &Secp256k1<C>,
    sig: &schnorr::Signature,
    msg: &Message,
    pubkey: &XOnlyPublicKey,
) -> std::result::Result<(), secp256k1::Error> {
    secp.verify_schnorr(sig, msg, pubkey)
}
