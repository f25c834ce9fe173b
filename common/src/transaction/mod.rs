//! Pool transactions and their 24-hex object ids.

use crate::{
    config::{PUBKEY_TAG, PUBKEY_TAG_KEY},
    time::{format_compat_datetime, get_current_time_in_millis, TimestampMillis},
};
use lazy_static::lazy_static;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicU32, Ordering},
};
use thiserror::Error;

pub const OBJECT_ID_SIZE: usize = 12;

lazy_static! {
    // Per-process entropy and a rolling counter, so ids generated in the
    // same second stay distinct and roughly monotonic
    static ref PROCESS_RANDOM: [u8; 5] = {
        let mut bytes = [0u8; 5];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes
    };
    static ref OID_COUNTER: AtomicU32 = AtomicU32::new(rand::thread_rng().next_u32());
}

#[derive(Error, Debug, Clone)]
pub enum ObjectIdError {
    #[error("Expected 24 hex characters, got {0}")]
    InvalidLength(usize),

    #[error("Invalid hex string: {0}")]
    InvalidHex(String),
}

/// Content-addressed 24-hex identifier: 4 bytes of unix seconds, 5 bytes of
/// per-process randomness, 3 bytes of counter. Byte order equals id order,
/// which makes it usable as a cursor key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; OBJECT_ID_SIZE]);

impl ObjectId {
    pub fn generate() -> Self {
        let secs = (get_current_time_in_millis() / 1000) as u32;
        let counter = OID_COUNTER.fetch_add(1, Ordering::Relaxed);

        let mut bytes = [0u8; OBJECT_ID_SIZE];
        bytes[0..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(&*PROCESS_RANDOM);
        bytes[9..12].copy_from_slice(&counter.to_be_bytes()[1..4]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; OBJECT_ID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, ObjectIdError> {
        if slice.len() != OBJECT_ID_SIZE {
            return Err(ObjectIdError::InvalidLength(slice.len() * 2));
        }
        let mut bytes = [0u8; OBJECT_ID_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, ObjectIdError> {
        if hex_str.len() != OBJECT_ID_SIZE * 2 {
            return Err(ObjectIdError::InvalidLength(hex_str.len()));
        }
        let bytes =
            hex::decode(hex_str).map_err(|e| ObjectIdError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; OBJECT_ID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The embedded creation time, seconds precision.
    pub fn timestamp_millis(&self) -> TimestampMillis {
        let mut secs = [0u8; 4];
        secs.copy_from_slice(&self.0[0..4]);
        u32::from_be_bytes(secs) as TimestampMillis * 1000
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = ObjectIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for ObjectId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// What a transaction does to its chain of predecessors.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    New,
    Update,
    Delete,
}

impl TxKind {
    pub fn requires_prev_id(&self) -> bool {
        matches!(self, Self::Update | Self::Delete)
    }
}

impl FromStr for TxKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            _ => Err(()),
        }
    }
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{}", s)
    }
}

/// Creation time of a transaction: unix millis, or a locale formatted string
/// when the client posted with `compatDateTime`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum SetTime {
    Millis(TimestampMillis),
    Formatted(String),
}

impl SetTime {
    pub fn now(compat_datetime: bool) -> Self {
        let millis = get_current_time_in_millis();
        if compat_datetime {
            Self::Formatted(format_compat_datetime(millis))
        } else {
            Self::Millis(millis)
        }
    }
}

/// A pooled (not yet blocked) transaction.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PoolTransaction {
    pub id: ObjectId,
    pub tenant: String,
    #[serde(rename = "type")]
    pub kind: TxKind,
    pub settime: SetTime,
    #[serde(rename = "prevId", default, skip_serializing_if = "Option::is_none")]
    pub prev_id: Option<ObjectId>,
    #[serde(rename = "deliveryF")]
    pub delivery_f: bool,
    pub data: Value,
}

impl PoolTransaction {
    /// Serialized byte size of the user payload, the quantity the 15 MiB cap
    /// and cursor size constraints are measured against.
    pub fn data_size(&self) -> usize {
        serde_json::to_vec(&self.data).map(|v| v.len()).unwrap_or(0)
    }

    /// Strict matcher: equality on `data[key]`.
    pub fn matches_strict(&self, key: &str, value: &Value) -> bool {
        self.data.get(key) == Some(value)
    }

    /// True when this transaction publishes a node verification key.
    pub fn is_pubkey_entry(&self) -> bool {
        self.data.get(PUBKEY_TAG_KEY).and_then(Value::as_str) == Some(PUBKEY_TAG)
    }
}

impl fmt::Display for PoolTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tx[id: {}, tenant: {}, type: {}, deliveryF: {}]",
            self.id, self.tenant, self.kind, self.delivery_f
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_tx(data: Value) -> PoolTransaction {
        PoolTransaction {
            id: ObjectId::generate(),
            tenant: "8c8e794a-5528-4e95-a8cd-b2a6b0ed54b1".to_string(),
            kind: TxKind::New,
            settime: SetTime::now(false),
            prev_id: None,
            delivery_f: false,
            data,
        }
    }

    #[test]
    fn test_generated_ids_are_unique_and_ordered() {
        let a = ObjectId::generate();
        let b = ObjectId::generate();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_oid_hex_roundtrip() {
        let id = ObjectId::generate();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 24);
        assert_eq!(ObjectId::from_hex(&hex).unwrap(), id);
    }

    #[test]
    fn test_oid_rejects_bad_input() {
        assert!(ObjectId::from_hex("abc").is_err());
        assert!(ObjectId::from_hex("zz8e794a55284e95a8cdb2a6").is_err());
    }

    #[test]
    fn test_tx_wire_field_names() {
        let mut tx = sample_tx(json!({"desc": "test"}));
        tx.kind = TxKind::Update;
        tx.prev_id = Some(ObjectId::generate());

        let v = serde_json::to_value(&tx).unwrap();
        assert!(v.get("type").is_some());
        assert!(v.get("prevId").is_some());
        assert!(v.get("deliveryF").is_some());
        assert!(v.get("prev_id").is_none());
    }

    #[test]
    fn test_absent_prev_id_is_omitted() {
        let tx = sample_tx(json!({}));
        let v = serde_json::to_value(&tx).unwrap();
        assert!(v.get("prevId").is_none());
    }

    #[test]
    fn test_settime_untagged_roundtrip() {
        let millis: SetTime = serde_json::from_str("1700000000000").unwrap();
        assert_eq!(millis, SetTime::Millis(1_700_000_000_000));

        let formatted: SetTime = serde_json::from_str("\"2023/11/15 00:00:00\"").unwrap();
        assert!(matches!(formatted, SetTime::Formatted(_)));
    }

    #[test]
    fn test_strict_matcher() {
        let tx = sample_tx(json!({"desc": "test", "n": 5}));
        assert!(tx.matches_strict("desc", &json!("test")));
        assert!(tx.matches_strict("n", &json!(5)));
        assert!(!tx.matches_strict("desc", &json!("other")));
        assert!(!tx.matches_strict("missing", &json!("test")));
    }

    #[test]
    fn test_pubkey_entry_detection() {
        let plain = sample_tx(json!({"desc": "test"}));
        assert!(!plain.is_pubkey_entry());

        let entry = sample_tx(json!({
            "cc_tx": "system.v3.keyring.config.pubkey",
            "nodeName": "node1",
        }));
        assert!(entry.is_pubkey_entry());
    }
}
