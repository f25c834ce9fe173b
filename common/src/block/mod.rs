//! Blocks and the canonical serialization rules backing their hashes and
//! cooperative signatures.
//!
//! Two byte strings are derived from a block:
//! - the signature message: canonical JSON with `hash`, `signedby` and
//!   `signcounter` absent, so signatures stay valid while more of them are
//!   collected;
//! - the hash preimage: canonical JSON with only `hash` absent, so the final
//!   hash pins the collected signature set.

use crate::{
    config::{BLOCK_VERSION, GENESIS_PREV_HASH},
    crypto::{canonical_json_bytes, CryptoError},
    time::{format_compat_datetime, get_current_time_in_millis, TimestampMillis},
    transaction::{ObjectId, PoolTransaction},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Block {
    pub id: ObjectId,
    pub tenant: String,
    pub version: u32,
    pub height: u64,
    pub size: u64,
    /// Ordered transactions; absent in a genesis block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<PoolTransaction>>,
    pub settime: String,
    pub timestamp: TimestampMillis,
    #[serde(rename = "prevHash")]
    pub prev_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Node that proposed this block.
    pub miner: String,
    /// nodeName -> hex signature over the pre-signature bytes. A BTreeMap
    /// keeps the canonical form stable.
    pub signedby: BTreeMap<String, String>,
    pub signcounter: u32,
}

impl Block {
    /// A candidate at `height` extending `prev_hash`, not yet signed or
    /// sealed.
    pub fn new_candidate(
        tenant: &str,
        height: u64,
        prev_hash: &str,
        data: Vec<PoolTransaction>,
        miner: &str,
    ) -> Self {
        let now = get_current_time_in_millis();
        Self {
            id: ObjectId::generate(),
            tenant: tenant.to_string(),
            version: BLOCK_VERSION,
            height,
            size: data.len() as u64,
            data: Some(data),
            settime: format_compat_datetime(now),
            timestamp: now,
            prev_hash: prev_hash.to_string(),
            hash: None,
            miner: miner.to_string(),
            signedby: BTreeMap::new(),
            signcounter: 0,
        }
    }

    /// The unique height-0 block of a tenant. Carries no data.
    pub fn genesis(tenant: &str, miner: &str) -> Self {
        let now = get_current_time_in_millis();
        Self {
            id: ObjectId::generate(),
            tenant: tenant.to_string(),
            version: BLOCK_VERSION,
            height: 0,
            size: 0,
            data: None,
            settime: format_compat_datetime(now),
            timestamp: now,
            prev_hash: GENESIS_PREV_HASH.to_string(),
            hash: None,
            miner: miner.to_string(),
            signedby: BTreeMap::new(),
            signcounter: 0,
        }
    }

    fn to_stripped_value(&self, strip: &[&str]) -> Result<Value, CryptoError> {
        let mut value =
            serde_json::to_value(self).map_err(|e| CryptoError::Serialize(e.to_string()))?;
        if let Value::Object(map) = &mut value {
            for key in strip {
                map.remove(*key);
            }
        }
        Ok(value)
    }

    /// Canonical value signed by every cooperating node.
    pub fn presign_value(&self) -> Result<Value, CryptoError> {
        self.to_stripped_value(&["hash", "signedby", "signcounter"])
    }

    /// Canonical value the block hash is computed over.
    pub fn prehash_value(&self) -> Result<Value, CryptoError> {
        self.to_stripped_value(&["hash"])
    }

    pub fn compute_hash(&self) -> Result<String, CryptoError> {
        let bytes = canonical_json_bytes(&self.prehash_value()?)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Fill in the final hash. Call once the signature set is complete.
    pub fn seal(&mut self) -> Result<(), CryptoError> {
        let hash = self.compute_hash()?;
        self.hash = Some(hash);
        Ok(())
    }

    pub fn verify_hash(&self) -> Result<bool, CryptoError> {
        match &self.hash {
            Some(h) => Ok(*h == self.compute_hash()?),
            None => Ok(false),
        }
    }

    /// True when this block directly extends `prev`.
    pub fn extends(&self, prev: &Block) -> bool {
        self.height == prev.height + 1 && Some(&self.prev_hash) == prev.hash.as_ref()
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0
    }

    /// Ids of the embedded transactions.
    pub fn tx_ids(&self) -> Vec<ObjectId> {
        self.data
            .as_ref()
            .map(|txs| txs.iter().map(|tx| tx.id).collect())
            .unwrap_or_default()
    }

    /// Serialized byte size of the embedded transactions, the quantity
    /// cursor size constraints are measured against.
    pub fn data_size(&self) -> usize {
        self.data
            .as_ref()
            .and_then(|d| serde_json::to_vec(d).ok())
            .map(|v| v.len())
            .unwrap_or(0)
    }

    pub fn contains_tx(&self, id: &ObjectId) -> bool {
        self.data
            .as_ref()
            .map(|txs| txs.iter().any(|tx| tx.id == *id))
            .unwrap_or(false)
    }
}

impl Display for Block {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block[height: {}, tenant: {}, txs: {}, miner: {}, signatures: {}]",
            self.height,
            self.tenant,
            self.size,
            self.miner,
            self.signcounter
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crypto::Ed25519KeyPair, transaction::{SetTime, TxKind}};
    use serde_json::json;

    fn sample_tx(desc: &str) -> PoolTransaction {
        PoolTransaction {
            id: ObjectId::generate(),
            tenant: "t1".to_string(),
            kind: TxKind::New,
            settime: SetTime::Millis(1_700_000_000_000),
            prev_id: None,
            delivery_f: true,
            data: json!({"desc": desc}),
        }
    }

    fn sample_block() -> Block {
        Block::new_candidate(
            "t1",
            1,
            GENESIS_PREV_HASH,
            vec![sample_tx("a"), sample_tx("b")],
            "node1",
        )
    }

    #[test]
    fn test_hash_is_deterministic() {
        let block = sample_block();
        assert_eq!(block.compute_hash().unwrap(), block.compute_hash().unwrap());
    }

    #[test]
    fn test_hash_changes_with_content() {
        let block = sample_block();
        let mut other = block.clone();
        other.height = 2;
        assert_ne!(block.compute_hash().unwrap(), other.compute_hash().unwrap());
    }

    #[test]
    fn test_seal_then_verify() {
        let mut block = sample_block();
        block.seal().unwrap();
        assert!(block.verify_hash().unwrap());

        // any later mutation invalidates the hash
        block.signcounter += 1;
        assert!(!block.verify_hash().unwrap());
    }

    #[test]
    fn test_signature_survives_more_signers() {
        let keypair = Ed25519KeyPair::generate();
        let mut block = sample_block();

        let sig = keypair.sign_json(&block.presign_value().unwrap()).unwrap();
        block.signedby.insert("node1".to_string(), sig.clone());
        block.signcounter = 1;

        // a second signer does not disturb the first signature's message
        block
            .signedby
            .insert("node2".to_string(), "00".repeat(64));
        block.signcounter = 2;

        assert!(keypair
            .public_key()
            .verify_json(&sig, &block.presign_value().unwrap())
            .unwrap());
    }

    #[test]
    fn test_hash_covers_signatures() {
        let mut block = sample_block();
        block.seal().unwrap();
        let sealed = block.hash.clone().unwrap();

        let mut signed = sample_block();
        signed.id = block.id;
        signed.settime = block.settime.clone();
        signed.timestamp = block.timestamp;
        signed.data = block.data.clone();
        signed.signedby.insert("node2".to_string(), "ab".repeat(64));
        signed.signcounter = 1;
        signed.seal().unwrap();

        assert_ne!(sealed, signed.hash.unwrap());
    }

    #[test]
    fn test_extends() {
        let mut genesis = Block::genesis("t1", "node1");
        genesis.seal().unwrap();

        let next = Block::new_candidate(
            "t1",
            1,
            genesis.hash.as_ref().unwrap(),
            vec![sample_tx("a")],
            "node1",
        );
        assert!(next.extends(&genesis));

        let skipped = Block::new_candidate(
            "t1",
            2,
            genesis.hash.as_ref().unwrap(),
            vec![],
            "node1",
        );
        assert!(!skipped.extends(&genesis));
    }

    #[test]
    fn test_genesis_has_no_data() {
        let genesis = Block::genesis("t1", "node1");
        let v = serde_json::to_value(&genesis).unwrap();
        assert!(v.get("data").is_none());
        assert!(genesis.is_genesis());
    }

    #[test]
    fn test_presign_strips_signature_fields() {
        let mut block = sample_block();
        block.signedby.insert("node1".to_string(), "ff".repeat(64));
        block.signcounter = 1;
        block.hash = Some("aa".repeat(32));

        let v = block.presign_value().unwrap();
        assert!(v.get("hash").is_none());
        assert!(v.get("signedby").is_none());
        assert!(v.get("signcounter").is_none());
        assert!(v.get("prevHash").is_some());

        let h = block.prehash_value().unwrap();
        assert!(h.get("hash").is_none());
        assert!(h.get("signedby").is_some());
    }
}
