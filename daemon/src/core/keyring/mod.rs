//! Node identity keys and the on-chain public key directory.
//!
//! Every node publishes its verification key as an ordinary transaction in
//! the reserved (administration) tenant; the cache is rebuilt from the chain
//! itself, so a node that was offline when a peer joined still learns its
//! key on the next resync.

use crate::config::KeyringConfig;
use crate::core::CoreContext;
use casualchain_common::{
    config::{PUBKEY_TAG, PUBKEY_TAG_KEY},
    crypto::{Ed25519KeyPair, Ed25519PublicKey, PublicKeyEntry},
    error::{ErrorKind, ModuleError, Result},
    transaction::{ObjectId, PoolTransaction, SetTime, TxKind},
};
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::{collections::HashMap, path::Path};
use tokio::sync::RwLock;

pub struct Keyring {
    node_name: String,
    keypair: Ed25519KeyPair,
    verify_key_pem: String,
    verify_key_hex: String,
    cache: RwLock<HashMap<String, Ed25519PublicKey>>,
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyring")
            .field("node_name", &self.node_name)
            .field("verify_key_hex", &self.verify_key_hex)
            .finish_non_exhaustive()
    }
}

impl Keyring {
    /// Load the signing key, generating a fresh pair when permitted.
    /// Failure here is startup-fatal.
    pub fn init(config: &KeyringConfig, node_name: &str) -> Result<Self> {
        let sign_path = Path::new(&config.sign_key_file);
        let keypair = if sign_path.exists() {
            let pem = std::fs::read_to_string(sign_path).map_err(|e| {
                ModuleError::internal("keyring", "init", format!("read sign key: {}", e))
            })?;
            Ed25519KeyPair::from_pkcs8_pem(&pem).map_err(|e| {
                ModuleError::internal("keyring", "init", format!("parse sign key: {}", e))
            })?
        } else if config.create_keys_if_no_sign_key_exists {
            info!("no signing key at {}, generating a new pair", config.sign_key_file);
            let keypair = Ed25519KeyPair::generate();
            write_key_files(config, &keypair)?;
            keypair
        } else {
            return Err(ModuleError::new(
                ErrorKind::NotFound,
                "keyring",
                "init",
                "SignKeyFile",
                format!("{} is missing and key creation is disabled", config.sign_key_file),
            ));
        };

        let public = keypair.public_key();
        let verify_key_pem = public
            .to_pem()
            .map_err(|e| ModuleError::internal("keyring", "init", e.to_string()))?;
        let verify_key_hex = public.to_hex();

        let mut cache = HashMap::new();
        cache.insert(node_name.to_string(), public);

        Ok(Self {
            node_name: node_name.to_string(),
            keypair,
            verify_key_pem,
            verify_key_hex,
            cache: RwLock::new(cache),
        })
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn self_entry(&self) -> PublicKeyEntry {
        PublicKeyEntry {
            node_name: self.node_name.clone(),
            verify_key: self.verify_key_pem.clone(),
            verify_key_hex: self.verify_key_hex.clone(),
        }
    }

    /// Sign the canonical JSON of `target`; returns hex.
    pub fn sign_by_private_key(&self, target: &Value) -> Result<String> {
        self.keypair
            .sign_json(target)
            .map_err(|e| ModuleError::internal("keyring", "sign_by_private_key", e.to_string()))
    }

    /// Verify a signature made with this node's own key (admin tokens).
    pub fn verify_with_own_key(&self, sig: &str, target: &Value) -> Result<bool> {
        self.keypair
            .public_key()
            .verify_json(sig, target)
            .map_err(|e| {
                ModuleError::new(
                    ErrorKind::SignatureRejected,
                    "keyring",
                    "verify_with_own_key",
                    "VerificationError",
                    e.to_string(),
                )
            })
    }

    /// Verify `sig` over `target` against the published key of `node_name`.
    /// A cache miss triggers one refresh from the chain before giving up.
    pub async fn verify_by_public_key(
        &self,
        ctx: &CoreContext,
        sig: &str,
        target: &Value,
        node_name: &str,
    ) -> Result<bool> {
        let cached = self.cache.read().await.get(node_name).copied();
        let key = match cached {
            Some(key) => key,
            None => {
                self.refresh_public_key_cache(ctx).await?;
                self.cache.read().await.get(node_name).copied().ok_or_else(|| {
                    ModuleError::new(
                        ErrorKind::NotFound,
                        "keyring",
                        "verify_by_public_key",
                        "KeyNotFound",
                        format!("no published key for {}", node_name),
                    )
                })?
            }
        };
        key.verify_json(sig, target).map_err(|e| {
            ModuleError::new(
                ErrorKind::SignatureRejected,
                "keyring",
                "verify_by_public_key",
                "VerificationError",
                e.to_string(),
            )
        })
    }

    /// All public key entries currently on chain or in the pool, newest
    /// first.
    async fn scan_entries(&self, ctx: &CoreContext) -> Result<Vec<PublicKeyEntry>> {
        let admin = ctx.admin_id();
        let opts = crate::core::datastore::CursorOptions::sorted(
            casualchain_common::api::SortOrder::IdDesc,
        );

        let mut txs: Vec<PoolTransaction> = Vec::new();
        let mut pool = ctx.datastore.get_pool_cursor(Some(&admin), &opts).await?;
        while let Some(tx) = pool.next() {
            txs.push(tx);
        }
        pool.close();

        let mut blocks = ctx.datastore.get_block_cursor(Some(&admin), &opts).await?;
        while let Some(blk) = blocks.next() {
            if let Some(data) = blk.data {
                txs.extend(data);
            }
        }
        blocks.close();

        txs.sort_by(|a, b| b.id.cmp(&a.id));
        let mut entries = Vec::new();
        for tx in txs.into_iter().filter(|tx| tx.is_pubkey_entry()) {
            match serde_json::from_value::<PublicKeyEntry>(tx.data.clone()) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("skipping malformed pubkey entry {}: {}", tx.id, e),
            }
        }
        Ok(entries)
    }

    /// Rebuild the in-memory key cache from the chain, newest entry per
    /// node winning.
    pub async fn refresh_public_key_cache(&self, ctx: &CoreContext) -> Result<usize> {
        let entries = self.scan_entries(ctx).await?;
        let mut fresh: HashMap<String, Ed25519PublicKey> = HashMap::new();
        for entry in entries {
            if fresh.contains_key(&entry.node_name) {
                continue;
            }
            match entry.parse_key() {
                Ok(key) => {
                    fresh.insert(entry.node_name.clone(), key);
                }
                Err(e) => warn!("unusable published key for {}: {}", entry.node_name, e),
            }
        }
        // own key is always authoritative locally
        fresh.insert(self.node_name.clone(), self.keypair.public_key());

        let count = fresh.len();
        *self.cache.write().await = fresh;
        debug!("public key cache refreshed, {} nodes known", count);
        Ok(count)
    }

    /// Publish this node's verification key unless it is already on chain,
    /// then request an immediate delivery so peers learn it promptly.
    pub async fn post_self_public_keys(&self, ctx: &CoreContext) -> Result<()> {
        let already = self
            .scan_entries(ctx)
            .await?
            .into_iter()
            .any(|entry| entry.node_name == self.node_name);
        if already {
            debug!("own public key already published");
            return Ok(());
        }

        let entry = self.self_entry();
        let admin = ctx.admin_id();
        let mut data = serde_json::to_value(&entry)
            .map_err(|e| ModuleError::internal("keyring", "post_self_public_keys", e.to_string()))?;
        data[PUBKEY_TAG_KEY] = json!(PUBKEY_TAG);
        let tx = PoolTransaction {
            id: ObjectId::generate(),
            tenant: admin.clone(),
            kind: TxKind::New,
            settime: SetTime::now(false),
            prev_id: None,
            delivery_f: false,
            data,
        };
        ctx.datastore.set_pool_new_data(&tx, &admin).await?;
        info!("published own public key as {}", tx.id);

        if let Err(e) = ctx.system.post_delivery_pool(ctx, true).await {
            warn!("immediate key delivery failed, will retry on tick: {}", e);
        }
        Ok(())
    }
}

fn write_key_files(config: &KeyringConfig, keypair: &Ed25519KeyPair) -> Result<()> {
    let write = |path: &str, content: &str| -> Result<()> {
        let path = Path::new(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ModuleError::internal("keyring", "write_key_files", e.to_string())
            })?;
        }
        std::fs::write(path, content)
            .map_err(|e| ModuleError::internal("keyring", "write_key_files", e.to_string()))
    };

    let sign_pem = keypair
        .to_pkcs8_pem()
        .map_err(|e| ModuleError::internal("keyring", "write_key_files", e.to_string()))?;
    write(&config.sign_key_file, &sign_pem)?;
    let verify_pem = keypair
        .public_key()
        .to_pem()
        .map_err(|e| ModuleError::internal("keyring", "write_key_files", e.to_string()))?;
    write(&config.verify_key_file, &verify_pem)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempdir::TempDir;

    fn config_in(dir: &TempDir, create: bool) -> KeyringConfig {
        KeyringConfig {
            sign_key_file: dir
                .path()
                .join("sign.pem")
                .to_string_lossy()
                .to_string(),
            verify_key_file: dir
                .path()
                .join("verify.pem")
                .to_string_lossy()
                .to_string(),
            create_keys_if_no_sign_key_exists: create,
        }
    }

    #[test]
    fn test_init_generates_and_reloads_same_key() {
        let dir = TempDir::new("keyring").unwrap();
        let config = config_in(&dir, true);

        let first = Keyring::init(&config, "node1").unwrap();
        let second = Keyring::init(&config, "node1").unwrap();
        assert_eq!(first.verify_key_hex, second.verify_key_hex);
    }

    #[test]
    fn test_init_fails_without_key_when_creation_disabled() {
        let dir = TempDir::new("keyring").unwrap();
        let config = config_in(&dir, false);
        let err = Keyring::init(&config, "node1").unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn test_self_entry_is_a_valid_pubkey_tx_payload() {
        let dir = TempDir::new("keyring").unwrap();
        let keyring = Keyring::init(&config_in(&dir, true), "node1").unwrap();
        let entry = keyring.self_entry();
        assert_eq!(entry.node_name, "node1");
        assert!(entry.verify_key.starts_with("-----BEGIN PUBLIC KEY-----"));
        entry.parse_key().unwrap();
    }

    #[test]
    fn test_sign_matches_own_key() {
        let dir = TempDir::new("keyring").unwrap();
        let keyring = Keyring::init(&config_in(&dir, true), "node1").unwrap();
        let target = json!({"height": 4, "tenant": "t1"});
        let sig = keyring.sign_by_private_key(&target).unwrap();
        let key = keyring.self_entry().parse_key().unwrap();
        assert!(key.verify_json(&sig, &target).unwrap());
    }
}
