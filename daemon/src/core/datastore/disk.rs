//! Sled-backed document store. Trees play the role of collections; every
//! document is stored as JSON under its 12-byte ObjectId key, so key order
//! equals id order. A `<collection>.tenant` tree per collection is the
//! mandatory secondary index on tenant. Multi-document mutations run inside
//! a sled multi-tree transaction.

use super::{
    effective_filter, finalize, new_session_pool, BlockCursor, CursorOptions, DataCursor,
    Datastore, PoolCursor,
};
use crate::config::DatastoreConfig;
use async_trait::async_trait;
use casualchain_common::{
    block::Block,
    error::{ModuleError, Result},
    transaction::{ObjectId, PoolTransaction},
};
use log::{debug, trace};
use serde::{de::DeserializeOwned, Serialize};
use sled::{
    transaction::{ConflictableTransactionError, TransactionError},
    Transactional, Tree,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    sync::Arc,
};
use tokio::sync::{RwLock, Semaphore};

const TENANT_INDEX_SUFFIX: &str = ".tenant";

enum PoolBackend {
    Disk { tree: Tree, index: Tree },
    /// `queue_ondisk=false`: the pool lives in memory, blocks stay on disk.
    Queue(RwLock<BTreeMap<ObjectId, PoolTransaction>>),
}

pub struct SledDatastore {
    db: sled::Db,
    pool: PoolBackend,
    block: Tree,
    block_index: Tree,
    admin_id: String,
    sessions: Arc<Semaphore>,
}

fn index_key(tenant: &str, id: &ObjectId) -> Vec<u8> {
    let mut key = Vec::with_capacity(tenant.len() + 1 + 12);
    key.extend_from_slice(tenant.as_bytes());
    key.push(0);
    key.extend_from_slice(id.as_bytes());
    key
}

fn index_prefix(tenant: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(tenant.len() + 1);
    key.extend_from_slice(tenant.as_bytes());
    key.push(0);
    key
}

fn encode_doc<T: Serialize>(doc: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(doc)
        .map_err(|e| ModuleError::internal("datastore", "encode_doc", e.to_string()))
}

fn decode_doc<T: DeserializeOwned>(raw: &[u8]) -> Result<T> {
    serde_json::from_slice(raw)
        .map_err(|e| ModuleError::db("datastore", "decode_doc", e.to_string()))
}

fn db_err(function: &str, e: impl std::fmt::Display) -> ModuleError {
    ModuleError::db("datastore", function, e.to_string())
}

fn tx_err(function: &str, e: TransactionError<String>) -> ModuleError {
    match e {
        TransactionError::Abort(detail) => {
            ModuleError::db("datastore", function, detail)
        }
        TransactionError::Storage(e) => db_err(function, e),
    }
}

impl SledDatastore {
    pub fn open(config: &DatastoreConfig, admin_id: &str) -> Result<Self> {
        let path = Path::new(&config.db_path).join(&config.mongo_dbname);
        let db = sled::open(&path).map_err(|e| db_err("open", e))?;

        let block = db
            .open_tree(config.mongo_blockcollection.as_bytes())
            .map_err(|e| db_err("open", e))?;
        let block_index = db
            .open_tree(format!("{}{}", config.mongo_blockcollection, TENANT_INDEX_SUFFIX))
            .map_err(|e| db_err("open", e))?;

        let pool = if config.queue_ondisk {
            let tree = db
                .open_tree(config.mongo_poolcollection.as_bytes())
                .map_err(|e| db_err("open", e))?;
            let index = db
                .open_tree(format!("{}{}", config.mongo_poolcollection, TENANT_INDEX_SUFFIX))
                .map_err(|e| db_err("open", e))?;
            PoolBackend::Disk { tree, index }
        } else {
            debug!("pool queue kept in memory (queue_ondisk=false)");
            PoolBackend::Queue(RwLock::new(BTreeMap::new()))
        };

        debug!("document store opened at {}", path.display());
        Ok(Self {
            db,
            pool,
            block,
            block_index,
            admin_id: admin_id.to_string(),
            sessions: new_session_pool(),
        })
    }

    async fn session(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        self.sessions
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| db_err("session", e))
    }

    /// Ascending scan of a collection, optionally through its tenant index.
    fn scan_tree<T: DeserializeOwned>(
        tree: &Tree,
        index: &Tree,
        filter: Option<&str>,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        match filter {
            Some(tenant) => {
                for entry in index.scan_prefix(index_prefix(tenant)) {
                    let (key, _) = entry.map_err(|e| db_err("scan", e))?;
                    let oid = &key[key.len() - 12..];
                    if let Some(raw) = tree.get(oid).map_err(|e| db_err("scan", e))? {
                        items.push(decode_doc(&raw)?);
                    }
                }
            }
            None => {
                for entry in tree.iter() {
                    let (_, raw) = entry.map_err(|e| db_err("scan", e))?;
                    items.push(decode_doc(&raw)?);
                }
            }
        }
        Ok(items)
    }

    fn insert_doc<T: Serialize>(
        tree: &Tree,
        index: &Tree,
        id: &ObjectId,
        tenant: &str,
        doc: &T,
        function: &str,
    ) -> Result<()> {
        let raw = encode_doc(doc)?;
        let idx = index_key(tenant, id);
        (tree, index)
            .transaction(|(t, ix)| {
                t.insert(id.as_bytes().as_slice(), raw.as_slice())?;
                ix.insert(idx.as_slice(), vec![])?;
                Ok::<(), ConflictableTransactionError<String>>(())
            })
            .map_err(|e| tx_err(function, e))?;
        Ok(())
    }
}

#[async_trait]
impl Datastore for SledDatastore {
    async fn get_pool_cursor(
        &self,
        tenant: Option<&str>,
        opts: &CursorOptions,
    ) -> Result<PoolCursor> {
        let permit = self.session().await?;
        let filter = effective_filter(tenant, &self.admin_id);
        let items = match &self.pool {
            PoolBackend::Disk { tree, index } => Self::scan_tree(tree, index, filter)?,
            PoolBackend::Queue(queue) => queue
                .read()
                .await
                .values()
                .filter(|tx| filter.map(|t| tx.tenant == t).unwrap_or(true))
                .cloned()
                .collect(),
        };
        Ok(DataCursor::new(
            finalize(items, opts, |tx: &PoolTransaction| tx.data_size()),
            permit,
        ))
    }

    async fn get_block_cursor(
        &self,
        tenant: Option<&str>,
        opts: &CursorOptions,
    ) -> Result<BlockCursor> {
        let permit = self.session().await?;
        let filter = effective_filter(tenant, &self.admin_id);
        let items: Vec<Block> = Self::scan_tree(&self.block, &self.block_index, filter)?;
        Ok(DataCursor::new(
            finalize(items, opts, |b: &Block| b.data_size()),
            permit,
        ))
    }

    async fn set_pool_new_data(&self, tx: &PoolTransaction, tenant: &str) -> Result<()> {
        if tx.tenant != tenant && tenant != self.admin_id {
            return Err(ModuleError::forbidden(
                "datastore",
                "set_pool_new_data",
                format!("tenant {} may not write rows of {}", tenant, tx.tenant),
            ));
        }
        trace!("pool insert {}", tx.id);
        match &self.pool {
            PoolBackend::Disk { tree, index } => {
                Self::insert_doc(tree, index, &tx.id, &tx.tenant, tx, "set_pool_new_data")
            }
            PoolBackend::Queue(queue) => {
                queue.write().await.insert(tx.id, tx.clone());
                Ok(())
            }
        }
    }

    async fn set_block_new_data(&self, blk: &Block, tenant: &str) -> Result<()> {
        if blk.tenant != tenant && tenant != self.admin_id {
            return Err(ModuleError::forbidden(
                "datastore",
                "set_block_new_data",
                format!("tenant {} may not write rows of {}", tenant, blk.tenant),
            ));
        }
        trace!("block insert {} height {}", blk.id, blk.height);
        Self::insert_doc(
            &self.block,
            &self.block_index,
            &blk.id,
            &blk.tenant,
            blk,
            "set_block_new_data",
        )
    }

    async fn pool_modify_reads_flag(&self, ids: &[ObjectId], tenant: &str) -> Result<()> {
        if tenant != self.admin_id {
            return Err(ModuleError::forbidden(
                "datastore",
                "pool_modify_reads_flag",
                "administration id required",
            ));
        }
        match &self.pool {
            PoolBackend::Disk { tree, .. } => {
                for id in ids {
                    if let Some(raw) = tree.get(id.as_bytes()).map_err(|e| db_err("pool_modify_reads_flag", e))? {
                        let mut tx: PoolTransaction = decode_doc(&raw)?;
                        tx.delivery_f = true;
                        tree.insert(id.as_bytes(), encode_doc(&tx)?)
                            .map_err(|e| db_err("pool_modify_reads_flag", e))?;
                    }
                }
            }
            PoolBackend::Queue(queue) => {
                let mut queue = queue.write().await;
                for id in ids {
                    if let Some(tx) = queue.get_mut(id) {
                        tx.delivery_f = true;
                    }
                }
            }
        }
        Ok(())
    }

    async fn pool_delete_transactions(&self, ids: &[ObjectId], tenant: &str) -> Result<usize> {
        match &self.pool {
            PoolBackend::Disk { tree, index } => {
                let mut keys = Vec::new();
                for entry in tree.iter() {
                    let (key, raw) = entry.map_err(|e| db_err("pool_delete_transactions", e))?;
                    let tx: PoolTransaction = decode_doc(&raw)?;
                    keys.push((ObjectId::from_slice(&key).map_err(|e| {
                        ModuleError::internal("datastore", "pool_delete_transactions", e.to_string())
                    })?, tx.tenant));
                }
                let admin = tenant == self.admin_id;
                let removed = (tree, index)
                    .transaction(|(t, ix)| {
                        let mut removed = 0usize;
                        'rows: for (key, row_tenant) in &keys {
                            for id in ids {
                                if key != id {
                                    continue;
                                }
                                if admin || row_tenant == tenant {
                                    t.remove(key.as_bytes().as_slice())?;
                                    ix.remove(index_key(row_tenant, key).as_slice())?;
                                    removed += 1;
                                }
                                continue 'rows;
                            }
                        }
                        Ok::<usize, ConflictableTransactionError<String>>(removed)
                    })
                    .map_err(|e| tx_err("pool_delete_transactions", e))?;
                Ok(removed)
            }
            PoolBackend::Queue(queue) => {
                let mut queue = queue.write().await;
                let snapshot: Vec<ObjectId> = queue.keys().copied().collect();
                let mut removed = 0;
                'rows: for key in snapshot {
                    for id in ids {
                        if key != *id {
                            continue;
                        }
                        let allowed = tenant == self.admin_id
                            || queue.get(&key).map(|tx| tx.tenant == tenant).unwrap_or(false);
                        if allowed && queue.remove(&key).is_some() {
                            removed += 1;
                        }
                        continue 'rows;
                    }
                }
                Ok(removed)
            }
        }
    }

    async fn block_delete_blocks(&self, ids: &[ObjectId], tenant: &str) -> Result<usize> {
        let mut targets = Vec::new();
        for id in ids {
            if let Some(raw) = self
                .block
                .get(id.as_bytes())
                .map_err(|e| db_err("block_delete_blocks", e))?
            {
                let blk: Block = decode_doc(&raw)?;
                if tenant == self.admin_id || blk.tenant == tenant {
                    targets.push((*id, blk.tenant));
                }
            }
        }
        let removed = (&self.block, &self.block_index)
            .transaction(|(t, ix)| {
                let mut removed = 0usize;
                for (id, row_tenant) in &targets {
                    if t.remove(id.as_bytes().as_slice())?.is_some() {
                        ix.remove(index_key(row_tenant, id).as_slice())?;
                        removed += 1;
                    }
                }
                Ok::<usize, ConflictableTransactionError<String>>(removed)
            })
            .map_err(|e| tx_err("block_delete_blocks", e))?;
        Ok(removed)
    }

    async fn block_update_blocks(&self, blocks: &[Block], tenant: &str) -> Result<()> {
        for blk in blocks {
            if blk.tenant != tenant && tenant != self.admin_id {
                return Err(ModuleError::forbidden(
                    "datastore",
                    "block_update_blocks",
                    format!("tenant {} may not update rows of {}", tenant, blk.tenant),
                ));
            }
        }
        let encoded: Vec<(ObjectId, String, Vec<u8>)> = blocks
            .iter()
            .map(|b| Ok((b.id, b.tenant.clone(), encode_doc(b)?)))
            .collect::<Result<_>>()?;
        (&self.block, &self.block_index)
            .transaction(|(t, ix)| {
                for (id, row_tenant, raw) in &encoded {
                    t.insert(id.as_bytes().as_slice(), raw.as_slice())?;
                    ix.insert(index_key(row_tenant, id).as_slice(), vec![])?;
                }
                Ok::<(), ConflictableTransactionError<String>>(())
            })
            .map_err(|e| tx_err("block_update_blocks", e))?;
        Ok(())
    }

    async fn list_tenants(&self) -> Result<Vec<String>> {
        let mut tenants = BTreeSet::new();
        let mut collect = |index: &Tree| -> Result<()> {
            for entry in index.iter() {
                let (key, _) = entry.map_err(|e| db_err("list_tenants", e))?;
                if key.len() > 13 {
                    let tenant = &key[..key.len() - 13];
                    if let Ok(s) = std::str::from_utf8(tenant) {
                        tenants.insert(s.to_string());
                    }
                }
            }
            Ok(())
        };
        collect(&self.block_index)?;
        match &self.pool {
            PoolBackend::Disk { index, .. } => collect(index)?,
            PoolBackend::Queue(queue) => {
                for tx in queue.read().await.values() {
                    tenants.insert(tx.tenant.clone());
                }
            }
        }
        Ok(tenants.into_iter().collect())
    }

    async fn reset(&self) -> Result<()> {
        self.block.clear().map_err(|e| db_err("reset", e))?;
        self.block_index.clear().map_err(|e| db_err("reset", e))?;
        match &self.pool {
            PoolBackend::Disk { tree, index } => {
                tree.clear().map_err(|e| db_err("reset", e))?;
                index.clear().map_err(|e| db_err("reset", e))?;
            }
            PoolBackend::Queue(queue) => queue.write().await.clear(),
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map(|_| ())
            .map_err(|e| db_err("flush", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casualchain_common::{
        api::SortOrder,
        transaction::{SetTime, TxKind},
    };
    use serde_json::json;
    use tempdir::TempDir;

    const ADMIN: &str = "admin-tenant";

    fn open_store(dir: &TempDir, queue_ondisk: bool) -> SledDatastore {
        let config = DatastoreConfig {
            db_path: dir.path().to_string_lossy().to_string(),
            queue_ondisk,
            ..DatastoreConfig::default()
        };
        SledDatastore::open(&config, ADMIN).unwrap()
    }

    fn tx(tenant: &str, desc: &str) -> PoolTransaction {
        PoolTransaction {
            id: ObjectId::generate(),
            tenant: tenant.to_string(),
            kind: TxKind::New,
            settime: SetTime::Millis(0),
            prev_id: None,
            delivery_f: false,
            data: json!({"desc": desc}),
        }
    }

    #[tokio::test]
    async fn test_pool_roundtrip_on_disk() {
        let dir = TempDir::new("ds").unwrap();
        let store = open_store(&dir, true);
        let t = tx("t1", "a");
        store.set_pool_new_data(&t, "t1").await.unwrap();

        let rows = store
            .get_pool_cursor(Some("t1"), &CursorOptions::default())
            .await
            .unwrap()
            .drain();
        assert_eq!(rows, vec![t]);
    }

    #[tokio::test]
    async fn test_queue_backend_matches_disk_semantics() {
        let dir = TempDir::new("ds").unwrap();
        let store = open_store(&dir, false);
        let a = tx("t1", "a");
        let b = tx("t2", "b");
        store.set_pool_new_data(&a, "t1").await.unwrap();
        store.set_pool_new_data(&b, ADMIN).await.unwrap();

        let rows = store
            .get_pool_cursor(Some("t1"), &CursorOptions::default())
            .await
            .unwrap()
            .drain();
        assert_eq!(rows.len(), 1);

        let removed = store
            .pool_delete_transactions(&[a.id, b.id], ADMIN)
            .await
            .unwrap();
        assert_eq!(removed, 2);
    }

    #[tokio::test]
    async fn test_blocks_ordered_and_indexed() {
        let dir = TempDir::new("ds").unwrap();
        let store = open_store(&dir, true);
        let mut g = Block::genesis("t1", "node1");
        g.seal().unwrap();
        store.set_block_new_data(&g, "t1").await.unwrap();
        let other = Block::genesis("t2", "node1");
        store.set_block_new_data(&other, "t2").await.unwrap();

        let rows = store
            .get_block_cursor(Some("t1"), &CursorOptions::sorted(SortOrder::IdDesc))
            .await
            .unwrap()
            .drain();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, g.id);

        assert_eq!(store.list_tenants().await.unwrap(), vec!["t1", "t2"]);
    }

    #[tokio::test]
    async fn test_block_update_replaces_document() {
        let dir = TempDir::new("ds").unwrap();
        let store = open_store(&dir, true);
        let mut blk = Block::genesis("t1", "node1");
        store.set_block_new_data(&blk, "t1").await.unwrap();

        blk.miner = "node2".to_string();
        store.block_update_blocks(&[blk.clone()], "t1").await.unwrap();

        let rows = store
            .get_block_cursor(Some("t1"), &CursorOptions::default())
            .await
            .unwrap()
            .drain();
        assert_eq!(rows[0].miner, "node2");
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = TempDir::new("ds").unwrap();
        let t = tx("t1", "a");
        {
            let store = open_store(&dir, true);
            store.set_pool_new_data(&t, "t1").await.unwrap();
            store.flush().await.unwrap();
        }
        let store = open_store(&dir, true);
        let rows = store
            .get_pool_cursor(Some("t1"), &CursorOptions::default())
            .await
            .unwrap()
            .drain();
        assert_eq!(rows, vec![t]);
    }
}
