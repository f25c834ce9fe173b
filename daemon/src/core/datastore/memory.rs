//! Fully in-memory datastore, used by the testing node modes and unit
//! tests. Same tenant filter, sort and size-cap semantics as the sled
//! store.

use super::{
    effective_filter, finalize, new_session_pool, BlockCursor, CursorOptions, DataCursor,
    Datastore, PoolCursor,
};
use async_trait::async_trait;
use casualchain_common::{
    block::Block,
    error::{ModuleError, Result},
    transaction::{ObjectId, PoolTransaction},
};
use log::trace;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::{RwLock, Semaphore};
use std::sync::Arc;

pub struct MemoryDatastore {
    pool: RwLock<BTreeMap<ObjectId, PoolTransaction>>,
    block: RwLock<BTreeMap<ObjectId, Block>>,
    admin_id: String,
    sessions: Arc<Semaphore>,
}

impl MemoryDatastore {
    pub fn new(admin_id: &str) -> Self {
        Self {
            pool: RwLock::new(BTreeMap::new()),
            block: RwLock::new(BTreeMap::new()),
            admin_id: admin_id.to_string(),
            sessions: new_session_pool(),
        }
    }

    async fn session(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        self.sessions
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| ModuleError::db("datastore", "session", e.to_string()))
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn get_pool_cursor(
        &self,
        tenant: Option<&str>,
        opts: &CursorOptions,
    ) -> Result<PoolCursor> {
        let permit = self.session().await?;
        let filter = effective_filter(tenant, &self.admin_id);
        let pool = self.pool.read().await;
        let items: Vec<PoolTransaction> = pool
            .values()
            .filter(|tx| filter.map(|t| tx.tenant == t).unwrap_or(true))
            .cloned()
            .collect();
        drop(pool);
        Ok(DataCursor::new(
            finalize(items, opts, |tx| tx.data_size()),
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
        let block = self.block.read().await;
        let items: Vec<Block> = block
            .values()
            .filter(|b| filter.map(|t| b.tenant == t).unwrap_or(true))
            .cloned()
            .collect();
        drop(block);
        Ok(DataCursor::new(
            finalize(items, opts, |b| b.data_size()),
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
        self.pool.write().await.insert(tx.id, tx.clone());
        Ok(())
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
        self.block.write().await.insert(blk.id, blk.clone());
        Ok(())
    }

    async fn pool_modify_reads_flag(&self, ids: &[ObjectId], tenant: &str) -> Result<()> {
        if tenant != self.admin_id {
            return Err(ModuleError::forbidden(
                "datastore",
                "pool_modify_reads_flag",
                "administration id required",
            ));
        }
        let mut pool = self.pool.write().await;
        for id in ids {
            if let Some(tx) = pool.get_mut(id) {
                tx.delivery_f = true;
            }
        }
        Ok(())
    }

    async fn pool_delete_transactions(&self, ids: &[ObjectId], tenant: &str) -> Result<usize> {
        let mut pool = self.pool.write().await;
        let snapshot: Vec<ObjectId> = pool.keys().copied().collect();
        let mut removed = 0;
        'rows: for key in snapshot {
            for id in ids {
                if key != *id {
                    continue;
                }
                let allowed = tenant == self.admin_id
                    || pool.get(&key).map(|tx| tx.tenant == tenant).unwrap_or(false);
                if allowed && pool.remove(&key).is_some() {
                    removed += 1;
                }
                continue 'rows;
            }
        }
        Ok(removed)
    }

    async fn block_delete_blocks(&self, ids: &[ObjectId], tenant: &str) -> Result<usize> {
        let mut block = self.block.write().await;
        let mut removed = 0;
        for id in ids {
            let allowed = tenant == self.admin_id
                || block.get(id).map(|b| b.tenant == tenant).unwrap_or(false);
            if allowed && block.remove(id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn block_update_blocks(&self, blocks: &[Block], tenant: &str) -> Result<()> {
        let mut map = self.block.write().await;
        for blk in blocks {
            if blk.tenant != tenant && tenant != self.admin_id {
                return Err(ModuleError::forbidden(
                    "datastore",
                    "block_update_blocks",
                    format!("tenant {} may not update rows of {}", tenant, blk.tenant),
                ));
            }
            map.insert(blk.id, blk.clone());
        }
        Ok(())
    }

    async fn list_tenants(&self) -> Result<Vec<String>> {
        let mut tenants = BTreeSet::new();
        for tx in self.pool.read().await.values() {
            tenants.insert(tx.tenant.clone());
        }
        for blk in self.block.read().await.values() {
            tenants.insert(blk.tenant.clone());
        }
        Ok(tenants.into_iter().collect())
    }

    async fn reset(&self) -> Result<()> {
        self.pool.write().await.clear();
        self.block.write().await.clear();
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
