//! Typed pool/block collection access over the embedded document store.
//!
//! Two back-ends share the exact same semantics: the sled-backed store
//! (optionally keeping the pool in an in-memory queue when
//! `queue_ondisk=false`) and a fully in-memory store used by the testing
//! node modes. Reads always filter by tenant unless the caller presents the
//! administration id.

mod disk;
mod memory;

pub use disk::SledDatastore;
pub use memory::MemoryDatastore;

use async_trait::async_trait;
use casualchain_common::{
    api::SortOrder,
    block::Block,
    error::Result,
    transaction::{ObjectId, PoolTransaction},
};
use std::{collections::VecDeque, sync::Arc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Backing sessions available per store. Cursor creation allocates one and
/// `close` (or drop) releases it, so a leaked cursor cannot starve writers.
pub const MAX_SESSIONS: usize = 64;

#[derive(Clone, Debug, Default)]
pub struct CursorOptions {
    pub sort_order: SortOrder,
    /// Truncate once cumulative serialized `data` bytes would exceed this.
    pub constrained_size: Option<u64>,
    pub limit: Option<usize>,
}

impl CursorOptions {
    pub fn sorted(sort_order: SortOrder) -> Self {
        Self {
            sort_order,
            ..Self::default()
        }
    }

    pub fn first() -> Self {
        Self {
            sort_order: SortOrder::IdDesc,
            constrained_size: None,
            limit: Some(1),
        }
    }
}

/// A finite, forward-only cursor. The result set is materialized while the
/// backing session is held; the session itself stays allocated until the
/// cursor is closed so the caller controls the release point.
pub struct DataCursor<T> {
    items: VecDeque<T>,
    permit: Option<OwnedSemaphorePermit>,
}

impl<T> DataCursor<T> {
    pub(crate) fn new(items: Vec<T>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            items: items.into(),
            permit: Some(permit),
        }
    }

    pub fn next(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Release the backing session. Also happens on drop; calling it twice
    /// is harmless.
    pub fn close(&mut self) {
        self.items.clear();
        self.permit.take();
    }

    /// Consume the cursor, returning all remaining rows and releasing the
    /// session.
    pub fn drain(mut self) -> Vec<T> {
        let items = std::mem::take(&mut self.items);
        self.close();
        items.into()
    }
}

pub type PoolCursor = DataCursor<PoolTransaction>;
pub type BlockCursor = DataCursor<Block>;

#[async_trait]
pub trait Datastore: Send + Sync {
    /// Pool rows ordered by id; `tenant=None` (or the administration id)
    /// reads across tenants.
    async fn get_pool_cursor(
        &self,
        tenant: Option<&str>,
        opts: &CursorOptions,
    ) -> Result<PoolCursor>;

    async fn get_block_cursor(
        &self,
        tenant: Option<&str>,
        opts: &CursorOptions,
    ) -> Result<BlockCursor>;

    /// Append a pool row. Rejected unless `tx.tenant == tenant` or the
    /// caller presents the administration id.
    async fn set_pool_new_data(&self, tx: &PoolTransaction, tenant: &str) -> Result<()>;

    async fn set_block_new_data(&self, blk: &Block, tenant: &str) -> Result<()>;

    /// Mark rows as propagated. Administration id required.
    async fn pool_modify_reads_flag(&self, ids: &[ObjectId], tenant: &str) -> Result<()>;

    async fn pool_delete_transactions(&self, ids: &[ObjectId], tenant: &str) -> Result<usize>;

    async fn block_delete_blocks(&self, ids: &[ObjectId], tenant: &str) -> Result<usize>;

    /// Replace block documents wholesale, matching on id.
    async fn block_update_blocks(&self, blocks: &[Block], tenant: &str) -> Result<()>;

    /// Distinct tenants present in either collection.
    async fn list_tenants(&self) -> Result<Vec<String>>;

    /// Drop everything. Only reachable through the test affordances.
    async fn reset(&self) -> Result<()>;

    async fn flush(&self) -> Result<()>;
}

pub type SharedDatastore = Arc<dyn Datastore>;

pub(crate) fn new_session_pool() -> Arc<Semaphore> {
    Arc::new(Semaphore::new(MAX_SESSIONS))
}

/// Whether a caller-presented tenant actually narrows the read.
pub(crate) fn effective_filter<'a>(
    tenant: Option<&'a str>,
    admin_id: &str,
) -> Option<&'a str> {
    tenant.filter(|t| *t != admin_id)
}

/// Sort, cap and limit a materialized result set. Items arrive ascending by
/// id from every backend.
pub(crate) fn finalize<T>(
    mut items: Vec<T>,
    opts: &CursorOptions,
    size_of: impl Fn(&T) -> usize,
) -> Vec<T> {
    if opts.sort_order == SortOrder::IdDesc {
        items.reverse();
    }
    if let Some(cap) = opts.constrained_size {
        let mut cumulative: u64 = 0;
        let mut keep = 0;
        for item in &items {
            cumulative += size_of(item) as u64;
            if cumulative > cap {
                break;
            }
            keep += 1;
        }
        items.truncate(keep);
    }
    if let Some(limit) = opts.limit {
        items.truncate(limit);
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use casualchain_common::{
        transaction::{SetTime, TxKind},
    };
    use serde_json::json;

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

    #[test]
    fn test_finalize_desc_reverses() {
        let a = tx("t", "a");
        let b = tx("t", "b");
        let first = a.id;
        let out = finalize(
            vec![a, b],
            &CursorOptions::sorted(SortOrder::IdDesc),
            |t| t.data_size(),
        );
        assert_eq!(out.last().unwrap().id, first);
    }

    #[test]
    fn test_finalize_constrained_size() {
        let items: Vec<PoolTransaction> = (0..4).map(|i| tx("t", &format!("d{}", i))).collect();
        let per_item = items[0].data_size() as u64;
        let opts = CursorOptions {
            sort_order: SortOrder::IdAsc,
            constrained_size: Some(per_item * 2),
            limit: None,
        };
        let out = finalize(items, &opts, |t| t.data_size());
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_effective_filter() {
        assert_eq!(effective_filter(Some("t1"), "admin"), Some("t1"));
        assert_eq!(effective_filter(Some("admin"), "admin"), None);
        assert_eq!(effective_filter(None, "admin"), None);
    }

    #[tokio::test]
    async fn test_cursor_releases_session_on_close() {
        let pool = new_session_pool();
        let permit = pool.clone().acquire_owned().await.unwrap();
        let mut cursor = DataCursor::new(vec![tx("t", "x")], permit);
        assert_eq!(pool.available_permits(), MAX_SESSIONS - 1);

        assert!(cursor.next().is_some());
        cursor.close();
        assert_eq!(pool.available_permits(), MAX_SESSIONS);
        assert!(cursor.next().is_none());
    }

    #[tokio::test]
    async fn test_cursor_releases_session_on_drop() {
        let pool = new_session_pool();
        {
            let permit = pool.clone().acquire_owned().await.unwrap();
            let _cursor = DataCursor::new(vec![tx("t", "x")], permit);
            assert_eq!(pool.available_permits(), MAX_SESSIONS - 1);
        }
        assert_eq!(pool.available_permits(), MAX_SESSIONS);
    }
}
