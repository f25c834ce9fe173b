//! Tenant-scoped read/write facade over the datastore. Every user API route
//! lands here; the REST layer only translates HTTP.

use crate::core::{
    datastore::{CursorOptions, SharedDatastore},
    CoreContext,
};
use casualchain_common::{
    api::{
        BlockQueryOptions, CombinedQueryOptions, JsonQueryOptions, LastBlockOptions,
        OidQueryOptions, PoolQueryOptions, SortOrder,
    },
    block::Block,
    config::MAX_TX_DATA_SIZE,
    error::{ErrorKind, ModuleError, Result},
    transaction::{ObjectId, PoolTransaction, SetTime, TxKind},
};
use log::debug;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::str::FromStr;

const COMPONENT: &str = "ledger";

/// Result of a block query: whole blocks, or their flattened transactions
/// when `bare_transaction` was requested.
#[derive(Serialize, Clone, Debug)]
#[serde(untagged)]
pub enum BlockQueryResult {
    Blocks(Vec<Block>),
    Transactions(Vec<PoolTransaction>),
}

/// What an oid search found.
#[derive(Serialize, Clone, Debug)]
#[serde(untagged)]
pub enum OidSearchResult {
    Transaction(Box<PoolTransaction>),
    Block(Box<Block>),
}

pub struct Ledger {
    datastore: SharedDatastore,
}

impl Ledger {
    pub fn new(datastore: SharedDatastore) -> Self {
        Self { datastore }
    }

    /// Tenant a read acts on: the requested one, or the default tenant.
    fn read_tenant(&self, ctx: &CoreContext, requested: Option<&str>) -> Result<String> {
        match requested {
            Some(tenant) => Ok(tenant.to_string()),
            None => {
                if !ctx.enable_default_tenant() {
                    return Err(ModuleError::forbidden(
                        COMPONENT,
                        "read_tenant",
                        "default tenant is disabled",
                    ));
                }
                Ok(ctx.default_tenant_id())
            }
        }
    }

    async fn pool_rows(
        &self,
        tenant: &str,
        sort_order: SortOrder,
        constrained_size: Option<u64>,
    ) -> Result<Vec<PoolTransaction>> {
        let opts = CursorOptions {
            sort_order,
            constrained_size,
            limit: None,
        };
        Ok(self
            .datastore
            .get_pool_cursor(Some(tenant), &opts)
            .await?
            .drain())
    }

    async fn block_rows(
        &self,
        tenant: &str,
        sort_order: SortOrder,
        constrained_size: Option<u64>,
    ) -> Result<Vec<Block>> {
        let opts = CursorOptions {
            sort_order,
            constrained_size,
            limit: None,
        };
        Ok(self
            .datastore
            .get_block_cursor(Some(tenant), &opts)
            .await?
            .drain())
    }

    pub async fn get_all_pool(
        &self,
        ctx: &CoreContext,
        opts: &PoolQueryOptions,
    ) -> Result<Vec<PoolTransaction>> {
        let tenant = self.read_tenant(ctx, opts.tenant.as_deref())?;
        self.pool_rows(&tenant, opts.sort_order, opts.constrained_size)
            .await
    }

    pub async fn get_all_delivered_pool(
        &self,
        ctx: &CoreContext,
        opts: &PoolQueryOptions,
    ) -> Result<Vec<PoolTransaction>> {
        Ok(self
            .get_all_pool(ctx, opts)
            .await?
            .into_iter()
            .filter(|tx| tx.delivery_f)
            .collect())
    }

    pub async fn get_all_undelivered_pool(
        &self,
        ctx: &CoreContext,
        opts: &PoolQueryOptions,
    ) -> Result<Vec<PoolTransaction>> {
        Ok(self
            .get_all_pool(ctx, opts)
            .await?
            .into_iter()
            .filter(|tx| !tx.delivery_f)
            .collect())
    }

    pub async fn get_all_block(
        &self,
        ctx: &CoreContext,
        opts: &BlockQueryOptions,
    ) -> Result<BlockQueryResult> {
        let tenant = self.read_tenant(ctx, opts.tenant.as_deref())?;
        let blocks = self
            .block_rows(&tenant, opts.sort_order, opts.constrained_size)
            .await?;
        if !opts.bare_transaction {
            return Ok(BlockQueryResult::Blocks(blocks));
        }
        let mut txs: Vec<PoolTransaction> = blocks
            .into_iter()
            .filter_map(|b| b.data)
            .flatten()
            .collect();
        txs.sort_by(|a, b| match opts.sort_order {
            SortOrder::IdAsc => a.id.cmp(&b.id),
            SortOrder::IdDesc => b.id.cmp(&a.id),
        });
        Ok(BlockQueryResult::Transactions(txs))
    }

    /// Pool plus flattened blocks, one merged list.
    pub async fn get_all(
        &self,
        ctx: &CoreContext,
        opts: &CombinedQueryOptions,
    ) -> Result<Vec<PoolTransaction>> {
        let tenant = self.read_tenant(ctx, opts.tenant.as_deref())?;
        let mut rows = self.pool_rows(&tenant, SortOrder::IdAsc, None).await?;
        if opts.exclude_nonpropagate {
            rows.retain(|tx| tx.delivery_f);
        }
        for block in self.block_rows(&tenant, SortOrder::IdAsc, None).await? {
            if let Some(data) = block.data {
                rows.extend(data);
            }
        }
        rows.sort_by(|a, b| match opts.sort_order {
            SortOrder::IdAsc => a.id.cmp(&b.id),
            SortOrder::IdDesc => b.id.cmp(&a.id),
        });
        Ok(rows)
    }

    /// Newest block by id; `data` is stripped for transport efficiency.
    pub async fn get_last_block(
        &self,
        ctx: &CoreContext,
        opts: &LastBlockOptions,
    ) -> Result<Option<Block>> {
        let tenant = self.read_tenant(ctx, opts.tenant.as_deref())?;
        let mut cursor = self
            .datastore
            .get_block_cursor(Some(&tenant), &CursorOptions::first())
            .await?;
        let block = cursor.next().map(|mut b| {
            b.data = None;
            b
        });
        cursor.close();
        Ok(block)
    }

    pub async fn get_search_by_oid(
        &self,
        ctx: &CoreContext,
        oid: &ObjectId,
        opts: &OidQueryOptions,
    ) -> Result<Option<OidSearchResult>> {
        let tenant = self.read_tenant(ctx, opts.tenant.as_deref())?;
        if opts.target_is_block {
            let found = self
                .block_rows(&tenant, SortOrder::IdAsc, None)
                .await?
                .into_iter()
                .find(|b| b.id == *oid);
            return Ok(found.map(|b| OidSearchResult::Block(Box::new(b))));
        }

        if let Some(tx) = self
            .pool_rows(&tenant, SortOrder::IdAsc, None)
            .await?
            .into_iter()
            .find(|tx| tx.id == *oid)
        {
            return Ok(Some(OidSearchResult::Transaction(Box::new(tx))));
        }
        for block in self.block_rows(&tenant, SortOrder::IdAsc, None).await? {
            if let Some(tx) = block
                .data
                .into_iter()
                .flatten()
                .find(|tx| tx.id == *oid)
            {
                return Ok(Some(OidSearchResult::Transaction(Box::new(tx))));
            }
        }
        Ok(None)
    }

    pub async fn get_search_by_json(
        &self,
        ctx: &CoreContext,
        opts: &JsonQueryOptions,
    ) -> Result<Vec<PoolTransaction>> {
        if opts.matcher_type != "strict" {
            return Err(ModuleError::new(
                ErrorKind::Validation,
                COMPONENT,
                "getSearchByJson",
                "CheckMatcherType",
                format!("NotImplemented: matcherType {}", opts.matcher_type),
            ));
        }
        let combined = CombinedQueryOptions {
            tenant: opts.tenant.clone(),
            sort_order: opts.sort_order,
            exclude_nonpropagate: false,
        };
        Ok(self
            .get_all(ctx, &combined)
            .await?
            .into_iter()
            .filter(|tx| tx.matches_strict(&opts.key, &opts.value))
            .collect())
    }

    /// Validate and admit a user transaction into the pool.
    pub async fn post_by_json(&self, ctx: &CoreContext, body: &Value) -> Result<ObjectId> {
        const FUNCTION: &str = "postByJson";

        let map = body.as_object().ok_or_else(|| {
            ModuleError::validation(COMPONENT, FUNCTION, "CheckKeys", "body must be a JSON object")
        })?;
        for key in map.keys() {
            if !casualchain_common::api::PostJsonOptions::ALLOWED_KEYS.contains(&key.as_str()) {
                return Err(ModuleError::validation(
                    COMPONENT,
                    FUNCTION,
                    "CheckKeys",
                    format!("unknown key {}", key),
                ));
            }
        }
        let kind_str = map.get("type").and_then(Value::as_str).ok_or_else(|| {
            ModuleError::validation(COMPONENT, FUNCTION, "CheckKeys", "type is missing")
        })?;
        let kind = TxKind::from_str(kind_str).map_err(|_| {
            ModuleError::validation(
                COMPONENT,
                FUNCTION,
                "CheckKeys",
                format!("illegal type {}", kind_str),
            )
        })?;

        let prev_id = match map.get("prev_id").and_then(Value::as_str) {
            Some(raw) => Some(ObjectId::from_hex(raw).map_err(|e| {
                ModuleError::validation(COMPONENT, FUNCTION, "CheckPrevId", e.to_string())
            })?),
            None => None,
        };
        if kind.requires_prev_id() && prev_id.is_none() {
            return Err(ModuleError::validation(
                COMPONENT,
                FUNCTION,
                "CheckPrevId",
                format!("type {} requires prev_id", kind),
            ));
        }

        let data = map.get("data").cloned().ok_or_else(|| {
            ModuleError::validation(COMPONENT, FUNCTION, "CheckKeys", "data is missing")
        })?;
        if !data.is_object() {
            return Err(ModuleError::validation(
                COMPONENT,
                FUNCTION,
                "CheckDataType",
                "data must be a JSON object",
            ));
        }
        let size = serde_json::to_vec(&data)
            .map_err(|e| ModuleError::internal(COMPONENT, FUNCTION, e.to_string()))?
            .len();
        if size > MAX_TX_DATA_SIZE {
            return Err(ModuleError::validation(
                COMPONENT,
                FUNCTION,
                "CheckDataSize",
                format!("data is {} bytes, cap is {}", size, MAX_TX_DATA_SIZE),
            ));
        }

        let requested = map.get("tenant").and_then(Value::as_str);
        let tenant = ctx
            .resolve_tenant(requested)
            .map_err(|e| e.at("CheckTenant"))?;
        if ctx.system.is_closed(&tenant).await {
            return Err(ModuleError::new(
                ErrorKind::Forbidden,
                COMPONENT,
                FUNCTION,
                "CheckTenant",
                format!("tenant {} is closed", tenant),
            ));
        }

        // an update/delete must chain onto something this node knows
        if let Some(prev) = &prev_id {
            let lookup = OidQueryOptions {
                tenant: Some(tenant.clone()),
                target_is_block: false,
            };
            if self.get_search_by_oid(ctx, prev, &lookup).await?.is_none() {
                return Err(ModuleError::validation(
                    COMPONENT,
                    FUNCTION,
                    "CheckPrevId",
                    format!("prev_id {} not found in tenant {}", prev, tenant),
                ));
            }
        }

        let compat = map
            .get("compatDateTime")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let tx = PoolTransaction {
            id: ObjectId::generate(),
            tenant: tenant.clone(),
            kind,
            settime: SetTime::now(compat),
            prev_id,
            delivery_f: false,
            data,
        };
        self.datastore.set_pool_new_data(&tx, &tenant).await?;
        debug!("admitted {} into tenant {}", tx.id, tenant);
        Ok(tx.id)
    }

    /// Walk the `prevId` chain backwards from `oid` across pool and blocks.
    /// A missing predecessor ends the walk with the partial chain.
    pub async fn get_history_by_oid(
        &self,
        ctx: &CoreContext,
        oid: &ObjectId,
        tenant: Option<&str>,
    ) -> Result<Vec<PoolTransaction>> {
        let tenant = self.read_tenant(ctx, tenant)?;
        let mut everything = self.pool_rows(&tenant, SortOrder::IdAsc, None).await?;
        for block in self.block_rows(&tenant, SortOrder::IdAsc, None).await? {
            if let Some(data) = block.data {
                everything.extend(data);
            }
        }

        let mut history = Vec::new();
        let mut visited: HashSet<ObjectId> = HashSet::new();
        let mut cursor = Some(*oid);
        while let Some(current) = cursor {
            if !visited.insert(current) {
                break;
            }
            match everything.iter().find(|tx| tx.id == current) {
                Some(tx) => {
                    history.push(tx.clone());
                    cursor = tx.prev_id;
                }
                None => break,
            }
        }
        if history.is_empty() {
            return Err(ModuleError::not_found(
                COMPONENT,
                "getHistoryByOid",
                format!("no transaction {}", oid),
            ));
        }
        Ok(history)
    }

    /// Total transactions for a tenant, pooled and blocked.
    pub async fn get_transaction_height(
        &self,
        ctx: &CoreContext,
        tenant: Option<&str>,
    ) -> Result<u64> {
        let tenant = self.read_tenant(ctx, tenant)?;
        let pooled = self.pool_rows(&tenant, SortOrder::IdAsc, None).await?.len() as u64;
        let blocked: u64 = self
            .block_rows(&tenant, SortOrder::IdAsc, None)
            .await?
            .iter()
            .map(|b| b.size)
            .sum();
        Ok(pooled + blocked)
    }
}
