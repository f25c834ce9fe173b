//! End-to-end flows: delivery, block formation, genesis, pool and block
//! repair, cache resync, tenant lifecycle. Every flow is idempotent and
//! safe to re-run; unreachable peers are skipped, never fatal.

use crate::core::{ca3::Ca3Module, datastore::CursorOptions, CoreContext};
use casualchain_common::{
    api::SortOrder,
    block::Block,
    error::{ErrorKind, ModuleError, Result},
    internode::{
        AckResult, AddBlockBody, AddPoolBody, BlockDiffBody, BlockDiffResult, BlockDigest,
        DigestBody, DigestEntry, DivergentHeight, GetBlockBody, GetBlockResult, PoolDiffBody,
        PoolDiffResult, RequestKind, TenantBody,
    },
    time::get_current_time_in_millis,
    transaction::{ObjectId, PoolTransaction},
};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;

const COMPONENT: &str = "system";

#[derive(Serialize, Clone, Debug, Default)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed_peers: Vec<String>,
}

#[derive(Serialize, Clone, Debug, Default)]
pub struct PoolFixReport {
    pub added: usize,
    pub removed: usize,
}

#[derive(Serialize, Clone, Debug, Default)]
pub struct BlockFixReport {
    pub adopted: usize,
    pub requeued: usize,
    pub unpooled: usize,
}

pub struct SystemModule {
    closed_parcels: RwLock<HashSet<String>>,
    /// tx id -> peers that have acknowledged it. A tx is flagged delivered
    /// once every allowed peer acked; failed peers retry on the next tick.
    delivery_acks: RwLock<HashMap<ObjectId, HashSet<String>>>,
}

impl Default for SystemModule {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemModule {
    pub fn new() -> Self {
        Self {
            closed_parcels: RwLock::new(HashSet::new()),
            delivery_acks: RwLock::new(HashMap::new()),
        }
    }

    /// Pool rows of exactly this tenant, id ascending. The explicit tenant
    /// check matters for the administration tenant, whose cursor reads
    /// across tenants.
    async fn tenant_pool(ctx: &CoreContext, tenant: &str) -> Result<Vec<PoolTransaction>> {
        let mut rows = ctx
            .datastore
            .get_pool_cursor(Some(tenant), &CursorOptions::sorted(SortOrder::IdAsc))
            .await?
            .drain();
        rows.retain(|tx| tx.tenant == tenant);
        Ok(rows)
    }

    /// Blocks of exactly this tenant, id ascending.
    async fn tenant_blocks(ctx: &CoreContext, tenant: &str) -> Result<Vec<Block>> {
        let mut rows = ctx
            .datastore
            .get_block_cursor(Some(tenant), &CursorOptions::sorted(SortOrder::IdAsc))
            .await?
            .drain();
        rows.retain(|b| b.tenant == tenant);
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Tenant lifecycle
    // ------------------------------------------------------------------

    pub async fn is_closed(&self, tenant: &str) -> bool {
        self.closed_parcels.read().await.contains(tenant)
    }

    pub async fn post_open_parcel(&self, tenant: &str) -> Result<()> {
        self.closed_parcels.write().await.remove(tenant);
        info!("tenant {} opened", tenant);
        Ok(())
    }

    pub async fn post_close_parcel(&self, tenant: &str) -> Result<()> {
        self.closed_parcels
            .write()
            .await
            .insert(tenant.to_string());
        info!("tenant {} closed", tenant);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------

    /// Propagate undelivered pool rows to every allowed peer. A row is
    /// flagged `deliveryF` only once the full peer set acknowledged it.
    pub async fn post_delivery_pool(
        &self,
        ctx: &CoreContext,
        immediate: bool,
    ) -> Result<DeliveryReport> {
        let admin = ctx.admin_id();
        let undelivered: Vec<PoolTransaction> = ctx
            .datastore
            .get_pool_cursor(Some(&admin), &CursorOptions::default())
            .await?
            .drain()
            .into_iter()
            .filter(|tx| !tx.delivery_f)
            .collect();
        if undelivered.is_empty() {
            return Ok(DeliveryReport::default());
        }
        debug!(
            "delivering {} pooled txs (immediate: {})",
            undelivered.len(),
            immediate
        );

        let peers = ctx.internode.allowed_peers();
        let mut failed_peers = Vec::new();
        {
            let acks = self.delivery_acks.read().await;
            let sends = peers.iter().map(|peer| {
                let batch: Vec<PoolTransaction> = undelivered
                    .iter()
                    .filter(|tx| {
                        acks.get(&tx.id)
                            .map(|seen| !seen.contains(peer))
                            .unwrap_or(true)
                    })
                    .cloned()
                    .collect();
                async move {
                    if batch.is_empty() {
                        return (peer.clone(), Ok(Vec::new()));
                    }
                    let ids: Vec<ObjectId> = batch.iter().map(|tx| tx.id).collect();
                    let outcome = ctx
                        .internode
                        .call::<_, AckResult>(peer, RequestKind::AddPool, &AddPoolBody { txs: batch })
                        .await
                        .map(|_| ids);
                    (peer.clone(), outcome)
                }
            });
            let outcomes = futures::future::join_all(sends).await;
            drop(acks);

            let mut acks = self.delivery_acks.write().await;
            for (peer, outcome) in outcomes {
                match outcome {
                    Ok(ids) => {
                        for id in ids {
                            acks.entry(id).or_default().insert(peer.clone());
                        }
                    }
                    Err(e) => {
                        warn!("delivery to {} failed: {}", peer, e.detail);
                        failed_peers.push(peer);
                    }
                }
            }
        }

        // flag rows the whole peer set has seen
        let mut flaggable = Vec::new();
        {
            let acks = self.delivery_acks.read().await;
            for tx in &undelivered {
                let acked_everywhere = peers.iter().all(|peer| {
                    acks.get(&tx.id)
                        .map(|seen| seen.contains(peer))
                        .unwrap_or(peers.is_empty())
                });
                if acked_everywhere {
                    flaggable.push(tx.id);
                }
            }
        }
        if !flaggable.is_empty() {
            ctx.datastore
                .pool_modify_reads_flag(&flaggable, &admin)
                .await?;
            let mut acks = self.delivery_acks.write().await;
            for id in &flaggable {
                acks.remove(id);
            }
            info!("{} txs delivered to the full peer set", flaggable.len());
        }

        Ok(DeliveryReport {
            delivered: flaggable.len(),
            failed_peers,
        })
    }

    // ------------------------------------------------------------------
    // Block formation
    // ------------------------------------------------------------------

    /// Run CA3 as miner for every tenant whose delivered pool is ripe and
    /// whose next height this node is designated for.
    pub async fn post_append_blocks(&self, ctx: &CoreContext) -> Result<Vec<Block>> {
        let config = ctx.conf.current().await;
        let names = config.sorted_node_names();
        let self_name = ctx.self_name();
        let now = get_current_time_in_millis();

        let mut sealed = Vec::new();
        for tenant in ctx.datastore.list_tenants().await? {
            let delivered: Vec<PoolTransaction> = Self::tenant_pool(ctx, &tenant)
                .await?
                .into_iter()
                .filter(|tx| tx.delivery_f)
                .collect();
            if delivered.is_empty() {
                continue;
            }

            let oldest = delivered[0].id.timestamp_millis();
            let ripe = delivered.len() >= config.system.block_min_txs
                || now.saturating_sub(oldest) > config.system.block_max_age_ms;
            if !ripe {
                continue;
            }

            let last = match Ca3Module::last_block(ctx, &tenant).await? {
                Some(last) => last,
                None => {
                    debug!("tenant {} has delivered txs but no genesis yet", tenant);
                    continue;
                }
            };
            let next_height = last.height + 1;
            match Ca3Module::designated_miner(&names, next_height) {
                Some(miner) if *miner == self_name => {}
                _ => continue,
            }

            match ctx.ca3.proceed_as_miner(ctx, &tenant, delivered).await {
                Ok(Some(block)) => sealed.push(block),
                Ok(None) => debug!("round for {} yielded or stored", tenant),
                Err(e) if e.kind == ErrorKind::Unreachable => {
                    warn!("block formation for {} skipped: {}", tenant, e.detail)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(sealed)
    }

    /// Create the height-0 block for every tenant that lacks one and
    /// broadcast it. Errors with ConflictingBlock when nothing was missing.
    pub async fn post_genesis_block(&self, ctx: &CoreContext) -> Result<Vec<Block>> {
        let mut tenants = ctx.datastore.list_tenants().await?;
        if ctx.enable_default_tenant() {
            let default = ctx.default_tenant_id();
            if !tenants.contains(&default) {
                tenants.push(default);
            }
        }
        let admin = ctx.admin_id();
        if !tenants.contains(&admin) {
            tenants.push(admin);
        }

        let self_name = ctx.self_name();
        let mut created = Vec::new();
        for tenant in tenants {
            if Ca3Module::last_block(ctx, &tenant).await?.is_some() {
                continue;
            }
            let mut genesis = Block::genesis(&tenant, &self_name);
            let presign = genesis
                .presign_value()
                .map_err(|e| ModuleError::internal(COMPONENT, "post_genesis_block", e.to_string()))?;
            let sig = ctx.keyring.sign_by_private_key(&presign)?;
            genesis.signedby.insert(self_name.clone(), sig);
            genesis.signcounter = 1;
            genesis
                .seal()
                .map_err(|e| ModuleError::internal(COMPONENT, "post_genesis_block", e.to_string()))?;

            ctx.ca3.accept_sealed_block(ctx, genesis.clone(), false).await?;
            info!("genesis created for tenant {}", tenant);

            let body = AddBlockBody {
                block: genesis.clone(),
                remove_from_pool: false,
            };
            for peer in ctx.internode.allowed_peers() {
                if let Err(e) = ctx
                    .internode
                    .call::<_, AckResult>(&peer, RequestKind::AddBlockCa3, &body)
                    .await
                {
                    warn!("genesis broadcast to {} failed: {}", peer, e.detail);
                }
            }
            created.push(genesis);
        }

        if created.is_empty() {
            return Err(ModuleError::new(
                ErrorKind::ConflictingBlock,
                COMPONENT,
                "post_genesis_block",
                "VerifyChain",
                "every tenant already has a genesis block",
            ));
        }
        Ok(created)
    }

    // ------------------------------------------------------------------
    // Repair: pool
    // ------------------------------------------------------------------

    /// Reconcile pool membership with every peer: pull what they have and
    /// we lack, drop what is already embedded in a block somewhere.
    pub async fn post_scan_and_fix_pool(&self, ctx: &CoreContext) -> Result<PoolFixReport> {
        let admin = ctx.admin_id();
        let mut report = PoolFixReport::default();

        for tenant in ctx.datastore.list_tenants().await? {
            let local = Self::tenant_pool(ctx, &tenant).await?;
            let local_ids: Vec<ObjectId> = local.iter().map(|tx| tx.id).collect();
            let blocked_here = self.blocked_ids(ctx, &tenant).await?;

            for peer in ctx.internode.allowed_peers() {
                let diff: PoolDiffResult = match ctx
                    .internode
                    .call(
                        &peer,
                        RequestKind::ExaminePoolDifference,
                        &PoolDiffBody {
                            ids: local_ids.clone(),
                            tenant: tenant.clone(),
                        },
                    )
                    .await
                {
                    Ok(diff) => diff,
                    Err(e) if e.kind == ErrorKind::Unreachable => {
                        warn!("pool scan skipped peer {}: {}", peer, e.detail);
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                for tx in diff.missing {
                    if local_ids.contains(&tx.id) || blocked_here.contains(&tx.id) {
                        continue;
                    }
                    ctx.datastore.set_pool_new_data(&tx, &admin).await?;
                    report.added += 1;
                }
                if !diff.blocked.is_empty() {
                    report.removed += ctx
                        .datastore
                        .pool_delete_transactions(&diff.blocked, &admin)
                        .await?;
                }
            }
        }
        if report.added + report.removed > 0 {
            info!(
                "pool repair: {} pulled from peers, {} already blocked",
                report.added, report.removed
            );
        }
        Ok(report)
    }

    /// Ids embedded in any local block of a tenant.
    async fn blocked_ids(&self, ctx: &CoreContext, tenant: &str) -> Result<HashSet<ObjectId>> {
        let mut ids = HashSet::new();
        for block in Self::tenant_blocks(ctx, tenant).await? {
            ids.extend(block.tx_ids());
        }
        Ok(ids)
    }

    // ------------------------------------------------------------------
    // Repair: blocks
    // ------------------------------------------------------------------

    /// Compare digests with every peer; where chains diverge, adopt the
    /// majority block per height and requeue txs that fell out.
    pub async fn post_scan_and_fix_block(&self, ctx: &CoreContext) -> Result<BlockFixReport> {
        let admin = ctx.admin_id();
        let mut report = BlockFixReport::default();
        let mut tenants = ctx.datastore.list_tenants().await?;
        if ctx.enable_default_tenant() && !tenants.contains(&ctx.default_tenant_id()) {
            tenants.push(ctx.default_tenant_id());
        }

        for tenant in tenants {
            let local = Self::tenant_blocks(ctx, &tenant).await?;
            let by_height: BTreeMap<u64, &Block> =
                local.iter().map(|b| (b.height, b)).collect();
            let local_digest = digest_of(&local);
            let entries: Vec<DigestEntry> = by_height
                .values()
                .filter_map(|b| {
                    b.hash.as_ref().map(|h| DigestEntry {
                        height: b.height,
                        hash: h.clone(),
                    })
                })
                .collect();

            // collect per-height candidates from every divergent peer
            let mut votes: HashMap<u64, Vec<(String, String, ObjectId)>> = HashMap::new();
            for peer in ctx.internode.allowed_peers() {
                let peer_digest: BlockDigest = match ctx
                    .internode
                    .call(
                        &peer,
                        RequestKind::GetBlockDigest,
                        &DigestBody {
                            tenant: tenant.clone(),
                            fail_if_unhealthy: false,
                        },
                    )
                    .await
                {
                    Ok(d) => d,
                    Err(e) if e.kind == ErrorKind::Unreachable => {
                        warn!("block scan skipped peer {}: {}", peer, e.detail);
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                if peer_digest == local_digest {
                    continue;
                }

                let diff: BlockDiffResult = match ctx
                    .internode
                    .call(
                        &peer,
                        RequestKind::ExamineBlockDifference,
                        &BlockDiffBody {
                            entries: entries.clone(),
                            tenant: tenant.clone(),
                        },
                    )
                    .await
                {
                    Ok(d) => d,
                    Err(e) if e.kind == ErrorKind::Unreachable => continue,
                    Err(e) => return Err(e),
                };
                for DivergentHeight { height, oid, hash } in diff.divergent {
                    if let (Some(oid), Some(hash)) = (oid, hash) {
                        votes.entry(height).or_default().push((peer.clone(), hash, oid));
                    }
                }
            }

            if votes.is_empty() {
                continue;
            }

            let mut heights: Vec<u64> = votes.keys().copied().collect();
            heights.sort_unstable();
            let mut adopted_blocks: Vec<Block> = Vec::new();
            let mut replaced_blocks: Vec<Block> = Vec::new();

            for height in heights {
                let candidates = &votes[&height];
                let local_block = by_height.get(&height);

                // tally hashes; the local chain gets one vote
                let mut tally: HashMap<&str, usize> = HashMap::new();
                for (_, hash, _) in candidates {
                    *tally.entry(hash.as_str()).or_default() += 1;
                }
                if let Some(block) = local_block {
                    if let Some(hash) = &block.hash {
                        *tally.entry(hash.as_str()).or_default() += 1;
                    }
                }
                let (winner, _) = match tally
                    .iter()
                    .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
                {
                    Some((hash, count)) => (hash.to_string(), *count),
                    None => continue,
                };

                if local_block
                    .and_then(|b| b.hash.as_ref())
                    .map(|h| *h == winner)
                    .unwrap_or(false)
                {
                    // the cluster majority already matches this node
                    continue;
                }
                let source = candidates.iter().find(|(_, hash, _)| *hash == winner);
                let (peer, _, oid) = match source {
                    Some(s) => s,
                    None => continue,
                };

                let fetched: GetBlockResult = match ctx
                    .internode
                    .call(
                        peer,
                        RequestKind::GetBlock,
                        &GetBlockBody {
                            oid: *oid,
                            tenant: tenant.clone(),
                            return_undefined_if_fail: true,
                        },
                    )
                    .await
                {
                    Ok(r) => r,
                    Err(e) if e.kind == ErrorKind::Unreachable => continue,
                    Err(e) => return Err(e),
                };
                let block = match fetched.block {
                    Some(b) => b,
                    None => continue,
                };
                if !block.verify_hash().unwrap_or(false) {
                    warn!("peer {} served a block with a bad hash, overruled", peer);
                    continue;
                }

                if let Some(old) = local_block {
                    replaced_blocks.push((*old).clone());
                    ctx.datastore.block_delete_blocks(&[old.id], &admin).await?;
                }
                ctx.datastore.set_block_new_data(&block, &admin).await?;
                report.adopted += 1;
                adopted_blocks.push(block);
            }

            if adopted_blocks.is_empty() {
                continue;
            }

            // txs that fell out of replaced blocks go back to the pool
            let still_blocked = self.blocked_ids(ctx, &tenant).await?;
            for old in replaced_blocks {
                for tx in old.data.into_iter().flatten() {
                    if still_blocked.contains(&tx.id) {
                        continue;
                    }
                    let mut requeued = tx;
                    requeued.delivery_f = true;
                    ctx.datastore.set_pool_new_data(&requeued, &admin).await?;
                    report.requeued += 1;
                }
            }
            // txs embedded in adopted blocks leave the pool
            let embedded: Vec<ObjectId> = adopted_blocks
                .iter()
                .flat_map(|b| b.tx_ids())
                .collect();
            if !embedded.is_empty() {
                report.unpooled += ctx
                    .datastore
                    .pool_delete_transactions(&embedded, &admin)
                    .await?;
            }
        }

        if report.adopted > 0 {
            info!(
                "block repair: {} adopted, {} requeued, {} unpooled",
                report.adopted, report.requeued, report.unpooled
            );
        }
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Cache sync
    // ------------------------------------------------------------------

    pub async fn post_sync_caches(&self, ctx: &CoreContext) -> Result<usize> {
        ctx.keyring.refresh_public_key_cache(ctx).await
    }

    // ------------------------------------------------------------------
    // Inbound examination handlers
    // ------------------------------------------------------------------

    /// `GetBlockDigest` response for this node.
    pub async fn local_digest(
        &self,
        ctx: &CoreContext,
        tenant: &str,
        fail_if_unhealthy: bool,
    ) -> Result<BlockDigest> {
        let mut blocks = Self::tenant_blocks(ctx, tenant).await?;
        blocks.sort_by_key(|b| b.height);

        if fail_if_unhealthy {
            for pair in blocks.windows(2) {
                if !pair[1].extends(&pair[0]) {
                    return Err(ModuleError::internal(
                        COMPONENT,
                        "local_digest",
                        format!("chain broken between heights {} and {}", pair[0].height, pair[1].height),
                    ));
                }
            }
        }
        Ok(digest_of(&blocks))
    }

    /// `ExamineBlockDifference` response: the heights where this node
    /// disagrees with the requester's (height, hash) list.
    pub async fn examine_block_difference(
        &self,
        ctx: &CoreContext,
        body: &BlockDiffBody,
    ) -> Result<BlockDiffResult> {
        let local = Self::tenant_blocks(ctx, &body.tenant).await?;
        let by_height: BTreeMap<u64, &Block> = local.iter().map(|b| (b.height, b)).collect();
        let requested: BTreeMap<u64, &str> = body
            .entries
            .iter()
            .map(|e| (e.height, e.hash.as_str()))
            .collect();

        let mut divergent = Vec::new();
        let top = by_height
            .keys()
            .max()
            .copied()
            .into_iter()
            .chain(requested.keys().max().copied())
            .max();
        let Some(top) = top else {
            return Ok(BlockDiffResult { divergent });
        };

        for height in 0..=top {
            let ours = by_height.get(&height);
            let theirs = requested.get(&height);
            let matches = match (ours, theirs) {
                (Some(block), Some(hash)) => block.hash.as_deref() == Some(*hash),
                (None, None) => true,
                _ => false,
            };
            if !matches {
                divergent.push(DivergentHeight {
                    height,
                    oid: ours.map(|b| b.id),
                    hash: ours.and_then(|b| b.hash.clone()),
                });
            }
        }
        Ok(BlockDiffResult { divergent })
    }

    /// `ExaminePoolDifference` response.
    pub async fn examine_pool_difference(
        &self,
        ctx: &CoreContext,
        body: &PoolDiffBody,
    ) -> Result<PoolDiffResult> {
        let local = Self::tenant_pool(ctx, &body.tenant).await?;
        let local_ids: HashSet<ObjectId> = local.iter().map(|tx| tx.id).collect();
        let blocked_here = self.blocked_ids(ctx, &body.tenant).await?;

        let missing = local
            .into_iter()
            .filter(|tx| !body.ids.contains(&tx.id))
            .collect();
        let extra = body
            .ids
            .iter()
            .filter(|id| !local_ids.contains(id) && !blocked_here.contains(id))
            .copied()
            .collect();
        let blocked = body
            .ids
            .iter()
            .filter(|id| blocked_here.contains(id))
            .copied()
            .collect();
        Ok(PoolDiffResult {
            missing,
            extra,
            blocked,
        })
    }

    /// `GetBlock` response.
    pub async fn get_block(
        &self,
        ctx: &CoreContext,
        body: &GetBlockBody,
    ) -> Result<GetBlockResult> {
        let found = Self::tenant_blocks(ctx, &body.tenant)
            .await?
            .into_iter()
            .find(|b| b.id == body.oid);
        if found.is_none() && !body.return_undefined_if_fail {
            return Err(ModuleError::not_found(
                COMPONENT,
                "get_block",
                format!("no block {} in tenant {}", body.oid, body.tenant),
            ));
        }
        Ok(GetBlockResult { block: found })
    }

    /// `GetPoolHeight` / `GetBlockHeight` responses.
    pub async fn pool_height(&self, ctx: &CoreContext, body: &TenantBody) -> Result<u64> {
        Ok(Self::tenant_pool(ctx, &body.tenant).await?.len() as u64)
    }

    pub async fn block_height(&self, ctx: &CoreContext, body: &TenantBody) -> Result<Option<u64>> {
        Ok(Ca3Module::last_block(ctx, &body.tenant)
            .await?
            .map(|b| b.height))
    }
}

fn digest_of(blocks: &[Block]) -> BlockDigest {
    let last = blocks.iter().max_by_key(|b| b.height);
    BlockDigest {
        last_hash: last.and_then(|b| b.hash.clone()),
        height: last.map(|b| b.height),
    }
}
