//! Cooperative-signing block formation.
//!
//! One tenant forms one block at a time. The miner for a height is chosen
//! round-robin over the sorted node list; it declares a candidate to every
//! peer, the peers sign it along a deterministic ring, and the miner seals
//! and broadcasts once a quorum of signatures returned. Concurrent
//! declarations at the same height are resolved in favor of the
//! lexicographically smaller miner name.

use crate::core::{datastore::CursorOptions, CoreContext};
use casualchain_common::{
    api::SortOrder,
    block::Block,
    error::{ErrorKind, ModuleError, Result},
    internode::{AddBlockBody, Ca3Response, CandidateBody, RequestKind},
};
use log::{debug, info, warn};
use std::{collections::HashMap, time::Duration};
use tokio::sync::RwLock;

const COMPONENT: &str = "ca3";

#[derive(Clone, Debug)]
struct Declaration {
    height: u64,
    miner: String,
}

pub struct Ca3Module {
    /// tenant -> declaration currently being signed somewhere in the ring.
    inflight: RwLock<HashMap<String, Declaration>>,
    /// Miner-side candidates told to wait by a peer.
    stashed: RwLock<HashMap<String, Block>>,
}

impl Default for Ca3Module {
    fn default() -> Self {
        Self::new()
    }
}

impl Ca3Module {
    pub fn new() -> Self {
        Self {
            inflight: RwLock::new(HashMap::new()),
            stashed: RwLock::new(HashMap::new()),
        }
    }

    /// Round-robin miner for the next height of a tenant.
    pub fn designated_miner(names: &[String], height: u64) -> Option<&String> {
        if names.is_empty() {
            return None;
        }
        names.get(height as usize % names.len())
    }

    /// Highest block of a tenant, if any. The explicit tenant check keeps
    /// this correct even for the administration tenant, whose cursor reads
    /// across tenants.
    pub async fn last_block(ctx: &CoreContext, tenant: &str) -> Result<Option<Block>> {
        let blocks = ctx
            .datastore
            .get_block_cursor(Some(tenant), &CursorOptions::sorted(SortOrder::IdAsc))
            .await?
            .drain();
        Ok(blocks
            .into_iter()
            .filter(|b| b.tenant == tenant)
            .max_by_key(|b| b.height))
    }

    /// Candidate verification shared by declare and sign. Returns the
    /// refusal reason when the candidate cannot be signed here.
    async fn refusal_reason(ctx: &CoreContext, candidate: &Block) -> Result<Option<String>> {
        if candidate.height == 0 {
            return Ok(Some("genesis is not formed cooperatively".to_string()));
        }
        let data = match &candidate.data {
            Some(data) => data,
            None => return Ok(Some("candidate has no data".to_string())),
        };
        if data.len() as u64 != candidate.size {
            return Ok(Some("size does not match data".to_string()));
        }
        let admin = ctx.admin_id();
        if data
            .iter()
            .any(|tx| tx.tenant != candidate.tenant && tx.tenant != admin)
        {
            return Ok(Some("foreign tenant inside candidate".to_string()));
        }

        match Self::last_block(ctx, &candidate.tenant).await? {
            None => Ok(Some("no local chain for tenant".to_string())),
            Some(last) => {
                if !candidate.extends(&last) {
                    Ok(Some(format!(
                        "does not extend local height {} ({})",
                        last.height,
                        last.hash.as_deref().unwrap_or("unsealed")
                    )))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// CA3 step 1, peer side. Accept or tell the miner to stash.
    pub async fn handle_declare(&self, ctx: &CoreContext, candidate: Block) -> Result<Ca3Response> {
        if let Some(reason) = Self::refusal_reason(ctx, &candidate).await? {
            debug!("refusing declaration for {}: {}", candidate.tenant, reason);
            return Ok(Ca3Response::Store { reason });
        }

        let mut inflight = self.inflight.write().await;
        if let Some(existing) = inflight.get(&candidate.tenant) {
            if existing.height == candidate.height && existing.miner != candidate.miner {
                // smaller miner name wins the tie
                if existing.miner < candidate.miner {
                    return Ok(Ca3Response::Store {
                        reason: format!("yielding to concurrent miner {}", existing.miner),
                    });
                }
                // the newcomer wins; a stashed local candidate is stale now
                self.stashed.write().await.remove(&candidate.tenant);
            }
        }
        inflight.insert(
            candidate.tenant.clone(),
            Declaration {
                height: candidate.height,
                miner: candidate.miner.clone(),
            },
        );
        Ok(Ca3Response::Sign)
    }

    /// CA3 step 2, peer side: verify, sign, forward along the ring. The
    /// final candidate propagates back through the chain of responses.
    pub async fn handle_sign_and_forward(
        &self,
        ctx: &CoreContext,
        mut candidate: Block,
    ) -> Result<Ca3Response> {
        let presign = candidate.presign_value().map_err(|e| {
            ModuleError::internal(COMPONENT, "handle_sign_and_forward", e.to_string())
        })?;
        for (node, sig) in &candidate.signedby {
            let valid = ctx
                .keyring
                .verify_by_public_key(ctx, sig, &presign, node)
                .await?;
            if !valid {
                warn!("SignatureRejected: {} on candidate for {}", node, candidate.tenant);
                return Err(ModuleError::new(
                    ErrorKind::SignatureRejected,
                    COMPONENT,
                    "handle_sign_and_forward",
                    "VerifySignedBy",
                    format!("signature of {} does not verify", node),
                ));
            }
        }
        if candidate.signcounter as usize != candidate.signedby.len() {
            return Err(ModuleError::new(
                ErrorKind::SignatureRejected,
                COMPONENT,
                "handle_sign_and_forward",
                "VerifySignedBy",
                "signcounter does not match signature set",
            ));
        }

        if let Some(reason) = Self::refusal_reason(ctx, &candidate).await? {
            debug!("storing candidate for {}: {}", candidate.tenant, reason);
            return Ok(Ca3Response::Store { reason });
        }

        let self_name = ctx.self_name();
        if !candidate.signedby.contains_key(&self_name) {
            let sig = ctx.keyring.sign_by_private_key(&presign)?;
            candidate.signedby.insert(self_name.clone(), sig);
            candidate.signcounter += 1;
        }

        self.inflight.write().await.insert(
            candidate.tenant.clone(),
            Declaration {
                height: candidate.height,
                miner: candidate.miner.clone(),
            },
        );

        self.forward_or_finish(ctx, candidate, &self_name).await
    }

    /// Pass the candidate to the next ring member, skipping unreachable
    /// peers; when the ring closes back on the miner, the candidate is
    /// final.
    async fn forward_or_finish(
        &self,
        ctx: &CoreContext,
        candidate: Block,
        after: &str,
    ) -> Result<Ca3Response> {
        let ring = ctx.conf.current().await.sorted_node_names();
        let start = ring.iter().position(|n| n == after).unwrap_or(0);
        let hop_timeout =
            Duration::from_millis(ctx.conf.current().await.internode.timeout_ms * ring.len() as u64);

        for step in 1..=ring.len() {
            let next = &ring[(start + step) % ring.len()];
            if *next == candidate.miner {
                return Ok(Ca3Response::Final { block: candidate });
            }
            if *next == ctx.self_name() {
                continue;
            }
            match ctx
                .internode
                .call_with_timeout::<_, Ca3Response>(
                    next,
                    RequestKind::SignAndResendOrStore,
                    &CandidateBody {
                        candidate: candidate.clone(),
                    },
                    hop_timeout,
                )
                .await
            {
                Ok(response) => return Ok(response),
                Err(e) if e.kind == ErrorKind::Unreachable => {
                    warn!("ring member {} unreachable, skipping: {}", next, e.detail);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Ca3Response::Final { block: candidate })
    }

    /// Miner side: form and seal the next block for a tenant. Returns the
    /// sealed block, or None when the round was yielded or stored.
    pub async fn proceed_as_miner(
        &self,
        ctx: &CoreContext,
        tenant: &str,
        window: Vec<casualchain_common::transaction::PoolTransaction>,
    ) -> Result<Option<Block>> {
        let last = Self::last_block(ctx, tenant).await?.ok_or_else(|| {
            ModuleError::not_found(
                COMPONENT,
                "proceed_as_miner",
                format!("tenant {} has no genesis", tenant),
            )
        })?;
        let self_name = ctx.self_name();

        // a stored candidate is retried while it still extends the chain
        let mut candidate = match self.stashed.write().await.remove(tenant) {
            Some(stash) if stash.extends(&last) => stash,
            _ => {
                if window.is_empty() {
                    return Ok(None);
                }
                let last_hash = last.hash.clone().ok_or_else(|| {
                    ModuleError::internal(COMPONENT, "proceed_as_miner", "unsealed last block")
                })?;
                Block::new_candidate(tenant, last.height + 1, &last_hash, window, &self_name)
            }
        };

        let presign = candidate
            .presign_value()
            .map_err(|e| ModuleError::internal(COMPONENT, "proceed_as_miner", e.to_string()))?;
        if !candidate.signedby.contains_key(&self_name) {
            let sig = ctx.keyring.sign_by_private_key(&presign)?;
            candidate.signedby.insert(self_name.clone(), sig);
            candidate.signcounter += 1;
        }

        self.inflight.write().await.insert(
            tenant.to_string(),
            Declaration {
                height: candidate.height,
                miner: self_name.clone(),
            },
        );

        // step 1: declare to every allowed peer
        let peers = ctx.internode.allowed_peers();
        let declarations = peers.iter().map(|peer| {
            let body = CandidateBody {
                candidate: candidate.clone(),
            };
            async move {
                ctx.internode
                    .call::<_, Ca3Response>(peer, RequestKind::DeclareBlockCreation, &body)
                    .await
            }
        });
        for outcome in futures::future::join_all(declarations).await {
            match outcome {
                Ok(Ca3Response::Store { reason }) => {
                    debug!("declaration for {} stored by a peer: {}", tenant, reason);
                    self.stash(tenant, candidate).await;
                    return Ok(None);
                }
                Ok(_) => {}
                Err(e) if e.kind == ErrorKind::Unreachable => {
                    debug!("peer unreachable during declare: {}", e.detail);
                }
                Err(e) => {
                    self.stash(tenant, candidate).await;
                    return Err(e);
                }
            }
        }

        // step 2: collect signatures along the ring
        let signed = match self.forward_or_finish(ctx, candidate.clone(), &self_name).await? {
            Ca3Response::Final { block } => block,
            Ca3Response::Store { reason } => {
                debug!("candidate for {} stored mid-ring: {}", tenant, reason);
                self.stash(tenant, candidate).await;
                return Ok(None);
            }
            Ca3Response::Sign => candidate,
        };

        let quorum = ctx.conf.current().await.quorum();
        if (signed.signcounter as usize) < quorum {
            info!(
                "candidate for {} fell short of quorum ({}/{}), stashing",
                tenant, signed.signcounter, quorum
            );
            self.stash(tenant, signed).await;
            return Ok(None);
        }

        // step 3: seal and broadcast
        let mut sealed = signed;
        sealed
            .seal()
            .map_err(|e| ModuleError::internal(COMPONENT, "proceed_as_miner", e.to_string()))?;
        info!("sealed {}", sealed);

        self.accept_sealed_block(ctx, sealed.clone(), true).await?;
        let body = AddBlockBody {
            block: sealed.clone(),
            remove_from_pool: true,
        };
        for peer in &peers {
            if let Err(e) = ctx
                .internode
                .call::<_, casualchain_common::internode::AckResult>(
                    peer,
                    RequestKind::AddBlockCa3,
                    &body,
                )
                .await
            {
                warn!("seal broadcast to {} failed: {}", peer, e.detail);
            }
        }

        self.stashed.write().await.remove(tenant);
        Ok(Some(sealed))
    }

    async fn stash(&self, tenant: &str, candidate: Block) {
        self.inflight.write().await.remove(tenant);
        self.stashed
            .write()
            .await
            .insert(tenant.to_string(), candidate);
    }

    /// CA3 step 4: validate a sealed block against the local chain and
    /// persist it. Used for both cooperative blocks and genesis broadcast.
    pub async fn accept_sealed_block(
        &self,
        ctx: &CoreContext,
        block: Block,
        remove_from_pool: bool,
    ) -> Result<()> {
        const FUNCTION: &str = "accept_sealed_block";

        let hash_ok = block
            .verify_hash()
            .map_err(|e| ModuleError::internal(COMPONENT, FUNCTION, e.to_string()))?;
        if !hash_ok {
            return Err(ModuleError::new(
                ErrorKind::ConflictingBlock,
                COMPONENT,
                FUNCTION,
                "VerifyHash",
                format!("hash mismatch on block {}", block.id),
            ));
        }

        if block.signcounter as usize != block.signedby.len() || block.signedby.is_empty() {
            return Err(ModuleError::new(
                ErrorKind::SignatureRejected,
                COMPONENT,
                FUNCTION,
                "VerifySignedBy",
                "signcounter does not match signature set",
            ));
        }
        let presign = block
            .presign_value()
            .map_err(|e| ModuleError::internal(COMPONENT, FUNCTION, e.to_string()))?;
        for (node, sig) in &block.signedby {
            let valid = ctx
                .keyring
                .verify_by_public_key(ctx, sig, &presign, node)
                .await?;
            if !valid {
                warn!("SignatureRejected: {} on sealed block {}", node, block.id);
                return Err(ModuleError::new(
                    ErrorKind::SignatureRejected,
                    COMPONENT,
                    FUNCTION,
                    "VerifySignedBy",
                    format!("signature of {} does not verify", node),
                ));
            }
        }

        let last = Self::last_block(ctx, &block.tenant).await?;
        match (&last, block.height) {
            (Some(existing), 0) => {
                if existing.height == 0 && existing.hash == block.hash {
                    debug!("genesis {} already persisted", block.id);
                    return Ok(());
                }
                return Err(ModuleError::new(
                    ErrorKind::ConflictingBlock,
                    COMPONENT,
                    FUNCTION,
                    "VerifyChain",
                    format!(
                        "genesis for {} already exists at {}",
                        block.tenant, existing.id
                    ),
                ));
            }
            (None, h) if h > 0 => {
                return Err(ModuleError::new(
                    ErrorKind::ConflictingBlock,
                    COMPONENT,
                    FUNCTION,
                    "VerifyChain",
                    format!("no genesis to extend for {}", block.tenant),
                ));
            }
            (Some(existing), h) if h > 0 => {
                if existing.height >= block.height {
                    // duplicate seal for an occupied height
                    if existing.height == block.height && existing.hash == block.hash {
                        debug!("block {} already persisted", block.id);
                        return Ok(());
                    }
                    return Err(ModuleError::new(
                        ErrorKind::ConflictingBlock,
                        COMPONENT,
                        FUNCTION,
                        "VerifyChain",
                        format!(
                            "height {} already occupied on tenant {}",
                            block.height, block.tenant
                        ),
                    ));
                }
                if !block.extends(existing) {
                    return Err(ModuleError::new(
                        ErrorKind::ConflictingBlock,
                        COMPONENT,
                        FUNCTION,
                        "VerifyChain",
                        format!("block {} does not extend local chain", block.id),
                    ));
                }
            }
            _ => {}
        }

        let admin = ctx.admin_id();
        ctx.datastore.set_block_new_data(&block, &admin).await?;
        info!("persisted {}", block);

        if remove_from_pool {
            let ids = block.tx_ids();
            if !ids.is_empty() {
                let removed = ctx.datastore.pool_delete_transactions(&ids, &admin).await?;
                debug!("removed {} pooled txs now embedded in {}", removed, block.id);
            }
        }

        let mut inflight = self.inflight.write().await;
        if let Some(declared) = inflight.get(&block.tenant) {
            if declared.height <= block.height {
                inflight.remove(&block.tenant);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_designated_miner_round_robin() {
        let names = vec![
            "node1".to_string(),
            "node2".to_string(),
            "node3".to_string(),
        ];
        assert_eq!(Ca3Module::designated_miner(&names, 1).unwrap(), "node2");
        assert_eq!(Ca3Module::designated_miner(&names, 3).unwrap(), "node1");
        assert_eq!(Ca3Module::designated_miner(&names, 5).unwrap(), "node3");
        assert!(Ca3Module::designated_miner(&[], 1).is_none());
    }
}
