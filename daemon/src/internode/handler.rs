//! Inbound request dispatch: one arm per wire request, each translating to
//! the owning module through the service locator.

use crate::core::CoreContext;
use casualchain_common::{
    config::WIRE_VERSION,
    error::{ModuleError, Result},
    internode::{
        AckResult, AddBlockBody, AddPoolBody, BlockDiffBody, BlockHeightResult, CandidateBody,
        CountResult, DigestBody, GetBlockBody, Packet, PoolDiffBody, RequestKind, TenantBody,
    },
};
use log::{debug, trace};
use serde_json::Value;

/// Handle one inbound request packet and build the response frame.
pub async fn dispatch(ctx: &CoreContext, packet: Packet) -> Packet {
    let self_name = ctx.self_name();
    match handle(ctx, &packet).await {
        Ok(body) => packet
            .success_response(&self_name, &body)
            .unwrap_or_else(|e| packet.failure_response(&self_name, &e)),
        Err(e) => {
            debug!(
                "request {:?} from {} failed: {}",
                packet.payload.request, packet.sender, e
            );
            packet.failure_response(&self_name, &e)
        }
    }
}

async fn handle(ctx: &CoreContext, packet: &Packet) -> Result<Value> {
    if packet.version != WIRE_VERSION {
        return Err(ModuleError::validation(
            "internode",
            "dispatch",
            "CheckVersion",
            format!("unsupported wire version {}", packet.version),
        ));
    }
    let kind = packet.payload.request.ok_or_else(|| {
        ModuleError::validation("internode", "dispatch", "CheckRequest", "request is missing")
    })?;
    trace!("handling {:?} from {}", kind, packet.sender);

    match kind {
        RequestKind::Ping => encode(&AckResult::ok()),

        RequestKind::AddPool => {
            let body: AddPoolBody = packet.decode_body()?;
            add_pool(ctx, body).await?;
            encode(&AckResult::ok())
        }

        RequestKind::AddBlockCa3 => {
            let body: AddBlockBody = packet.decode_body()?;
            ctx.ca3
                .accept_sealed_block(ctx, body.block, body.remove_from_pool)
                .await?;
            encode(&AckResult::ok())
        }

        RequestKind::GetPoolHeight => {
            let body: TenantBody = packet.decode_body()?;
            let count = ctx.system.pool_height(ctx, &body).await?;
            encode(&CountResult { count })
        }

        RequestKind::GetBlockHeight => {
            let body: TenantBody = packet.decode_body()?;
            let height = ctx.system.block_height(ctx, &body).await?;
            encode(&BlockHeightResult { height })
        }

        RequestKind::GetBlockDigest => {
            let body: DigestBody = packet.decode_body()?;
            let digest = ctx
                .system
                .local_digest(ctx, &body.tenant, body.fail_if_unhealthy)
                .await?;
            encode(&digest)
        }

        RequestKind::GetBlock => {
            let body: GetBlockBody = packet.decode_body()?;
            let result = ctx.system.get_block(ctx, &body).await?;
            encode(&result)
        }

        RequestKind::ExamineBlockDifference => {
            let body: BlockDiffBody = packet.decode_body()?;
            let result = ctx.system.examine_block_difference(ctx, &body).await?;
            encode(&result)
        }

        RequestKind::ExaminePoolDifference => {
            let body: PoolDiffBody = packet.decode_body()?;
            let result = ctx.system.examine_pool_difference(ctx, &body).await?;
            encode(&result)
        }

        RequestKind::DeclareBlockCreation => {
            let body: CandidateBody = packet.decode_body()?;
            let outcome = ctx.ca3.handle_declare(ctx, body.candidate).await?;
            encode(&outcome)
        }

        RequestKind::SignAndResendOrStore => {
            let body: CandidateBody = packet.decode_body()?;
            let outcome = ctx.ca3.handle_sign_and_forward(ctx, body.candidate).await?;
            encode(&outcome)
        }

        RequestKind::ResetTestNode => {
            if !ctx.node_mode().is_testing() {
                return Err(ModuleError::forbidden(
                    "internode",
                    "dispatch",
                    "ResetTestNode is only honored in testing modes",
                ));
            }
            ctx.datastore.reset().await?;
            encode(&AckResult::ok())
        }
    }
}

/// Incoming pool rows arrive propagated by definition; duplicates and rows
/// already embedded in a block are skipped.
async fn add_pool(ctx: &CoreContext, body: AddPoolBody) -> Result<()> {
    use crate::core::datastore::CursorOptions;
    use std::collections::HashSet;

    let admin = ctx.admin_id();
    let existing: HashSet<_> = ctx
        .datastore
        .get_pool_cursor(Some(&admin), &CursorOptions::default())
        .await?
        .drain()
        .into_iter()
        .map(|tx| tx.id)
        .collect();
    let mut blocked = HashSet::new();
    for block in ctx
        .datastore
        .get_block_cursor(Some(&admin), &CursorOptions::default())
        .await?
        .drain()
    {
        blocked.extend(block.tx_ids());
    }

    for mut tx in body.txs {
        if existing.contains(&tx.id) || blocked.contains(&tx.id) {
            trace!("skipping known tx {}", tx.id);
            continue;
        }
        tx.delivery_f = true;
        ctx.datastore.set_pool_new_data(&tx, &admin).await?;
    }
    Ok(())
}

fn encode<T: serde::Serialize>(body: &T) -> Result<Value> {
    serde_json::to_value(body)
        .map_err(|e| ModuleError::internal("internode", "dispatch", e.to_string()))
}
