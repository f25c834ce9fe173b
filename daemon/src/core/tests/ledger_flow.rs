//! Single-node flows through the ledger facade and the block formation
//! path, using the in-memory datastore.

use super::{solo_node, DEFAULT_TENANT};
use casualchain_common::{
    api::{
        BlockQueryOptions, CombinedQueryOptions, JsonQueryOptions, LastBlockOptions,
        OidQueryOptions, PoolQueryOptions,
    },
    error::ErrorKind,
    transaction::ObjectId,
};
use serde_json::json;

#[tokio::test]
async fn test_post_then_search_roundtrip() {
    let node = solo_node("node1").await;
    let ctx = &node.ctx;

    let id = ctx
        .ledger
        .post_by_json(ctx, &json!({"type": "new", "data": {"desc": "test"}}))
        .await
        .unwrap();
    assert_eq!(id.to_hex().len(), 24);

    let found = ctx
        .ledger
        .get_search_by_oid(ctx, &id, &OidQueryOptions::default())
        .await
        .unwrap();
    assert!(found.is_some());

    let matched = ctx
        .ledger
        .get_search_by_json(
            ctx,
            &serde_json::from_value::<JsonQueryOptions>(
                json!({"key": "desc", "value": "test"}),
            )
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].id, id);
    assert_eq!(matched[0].data, json!({"desc": "test"}));
}

#[tokio::test]
async fn test_post_rejects_malformed_type() {
    let node = solo_node("node1").await;
    let ctx = &node.ctx;

    let err = ctx
        .ledger
        .post_by_json(ctx, &json!({"wrong": "new", "data": {"desc": "test"}}))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);
    assert_eq!(err.function, "postByJson");
    assert_eq!(err.position, "CheckKeys");

    let err = ctx
        .ledger
        .post_by_json(ctx, &json!({"type": "upsert", "data": {}}))
        .await
        .unwrap_err();
    assert_eq!(err.position, "CheckKeys");
}

#[tokio::test]
async fn test_post_rejects_update_without_prev_id() {
    let node = solo_node("node1").await;
    let err = node
        .ctx
        .ledger
        .post_by_json(&node.ctx, &json!({"type": "update", "data": {"desc": "x"}}))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);
    assert_eq!(err.position, "CheckPrevId");
}

#[tokio::test]
async fn test_post_rejects_non_object_data() {
    let node = solo_node("node1").await;
    let err = node
        .ctx
        .ledger
        .post_by_json(&node.ctx, &json!({"type": "new", "data": [1, 2, 3]}))
        .await
        .unwrap_err();
    assert_eq!(err.position, "CheckDataType");
}

#[tokio::test]
async fn test_post_rejects_oversize_payload() {
    let node = solo_node("node1").await;
    // ~15.00 MiB of payload once quoted: over the cap
    let blob = "a".repeat(15 * 1024 * 1024);
    let err = node
        .ctx
        .ledger
        .post_by_json(&node.ctx, &json!({"type": "new", "data": {"desc": blob}}))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);
    assert_eq!(err.position, "CheckDataSize");
}

#[tokio::test]
async fn test_post_rejects_closed_tenant() {
    let node = solo_node("node1").await;
    let ctx = &node.ctx;
    ctx.system.post_close_parcel(DEFAULT_TENANT).await.unwrap();

    let err = ctx
        .ledger
        .post_by_json(ctx, &json!({"type": "new", "data": {"desc": "x"}}))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Forbidden);

    ctx.system.post_open_parcel(DEFAULT_TENANT).await.unwrap();
    ctx.ledger
        .post_by_json(ctx, &json!({"type": "new", "data": {"desc": "x"}}))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_history_follows_prev_id_chain() {
    let node = solo_node("node1").await;
    let ctx = &node.ctx;

    let first = ctx
        .ledger
        .post_by_json(ctx, &json!({"type": "new", "data": {"rev": 1}}))
        .await
        .unwrap();
    let second = ctx
        .ledger
        .post_by_json(
            ctx,
            &json!({"type": "update", "prev_id": first.to_hex(), "data": {"rev": 2}}),
        )
        .await
        .unwrap();
    let third = ctx
        .ledger
        .post_by_json(
            ctx,
            &json!({"type": "update", "prev_id": second.to_hex(), "data": {"rev": 3}}),
        )
        .await
        .unwrap();

    let history = ctx
        .ledger
        .get_history_by_oid(ctx, &third, None)
        .await
        .unwrap();
    let ids: Vec<ObjectId> = history.iter().map(|tx| tx.id).collect();
    assert_eq!(ids, vec![third, second, first]);
    assert!(history.last().unwrap().prev_id.is_none());
}

#[tokio::test]
async fn test_post_rejects_dangling_prev_id() {
    let node = solo_node("node1").await;
    let err = node
        .ctx
        .ledger
        .post_by_json(
            &node.ctx,
            &json!({"type": "delete", "prev_id": ObjectId::generate().to_hex(), "data": {}}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.position, "CheckPrevId");
}

#[tokio::test]
async fn test_tenant_isolation_on_reads() {
    let node = solo_node("node1").await;
    let ctx = &node.ctx;

    ctx.ledger
        .post_by_json(
            ctx,
            &json!({"type": "new", "data": {"desc": "a"}, "tenant": "tenant-a"}),
        )
        .await
        .unwrap();

    let other = PoolQueryOptions {
        tenant: Some("tenant-b".to_string()),
        ..Default::default()
    };
    assert!(ctx.ledger.get_all_pool(ctx, &other).await.unwrap().is_empty());

    let own = PoolQueryOptions {
        tenant: Some("tenant-a".to_string()),
        ..Default::default()
    };
    assert_eq!(ctx.ledger.get_all_pool(ctx, &own).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_matcher_other_than_strict_is_not_implemented() {
    let node = solo_node("node1").await;
    let query: JsonQueryOptions =
        serde_json::from_value(json!({"key": "desc", "value": "x", "matcherType": "regex"}))
            .unwrap();
    let err = node
        .ctx
        .ledger
        .get_search_by_json(&node.ctx, &query)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);
    assert!(err.detail.contains("NotImplemented"));
}

#[tokio::test]
async fn test_solo_block_formation_and_invariants() {
    let node = solo_node("node1").await;
    let ctx = &node.ctx;

    ctx.system.post_genesis_block(ctx).await.unwrap();

    let a = ctx
        .ledger
        .post_by_json(ctx, &json!({"type": "new", "data": {"desc": "a"}}))
        .await
        .unwrap();
    let b = ctx
        .ledger
        .post_by_json(ctx, &json!({"type": "new", "data": {"desc": "b"}}))
        .await
        .unwrap();

    // no peers: delivery flags immediately
    let report = ctx.system.post_delivery_pool(ctx, true).await.unwrap();
    assert_eq!(report.delivered, 2);

    let sealed = ctx.system.post_append_blocks(ctx).await.unwrap();
    assert_eq!(sealed.len(), 1);
    let block = &sealed[0];
    assert_eq!(block.height, 1);
    assert_eq!(block.size, 2);

    // hash, signatures, chain link
    assert!(block.verify_hash().unwrap());
    assert_eq!(block.signcounter as usize, block.signedby.len());
    let tip = crate::core::ca3::Ca3Module::last_block(ctx, DEFAULT_TENANT)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tip.id, block.id);
    let chain = ctx
        .ledger
        .get_all_block(
            ctx,
            &BlockQueryOptions {
                tenant: Some(DEFAULT_TENANT.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    if let crate::core::ledger::BlockQueryResult::Blocks(blocks) = chain {
        assert_eq!(blocks.len(), 2);
        let genesis = blocks.iter().find(|b| b.height == 0).unwrap();
        assert_eq!(&block.prev_hash, genesis.hash.as_ref().unwrap());
    } else {
        panic!("expected whole blocks");
    }

    // embedded txs left the pool
    let remaining = ctx
        .ledger
        .get_all_pool(ctx, &PoolQueryOptions::default())
        .await
        .unwrap();
    assert!(remaining.iter().all(|tx| tx.id != a && tx.id != b));

    // last block is stripped for transport
    let last = ctx
        .ledger
        .get_last_block(ctx, &LastBlockOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(last.height, 1);
    assert!(last.data.is_none());

    // the merged view still contains both txs
    let all = ctx
        .ledger
        .get_all(ctx, &CombinedQueryOptions::default())
        .await
        .unwrap();
    assert!(all.iter().any(|tx| tx.id == a));
    assert!(all.iter().any(|tx| tx.id == b));

    assert_eq!(
        ctx.ledger.get_transaction_height(ctx, None).await.unwrap(),
        2
    );
}

#[tokio::test]
async fn test_bare_transaction_flattens_blocks() {
    let node = solo_node("node1").await;
    let ctx = &node.ctx;
    ctx.system.post_genesis_block(ctx).await.unwrap();
    ctx.ledger
        .post_by_json(ctx, &json!({"type": "new", "data": {"n": 1}}))
        .await
        .unwrap();
    ctx.ledger
        .post_by_json(ctx, &json!({"type": "new", "data": {"n": 2}}))
        .await
        .unwrap();
    ctx.system.post_delivery_pool(ctx, true).await.unwrap();
    ctx.system.post_append_blocks(ctx).await.unwrap();

    let result = ctx
        .ledger
        .get_all_block(
            ctx,
            &BlockQueryOptions {
                bare_transaction: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    match result {
        crate::core::ledger::BlockQueryResult::Transactions(txs) => {
            assert_eq!(txs.len(), 2);
            assert!(txs.windows(2).all(|w| w[0].id <= w[1].id));
        }
        _ => panic!("expected flattened transactions"),
    }
}

#[tokio::test]
async fn test_genesis_twice_conflicts() {
    let node = solo_node("node1").await;
    let ctx = &node.ctx;
    ctx.system.post_genesis_block(ctx).await.unwrap();
    let err = ctx.system.post_genesis_block(ctx).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ConflictingBlock);
}
