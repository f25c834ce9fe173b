//! Cross-module integration tests: single-node ledger flows and in-process
//! two-node clusters with real TCP channels over ephemeral ports.

mod cluster;
mod ledger_flow;

use crate::config::{ConfigStore, InternodeConfig, KeyringConfig, NodeConfig, NodeMode, PeerEntry};
use crate::core::{datastore::MemoryDatastore, keyring::Keyring, CoreContext};
use crate::internode::InternodeModule;
use std::{path::PathBuf, sync::Arc};
use tempdir::TempDir;
use tokio::{net::TcpListener, task::JoinHandle};

pub(crate) const ADMIN: &str = "a24e797d-84ae-45a8-93d5-0b966b8b009b";
pub(crate) const DEFAULT_TENANT: &str = "8c8e794a-5528-4e95-a8cd-b2a6b0ed54b1";

pub(crate) struct TestNode {
    pub ctx: Arc<CoreContext>,
    server: Option<JoinHandle<()>>,
    _keys: TempDir,
}

impl Drop for TestNode {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            server.abort();
        }
    }
}

fn node_config(name: &str, port: u16, peers: &[(String, u16)], keys: &TempDir) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.system.node_mode = NodeMode::Testing;
    config.system.administration_id = ADMIN.to_string();
    config.system.default_tenant_id = DEFAULT_TENANT.to_string();
    config.internode = InternodeConfig {
        self_name: name.to_string(),
        self_host: "127.0.0.1".to_string(),
        self_port: port,
        retry_budget: 5,
        timeout_ms: 2_000,
        nodes: peers
            .iter()
            .map(|(peer, port)| PeerEntry {
                name: peer.clone(),
                host: "127.0.0.1".to_string(),
                port: *port,
                allow_outgoing: true,
            })
            .collect(),
    };
    config.keyring = KeyringConfig {
        sign_key_file: keys.path().join("sign.pem").to_string_lossy().to_string(),
        verify_key_file: keys.path().join("verify.pem").to_string_lossy().to_string(),
        create_keys_if_no_sign_key_exists: true,
    };
    config
}

/// A node wired onto an already-bound listener; peers are given by their
/// real ephemeral ports.
pub(crate) async fn build_node(
    name: &str,
    listener: TcpListener,
    peers: &[(String, u16)],
) -> TestNode {
    let keys = TempDir::new(&format!("keys-{}", name)).unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = node_config(name, port, peers, &keys);

    let keyring = Arc::new(Keyring::init(&config.keyring, name).unwrap());
    let datastore = Arc::new(MemoryDatastore::new(ADMIN));
    let internode = Arc::new(InternodeModule::new(&config.internode));
    let conf_store = Arc::new(ConfigStore::new(PathBuf::from("test.json"), config.clone()));
    let ctx = CoreContext::new(conf_store, &config, datastore, keyring, internode.clone());

    let server = tokio::spawn(internode.run_server(ctx.clone(), listener));
    TestNode {
        ctx,
        server: Some(server),
        _keys: keys,
    }
}

/// A node with no peers and no listener, for single-node flows.
pub(crate) async fn solo_node(name: &str) -> TestNode {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    build_node(name, listener, &[]).await
}

/// Two nodes that know each other.
pub(crate) async fn two_nodes() -> (TestNode, TestNode) {
    let l1 = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let l2 = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let p1 = l1.local_addr().unwrap().port();
    let p2 = l2.local_addr().unwrap().port();

    let n1 = build_node("node1", l1, &[("node2".to_string(), p2)]).await;
    let n2 = build_node("node2", l2, &[("node1".to_string(), p1)]).await;
    (n1, n2)
}

/// Publish both nodes' keys and create the cluster genesis, the same
/// bootstrap `*+init` modes run at startup.
pub(crate) async fn bootstrap_cluster(n1: &TestNode, n2: &TestNode) {
    n1.ctx.keyring.post_self_public_keys(&n1.ctx).await.unwrap();
    n2.ctx.keyring.post_self_public_keys(&n2.ctx).await.unwrap();
    n1.ctx.system.post_delivery_pool(&n1.ctx, true).await.unwrap();
    n2.ctx.system.post_delivery_pool(&n2.ctx, true).await.unwrap();
    n1.ctx.system.post_genesis_block(&n1.ctx).await.unwrap();
}
