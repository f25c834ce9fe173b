//! Node configuration: CLI arguments, the JSON config file, and the store
//! driving the admin edit/reset/apply cycle.

use casualchain_common::{
    config::{
        DEFAULT_ADMINAPI_PORT, DEFAULT_BLOCK_MAX_AGE_MS, DEFAULT_BLOCK_MIN_TXS,
        DEFAULT_INTERNODE_PORT, DEFAULT_RPC_RETRY_BUDGET, DEFAULT_RPC_TIMEOUT_MS,
        DEFAULT_USERAPI_PORT,
    },
    error::{ErrorKind, ModuleError, Result},
    time::TimestampMillis,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::atomic::{AtomicBool, Ordering},
};
use tokio::sync::RwLock;

#[derive(Parser, Clone, Debug)]
#[command(name = "casualchain")]
#[command(about = "CasualChain multi-tenant append-only ledger daemon")]
pub struct NodeArgs {
    /// Path to the JSON configuration file
    #[clap(short, long, default_value_t = String::from("config/node.json"))]
    pub config_file: String,

    /// Set log level (off, error, warn, info, debug, trace)
    #[clap(long, default_value_t = String::from("info"))]
    pub log_level: String,

    /// Disable the log file
    #[clap(long)]
    pub disable_file_logging: bool,

    /// Log filename
    #[clap(long, default_value_t = String::from("casualchain.log"))]
    pub filename_log: String,

    /// Logs directory
    #[clap(long, default_value_t = String::from("logs/"))]
    pub logs_path: String,

    /// Override the node mode from the config file
    #[clap(long)]
    pub node_mode: Option<NodeMode>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NodeMode {
    #[serde(rename = "prod")]
    #[default]
    Prod,
    #[serde(rename = "prod+init")]
    ProdInit,
    #[serde(rename = "testing")]
    Testing,
    #[serde(rename = "testing+init")]
    TestingInit,
}

impl NodeMode {
    pub fn is_testing(&self) -> bool {
        matches!(self, Self::Testing | Self::TestingInit)
    }

    /// Modes that create genesis and publish the node key at startup.
    pub fn wants_init(&self) -> bool {
        matches!(self, Self::ProdInit | Self::TestingInit)
    }
}

impl FromStr for NodeMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "prod" => Ok(Self::Prod),
            "prod+init" => Ok(Self::ProdInit),
            "testing" => Ok(Self::Testing),
            "testing+init" => Ok(Self::TestingInit),
            other => Err(format!("unknown node mode: {}", other)),
        }
    }
}

impl fmt::Display for NodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Prod => "prod",
            Self::ProdInit => "prod+init",
            Self::Testing => "testing",
            Self::TestingInit => "testing+init",
        };
        write!(f, "{}", s)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RestConfig {
    pub userapi_port: u16,
    pub adminapi_port: u16,
    pub userapi_user: String,
    pub userapi_password: String,
    pub adminapi_user: String,
    pub adminapi_password: String,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            userapi_port: DEFAULT_USERAPI_PORT,
            adminapi_port: DEFAULT_ADMINAPI_PORT,
            userapi_user: "user".to_string(),
            userapi_password: "password".to_string(),
            adminapi_user: "admin".to_string(),
            adminapi_password: "password".to_string(),
        }
    }
}

/// Document-store settings. The field names keep the historic `mongo_*`
/// wire names; the bundled driver maps dbname to a directory and the two
/// collection names to trees.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct DatastoreConfig {
    pub mongo_host: String,
    pub mongo_port: u16,
    pub mongo_dbname: String,
    pub mongo_dbuser: String,
    pub mongo_password: String,
    pub mongo_authdb: String,
    pub mongo_poolcollection: String,
    pub mongo_blockcollection: String,
    /// false keeps the pool in an in-memory queue.
    pub queue_ondisk: bool,
    /// Directory of the embedded store.
    pub db_path: String,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            mongo_host: "127.0.0.1".to_string(),
            mongo_port: 27017,
            mongo_dbname: "bcdb".to_string(),
            mongo_dbuser: String::new(),
            mongo_password: String::new(),
            mongo_authdb: "admin".to_string(),
            mongo_poolcollection: "pool".to_string(),
            mongo_blockcollection: "block".to_string(),
            queue_ondisk: true,
            db_path: "data/".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct KeyringConfig {
    pub sign_key_file: String,
    pub verify_key_file: String,
    pub create_keys_if_no_sign_key_exists: bool,
}

impl Default for KeyringConfig {
    fn default() -> Self {
        Self {
            sign_key_file: "keys/sign.pem".to_string(),
            verify_key_file: "keys/verify.pem".to_string(),
            create_keys_if_no_sign_key_exists: true,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct SystemConfig {
    pub node_mode: NodeMode,
    pub enable_internaltasks: bool,
    pub administration_id: String,
    pub default_tenant_id: String,
    pub enable_default_tenant: bool,
    /// Minimum delivered pool txs before a tenant is blocked.
    pub block_min_txs: usize,
    /// Age of the oldest delivered tx that forces block formation.
    pub block_max_age_ms: TimestampMillis,
    /// Pins the CA3 quorum; default is a majority of the node list.
    pub quorum: Option<usize>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            node_mode: NodeMode::Prod,
            enable_internaltasks: true,
            administration_id: "a24e797d-84ae-45a8-93d5-0b966b8b009b".to_string(),
            default_tenant_id: "8c8e794a-5528-4e95-a8cd-b2a6b0ed54b1".to_string(),
            enable_default_tenant: true,
            block_min_txs: DEFAULT_BLOCK_MIN_TXS,
            block_max_age_ms: DEFAULT_BLOCK_MAX_AGE_MS,
            quorum: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PeerEntry {
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Peers with allow_outgoing=false are known but never contacted.
    #[serde(default = "default_true")]
    pub allow_outgoing: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct InternodeConfig {
    pub self_name: String,
    pub self_host: String,
    pub self_port: u16,
    pub retry_budget: u32,
    pub timeout_ms: TimestampMillis,
    pub nodes: Vec<PeerEntry>,
}

impl Default for InternodeConfig {
    fn default() -> Self {
        Self {
            self_name: "node1".to_string(),
            self_host: "0.0.0.0".to_string(),
            self_port: DEFAULT_INTERNODE_PORT,
            retry_budget: DEFAULT_RPC_RETRY_BUDGET,
            timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
            nodes: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct EventConfig {
    pub delivery_interval_ms: TimestampMillis,
    pub append_interval_ms: TimestampMillis,
    pub fixpool_interval_ms: TimestampMillis,
    pub fixblock_interval_ms: TimestampMillis,
    pub synccache_interval_ms: TimestampMillis,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            delivery_interval_ms: 10_000,
            append_interval_ms: 60_000,
            fixpool_interval_ms: 300_000,
            fixblock_interval_ms: 300_000,
            synccache_interval_ms: 600_000,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct NodeConfig {
    pub rest: RestConfig,
    pub datastore: DatastoreConfig,
    pub keyring: KeyringConfig,
    pub system: SystemConfig,
    pub internode: InternodeConfig,
    pub event: EventConfig,
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ModuleError::new(
                ErrorKind::NotFound,
                "config",
                "load",
                "ReadFile",
                format!("{}: {}", path.display(), e),
            )
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            ModuleError::validation("config", "load", "ParseJson", e.to_string())
        })
    }

    /// All node names participating in the cluster, self included, sorted.
    /// This order drives miner selection and the signing ring.
    pub fn sorted_node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .internode
            .nodes
            .iter()
            .map(|n| n.name.clone())
            .collect();
        names.push(self.internode.self_name.clone());
        names.sort();
        names.dedup();
        names
    }

    /// Signatures needed to seal a block: a pinned value, or majority.
    pub fn quorum(&self) -> usize {
        self.system
            .quorum
            .unwrap_or(self.sorted_node_names().len() / 2 + 1)
    }
}

/// Holds the active configuration plus the pending edits of the admin
/// edit/reset/apply cycle. The watchdog swaps `pending` in on its tick.
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<NodeConfig>,
    pending: RwLock<Option<Value>>,
    reload_needed: AtomicBool,
}

impl ConfigStore {
    pub fn new(path: PathBuf, config: NodeConfig) -> Self {
        Self {
            path,
            current: RwLock::new(config),
            pending: RwLock::new(None),
            reload_needed: AtomicBool::new(false),
        }
    }

    pub async fn current(&self) -> NodeConfig {
        self.current.read().await.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `GET /sys/getconf[/:module]`
    pub async fn get_conf(&self, module: Option<&str>) -> Result<Value> {
        let conf = self.current.read().await;
        let all = serde_json::to_value(&*conf)
            .map_err(|e| ModuleError::internal("config", "get_conf", e.to_string()))?;
        match module {
            None => Ok(all),
            Some(name) => all.get(name).cloned().ok_or_else(|| {
                ModuleError::not_found("config", "get_conf", format!("no module {}", name))
            }),
        }
    }

    /// `POST /sys/editconf` — merge a patch into the pending copy. The edit
    /// only becomes active after applyconf and the next watchdog tick.
    pub async fn edit_conf(&self, patch: Value) -> Result<()> {
        if !patch.is_object() {
            return Err(ModuleError::validation(
                "config",
                "edit_conf",
                "CheckBody",
                "patch must be a JSON object",
            ));
        }
        let mut pending = self.pending.write().await;
        let mut base = match pending.take() {
            Some(v) => v,
            None => serde_json::to_value(&*self.current.read().await)
                .map_err(|e| ModuleError::internal("config", "edit_conf", e.to_string()))?,
        };
        merge_json(&mut base, &patch);

        // reject edits that would not parse back into a config
        let _: NodeConfig = serde_json::from_value(base.clone()).map_err(|e| {
            ModuleError::validation("config", "edit_conf", "CheckSchema", e.to_string())
        })?;

        *pending = Some(base);
        Ok(())
    }

    /// `POST /sys/resetconf`
    pub async fn reset_conf(&self) {
        *self.pending.write().await = None;
        self.reload_needed.store(false, Ordering::SeqCst);
    }

    /// `POST /sys/applyconf`
    pub async fn apply_conf(&self) -> Result<()> {
        if self.pending.read().await.is_none() {
            return Err(ModuleError::validation(
                "config",
                "apply_conf",
                "CheckPending",
                "nothing to apply",
            ));
        }
        self.reload_needed.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn reload_needed(&self) -> bool {
        self.reload_needed.load(Ordering::SeqCst)
    }

    /// Called by the watchdog: activate the pending configuration.
    pub async fn take_reload(&self) -> Result<Option<NodeConfig>> {
        if !self.reload_needed.swap(false, Ordering::SeqCst) {
            return Ok(None);
        }
        let pending = self.pending.write().await.take();
        match pending {
            None => Ok(None),
            Some(v) => {
                let parsed: NodeConfig = serde_json::from_value(v).map_err(|e| {
                    ModuleError::validation("config", "take_reload", "CheckSchema", e.to_string())
                })?;
                *self.current.write().await = parsed.clone();
                Ok(Some(parsed))
            }
        }
    }
}

fn merge_json(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (k, v) in patch_map {
                match base_map.get_mut(k) {
                    Some(slot) => merge_json(slot, v),
                    None => {
                        base_map.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (slot, v) => *slot = v.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> ConfigStore {
        ConfigStore::new(PathBuf::from("unused.json"), NodeConfig::default())
    }

    #[test]
    fn test_defaults_parse_from_empty_object() {
        let conf: NodeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(conf.rest.userapi_port, DEFAULT_USERAPI_PORT);
        assert!(conf.datastore.queue_ondisk);
    }

    #[test]
    fn test_node_mode_strings() {
        assert_eq!(NodeMode::from_str("testing+init").unwrap(), NodeMode::TestingInit);
        assert!(NodeMode::from_str("staging").is_err());
        let m: NodeMode = serde_json::from_str("\"prod+init\"").unwrap();
        assert!(m.wants_init());
    }

    #[test]
    fn test_quorum_majority() {
        let mut conf = NodeConfig::default();
        conf.internode.self_name = "node1".to_string();
        for name in ["node2", "node3"] {
            conf.internode.nodes.push(PeerEntry {
                name: name.to_string(),
                host: "127.0.0.1".to_string(),
                port: 7000,
                allow_outgoing: true,
            });
        }
        assert_eq!(conf.quorum(), 2);
        conf.system.quorum = Some(3);
        assert_eq!(conf.quorum(), 3);
    }

    #[test]
    fn test_sorted_node_names_include_self() {
        let mut conf = NodeConfig::default();
        conf.internode.self_name = "nodeB".to_string();
        conf.internode.nodes.push(PeerEntry {
            name: "nodeA".to_string(),
            host: "h".to_string(),
            port: 1,
            allow_outgoing: true,
        });
        assert_eq!(conf.sorted_node_names(), vec!["nodeA", "nodeB"]);
    }

    #[tokio::test]
    async fn test_edit_apply_cycle() {
        let store = store();
        store
            .edit_conf(json!({"rest": {"userapi_port": 9100}}))
            .await
            .unwrap();
        // not active until applied and taken
        assert_eq!(store.current().await.rest.userapi_port, DEFAULT_USERAPI_PORT);

        store.apply_conf().await.unwrap();
        let reloaded = store.take_reload().await.unwrap().unwrap();
        assert_eq!(reloaded.rest.userapi_port, 9100);
        assert_eq!(store.current().await.rest.userapi_port, 9100);
    }

    #[tokio::test]
    async fn test_reset_discards_pending() {
        let store = store();
        store
            .edit_conf(json!({"rest": {"userapi_port": 9100}}))
            .await
            .unwrap();
        store.reset_conf().await;
        assert!(store.apply_conf().await.is_err());
    }

    #[tokio::test]
    async fn test_edit_rejects_bad_schema() {
        let store = store();
        let res = store
            .edit_conf(json!({"rest": {"userapi_port": "not a number"}}))
            .await;
        assert!(res.is_err());
    }
}
