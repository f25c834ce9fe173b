pub mod ca3;
pub mod datastore;
pub mod event;
pub mod keyring;
pub mod ledger;
pub mod system;

#[cfg(test)]
mod tests;

use crate::config::{ConfigStore, NodeConfig, NodeMode};
use datastore::SharedDatastore;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;

/// Lifecycle state of a module, read by the watchdog.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleCondition {
    Unloaded,
    Loading,
    Initialized,
    Active,
    ReloadNeeded,
}

/// The service locator. Built once at startup and passed by reference at
/// call sites; no module stores it, so teardown stays a forest with the
/// datastore as the last leaf.
pub struct CoreContext {
    pub conf: Arc<ConfigStore>,
    pub datastore: SharedDatastore,
    pub keyring: Arc<keyring::Keyring>,
    pub ledger: Arc<ledger::Ledger>,
    pub ca3: Arc<ca3::Ca3Module>,
    pub system: Arc<system::SystemModule>,
    pub event: Arc<event::EventModule>,
    pub internode: Arc<crate::internode::InternodeModule>,

    // Identity values are pinned at startup; a hot reload may change
    // ports and intervals but never what tenant this node administers.
    admin_id: String,
    default_tenant_id: String,
    enable_default_tenant: bool,
    self_name: String,
    node_mode: NodeMode,

    conditions: RwLock<HashMap<String, ModuleCondition>>,
}

impl CoreContext {
    pub fn new(
        conf: Arc<ConfigStore>,
        config: &NodeConfig,
        datastore: SharedDatastore,
        keyring: Arc<keyring::Keyring>,
        internode: Arc<crate::internode::InternodeModule>,
    ) -> Arc<Self> {
        Arc::new(Self {
            conf,
            ledger: Arc::new(ledger::Ledger::new(datastore.clone())),
            datastore,
            keyring,
            ca3: Arc::new(ca3::Ca3Module::new()),
            system: Arc::new(system::SystemModule::new()),
            event: Arc::new(event::EventModule::new()),
            internode,
            admin_id: config.system.administration_id.clone(),
            default_tenant_id: config.system.default_tenant_id.clone(),
            enable_default_tenant: config.system.enable_default_tenant,
            self_name: config.internode.self_name.clone(),
            node_mode: config.system.node_mode,
            conditions: RwLock::new(HashMap::new()),
        })
    }

    pub fn admin_id(&self) -> String {
        self.admin_id.clone()
    }

    pub fn default_tenant_id(&self) -> String {
        self.default_tenant_id.clone()
    }

    pub fn enable_default_tenant(&self) -> bool {
        self.enable_default_tenant
    }

    pub fn self_name(&self) -> String {
        self.self_name.clone()
    }

    pub fn node_mode(&self) -> NodeMode {
        self.node_mode
    }

    /// Resolve the tenant a caller-facing operation acts on. The
    /// administration id maps onto the default tenant, which must be
    /// enabled.
    pub fn resolve_tenant(
        &self,
        requested: Option<&str>,
    ) -> casualchain_common::error::Result<String> {
        let tenant = requested.unwrap_or(&self.default_tenant_id);
        let effective = if tenant == self.admin_id {
            &self.default_tenant_id
        } else {
            tenant
        };
        if effective == self.default_tenant_id && !self.enable_default_tenant {
            return Err(casualchain_common::error::ModuleError::forbidden(
                "core",
                "resolve_tenant",
                "default tenant is disabled",
            ));
        }
        Ok(effective.to_string())
    }

    pub async fn set_condition(&self, module: &str, condition: ModuleCondition) {
        self.conditions
            .write()
            .await
            .insert(module.to_string(), condition);
    }

    pub async fn condition(&self, module: &str) -> ModuleCondition {
        self.conditions
            .read()
            .await
            .get(module)
            .copied()
            .unwrap_or(ModuleCondition::Unloaded)
    }
}
