//! Persistence and secret-store contracts
//!
//! The orchestrator never touches storage directly; it goes through
//! [`ClusterStore`] for records, node pools and status history, and
//! [`SecretStore`] for credentials and kubeconfigs. [`memory`] provides
//! in-process implementations of both.

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use keel_common::model::{
    ClusterId, ClusterRecord, ClusterStatus, NodePoolRecord, OrgId, StatusHistoryEntry,
};
use keel_common::Result;

pub use memory::{MemoryClusterStore, MemorySecretStore};

/// Secret type tag for kubeconfig secrets
pub const KUBECONFIG_SECRET_TYPE: &str = "kubeconfig";

/// Value key holding the kubeconfig document inside a kubeconfig secret
pub const KUBECONFIG_VALUE_KEY: &str = "value";

/// Name of the secret holding a cluster's kubeconfig
pub fn kubeconfig_secret_name(cluster_name: &str) -> String {
    format!("{cluster_name}-kubeconfig")
}

/// Secret request storing `kubeconfig` for the named cluster
pub fn kubeconfig_secret_request(cluster_name: &str, kubeconfig: &str) -> SecretRequest {
    SecretRequest {
        name: kubeconfig_secret_name(cluster_name),
        secret_type: KUBECONFIG_SECRET_TYPE.to_string(),
        values: BTreeMap::from([(KUBECONFIG_VALUE_KEY.to_string(), kubeconfig.to_string())]),
        tags: vec![format!("cluster:{cluster_name}")],
    }
}

/// Cluster records, their node pools, and the status-history ledger
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Persist a new record with its node pools.
    ///
    /// Assigns the id, forces status `Creating`, and appends the genesis
    /// history entry in the same write. A duplicate name within the
    /// organization is a `Conflict`.
    async fn save(
        &self,
        record: ClusterRecord,
        node_pools: Vec<NodePoolRecord>,
    ) -> Result<ClusterRecord>;

    /// Current record; `NotFound` if absent
    async fn reload(&self, id: ClusterId) -> Result<ClusterRecord>;

    /// Write status and message, and append `entry` when given.
    ///
    /// Both writes land or neither does.
    async fn update_status(
        &self,
        id: ClusterId,
        status: ClusterStatus,
        message: &str,
        entry: Option<StatusHistoryEntry>,
    ) -> Result<()>;

    /// Write every field except status and status message
    async fn update_record(&self, record: &ClusterRecord) -> Result<()>;

    /// Remove the record and its node pools; history is kept
    async fn delete(&self, id: ClusterId) -> Result<()>;

    /// Append one entry to the ledger
    async fn append_status_history(&self, entry: StatusHistoryEntry) -> Result<()>;

    /// Every entry recorded for a cluster, oldest first
    async fn status_history(&self, id: ClusterId) -> Result<Vec<StatusHistoryEntry>>;

    /// The cluster's node pools, ordered by name
    async fn node_pools(&self, id: ClusterId) -> Result<Vec<NodePoolRecord>>;

    /// Insert or replace one node pool
    async fn save_node_pool(&self, id: ClusterId, pool: NodePoolRecord) -> Result<()>;

    /// Remove one node pool; `NotFound` if absent
    async fn delete_node_pool(&self, id: ClusterId, name: &str) -> Result<()>;

    /// Kubeconfig secret recorded for the cluster, if any
    async fn config_secret_id(&self, org_id: OrgId, cluster_id: ClusterId)
        -> Result<Option<String>>;
}

/// A secret to store
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretRequest {
    /// Name, unique within the organization
    pub name: String,
    /// Type tag (e.g. `kubeconfig`, `ssh`)
    pub secret_type: String,
    /// Opaque key/value payload
    pub values: BTreeMap<String, String>,
    /// Free-form tags
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A stored secret
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretHandle {
    /// Store-assigned id
    pub id: String,
    /// Name
    pub name: String,
    /// Type tag
    pub secret_type: String,
    /// Opaque key/value payload
    pub values: BTreeMap<String, String>,
}

/// Credential and kubeconfig storage
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Return the secret named `request.name`, creating it from `request` if absent
    async fn get_or_create(&self, org_id: OrgId, request: SecretRequest) -> Result<SecretHandle>;

    /// Store `request` under its name.
    ///
    /// An existing secret of that name keeps its id and has its type and
    /// values replaced.
    async fn create_or_update(&self, org_id: OrgId, request: SecretRequest)
        -> Result<SecretHandle>;

    /// Remove by id; `NotFound` if absent
    async fn delete(&self, org_id: OrgId, id: &str) -> Result<()>;

    /// Look up by name; `NotFound` if absent
    async fn get_by_name(&self, org_id: OrgId, name: &str) -> Result<SecretHandle>;

    /// Look up by id; `NotFound` if absent
    async fn get(&self, org_id: OrgId, id: &str) -> Result<SecretHandle>;
}
