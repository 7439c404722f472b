//! In-process store implementations
//!
//! Each store keeps its state behind one lock, so every trait call is a single
//! atomic step. Status history lives apart from the records and survives
//! record deletion.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use keel_common::model::{
    ClusterId, ClusterRecord, ClusterStatus, NodePoolRecord, OrgId, StatusHistoryEntry,
};
use keel_common::{Error, Result};

use super::{ClusterStore, SecretHandle, SecretRequest, SecretStore};

#[derive(Default)]
struct ClusterState {
    last_id: ClusterId,
    records: BTreeMap<ClusterId, ClusterRecord>,
    pools: BTreeMap<ClusterId, BTreeMap<String, NodePoolRecord>>,
    history: Vec<StatusHistoryEntry>,
}

impl ClusterState {
    fn record_mut(&mut self, id: ClusterId) -> Result<&mut ClusterRecord> {
        self.records
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("cluster", id.to_string()))
    }

    fn pools_mut(&mut self, id: ClusterId) -> Result<&mut BTreeMap<String, NodePoolRecord>> {
        if !self.records.contains_key(&id) {
            return Err(Error::not_found("cluster", id.to_string()));
        }
        Ok(self.pools.entry(id).or_default())
    }
}

/// [`ClusterStore`] kept in memory
#[derive(Default)]
pub struct MemoryClusterStore {
    state: RwLock<ClusterState>,
}

impl MemoryClusterStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    /// True when no records are stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ClusterStore for MemoryClusterStore {
    async fn save(
        &self,
        mut record: ClusterRecord,
        node_pools: Vec<NodePoolRecord>,
    ) -> Result<ClusterRecord> {
        let mut state = self.state.write();

        let duplicate = state
            .records
            .values()
            .any(|r| r.org_id == record.org_id && r.name == record.name);
        if duplicate {
            return Err(Error::conflict(
                &record.name,
                format!(
                    "a cluster named '{}' already exists in organization {}",
                    record.name, record.org_id
                ),
            ));
        }

        state.last_id += 1;
        record.id = state.last_id;
        record.status = ClusterStatus::Creating;

        let pools = node_pools
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();
        state.pools.insert(record.id, pools);
        state.history.push(StatusHistoryEntry::genesis(&record));
        state.records.insert(record.id, record.clone());

        Ok(record)
    }

    async fn reload(&self, id: ClusterId) -> Result<ClusterRecord> {
        self.state
            .read()
            .records
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("cluster", id.to_string()))
    }

    async fn update_status(
        &self,
        id: ClusterId,
        status: ClusterStatus,
        message: &str,
        entry: Option<StatusHistoryEntry>,
    ) -> Result<()> {
        let mut state = self.state.write();
        let record = state.record_mut(id)?;
        record.status = status;
        record.status_message = message.to_string();
        if let Some(entry) = entry {
            state.history.push(entry);
        }
        Ok(())
    }

    async fn update_record(&self, record: &ClusterRecord) -> Result<()> {
        let mut state = self.state.write();
        let stored = state.record_mut(record.id)?;
        let (status, message) = (stored.status, std::mem::take(&mut stored.status_message));
        *stored = record.clone();
        stored.status = status;
        stored.status_message = message;
        Ok(())
    }

    async fn delete(&self, id: ClusterId) -> Result<()> {
        let mut state = self.state.write();
        state
            .records
            .remove(&id)
            .ok_or_else(|| Error::not_found("cluster", id.to_string()))?;
        state.pools.remove(&id);
        Ok(())
    }

    async fn append_status_history(&self, entry: StatusHistoryEntry) -> Result<()> {
        self.state.write().history.push(entry);
        Ok(())
    }

    async fn status_history(&self, id: ClusterId) -> Result<Vec<StatusHistoryEntry>> {
        Ok(self
            .state
            .read()
            .history
            .iter()
            .filter(|e| e.cluster_id == id)
            .cloned()
            .collect())
    }

    async fn node_pools(&self, id: ClusterId) -> Result<Vec<NodePoolRecord>> {
        let state = self.state.read();
        if !state.records.contains_key(&id) {
            return Err(Error::not_found("cluster", id.to_string()));
        }
        Ok(state
            .pools
            .get(&id)
            .map(|pools| pools.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn save_node_pool(&self, id: ClusterId, pool: NodePoolRecord) -> Result<()> {
        let mut state = self.state.write();
        state.pools_mut(id)?.insert(pool.name.clone(), pool);
        Ok(())
    }

    async fn delete_node_pool(&self, id: ClusterId, name: &str) -> Result<()> {
        let mut state = self.state.write();
        state
            .pools_mut(id)?
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("node pool", name))
    }

    async fn config_secret_id(
        &self,
        org_id: OrgId,
        cluster_id: ClusterId,
    ) -> Result<Option<String>> {
        self.state
            .read()
            .records
            .get(&cluster_id)
            .filter(|r| r.org_id == org_id)
            .map(|r| r.config_secret_id.clone())
            .ok_or_else(|| Error::not_found("cluster", cluster_id.to_string()))
    }
}

#[derive(Default)]
struct SecretState {
    last_id: u64,
    secrets: BTreeMap<(OrgId, String), SecretHandle>,
}

impl SecretState {
    fn insert(&mut self, org_id: OrgId, request: SecretRequest) -> SecretHandle {
        self.last_id += 1;
        let handle = SecretHandle {
            id: format!("secret-{}", self.last_id),
            name: request.name,
            secret_type: request.secret_type,
            values: request.values,
        };
        self.secrets
            .insert((org_id, handle.name.clone()), handle.clone());
        handle
    }
}

/// [`SecretStore`] kept in memory
#[derive(Default)]
pub struct MemorySecretStore {
    state: RwLock<SecretState>,
}

impl MemorySecretStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get_or_create(&self, org_id: OrgId, request: SecretRequest) -> Result<SecretHandle> {
        let mut state = self.state.write();
        if let Some(existing) = state.secrets.get(&(org_id, request.name.clone())) {
            return Ok(existing.clone());
        }
        Ok(state.insert(org_id, request))
    }

    async fn create_or_update(
        &self,
        org_id: OrgId,
        request: SecretRequest,
    ) -> Result<SecretHandle> {
        let mut state = self.state.write();
        if let Some(existing) = state.secrets.get_mut(&(org_id, request.name.clone())) {
            existing.secret_type = request.secret_type;
            existing.values = request.values;
            return Ok(existing.clone());
        }
        Ok(state.insert(org_id, request))
    }

    async fn delete(&self, org_id: OrgId, id: &str) -> Result<()> {
        let mut state = self.state.write();
        let key = state
            .secrets
            .iter()
            .find(|((org, _), handle)| *org == org_id && handle.id == id)
            .map(|(key, _)| key.clone())
            .ok_or_else(|| Error::not_found("secret", id))?;
        state.secrets.remove(&key);
        Ok(())
    }

    async fn get_by_name(&self, org_id: OrgId, name: &str) -> Result<SecretHandle> {
        self.state
            .read()
            .secrets
            .get(&(org_id, name.to_string()))
            .cloned()
            .ok_or_else(|| Error::not_found("secret", name))
    }

    async fn get(&self, org_id: OrgId, id: &str) -> Result<SecretHandle> {
        self.state
            .read()
            .secrets
            .iter()
            .find(|((org, _), handle)| *org == org_id && handle.id == id)
            .map(|(_, handle)| handle.clone())
            .ok_or_else(|| Error::not_found("secret", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{CreateClusterRequest, NodePoolRequest};
    use keel_common::model::{CloudKind, ClusterFeatures, Distribution};

    fn records(name: &str) -> (ClusterRecord, Vec<NodePoolRecord>) {
        CreateClusterRequest {
            org_id: 7,
            name: name.to_string(),
            cloud: CloudKind::Google,
            distribution: Distribution::Gke,
            location: "europe-west1".to_string(),
            secret_id: "gcp".to_string(),
            created_by: "alice".to_string(),
            rbac_enabled: false,
            features: ClusterFeatures::default(),
            node_pools: vec![NodePoolRequest::new("np1", "n1-standard-2", 3)],
        }
        .to_records()
    }

    #[tokio::test]
    async fn test_save_assigns_id_and_writes_genesis_entry() {
        let store = MemoryClusterStore::new();
        let (record, pools) = records("demo");

        let saved = store.save(record, pools).await.unwrap();

        assert_eq!(saved.id, 1);
        assert_eq!(saved.status, ClusterStatus::Creating);
        let history = store.status_history(saved.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from_status, None);
        assert_eq!(history[0].to_status, ClusterStatus::Creating);
        assert_eq!(store.node_pools(saved.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_name_in_org_conflicts() {
        let store = MemoryClusterStore::new();
        let (record, pools) = records("demo");
        store.save(record.clone(), pools.clone()).await.unwrap();

        let err = store.save(record.clone(), pools.clone()).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));

        // Same name in a different organization is fine
        let other_org = ClusterRecord {
            org_id: 8,
            ..record
        };
        assert!(store.save(other_org, pools).await.is_ok());
    }

    #[tokio::test]
    async fn test_update_status_with_and_without_entry() {
        let store = MemoryClusterStore::new();
        let (record, pools) = records("demo");
        let saved = store.save(record, pools).await.unwrap();

        store
            .update_status(saved.id, ClusterStatus::Creating, "provisioning", None)
            .await
            .unwrap();
        let entry = StatusHistoryEntry::transition(&saved, ClusterStatus::Running, "");
        store
            .update_status(saved.id, ClusterStatus::Running, "", Some(entry))
            .await
            .unwrap();

        let reloaded = store.reload(saved.id).await.unwrap();
        assert_eq!(reloaded.status, ClusterStatus::Running);
        assert_eq!(store.status_history(saved.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_status_on_missing_record_writes_nothing() {
        let store = MemoryClusterStore::new();
        let (record, _) = records("demo");
        let entry = StatusHistoryEntry::transition(&record, ClusterStatus::Running, "");

        let err = store
            .update_status(42, ClusterStatus::Running, "", Some(entry))
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        assert!(store.status_history(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_record_keeps_status() {
        let store = MemoryClusterStore::new();
        let (record, pools) = records("demo");
        let mut saved = store.save(record, pools).await.unwrap();

        saved.status = ClusterStatus::Running;
        saved.api_endpoint = Some("https://10.0.0.1:6443".to_string());
        store.update_record(&saved).await.unwrap();

        let reloaded = store.reload(saved.id).await.unwrap();
        assert_eq!(reloaded.status, ClusterStatus::Creating);
        assert_eq!(reloaded.api_endpoint.as_deref(), Some("https://10.0.0.1:6443"));
    }

    #[tokio::test]
    async fn test_delete_keeps_history() {
        let store = MemoryClusterStore::new();
        let (record, pools) = records("demo");
        let saved = store.save(record, pools).await.unwrap();

        store.delete(saved.id).await.unwrap();

        assert!(store.reload(saved.id).await.unwrap_err().is_not_found());
        assert!(store.node_pools(saved.id).await.unwrap_err().is_not_found());
        assert_eq!(store.status_history(saved.id).await.unwrap().len(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_node_pool_upsert_and_delete() {
        let store = MemoryClusterStore::new();
        let (record, mut pools) = records("demo");
        let saved = store.save(record, pools.clone()).await.unwrap();

        pools[0].spec.count = 5;
        store.save_node_pool(saved.id, pools[0].clone()).await.unwrap();
        assert_eq!(store.node_pools(saved.id).await.unwrap()[0].spec.count, 5);

        store.delete_node_pool(saved.id, "np1").await.unwrap();
        assert!(store.node_pools(saved.id).await.unwrap().is_empty());
        assert!(store
            .delete_node_pool(saved.id, "np1")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_config_secret_id_is_scoped_to_org() {
        let store = MemoryClusterStore::new();
        let (record, pools) = records("demo");
        let mut saved = store.save(record, pools).await.unwrap();

        assert_eq!(store.config_secret_id(7, saved.id).await.unwrap(), None);

        saved.config_secret_id = Some("secret-1".to_string());
        store.update_record(&saved).await.unwrap();

        assert_eq!(
            store.config_secret_id(7, saved.id).await.unwrap().as_deref(),
            Some("secret-1")
        );
        assert!(store.config_secret_id(8, saved.id).await.is_err());
    }

    fn kubeconfig_request(value: &str) -> SecretRequest {
        SecretRequest {
            name: "demo-kubeconfig".to_string(),
            secret_type: "kubeconfig".to_string(),
            values: BTreeMap::from([("value".to_string(), value.to_string())]),
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn test_secret_lookup_by_id_name_and_org() {
        let secrets = MemorySecretStore::new();
        let first = secrets
            .create_or_update(1, kubeconfig_request("apiVersion: v1"))
            .await
            .unwrap();

        assert_eq!(secrets.get(1, &first.id).await.unwrap().name, "demo-kubeconfig");
        assert_eq!(
            secrets.get_by_name(1, "demo-kubeconfig").await.unwrap().id,
            first.id
        );
        assert!(secrets.get_by_name(2, "demo-kubeconfig").await.is_err());
    }

    #[tokio::test]
    async fn test_secret_get_or_create_keeps_existing_values() {
        let secrets = MemorySecretStore::new();
        let first = secrets
            .get_or_create(1, kubeconfig_request("apiVersion: v1"))
            .await
            .unwrap();
        let second = secrets
            .get_or_create(1, kubeconfig_request("apiVersion: v2"))
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_secret_rewrite_keeps_id_and_replaces_values() {
        let secrets = MemorySecretStore::new();
        let first = secrets
            .create_or_update(1, kubeconfig_request("server: https://10.0.0.10:6443"))
            .await
            .unwrap();

        let second = secrets
            .create_or_update(1, kubeconfig_request("server: https://10.9.9.9:6443"))
            .await
            .unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(
            secrets.get(1, &first.id).await.unwrap().values["value"],
            "server: https://10.9.9.9:6443"
        );
    }

    #[tokio::test]
    async fn test_secret_delete() {
        let secrets = MemorySecretStore::new();
        let handle = secrets
            .create_or_update(1, kubeconfig_request("apiVersion: v1"))
            .await
            .unwrap();

        assert!(secrets.delete(2, &handle.id).await.unwrap_err().is_not_found());
        secrets.delete(1, &handle.id).await.unwrap();

        assert!(secrets.get(1, &handle.id).await.unwrap_err().is_not_found());
        assert!(secrets.delete(1, &handle.id).await.unwrap_err().is_not_found());

        let fresh = secrets
            .create_or_update(1, kubeconfig_request("apiVersion: v1"))
            .await
            .unwrap();
        assert_ne!(fresh.id, handle.id);
    }
}
