//! Inbound callbacks from self-registering nodes
//!
//! Nodes of self-registering distributions announce themselves here instead of
//! being discovered through a provider API. The control plane also hands in
//! its kubeconfig, which is what the orchestrator waits for.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use keel_common::model::{roles_from_flags, ClusterId, Host, NodePoolRecord, NodePoolSpec};
use keel_common::{Error, Result};

use crate::driver::kubeconfig_server;
use crate::request::validate_pool_name;
use crate::store::{kubeconfig_secret_request, ClusterStore, SecretStore};

/// Creator recorded on pools first seen through registration
pub const BOOTSTRAP_CREATOR: &str = "node-bootstrap";

/// One node announcing itself
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeRegistration {
    /// Node name
    pub name: String,
    /// Pool the node belongs to
    pub node_pool: String,
    /// Private IP
    pub ip: String,
    /// Runs the control plane
    pub is_master: bool,
    /// Runs workloads
    pub is_worker: bool,
}

/// Handles node and kubeconfig registration
pub struct NodeRegistrar {
    store: Arc<dyn ClusterStore>,
    secrets: Arc<dyn SecretStore>,
}

impl NodeRegistrar {
    /// Registrar writing through `store` and `secrets`
    pub fn new(store: Arc<dyn ClusterStore>, secrets: Arc<dyn SecretStore>) -> Self {
        Self { store, secrets }
    }

    /// Upsert the node's pool and host.
    ///
    /// A host never moves between pools, and a cluster has at most one master
    /// pool; both are `Conflict`s.
    #[instrument(skip(self, registration), fields(node = %registration.name, pool = %registration.node_pool))]
    pub async fn register_node(
        &self,
        cluster_id: ClusterId,
        registration: NodeRegistration,
    ) -> Result<NodePoolRecord> {
        let record = self.store.reload(cluster_id).await?;

        if registration.name.is_empty() || registration.node_pool.is_empty() {
            return Err(Error::validation_for(
                &record.name,
                "node name and node pool name are required",
            ));
        }
        let roles = roles_from_flags(registration.is_master, registration.is_worker);
        if roles.is_empty() {
            return Err(Error::validation_for(
                &record.name,
                format!("node {} has neither master nor worker role", registration.name),
            ));
        }

        let pools = self.store.node_pools(cluster_id).await?;
        for other in pools.iter().filter(|p| p.name != registration.node_pool) {
            if other.host(&registration.name).is_some() {
                return Err(Error::conflict(
                    &record.name,
                    format!(
                        "node {} already belongs to node pool {}",
                        registration.name, other.name
                    ),
                ));
            }
            if registration.is_master && other.has_master() {
                return Err(Error::conflict(
                    &record.name,
                    format!("node pool {} already carries the master role", other.name),
                ));
            }
        }

        let mut pool = match pools.into_iter().find(|p| p.name == registration.node_pool) {
            Some(pool) => pool,
            None => {
                validate_pool_name(&record.name, &registration.node_pool)?;
                NodePoolRecord {
                    name: registration.node_pool.clone(),
                    roles: roles.clone(),
                    spec: NodePoolSpec::default(),
                    provider_config: serde_json::Value::Null,
                    hosts: Vec::new(),
                    created_by: BOOTSTRAP_CREATOR.to_string(),
                    created_at: Utc::now(),
                }
            }
        };

        pool.roles.extend(roles.iter().copied());
        match pool.hosts.iter_mut().find(|h| h.name == registration.name) {
            Some(host) => {
                host.private_ip = registration.ip.clone();
                host.roles = roles;
            }
            None => {
                pool.hosts.push(Host {
                    name: registration.name.clone(),
                    private_ip: registration.ip.clone(),
                    network_interface: None,
                    roles,
                    labels: BTreeMap::new(),
                    taints: Vec::new(),
                });
                pool.spec.count = pool.spec.count.max(pool.hosts.len() as u32);
            }
        }

        self.store.save_node_pool(cluster_id, pool.clone()).await?;
        info!(cluster = %record.name, ip = %registration.ip, "node registered");
        Ok(pool)
    }

    /// Store the control plane's kubeconfig and record it on the cluster.
    ///
    /// Returns the secret id. A later call overwrites the stored kubeconfig and
    /// keeps the id.
    #[instrument(skip(self, kubeconfig))]
    pub async fn register_kubeconfig(
        &self,
        cluster_id: ClusterId,
        kubeconfig: &[u8],
    ) -> Result<String> {
        let mut record = self.store.reload(cluster_id).await?;

        let text = std::str::from_utf8(kubeconfig).map_err(|e| {
            Error::serialization_for_kind("kubeconfig", format!("invalid UTF-8: {e}"))
        })?;
        let server = kubeconfig_server(text)?;

        let secret = self
            .secrets
            .create_or_update(record.org_id, kubeconfig_secret_request(&record.name, text))
            .await?;

        record.config_secret_id = Some(secret.id.clone());
        record.api_endpoint = Some(server);
        self.store.update_record(&record).await?;

        info!(cluster = %record.name, secret = %secret.id, "control plane registered");
        Ok(secret.id)
    }
}
