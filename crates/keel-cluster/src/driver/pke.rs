//! Self-registering PKE clusters on EC2
//!
//! Keel only launches the machines. Nodes install Kubernetes themselves and
//! report back through the bootstrap callback; the control plane's kubeconfig
//! arriving in the secret store is what marks the cluster as running.

use std::sync::Arc;

use async_trait::async_trait;
use kube::config::Kubeconfig;
use tokio::sync::OnceCell;
use tracing::{info, instrument, warn};

use keel_common::config::ManagedDriverSettings;
use keel_common::model::{ClusterRecord, ClusterStatus, NodePoolRecord};
use keel_common::{Error, Result};

use super::{
    ApiError, ClusterStatusSnapshot, CreationMode, DriverContext, DriverKind, ManagedClusterApi,
    ProviderClusterSpec, ProviderDriver, ProviderNodePool,
};
use crate::request::{CreateClusterRequest, UpdateNodePoolsRequest};
use crate::store::{ClusterStore, SecretStore, KUBECONFIG_VALUE_KEY};

/// Message while the control plane has not reported in
pub const AWAITING_REGISTRATION: &str = "waiting for control plane to register";

/// [`ProviderDriver`] for self-registering PKE clusters
pub struct PkeDriver {
    api: Arc<dyn ManagedClusterApi>,
    settings: ManagedDriverSettings,
    record: ClusterRecord,
    node_pools: Vec<NodePoolRecord>,
    store: Arc<dyn ClusterStore>,
    secrets: Arc<dyn SecretStore>,
    endpoint: OnceCell<String>,
}

impl PkeDriver {
    /// Driver for the cluster in `ctx`, launching machines through `api`
    pub fn new(ctx: DriverContext, api: Arc<dyn ManagedClusterApi>) -> Self {
        Self {
            api,
            settings: ctx.settings.pke.clone(),
            record: ctx.record,
            node_pools: ctx.node_pools,
            store: ctx.store,
            secrets: ctx.secrets,
            endpoint: OnceCell::new(),
        }
    }

    fn api_error(&self, err: ApiError) -> Error {
        err.into_error(&self.record.name, DriverKind::Ec2Pke)
    }

    async fn registered_kubeconfig(&self) -> Result<Option<String>> {
        let Some(secret_id) = self
            .store
            .config_secret_id(self.record.org_id, self.record.id)
            .await?
        else {
            return Ok(None);
        };
        let secret = self.secrets.get(self.record.org_id, &secret_id).await?;
        secret
            .values
            .get(KUBECONFIG_VALUE_KEY)
            .cloned()
            .map(Some)
            .ok_or_else(|| {
                Error::internal_with_context(
                    "pke",
                    format!("secret {secret_id} holds no kubeconfig"),
                )
            })
    }
}

/// The `server` of the kubeconfig's current context, or of its first cluster
pub fn kubeconfig_server(kubeconfig: &str) -> Result<String> {
    let config = Kubeconfig::from_yaml(kubeconfig)
        .map_err(|e| Error::serialization_for_kind("kubeconfig", e.to_string()))?;

    let context_cluster = config.current_context.as_ref().and_then(|current| {
        config
            .contexts
            .iter()
            .find(|c| &c.name == current)
            .and_then(|c| c.context.as_ref())
            .map(|c| c.cluster.clone())
    });

    let server = config
        .clusters
        .iter()
        .filter(|c| context_cluster.as_ref().is_none_or(|name| &c.name == name))
        .find_map(|c| c.cluster.as_ref().and_then(|c| c.server.clone()));

    server.ok_or_else(|| {
        Error::serialization_for_kind("kubeconfig", "no cluster server address found")
    })
}

#[async_trait]
impl ProviderDriver for PkeDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Ec2Pke
    }

    fn creation_mode(&self) -> CreationMode {
        CreationMode::SelfRegistering
    }

    async fn validate_creation_request(&self, request: &CreateClusterRequest) -> Result<()> {
        if request.master_pool_count() != 1 {
            return Err(Error::validation_for_field(
                &request.name,
                "exactly one node pool must carry the master role",
                "nodePools",
            ));
        }

        let catalog = self
            .api
            .catalog(&request.location)
            .await
            .map_err(|e| self.api_error(e))?
            .ok_or_else(|| {
                Error::validation_for_field(
                    &request.name,
                    format!("unknown region '{}'", request.location),
                    "location",
                )
            })?;

        for pool in &request.node_pools {
            let field = format!("nodePools.{}", pool.name);
            if !catalog.instance_types.contains(&pool.spec.instance_type) {
                return Err(Error::validation_for_field(
                    &request.name,
                    format!("instance type '{}' is not offered", pool.spec.instance_type),
                    format!("{field}.instanceType"),
                ));
            }
            let count = pool.spec.count;
            if count < self.settings.min_node_count || count > self.settings.max_node_count {
                return Err(Error::validation_for_field(
                    &request.name,
                    format!(
                        "node count {} is outside {}..={}",
                        count, self.settings.min_node_count, self.settings.max_node_count
                    ),
                    format!("{field}.count"),
                ));
            }
        }
        Ok(())
    }

    #[instrument(skip(self), fields(cluster = %self.record.name, provider = "ec2-pke"))]
    async fn create(&self) -> Result<()> {
        let spec = ProviderClusterSpec {
            name: self.record.name.clone(),
            region: self.record.location.clone(),
            secret_id: self.record.secret_id.clone(),
            rbac_enabled: self.record.rbac_enabled,
            node_pools: self.node_pools.iter().map(ProviderNodePool::from).collect(),
        };
        self.api
            .create_cluster(&spec)
            .await
            .map_err(|e| self.api_error(e))?;
        info!(pools = spec.node_pools.len(), "machines launched, awaiting self-registration");
        Ok(())
    }

    #[instrument(skip(self), fields(cluster = %self.record.name, provider = "ec2-pke"))]
    async fn delete(&self) -> Result<()> {
        match self
            .api
            .delete_cluster(&self.record.location, &self.record.name)
            .await
        {
            Ok(()) => Ok(()),
            Err(ApiError::NotFound(detail)) => {
                warn!(%detail, "machines already gone, treating as deleted");
                Ok(())
            }
            Err(e) => Err(self.api_error(e)),
        }
    }

    async fn update_node_pools(&self, request: &UpdateNodePoolsRequest) -> Result<()> {
        let plan = request.plan(&self.record.name, &self.node_pools)?;
        if !plan.desired.iter().any(NodePoolRecord::has_master) {
            return Err(Error::validation_for_field(
                &self.record.name,
                "the master node pool cannot be removed",
                "pools",
            ));
        }
        let pools: Vec<ProviderNodePool> = plan.desired.iter().map(ProviderNodePool::from).collect();
        self.api
            .update_node_pools(&self.record.location, &self.record.name, &pools)
            .await
            .map_err(|e| self.api_error(e))
    }

    async fn fetch_status(&self) -> Result<ClusterStatusSnapshot> {
        let registered = self
            .store
            .config_secret_id(self.record.org_id, self.record.id)
            .await?
            .is_some();
        Ok(if registered {
            ClusterStatusSnapshot::new(ClusterStatus::Running, "")
        } else {
            ClusterStatusSnapshot::new(ClusterStatus::Creating, AWAITING_REGISTRATION)
        })
    }

    async fn fetch_api_endpoint(&self) -> Result<String> {
        self.endpoint
            .get_or_try_init(|| async {
                let kubeconfig = self.registered_kubeconfig().await?.ok_or_else(|| {
                    Error::conflict(&self.record.name, "control plane has not registered yet")
                })?;
                kubeconfig_server(&kubeconfig)
            })
            .await
            .cloned()
    }

    async fn fetch_kubeconfig(&self) -> Result<Vec<u8>> {
        Err(Error::not_applicable(DriverKind::Ec2Pke.as_str(), "fetch_kubeconfig"))
    }
}
