//! Driver for provider-managed Kubernetes services
//!
//! ACK, GKE, EKS and native EC2 differ only in how they name their cluster
//! states and in a few validation rules. Those differences live in a
//! [`ManagedFlavor`]; everything else is shared here, on top of the
//! [`ManagedClusterApi`] wire client.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use keel_common::config::ManagedDriverSettings;
use keel_common::model::{ClusterRecord, ClusterStatus, NodePoolRecord, NodePoolSpec};
use keel_common::{Error, Result};

use super::{
    ApiError, ClusterStatusSnapshot, DriverKind, ManagedClusterApi, ProviderClusterSpec,
    ProviderDriver, ProviderNodePool, RegionCatalog,
};
use crate::request::{CreateClusterRequest, NodePoolRequest, UpdateNodePoolsRequest};

/// What distinguishes one managed provider from another
pub trait ManagedFlavor: Send + Sync {
    /// Variant served by this flavor
    fn kind(&self) -> DriverKind;

    /// Translate a provider-native state string
    fn map_state(&self, state: &str) -> ClusterStatus;

    /// Extra per-pool checks beyond catalog and count bounds
    fn validate_pool(
        &self,
        _cluster: &str,
        _pool: &NodePoolRequest,
        _settings: &ManagedDriverSettings,
    ) -> Result<()> {
        Ok(())
    }

    /// Whether cluster creation is available for this provider
    fn supports_create(&self) -> bool {
        true
    }
}

/// [`ProviderDriver`] for managed-Kubernetes providers
pub struct ManagedDriver {
    flavor: Arc<dyn ManagedFlavor>,
    api: Arc<dyn ManagedClusterApi>,
    settings: ManagedDriverSettings,
    record: ClusterRecord,
    node_pools: Vec<NodePoolRecord>,
    endpoint: OnceCell<String>,
}

impl ManagedDriver {
    /// Driver for `record` backed by `api`
    pub fn new(
        flavor: Arc<dyn ManagedFlavor>,
        api: Arc<dyn ManagedClusterApi>,
        settings: ManagedDriverSettings,
        record: ClusterRecord,
        node_pools: Vec<NodePoolRecord>,
    ) -> Self {
        Self {
            flavor,
            api,
            settings,
            record,
            node_pools,
            endpoint: OnceCell::new(),
        }
    }

    fn api_error(&self, err: ApiError) -> Error {
        err.into_error(&self.record.name, self.flavor.kind())
    }

    fn validation(&self, field: String, message: String) -> Error {
        Error::validation_for_field(&self.record.name, message, field)
    }

    async fn region_catalog(&self, region: &str) -> Result<RegionCatalog> {
        self.api
            .catalog(region)
            .await
            .map_err(|e| self.api_error(e))?
            .ok_or_else(|| {
                self.validation(
                    "location".to_string(),
                    format!("unknown region '{}' for {}", region, self.flavor.kind()),
                )
            })
    }

    fn validate_pool_spec(
        &self,
        pool: &str,
        spec: &NodePoolSpec,
        catalog: &RegionCatalog,
    ) -> Result<()> {
        let field = format!("nodePools.{pool}");

        if !catalog.instance_types.iter().any(|t| t == &spec.instance_type) {
            return Err(self.validation(
                format!("{field}.instanceType"),
                format!("instance type '{}' is not offered in this region", spec.instance_type),
            ));
        }

        let (min, max) = (self.settings.min_node_count, self.settings.max_node_count);
        if spec.count < min || spec.count > max {
            return Err(self.validation(
                format!("{field}.count"),
                format!("node count {} is outside {}..={}", spec.count, min, max),
            ));
        }

        if spec.autoscaling {
            if spec.min_count > spec.max_count {
                return Err(self.validation(
                    format!("{field}.minCount"),
                    format!(
                        "autoscaling minimum {} exceeds maximum {}",
                        spec.min_count, spec.max_count
                    ),
                ));
            }
            if spec.max_count > max {
                return Err(self.validation(
                    format!("{field}.maxCount"),
                    format!("autoscaling maximum {} exceeds limit {}", spec.max_count, max),
                ));
            }
        }
        Ok(())
    }

    fn validate_zone(&self, pool: &NodePoolRequest, catalog: &RegionCatalog) -> Result<()> {
        let Some(zone) = pool.provider_config.get("zone").and_then(|z| z.as_str()) else {
            return Ok(());
        };
        if catalog.zones.iter().any(|z| z == zone) {
            Ok(())
        } else {
            Err(self.validation(
                format!("nodePools.{}.providerConfig.zone", pool.name),
                format!("zone '{zone}' is not in region '{}'", self.record.location),
            ))
        }
    }

    fn cluster_spec(&self) -> ProviderClusterSpec {
        ProviderClusterSpec {
            name: self.record.name.clone(),
            region: self.record.location.clone(),
            secret_id: self.record.secret_id.clone(),
            rbac_enabled: self.record.rbac_enabled,
            node_pools: self.node_pools.iter().map(ProviderNodePool::from).collect(),
        }
    }
}

#[async_trait]
impl ProviderDriver for ManagedDriver {
    fn kind(&self) -> DriverKind {
        self.flavor.kind()
    }

    async fn validate_creation_request(&self, request: &CreateClusterRequest) -> Result<()> {
        if !self.flavor.supports_create() {
            return Err(Error::not_implemented(self.flavor.kind().as_str(), "create"));
        }
        let catalog = self.region_catalog(&request.location).await?;
        for pool in &request.node_pools {
            self.validate_zone(pool, &catalog)?;
            self.validate_pool_spec(&pool.name, &pool.spec, &catalog)?;
            self.flavor.validate_pool(&request.name, pool, &self.settings)?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(cluster = %self.record.name, provider = %self.flavor.kind()))]
    async fn create(&self) -> Result<()> {
        if !self.flavor.supports_create() {
            return Err(Error::not_implemented(self.flavor.kind().as_str(), "create"));
        }
        self.api
            .create_cluster(&self.cluster_spec())
            .await
            .map_err(|e| self.api_error(e))?;
        info!("provider accepted cluster creation");
        Ok(())
    }

    #[instrument(skip(self), fields(cluster = %self.record.name, provider = %self.flavor.kind()))]
    async fn delete(&self) -> Result<()> {
        match self
            .api
            .delete_cluster(&self.record.location, &self.record.name)
            .await
        {
            Ok(()) => {
                info!("provider accepted cluster deletion");
                Ok(())
            }
            Err(ApiError::NotFound(detail)) => {
                warn!(%detail, "cluster already gone at provider, treating as deleted");
                Ok(())
            }
            Err(e) => Err(self.api_error(e)),
        }
    }

    #[instrument(skip(self, request), fields(cluster = %self.record.name, provider = %self.flavor.kind()))]
    async fn update_node_pools(&self, request: &UpdateNodePoolsRequest) -> Result<()> {
        let plan = request.plan(&self.record.name, &self.node_pools)?;
        let catalog = self.region_catalog(&self.record.location).await?;
        for pool in &plan.upserts {
            self.validate_pool_spec(&pool.name, &pool.spec, &catalog)?;
        }

        let pools: Vec<ProviderNodePool> = plan.desired.iter().map(ProviderNodePool::from).collect();
        self.api
            .update_node_pools(&self.record.location, &self.record.name, &pools)
            .await
            .map_err(|e| self.api_error(e))?;
        info!(
            upserts = plan.upserts.len(),
            removals = plan.removals.len(),
            "provider accepted node pool update"
        );
        Ok(())
    }

    async fn fetch_status(&self) -> Result<ClusterStatusSnapshot> {
        let cluster = match self
            .api
            .describe_cluster(&self.record.location, &self.record.name)
            .await
        {
            Ok(cluster) => cluster,
            Err(ApiError::NotFound(_)) => {
                return Err(Error::not_found("cluster", &self.record.name));
            }
            Err(e) => return Err(self.api_error(e)),
        };

        let status = self.flavor.map_state(&cluster.state);
        debug!(cluster = %self.record.name, state = %cluster.state, %status, "provider state");
        let message = if cluster.message.is_empty() && status == ClusterStatus::Error {
            format!("provider reported state {}", cluster.state)
        } else {
            cluster.message
        };
        Ok(ClusterStatusSnapshot::new(status, message))
    }

    async fn fetch_api_endpoint(&self) -> Result<String> {
        self.endpoint
            .get_or_try_init(|| async {
                let cluster = self
                    .api
                    .describe_cluster(&self.record.location, &self.record.name)
                    .await
                    .map_err(|e| self.api_error(e))?;
                cluster.endpoint.filter(|e| !e.is_empty()).ok_or_else(|| {
                    Error::provider_for(
                        &self.record.name,
                        self.flavor.kind().as_str(),
                        "control-plane endpoint not assigned yet",
                    )
                })
            })
            .await
            .cloned()
    }

    async fn fetch_kubeconfig(&self) -> Result<Vec<u8>> {
        self.api
            .kubeconfig(&self.record.location, &self.record.name)
            .await
            .map_err(|e| self.api_error(e))
    }
}
