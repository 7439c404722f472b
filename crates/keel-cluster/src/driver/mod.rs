//! Provider driver contract
//!
//! A driver is bound to one cluster record and one provider variant. The
//! orchestrator only ever talks to [`ProviderDriver`]; which variant backs it
//! is decided once, by [`DriverKind`] through the [`DriverRegistry`].
//!
//! Drivers do not retry internally. Waiting for the provider is the
//! orchestrator's job, through the shared poller.

mod alibaba;
mod ec2;
mod eks;
mod gke;
mod managed;
mod pke;
mod registry;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use keel_common::config::DriverSettings;
use keel_common::model::{CloudKind, ClusterRecord, ClusterStatus, Distribution, NodePoolRecord};
use keel_common::{Error, Result};

use crate::request::{CreateClusterRequest, UpdateNodePoolsRequest};
use crate::store::{ClusterStore, SecretStore};

pub use managed::{ManagedDriver, ManagedFlavor};
pub use pke::{kubeconfig_server, PkeDriver, AWAITING_REGISTRATION};
pub use registry::{CloudApis, DriverConstructor, DriverRegistry};

/// Provider variant
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum DriverKind {
    /// Alibaba Container Service for Kubernetes
    Alibaba,
    /// Kubernetes on plain EC2 instances
    Ec2,
    /// Self-registering PKE on EC2
    Ec2Pke,
    /// Google Kubernetes Engine
    Gke,
    /// Amazon Elastic Kubernetes Service
    Eks,
}

impl DriverKind {
    /// Every variant
    pub const ALL: [DriverKind; 5] = [
        DriverKind::Alibaba,
        DriverKind::Ec2,
        DriverKind::Ec2Pke,
        DriverKind::Gke,
        DriverKind::Eks,
    ];

    /// Variant for a (cloud, distribution) pair
    pub fn resolve(cloud: CloudKind, distribution: Distribution) -> Result<Self> {
        match (cloud, distribution) {
            (CloudKind::Alibaba, Distribution::Acsk) => Ok(Self::Alibaba),
            (CloudKind::Amazon, Distribution::Ec2) => Ok(Self::Ec2),
            (CloudKind::Amazon, Distribution::Pke) => Ok(Self::Ec2Pke),
            (CloudKind::Google, Distribution::Gke) => Ok(Self::Gke),
            (CloudKind::Amazon, Distribution::Eks) => Ok(Self::Eks),
            (cloud, distribution) => Err(Error::validation(format!(
                "distribution {distribution} is not supported on cloud {cloud}"
            ))),
        }
    }

    /// Variant for a record
    pub fn for_record(record: &ClusterRecord) -> Result<Self> {
        Self::resolve(record.cloud, record.distribution)
    }

    /// Identifier used in errors and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alibaba => "alibaba",
            Self::Ec2 => "ec2",
            Self::Ec2Pke => "ec2-pke",
            Self::Gke => "gke",
            Self::Eks => "eks",
        }
    }
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a cluster comes into existence
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreationMode {
    /// The provider builds the cluster and reports progress when asked
    Push,
    /// Nodes boot and report themselves through the bootstrap callback
    SelfRegistering,
}

/// Provider state translated into the common vocabulary
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterStatusSnapshot {
    /// Common status
    pub status: ClusterStatus,
    /// Provider-supplied detail
    pub message: String,
}

impl ClusterStatusSnapshot {
    /// Snapshot with `status` and `message`
    pub fn new(status: ClusterStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Everything a driver is constructed from
#[derive(Clone)]
pub struct DriverContext {
    /// The cluster the driver is bound to
    pub record: ClusterRecord,
    /// That cluster's node pools
    pub node_pools: Vec<NodePoolRecord>,
    /// Per-provider settings
    pub settings: Arc<DriverSettings>,
    /// Persistence, for variants that observe stored state
    pub store: Arc<dyn ClusterStore>,
    /// Secrets, for variants that read stored kubeconfigs
    pub secrets: Arc<dyn SecretStore>,
}

/// Capability set every provider variant implements
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProviderDriver: Send + Sync {
    /// Which variant this is
    fn kind(&self) -> DriverKind;

    /// Push-based or self-registering
    fn creation_mode(&self) -> CreationMode {
        CreationMode::Push
    }

    /// Provider-side validation; must pass before [`ProviderDriver::create`]
    async fn validate_creation_request(&self, request: &CreateClusterRequest) -> Result<()>;

    /// Ask the provider to build the cluster.
    ///
    /// Returns once the provider accepted the request, not once the cluster
    /// is ready. Must not be called twice concurrently for one cluster.
    async fn create(&self) -> Result<()>;

    /// Tear the cluster down; a cluster already gone counts as deleted
    async fn delete(&self) -> Result<()>;

    /// Apply node pool changes
    async fn update_node_pools(&self, request: &UpdateNodePoolsRequest) -> Result<()>;

    /// Read-only view of the provider's state
    async fn fetch_status(&self) -> Result<ClusterStatusSnapshot>;

    /// Externally reachable control-plane address
    async fn fetch_api_endpoint(&self) -> Result<String>;

    /// Admin kubeconfig; `NotApplicable` for self-registering variants
    async fn fetch_kubeconfig(&self) -> Result<Vec<u8>>;
}

/// Failure reported by a provider wire client
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The addressed resource does not exist
    #[error("resource not found: {0}")]
    NotFound(String),
    /// The provider refused the request (bad input, quota, state)
    #[error("request rejected: {0}")]
    Rejected(String),
    /// The call did not complete (network, throttling, 5xx)
    #[error("transport failure: {0}")]
    Transport(String),
}

impl ApiError {
    /// Convert into a provider error for `cluster`
    pub fn into_error(self, cluster: &str, kind: DriverKind) -> Error {
        match self {
            ApiError::Transport(msg) => Error::provider_for(cluster, kind.as_str(), msg),
            other => Error::provider_permanent(cluster, kind.as_str(), other.to_string()),
        }
    }
}

/// A cluster as described by the provider
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProviderCluster {
    /// Provider-native state string
    pub state: String,
    /// Provider-supplied detail
    pub message: String,
    /// Control-plane address, once assigned
    pub endpoint: Option<String>,
}

/// Node pool shape sent to the provider
#[derive(Clone, Debug, PartialEq)]
pub struct ProviderNodePool {
    /// Pool name
    pub name: String,
    /// Instance type
    pub instance_type: String,
    /// Node count
    pub count: u32,
    /// Autoscaling bounds, when enabled
    pub autoscaling: Option<(u32, u32)>,
    /// Spot bid price
    pub spot_price: Option<String>,
    /// Preemptible capacity
    pub preemptible: bool,
    /// Labels to put on the nodes at boot
    pub labels: BTreeMap<String, String>,
    /// Provider configuration passthrough
    pub provider_config: serde_json::Value,
}

impl From<&NodePoolRecord> for ProviderNodePool {
    fn from(pool: &NodePoolRecord) -> Self {
        Self {
            name: pool.name.clone(),
            instance_type: pool.spec.instance_type.clone(),
            count: pool.spec.count,
            autoscaling: pool
                .spec
                .autoscaling
                .then_some((pool.spec.min_count, pool.spec.max_count)),
            spot_price: pool.spec.spot_price.clone(),
            preemptible: pool.spec.preemptible,
            labels: pool.spec.labels.clone(),
            provider_config: pool.provider_config.clone(),
        }
    }
}

/// Request to build a cluster, as sent to the provider
#[derive(Clone, Debug, PartialEq)]
pub struct ProviderClusterSpec {
    /// Cluster name
    pub name: String,
    /// Region
    pub region: String,
    /// Credential secret
    pub secret_id: String,
    /// Enable Kubernetes RBAC
    pub rbac_enabled: bool,
    /// Node pools
    pub node_pools: Vec<ProviderNodePool>,
}

/// What a provider offers in one region
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegionCatalog {
    /// Zones in the region
    pub zones: Vec<String>,
    /// Instance types offered in the region
    pub instance_types: Vec<String>,
}

/// Wire client for one provider's managed-Kubernetes API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManagedClusterApi: Send + Sync {
    /// Submit a cluster build; returns once accepted
    async fn create_cluster(&self, spec: &ProviderClusterSpec) -> std::result::Result<(), ApiError>;

    /// Describe a cluster
    async fn describe_cluster(
        &self,
        region: &str,
        name: &str,
    ) -> std::result::Result<ProviderCluster, ApiError>;

    /// Delete a cluster
    async fn delete_cluster(&self, region: &str, name: &str) -> std::result::Result<(), ApiError>;

    /// Replace the cluster's node pools with `pools`
    async fn update_node_pools(
        &self,
        region: &str,
        name: &str,
        pools: &[ProviderNodePool],
    ) -> std::result::Result<(), ApiError>;

    /// Admin kubeconfig
    async fn kubeconfig(&self, region: &str, name: &str) -> std::result::Result<Vec<u8>, ApiError>;

    /// Region catalog; `None` for an unknown region
    async fn catalog(&self, region: &str) -> std::result::Result<Option<RegionCatalog>, ApiError>;
}
