//! Caller-facing request and report types

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keel_common::model::{
    CloudKind, ClusterFeatures, ClusterId, ClusterRecord, ClusterStatus, Distribution,
    NodePoolRecord, NodePoolSpec, NodeRole, OrgId, RoleSet,
};
use keel_common::{Error, Result};

/// One node pool in a creation request
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolRequest {
    /// Pool name, unique within the cluster
    pub name: String,
    /// Roles of the pool's nodes; empty means worker
    #[serde(default)]
    pub roles: RoleSet,
    /// Sizing and scheduling
    #[serde(flatten)]
    pub spec: NodePoolSpec,
    /// Provider-specific configuration, passed through to the driver
    #[serde(default)]
    pub provider_config: serde_json::Value,
}

impl NodePoolRequest {
    /// Worker pool of `count` nodes of `instance_type`
    pub fn new(name: impl Into<String>, instance_type: impl Into<String>, count: u32) -> Self {
        Self {
            name: name.into(),
            roles: RoleSet::new(),
            spec: NodePoolSpec {
                instance_type: instance_type.into(),
                count,
                ..Default::default()
            },
            provider_config: serde_json::Value::Null,
        }
    }

    fn effective_roles(&self) -> RoleSet {
        if self.roles.is_empty() {
            RoleSet::from([NodeRole::Worker])
        } else {
            self.roles.clone()
        }
    }

    fn into_record(self, created_by: &str, created_at: DateTime<Utc>) -> NodePoolRecord {
        NodePoolRecord {
            roles: self.effective_roles(),
            name: self.name,
            spec: self.spec,
            provider_config: self.provider_config,
            hosts: Vec::new(),
            created_by: created_by.to_string(),
            created_at,
        }
    }
}

/// Request to create a cluster
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateClusterRequest {
    /// Owning organization
    pub org_id: OrgId,
    /// Cluster name, unique within the organization
    pub name: String,
    /// Hosting cloud
    pub cloud: CloudKind,
    /// Kubernetes distribution
    pub distribution: Distribution,
    /// Region or location
    pub location: String,
    /// Provider credential secret
    pub secret_id: String,
    /// Identity of the requester
    pub created_by: String,
    /// Enable Kubernetes RBAC
    #[serde(default)]
    pub rbac_enabled: bool,
    /// Platform feature toggles
    #[serde(default)]
    pub features: ClusterFeatures,
    /// Initial node pools
    pub node_pools: Vec<NodePoolRequest>,
}

impl CreateClusterRequest {
    /// Checks that need no provider knowledge.
    ///
    /// Rejects a missing name or location, zero node pools, pool names that
    /// are not DNS-1123 labels, duplicate pool names, and more than one master
    /// pool.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation_for_field(
                "<unnamed>",
                "cluster name must not be empty",
                "name",
            ));
        }
        if self.location.trim().is_empty() {
            return Err(Error::validation_for_field(
                &self.name,
                "location must not be empty",
                "location",
            ));
        }
        if self.node_pools.is_empty() {
            return Err(Error::validation_for_field(
                &self.name,
                "at least one node pool is required",
                "nodePools",
            ));
        }

        let mut seen = BTreeSet::new();
        for pool in &self.node_pools {
            validate_pool_name(&self.name, &pool.name)?;
            if !seen.insert(pool.name.as_str()) {
                return Err(Error::validation_for_field(
                    &self.name,
                    format!("duplicate node pool name '{}'", pool.name),
                    format!("nodePools.{}", pool.name),
                ));
            }
        }

        if self.master_pool_count() > 1 {
            return Err(Error::validation_for_field(
                &self.name,
                "at most one node pool may carry the master role",
                "nodePools",
            ));
        }
        Ok(())
    }

    /// Number of pools carrying the master role
    pub fn master_pool_count(&self) -> usize {
        self.node_pools
            .iter()
            .filter(|p| p.roles.contains(&NodeRole::Master))
            .count()
    }

    /// The unsaved cluster record and node pools this request describes
    pub fn to_records(&self) -> (ClusterRecord, Vec<NodePoolRecord>) {
        let now = Utc::now();
        let record = ClusterRecord {
            id: 0,
            org_id: self.org_id,
            name: self.name.clone(),
            cloud: self.cloud,
            distribution: self.distribution,
            location: self.location.clone(),
            status: ClusterStatus::Creating,
            status_message: String::new(),
            created_by: self.created_by.clone(),
            created_at: now,
            rbac_enabled: self.rbac_enabled,
            features: self.features.clone(),
            secret_id: self.secret_id.clone(),
            ssh_secret_id: None,
            config_secret_id: None,
            api_endpoint: None,
        };
        let pools = self
            .node_pools
            .iter()
            .cloned()
            .map(|p| p.into_record(&self.created_by, now))
            .collect();
        (record, pools)
    }
}

/// New settings for an existing or added pool
///
/// Every field but `count` is optional. An omitted field keeps the pool's
/// current value, or the default when the pool is new.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolChange {
    /// Instance type; required when adding a pool
    #[serde(default)]
    pub instance_type: Option<String>,
    /// Desired node count
    pub count: u32,
    /// Enable autoscaling
    #[serde(default)]
    pub autoscaling: Option<bool>,
    /// Autoscaling lower bound
    #[serde(default)]
    pub min_count: Option<u32>,
    /// Autoscaling upper bound
    #[serde(default)]
    pub max_count: Option<u32>,
    /// Spot bid price; an empty string clears it
    #[serde(default)]
    pub spot_price: Option<String>,
    /// Preemptible capacity
    #[serde(default)]
    pub preemptible: Option<bool>,
    /// User labels, replacing the existing set
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
    /// Provider configuration
    #[serde(default)]
    pub provider_config: Option<serde_json::Value>,
}

/// What to do with one pool
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", tag = "action")]
pub enum NodePoolUpdate {
    /// Add the pool or change its settings
    Upsert(NodePoolChange),
    /// Remove the pool
    Remove,
}

/// Request to change a running cluster's node pools
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateNodePoolsRequest {
    /// Changes keyed by pool name
    pub pools: BTreeMap<String, NodePoolUpdate>,
    /// Identity of the requester
    #[serde(default)]
    pub requested_by: String,
}

/// Resolved effect of an [`UpdateNodePoolsRequest`] on the persisted pools
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodePoolPlan {
    /// Pools to write, in their final form
    pub upserts: Vec<NodePoolRecord>,
    /// Pool names to remove
    pub removals: Vec<String>,
    /// Every pool after the update
    pub desired: Vec<NodePoolRecord>,
}

impl UpdateNodePoolsRequest {
    /// Resolve against the cluster's current pools
    pub fn plan(&self, cluster: &str, existing: &[NodePoolRecord]) -> Result<NodePoolPlan> {
        if self.pools.is_empty() {
            return Err(Error::validation_for_field(
                cluster,
                "no node pool changes requested",
                "pools",
            ));
        }

        let mut desired: BTreeMap<String, NodePoolRecord> = existing
            .iter()
            .map(|p| (p.name.clone(), p.clone()))
            .collect();
        let mut plan = NodePoolPlan::default();
        let now = Utc::now();

        for (name, update) in &self.pools {
            match update {
                NodePoolUpdate::Remove => {
                    if desired.remove(name).is_none() {
                        return Err(Error::not_found("node pool", name));
                    }
                    plan.removals.push(name.clone());
                }
                NodePoolUpdate::Upsert(change) => {
                    let pool = match desired.get(name) {
                        Some(current) => apply_change(current.clone(), change),
                        None => {
                            validate_pool_name(cluster, name)?;
                            let instance_type = change
                                .instance_type
                                .clone()
                                .ok_or_else(|| Error::not_found("node pool", name))?;
                            let base = NodePoolRecord {
                                name: name.clone(),
                                roles: RoleSet::from([NodeRole::Worker]),
                                spec: NodePoolSpec {
                                    instance_type,
                                    ..Default::default()
                                },
                                provider_config: serde_json::Value::Null,
                                hosts: Vec::new(),
                                created_by: self.requested_by.clone(),
                                created_at: now,
                            };
                            apply_change(base, change)
                        }
                    };
                    desired.insert(name.clone(), pool.clone());
                    plan.upserts.push(pool);
                }
            }
        }

        if desired.is_empty() {
            return Err(Error::validation_for_field(
                cluster,
                "a cluster must keep at least one node pool",
                "pools",
            ));
        }

        plan.desired = desired.into_values().collect();
        Ok(plan)
    }
}

/// Longest DNS-1123 label
const MAX_POOL_NAME_LEN: usize = 63;

/// Pool names double as label values in the cluster, so they must be
/// DNS-1123 labels: lowercase alphanumerics and `-`, alphanumeric at both ends.
pub(crate) fn validate_pool_name(cluster: &str, name: &str) -> Result<()> {
    let alphanumeric = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    let valid = !name.is_empty()
        && name.len() <= MAX_POOL_NAME_LEN
        && name.chars().all(|c| alphanumeric(c) || c == '-')
        && name.starts_with(alphanumeric)
        && name.ends_with(alphanumeric);
    if valid {
        Ok(())
    } else {
        Err(Error::validation_for_field(
            cluster,
            format!(
                "node pool name '{name}' must be a DNS-1123 label of at most {MAX_POOL_NAME_LEN} characters"
            ),
            format!("nodePools.{name}"),
        ))
    }
}

fn apply_change(mut pool: NodePoolRecord, change: &NodePoolChange) -> NodePoolRecord {
    let spec = &mut pool.spec;
    if let Some(instance_type) = &change.instance_type {
        spec.instance_type = instance_type.clone();
    }
    spec.count = change.count;
    spec.autoscaling = change.autoscaling.unwrap_or(spec.autoscaling);
    spec.min_count = change.min_count.unwrap_or(spec.min_count);
    spec.max_count = change.max_count.unwrap_or(spec.max_count);
    spec.preemptible = change.preemptible.unwrap_or(spec.preemptible);
    if let Some(price) = &change.spot_price {
        spec.spot_price = Some(price.clone()).filter(|p| !p.is_empty());
    }
    if let Some(labels) = &change.labels {
        spec.labels = labels.clone();
    }
    if let Some(config) = &change.provider_config {
        pool.provider_config = config.clone();
    }
    pool
}

/// Options for deleting a cluster
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOptions {
    /// Remove the record even if the provider delete fails
    #[serde(default)]
    pub force: bool,
}

/// One pool in a status report
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolStatus {
    /// Node count
    pub count: u32,
    /// Instance type
    pub instance_type: String,
    /// Spot bid price
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spot_price: Option<String>,
    /// Preemptible capacity
    pub preemptible: bool,
    /// Autoscaling enabled
    pub autoscaling: bool,
    /// Autoscaling lower bound
    pub min_count: u32,
    /// Autoscaling upper bound
    pub max_count: u32,
    /// User labels
    pub labels: BTreeMap<String, String>,
    /// Creator
    pub created_by: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl From<&NodePoolRecord> for NodePoolStatus {
    fn from(pool: &NodePoolRecord) -> Self {
        Self {
            count: pool.spec.count,
            instance_type: pool.spec.instance_type.clone(),
            spot_price: pool.spec.spot_price.clone(),
            preemptible: pool.spec.preemptible,
            autoscaling: pool.spec.autoscaling,
            min_count: pool.spec.min_count,
            max_count: pool.spec.max_count,
            labels: pool.spec.labels.clone(),
            created_by: pool.created_by.clone(),
            created_at: pool.created_at,
        }
    }
}

/// Result of a status query
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatusReport {
    /// Cluster id
    pub id: ClusterId,
    /// Cluster name
    pub name: String,
    /// Hosting cloud
    pub cloud: CloudKind,
    /// Distribution
    pub distribution: Distribution,
    /// Region or location
    pub location: String,
    /// Status as observed from the provider
    pub status: ClusterStatus,
    /// Provider status message
    pub status_message: String,
    /// Status as last persisted
    pub recorded_status: ClusterStatus,
    /// Creator
    pub created_by: String,
    /// Control-plane address, once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_endpoint: Option<String>,
    /// The cluster's own pools, keyed by name
    pub node_pools: BTreeMap<String, NodePoolStatus>,
}
