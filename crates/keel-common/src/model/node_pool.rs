//! Node pools and the hosts that belong to them

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role a node plays in the cluster
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Control-plane node
    Master,
    /// Workload node
    Worker,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// Subset of {Master, Worker}
pub type RoleSet = BTreeSet<NodeRole>;

/// Build a role set from the two registration flags
pub fn roles_from_flags(is_master: bool, is_worker: bool) -> RoleSet {
    let mut roles = RoleSet::new();
    if is_master {
        roles.insert(NodeRole::Master);
    }
    if is_worker {
        roles.insert(NodeRole::Worker);
    }
    roles
}

/// Node taint
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Taint {
    /// Taint key
    pub key: String,
    /// Taint value
    #[serde(default)]
    pub value: String,
    /// NoSchedule, PreferNoSchedule or NoExecute
    pub effect: String,
}

/// One physical or virtual node
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    /// Node name
    pub name: String,
    /// Private IP address
    pub private_ip: String,
    /// Network interface identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_interface: Option<String>,
    /// Roles of this node
    #[serde(default)]
    pub roles: RoleSet,
    /// Node labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Node taints
    #[serde(default)]
    pub taints: Vec<Taint>,
}

/// Sizing and scheduling attributes of a node pool the core reasons about
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSpec {
    /// Provider instance type
    pub instance_type: String,
    /// Desired node count
    pub count: u32,
    /// Whether the cluster autoscaler manages the count
    #[serde(default)]
    pub autoscaling: bool,
    /// Lower autoscaling bound
    #[serde(default)]
    pub min_count: u32,
    /// Upper autoscaling bound
    #[serde(default)]
    pub max_count: u32,
    /// Spot bid price; empty or absent for on-demand capacity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spot_price: Option<String>,
    /// Preemptible capacity (providers without a spot market)
    #[serde(default)]
    pub preemptible: bool,
    /// User-supplied node labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// One logical group of homogeneous nodes
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolRecord {
    /// Pool name, unique within the cluster
    pub name: String,
    /// Roles shared by the pool's nodes
    #[serde(default)]
    pub roles: RoleSet,
    /// Sizing and scheduling attributes
    #[serde(default)]
    pub spec: NodePoolSpec,
    /// Provider-specific configuration, opaque to the core
    #[serde(default)]
    pub provider_config: serde_json::Value,
    /// Member nodes
    #[serde(default)]
    pub hosts: Vec<Host>,
    /// Identity of the creator
    pub created_by: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl NodePoolRecord {
    /// True if the pool itself or any of its hosts carries the master role
    pub fn has_master(&self) -> bool {
        self.roles.contains(&NodeRole::Master)
            || self
                .hosts
                .iter()
                .any(|h| h.roles.contains(&NodeRole::Master))
    }

    /// Look up a member host by name
    pub fn host(&self, name: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.name == name)
    }
}
