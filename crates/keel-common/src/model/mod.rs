//! Provider-agnostic data model

mod cluster;
mod node_pool;

pub use cluster::{
    CloudKind, ClusterFeatures, ClusterId, ClusterRecord, ClusterStatus, Distribution, OrgId,
    StatusHistoryEntry,
};
pub use node_pool::{roles_from_flags, Host, NodePoolRecord, NodePoolSpec, NodeRole, RoleSet, Taint};
