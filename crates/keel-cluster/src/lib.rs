//! Provider-agnostic cluster lifecycle orchestration
//!
//! An [`Orchestrator`] creates, updates, inspects and deletes clusters on any
//! provider registered in its [`DriverRegistry`]. Each cluster's status moves
//! through [`lifecycle::set_status`], which keeps the status-history ledger.

#![deny(missing_docs)]

pub mod bootstrap;
pub mod driver;
pub mod lifecycle;
pub mod orchestrator;
pub mod request;
pub mod store;

pub use bootstrap::{NodeRegistrar, NodeRegistration};
pub use driver::{
    CloudApis, ClusterStatusSnapshot, CreationMode, DriverContext, DriverKind, DriverRegistry,
    ManagedClusterApi, ProviderDriver,
};
pub use lifecycle::{set_status, StatusChange};
pub use orchestrator::Orchestrator;
pub use request::{
    ClusterStatusReport, CreateClusterRequest, DeleteOptions, NodePoolChange, NodePoolRequest,
    NodePoolStatus, NodePoolUpdate, UpdateNodePoolsRequest,
};
pub use store::{ClusterStore, MemoryClusterStore, MemorySecretStore, SecretStore};
