//! Common types for keel: data model, errors, polling, and configuration

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod model;
pub mod retry;
pub mod telemetry;
pub mod yaml;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Kubernetes label key marking objects keel manages inside a cluster
pub const MANAGED_BY_LABEL_KEY: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL_KEY`] on keel-managed objects
pub const MANAGED_BY_LABEL_VALUE: &str = "keel";
