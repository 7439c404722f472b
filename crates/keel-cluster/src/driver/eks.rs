//! Amazon Elastic Kubernetes Service

use keel_common::config::ManagedDriverSettings;
use keel_common::model::ClusterStatus;
use keel_common::{Error, Result};

use super::managed::ManagedFlavor;
use super::DriverKind;
use crate::request::NodePoolRequest;

pub(crate) struct EksFlavor;

impl ManagedFlavor for EksFlavor {
    fn kind(&self) -> DriverKind {
        DriverKind::Eks
    }

    fn map_state(&self, state: &str) -> ClusterStatus {
        match state.to_ascii_uppercase().as_str() {
            "ACTIVE" => ClusterStatus::Running,
            "UPDATING" => ClusterStatus::Updating,
            "DELETING" => ClusterStatus::Deleting,
            "FAILED" => ClusterStatus::Error,
            _ => ClusterStatus::Creating,
        }
    }

    fn validate_pool(
        &self,
        cluster: &str,
        pool: &NodePoolRequest,
        _settings: &ManagedDriverSettings,
    ) -> Result<()> {
        if pool.spec.preemptible {
            return Err(Error::validation_for_field(
                cluster,
                "EKS has no preemptible capacity; set a spot price instead",
                format!("nodePools.{}.preemptible", pool.name),
            ));
        }
        Ok(())
    }
}
