//! Google Kubernetes Engine

use keel_common::config::ManagedDriverSettings;
use keel_common::model::ClusterStatus;
use keel_common::{Error, Result};

use super::managed::ManagedFlavor;
use super::DriverKind;
use crate::request::NodePoolRequest;

pub(crate) struct GkeFlavor;

impl ManagedFlavor for GkeFlavor {
    fn kind(&self) -> DriverKind {
        DriverKind::Gke
    }

    fn map_state(&self, state: &str) -> ClusterStatus {
        match state.to_ascii_uppercase().as_str() {
            "RUNNING" => ClusterStatus::Running,
            "RECONCILING" => ClusterStatus::Updating,
            "STOPPING" => ClusterStatus::Deleting,
            "ERROR" | "DEGRADED" => ClusterStatus::Error,
            _ => ClusterStatus::Creating,
        }
    }

    fn validate_pool(
        &self,
        cluster: &str,
        pool: &NodePoolRequest,
        _settings: &ManagedDriverSettings,
    ) -> Result<()> {
        // GKE sells revocable capacity as preemptible VMs, not by bid
        match pool.spec.spot_price.as_deref().map(str::trim) {
            Some(price) if !price.is_empty() => Err(Error::validation_for_field(
                cluster,
                "GKE does not take spot prices; mark the pool preemptible instead",
                format!("nodePools.{}.spotPrice", pool.name),
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        let flavor = GkeFlavor;
        assert_eq!(flavor.map_state("PROVISIONING"), ClusterStatus::Creating);
        assert_eq!(flavor.map_state("RUNNING"), ClusterStatus::Running);
        assert_eq!(flavor.map_state("RECONCILING"), ClusterStatus::Updating);
        assert_eq!(flavor.map_state("DEGRADED"), ClusterStatus::Error);
        assert_eq!(flavor.map_state("ERROR"), ClusterStatus::Error);
    }

    #[test]
    fn test_spot_price_rejected() {
        let mut pool = NodePoolRequest::new("np1", "n1-standard-2", 1);
        pool.spec.preemptible = true;
        let settings = ManagedDriverSettings::default();
        assert!(GkeFlavor.validate_pool("demo", &pool, &settings).is_ok());

        pool.spec.spot_price = Some("0.02".to_string());
        assert!(GkeFlavor.validate_pool("demo", &pool, &settings).is_err());
    }
}
