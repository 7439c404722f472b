//! Alibaba Container Service for Kubernetes (ACK)

use keel_common::config::ManagedDriverSettings;
use keel_common::model::ClusterStatus;
use keel_common::{Error, Result};

use super::managed::ManagedFlavor;
use super::DriverKind;
use crate::request::NodePoolRequest;

/// Disk category used when a pool does not name one
pub const DEFAULT_SYSTEM_DISK_CATEGORY: &str = "cloud_efficiency";

/// Provider configuration key naming the system disk category
const SYSTEM_DISK_CATEGORY_KEY: &str = "systemDiskCategory";

pub(crate) struct AlibabaFlavor;

impl ManagedFlavor for AlibabaFlavor {
    fn kind(&self) -> DriverKind {
        DriverKind::Alibaba
    }

    fn map_state(&self, state: &str) -> ClusterStatus {
        match state.to_ascii_lowercase().as_str() {
            "running" => ClusterStatus::Running,
            "failed" | "unavailable" => ClusterStatus::Error,
            "updating" | "scaling" | "upgrading" => ClusterStatus::Updating,
            "deleting" => ClusterStatus::Deleting,
            "deleted" => ClusterStatus::Deleted,
            _ => ClusterStatus::Creating,
        }
    }

    fn validate_pool(
        &self,
        cluster: &str,
        pool: &NodePoolRequest,
        settings: &ManagedDriverSettings,
    ) -> Result<()> {
        let category = pool
            .provider_config
            .get(SYSTEM_DISK_CATEGORY_KEY)
            .and_then(|c| c.as_str())
            .unwrap_or(DEFAULT_SYSTEM_DISK_CATEGORY);

        if settings.disk_categories.is_empty()
            || settings.disk_categories.iter().any(|c| c == category)
        {
            return Ok(());
        }
        Err(Error::validation_for_field(
            cluster,
            format!(
                "system disk category '{}' is not one of: {}",
                category,
                settings.disk_categories.join(", ")
            ),
            format!("nodePools.{}.providerConfig.{}", pool.name, SYSTEM_DISK_CATEGORY_KEY),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_common::config::DriverSettings;

    #[test]
    fn test_state_mapping() {
        let flavor = AlibabaFlavor;
        assert_eq!(flavor.map_state("running"), ClusterStatus::Running);
        assert_eq!(flavor.map_state("failed"), ClusterStatus::Error);
        assert_eq!(flavor.map_state("initial"), ClusterStatus::Creating);
        assert_eq!(flavor.map_state("scaling"), ClusterStatus::Updating);
    }

    #[test]
    fn test_disk_category_allow_list() {
        let settings = DriverSettings::default().alibaba;
        let flavor = AlibabaFlavor;

        let mut pool = NodePoolRequest::new("np1", "ecs.g5.large", 2);
        assert!(flavor.validate_pool("demo", &pool, &settings).is_ok());

        pool.provider_config = serde_json::json!({"systemDiskCategory": "cloud_ssd"});
        assert!(flavor.validate_pool("demo", &pool, &settings).is_ok());

        pool.provider_config = serde_json::json!({"systemDiskCategory": "floppy"});
        let err = flavor.validate_pool("demo", &pool, &settings).unwrap_err();
        assert!(err.to_string().contains("floppy"));
    }
}
