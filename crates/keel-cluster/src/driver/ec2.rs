//! Kubernetes on plain EC2 instances, provisioned as a CloudFormation stack
//!
//! Stack creation is not available yet; status, update and delete work
//! against stacks that already exist.

use keel_common::model::ClusterStatus;

use super::managed::ManagedFlavor;
use super::DriverKind;

pub(crate) struct Ec2Flavor;

impl ManagedFlavor for Ec2Flavor {
    fn kind(&self) -> DriverKind {
        DriverKind::Ec2
    }

    fn map_state(&self, state: &str) -> ClusterStatus {
        let state = state.to_ascii_uppercase();
        if state.ends_with("_FAILED") || state.contains("ROLLBACK") {
            return ClusterStatus::Error;
        }
        match state.as_str() {
            "CREATE_COMPLETE" | "UPDATE_COMPLETE" => ClusterStatus::Running,
            "UPDATE_IN_PROGRESS" | "UPDATE_COMPLETE_CLEANUP_IN_PROGRESS" => {
                ClusterStatus::Updating
            }
            "DELETE_IN_PROGRESS" => ClusterStatus::Deleting,
            "DELETE_COMPLETE" => ClusterStatus::Deleted,
            _ => ClusterStatus::Creating,
        }
    }

    // TODO: enable once the CloudFormation cluster template exists
    fn supports_create(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_state_mapping() {
        let flavor = Ec2Flavor;
        assert_eq!(flavor.map_state("CREATE_IN_PROGRESS"), ClusterStatus::Creating);
        assert_eq!(flavor.map_state("CREATE_COMPLETE"), ClusterStatus::Running);
        assert_eq!(flavor.map_state("UPDATE_ROLLBACK_COMPLETE"), ClusterStatus::Error);
        assert_eq!(flavor.map_state("CREATE_FAILED"), ClusterStatus::Error);
        assert_eq!(flavor.map_state("DELETE_IN_PROGRESS"), ClusterStatus::Deleting);
    }

    #[test]
    fn test_create_unavailable() {
        assert!(!Ec2Flavor.supports_create());
    }
}
