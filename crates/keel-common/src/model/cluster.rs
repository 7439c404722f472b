//! Cluster identity, lifecycle status, and the status-history ledger entry

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// Numeric cluster identifier assigned by the persistence layer
pub type ClusterId = u64;

/// Numeric organization identifier
pub type OrgId = u64;

/// Infrastructure provider hosting a cluster
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum CloudKind {
    /// Alibaba Cloud
    Alibaba,
    /// Amazon Web Services
    Amazon,
    /// Google Cloud Platform
    Google,
}

impl CloudKind {
    /// Lowercase identifier used in APIs and labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alibaba => "alibaba",
            Self::Amazon => "amazon",
            Self::Google => "google",
        }
    }
}

impl std::str::FromStr for CloudKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "alibaba" => Ok(Self::Alibaba),
            "amazon" => Ok(Self::Amazon),
            "google" => Ok(Self::Google),
            _ => Err(Error::validation(format!(
                "invalid cloud: {s}, expected one of: alibaba, amazon, google"
            ))),
        }
    }
}

impl std::fmt::Display for CloudKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kubernetes distribution running on the provider
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    /// Alibaba Container Service for Kubernetes
    Acsk,
    /// Plain EC2 instances provisioned from a stack template
    Ec2,
    /// Self-registering kubeadm-based engine
    Pke,
    /// Google Kubernetes Engine
    Gke,
    /// Amazon Elastic Kubernetes Service
    Eks,
}

impl Distribution {
    /// Lowercase identifier used in APIs and labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acsk => "acsk",
            Self::Ec2 => "ec2",
            Self::Pke => "pke",
            Self::Gke => "gke",
            Self::Eks => "eks",
        }
    }
}

impl std::str::FromStr for Distribution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "acsk" => Ok(Self::Acsk),
            "ec2" => Ok(Self::Ec2),
            "pke" => Ok(Self::Pke),
            "gke" => Ok(Self::Gke),
            "eks" => Ok(Self::Eks),
            _ => Err(Error::validation(format!(
                "invalid distribution: {s}, expected one of: acsk, ec2, pke, gke, eks"
            ))),
        }
    }
}

impl std::fmt::Display for Distribution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cluster lifecycle status
///
/// ```text
/// Creating -> Running | Error
/// Running  -> Updating -> Running | Error
/// Running | Error -> Deleting -> Deleted
/// Error -> Creating | Updating   (retried operation)
/// ```
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClusterStatus {
    /// Provider resources are being provisioned
    Creating,
    /// Cluster is provisioned and reachable
    Running,
    /// Node pools are being changed
    Updating,
    /// The last operation failed; not terminal
    Error,
    /// Provider resources are being torn down
    Deleting,
    /// Terminal: the record is removed or tombstoned
    Deleted,
}

impl ClusterStatus {
    /// Whether `next` is a sanctioned successor of this status
    ///
    /// Same-status "transitions" are always allowed; they only refresh the message.
    pub fn can_transition_to(&self, next: ClusterStatus) -> bool {
        use ClusterStatus::*;

        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Creating, Running)
                | (Creating, Error)
                | (Running, Updating)
                | (Running, Deleting)
                | (Running, Error)
                | (Updating, Running)
                | (Updating, Error)
                | (Error, Creating)
                | (Error, Updating)
                | (Error, Deleting)
                | (Deleting, Deleted)
        )
    }

    /// True once the record has been removed or tombstoned
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deleted)
    }

    /// True for statuses whose message must never be empty
    pub fn requires_message(&self) -> bool {
        matches!(self, Self::Error | Self::Deleted)
    }

    /// Message recorded when a caller supplies none for a status that needs one
    pub fn default_message(&self) -> &'static str {
        match self {
            Self::Error => "unknown error",
            Self::Deleted => "cluster deleted",
            _ => "",
        }
    }

    /// True while an operation on the provider is in flight
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::Creating | Self::Updating | Self::Deleting)
    }
}

impl std::fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "Creating"),
            Self::Running => write!(f, "Running"),
            Self::Updating => write!(f, "Updating"),
            Self::Error => write!(f, "Error"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Deleted => write!(f, "Deleted"),
        }
    }
}

/// Optional platform features toggled per cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterFeatures {
    /// Image and workload security scanning
    #[serde(default)]
    pub security_scan: bool,
    /// Metrics collection
    #[serde(default)]
    pub monitoring: bool,
    /// Log collection
    #[serde(default)]
    pub logging: bool,
    /// Service mesh installation
    #[serde(default)]
    pub service_mesh: bool,
}

/// Provider-agnostic identity and status of one cluster
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRecord {
    /// Identifier assigned by the persistence layer (0 until saved)
    pub id: ClusterId,
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
    /// Current lifecycle status
    pub status: ClusterStatus,
    /// Free-text status message
    #[serde(default)]
    pub status_message: String,
    /// Identity of the creator
    pub created_by: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Whether Kubernetes RBAC is enabled
    #[serde(default)]
    pub rbac_enabled: bool,
    /// Platform feature toggles
    #[serde(default)]
    pub features: ClusterFeatures,
    /// Provider credential secret
    pub secret_id: String,
    /// SSH key secret, set lazily
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_secret_id: Option<String>,
    /// Kubeconfig secret, set once the cluster's credentials are known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_secret_id: Option<String>,
    /// Resolved control-plane address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_endpoint: Option<String>,
}

/// Immutable audit record of one status transition
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusHistoryEntry {
    /// Cluster the transition belongs to
    pub cluster_id: ClusterId,
    /// Cluster name at the time of the transition
    pub cluster_name: String,
    /// Previous status; `None` for the entry written when the record is created
    pub from_status: Option<ClusterStatus>,
    /// Previous message
    pub from_message: String,
    /// New status
    pub to_status: ClusterStatus,
    /// New message
    pub to_message: String,
    /// When the transition was recorded
    pub timestamp: DateTime<Utc>,
}

impl StatusHistoryEntry {
    /// Entry recording a transition of `record` to (`status`, `message`)
    pub fn transition(record: &ClusterRecord, status: ClusterStatus, message: &str) -> Self {
        Self {
            cluster_id: record.id,
            cluster_name: record.name.clone(),
            from_status: Some(record.status),
            from_message: record.status_message.clone(),
            to_status: status,
            to_message: message.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Entry recording the creation of `record` in its initial status
    pub fn genesis(record: &ClusterRecord) -> Self {
        Self {
            cluster_id: record.id,
            cluster_name: record.name.clone(),
            from_status: None,
            from_message: String::new(),
            to_status: record.status,
            to_message: record.status_message.clone(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ClusterStatus::*;

    const ALL: [ClusterStatus; 6] = [Creating, Running, Updating, Error, Deleting, Deleted];

    #[test]
    fn test_documented_transitions_are_allowed() {
        assert!(Creating.can_transition_to(Running));
        assert!(Creating.can_transition_to(Error));
        assert!(Running.can_transition_to(Updating));
        assert!(Updating.can_transition_to(Running));
        assert!(Updating.can_transition_to(Error));
        assert!(Running.can_transition_to(Deleting));
        assert!(Error.can_transition_to(Deleting));
        assert!(Deleting.can_transition_to(Deleted));
    }

    #[test]
    fn test_error_is_recoverable() {
        assert!(!Error.is_terminal());
        assert!(Error.can_transition_to(Creating));
        assert!(Error.can_transition_to(Updating));
    }

    #[test]
    fn test_deleted_is_terminal() {
        assert!(Deleted.is_terminal());
        for next in ALL.into_iter().filter(|s| *s != Deleted) {
            assert!(
                !Deleted.can_transition_to(next),
                "Deleted must not move to {next}"
            );
        }
    }

    #[test]
    fn test_in_flight_operations_cannot_be_deleted() {
        assert!(!Creating.can_transition_to(Deleting));
        assert!(!Updating.can_transition_to(Deleting));
        assert!(!Creating.can_transition_to(Updating));
    }

    #[test]
    fn test_same_status_is_always_allowed() {
        for status in ALL {
            assert!(status.can_transition_to(status));
        }
    }

    #[test]
    fn test_status_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Running).unwrap(), "\"RUNNING\"");
        let parsed: ClusterStatus = serde_json::from_str("\"DELETING\"").unwrap();
        assert_eq!(parsed, Deleting);
        assert_eq!(Running.to_string(), "Running");
    }

    #[test]
    fn test_messages_required_for_error_and_deleted() {
        assert!(Error.requires_message());
        assert!(Deleted.requires_message());
        assert!(!Running.requires_message());
        assert_eq!(Error.default_message(), "unknown error");
    }

    #[test]
    fn test_cloud_and_distribution_parse() {
        assert_eq!("Amazon".parse::<CloudKind>().unwrap(), CloudKind::Amazon);
        assert_eq!("pke".parse::<Distribution>().unwrap(), Distribution::Pke);
        assert!("azure".parse::<CloudKind>().is_err());
        assert!("aks".parse::<Distribution>().is_err());
    }
}
