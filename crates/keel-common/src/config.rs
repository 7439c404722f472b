//! Orchestrator configuration
//!
//! Every field has a default so an empty document is a valid configuration.
//! Values are threaded explicitly into drivers, the poller and the label
//! reconciler; nothing reads configuration from global state.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::retry::BackoffPolicy;
use crate::yaml::parse_yaml;
use crate::Error;

/// Environment variable overriding the machine-metadata endpoint
pub const ENV_METADATA_ENDPOINT: &str = "KEEL_METADATA_ENDPOINT";
/// Environment variable overriding the head node pool name
pub const ENV_HEAD_NODE_POOL: &str = "KEEL_HEAD_NODE_POOL";
/// Environment variable overriding the log format (`json` or `text`)
pub const ENV_LOG_FORMAT: &str = "KEEL_LOG_FORMAT";

/// Top-level configuration
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct KeelConfig {
    /// Wait budgets for asynchronous provider progress
    pub poll: PollConfig,
    /// Node pool label reconciliation
    pub labels: LabelSettings,
    /// Machine-metadata service
    pub metadata: MetadataSettings,
    /// Per-provider driver settings
    pub drivers: DriverSettings,
    /// Log output format
    pub log_format: LogFormat,
}

impl KeelConfig {
    /// Parse a YAML document; an empty document yields the defaults
    pub fn from_yaml(input: &str) -> Result<Self, Error> {
        let value = parse_yaml(input)?;
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value)
            .map_err(|e| Error::serialization_for_kind("KeelConfig", e.to_string()))
    }

    /// Read and parse a YAML file
    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::internal_with_context(
                "config",
                format!("failed to read {}: {}", path.display(), e),
            )
        })?;
        Self::from_yaml(&content)
    }

    /// Apply `KEEL_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(endpoint) = lookup(ENV_METADATA_ENDPOINT) {
            self.metadata.endpoint = Some(endpoint);
        }
        if let Some(pool) = lookup(ENV_HEAD_NODE_POOL) {
            self.labels.head_node_pool_name = Some(pool);
        }
        if let Some(format) = lookup(ENV_LOG_FORMAT) {
            match format.to_lowercase().as_str() {
                "json" => self.log_format = LogFormat::Json,
                "text" => self.log_format = LogFormat::Text,
                _ => {}
            }
        }
    }
}

/// Log output format
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Delay schedule kind for [`PollSettings`]
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Fixed interval
    #[default]
    Constant,
    /// Doubling interval capped at `maxIntervalSecs`
    Exponential,
}

/// One bounded wait
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PollSettings {
    /// Delay between checks (initial delay for exponential backoff)
    pub interval_secs: u64,
    /// Maximum elapsed time before giving up
    pub timeout_secs: u64,
    /// Delay schedule
    pub backoff: BackoffKind,
    /// Cap on a single delay for exponential backoff
    pub max_interval_secs: u64,
    /// Randomize delays
    pub jitter: bool,
}

impl PollSettings {
    fn with_timeout(timeout_secs: u64) -> Self {
        Self {
            timeout_secs,
            ..Self::default()
        }
    }

    /// Convert into a poller policy
    pub fn policy(&self) -> BackoffPolicy {
        let interval = Duration::from_secs(self.interval_secs);
        let max_elapsed = Duration::from_secs(self.timeout_secs);
        let policy = match self.backoff {
            BackoffKind::Constant => BackoffPolicy::constant(interval, max_elapsed),
            BackoffKind::Exponential => BackoffPolicy::exponential(
                interval,
                Duration::from_secs(self.max_interval_secs.max(self.interval_secs)),
                max_elapsed,
            ),
        };
        if self.jitter {
            policy.with_jitter()
        } else {
            policy
        }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_secs: 20,
            timeout_secs: 3600,
            backoff: BackoffKind::Constant,
            max_interval_secs: 120,
            jitter: false,
        }
    }
}

/// Wait budgets per lifecycle step
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PollConfig {
    /// Waiting for a created cluster to reach Running
    pub create: PollSettings,
    /// Waiting for a node pool update to settle
    pub update: PollSettings,
    /// Waiting for a self-registering control plane to report in
    pub registration: PollSettings,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            create: PollSettings::default(),
            update: PollSettings::default(),
            registration: PollSettings::with_timeout(30 * 60),
        }
    }
}

/// Node pool label reconciliation settings
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LabelSettings {
    /// Name of the pool hosting platform-management workloads
    pub head_node_pool_name: Option<String>,
    /// Label domains users may not set
    pub reserved_domains: Vec<String>,
    /// Namespace holding label-sync objects inside each cluster
    pub sync_namespace: String,
}

impl Default for LabelSettings {
    fn default() -> Self {
        Self {
            head_node_pool_name: None,
            reserved_domains: [
                "kubernetes.io",
                "k8s.io",
                "google.com",
                "node.keel.dev",
                "nodepool.keel.dev",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            sync_namespace: "keel-system".to_string(),
        }
    }
}

/// Machine-metadata service settings
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MetadataSettings {
    /// Base URL; label metadata enrichment is disabled when unset
    pub endpoint: Option<String>,
    /// Per-request timeout
    pub request_timeout_secs: u64,
}

impl Default for MetadataSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            request_timeout_secs: 10,
        }
    }
}

/// Validation bounds for one managed-provider driver
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ManagedDriverSettings {
    /// Smallest allowed node count per pool
    pub min_node_count: u32,
    /// Largest allowed node count per pool
    pub max_node_count: u32,
    /// Allowed system disk categories; empty disables the check
    pub disk_categories: Vec<String>,
}

impl Default for ManagedDriverSettings {
    fn default() -> Self {
        Self {
            min_node_count: 1,
            max_node_count: 100,
            disk_categories: Vec::new(),
        }
    }
}

/// Per-provider driver settings
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DriverSettings {
    /// Alibaba ACK
    pub alibaba: ManagedDriverSettings,
    /// Native EC2
    pub ec2: ManagedDriverSettings,
    /// GKE
    pub gke: ManagedDriverSettings,
    /// EKS
    pub eks: ManagedDriverSettings,
    /// Self-registering PKE on EC2
    pub pke: ManagedDriverSettings,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            alibaba: ManagedDriverSettings {
                disk_categories: ["cloud", "cloud_efficiency", "cloud_ssd", "cloud_essd"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
                ..Default::default()
            },
            ec2: ManagedDriverSettings::default(),
            gke: ManagedDriverSettings {
                max_node_count: 1000,
                ..Default::default()
            },
            eks: ManagedDriverSettings::default(),
            pke: ManagedDriverSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Backoff;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = KeelConfig::from_yaml("").unwrap();
        assert_eq!(config, KeelConfig::default());
        assert_eq!(config.poll.registration.timeout_secs, 1800);
        assert_eq!(config.poll.create.timeout_secs, 3600);
        assert!(config
            .labels
            .reserved_domains
            .contains(&"kubernetes.io".to_string()));
    }

    #[test]
    fn test_partial_document_keeps_other_defaults() {
        let yaml = r#"
poll:
  create:
    intervalSecs: 5
    timeoutSecs: 600
    backoff: exponential
labels:
  headNodePoolName: system
drivers:
  eks:
    maxNodeCount: 20
logFormat: json
"#;
        let config = KeelConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.poll.create.interval_secs, 5);
        assert_eq!(config.poll.create.backoff, BackoffKind::Exponential);
        assert_eq!(config.poll.update, PollSettings::default());
        assert_eq!(config.labels.head_node_pool_name.as_deref(), Some("system"));
        assert_eq!(config.labels.sync_namespace, "keel-system");
        assert_eq!(config.drivers.eks.max_node_count, 20);
        assert_eq!(config.drivers.eks.min_node_count, 1);
        assert_eq!(config.drivers.alibaba.disk_categories.len(), 4);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_unknown_backoff_is_rejected() {
        let result = KeelConfig::from_yaml("poll:\n  create:\n    backoff: fibonacci\n");
        assert!(matches!(result, Err(Error::Serialization { .. })));
    }

    #[test]
    fn test_poll_settings_to_policy() {
        let constant = PollSettings::default().policy();
        assert_eq!(constant.backoff, Backoff::Constant(Duration::from_secs(20)));
        assert_eq!(constant.max_elapsed, Duration::from_secs(3600));

        let exponential = PollSettings {
            interval_secs: 2,
            timeout_secs: 60,
            backoff: BackoffKind::Exponential,
            max_interval_secs: 16,
            jitter: true,
        }
        .policy();
        assert!(exponential.jitter);
        assert_eq!(exponential.base_delay(4), Duration::from_secs(16));
        assert_eq!(exponential.base_delay(5), Duration::from_secs(16));
    }

    #[test]
    fn test_overrides() {
        let mut config = KeelConfig::default();
        config.apply_overrides(|key| match key {
            ENV_METADATA_ENDPOINT => Some("http://cloudinfo:8000".to_string()),
            ENV_HEAD_NODE_POOL => Some("head".to_string()),
            ENV_LOG_FORMAT => Some("JSON".to_string()),
            _ => None,
        });
        assert_eq!(
            config.metadata.endpoint.as_deref(),
            Some("http://cloudinfo:8000")
        );
        assert_eq!(config.labels.head_node_pool_name.as_deref(), Some("head"));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_load_missing_file() {
        let err = KeelConfig::load(Path::new("/nonexistent/keel.yaml")).unwrap_err();
        assert!(err.to_string().contains("[config]"));
    }
}
