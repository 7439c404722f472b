//! Desired label computation and push.
//!
//! Every running node pool gets one complete label map: its identity, head-pool
//! marker, on-demand marker, the user's own labels (minus reserved domains), and
//! machine attributes from the metadata service. All pools of a cluster are
//! computed first and submitted together; a failure for any pool means nothing
//! is pushed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::future::try_join_all;
use tracing::{debug, info, warn};

use keel_common::config::LabelSettings;
use keel_common::model::{CloudKind, Distribution, NodePoolRecord};
use keel_common::Error;

use crate::metadata::MachineMetadata;
use crate::sync::LabelSyncAgent;

/// Label carrying the node pool name
pub const NODE_POOL_NAME_LABEL: &str = "nodepool.keel.dev/name";
/// Label set to "true" on the head node pool
pub const HEAD_NODE_LABEL: &str = "node.keel.dev/head";
/// Label telling on-demand capacity from spot/preemptible capacity
pub const ON_DEMAND_LABEL: &str = "node.keel.dev/ondemand";
/// Prefix for machine attributes reported by the metadata service
pub const METADATA_LABEL_PREFIX: &str = "node.keel.dev/";

/// Labels for one pool
pub type PoolLabels = BTreeMap<String, String>;

/// Labels for every pool of a cluster, keyed by pool name
pub type DesiredLabels = BTreeMap<String, PoolLabels>;

/// The pool attributes label computation depends on
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PoolLabelInput {
    /// Pool name
    pub name: String,
    /// Provider instance type
    pub instance_type: String,
    /// Spot bid price, if any
    pub spot_price: Option<String>,
    /// Preemptible capacity
    pub preemptible: bool,
    /// User-supplied labels
    pub labels: BTreeMap<String, String>,
}

impl From<&NodePoolRecord> for PoolLabelInput {
    fn from(pool: &NodePoolRecord) -> Self {
        Self {
            name: pool.name.clone(),
            instance_type: pool.spec.instance_type.clone(),
            spot_price: pool.spec.spot_price.clone(),
            preemptible: pool.spec.preemptible,
            labels: pool.spec.labels.clone(),
        }
    }
}

/// Where a cluster's machines live, for metadata lookups
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MachineTarget {
    /// Hosting cloud
    pub cloud: CloudKind,
    /// Kubernetes distribution
    pub distribution: Distribution,
    /// Region
    pub region: String,
}

/// Whether a pool runs on on-demand capacity.
///
/// A parseable positive spot price wins first; the preemptible flag is only
/// consulted when there is no such price.
pub fn is_on_demand(spot_price: Option<&str>, preemptible: bool) -> bool {
    let spot = spot_price
        .and_then(|p| p.trim().parse::<f64>().ok())
        .is_some_and(|p| p > 0.0);
    if spot {
        return false;
    }
    !preemptible
}

/// Whether `key` falls under one of the reserved label domains.
///
/// A plain pattern (`kubernetes.io`) matches the domain itself and any
/// subdomain; a `*.` pattern (`*.k8s.io`) matches subdomains only. Keys
/// without a domain prefix are never reserved.
pub fn is_reserved_label(key: &str, reserved_domains: &[String]) -> bool {
    let Some((domain, _)) = key.split_once('/') else {
        return false;
    };
    let domain = domain.to_lowercase();

    reserved_domains.iter().any(|pattern| {
        let pattern = pattern.to_lowercase();
        match pattern.strip_prefix("*.") {
            Some(parent) => domain.ends_with(&format!(".{parent}")),
            None => domain == pattern || domain.ends_with(&format!(".{pattern}")),
        }
    })
}

/// Computes and pushes node pool labels
pub struct LabelReconciler {
    head_node_pool_name: Option<String>,
    reserved_domains: Vec<String>,
    metadata: Option<Arc<dyn MachineMetadata>>,
}

impl LabelReconciler {
    /// Create a reconciler; without a metadata service, machine attributes are skipped
    pub fn new(settings: &LabelSettings, metadata: Option<Arc<dyn MachineMetadata>>) -> Self {
        Self {
            head_node_pool_name: settings.head_node_pool_name.clone(),
            reserved_domains: settings.reserved_domains.clone(),
            metadata,
        }
    }

    /// Labels derivable from the pool alone (everything except machine attributes)
    pub fn base_labels(&self, pool: &PoolLabelInput) -> PoolLabels {
        let mut labels = PoolLabels::new();

        labels.insert(NODE_POOL_NAME_LABEL.to_string(), pool.name.clone());

        if self.head_node_pool_name.as_deref() == Some(pool.name.as_str()) {
            labels.insert(HEAD_NODE_LABEL.to_string(), "true".to_string());
        }

        labels.insert(
            ON_DEMAND_LABEL.to_string(),
            is_on_demand(pool.spot_price.as_deref(), pool.preemptible).to_string(),
        );

        for (key, value) in &pool.labels {
            if is_reserved_label(key, &self.reserved_domains) {
                warn!(pool = %pool.name, label = %key, "dropping label in reserved domain");
                continue;
            }
            labels.insert(key.clone(), value.clone());
        }

        labels
    }

    /// Complete label sets for every pool.
    ///
    /// Fails as a whole if the metadata lookup fails for any instance type.
    pub async fn desired_labels(
        &self,
        target: &MachineTarget,
        pools: &[PoolLabelInput],
    ) -> Result<DesiredLabels, Error> {
        let attributes = self.machine_attributes(target, pools).await?;

        let mut desired = DesiredLabels::new();
        for pool in pools {
            let mut labels = self.base_labels(pool);
            if let Some(attrs) = attributes.get(&pool.instance_type) {
                for (name, value) in attrs {
                    labels.insert(format!("{METADATA_LABEL_PREFIX}{name}"), value.clone());
                }
            }
            desired.insert(pool.name.clone(), labels);
        }
        Ok(desired)
    }

    /// Compute every pool's labels and submit them in one batch
    pub async fn reconcile(
        &self,
        target: &MachineTarget,
        pools: &[PoolLabelInput],
        agent: &dyn LabelSyncAgent,
    ) -> Result<DesiredLabels, Error> {
        let desired = self.desired_labels(target, pools).await?;
        agent.sync(&desired).await?;
        info!(pools = desired.len(), "node pool labels synced");
        Ok(desired)
    }

    /// One lookup per distinct instance type
    async fn machine_attributes(
        &self,
        target: &MachineTarget,
        pools: &[PoolLabelInput],
    ) -> Result<BTreeMap<String, BTreeMap<String, String>>, Error> {
        let Some(metadata) = &self.metadata else {
            debug!("no machine metadata service configured, skipping attributes");
            return Ok(BTreeMap::new());
        };

        let instance_types: BTreeSet<&str> = pools
            .iter()
            .map(|p| p.instance_type.as_str())
            .filter(|t| !t.is_empty())
            .collect();

        let lookups = instance_types.into_iter().map(|instance_type| {
            let metadata = metadata.clone();
            async move {
                let details = metadata
                    .machine_details(
                        target.cloud,
                        target.distribution,
                        &target.region,
                        instance_type,
                    )
                    .await?;
                Ok::<_, Error>((instance_type.to_string(), details.attributes))
            }
        });

        Ok(try_join_all(lookups).await?.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MachineDetails, MockMachineMetadata};
    use crate::sync::MockLabelSyncAgent;

    fn settings(head: Option<&str>) -> LabelSettings {
        LabelSettings {
            head_node_pool_name: head.map(String::from),
            ..LabelSettings::default()
        }
    }

    fn pool(name: &str, spot_price: Option<&str>, preemptible: bool) -> PoolLabelInput {
        PoolLabelInput {
            name: name.to_string(),
            instance_type: "t-small".to_string(),
            spot_price: spot_price.map(String::from),
            preemptible,
            labels: BTreeMap::new(),
        }
    }

    fn target() -> MachineTarget {
        MachineTarget {
            cloud: CloudKind::Amazon,
            distribution: Distribution::Eks,
            region: "eu-west-1".to_string(),
        }
    }

    #[test]
    fn test_on_demand_derivation() {
        assert!(!is_on_demand(Some("0.05"), false));
        assert!(is_on_demand(Some(""), false));
        assert!(is_on_demand(None, false));
        assert!(!is_on_demand(None, true));
        assert!(!is_on_demand(Some("not-a-price"), true));
        assert!(is_on_demand(Some("0"), false));
        assert!(is_on_demand(Some("-1"), false));
    }

    #[test]
    fn test_reserved_domain_matching() {
        let reserved = LabelSettings::default().reserved_domains;
        assert!(is_reserved_label("kubernetes.io/hostname", &reserved));
        assert!(is_reserved_label("node-role.kubernetes.io/master", &reserved));
        assert!(is_reserved_label("Node.Keel.Dev/cpu", &reserved));
        assert!(!is_reserved_label("team", &reserved));
        assert!(!is_reserved_label("example.com/team", &reserved));
        assert!(!is_reserved_label("notkubernetes.io/x", &reserved));

        let wildcard = vec!["*.k8s.io".to_string()];
        assert!(is_reserved_label("topology.k8s.io/zone", &wildcard));
        assert!(!is_reserved_label("k8s.io/zone", &wildcard));
    }

    #[test]
    fn test_base_labels_for_spot_pool() {
        let reconciler = LabelReconciler::new(&settings(None), None);
        let labels = reconciler.base_labels(&pool("worker-1", Some("0.05"), false));

        assert_eq!(labels[NODE_POOL_NAME_LABEL], "worker-1");
        assert_eq!(labels[ON_DEMAND_LABEL], "false");
        assert!(!labels.contains_key(HEAD_NODE_LABEL));
    }

    #[test]
    fn test_base_labels_for_on_demand_head_pool() {
        let reconciler = LabelReconciler::new(&settings(Some("system")), None);
        let labels = reconciler.base_labels(&pool("system", Some(""), false));

        assert_eq!(labels[ON_DEMAND_LABEL], "true");
        assert_eq!(labels[HEAD_NODE_LABEL], "true");
    }

    #[test]
    fn test_reserved_user_labels_are_dropped() {
        let reconciler = LabelReconciler::new(&settings(None), None);
        let mut input = pool("np1", None, false);
        input
            .labels
            .insert("kubernetes.io/role".to_string(), "admin".to_string());
        input
            .labels
            .insert(NODE_POOL_NAME_LABEL.to_string(), "spoofed".to_string());
        input.labels.insert("team".to_string(), "data".to_string());

        let labels = reconciler.base_labels(&input);

        assert!(!labels.contains_key("kubernetes.io/role"));
        assert_eq!(labels[NODE_POOL_NAME_LABEL], "np1");
        assert_eq!(labels["team"], "data");
    }

    #[tokio::test]
    async fn test_metadata_attributes_are_prefixed_and_looked_up_once() {
        let mut metadata = MockMachineMetadata::new();
        metadata
            .expect_machine_details()
            .withf(|cloud, distribution, region, instance_type| {
                *cloud == CloudKind::Amazon
                    && *distribution == Distribution::Eks
                    && region == "eu-west-1"
                    && instance_type == "t-small"
            })
            .times(1)
            .returning(|_, _, _, _| {
                Ok(MachineDetails {
                    attributes: BTreeMap::from([("cpu".to_string(), "2".to_string())]),
                })
            });

        let reconciler = LabelReconciler::new(&settings(None), Some(Arc::new(metadata)));
        let pools = vec![pool("np1", None, false), pool("np2", Some("0.1"), false)];
        let desired = reconciler.desired_labels(&target(), &pools).await.unwrap();

        assert_eq!(desired.len(), 2);
        assert_eq!(desired["np1"]["node.keel.dev/cpu"], "2");
        assert_eq!(desired["np2"]["node.keel.dev/cpu"], "2");
        assert_eq!(desired["np2"][ON_DEMAND_LABEL], "false");
    }

    #[tokio::test]
    async fn test_all_pools_are_synced_in_one_call() {
        let mut agent = MockLabelSyncAgent::new();
        agent
            .expect_sync()
            .withf(|desired| desired.len() == 2 && desired.contains_key("np2"))
            .times(1)
            .returning(|_| Ok(()));

        let reconciler = LabelReconciler::new(&settings(None), None);
        let pools = vec![pool("np1", None, false), pool("np2", None, true)];
        let desired = reconciler.reconcile(&target(), &pools, &agent).await.unwrap();

        assert_eq!(desired["np2"][ON_DEMAND_LABEL], "false");
    }

    #[tokio::test]
    async fn test_metadata_failure_pushes_nothing() {
        let mut metadata = MockMachineMetadata::new();
        metadata
            .expect_machine_details()
            .returning(|_, _, _, instance_type| {
                if instance_type == "t-broken" {
                    Err(Error::not_found("instance type", instance_type))
                } else {
                    Ok(MachineDetails::default())
                }
            });

        let mut agent = MockLabelSyncAgent::new();
        agent.expect_sync().times(0);

        let reconciler = LabelReconciler::new(&settings(None), Some(Arc::new(metadata)));
        let mut broken = pool("np2", None, false);
        broken.instance_type = "t-broken".to_string();
        let pools = vec![pool("np1", None, false), broken];

        let err = reconciler
            .reconcile(&target(), &pools, &agent)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_sync_failure_is_surfaced() {
        let mut agent = MockLabelSyncAgent::new();
        agent.expect_sync().returning(|_| {
            Err(Error::Kube {
                message: "connection refused".to_string(),
                code: None,
            })
        });

        let reconciler = LabelReconciler::new(&settings(None), None);
        let result = reconciler
            .reconcile(&target(), &[pool("np1", None, false)], &agent)
            .await;
        assert!(matches!(result, Err(Error::Kube { .. })));
    }
}
