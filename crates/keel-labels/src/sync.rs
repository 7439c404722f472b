//! Pushing desired labels into a cluster
//!
//! The whole desired label state of a cluster lives in a single
//! `NodePoolLabelState` object, written with one server-side apply. Either
//! every pool's labels change or none do, and pools missing from the desired
//! state drop out of the object with the same write. An in-cluster node
//! labeler applies the labels to the nodes of each pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, CustomResource, ResourceExt};
#[cfg(test)]
use mockall::automock;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

use keel_common::{Error, MANAGED_BY_LABEL_KEY, MANAGED_BY_LABEL_VALUE};

use crate::reconciler::DesiredLabels;

/// Field manager used for server-side apply
const FIELD_MANAGER: &str = "keel-label-sync";

/// Name of the one label state object per cluster
pub const LABEL_STATE_NAME: &str = "node-pool-labels";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Desired labels for the nodes of every pool in the cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "labels.keel.dev",
    version = "v1alpha1",
    kind = "NodePoolLabelState",
    plural = "nodepoollabelstates",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolLabelStateSpec {
    /// Pool name to its label key/value pairs
    #[serde(default)]
    pub pools: DesiredLabels,
}

/// Receives the complete desired label state of a cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LabelSyncAgent: Send + Sync {
    /// Replace the cluster's label state with `desired`
    async fn sync(&self, desired: &DesiredLabels) -> Result<(), Error>;
}

/// Connects a [`LabelSyncAgent`] to a cluster given its kubeconfig
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LabelSyncClientFactory: Send + Sync {
    /// Build an agent talking to the cluster described by `kubeconfig`
    async fn connect(&self, kubeconfig: &[u8]) -> Result<Arc<dyn LabelSyncAgent>, Error>;
}

/// Map a kube client error, keeping the API status code when there is one
pub fn kube_error(err: kube::Error) -> Error {
    let code = match &err {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    };
    Error::Kube {
        message: err.to_string(),
        code,
    }
}

/// Build a client from raw kubeconfig bytes
pub async fn client_from_kubeconfig(kubeconfig: &[u8]) -> Result<Client, Error> {
    let text = std::str::from_utf8(kubeconfig)
        .map_err(|e| Error::serialization_for_kind("kubeconfig", format!("invalid UTF-8: {e}")))?;
    let kubeconfig = Kubeconfig::from_yaml(text)
        .map_err(|e| Error::serialization_for_kind("kubeconfig", e.to_string()))?;

    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::internal_with_context("label-sync", format!("failed to load kubeconfig: {e}"))
        })?;
    config.connect_timeout = Some(CONNECT_TIMEOUT);
    config.read_timeout = Some(READ_TIMEOUT);

    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("label-sync", format!("failed to create client: {e}"))
    })
}

/// The object holding the cluster's complete label state
pub fn label_state_for(desired: &DesiredLabels) -> NodePoolLabelState {
    let mut state = NodePoolLabelState::new(
        LABEL_STATE_NAME,
        NodePoolLabelStateSpec {
            pools: desired.clone(),
        },
    );
    state.labels_mut().insert(
        MANAGED_BY_LABEL_KEY.to_string(),
        MANAGED_BY_LABEL_VALUE.to_string(),
    );
    state
}

/// Label sync through the cluster's `NodePoolLabelState` object
pub struct KubeLabelSyncAgent {
    api: Api<NodePoolLabelState>,
}

impl KubeLabelSyncAgent {
    /// Agent writing into `namespace` through `client`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl LabelSyncAgent for KubeLabelSyncAgent {
    async fn sync(&self, desired: &DesiredLabels) -> Result<(), Error> {
        let state = label_state_for(desired);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.api
            .patch(LABEL_STATE_NAME, &params, &Patch::Apply(&state))
            .await
            .map_err(kube_error)?;
        debug!(pools = desired.len(), "applied node pool label state");
        Ok(())
    }
}

/// Factory producing [`KubeLabelSyncAgent`]s
pub struct KubeLabelSyncClientFactory {
    namespace: String,
}

impl KubeLabelSyncClientFactory {
    /// Factory whose agents write into `namespace`
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl LabelSyncClientFactory for KubeLabelSyncClientFactory {
    async fn connect(&self, kubeconfig: &[u8]) -> Result<Arc<dyn LabelSyncAgent>, Error> {
        let client = client_from_kubeconfig(kubeconfig).await?;
        Ok(Arc::new(KubeLabelSyncAgent::new(client, &self.namespace)))
    }
}
