//! Cluster lifecycle operations
//!
//! The orchestrator resolves a driver from the stored record, drives the
//! provider, waits for it to settle and records every status change through
//! [`set_status`]. It never names a concrete driver type.
//!
//! Provider calls are not retried here. The only waiting happens in
//! [`await_condition`], and its timeout is the one failure a caller may retry
//! as-is.

use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use keel_common::config::{DriverSettings, KeelConfig, PollConfig, PollSettings};
use keel_common::model::{
    ClusterId, ClusterRecord, ClusterStatus, NodePoolRecord, StatusHistoryEntry,
};
use keel_common::retry::await_condition;
use keel_common::{Error, Result};
use keel_labels::{
    DesiredLabels, LabelReconciler, LabelSyncClientFactory, MachineTarget, PoolLabelInput,
};

use crate::driver::{
    CreationMode, DriverContext, DriverRegistry, ProviderDriver, AWAITING_REGISTRATION,
};
use crate::lifecycle::set_status;
use crate::request::{
    ClusterStatusReport, CreateClusterRequest, DeleteOptions, NodePoolPlan, NodePoolStatus,
    UpdateNodePoolsRequest,
};
use crate::store::{kubeconfig_secret_request, ClusterStore, SecretStore, KUBECONFIG_VALUE_KEY};

/// Status message while a pushed cluster is provisioned
pub const PROVISIONING: &str = "provisioning";

/// Status message while node pools change
pub const UPDATING_NODE_POOLS: &str = "updating node pools";

/// Status message recorded when a wait runs out
pub const TIMED_OUT: &str = "timed out waiting for cluster";

struct LabelSync {
    reconciler: Arc<LabelReconciler>,
    clients: Arc<dyn LabelSyncClientFactory>,
}

/// Drives cluster lifecycles against their providers
pub struct Orchestrator {
    registry: DriverRegistry,
    store: Arc<dyn ClusterStore>,
    secrets: Arc<dyn SecretStore>,
    settings: Arc<DriverSettings>,
    poll: PollConfig,
    labels: Option<LabelSync>,
}

impl Orchestrator {
    /// Orchestrator building drivers from `registry`
    pub fn new(
        registry: DriverRegistry,
        store: Arc<dyn ClusterStore>,
        secrets: Arc<dyn SecretStore>,
        config: &KeelConfig,
    ) -> Self {
        Self {
            registry,
            store,
            secrets,
            settings: Arc::new(config.drivers.clone()),
            poll: config.poll.clone(),
            labels: None,
        }
    }

    /// Reconcile node pool labels after every successful create and update
    pub fn with_label_sync(
        mut self,
        reconciler: Arc<LabelReconciler>,
        clients: Arc<dyn LabelSyncClientFactory>,
    ) -> Self {
        self.labels = Some(LabelSync {
            reconciler,
            clients,
        });
        self
    }

    fn driver(
        &self,
        record: ClusterRecord,
        node_pools: Vec<NodePoolRecord>,
    ) -> Result<Box<dyn ProviderDriver>> {
        self.registry.build(DriverContext {
            record,
            node_pools,
            settings: self.settings.clone(),
            store: self.store.clone(),
            secrets: self.secrets.clone(),
        })
    }

    /// Provision a cluster and wait until it is running.
    ///
    /// Nothing is persisted for a request the driver rejects. Once the record
    /// exists, every failure leaves it in Error with the reason as message.
    #[instrument(skip(self, request), fields(cluster = %request.name, org_id = request.org_id))]
    pub async fn create(&self, request: CreateClusterRequest) -> Result<ClusterRecord> {
        request.validate()?;
        let (draft, node_pools) = request.to_records();
        self.driver(draft.clone(), node_pools.clone())?
            .validate_creation_request(&request)
            .await?;

        let mut record = self.store.save(draft, node_pools.clone()).await?;
        info!(cluster_id = record.id, "cluster record created");
        let driver = self.driver(record.clone(), node_pools)?;

        if let Err(err) = driver.create().await {
            self.record_failure(&mut record, &err).await;
            return Err(err);
        }

        match driver.creation_mode() {
            CreationMode::Push => {
                set_status(
                    self.store.as_ref(),
                    &mut record,
                    ClusterStatus::Creating,
                    PROVISIONING,
                )
                .await?;
                self.await_running(driver.as_ref(), &mut record, &self.poll.create, "create")
                    .await?;
                if let Err(err) = self.store_credentials(driver.as_ref(), &mut record).await {
                    self.record_failure(&mut record, &err).await;
                    return Err(err);
                }
            }
            CreationMode::SelfRegistering => {
                set_status(
                    self.store.as_ref(),
                    &mut record,
                    ClusterStatus::Creating,
                    AWAITING_REGISTRATION,
                )
                .await?;
                self.await_registration(&mut record).await?;
            }
        }

        set_status(self.store.as_ref(), &mut record, ClusterStatus::Running, "").await?;
        info!(cluster_id = record.id, "cluster running");

        self.sync_labels_after(&record).await;
        Ok(record)
    }

    /// Apply node pool changes and wait for the provider to settle.
    ///
    /// A cluster with an operation in flight rejects changes.
    #[instrument(skip(self, request))]
    pub async fn update(
        &self,
        cluster_id: ClusterId,
        request: UpdateNodePoolsRequest,
    ) -> Result<ClusterRecord> {
        let mut record = self.store.reload(cluster_id).await?;
        if record.status.is_in_progress() {
            return Err(Error::conflict(
                &record.name,
                format!("cannot update node pools while cluster is {}", record.status),
            ));
        }

        let node_pools = self.store.node_pools(cluster_id).await?;
        let plan = request.plan(&record.name, &node_pools)?;
        let driver = self.driver(record.clone(), node_pools)?;

        set_status(
            self.store.as_ref(),
            &mut record,
            ClusterStatus::Updating,
            UPDATING_NODE_POOLS,
        )
        .await?;

        if let Err(err) = driver.update_node_pools(&request).await {
            self.record_failure(&mut record, &err).await;
            return Err(err);
        }
        if let Err(err) = self.apply_plan(cluster_id, &plan).await {
            self.record_failure(&mut record, &err).await;
            return Err(err);
        }

        self.await_running(driver.as_ref(), &mut record, &self.poll.update, "update")
            .await?;
        set_status(self.store.as_ref(), &mut record, ClusterStatus::Running, "").await?;
        info!(
            upserts = plan.upserts.len(),
            removals = plan.removals.len(),
            "node pools updated"
        );

        self.sync_labels_after(&record).await;
        Ok(record)
    }

    /// Tear down the provider resources and remove the record.
    ///
    /// Status history outlives the record; the kubeconfig secret does not.
    /// With `force`, a failed provider delete is logged and the record is
    /// removed anyway.
    #[instrument(skip(self))]
    pub async fn delete(&self, cluster_id: ClusterId, options: DeleteOptions) -> Result<()> {
        let mut record = self.store.reload(cluster_id).await?;
        if record.status.is_in_progress() {
            return Err(Error::conflict(
                &record.name,
                format!("cannot delete while cluster is {}", record.status),
            ));
        }

        let node_pools = self.store.node_pools(cluster_id).await?;
        let outcome = match self.driver(record.clone(), node_pools) {
            Ok(driver) => driver.delete().await,
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            if !options.force {
                self.record_failure(&mut record, &err).await;
                return Err(err);
            }
            warn!(cluster = %record.name, error = %err, "provider delete failed, removing record anyway");
        }

        set_status(self.store.as_ref(), &mut record, ClusterStatus::Deleting, "").await?;
        set_status(self.store.as_ref(), &mut record, ClusterStatus::Deleted, "").await?;
        self.store.delete(cluster_id).await?;
        self.remove_kubeconfig(&record).await;

        info!(cluster = %record.name, "cluster deleted");
        Ok(())
    }

    /// Live provider status alongside the persisted record and node pools
    #[instrument(skip(self))]
    pub async fn status(&self, cluster_id: ClusterId) -> Result<ClusterStatusReport> {
        let record = self.store.reload(cluster_id).await?;
        let node_pools = self.store.node_pools(cluster_id).await?;
        let snapshot = self
            .driver(record.clone(), node_pools.clone())?
            .fetch_status()
            .await?;

        Ok(ClusterStatusReport {
            id: record.id,
            name: record.name,
            cloud: record.cloud,
            distribution: record.distribution,
            location: record.location,
            status: snapshot.status,
            status_message: snapshot.message,
            recorded_status: record.status,
            created_by: record.created_by,
            api_endpoint: record.api_endpoint,
            node_pools: node_pools
                .iter()
                .map(|pool| (pool.name.clone(), NodePoolStatus::from(pool)))
                .collect(),
        })
    }

    /// Every recorded status transition of the cluster, oldest first
    pub async fn status_history(&self, cluster_id: ClusterId) -> Result<Vec<StatusHistoryEntry>> {
        self.store.status_history(cluster_id).await
    }

    /// Push the complete node pool label set into a running cluster
    #[instrument(skip(self))]
    pub async fn sync_labels(&self, cluster_id: ClusterId) -> Result<DesiredLabels> {
        let record = self.store.reload(cluster_id).await?;
        let labels = self.labels.as_ref().ok_or_else(|| {
            Error::validation_for(&record.name, "node pool label sync is not configured")
        })?;
        if record.status != ClusterStatus::Running {
            return Err(Error::conflict(
                &record.name,
                format!("cannot sync labels while cluster is {}", record.status),
            ));
        }

        let kubeconfig = self.kubeconfig(&record).await?;
        let agent = labels.clients.connect(kubeconfig.as_bytes()).await?;

        let pools: Vec<PoolLabelInput> = self
            .store
            .node_pools(cluster_id)
            .await?
            .iter()
            .map(PoolLabelInput::from)
            .collect();
        let target = MachineTarget {
            cloud: record.cloud,
            distribution: record.distribution,
            region: record.location.clone(),
        };
        labels
            .reconciler
            .reconcile(&target, &pools, agent.as_ref())
            .await
    }

    async fn sync_labels_after(&self, record: &ClusterRecord) {
        if self.labels.is_none() {
            return;
        }
        if let Err(err) = self.sync_labels(record.id).await {
            warn!(cluster = %record.name, error = %err, "node pool label sync failed");
        }
    }

    async fn kubeconfig(&self, record: &ClusterRecord) -> Result<String> {
        let secret_id = record
            .config_secret_id
            .as_deref()
            .ok_or_else(|| Error::conflict(&record.name, "no kubeconfig recorded for cluster"))?;
        let secret = self.secrets.get(record.org_id, secret_id).await?;
        secret.values.get(KUBECONFIG_VALUE_KEY).cloned().ok_or_else(|| {
            Error::internal_with_context(
                "orchestrator",
                format!("secret {secret_id} holds no kubeconfig"),
            )
        })
    }

    /// Poll the driver until it reports Running.
    ///
    /// A provider Error state or a permanent read failure ends the wait at
    /// once; retryable read failures count as "not yet".
    async fn await_running(
        &self,
        driver: &dyn ProviderDriver,
        record: &mut ClusterRecord,
        settings: &PollSettings,
        operation: &str,
    ) -> Result<()> {
        let cluster = record.name.clone();
        let name = cluster.as_str();
        let result = await_condition(&settings.policy(), operation, move || async move {
            match driver.fetch_status().await {
                Ok(snapshot) => match snapshot.status {
                    ClusterStatus::Running => Ok(true),
                    ClusterStatus::Error => Err(Error::provider_permanent(
                        name,
                        driver.kind().as_str(),
                        snapshot.message,
                    )),
                    status => {
                        debug!(%status, status_message = %snapshot.message, "cluster not ready");
                        Ok(false)
                    }
                },
                Err(err) if err.is_retryable() => {
                    warn!(error = %err, "status check failed, will retry");
                    Ok(false)
                }
                Err(err) => Err(err),
            }
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                let err = err.into_error(&cluster, operation);
                self.record_failure(record, &err).await;
                Err(err)
            }
        }
    }

    /// Wait for the control plane to hand in its kubeconfig
    async fn await_registration(&self, record: &mut ClusterRecord) -> Result<()> {
        let store = self.store.as_ref();
        let (org_id, cluster_id) = (record.org_id, record.id);
        let result = await_condition(
            &self.poll.registration.policy(),
            "registration",
            move || async move {
                Ok::<_, Error>(store.config_secret_id(org_id, cluster_id).await?.is_some())
            },
        )
        .await;

        if let Err(err) = result {
            let err = err.into_error(&record.name, "registration");
            self.record_failure(record, &err).await;
            return Err(err);
        }

        // registration wrote the secret id and endpoint
        *record = self.store.reload(cluster_id).await?;
        Ok(())
    }

    async fn store_credentials(
        &self,
        driver: &dyn ProviderDriver,
        record: &mut ClusterRecord,
    ) -> Result<()> {
        let endpoint = driver.fetch_api_endpoint().await?;

        match driver.fetch_kubeconfig().await {
            Ok(kubeconfig) => {
                let text = String::from_utf8(kubeconfig).map_err(|e| {
                    Error::serialization_for_kind("kubeconfig", format!("invalid UTF-8: {e}"))
                })?;
                let secret = self
                    .secrets
                    .create_or_update(record.org_id, kubeconfig_secret_request(&record.name, &text))
                    .await?;
                record.config_secret_id = Some(secret.id);
            }
            Err(err) if err.is_not_applicable() => {
                debug!(provider = %driver.kind(), "provider hands out no kubeconfig");
            }
            Err(err) => return Err(err),
        }

        record.api_endpoint = Some(endpoint);
        self.store.update_record(record).await
    }

    /// Drop the kubeconfig of a deleted cluster; the record is already gone
    async fn remove_kubeconfig(&self, record: &ClusterRecord) {
        let Some(secret_id) = record.config_secret_id.as_deref() else {
            return;
        };
        match self.secrets.delete(record.org_id, secret_id).await {
            Ok(()) => debug!(cluster = %record.name, secret = %secret_id, "kubeconfig removed"),
            Err(err) if err.is_not_found() => {}
            Err(err) => warn!(
                cluster = %record.name,
                secret = %secret_id,
                error = %err,
                "failed to remove kubeconfig secret"
            ),
        }
    }

    async fn apply_plan(&self, cluster_id: ClusterId, plan: &NodePoolPlan) -> Result<()> {
        for name in &plan.removals {
            self.store.delete_node_pool(cluster_id, name).await?;
        }
        for pool in &plan.upserts {
            self.store.save_node_pool(cluster_id, pool.clone()).await?;
        }
        Ok(())
    }

    /// Move the cluster to Error; the original failure wins over a store error
    async fn record_failure(&self, record: &mut ClusterRecord, err: &Error) {
        let message = failure_message(err);
        if let Err(store_err) =
            set_status(self.store.as_ref(), record, ClusterStatus::Error, &message).await
        {
            error!(
                cluster = %record.name,
                error = %store_err,
                original = %err,
                "failed to record error status"
            );
        }
    }
}

fn failure_message(err: &Error) -> String {
    match err {
        Error::Provider { message, .. } => message.clone(),
        Error::Timeout { .. } => TIMED_OUT.to_string(),
        other => other.to_string(),
    }
}
