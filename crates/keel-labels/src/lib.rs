//! Node pool label reconciliation for keel clusters
//!
//! Computes the complete label set for every node pool of a running cluster
//! and pushes it into the cluster in one batch.

#![deny(missing_docs)]

pub mod metadata;
pub mod reconciler;
pub mod sync;

pub use metadata::{CloudInfoClient, MachineDetails, MachineMetadata};
pub use reconciler::{
    is_on_demand, is_reserved_label, DesiredLabels, LabelReconciler, MachineTarget,
    PoolLabelInput, PoolLabels, HEAD_NODE_LABEL, METADATA_LABEL_PREFIX, NODE_POOL_NAME_LABEL,
    ON_DEMAND_LABEL,
};
pub use sync::{
    KubeLabelSyncAgent, KubeLabelSyncClientFactory, LabelSyncAgent, LabelSyncClientFactory,
    NodePoolLabelState, NodePoolLabelStateSpec, LABEL_STATE_NAME,
};
