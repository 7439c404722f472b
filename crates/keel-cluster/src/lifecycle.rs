//! Cluster status transitions and the status-history ledger
//!
//! [`set_status`] is the only path that changes a cluster's status. A change
//! of status writes the record and one history entry together; repeating the
//! current status may refresh the message but never adds history.

use tracing::{debug, info};

use keel_common::model::{ClusterRecord, ClusterStatus, StatusHistoryEntry};
use keel_common::{Error, Result};

use crate::store::ClusterStore;

/// Whether a [`set_status`] call recorded anything
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusChange {
    /// Status and message already matched
    Unchanged,
    /// Same status, new message; no history entry
    MessageUpdated,
    /// New status; one history entry appended
    Transitioned,
}

/// Move `record` to (`status`, `message`) and persist it.
///
/// An invalid transition is a `Conflict` and writes nothing. An empty message
/// on Error or Deleted is replaced with that status's default message.
///
/// `record` is updated before the write. If the store fails, the error is
/// returned as-is and `record` keeps the new values; reload before acting on
/// it again.
pub async fn set_status(
    store: &dyn ClusterStore,
    record: &mut ClusterRecord,
    status: ClusterStatus,
    message: &str,
) -> Result<StatusChange> {
    if !record.status.can_transition_to(status) {
        return Err(Error::conflict(
            &record.name,
            format!("invalid status transition {} -> {}", record.status, status),
        ));
    }

    let message = if message.is_empty() && status.requires_message() {
        status.default_message()
    } else {
        message
    };

    if record.status == status {
        if record.status_message == message {
            debug!(cluster = %record.name, %status, "status unchanged, skipping update");
            return Ok(StatusChange::Unchanged);
        }
        record.status_message = message.to_string();
        store.update_status(record.id, status, message, None).await?;
        debug!(cluster = %record.name, %status, status_message = message, "status message updated");
        return Ok(StatusChange::MessageUpdated);
    }

    let entry = StatusHistoryEntry::transition(record, status, message);
    let from = record.status;
    record.status = status;
    record.status_message = message.to_string();
    store
        .update_status(record.id, status, message, Some(entry))
        .await?;

    info!(
        cluster = %record.name,
        cluster_id = record.id,
        %from,
        to = %status,
        status_message = message,
        "cluster status changed"
    );
    Ok(StatusChange::Transitioned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{CreateClusterRequest, NodePoolRequest};
    use crate::store::{MemoryClusterStore, MockClusterStore};
    use keel_common::model::{CloudKind, Distribution};

    fn request() -> CreateClusterRequest {
        CreateClusterRequest {
            org_id: 1,
            name: "demo".to_string(),
            cloud: CloudKind::Google,
            distribution: Distribution::Gke,
            location: "europe-west1".to_string(),
            secret_id: "gcp".to_string(),
            created_by: "alice".to_string(),
            rbac_enabled: false,
            features: Default::default(),
            node_pools: vec![NodePoolRequest::new("np1", "n1-standard-2", 1)],
        }
    }

    async fn saved(store: &MemoryClusterStore) -> ClusterRecord {
        let (record, pools) = request().to_records();
        store.save(record, pools).await.unwrap()
    }

    // =========================================================================
    // Ledger Stories
    // =========================================================================

    /// Story: a cluster polled while still provisioning
    ///
    /// The orchestrator reports Creating again and again while it waits. Only
    /// the real changes may reach the audit log, otherwise every poll would
    /// add an entry.
    #[tokio::test]
    async fn story_repeated_status_adds_no_history() {
        let store = MemoryClusterStore::new();
        let mut record = saved(&store).await;

        let calls = [
            (ClusterStatus::Creating, "provisioning"),
            (ClusterStatus::Creating, "provisioning"),
            (ClusterStatus::Creating, "still provisioning"),
            (ClusterStatus::Running, ""),
            (ClusterStatus::Running, ""),
            (ClusterStatus::Updating, "scaling np1"),
            (ClusterStatus::Running, ""),
        ];
        let mut distinct = 0;
        for (status, message) in calls {
            let previous = record.status;
            set_status(&store, &mut record, status, message).await.unwrap();
            if previous != status {
                distinct += 1;
            }
        }

        let history = store.status_history(record.id).await.unwrap();
        // genesis entry plus one per distinct change
        assert_eq!(history.len(), 1 + distinct);
        assert_eq!(distinct, 3);

        let stored = store.reload(record.id).await.unwrap();
        assert_eq!(stored.status, ClusterStatus::Running);
        assert_eq!(stored, record);
    }

    /// Story: history entries capture both sides of a transition
    #[tokio::test]
    async fn story_entry_records_from_and_to() {
        let store = MemoryClusterStore::new();
        let mut record = saved(&store).await;

        set_status(&store, &mut record, ClusterStatus::Creating, "provisioning")
            .await
            .unwrap();
        let change = set_status(&store, &mut record, ClusterStatus::Error, "quota exceeded")
            .await
            .unwrap();
        assert_eq!(change, StatusChange::Transitioned);

        let history = store.status_history(record.id).await.unwrap();
        let last = history.last().unwrap();
        assert_eq!(last.from_status, Some(ClusterStatus::Creating));
        assert_eq!(last.from_message, "provisioning");
        assert_eq!(last.to_status, ClusterStatus::Error);
        assert_eq!(last.to_message, "quota exceeded");
        assert_eq!(last.cluster_name, "demo");
    }

    #[tokio::test]
    async fn test_invalid_transition_is_conflict_and_writes_nothing() {
        let store = MemoryClusterStore::new();
        let mut record = saved(&store).await;

        let err = set_status(&store, &mut record, ClusterStatus::Deleted, "")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Conflict { .. }));
        assert_eq!(record.status, ClusterStatus::Creating);
        assert_eq!(store.status_history(record.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_error_gets_default_message() {
        let store = MemoryClusterStore::new();
        let mut record = saved(&store).await;

        set_status(&store, &mut record, ClusterStatus::Error, "")
            .await
            .unwrap();

        assert_eq!(record.status_message, "unknown error");
        assert_eq!(
            store.reload(record.id).await.unwrap().status_message,
            "unknown error"
        );
    }

    #[tokio::test]
    async fn test_message_only_update() {
        let store = MemoryClusterStore::new();
        let mut record = saved(&store).await;

        let change = set_status(&store, &mut record, ClusterStatus::Creating, "provisioning")
            .await
            .unwrap();
        assert_eq!(change, StatusChange::MessageUpdated);
        let change = set_status(&store, &mut record, ClusterStatus::Creating, "provisioning")
            .await
            .unwrap();
        assert_eq!(change, StatusChange::Unchanged);
    }

    /// Story: the database goes away mid-transition
    ///
    /// The error reaches the caller untouched and the in-memory record is not
    /// rolled back, so the caller knows to reload.
    #[tokio::test]
    async fn story_persistence_failure_is_surfaced_verbatim() {
        let store = MemoryClusterStore::new();
        let mut record = saved(&store).await;

        let mut failing = MockClusterStore::new();
        failing
            .expect_update_status()
            .times(1)
            .returning(|_, _, _, _| Err(Error::persistence("connection reset")));

        let err = set_status(&failing, &mut record, ClusterStatus::Running, "")
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "persistence error: connection reset");
        assert_eq!(record.status, ClusterStatus::Running);
    }

    #[tokio::test]
    async fn test_transition_and_entry_are_written_together() {
        let store = MemoryClusterStore::new();
        let mut record = saved(&store).await;

        let mut checking = MockClusterStore::new();
        checking
            .expect_update_status()
            .withf(|_, status, message, entry| {
                *status == ClusterStatus::Running
                    && message.is_empty()
                    && entry.as_ref().is_some_and(|e| {
                        e.from_status == Some(ClusterStatus::Creating)
                            && e.to_status == ClusterStatus::Running
                    })
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        set_status(&checking, &mut record, ClusterStatus::Running, "")
            .await
            .unwrap();
    }
}
