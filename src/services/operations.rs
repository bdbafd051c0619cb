//! In-memory registry of operations accepted by this server.

use std::{
    collections::HashMap,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::AppError,
    execution::CancellationFlag,
    models::{
        operation::{CommandKind, Operation, OperationStatus},
        progress::{CompletionPayload, ProgressMessage},
    },
};

struct Entry {
    operation: Operation,
    cancel: CancellationFlag,
}

/// Operation records plus each operation's cancellation flag.
///
/// Records are only changed through these methods; the worker running an
/// operation is the only caller of the state-advancing ones.
pub struct OperationRegistry {
    entries: RwLock<HashMap<Uuid, Entry>>,
    retention: Duration,
}

impl OperationRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            retention,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, Entry>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, Entry>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a new `Queued` operation.
    pub fn create(&self, kind: CommandKind, tenant_id: &str) -> (Operation, CancellationFlag) {
        let operation = Operation::new(kind, tenant_id);
        let cancel = CancellationFlag::new();
        self.write().insert(
            operation.id,
            Entry {
                operation: operation.clone(),
                cancel: cancel.clone(),
            },
        );
        (operation, cancel)
    }

    pub fn get(&self, id: Uuid) -> Option<Operation> {
        self.read().get(&id).map(|entry| entry.operation.clone())
    }

    fn with_entry<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Entry) -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        let mut entries = self.write();
        let entry = entries.get_mut(&id).ok_or(AppError::OperationNotFound(id))?;
        f(entry)
    }

    /// # Errors
    ///
    /// [`AppError::OperationNotFound`] or [`AppError::InvalidTransition`].
    pub fn transition(&self, id: Uuid, next: OperationStatus) -> Result<Operation, AppError> {
        self.with_entry(id, |entry| {
            entry.operation.transition(next)?;
            Ok(entry.operation.clone())
        })
    }

    /// Track percent and sequence from a progress message.
    pub fn record_progress(&self, message: &ProgressMessage) {
        let _ = self.with_entry(message.operation_id, |entry| {
            entry.operation.last_sequence = entry.operation.last_sequence.max(message.sequence);
            if let Some(percent) = message.percent() {
                entry.operation.record_progress(percent);
            }
            Ok(())
        });
    }

    /// Apply a terminal outcome.
    ///
    /// An operation already in the same terminal state (cancelled while
    /// queued) is left as is.
    ///
    /// # Errors
    ///
    /// [`AppError::OperationNotFound`] or [`AppError::InvalidTransition`].
    pub fn finish(&self, id: Uuid, outcome: &CompletionPayload) -> Result<Operation, AppError> {
        self.with_entry(id, |entry| {
            let op = &mut entry.operation;
            if op.status != outcome.status {
                op.transition(outcome.status)?;
            }
            op.result.clone_from(&outcome.result);
            op.error.clone_from(&outcome.error);
            Ok(op.clone())
        })
    }

    /// Ask an operation to stop.
    ///
    /// A queued operation moves straight to `Cancelled`; a running one has its
    /// flag set and its worker records the outcome.
    ///
    /// # Errors
    ///
    /// - [`AppError::OperationNotFound`]
    /// - [`AppError::InvalidTransition`] if the kind cannot be cancelled or the
    ///   operation already finished
    pub fn request_cancel(&self, id: Uuid) -> Result<Operation, AppError> {
        self.with_entry(id, |entry| {
            let op = &mut entry.operation;
            if !op.status.can_transition_to(OperationStatus::Cancelled, op.kind) {
                return Err(AppError::InvalidTransition {
                    from: op.status,
                    to: OperationStatus::Cancelled,
                });
            }
            entry.cancel.cancel();
            if op.status == OperationStatus::Queued {
                op.transition(OperationStatus::Cancelled)?;
            }
            info!(operation_id = %id, status = %op.status, "cancellation requested");
            Ok(op.clone())
        })
    }

    /// Drop terminal operations older than the retention period.
    pub fn gc(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, entry| {
            entry
                .operation
                .finished_at
                .is_none_or(|finished| finished + retention > now)
        });
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "expired finished operations");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::progress::MessageKind;
    use serde_json::json;

    #[test]
    fn running_cancel_sets_flag_but_keeps_status() {
        let registry = OperationRegistry::new(Duration::from_secs(60));
        let (op, cancel) = registry.create(CommandKind::Scan, "t");
        registry.transition(op.id, OperationStatus::Running).unwrap();

        let snapshot = registry.request_cancel(op.id).unwrap();
        assert_eq!(snapshot.status, OperationStatus::Running);
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn queued_cancel_is_immediate_and_finish_tolerates_it() {
        let registry = OperationRegistry::new(Duration::from_secs(60));
        let (op, _) = registry.create(CommandKind::GenerateIac, "t");
        assert_eq!(
            registry.request_cancel(op.id).unwrap().status,
            OperationStatus::Cancelled
        );

        let outcome = CompletionPayload {
            status: OperationStatus::Cancelled,
            result: None,
            error: Some("operation cancelled".into()),
        };
        assert!(registry.finish(op.id, &outcome).is_ok());
    }

    #[test]
    fn deploy_and_finished_operations_refuse_cancel() {
        let registry = OperationRegistry::new(Duration::from_secs(60));
        let (deploy, _) = registry.create(CommandKind::Deploy, "t");
        assert!(matches!(
            registry.request_cancel(deploy.id),
            Err(AppError::InvalidTransition { .. })
        ));

        let (scan, _) = registry.create(CommandKind::Scan, "t");
        registry.transition(scan.id, OperationStatus::Running).unwrap();
        registry.transition(scan.id, OperationStatus::Failed).unwrap();
        assert!(matches!(
            registry.request_cancel(scan.id),
            Err(AppError::InvalidTransition { from: OperationStatus::Failed, .. })
        ));
        assert!(matches!(
            registry.request_cancel(Uuid::new_v4()),
            Err(AppError::OperationNotFound(_))
        ));
    }

    #[test]
    fn progress_is_tracked() {
        let registry = OperationRegistry::new(Duration::from_secs(60));
        let (op, _) = registry.create(CommandKind::Scan, "t");
        registry.record_progress(&ProgressMessage::new(
            op.id,
            4,
            MessageKind::Progress,
            json!({ "percent": 35 }),
        ));
        let op = registry.get(op.id).unwrap();
        assert_eq!(op.progress_percent, 35);
        assert_eq!(op.last_sequence, 4);
    }

    #[test]
    fn gc_removes_only_expired_terminal_operations() {
        let registry = OperationRegistry::new(Duration::from_secs(60));
        let (done, _) = registry.create(CommandKind::Scan, "t");
        let (_active, _) = registry.create(CommandKind::Scan, "t");
        registry.transition(done.id, OperationStatus::Running).unwrap();
        registry.transition(done.id, OperationStatus::Succeeded).unwrap();

        assert_eq!(registry.gc(Utc::now()), 0);
        assert_eq!(registry.gc(Utc::now() + chrono::Duration::seconds(61)), 1);
        assert_eq!(registry.len(), 1);
    }
}
