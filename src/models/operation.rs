//! Operation model and its state machine.
//!
//! An operation is one invocation of a long-running command. It is created
//! `Queued` when the server accepts the command and only the worker executing
//! it moves it forward:
//!
//! ```text
//! Queued ──► Running ──► Succeeded | Failed | TimedOut
//!    │          │
//!    └──────────┴──► Cancelled   (cancellable kinds only)
//! ```
//!
//! Terminal states have no outgoing edges.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::AppError;

/// The long-running commands the subsystem knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandKind {
    Scan,
    GenerateIac,
    GenerateSpec,
    Deploy,
}

impl CommandKind {
    pub const ALL: [CommandKind; 4] = [
        CommandKind::Scan,
        CommandKind::GenerateIac,
        CommandKind::GenerateSpec,
        CommandKind::Deploy,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Scan => "scan",
            CommandKind::GenerateIac => "generate-iac",
            CommandKind::GenerateSpec => "generate-spec",
            CommandKind::Deploy => "deploy",
        }
    }

    /// Deploys are not interruptible once started.
    pub fn supports_cancellation(self) -> bool {
        !matches!(self, CommandKind::Deploy)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CommandKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| AppError::Unsupported(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl OperationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationStatus::Queued => "queued",
            OperationStatus::Running => "running",
            OperationStatus::Succeeded => "succeeded",
            OperationStatus::Failed => "failed",
            OperationStatus::TimedOut => "timed_out",
            OperationStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, OperationStatus::Queued | OperationStatus::Running)
    }

    /// Whether `self -> next` is an edge of the state machine for `kind`.
    pub fn can_transition_to(self, next: OperationStatus, kind: CommandKind) -> bool {
        use OperationStatus::*;
        match (self, next) {
            (Queued, Running) => true,
            (Running, Succeeded | Failed | TimedOut) => true,
            (Queued | Running, Cancelled) => kind.supports_cancellation(),
            _ => false,
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-side record of one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: Uuid,
    pub kind: CommandKind,
    pub status: OperationStatus,
    pub tenant_id: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Cumulative percent, 0-100, never decreases
    pub progress_percent: u8,

    /// Highest progress sequence published for this operation
    pub last_sequence: u64,

    pub result: Option<Value>,
    pub error: Option<String>,
}

impl Operation {
    pub fn new(kind: CommandKind, tenant_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            status: OperationStatus::Queued,
            tenant_id: tenant_id.into(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            progress_percent: 0,
            last_sequence: 0,
            result: None,
            error: None,
        }
    }

    /// Move to `next`, stamping start/finish times.
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidTransition`] if the edge does not exist for this kind.
    pub fn transition(&mut self, next: OperationStatus) -> Result<(), AppError> {
        if !self.status.can_transition_to(next, self.kind) {
            return Err(AppError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        if next == OperationStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
            if next == OperationStatus::Succeeded {
                self.progress_percent = 100;
            }
        }
        self.status = next;
        Ok(())
    }

    /// Raise the cumulative percent. Lower values are ignored.
    pub fn record_progress(&mut self, percent: u8) {
        self.progress_percent = self.progress_percent.max(percent.min(100));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut op = Operation::new(CommandKind::Scan, "tenant-1");
        op.transition(OperationStatus::Running).unwrap();
        assert!(op.started_at.is_some());
        op.transition(OperationStatus::Succeeded).unwrap();
        assert!(op.finished_at.is_some());
        assert_eq!(op.progress_percent, 100);
    }

    #[test]
    fn terminal_states_have_no_exits() {
        use OperationStatus::*;
        for terminal in [Succeeded, Failed, TimedOut, Cancelled] {
            for next in [Queued, Running, Succeeded, Failed, TimedOut, Cancelled] {
                assert!(!terminal.can_transition_to(next, CommandKind::Scan));
            }
        }
    }

    #[test]
    fn deploy_cannot_be_cancelled() {
        let mut op = Operation::new(CommandKind::Deploy, "tenant-1");
        op.transition(OperationStatus::Running).unwrap();
        let err = op.transition(OperationStatus::Cancelled).unwrap_err();
        assert!(matches!(
            err,
            AppError::InvalidTransition {
                from: OperationStatus::Running,
                to: OperationStatus::Cancelled
            }
        ));
    }

    #[test]
    fn queued_cancellable_kind_can_be_cancelled() {
        let mut op = Operation::new(CommandKind::GenerateIac, "tenant-1");
        op.transition(OperationStatus::Cancelled).unwrap();
        assert!(op.status.is_terminal());
    }

    #[test]
    fn progress_never_decreases() {
        let mut op = Operation::new(CommandKind::Scan, "t");
        op.record_progress(40);
        op.record_progress(20);
        op.record_progress(250);
        assert_eq!(op.progress_percent, 100);
    }

    #[test]
    fn kinds_use_kebab_case_on_the_wire() {
        assert_eq!(
            serde_json::to_string(&CommandKind::GenerateIac).unwrap(),
            "\"generate-iac\""
        );
        assert_eq!("generate-spec".parse::<CommandKind>().unwrap(), CommandKind::GenerateSpec);
        assert!("teleport".parse::<CommandKind>().is_err());
        assert_eq!(
            serde_json::to_string(&OperationStatus::TimedOut).unwrap(),
            "\"timed_out\""
        );
    }
}
