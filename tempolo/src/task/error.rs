use crate::task::Id;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// Why observing a task did not produce its value.
///
/// The error is cheap to clone: every observer of a failed task receives the
/// same recorded failure.
#[derive(thiserror::Error, Debug, Clone)]
pub enum TaskError {
    /// The work returned an error.
    #[error("task {id} failed: {error:#}")]
    Failed { id: Id, error: Arc<anyhow::Error> },

    /// The work panicked.
    #[error("task {id} panicked: {message}")]
    Panicked { id: Id, message: Arc<str> },

    /// The task was cancelled before it produced an outcome.
    #[error("task {0} was cancelled")]
    Cancelled(Id),

    /// A bounded wait elapsed before the task produced an outcome. The task
    /// itself is unaffected.
    #[error("timed out after {0:?} waiting for task")]
    Timeout(Duration),

    /// The executor refused the submission.
    #[error("task rejected: {0}")]
    Rejected(#[from] RejectReason),
}

/// Reason for a [`TaskError::Rejected`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    #[error("executor is shut down")]
    Shutdown,

    #[error("period of a periodic task must be greater than zero")]
    NonPositivePeriod,
}

impl TaskError {
    pub(crate) fn failed(id: Id, error: anyhow::Error) -> TaskError {
        TaskError::Failed {
            id,
            error: Arc::new(error),
        }
    }

    pub(crate) fn panicked(id: Id, payload: Box<dyn Any + Send + 'static>) -> TaskError {
        TaskError::Panicked {
            id,
            message: panic_payload_as_str(&*payload).into(),
        }
    }

    /// The work itself failed, by returning an error or panicking.
    pub fn is_execution_failure(&self) -> bool {
        matches!(self, TaskError::Failed { .. } | TaskError::Panicked { .. })
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, TaskError::Panicked { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::Timeout(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, TaskError::Rejected(_))
    }

    /// The error returned by the work, if that is why the task failed.
    pub fn failure(&self) -> Option<&anyhow::Error> {
        match self {
            TaskError::Failed { error, .. } => Some(&**error),
            _ => None,
        }
    }

    /// Id of the task the error is about, when there is one.
    pub fn id(&self) -> Option<Id> {
        match self {
            TaskError::Failed { id, .. }
            | TaskError::Panicked { id, .. }
            | TaskError::Cancelled(id) => Some(*id),
            TaskError::Timeout(_) | TaskError::Rejected(_) => None,
        }
    }
}

pub(crate) fn panic_payload_as_str(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}
