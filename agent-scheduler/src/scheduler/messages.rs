//! Messages exchanged with the scheduler loop.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use super::metrics::SchedulerStats;
use super::task::TaskId;

/// Owner id reserved for direct (passive) requests.
pub const DIRECT_OWNER_ID: u64 = 0;

/// A single metric request of an owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Item identifier, `0` for one-shot direct requests.
    pub itemid: u64,
    /// Metric key, possibly an alias.
    pub key: String,
    /// Update interval, e.g. `30` or `5m`.
    pub delay: String,
}

impl Request {
    pub fn new(itemid: u64, key: impl Into<String>, delay: impl Into<String>) -> Self {
        Self {
            itemid,
            key: key.into(),
            delay: delay.into(),
        }
    }
}

/// A value, or an error, produced for an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub itemid: u64,
    pub value: Result<Value, String>,
    pub timestamp: DateTime<Utc>,
}

impl ItemResult {
    pub fn value(itemid: u64, value: Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            itemid,
            value: Ok(value),
            timestamp,
        }
    }

    pub fn error(itemid: u64, error: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            itemid,
            value: Err(error.into()),
            timestamp,
        }
    }

    pub fn is_error(&self) -> bool {
        self.value.is_err()
    }
}

/// Destination of item results. Called from worker threads.
pub trait ResultWriter: Send + Sync {
    fn write(&self, result: ItemResult);
}

/// Full set of requests of one owner.
///
/// Items of the owner missing from `requests` are removed, and plugins the
/// owner no longer uses are released according to the owner's expiry policy.
#[derive(Clone)]
pub struct UpdateRequest {
    pub owner_id: u64,
    pub sink: Arc<dyn ResultWriter>,
    pub requests: Vec<Request>,
}

impl fmt::Debug for UpdateRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateRequest")
            .field("owner_id", &self.owner_id)
            .field("requests", &self.requests)
            .finish()
    }
}

/// Outcome of a performed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed(String),
}

/// Completion notice sent back to the loop once a task body returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub outcome: TaskOutcome,
}

impl TaskReport {
    pub fn completed(task_id: TaskId) -> Self {
        Self {
            task_id,
            outcome: TaskOutcome::Completed,
        }
    }

    pub fn failed(task_id: TaskId, error: impl Into<String>) -> Self {
        Self {
            task_id,
            outcome: TaskOutcome::Failed(error.into()),
        }
    }
}

/// Messages accepted by the scheduler service.
pub enum ManagerMessage {
    /// Replace the request set of an owner.
    Update(UpdateRequest),
    /// A dispatched task finished.
    Finish(TaskReport),
    /// Query a statistics snapshot.
    GetStats(oneshot::Sender<SchedulerStats>),
    /// Stop runners and exit the loop; acknowledged once done.
    Stop(oneshot::Sender<()>),
}

impl fmt::Debug for ManagerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Update(update) => f.debug_tuple("Update").field(update).finish(),
            Self::Finish(report) => f.debug_tuple("Finish").field(report).finish(),
            Self::GetStats(_) => f.write_str("GetStats"),
            Self::Stop(_) => f.write_str("Stop"),
        }
    }
}
