//! Handle for talking to the scheduler service.
//!
//! The `SchedulerHandle` provides:
//! - Backpressure-aware sends (try_send with timeout fallback)
//! - Blocking finish reports for worker threads
//! - Request/response queries over oneshot channels

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::messages::{ManagerMessage, Request, ResultWriter, TaskReport, UpdateRequest};
use super::metrics::SchedulerStats;

/// Error type for send operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The scheduler has stopped and is no longer accepting messages.
    SchedulerStopped,
    /// The mailbox is full.
    MailboxFull,
    /// The send operation timed out.
    Timeout,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::SchedulerStopped => write!(f, "Scheduler has stopped"),
            SendError::MailboxFull => write!(f, "Mailbox is full"),
            SendError::Timeout => write!(f, "Send operation timed out"),
        }
    }
}

impl std::error::Error for SendError {}

/// Cloneable handle to a running [`SchedulerService`](super::SchedulerService).
#[derive(Clone)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<ManagerMessage>,
    cancellation_token: CancellationToken,
    send_timeout: Duration,
    max_capacity: usize,
}

impl SchedulerHandle {
    pub fn new(
        sender: mpsc::Sender<ManagerMessage>,
        cancellation_token: CancellationToken,
        send_timeout: Duration,
    ) -> Self {
        let max_capacity = sender.max_capacity();
        Self {
            sender,
            cancellation_token,
            send_timeout,
            max_capacity,
        }
    }

    /// Send a message, waiting up to the configured timeout when the
    /// mailbox is full.
    pub async fn send(&self, msg: ManagerMessage) -> Result<(), SendError> {
        // Fast path: try non-blocking send first
        match self.sender.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(msg)) => {
                match tokio::time::timeout(self.send_timeout, self.sender.reserve()).await {
                    Ok(Ok(permit)) => {
                        permit.send(msg);
                        Ok(())
                    }
                    Ok(Err(_)) => Err(SendError::SchedulerStopped),
                    Err(_) => Err(SendError::Timeout),
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::SchedulerStopped),
        }
    }

    /// Try to send a message without blocking.
    pub fn try_send(&self, msg: ManagerMessage) -> Result<(), SendError> {
        match self.sender.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SendError::MailboxFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::SchedulerStopped),
        }
    }

    /// Replaces the request set of `owner_id`.
    pub async fn update_tasks(
        &self,
        owner_id: u64,
        sink: Arc<dyn ResultWriter>,
        requests: Vec<Request>,
    ) -> Result<(), SendError> {
        self.send(ManagerMessage::Update(UpdateRequest {
            owner_id,
            sink,
            requests,
        }))
        .await
    }

    /// Reports a finished task.
    pub async fn finish_task(&self, report: TaskReport) -> Result<(), SendError> {
        self.sender
            .send(ManagerMessage::Finish(report))
            .await
            .map_err(|_| SendError::SchedulerStopped)
    }

    /// Reports a finished task from a blocking worker thread.
    ///
    /// Waits for mailbox space instead of timing out, since a lost report
    /// would leak the task's capacity. Must not be called from async code.
    pub fn finish_task_blocking(&self, report: TaskReport) -> Result<(), SendError> {
        self.sender
            .blocking_send(ManagerMessage::Finish(report))
            .map_err(|_| SendError::SchedulerStopped)
    }

    pub async fn stats(&self) -> Result<SchedulerStats, SendError> {
        let (tx, rx) = oneshot::channel();
        self.send(ManagerMessage::GetStats(tx)).await?;
        rx.await.map_err(|_| SendError::SchedulerStopped)
    }

    /// Stops running plugins and ends the service loop. Returns once the
    /// runners have been stopped.
    pub async fn shutdown(&self) -> Result<(), SendError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ManagerMessage::Stop(tx))
            .await
            .map_err(|_| SendError::SchedulerStopped)?;
        rx.await.map_err(|_| SendError::SchedulerStopped)
    }

    /// Get the current and maximum mailbox capacity.
    ///
    /// Returns `(current_available, max_capacity)`.
    pub fn mailbox_capacity(&self) -> (usize, usize) {
        (self.sender.capacity(), self.max_capacity)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Cancel the service without stopping runners gracefully.
    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}

impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("capacity", &self.mailbox_capacity())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::messages::ItemResult;

    struct Discard;

    impl ResultWriter for Discard {
        fn write(&self, _result: ItemResult) {}
    }

    fn handle(capacity: usize) -> (SchedulerHandle, mpsc::Receiver<ManagerMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = SchedulerHandle::new(tx, CancellationToken::new(), Duration::from_millis(10));
        (handle, rx)
    }

    #[tokio::test]
    async fn test_update_tasks_delivers_message() {
        let (handle, mut rx) = handle(4);
        handle
            .update_tasks(9, Arc::new(Discard), vec![Request::new(1, "debug", "5")])
            .await
            .unwrap();

        match rx.recv().await {
            Some(ManagerMessage::Update(update)) => {
                assert_eq!(update.owner_id, 9);
                assert_eq!(update.requests.len(), 1);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_times_out_on_full_mailbox() {
        let (handle, _rx) = handle(1);
        handle.try_send(ManagerMessage::Update(UpdateRequest {
            owner_id: 1,
            sink: Arc::new(Discard),
            requests: Vec::new(),
        }))
        .unwrap();

        let (tx, _) = oneshot::channel();
        assert_eq!(handle.try_send(ManagerMessage::GetStats(tx)), Err(SendError::MailboxFull));

        let (tx, _) = oneshot::channel();
        assert_eq!(handle.send(ManagerMessage::GetStats(tx)).await, Err(SendError::Timeout));
    }

    #[tokio::test]
    async fn test_stopped_scheduler() {
        let (handle, rx) = handle(4);
        drop(rx);

        assert!(handle.is_closed());
        assert_eq!(handle.stats().await, Err(SendError::SchedulerStopped));
        assert_eq!(handle.shutdown().await, Err(SendError::SchedulerStopped));
    }

    #[tokio::test]
    async fn test_mailbox_capacity() {
        let (handle, _rx) = handle(10);
        assert_eq!(handle.mailbox_capacity(), (10, 10));

        handle.cancel();
        assert!(handle.is_cancelled());
    }
}
