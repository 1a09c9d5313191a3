//! Scheduler service loop.
//!
//! # Architecture
//!
//! ```text
//! producers ──update_tasks──┐
//! workers ───finish_task────┼──► mailbox ──► SchedulerService ──spawn_blocking──► Job::execute
//! ticker ───────────────────┘                 (owns Manager)
//! ```
//!
//! The service is the only code touching the [`Manager`]. Plugin calls run on
//! the blocking pool and report back through the same mailbox, so scheduler
//! state is never shared between threads.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handle::SchedulerHandle;
use super::job::Job;
use super::manager::Manager;
use super::messages::ManagerMessage;
use crate::config::SchedulerConfig;

pub struct SchedulerService {
    manager: Manager,
    mailbox: mpsc::Receiver<ManagerMessage>,
    handle: SchedulerHandle,
    cancellation_token: CancellationToken,
    tick_interval: Duration,
    clock_tolerance: Duration,
    last_tick: Option<(DateTime<Utc>, Instant)>,
}

impl SchedulerService {
    /// Creates the service and the handle producers use to reach it.
    pub fn new(
        manager: Manager,
        config: &SchedulerConfig,
        cancellation_token: CancellationToken,
    ) -> (Self, SchedulerHandle) {
        let (sender, mailbox) = mpsc::channel(config.mailbox_capacity);
        let handle = SchedulerHandle::new(sender, cancellation_token.clone(), config.send_timeout());

        let service = Self {
            manager,
            mailbox,
            handle: handle.clone(),
            cancellation_token,
            tick_interval: config.tick_interval(),
            clock_tolerance: config.clock_jump_tolerance(),
            last_tick: None,
        };
        (service, handle)
    }

    /// Runs until cancelled or asked to stop.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(tick_ms = self.tick_interval.as_millis() as u64, "Scheduler started");

        loop {
            tokio::select! {
                biased;

                _ = self.cancellation_token.cancelled() => {
                    info!("Scheduler cancelled");
                    break;
                }

                _ = ticker.tick() => {
                    self.on_tick(Utc::now(), Instant::now());
                }

                msg = self.mailbox.recv() => {
                    match msg {
                        Some(ManagerMessage::Stop(ack)) => {
                            self.stop_runners().await;
                            let _ = ack.send(());
                            break;
                        }
                        Some(msg) => self.handle_message(msg),
                        None => break,
                    }
                }
            }
        }

        info!("Scheduler stopped");
    }

    fn on_tick(&mut self, now: DateTime<Utc>, instant: Instant) {
        if let Some((last, last_instant)) = self.last_tick.replace((now, instant))
            && self.clock_moved(now - last, instant.duration_since(last_instant))
        {
            self.manager.reschedule_queue(now);
        }

        for job in self.manager.process_queue(now) {
            self.spawn_job(job);
        }
    }

    /// Wall time between ticks drifted from monotonic time by at least the
    /// tolerance. A stalled loop advances both and is not a jump.
    fn clock_moved(&self, wall: chrono::Duration, monotonic: Duration) -> bool {
        let drift = wall.num_milliseconds() - monotonic.as_millis() as i64;
        drift.unsigned_abs() >= self.clock_tolerance.as_millis() as u64
    }

    fn handle_message(&mut self, msg: ManagerMessage) {
        match msg {
            ManagerMessage::Update(update) => {
                debug!(owner = update.owner_id, requests = update.requests.len(), "Processing update");
                self.manager.process_update_request(update, Utc::now());
            }
            ManagerMessage::Finish(report) => {
                self.manager.process_finish(report, Utc::now());
            }
            ManagerMessage::GetStats(reply) => {
                let _ = reply.send(self.manager.stats());
            }
            ManagerMessage::Stop(ack) => {
                let _ = ack.send(());
            }
        }
    }

    fn spawn_job(&self, job: Job) {
        let handle = self.handle.clone();
        tokio::task::spawn_blocking(move || {
            if let Some(report) = job.execute()
                && let Err(e) = handle.finish_task_blocking(report)
            {
                debug!(error = %e, "Dropping finish report");
            }
        });
    }

    async fn stop_runners(&mut self) {
        let jobs = self.manager.shutdown_jobs(Utc::now());
        if jobs.is_empty() {
            return;
        }
        info!(count = jobs.len(), "Stopping running plugins");

        for job in jobs {
            let plugin = job.plugin_name().to_string();
            if let Err(e) = tokio::task::spawn_blocking(move || job.execute()).await {
                warn!(plugin = %plugin, error = %e, "Stop task panicked");
            }
        }
    }
}
