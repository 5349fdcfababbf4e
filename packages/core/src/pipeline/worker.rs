//! Per-device decision workers.
//!
//! Every device id gets its own mailbox and a worker task spawned on the
//! pipeline's task tracker the first time work arrives for it. The worker
//! drains its mailbox in FIFO order, so all pump state changes for one
//! device are serialized while different devices run concurrently.
//!
//! A worker that sees no work for `idle_timeout` removes its own mailbox
//! and exits; the next task for that device starts a fresh one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::metrics::AppMetrics;
use crate::pipeline::engine::PumpController;
use crate::pipeline::error::PipelineError;
use crate::pipeline::queue::{DeviceQueue, DeviceTask};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

type MailboxMap = Arc<Mutex<HashMap<String, Arc<Mailbox>>>>;

struct Mailbox {
    queue: Mutex<DeviceQueue>,
    notify: Notify,
}

impl Mailbox {
    fn queue(&self) -> MutexGuard<'_, DeviceQueue> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub struct DeviceWorkers {
    controller: Arc<PumpController>,
    mailboxes: MailboxMap,
    capacity: usize,
    idle_timeout: Duration,
    tracker: TaskTracker,
    closed: CancellationToken,
    metrics: Arc<AppMetrics>,
}

impl DeviceWorkers {
    pub fn new(
        controller: Arc<PumpController>,
        capacity: usize,
        idle_timeout: Duration,
        tracker: TaskTracker,
        metrics: Arc<AppMetrics>,
    ) -> Self {
        Self {
            controller,
            mailboxes: Arc::new(Mutex::new(HashMap::new())),
            capacity,
            idle_timeout,
            tracker,
            closed: CancellationToken::new(),
            metrics,
        }
    }

    /// Queue a task for `device_id`, starting its worker if needed.
    pub fn submit(&self, device_id: &str, task: DeviceTask) -> Result<(), PipelineError> {
        let mut mailboxes = self.mailboxes();

        // Checked under the map lock so close() cannot slip in between.
        if self.closed.is_cancelled() {
            return Err(PipelineError::ShuttingDown);
        }

        let mailbox = match mailboxes.get(device_id) {
            Some(mailbox) => Arc::clone(mailbox),
            None => {
                let mailbox = Arc::new(Mailbox {
                    queue: Mutex::new(DeviceQueue::new(self.capacity)),
                    notify: Notify::new(),
                });
                mailboxes.insert(device_id.to_string(), Arc::clone(&mailbox));
                self.spawn_worker(device_id.to_string(), Arc::clone(&mailbox));
                mailbox
            }
        };

        if let Some(evicted) = mailbox.queue().push(task) {
            self.metrics.decision_tasks_evicted_total.inc();
            if let DeviceTask::Level(reading) = evicted {
                tracing::warn!(
                    device_id,
                    level = reading.value,
                    "Decision queue full, dropped oldest pending reading"
                );
            }
        }
        mailbox.notify.notify_one();

        Ok(())
    }

    /// Stop accepting tasks. Workers finish what is already queued, then exit.
    pub fn close(&self) {
        let mailboxes = self.mailboxes();
        self.closed.cancel();
        for mailbox in mailboxes.values() {
            mailbox.notify.notify_one();
        }
    }

    /// Number of devices that have a worker.
    pub fn device_count(&self) -> usize {
        self.mailboxes().len()
    }

    /// Pending tasks for one device (0 for unknown devices).
    pub fn pending(&self, device_id: &str) -> usize {
        self.mailboxes()
            .get(device_id)
            .map(|m| m.queue().len())
            .unwrap_or(0)
    }

    fn mailboxes(&self) -> MutexGuard<'_, HashMap<String, Arc<Mailbox>>> {
        lock_map(&self.mailboxes)
    }

    fn spawn_worker(&self, device_id: String, mailbox: Arc<Mailbox>) {
        let worker = Worker {
            device_id,
            mailbox,
            mailboxes: Arc::clone(&self.mailboxes),
            controller: Arc::clone(&self.controller),
            closed: self.closed.clone(),
            idle_timeout: self.idle_timeout,
        };
        let metrics = Arc::clone(&self.metrics);

        metrics.active_devices.inc();
        tracing::debug!(device_id = %worker.device_id, "Starting decision worker");

        self.tracker.spawn(async move {
            worker.run().await;
            metrics.active_devices.dec();
            tracing::debug!(device_id = %worker.device_id, "Decision worker stopped");
        });
    }
}

fn lock_map(
    map: &Mutex<HashMap<String, Arc<Mailbox>>>,
) -> MutexGuard<'_, HashMap<String, Arc<Mailbox>>> {
    match map.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Worker {
    device_id: String,
    mailbox: Arc<Mailbox>,
    mailboxes: MailboxMap,
    controller: Arc<PumpController>,
    closed: CancellationToken,
    idle_timeout: Duration,
}

impl Worker {
    async fn run(&self) {
        loop {
            // Read the flag before popping: anything queued before close() is
            // then guaranteed to be seen.
            let draining = self.closed.is_cancelled();
            let next = self.mailbox.queue().pop();

            match next {
                Some(task) => self.controller.handle(&self.device_id, task).await,
                None if draining => break,
                None => {
                    tokio::select! {
                        _ = self.mailbox.notify.notified() => {}
                        _ = self.closed.cancelled() => {}
                        _ = tokio::time::sleep(self.idle_timeout) => {
                            if self.retire() {
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Remove this worker's mailbox if it is still registered and empty.
    /// `submit` pushes while holding the map lock, so once the entry is gone
    /// no task can reach this mailbox.
    fn retire(&self) -> bool {
        let mut mailboxes = lock_map(&self.mailboxes);
        if !self.mailbox.queue().is_empty() {
            return false;
        }
        match mailboxes.get(&self.device_id) {
            Some(current) if Arc::ptr_eq(current, &self.mailbox) => {
                mailboxes.remove(&self.device_id);
                tracing::debug!(device_id = %self.device_id, "Decision worker idle, releasing");
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio::sync::oneshot;
    use tokio::time::Instant;

    use crate::alerts::{AlertPublisher, LogNotifier, NotificationDebouncer};
    use crate::db::create_pool;
    use crate::pipeline::types::{
        PumpCommand, PumpMode, PumpStatus, Reading, ReadingKind, ThresholdConfig,
    };
    use crate::repository::TelemetryRepository;
    use crate::transport::RecordingPublisher;

    struct Harness {
        workers: DeviceWorkers,
        repository: Arc<TelemetryRepository>,
        tracker: TaskTracker,
        metrics: Arc<AppMetrics>,
    }

    async fn harness(capacity: usize) -> Harness {
        harness_with_idle(capacity, DEFAULT_IDLE_TIMEOUT).await
    }

    async fn harness_with_idle(capacity: usize, idle_timeout: Duration) -> Harness {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        let repository = Arc::new(TelemetryRepository::new(pool));
        let metrics = Arc::new(AppMetrics::new().unwrap());
        let tracker = TaskTracker::new();
        let alerts = Arc::new(AlertPublisher::new(
            Arc::clone(&repository),
            Arc::new(LogNotifier),
            NotificationDebouncer::default(),
            tracker.clone(),
            Arc::clone(&metrics),
        ));
        let controller = Arc::new(PumpController::new(
            Arc::clone(&repository),
            Arc::new(RecordingPublisher::new()),
            alerts,
            Arc::clone(&metrics),
        ));
        Harness {
            workers: DeviceWorkers::new(
                controller,
                capacity,
                idle_timeout,
                tracker.clone(),
                Arc::clone(&metrics),
            ),
            repository,
            tracker,
            metrics,
        }
    }

    fn level(device_id: &str, value: f64) -> DeviceTask {
        DeviceTask::Level(Reading {
            device_id: device_id.to_string(),
            kind: ReadingKind::WaterLevel,
            value,
            status: None,
            recorded_at: Utc::now(),
        })
    }

    async fn configure(repository: &TelemetryRepository, device_id: &str) {
        repository
            .upsert_threshold(&ThresholdConfig {
                device_id: device_id.to_string(),
                upper_bound: 95.0,
                lower_bound: 30.0,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn command_reply_returns_new_state() {
        let h = harness(8).await;
        let (tx, rx) = oneshot::channel();
        h.workers
            .submit(
                "1",
                DeviceTask::Command {
                    command: PumpCommand {
                        mode: PumpMode::Manual,
                        status: Some(PumpStatus::On),
                    },
                    reply: Some(tx),
                },
            )
            .unwrap();

        let state = rx.await.unwrap().unwrap();
        assert_eq!(state.status, PumpStatus::On);
        assert_eq!(state.mode, PumpMode::Manual);
    }

    #[tokio::test]
    async fn tasks_for_one_device_run_in_order() {
        let h = harness(64).await;
        configure(&h.repository, "1").await;

        for value in [25.0, 60.0, 96.0, 20.0] {
            h.workers.submit("1", level("1", value)).unwrap();
        }

        h.workers.close();
        h.tracker.close();
        h.tracker.wait().await;

        let history = h.repository.pump_history("1", 10).await.unwrap();
        let statuses: Vec<PumpStatus> = history.iter().rev().map(|e| e.status).collect();
        assert_eq!(statuses, vec![PumpStatus::On, PumpStatus::Off, PumpStatus::On]);
    }

    #[tokio::test]
    async fn devices_get_independent_workers() {
        let h = harness(8).await;
        configure(&h.repository, "1").await;
        configure(&h.repository, "2").await;

        h.workers.submit("1", level("1", 10.0)).unwrap();
        h.workers.submit("2", level("2", 99.0)).unwrap();
        assert_eq!(h.workers.device_count(), 2);

        h.workers.close();
        h.tracker.close();
        h.tracker.wait().await;

        assert_eq!(h.repository.pump_history("1", 10).await.unwrap().len(), 1);
        // Device 2 starts off and the level is high: no transition.
        assert!(h.repository.pump_history("2", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn submit_after_close_is_rejected() {
        let h = harness(8).await;
        h.workers.close();
        let err = h.workers.submit("1", level("1", 10.0)).unwrap_err();
        assert!(matches!(err, PipelineError::ShuttingDown));
    }

    #[tokio::test]
    async fn close_drains_pending_work() {
        let h = harness(128).await;
        configure(&h.repository, "1").await;

        for i in 0..50 {
            let value = if i % 2 == 0 { 10.0 } else { 99.0 };
            h.workers.submit("1", level("1", value)).unwrap();
        }
        h.workers.close();
        h.tracker.close();
        h.tracker.wait().await;

        assert_eq!(h.repository.pump_history("1", 100).await.unwrap().len(), 50);
        assert_eq!(h.workers.pending("1"), 0);
    }

    async fn wait_for_devices(workers: &DeviceWorkers, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while workers.device_count() != expected {
            assert!(Instant::now() < deadline, "still {} devices", workers.device_count());
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn idle_workers_are_released_and_restarted_on_demand() {
        let h = harness_with_idle(8, Duration::from_millis(50)).await;
        configure(&h.repository, "1").await;

        h.workers.submit("1", level("1", 10.0)).unwrap();
        assert_eq!(h.workers.device_count(), 1);

        wait_for_devices(&h.workers, 0).await;
        assert_eq!(h.workers.pending("1"), 0);

        h.workers.submit("1", level("1", 99.0)).unwrap();
        assert_eq!(h.workers.device_count(), 1);

        h.workers.close();
        h.tracker.close();
        h.tracker.wait().await;

        let history = h.repository.pump_history("1", 10).await.unwrap();
        let statuses: Vec<PumpStatus> = history.iter().rev().map(|e| e.status).collect();
        assert_eq!(statuses, vec![PumpStatus::On, PumpStatus::Off]);
        assert!(h.metrics.active_devices.get().abs() < f64::EPSILON);
    }
}
