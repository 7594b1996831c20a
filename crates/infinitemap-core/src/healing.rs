//! Self-healing daemon.
//!
//! One owning thread runs the scan → enqueue → drain cycle at a configured
//! interval. External callers interact only through a bounded control
//! channel: [`SelfHealingDaemon::force_scan`] short-circuits the interval
//! wait and [`SelfHealingDaemon::stop`] (idempotent) is observed during
//! the wait or at the next loop iteration.
//!
//! Repair priority is distance from the grid center: the closer a
//! corrupted cluster sits to the hot zone, the sooner it is healed.

use crate::cluster::ClusterLocation;
use crate::error::{Error, Result};
use crate::integrity::IntegrityManager;
use crate::SharedVat;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingConfig {
    /// Interval between scan cycles.
    pub scan_interval: Duration,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(300),
        }
    }
}

/// Lifecycle of a healing task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, not yet started.
    Pending,
    /// Repair in flight.
    InProgress,
    /// Repaired.
    Completed,
    /// Repair exhausted its sources.
    Failed,
}

/// One queued repair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingTask {
    /// Unique id, `heal-<8 hex chars>`.
    pub task_id: String,
    /// Stable cluster id.
    pub cluster_id: u64,
    /// Anchor coordinate.
    pub location: ClusterLocation,
    /// Distance from center; smaller heals first.
    pub priority: u32,
    /// Current state.
    pub status: TaskStatus,
    /// Creation time, unix seconds.
    pub created_at: u64,
    /// Start time, unix seconds.
    pub started_at: Option<u64>,
    /// Completion time, unix seconds.
    pub completed_at: Option<u64>,
    /// Failure reason.
    pub error: Option<String>,
    /// Bytes restored by a completed repair.
    pub bytes_healed: u64,
}

/// Strictly monotonic daemon counters plus duration averages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealingStatistics {
    /// Scan cycles completed.
    pub scans_completed: u64,
    /// Corrupted clusters seen across all scans.
    pub corruptions_detected: u64,
    /// Repairs attempted.
    pub repairs_attempted: u64,
    /// Repairs that restored data.
    pub repairs_successful: u64,
    /// Repairs that exhausted every source.
    pub unrepairable: u64,
    /// Bytes restored in total.
    pub total_healed_bytes: u64,
    /// Mean scan duration.
    pub avg_scan_duration: Duration,
    /// Mean repair duration.
    pub avg_repair_duration: Duration,
    #[serde(skip)]
    total_scan_time: Duration,
    #[serde(skip)]
    total_repair_time: Duration,
}

impl HealingStatistics {
    fn record_scan(&mut self, duration: Duration) {
        self.scans_completed += 1;
        self.total_scan_time += duration;
        self.avg_scan_duration = self.total_scan_time / u32::try_from(self.scans_completed).unwrap_or(u32::MAX);
    }

    fn record_repair(&mut self, duration: Duration) {
        self.repairs_attempted += 1;
        self.total_repair_time += duration;
        self.avg_repair_duration =
            self.total_repair_time / u32::try_from(self.repairs_attempted).unwrap_or(u32::MAX);
    }
}

#[derive(Debug, Default)]
struct DaemonState {
    tasks: Vec<HealingTask>,
    stats: HealingStatistics,
}

enum ControlEvent {
    ForceScan,
    Stop,
}

/// Background healing service.
pub struct SelfHealingDaemon {
    config: HealingConfig,
    vat: SharedVat,
    integrity: Arc<IntegrityManager>,
    state: Arc<Mutex<DaemonState>>,
    control: Option<Sender<ControlEvent>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl std::fmt::Debug for SelfHealingDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfHealingDaemon")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl SelfHealingDaemon {
    /// Creates a stopped daemon over the shared table and integrity
    /// manager.
    #[must_use]
    pub fn new(config: HealingConfig, vat: SharedVat, integrity: Arc<IntegrityManager>) -> Self {
        Self {
            config,
            vat,
            integrity,
            state: Arc::new(Mutex::new(DaemonState::default())),
            control: None,
            handle: None,
        }
    }

    /// Starts the owning thread. Starting a running daemon is a no-op.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            warn!("healing daemon already running");
            return;
        }
        let (tx, rx): (Sender<ControlEvent>, Receiver<ControlEvent>) = bounded(1);
        let interval = self.config.scan_interval;
        let vat = self.vat.clone();
        let integrity = self.integrity.clone();
        let state = self.state.clone();

        let handle = std::thread::Builder::new()
            .name("self-healing".to_string())
            .spawn(move || {
                info!(interval_secs = interval.as_secs_f64(), "healing daemon started");
                loop {
                    run_cycle(&vat, &integrity, &state);
                    match rx.recv_timeout(interval) {
                        Ok(ControlEvent::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                        Ok(ControlEvent::ForceScan) | Err(RecvTimeoutError::Timeout) => {}
                    }
                }
                info!("healing daemon stopped");
            })
            .expect("spawn healing daemon thread");
        self.control = Some(tx);
        self.handle = Some(handle);
    }

    /// Stops the daemon and joins its thread. Idempotent.
    pub fn stop(&mut self) {
        if let Some(control) = self.control.take() {
            let _ = control.send(ControlEvent::Stop);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// True while the owning thread is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Requests an immediate scan, short-circuiting the interval wait.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] when the daemon is not running.
    /// - [`Error::Busy`] when a scan request is already queued.
    pub fn force_scan(&self) -> Result<()> {
        let control = self
            .control
            .as_ref()
            .ok_or_else(|| Error::NotFound("healing daemon is not running".to_string()))?;
        control
            .try_send(ControlEvent::ForceScan)
            .map_err(|_| Error::Busy("scan request already queued".to_string()))
    }

    /// Runs one scan-and-heal cycle synchronously on the caller's thread.
    /// Used by tests and manual maintenance.
    pub fn run_cycle_now(&self) {
        run_cycle(&self.vat, &self.integrity, &self.state);
    }

    /// Current statistics.
    #[must_use]
    pub fn statistics(&self) -> HealingStatistics {
        self.state.lock().stats.clone()
    }

    /// Tasks pending repair, highest priority (closest to center) first.
    #[must_use]
    pub fn pending_tasks(&self) -> Vec<HealingTask> {
        let mut out: Vec<HealingTask> = self
            .state
            .lock()
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect();
        out.sort_by_key(|t| t.priority);
        out
    }

    /// Completed tasks.
    #[must_use]
    pub fn completed_tasks(&self) -> Vec<HealingTask> {
        self.tasks_with_status(TaskStatus::Completed)
    }

    /// Failed tasks.
    #[must_use]
    pub fn failed_tasks(&self) -> Vec<HealingTask> {
        self.tasks_with_status(TaskStatus::Failed)
    }

    fn tasks_with_status(&self, status: TaskStatus) -> Vec<HealingTask> {
        self.state
            .lock()
            .tasks
            .iter()
            .filter(|t| t.status == status)
            .cloned()
            .collect()
    }

    /// Number of tracked tasks across all states.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.state.lock().tasks.len()
    }

    /// Drops completed and failed tasks; returns how many were dropped.
    pub fn clear_finished_tasks(&self) -> usize {
        let mut state = self.state.lock();
        let before = state.tasks.len();
        state
            .tasks
            .retain(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress));
        before - state.tasks.len()
    }

    /// Serializable snapshot of every task.
    #[must_use]
    pub fn export_tasks(&self) -> Vec<HealingTask> {
        self.state.lock().tasks.clone()
    }
}

impl Drop for SelfHealingDaemon {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One scan-and-heal cycle: enumerate, detect, enqueue, drain.
fn run_cycle(vat: &SharedVat, integrity: &Arc<IntegrityManager>, state: &Arc<Mutex<DaemonState>>) {
    let scan_start = Instant::now();

    let center = { vat.read().center() };
    let report = match integrity.scan(None) {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "healing scan failed, skipping cycle");
            return;
        }
    };

    // Enqueue new tasks for corrupted clusters, skipping coordinates that
    // already have a live task.
    {
        let mut state = state.lock();
        state.stats.corruptions_detected += report.corrupted_clusters as u64;
        for detail in &report.corruption_details {
            if detail.status != crate::integrity::IntegrityStatus::Corrupted {
                continue;
            }
            let live = state.tasks.iter().any(|t| {
                t.cluster_id == detail.cluster_id
                    && matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress)
            });
            if live {
                continue;
            }
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let priority = detail.location.distance_to(center) as u32;
            state.tasks.push(HealingTask {
                task_id: format!("heal-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
                cluster_id: detail.cluster_id,
                location: detail.location,
                priority,
                status: TaskStatus::Pending,
                created_at: unix_now(),
                started_at: None,
                completed_at: None,
                error: None,
                bytes_healed: 0,
            });
        }
        state.stats.record_scan(scan_start.elapsed());
    }

    // Drain pending tasks in priority order. Tasks are re-found by id
    // after each repair because external callers may clear finished tasks
    // while a repair is in flight.
    loop {
        let next = {
            let mut state = state.lock();
            let Some(task) = state
                .tasks
                .iter_mut()
                .filter(|t| t.status == TaskStatus::Pending)
                .min_by_key(|t| t.priority)
            else {
                break;
            };
            task.status = TaskStatus::InProgress;
            task.started_at = Some(unix_now());
            (task.task_id.clone(), task.cluster_id)
        };
        let (task_id, cluster_id) = next;

        let repair_start = Instant::now();
        let outcome = integrity.repair(Some(vec![cluster_id]), None);
        let elapsed = repair_start.elapsed();

        let mut state = state.lock();
        state.stats.record_repair(elapsed);
        match outcome {
            Ok(result) if result.repaired_clusters.contains(&cluster_id) => {
                state.stats.repairs_successful += 1;
                state.stats.total_healed_bytes += result.total_bytes_repaired;
                if let Some(task) = state.tasks.iter_mut().find(|t| t.task_id == task_id) {
                    task.status = TaskStatus::Completed;
                    task.completed_at = Some(unix_now());
                    task.bytes_healed = result.total_bytes_repaired;
                }
                debug!(cluster_id, "healed");
            }
            Ok(result) => {
                state.stats.unrepairable += 1;
                let reason = result
                    .failed_clusters
                    .first()
                    .map(|(_, reason)| reason.clone());
                if let Some(task) = state.tasks.iter_mut().find(|t| t.task_id == task_id) {
                    task.status = TaskStatus::Failed;
                    task.completed_at = Some(unix_now());
                    task.error = reason;
                }
            }
            Err(e) => {
                state.stats.unrepairable += 1;
                if let Some(task) = state.tasks.iter_mut().find(|t| t.task_id == task_id) {
                    task.status = TaskStatus::Failed;
                    task.completed_at = Some(unix_now());
                    task.error = Some(e.to_string());
                }
            }
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
