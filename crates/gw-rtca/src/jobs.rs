//! Background contingency-scan jobs.
//!
//! A [`JobRegistry`] owns every scan in flight: each job gets a uuid,
//! a broadcast channel for progress events, a cooperative cancel flag
//! the scan loop polls between cases, and records the grid it runs
//! against along with its start and completion times. The blocking scan itself
//! runs on the tokio blocking pool so the async runtime stays
//! responsive. Finished jobs stay queryable until the terminal-job
//! retention cap evicts the oldest.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use gw_core::{Network, PowerFlow};

use crate::scan::{run_scan, ScanConfig, ScanCounts, ScanProgress, ScanResult};
use crate::RtcaError;

/// How many finished jobs stay queryable.
const DEFAULT_RETENTION: usize = 64;

/// Unique identifier for a scan job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle events published on a job's broadcast channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Progress {
        completed: usize,
        total: usize,
        current_outage: String,
        elapsed_s: f64,
        eta_s: f64,
    },
    Done {
        counts: ScanCounts,
        elapsed_ms: f64,
    },
    Failed {
        error: String,
    },
    Cancelled,
}

/// Current state of a job.
#[derive(Debug, Clone)]
pub enum JobStatus {
    /// Accepted but the scan task has not started yet
    Queued,
    Running { completed: usize, total: usize },
    Done(Arc<ScanResult>),
    Failed(String),
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running { .. })
    }
}

/// Point-in-time view of one job.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub id: JobId,
    /// Grid the scan was started against
    pub grid_id: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    /// Set once the job reaches a terminal state
    pub completed_at: Option<DateTime<Utc>>,
}

struct JobEntry {
    grid_id: String,
    started_at: DateTime<Utc>,
    completed_at: RwLock<Option<DateTime<Utc>>>,
    status: RwLock<JobStatus>,
    cancel: AtomicBool,
    events_tx: broadcast::Sender<JobEvent>,
}

/// Registry of running and recently finished scan jobs.
pub struct JobRegistry {
    jobs: DashMap<JobId, Arc<JobEntry>>,
    /// Terminal jobs in finish order, oldest first
    finished: Mutex<VecDeque<JobId>>,
    retention: usize,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            jobs: DashMap::new(),
            finished: Mutex::new(VecDeque::new()),
            retention,
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Start a scan job; returns immediately with its id.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_scan<P>(
        self: &Arc<Self>,
        grid_id: impl Into<String>,
        network: Network,
        solver: Arc<P>,
        config: ScanConfig,
    ) -> JobId
    where
        P: PowerFlow + ?Sized + 'static,
    {
        let id = JobId::new();
        let grid_id = grid_id.into();
        let (events_tx, _) = broadcast::channel(256);
        let entry = Arc::new(JobEntry {
            grid_id: grid_id.clone(),
            started_at: Utc::now(),
            completed_at: RwLock::new(None),
            status: RwLock::new(JobStatus::Queued),
            cancel: AtomicBool::new(false),
            events_tx,
        });
        self.jobs.insert(id, entry.clone());
        tracing::info!(%id, grid_id, "scan job spawned");

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            *entry.status.write() = JobStatus::Running {
                completed: 0,
                total: 0,
            };
            let scan_entry = entry.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                run_scan(&network, solver.as_ref(), &config, &scan_entry.cancel, |p| {
                    *scan_entry.status.write() = JobStatus::Running {
                        completed: p.completed,
                        total: p.total,
                    };
                    let _ = scan_entry.events_tx.send(progress_event(&p));
                })
            })
            .await;

            let (status, event) = match outcome {
                Ok(Ok(result)) => {
                    let event = JobEvent::Done {
                        counts: result.counts,
                        elapsed_ms: result.elapsed_ms,
                    };
                    (JobStatus::Done(Arc::new(result)), event)
                }
                Ok(Err(RtcaError::Cancelled)) => (JobStatus::Cancelled, JobEvent::Cancelled),
                Ok(Err(e)) => {
                    let msg = e.to_string();
                    (JobStatus::Failed(msg.clone()), JobEvent::Failed { error: msg })
                }
                Err(join_err) => {
                    let msg = format!("scan task panicked: {join_err}");
                    tracing::error!(%id, error = %msg, "scan job aborted");
                    (JobStatus::Failed(msg.clone()), JobEvent::Failed { error: msg })
                }
            };

            *entry.completed_at.write() = Some(Utc::now());
            *entry.status.write() = status;
            let _ = entry.events_tx.send(event);
            registry.retire(id);
        });

        id
    }

    /// Subscribe to a job's event stream.
    pub fn subscribe(&self, id: JobId) -> Result<broadcast::Receiver<JobEvent>, RtcaError> {
        let entry = self.jobs.get(&id).ok_or(RtcaError::JobNotFound(id))?;
        Ok(entry.events_tx.subscribe())
    }

    pub fn status(&self, id: JobId) -> Result<JobStatus, RtcaError> {
        let entry = self.jobs.get(&id).ok_or(RtcaError::JobNotFound(id))?;
        let status = entry.status.read().clone();
        Ok(status)
    }

    /// Full job view: grid, status and lifecycle timestamps.
    pub fn get(&self, id: JobId) -> Result<JobSnapshot, RtcaError> {
        let entry = self.jobs.get(&id).ok_or(RtcaError::JobNotFound(id))?;
        let snapshot = JobSnapshot {
            id,
            grid_id: entry.grid_id.clone(),
            status: entry.status.read().clone(),
            started_at: entry.started_at,
            completed_at: *entry.completed_at.read(),
        };
        Ok(snapshot)
    }

    /// The scan result, once the job is done.
    pub fn result(&self, id: JobId) -> Result<Option<Arc<ScanResult>>, RtcaError> {
        match self.status(id)? {
            JobStatus::Done(result) => Ok(Some(result)),
            _ => Ok(None),
        }
    }

    /// Request cancellation. Already-finished jobs are left untouched.
    pub fn cancel(&self, id: JobId) -> Result<(), RtcaError> {
        let entry = self.jobs.get(&id).ok_or(RtcaError::JobNotFound(id))?;
        entry.cancel.store(true, Ordering::Relaxed);
        tracing::info!(%id, "cancellation requested");
        Ok(())
    }

    /// Ids of jobs still running.
    pub fn running(&self) -> Vec<JobId> {
        self.jobs
            .iter()
            .filter(|r| !r.value().status.read().is_terminal())
            .map(|r| *r.key())
            .collect()
    }

    /// How many jobs are queued and how many are running.
    pub fn counts(&self) -> (usize, usize) {
        let mut queued = 0;
        let mut running = 0;
        for entry in self.jobs.iter() {
            match *entry.value().status.read() {
                JobStatus::Queued => queued += 1,
                JobStatus::Running { .. } => running += 1,
                _ => {}
            }
        }
        (queued, running)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Record a terminal job and evict the oldest beyond the cap.
    fn retire(&self, id: JobId) {
        let mut finished = self.finished.lock();
        finished.push_back(id);
        while finished.len() > self.retention {
            if let Some(evicted) = finished.pop_front() {
                self.jobs.remove(&evicted);
                tracing::debug!(%evicted, "finished job evicted");
            }
        }
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn progress_event(p: &ScanProgress) -> JobEvent {
    JobEvent::Progress {
        completed: p.completed,
        total: p.total,
        current_outage: p.current_outage.clone(),
        elapsed_s: p.elapsed_s,
        eta_s: p.eta_s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw_core::{
        Branch, BranchId, BranchResult, Bus, BusId, Edge, Kilovolts, Node, PowerFlowSolution,
    };
    use std::time::Duration;

    struct SlowSolver {
        delay: Duration,
    }

    impl PowerFlow for SlowSolver {
        fn solve(&self, network: &Network) -> anyhow::Result<PowerFlowSolution> {
            std::thread::sleep(self.delay);
            Ok(PowerFlowSolution {
                converged: true,
                bus_results: vec![],
                branch_results: network
                    .branches_in_service()
                    .iter()
                    .map(|b| BranchResult {
                        id: b.id,
                        loading_percent: 120.0,
                        p_from_mw: 10.0,
                        q_from_mvar: 0.0,
                        p_to_mw: -10.0,
                    })
                    .collect(),
            })
        }
    }

    fn star_network(n: usize) -> Network {
        let mut network = Network::new();
        let hub = network.graph.add_node(Node::Bus(Bus {
            id: BusId::new(0),
            name: "Hub".to_string(),
            base_kv: Kilovolts(230.0),
            is_slack: true,
            ..Bus::default()
        }));
        for i in 0..n {
            let spoke = network.graph.add_node(Node::Bus(Bus {
                id: BusId::new(i + 1),
                name: format!("B{}", i + 1),
                base_kv: Kilovolts(230.0),
                ..Bus::default()
            }));
            network.graph.add_edge(
                hub,
                spoke,
                Edge::Branch(Branch::new(
                    BranchId::new(i),
                    format!("L{i}"),
                    BusId::new(0),
                    BusId::new(i + 1),
                    0.01,
                    0.1,
                )),
            );
        }
        network
    }

    async fn wait_terminal(registry: &Arc<JobRegistry>, id: JobId) -> JobStatus {
        for _ in 0..200 {
            if let Ok(status) = registry.status(id) {
                if status.is_terminal() {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never reached a terminal state");
    }

    #[tokio::test]
    async fn job_runs_to_completion_with_monotonic_progress() {
        let registry = JobRegistry::shared();
        let solver = Arc::new(SlowSolver {
            delay: Duration::from_millis(1),
        });
        let id = registry.spawn_scan("star", star_network(5), solver, ScanConfig::n1());
        let mut events = registry.subscribe(id).unwrap();

        let mut last_completed = 0;
        loop {
            match events.recv().await.unwrap() {
                JobEvent::Progress {
                    completed, total, ..
                } => {
                    assert!(completed > last_completed);
                    assert_eq!(total, 5);
                    last_completed = completed;
                }
                JobEvent::Done { counts, .. } => {
                    assert_eq!(counts.total, 5);
                    assert_eq!(counts.insecure, 5);
                    break;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(last_completed, 5);

        let status = wait_terminal(&registry, id).await;
        assert!(matches!(status, JobStatus::Done(_)));
        let result = registry.result(id).unwrap().unwrap();
        assert_eq!(result.ranked.len(), 5);

        let snapshot = registry.get(id).unwrap();
        assert_eq!(snapshot.id, id);
        assert_eq!(snapshot.grid_id, "star");
        assert!(matches!(snapshot.status, JobStatus::Done(_)));
        let completed_at = snapshot.completed_at.expect("terminal job has a completion time");
        assert!(completed_at >= snapshot.started_at);
    }

    #[tokio::test]
    async fn cancellation_stops_a_running_job() {
        let registry = JobRegistry::shared();
        let solver = Arc::new(SlowSolver {
            delay: Duration::from_millis(25),
        });
        let id = registry.spawn_scan("star", star_network(40), solver, ScanConfig::n1());
        let mut events = registry.subscribe(id).unwrap();

        // Let at least one case finish, then pull the plug.
        loop {
            if let JobEvent::Progress { .. } = events.recv().await.unwrap() {
                break;
            }
        }
        registry.cancel(id).unwrap();

        let status = wait_terminal(&registry, id).await;
        assert!(matches!(status, JobStatus::Cancelled));
        assert!(registry.result(id).unwrap().is_none());
        // Cancelled jobs get a completion time too.
        assert!(registry.get(id).unwrap().completed_at.is_some());
    }

    #[tokio::test]
    async fn unknown_jobs_are_reported() {
        let registry = JobRegistry::shared();
        let id = JobId::new();
        assert!(matches!(
            registry.status(id),
            Err(RtcaError::JobNotFound(_))
        ));
        assert!(registry.cancel(id).is_err());
        assert!(registry.subscribe(id).is_err());
        assert!(registry.get(id).is_err());
        assert_eq!(registry.counts(), (0, 0));
    }

    #[tokio::test]
    async fn retention_evicts_oldest_finished_jobs() {
        let registry = Arc::new(JobRegistry::with_retention(2));
        let solver = Arc::new(SlowSolver {
            delay: Duration::from_millis(1),
        });

        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = registry.spawn_scan("star", star_network(2), solver.clone(), ScanConfig::n1());
            wait_terminal(&registry, id).await;
            ids.push(id);
        }

        assert!(matches!(
            registry.status(ids[0]),
            Err(RtcaError::JobNotFound(_))
        ));
        assert!(registry.status(ids[1]).is_ok());
        assert!(registry.status(ids[2]).is_ok());
        assert_eq!(registry.len(), 2);
    }
}
