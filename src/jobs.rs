use crate::{
    models::ApiError,
    orchestrator::{BatchReport, BatchRequest, Orchestrator},
};
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{info, warn};
use uuid::Uuid;

/// Background batch runner. A single worker drains the queue, so batches queued in
/// one process never overlap.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    statuses: Arc<Mutex<JobTable>>,
}

/// Job states keyed by id. Finished jobs are forgotten after `ttl`, and at most
/// `max_finished` of them are kept.
struct JobTable {
    entries: HashMap<Uuid, JobEntry>,
    ttl: Duration,
    max_finished: usize,
    next_seq: u64,
}

struct JobEntry {
    state: JobState,
    finished_at: Option<Instant>,
    seq: u64,
}

impl JobTable {
    fn new(ttl: Duration, max_finished: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            max_finished,
            next_seq: 0,
        }
    }

    fn set(&mut self, id: Uuid, state: JobState) {
        let now = Instant::now();
        let finished_at = matches!(state, JobState::Completed { .. } | JobState::Failed { .. })
            .then_some(now);
        self.next_seq += 1;
        self.entries.insert(
            id,
            JobEntry {
                state,
                finished_at,
                seq: self.next_seq,
            },
        );
        self.evict(now);
    }

    fn get(&self, id: &Uuid) -> Option<&JobState> {
        let entry = self.entries.get(id)?;
        match entry.finished_at {
            Some(at) if at.elapsed() >= self.ttl => None,
            _ => Some(&entry.state),
        }
    }

    fn remove(&mut self, id: &Uuid) {
        self.entries.remove(id);
    }

    fn evict(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, e| e.finished_at.is_none_or(|at| now.duration_since(at) < ttl));
        let mut finished: Vec<(u64, Uuid)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.finished_at.is_some())
            .map(|(id, e)| (e.seq, *id))
            .collect();
        if finished.len() > self.max_finished {
            finished.sort_unstable();
            let excess = finished.len() - self.max_finished;
            for (_, id) in finished.into_iter().take(excess) {
                self.entries.remove(&id);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct Job {
    id: Uuid,
    request: BatchRequest,
    actor: String,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed { result: BatchReport },
    Failed { error: String, code: String },
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

impl JobQueue {
    pub fn spawn(orchestrator: Orchestrator) -> (Self, JoinHandle<()>) {
        Self::spawn_with_retention(orchestrator, job_ttl_from_env(), MAX_FINISHED_JOBS)
    }

    pub fn spawn_with_retention(
        orchestrator: Orchestrator,
        ttl: Duration,
        max_finished: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(queue_capacity_from_env());
        let statuses = Arc::new(Mutex::new(JobTable::new(ttl, max_finished)));
        let statuses_bg = statuses.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                {
                    let mut guard = statuses_bg.lock().await;
                    guard.set(job.id, JobState::Running);
                }

                let result = orchestrator.run_batch(job.request, &job.actor).await;
                let state = match result {
                    Ok(report) => {
                        info!(
                            target = "dealer_sync.jobs",
                            job_id = %job.id,
                            processed = report.processed,
                            "batch job completed"
                        );
                        JobState::Completed { result: report }
                    }
                    Err(err) => {
                        warn!(
                            target = "dealer_sync.jobs",
                            job_id = %job.id,
                            error = %err,
                            "batch job failed"
                        );
                        JobState::Failed {
                            error: err.detail().to_string(),
                            code: err.code().to_string(),
                        }
                    }
                };
                statuses_bg.lock().await.set(job.id, state);
            }
        });

        (Self { tx, statuses }, handle)
    }

    pub async fn enqueue_batch(&self, request: BatchRequest, actor: &str) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        {
            let mut guard = self.statuses.lock().await;
            guard.set(id, JobState::Queued);
        }
        let job = Job {
            id,
            request,
            actor: actor.to_string(),
        };
        if self.tx.send(job).await.is_err() {
            self.statuses.lock().await.remove(&id);
            return Err(ApiError::new("queue_send_failed", "worker not available"));
        }
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let guard = self.statuses.lock().await;
        guard.get(&id).cloned().map(|state| JobInfo {
            id: id.to_string(),
            state,
        })
    }
}

const MAX_FINISHED_JOBS: usize = 1_000;

fn job_ttl_from_env() -> Duration {
    let secs = std::env::var("JOB_TTL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(3_600);
    Duration::from_secs(secs)
}

fn queue_capacity_from_env() -> usize {
    std::env::var("QUEUE_CAPACITY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64)
}
