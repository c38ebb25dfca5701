use crate::error::ErrorKind;
use crate::models::SyncReport;
use crate::sync::SyncEngine;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("sync worker unavailable")]
    WorkerUnavailable,
}

/// Background sync queue with bounded retries. Passes that fail retryably
/// (or complete with retryable per-platform errors) are re-queued with
/// exponential backoff until `max_attempts` is spent.
#[derive(Clone)]
pub struct SyncJobQueue {
    tx: mpsc::Sender<Job>,
    statuses: Arc<Mutex<StatusTable>>,
}

#[derive(Clone)]
struct Job {
    id: Uuid,
    listing_id: Uuid,
    attempts: u32,
}

/// Job states with a bounded finished-job history: once more than
/// `history_limit` terminal entries accumulate, the oldest are dropped so
/// the table does not grow with process age.
struct StatusTable {
    jobs: HashMap<Uuid, (Uuid, JobState)>,
    finished: VecDeque<Uuid>,
    history_limit: usize,
}

impl StatusTable {
    fn new(history_limit: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            finished: VecDeque::new(),
            history_limit: history_limit.max(1),
        }
    }

    fn set_live(&mut self, id: Uuid, listing_id: Uuid, state: JobState) {
        self.jobs.insert(id, (listing_id, state));
    }

    fn set_terminal(&mut self, id: Uuid, listing_id: Uuid, state: JobState) {
        self.jobs.insert(id, (listing_id, state));
        self.finished.push_back(id);
        while self.finished.len() > self.history_limit {
            if let Some(evicted) = self.finished.pop_front() {
                self.jobs.remove(&evicted);
            }
        }
    }
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued {
        attempts: u32,
    },
    Running {
        attempts: u32,
    },
    Backoff {
        attempts: u32,
        max_attempts: u32,
        scheduled_for: DateTime<Utc>,
        error: String,
    },
    Completed {
        attempts: u32,
        report: SyncReport,
    },
    Failed {
        attempts: u32,
        kind: ErrorKind,
        error: String,
    },
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub listing_id: String,
    #[serde(flatten)]
    pub state: JobState,
}

#[derive(Clone, Copy)]
pub struct QueueConfig {
    pub capacity: usize,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub history_limit: usize,
}

impl QueueConfig {
    pub fn from_env() -> Self {
        Self {
            capacity: queue_capacity_from_env(),
            max_attempts: max_attempts_from_env(),
            base_backoff: Duration::from_millis(base_backoff_ms_from_env()),
            history_limit: history_limit_from_env(),
        }
    }
}

impl SyncJobQueue {
    pub fn spawn(engine: Arc<SyncEngine>) -> (Self, JoinHandle<()>) {
        Self::spawn_with(engine, QueueConfig::from_env())
    }

    pub fn spawn_with(engine: Arc<SyncEngine>, config: QueueConfig) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(config.capacity);
        let statuses = Arc::new(Mutex::new(StatusTable::new(config.history_limit)));
        let statuses_bg = statuses.clone();
        let requeue_tx = tx.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let attempt = job.attempts + 1;
                {
                    let mut guard = statuses_bg.lock().await;
                    guard.set_live(
                        job.id,
                        job.listing_id,
                        JobState::Running { attempts: attempt },
                    );
                }

                let verdict = match engine.sync_listing(job.listing_id).await {
                    Ok(report) => {
                        if report_wants_retry(&report) && attempt < config.max_attempts {
                            Verdict::Retry("one or more platforms failed retryably".into())
                        } else {
                            Verdict::Done(report)
                        }
                    }
                    Err(err) if err.is_retryable() && attempt < config.max_attempts => {
                        Verdict::Retry(err.to_string())
                    }
                    Err(err) => Verdict::Fatal(err.kind(), err.to_string()),
                };

                match verdict {
                    Verdict::Done(report) => {
                        let mut guard = statuses_bg.lock().await;
                        guard.set_terminal(
                            job.id,
                            job.listing_id,
                            JobState::Completed {
                                attempts: attempt,
                                report,
                            },
                        );
                    }
                    Verdict::Fatal(kind, error) => {
                        warn!(
                            target = "syndic.jobs",
                            job_id = %job.id,
                            listing_id = %job.listing_id,
                            attempts = attempt,
                            error = %error,
                            "sync job failed terminally"
                        );
                        let mut guard = statuses_bg.lock().await;
                        guard.set_terminal(
                            job.id,
                            job.listing_id,
                            JobState::Failed {
                                attempts: attempt,
                                kind,
                                error,
                            },
                        );
                    }
                    Verdict::Retry(error) => {
                        let delay = backoff_delay(config.base_backoff, attempt);
                        let scheduled_for =
                            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                        info!(
                            target = "syndic.jobs",
                            job_id = %job.id,
                            listing_id = %job.listing_id,
                            attempts = attempt,
                            max_attempts = config.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            "sync job backing off"
                        );
                        {
                            let mut guard = statuses_bg.lock().await;
                            guard.set_live(
                                job.id,
                                job.listing_id,
                                JobState::Backoff {
                                    attempts: attempt,
                                    max_attempts: config.max_attempts,
                                    scheduled_for,
                                    error,
                                },
                            );
                        }
                        let tx = requeue_tx.clone();
                        let statuses = statuses_bg.clone();
                        let retry = Job {
                            attempts: attempt,
                            ..job
                        };
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            if tx.send(retry.clone()).await.is_err() {
                                let mut guard = statuses.lock().await;
                                guard.set_terminal(
                                    retry.id,
                                    retry.listing_id,
                                    JobState::Failed {
                                        attempts: retry.attempts,
                                        kind: ErrorKind::PlatformRequestFailed,
                                        error: "sync worker shut down during backoff".into(),
                                    },
                                );
                            }
                        });
                    }
                }
            }
        });

        (Self { tx, statuses }, handle)
    }

    pub async fn enqueue(&self, listing_id: Uuid) -> Result<Uuid, QueueError> {
        let id = Uuid::new_v4();
        {
            let mut guard = self.statuses.lock().await;
            guard.set_live(id, listing_id, JobState::Queued { attempts: 0 });
        }
        let job = Job {
            id,
            listing_id,
            attempts: 0,
        };
        self.tx
            .send(job)
            .await
            .map_err(|_| QueueError::WorkerUnavailable)?;
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let guard = self.statuses.lock().await;
        guard
            .jobs
            .get(&id)
            .cloned()
            .map(|(listing_id, state)| JobInfo {
                id: id.to_string(),
                listing_id: listing_id.to_string(),
                state,
            })
    }
}

enum Verdict {
    Done(SyncReport),
    Retry(String),
    Fatal(ErrorKind, String),
}

/// A pass that recorded a retryable failure on any platform is worth
/// re-running; the next pass re-enters those rows through `pending`.
fn report_wants_retry(report: &SyncReport) -> bool {
    report
        .outcomes
        .iter()
        .any(|outcome| outcome.error_kind == Some(ErrorKind::PlatformRequestFailed))
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let capped = exp.min(Duration::from_secs(60));
    let jitter_ceiling = (capped.as_millis() as u64 / 2).max(1);
    let jitter = rand::rng().random_range(0..jitter_ceiling);
    capped + Duration::from_millis(jitter)
}

fn queue_capacity_from_env() -> usize {
    std::env::var("QUEUE_CAPACITY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64)
}

fn max_attempts_from_env() -> u32 {
    std::env::var("SYNC_MAX_ATTEMPTS")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(3)
}

fn base_backoff_ms_from_env() -> u64 {
    std::env::var("SYNC_BACKOFF_BASE_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(500)
}

fn history_limit_from_env() -> usize {
    std::env::var("JOB_HISTORY_LIMIT")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(1024)
}
