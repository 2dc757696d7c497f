//! Worker pool running sync tasks that may spawn further tasks.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::decoder::FeedDecoder;
use crate::error::OprError;
use crate::ledger::Ledger;
use crate::overpass::{OverpassClient, OverpassQuery};
use crate::planner::{Probe, QueryPlanner, Region};
use crate::reconcile::{ReconcileSettings, ReconcileStats, Reconciler, SeenIds};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskReport {
    pub region: String,
    pub stats: ReconcileStats,
    pub elapsed_ms: u64,
}

enum Message<T> {
    Run { task: T, attempt: u32 },
    Stop,
}

struct Shared<T> {
    sender: Sender<Message<T>>,
    pending: Mutex<usize>,
    idle: Condvar,
    submitted: AtomicUsize,
    completed: AtomicUsize,
    failure: Mutex<Option<OprError>>,
    aborted: AtomicBool,
}

impl<T> Shared<T> {
    fn submit(&self, task: T, attempt: u32) {
        *self.pending.lock() += 1;
        self.submitted.fetch_add(1, Ordering::SeqCst);
        // The receiver lives as long as the scope that owns `self`.
        let _ = self.sender.send(Message::Run { task, attempt });
    }

    fn finish(&self) {
        let mut pending = self.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            self.idle.notify_all();
        }
    }

    fn fail(&self, err: OprError) {
        self.aborted.store(true, Ordering::SeqCst);
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(err);
        }
    }
}

/// Handle given to a running task for queueing follow-up tasks.
pub struct Spawner<'a, T> {
    shared: &'a Shared<T>,
    cancel: &'a AtomicBool,
}

impl<T> Spawner<'_, T> {
    pub fn spawn(&self, task: T) {
        self.shared.submit(task, 0);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst) || self.shared.aborted.load(Ordering::SeqCst)
    }
}

pub struct Orchestrator {
    workers: usize,
    retry: RetryPolicy,
}

impl Orchestrator {
    pub fn new(workers: usize, retry: RetryPolicy) -> Self {
        Self {
            workers: workers.max(1),
            retry,
        }
    }

    /// Runs `initial` and everything they spawn, returning once the whole
    /// closure has finished. The first failure aborts the phase.
    pub fn submit_and_wait<T, F>(
        &self,
        initial: Vec<T>,
        cancel: &AtomicBool,
        run: F,
    ) -> Result<Vec<TaskReport>, OprError>
    where
        T: Clone + Send,
        F: Fn(T, &Spawner<'_, T>) -> Result<TaskReport, OprError> + Sync,
    {
        if initial.is_empty() {
            return Ok(Vec::new());
        }
        let (sender, receiver) = unbounded();
        let shared = Shared {
            sender,
            pending: Mutex::new(0),
            idle: Condvar::new(),
            submitted: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            failure: Mutex::new(None),
            aborted: AtomicBool::new(false),
        };
        let reports = Mutex::new(Vec::new());

        for task in initial {
            shared.submit(task, 0);
        }

        thread::scope(|scope| {
            for _ in 0..self.workers {
                let receiver = receiver.clone();
                let shared = &shared;
                let reports = &reports;
                let run = &run;
                scope.spawn(move || self.work(receiver, shared, reports, cancel, run));
            }

            let mut pending = shared.pending.lock();
            while *pending > 0 {
                shared.idle.wait(&mut pending);
            }
            drop(pending);
            for _ in 0..self.workers {
                let _ = shared.sender.send(Message::Stop);
            }
        });

        if let Some(err) = shared.failure.lock().take() {
            return Err(err);
        }
        if cancel.load(Ordering::SeqCst) {
            return Err(OprError::Cancelled);
        }
        Ok(reports.into_inner())
    }

    fn work<T, F>(
        &self,
        receiver: Receiver<Message<T>>,
        shared: &Shared<T>,
        reports: &Mutex<Vec<TaskReport>>,
        cancel: &AtomicBool,
        run: &F,
    ) where
        T: Clone + Send,
        F: Fn(T, &Spawner<'_, T>) -> Result<TaskReport, OprError> + Sync,
    {
        let spawner = Spawner { shared, cancel };
        while let Ok(message) = receiver.recv() {
            let Message::Run { task, attempt } = message else {
                break;
            };
            if spawner.is_cancelled() {
                shared.finish();
                continue;
            }
            // A panicking task still has to release its pending slot.
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| run(task.clone(), &spawner)))
                .unwrap_or_else(|payload| Err(OprError::TaskPanicked(panic_message(payload))));
            match outcome {
                Ok(report) => {
                    let completed = shared.completed.fetch_add(1, Ordering::SeqCst) + 1;
                    info!(
                        completed,
                        submitted = shared.submitted.load(Ordering::SeqCst),
                        region = %report.region,
                        processed = report.stats.processed,
                        elapsed_ms = report.elapsed_ms,
                        "task finished"
                    );
                    reports.lock().push(report);
                }
                Err(OprError::StaleIndex) if attempt + 1 < self.retry.attempts => {
                    warn!(attempt = attempt + 1, "stale ledger index, retrying task");
                    thread::sleep(self.retry.backoff);
                    shared.submit(task, attempt + 1);
                }
                Err(err) => {
                    error!(
                        attempt = attempt + 1,
                        completed = shared.completed.load(Ordering::SeqCst),
                        submitted = shared.submitted.load(Ordering::SeqCst),
                        error = %err,
                        "task failed"
                    );
                    shared.fail(err);
                }
            }
            shared.finish();
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Everything a sync task needs, shared by all workers of one phase.
pub struct SyncContext<'a> {
    pub ledger: &'a dyn Ledger,
    pub client: &'a dyn OverpassClient,
    pub planner: QueryPlanner,
    pub settings: &'a ReconcileSettings,
    pub seen: SeenIds,
    pub commit_fence: &'a Mutex<()>,
    pub osm_tag: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncTask {
    /// Snapshot query bound to a region; probed before it is fetched.
    Region { query: OverpassQuery, region: Region },
    /// Region-free request fetched as is.
    Whole { query: OverpassQuery },
}

impl SyncTask {
    pub fn label(&self) -> String {
        match self {
            SyncTask::Region { region, .. } => region.to_string(),
            SyncTask::Whole { query } if query.is_diff() => "diff".to_string(),
            SyncTask::Whole { .. } => "whole".to_string(),
        }
    }
}

impl SyncContext<'_> {
    pub fn run(&self, task: SyncTask, spawner: &Spawner<'_, SyncTask>) -> Result<TaskReport, OprError> {
        let started = Instant::now();
        let label = task.label();
        let stats = match task {
            SyncTask::Whole { query } => self.fetch(&query, spawner)?,
            SyncTask::Region { query, region } => match self.planner.probe(self.client, &query, &region)? {
                Probe::Empty => ReconcileStats::default(),
                Probe::Split(children) => {
                    info!(region = %region, cells = children.len(), "region too large, splitting");
                    for child in children {
                        spawner.spawn(SyncTask::Region {
                            query: query.clone(),
                            region: child,
                        });
                    }
                    ReconcileStats::default()
                }
                Probe::Fetch(_) => match self.fetch(&query.with_bbox(region.bbox), spawner) {
                    Ok(stats) => stats,
                    Err(err) if err.is_split_trigger() => {
                        warn!(region = %region, error = %err, "fetch failed, splitting region");
                        for child in self.planner.split(&region)? {
                            spawner.spawn(SyncTask::Region {
                                query: query.clone(),
                                region: child,
                            });
                        }
                        ReconcileStats::default()
                    }
                    Err(err) => return Err(err),
                },
            },
        };
        Ok(TaskReport {
            region: label,
            stats,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn fetch(
        &self,
        query: &OverpassQuery,
        spawner: &Spawner<'_, SyncTask>,
    ) -> Result<ReconcileStats, OprError> {
        let reconciler = Reconciler::new(
            self.ledger,
            self.settings,
            &self.seen,
            self.commit_fence,
            &self.osm_tag,
        );
        let limit = self.settings.places_per_operation.max(1);
        let mut decoder = FeedDecoder::new(self.client.fetch(query)?);
        let mut stats = ReconcileStats::default();
        loop {
            if spawner.is_cancelled() {
                return Err(OprError::Cancelled);
            }
            let batch = if query.is_diff() {
                let diffs = decoder.next_diffs(limit)?;
                if diffs.is_empty() {
                    break;
                }
                reconciler.reconcile_diffs(&diffs)?
            } else {
                let entities = decoder.next_entities(limit)?;
                if entities.is_empty() {
                    break;
                }
                reconciler.reconcile_entities(&entities)?
            };
            stats.absorb(&batch);
        }
        stats.skipped += decoder.malformed();
        Ok(stats)
    }
}
