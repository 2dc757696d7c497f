use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use camino::Utf8Path;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::config::ResolvedConfig;
use crate::domain::BBox;
use crate::error::OprError;
use crate::ledger::{BOT_TYPE, Ledger, MemoryLedger, Operation};
use crate::merge::{self, Feature, MergeEngine, MergeReport};
use crate::orchestrator::{Orchestrator, SyncContext, SyncTask, TaskReport};
use crate::overpass::OverpassClient;
use crate::planner::{QueryPlanner, Region};
use crate::reconcile::{ReconcileStats, SeenIds};
use crate::store::Store;
use crate::sync_state::{
    GroupPlan, SyncRequest, SyncState, SyncStateStore, SyncStatus, format_timestamp, plan_group,
    tracked_state, tracked_state_edit,
};

#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub latest: String,
    pub groups: Vec<GroupResult>,
    pub stats: ReconcileStats,
    pub tasks: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupResult {
    pub group: String,
    pub status: SyncStatus,
    pub from: String,
    pub target: String,
    pub requests: usize,
    pub stats: ReconcileStats,
    pub tasks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResult {
    pub latest: String,
    pub groups: Vec<GroupStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupStatus {
    pub group: String,
    pub status: SyncStatus,
    pub tracked_date: Option<String>,
    pub durable_date: Option<String>,
    pub target: String,
    pub requests: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportResult {
    pub since: String,
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeResult {
    pub features: usize,
    pub report: MergeReport,
    pub report_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct App<C: OverpassClient, S: SyncStateStore> {
    store: Store,
    config: ResolvedConfig,
    client: C,
    durable: S,
    ledger: MemoryLedger,
}

/// Loads the persisted ledger, or starts an empty one.
pub fn open_ledger(store: &Store, signer: &str) -> Result<MemoryLedger, OprError> {
    match Store::read_bytes(&store.ledger_snapshot_path())? {
        Some(snapshot) => MemoryLedger::from_snapshot(signer, &snapshot),
        None => Ok(MemoryLedger::new(signer)),
    }
}

impl<C: OverpassClient, S: SyncStateStore> App<C, S> {
    pub fn new(
        store: Store,
        config: ResolvedConfig,
        client: C,
        durable: S,
        ledger: MemoryLedger,
    ) -> Self {
        Self {
            store,
            config,
            client,
            durable,
            ledger,
        }
    }

    pub fn ledger(&self) -> &MemoryLedger {
        &self.ledger
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// One sync cycle over every configured group. Sync state, tracked and
    /// durable, is only written once all groups finished.
    pub fn sync(&self, cancel: &AtomicBool, sink: &dyn ProgressSink) -> Result<SyncResult, OprError> {
        let started = Instant::now();
        let _lock = self.store.acquire_lock()?;
        self.ledger.ensure_bot(&self.config.bot);

        let latest = self.client.latest_timestamp()?;
        sink.event(ProgressEvent {
            message: format!("phase=Resolve; upstream data as of {latest}"),
            elapsed: None,
        });
        let plans = self.plan(&latest)?;

        let orchestrator = Orchestrator::new(self.config.workers, self.config.retry);
        let fence = Mutex::new(());
        let mut groups = Vec::new();
        let mut total = ReconcileStats::default();
        let mut tasks = 0;
        for (plan, tracked, _) in &plans {
            let mut stats = ReconcileStats::default();
            let mut group_tasks = 0;
            if plan.is_noop() {
                sink.event(ProgressEvent {
                    message: format!("phase=Sync; group {} is up to date", plan.group),
                    elapsed: None,
                });
            }
            for (index, request) in plan.requests.iter().enumerate() {
                sink.event(ProgressEvent {
                    message: format!(
                        "phase=Sync; group {} {:?} request {}/{}",
                        plan.group,
                        plan.status,
                        index + 1,
                        plan.requests.len()
                    ),
                    elapsed: Some(started.elapsed()),
                });
                let reports = self.run_phase(&orchestrator, &fence, request, cancel)?;
                group_tasks += reports.len();
                for report in &reports {
                    stats.absorb(&report.stats);
                }
            }
            if cancel.load(Ordering::SeqCst) {
                return Err(OprError::Cancelled);
            }
            info!(
                group = %plan.group,
                status = ?plan.status,
                target = %plan.target,
                processed = stats.processed,
                created = stats.created,
                edited = stats.edited,
                tombstoned = stats.tombstoned,
                "group synchronized"
            );
            total.absorb(&stats);
            tasks += group_tasks;
            groups.push(GroupResult {
                group: plan.group.clone(),
                status: plan.status,
                from: tracked.date.clone(),
                target: plan.target.clone(),
                requests: plan.requests.len(),
                stats,
                tasks: group_tasks,
            });
        }

        if cancel.load(Ordering::SeqCst) {
            return Err(OprError::Cancelled);
        }
        self.commit_states(&plans)?;
        sink.event(ProgressEvent {
            message: "phase=Store; sync state committed".to_string(),
            elapsed: Some(started.elapsed()),
        });

        Ok(SyncResult {
            latest,
            groups,
            stats: total,
            tasks,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Statuses and requests the next cycle would run, without running them.
    pub fn status(&self, sink: &dyn ProgressSink) -> Result<StatusResult, OprError> {
        self.ledger.ensure_bot(&self.config.bot);
        let latest = self.client.latest_timestamp()?;
        sink.event(ProgressEvent {
            message: format!("phase=Resolve; upstream data as of {latest}"),
            elapsed: None,
        });
        let groups = self
            .plan(&latest)?
            .into_iter()
            .map(|(plan, tracked, durable)| GroupStatus {
                group: plan.group,
                status: plan.status,
                tracked_date: (!tracked.is_empty()).then_some(tracked.date),
                durable_date: durable.map(|state| state.date),
                target: plan.target,
                requests: plan
                    .requests
                    .iter()
                    .map(|request| request.query.to_ql())
                    .collect(),
            })
            .collect();
        Ok(StatusResult { latest, groups })
    }

    pub fn export(&self, sink: &dyn ProgressSink) -> Result<ExportResult, OprError> {
        let since = merge::window_start(Utc::now(), self.config.merge_months);
        sink.event(ProgressEvent {
            message: format!("phase=Resolve; exporting changes since {}", format_timestamp(since)),
            elapsed: None,
        });
        Ok(ExportResult {
            since: format_timestamp(since),
            features: merge::export_features(&self.ledger, since)?,
        })
    }

    /// Runs the merge engine over `input` (a JSON feature array) or over a
    /// fresh export of the ledger.
    pub fn merge(
        &self,
        input: Option<&Utf8Path>,
        dry_run: bool,
        sink: &dyn ProgressSink,
    ) -> Result<MergeResult, OprError> {
        let started = Instant::now();
        let _lock = self.store.acquire_lock()?;
        let features = match input {
            Some(path) => {
                let content = fs::read(path.as_std_path())
                    .map_err(|err| OprError::Filesystem(format!("{path}: {err}")))?;
                serde_json::from_slice::<Vec<Feature>>(&content)
                    .map_err(|err| OprError::Decode(format!("{path}: {err}")))?
            }
            None => self.export(sink)?.features,
        };
        sink.event(ProgressEvent {
            message: format!("phase=Merge; {} features", features.len()),
            elapsed: Some(started.elapsed()),
        });

        let engine = MergeEngine::new(&self.ledger, self.config.merge.clone());
        let report = engine.run(&features, dry_run)?;
        let mut report_path = None;
        if !dry_run {
            self.persist_ledger()?;
            let path = self
                .store
                .merge_report_path(&format_timestamp(Utc::now()));
            Store::write_json_atomic(&path, &report)?;
            report_path = Some(path.to_string());
        }
        sink.event(ProgressEvent {
            message: format!("phase=Merge; merged {} places", report.merged),
            elapsed: Some(started.elapsed()),
        });
        Ok(MergeResult {
            features: features.len(),
            report,
            report_path,
        })
    }

    fn plan(&self, latest: &str) -> Result<Vec<(GroupPlan, SyncState, Option<SyncState>)>, OprError> {
        let aligned = self.config.alignment.align(latest)?;
        let bot_state = self.ledger.bot_state(&self.config.bot)?;
        self.config
            .tag_groups
            .iter()
            .map(|group| {
                let tracked = tracked_state(bot_state.as_ref(), &group.name)?;
                let durable = self.durable.get(&group.name)?;
                let target = self.config.alignment.group_target(aligned, &tracked)?;
                let plan = plan_group(group, &tracked, durable.as_ref(), &target)?;
                Ok((plan, tracked, durable))
            })
            .collect()
    }

    fn run_phase(
        &self,
        orchestrator: &Orchestrator,
        fence: &Mutex<()>,
        request: &SyncRequest,
        cancel: &AtomicBool,
    ) -> Result<Vec<TaskReport>, OprError> {
        let context = SyncContext {
            ledger: &self.ledger,
            client: &self.client,
            planner: QueryPlanner::new(self.config.split),
            settings: &self.config.reconcile,
            seen: SeenIds::new(),
            commit_fence: fence,
            osm_tag: request.query.filter.key.clone(),
        };
        let initial = if request.splittable {
            let root = Region::root(request.query.bbox.unwrap_or(BBox::WORLD));
            vec![SyncTask::Region {
                query: request.query.clone(),
                region: root,
            }]
        } else {
            vec![SyncTask::Whole {
                query: request.query.clone(),
            }]
        };
        let reports =
            orchestrator.submit_and_wait(initial, cancel, |task, spawner| context.run(task, spawner))?;
        let _fence = fence.lock();
        self.ledger.create_block()?;
        Ok(reports)
    }

    fn commit_states(
        &self,
        plans: &[(GroupPlan, SyncState, Option<SyncState>)],
    ) -> Result<(), OprError> {
        let mut operation = Operation::new(BOT_TYPE);
        for (plan, tracked, _) in plans {
            if plan.next_state != *tracked {
                operation.edit.push(tracked_state_edit(
                    &self.config.bot,
                    &plan.group,
                    tracked,
                    &plan.next_state,
                )?);
            }
        }
        if !operation.is_empty() {
            let signed = self.ledger.sign_and_stamp(operation)?;
            self.ledger.add_operation(signed)?;
            self.ledger.create_block()?;
        }
        self.persist_ledger()?;
        for (plan, _, durable) in plans {
            if durable.as_ref() != Some(&plan.next_state) {
                self.durable.put(&plan.group, &plan.next_state)?;
            }
        }
        Ok(())
    }

    fn persist_ledger(&self) -> Result<(), OprError> {
        Store::write_bytes_atomic(&self.store.ledger_snapshot_path(), &self.ledger.snapshot()?)
    }
}
