//! Dispatch loop
//!
//! Single-threaded and event-driven: fill free worker slots in plan
//! order, then block until a worker completes, a timeout fires or the run
//! is cancelled. Wait barriers split the plan into segments that never
//! overlap; dependency edges defer units onto a blocked list until their
//! predecessors have passed.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::plan::{Dispatch, Plan, PlanEntry};

use super::worker::{run_worker, QueueItem, WorkerContext, WorkerOutcome, WorkerResult};
use super::SpawnError;

/// Outcome of one queued execution.
#[derive(Clone, Debug)]
pub struct UnitResult {
    pub dispatch_id: usize,
    pub name: String,
    pub queue_index: usize,
    pub outcome: WorkerOutcome,
    pub elapsed: Duration,
    pub outs_dir: PathBuf,
}

/// A unit that never started because a dependency did not pass.
#[derive(Clone, Debug)]
pub struct SkippedUnit {
    pub name: String,
    pub blocked_on: String,
}

/// Everything the merger and the exit-code logic need afterwards.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub results: Vec<UnitResult>,
    pub skipped: Vec<SkippedUnit>,
    /// True when the run was cut short by an external signal.
    pub aborted: bool,
}

impl RunSummary {
    /// Failed units: every execution that did not pass, plus every unit
    /// skipped because of a failed dependency.
    pub fn failed_count(&self) -> usize {
        let failed_runs = self
            .results
            .iter()
            .filter(|r| !r.outcome.passed())
            .count();
        failed_runs + self.skipped.len()
    }

    pub fn all_passed(&self) -> bool {
        self.failed_count() == 0 && !self.aborted
    }

    pub fn any_timeout(&self) -> bool {
        self.results
            .iter()
            .any(|r| r.outcome == WorkerOutcome::Timeout)
    }

    /// Sum of per-unit testing time across all workers.
    pub fn total_testing(&self) -> Duration {
        self.results.iter().map(|r| r.elapsed).sum()
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct DispatchState {
    remaining: usize,
    failed: bool,
}

enum Take {
    Item(QueueItem),
    Skip(QueueItem, String),
    Nothing,
}

enum Readiness {
    Ready,
    Blocked,
    DependencyFailed(String),
}

/// Run the whole plan on a pool of `budget` worker slots.
pub async fn run_plan(
    plan: &Plan,
    ctx: WorkerContext,
    argfiles: &[(String, PathBuf)],
    budget: usize,
) -> Result<RunSummary, SpawnError> {
    let variants = argfiles.len().max(1);
    let names: HashMap<usize, String> = plan.dispatches().map(|d| (d.id, d.name())).collect();
    let mut status: HashMap<usize, DispatchState> = plan
        .dispatches()
        .map(|d| {
            (
                d.id,
                DispatchState {
                    remaining: variants,
                    failed: false,
                },
            )
        })
        .collect();

    let segments = split_on_barriers(plan);
    info!(
        "running {} unit(s) in {} segment(s) on {budget} worker slot(s)",
        plan.dispatch_count(),
        segments.len()
    );

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let mut summary = RunSummary::default();
    let mut queue_index = 0usize;
    let mut free_slots: BTreeSet<usize> = (0..budget).collect();
    struct Finished {
        dispatch_id: usize,
        name: String,
        slot: usize,
        queue_index: usize,
        result: Result<WorkerResult, SpawnError>,
    }
    let mut running: JoinSet<Finished> = JoinSet::new();
    let mut fatal: Option<SpawnError> = None;

    'segments: for segment in segments {
        let mut pending: VecDeque<QueueItem> = expand(&segment, argfiles).into();
        let mut blocked: Vec<QueueItem> = Vec::new();

        loop {
            while !summary.aborted && fatal.is_none() && !free_slots.is_empty() {
                match take_ready(&mut pending, &mut blocked, &status, &names) {
                    Take::Item(item) => {
                        let slot = *free_slots.iter().next().expect("non-empty set");
                        free_slots.remove(&slot);
                        let index = queue_index;
                        queue_index += 1;
                        let ctx = ctx.clone();
                        let cancel = cancel_rx.clone();
                        let dispatch_id = item.dispatch.id;
                        let name = item.display_name();
                        running.spawn(async move {
                            let result = run_worker(&ctx, &item, index, slot, cancel).await;
                            Finished {
                                dispatch_id,
                                name,
                                slot,
                                queue_index: index,
                                result,
                            }
                        });
                    }
                    Take::Skip(item, dep) => {
                        let entry = status.entry(item.dispatch.id).or_default();
                        entry.remaining = entry.remaining.saturating_sub(1);
                        entry.failed = true;
                        warn!(
                            "skipping {} because dependency {dep} did not pass",
                            item.display_name()
                        );
                        summary.skipped.push(SkippedUnit {
                            name: item.display_name(),
                            blocked_on: dep,
                        });
                    }
                    Take::Nothing => break,
                }
            }

            if running.is_empty() {
                if summary.aborted || fatal.is_some() {
                    break 'segments;
                }
                if pending.is_empty() && blocked.is_empty() {
                    break;
                }
                // Nothing runs and nothing is ready: the remaining items
                // wait on dependencies that can no longer complete.
                let unsatisfiable = blocked.drain(..).chain(pending.drain(..));
                for item in unsatisfiable {
                    let dep = first_incomplete_dependency(&item.dispatch, &status, &names)
                        .unwrap_or_else(|| "unresolved dependency".to_string());
                    let entry = status.entry(item.dispatch.id).or_default();
                    entry.remaining = entry.remaining.saturating_sub(1);
                    entry.failed = true;
                    warn!(
                        "skipping {} because dependency {dep} never became runnable",
                        item.display_name()
                    );
                    summary.skipped.push(SkippedUnit {
                        name: item.display_name(),
                        blocked_on: dep,
                    });
                }
                continue;
            }

            tokio::select! {
                joined = running.join_next() => {
                    let Some(joined) = joined else { continue };
                    match joined {
                        Ok(finished) => {
                            free_slots.insert(finished.slot);
                            match finished.result {
                                Ok(worker) => {
                                    let entry = status.entry(finished.dispatch_id).or_default();
                                    entry.remaining = entry.remaining.saturating_sub(1);
                                    entry.failed |= !worker.outcome.passed();
                                    summary.results.push(UnitResult {
                                        dispatch_id: finished.dispatch_id,
                                        name: finished.name,
                                        queue_index: finished.queue_index,
                                        outcome: worker.outcome,
                                        elapsed: worker.elapsed,
                                        outs_dir: worker.outs_dir,
                                    });
                                }
                                Err(spawn) => {
                                    warn!("fatal: {spawn}");
                                    let _ = cancel_tx.send(true);
                                    fatal = Some(spawn);
                                }
                            }
                        }
                        Err(join_err) => {
                            warn!("worker task panicked: {join_err}");
                        }
                    }
                }
                _ = tokio::signal::ctrl_c(), if !summary.aborted => {
                    warn!("interrupt received; draining running workers");
                    summary.aborted = true;
                    let _ = cancel_tx.send(true);
                }
            }
        }
    }

    // Drain whatever is still in flight after an abort or fatal error.
    while let Some(joined) = running.join_next().await {
        if let Ok(finished) = joined {
            if let Ok(worker) = finished.result {
                summary.results.push(UnitResult {
                    dispatch_id: finished.dispatch_id,
                    name: finished.name,
                    queue_index: finished.queue_index,
                    outcome: worker.outcome,
                    elapsed: worker.elapsed,
                    outs_dir: worker.outs_dir,
                });
            }
        }
    }

    match fatal {
        Some(err) => Err(err),
        None => Ok(summary),
    }
}

fn split_on_barriers(plan: &Plan) -> Vec<Vec<Dispatch>> {
    let mut segments = vec![Vec::new()];
    for entry in &plan.entries {
        match entry {
            PlanEntry::Dispatch(d) => segments.last_mut().expect("non-empty").push(d.clone()),
            PlanEntry::Barrier => segments.push(Vec::new()),
        }
    }
    segments.retain(|s| !s.is_empty());
    segments
}

/// Expand dispatches across argument-file variants, keeping plan order as
/// the outer order.
fn expand(segment: &[Dispatch], argfiles: &[(String, PathBuf)]) -> Vec<QueueItem> {
    let mut items = Vec::new();
    for dispatch in segment {
        if argfiles.is_empty() {
            items.push(QueueItem {
                dispatch: dispatch.clone(),
                argfile_index: String::new(),
                argfile: None,
            });
        } else {
            for (index, path) in argfiles {
                items.push(QueueItem {
                    dispatch: dispatch.clone(),
                    argfile_index: index.clone(),
                    argfile: Some(path.clone()),
                });
            }
        }
    }
    items
}

fn readiness(
    dispatch: &Dispatch,
    status: &HashMap<usize, DispatchState>,
    names: &HashMap<usize, String>,
) -> Readiness {
    for dep in &dispatch.depends {
        let Some(state) = status.get(dep) else {
            return Readiness::DependencyFailed(
                names.get(dep).cloned().unwrap_or_else(|| dep.to_string()),
            );
        };
        if state.failed {
            return Readiness::DependencyFailed(
                names.get(dep).cloned().unwrap_or_else(|| dep.to_string()),
            );
        }
        if state.remaining > 0 {
            return Readiness::Blocked;
        }
    }
    Readiness::Ready
}

fn first_incomplete_dependency(
    dispatch: &Dispatch,
    status: &HashMap<usize, DispatchState>,
    names: &HashMap<usize, String>,
) -> Option<String> {
    dispatch.depends.iter().find_map(|dep| {
        let state = status.get(dep)?;
        if state.failed || state.remaining > 0 {
            names.get(dep).cloned()
        } else {
            None
        }
    })
}

/// Pick the next startable item: blocked items get first chance (oldest
/// first), then the pending queue in plan order.
fn take_ready(
    pending: &mut VecDeque<QueueItem>,
    blocked: &mut Vec<QueueItem>,
    status: &HashMap<usize, DispatchState>,
    names: &HashMap<usize, String>,
) -> Take {
    for i in 0..blocked.len() {
        match readiness(&blocked[i].dispatch, status, names) {
            Readiness::Ready => return Take::Item(blocked.remove(i)),
            Readiness::DependencyFailed(dep) => return Take::Skip(blocked.remove(i), dep),
            Readiness::Blocked => {}
        }
    }
    while let Some(item) = pending.pop_front() {
        match readiness(&item.dispatch, status, names) {
            Readiness::Ready => return Take::Item(item),
            Readiness::DependencyFailed(dep) => return Take::Skip(item, dep),
            Readiness::Blocked => blocked.push(item),
        }
    }
    Take::Nothing
}
