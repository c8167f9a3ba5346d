//! Scheduler Loop: the heart of the orchestrator. Maintains `ready`,
//! `building`, `done`, `failed`, `skipped` sets over the dependency graph
//! and drives the Worker Manager to completion.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

use crate::depgraph::DependencyGraph;
use crate::error::SchedulerError;
use crate::history::HistoryStore;
use crate::worker_manager::{Worker, WorkerState};
use crate::{BuildReason, BuildResult, CurrentBuildStatus, PkgToBuild, Pkgbase, RecipeInfo, Rusages};

const TICK_TIMER: Duration = Duration::from_secs(10);

/// One completed build, delivered to the scheduler through the completions
/// channel.
pub struct Completion {
    pub pkgbase: Pkgbase,
    pub worker_name: String,
    pub result: BuildResult,
}

/// Why a package that never got a chance to build ended up `failed`.
#[derive(Debug, Clone)]
pub enum TerminalFailure {
    MissingDependencies(Vec<Pkgbase>),
    FailedByDeps(Vec<Pkgbase>),
    /// The package was actually attempted and its build command or policy
    /// check itself failed, as opposed to being skipped over a failed
    /// dependency.
    BuildFailed(String),
    Deadlock,
}

pub struct SchedulerState {
    pub pending: HashMap<Pkgbase, BuildReason>,
    pub ready: HashMap<Pkgbase, BuildReason>,
    pub building: HashSet<Pkgbase>,
    pub done: HashSet<Pkgbase>,
    pub failed: HashMap<Pkgbase, TerminalFailure>,
    pub skipped: HashMap<Pkgbase, String>,
}

impl SchedulerState {
    /// Seeds `pending`/`ready` from the planner's output, splitting
    /// immediately-buildable pkgbases (empty build-input closure, or whose
    /// closure is already `done`) into `ready`.
    pub fn seed(initial: HashMap<Pkgbase, BuildReason>, depgraph: &DependencyGraph) -> Self {
        let mut state = SchedulerState {
            pending: HashMap::new(),
            ready: HashMap::new(),
            building: HashSet::new(),
            done: HashSet::new(),
            failed: HashMap::new(),
            skipped: HashMap::new(),
        };
        for (pkgbase, reason) in initial {
            state.insert_selected(pkgbase, reason, depgraph);
        }
        state
    }

    fn insert_selected(&mut self, pkgbase: Pkgbase, reason: BuildReason, depgraph: &DependencyGraph) {
        if self.build_input_satisfied(&pkgbase, depgraph) {
            self.ready.insert(pkgbase, reason);
        } else {
            self.pending.insert(pkgbase, reason);
        }
    }

    fn build_input_satisfied(&self, pkgbase: &Pkgbase, depgraph: &DependencyGraph) -> bool {
        depgraph
            .build_input_closure(pkgbase)
            .is_none_or(|deps| deps.iter().all(|d| self.done.contains(&d.pkgbase)))
    }

    /// Promotes every `pending` entry whose build-input closure is now
    /// satisfied into `ready`.
    fn promote_ready(&mut self, depgraph: &DependencyGraph) {
        let promotable: Vec<Pkgbase> = self
            .pending
            .keys()
            .filter(|p| self.build_input_satisfied(p, depgraph))
            .cloned()
            .collect();
        for pkgbase in promotable {
            if let Some(reason) = self.pending.remove(&pkgbase) {
                self.ready.insert(pkgbase, reason);
            }
        }
    }

    /// Moves `pkgbase` and every transitive dependent still outstanding into
    /// `failed` with `FailedByDeps`, eagerly per spec's monotone-failure
    /// invariant.
    fn cascade_failure(&mut self, pkgbase: &Pkgbase, depgraph: &DependencyGraph) {
        let dependents = depgraph.reverse_dependents();
        let Some(affected) = dependents.get(pkgbase) else {
            return;
        };
        for dependent in affected {
            if self.done.contains(dependent)
                || self.building.contains(dependent)
                || self.failed.contains_key(dependent)
            {
                continue;
            }
            self.pending.remove(dependent);
            self.ready.remove(dependent);
            self.failed.insert(
                dependent.clone(),
                TerminalFailure::FailedByDeps(vec![pkgbase.clone()]),
            );
        }
    }

    pub fn is_quiescent(&self) -> bool {
        self.ready.is_empty() && self.building.is_empty() && self.pending.is_empty()
    }
}

/// Dependents-in-flight count, used as the primary priority signal: more
/// waiting work unblocked by finishing this package sooner.
fn pending_dependent_count(
    pkgbase: &Pkgbase,
    state: &SchedulerState,
    reverse_dependents: &HashMap<Pkgbase, HashSet<Pkgbase>>,
) -> u64 {
    reverse_dependents
        .get(pkgbase)
        .map(|dependents| {
            dependents
                .iter()
                .filter(|d| state.pending.contains_key(*d) || state.ready.contains_key(*d))
                .count() as u64
        })
        .unwrap_or(0)
}

pub struct SchedulerContext<'a> {
    pub recipes: &'a HashMap<Pkgbase, RecipeInfo>,
    pub depgraph: &'a DependencyGraph,
    pub history: &'a HistoryStore,
    pub batch_id: i64,
    pub batch_deadline: Option<Instant>,
}

/// One worker slot the scheduler dispatches through: the live admission
/// state plus the `Worker` implementation used to actually launch builds.
pub struct WorkerSlot {
    pub state: WorkerState,
    pub worker: Arc<dyn Worker>,
}

/// Owns the actual worker-subprocess launch for a package the scheduler has
/// just admitted. Implemented by `bin/orchestrator`, which knows how to turn
/// a `PkgToBuild` into a `protocol::WorkerInput`, run it through the named
/// worker, and feed the outcome back through `completions`. Must not block:
/// real implementations spawn a task and return immediately. `worker` is an
/// `Arc` (not a borrow) so the implementation can move it into a spawned
/// `'static` task.
pub trait WorkerLauncher {
    fn launch(&self, worker: Arc<dyn Worker>, pkg: PkgToBuild, completions: mpsc::UnboundedSender<Completion>);
}

/// Runs the tick loop to completion (every managed pkgbase reaches a
/// terminal state), returning the final [`SchedulerState`].
pub async fn run(
    ctx: &SchedulerContext<'_>,
    mut state: SchedulerState,
    mut slots: Vec<WorkerSlot>,
    rusages: &Rusages,
    completions_tx: mpsc::UnboundedSender<Completion>,
    mut completions: mpsc::UnboundedReceiver<Completion>,
    mut stop: tokio::sync::watch::Receiver<bool>,
    launcher: &dyn WorkerLauncher,
) -> Result<SchedulerState, SchedulerError> {
    for slot in &slots {
        if let Err(e) = slot.worker.prepare_batch().await {
            tracing::warn!(worker = slot.worker.name(), "prepare_batch failed: {e:#}");
        }
    }

    loop {
        // Step 1: drain completions.
        while let Ok(completion) = completions.try_recv() {
            handle_completion(ctx, &mut state, &mut slots, completion).await?;
        }

        if *stop.borrow() {
            drain_for_shutdown(&mut state, &mut completions).await;
            break;
        }

        // Step 2/3/4: dispatch unassigned ready work to each worker in
        // stable (declaration) order.
        if !state.ready.is_empty() {
            dispatch_ready(ctx, &mut state, &mut slots, rusages, &completions_tx, launcher);
        }

        // Step 5: scheduler deadlock guard.
        if state.building.is_empty() && !state.ready.is_empty() {
            let stuck: Vec<Pkgbase> = state.ready.keys().cloned().collect();
            tracing::error!("scheduler deadlock: {} ready pkgbase(s) with no willing worker", stuck.len());
            for pkgbase in &stuck {
                state.ready.remove(pkgbase);
                state.failed.insert(pkgbase.clone(), TerminalFailure::Deadlock);
            }
            return Err(SchedulerError::NoEligibleWorker(stuck.join(", ")));
        }

        // Step 6: done.
        if state.is_quiescent() {
            break;
        }

        // Step 7: wait for a completion or the periodic timer.
        tokio::select! {
            maybe = completions.recv() => {
                if let Some(completion) = maybe {
                    handle_completion(ctx, &mut state, &mut slots, completion).await?;
                }
            }
            _ = tokio::time::sleep(TICK_TIMER) => {
                refresh_worker_resources(&mut slots).await;
            }
            changed = stop.changed() => {
                if changed.is_ok() && *stop.borrow() {
                    drain_for_shutdown(&mut state, &mut completions).await;
                    break;
                }
            }
        }
    }

    for slot in &slots {
        if let Err(e) = slot.worker.finish_batch().await {
            tracing::warn!(worker = slot.worker.name(), "finish_batch failed: {e:#}");
        }
    }

    Ok(state)
}

async fn handle_completion(
    ctx: &SchedulerContext<'_>,
    state: &mut SchedulerState,
    slots: &mut [WorkerSlot],
    completion: Completion,
) -> Result<(), SchedulerError> {
    state.building.remove(&completion.pkgbase);
    if let Some(slot) = slots.iter_mut().find(|s| s.worker.name() == completion.worker_name) {
        slot.state.current_task_count = slot.state.current_task_count.saturating_sub(1);
    }

    let entry = crate::HistoryEntry {
        id: 0,
        ts: time::OffsetDateTime::now_utc(),
        pkgbase: completion.pkgbase.clone(),
        nv_version: None,
        pkg_version: completion.result.version().map(str::to_string),
        elapsed_seconds: completion.result.elapsed_seconds(),
        result_tag: result_tag(&completion.result).to_string(),
        cpu_seconds: completion.result.rusage().cpu_seconds,
        peak_memory_bytes: completion.result.rusage().peak_memory_bytes,
        message: failure_message(&completion.result),
        build_reasons_json: "null".to_string(),
        maintainers_json: "[]".to_string(),
        worker_name: Some(completion.worker_name.clone()),
    };
    ctx.history.record(&entry).await?;

    match completion.result {
        BuildResult::Successful { .. } | BuildResult::Staged { .. } => {
            state.done.insert(completion.pkgbase.clone());
            ctx.history
                .mark(&completion.pkgbase, ctx.batch_id, CurrentBuildStatus::Done, "null")
                .await?;
            evaluate_on_build_triggers(ctx, state, &completion.pkgbase);
        }
        BuildResult::Failed { ref error, .. } => {
            state
                .failed
                .insert(completion.pkgbase.clone(), TerminalFailure::BuildFailed(error.to_string()));
            ctx.history
                .mark(&completion.pkgbase, ctx.batch_id, CurrentBuildStatus::Failed, "null")
                .await?;
            state.cascade_failure(&completion.pkgbase, ctx.depgraph);
        }
        BuildResult::Skipped { reason, .. } => {
            state.skipped.insert(completion.pkgbase.clone(), reason);
            ctx.history
                .mark(&completion.pkgbase, ctx.batch_id, CurrentBuildStatus::Skipped, "null")
                .await?;
        }
    }

    state.promote_ready(ctx.depgraph);
    Ok(())
}

fn result_tag(result: &BuildResult) -> &'static str {
    match result {
        BuildResult::Successful { .. } => "successful",
        BuildResult::Staged { .. } => "staged",
        BuildResult::Failed { .. } => "failed",
        BuildResult::Skipped { .. } => "skipped",
    }
}

fn failure_message(result: &BuildResult) -> Option<String> {
    match result {
        BuildResult::Failed { error, .. } => Some(error.to_string()),
        BuildResult::Skipped { reason, .. } => Some(reason.clone()),
        _ => None,
    }
}

/// A dependent whose `update_on_build` trigger names `trigger_pkgbase`
/// is re-planned as `OnBuild` once its referenced rewritten versions
/// differ; that comparison is the planner's job (§4.5 rule 5), so here we
/// only re-insert the dependent into `pending` for re-evaluation next tick.
fn evaluate_on_build_triggers(ctx: &SchedulerContext<'_>, state: &mut SchedulerState, trigger_pkgbase: &Pkgbase) {
    for (pkgbase, recipe) in ctx.recipes {
        if state.done.contains(pkgbase)
            || state.building.contains(pkgbase)
            || state.ready.contains_key(pkgbase)
            || state.pending.contains_key(pkgbase)
            || state.failed.contains_key(pkgbase)
        {
            continue;
        }
        if recipe.update_on_build.iter().any(|t| &t.pkgbase == trigger_pkgbase) {
            state.insert_selected(
                pkgbase.clone(),
                BuildReason::OnBuild(vec![trigger_pkgbase.clone()]),
                ctx.depgraph,
            );
        }
    }
}

fn dispatch_ready(
    ctx: &SchedulerContext<'_>,
    state: &mut SchedulerState,
    slots: &mut [WorkerSlot],
    rusages: &Rusages,
    completions_tx: &mpsc::UnboundedSender<Completion>,
    launcher: &dyn WorkerLauncher,
) {
    if let Some(deadline) = ctx.batch_deadline {
        if Instant::now() >= deadline {
            return;
        }
    }

    let reverse_dependents = ctx.depgraph.reverse_dependents();
    for slot in slots.iter_mut() {
        if state.ready.is_empty() {
            break;
        }
        let priority = |p: &Pkgbase| pending_dependent_count(p, state, &reverse_dependents);
        let check_buildability = |p: &Pkgbase| {
            let deps_satisfied = ctx
                .depgraph
                .build_input_closure(p)
                .is_none_or(|deps| deps.iter().all(|d| state.done.contains(&d.pkgbase)));
            let worker_allowed = ctx
                .recipes
                .get(p)
                .and_then(|r| r.allowed_workers.as_ref())
                .is_none_or(|allowed| allowed.iter().any(|w| w.as_str() == slot.worker.name()));
            deps_satisfied && worker_allowed
        };
        let accepted = crate::worker_manager::try_accept_package(
            &mut slot.state,
            &state.ready,
            rusages,
            priority,
            check_buildability,
        );
        for pkg in accepted {
            state.ready.remove(&pkg.pkgbase);
            state.building.insert(pkg.pkgbase.clone());
            tracing::info!(pkgbase = %pkg.pkgbase, worker = slot.worker.name(), "dispatched");
            // Launch is the caller's (bin/orchestrator) responsibility: it
            // owns the worker subprocess future and feeds its outcome back
            // through the completions channel, per the spec's non-blocking
            // submission model. We only invoke it here; it must not block.
            launcher.launch(slot.worker.clone(), pkg, completions_tx.clone());
        }
    }
}

async fn refresh_worker_resources(slots: &mut [WorkerSlot]) {
    for slot in slots.iter_mut() {
        match slot.worker.resource_usage().await {
            Ok((cpu_ratio, memory_avail)) => {
                slot.state.last_cpu_ratio = cpu_ratio;
                slot.state.last_memory_avail_bytes = memory_avail;
            }
            Err(e) => tracing::warn!(worker = slot.worker.name(), "resource_usage failed: {e:#}"),
        }
    }
}

/// Stops admitting new work and waits a grace period for in-flight builds to
/// report back; anything still outstanding afterward is marked
/// timed-out-failed, matching the two-stage interrupt-then-kill cancellation
/// sequence (the actual signal delivery lives in the accountant; this just
/// bounds how long the scheduler itself waits).
async fn drain_for_shutdown(state: &mut SchedulerState, completions: &mut mpsc::UnboundedReceiver<Completion>) {
    let grace = Duration::from_secs(30);
    let deadline = Instant::now() + grace;
    while !state.building.is_empty() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, completions.recv()).await {
            Ok(Some(completion)) => {
                state.building.remove(&completion.pkgbase);
                match completion.result {
                    BuildResult::Successful { .. } | BuildResult::Staged { .. } => {
                        state.done.insert(completion.pkgbase);
                    }
                    BuildResult::Failed { error, .. } => {
                        state
                            .failed
                            .insert(completion.pkgbase, TerminalFailure::BuildFailed(error.to_string()));
                    }
                    BuildResult::Skipped { reason, .. } => {
                        state.skipped.insert(completion.pkgbase, reason);
                    }
                }
            }
            _ => break,
        }
    }
    for pkgbase in state.building.drain().collect::<Vec<_>>() {
        state.failed.insert(pkgbase, TerminalFailure::Deadlock);
    }
    state.ready.clear();
    state.pending.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn empty_graph() -> DependencyGraph {
        DependencyGraph::build(&HashMap::new())
    }

    #[test]
    fn seed_places_leaf_packages_directly_in_ready() {
        let graph = empty_graph();
        let mut initial = HashMap::new();
        initial.insert("foo".to_string(), BuildReason::Cmdline(None));
        let state = SchedulerState::seed(initial, &graph);
        assert!(state.ready.contains_key("foo"));
        assert!(state.pending.is_empty());
    }

    #[test]
    fn cascade_failure_marks_dependents_failed_by_deps() {
        let mut recipes = HashMap::new();
        recipes.insert(
            "base".to_string(),
            RecipeInfo {
                pkgbase: "base".into(),
                maintainers: vec![],
                update_on: vec![],
                update_on_build: vec![],
                throttle_info: Default::default(),
                repo_depends: vec![],
                repo_makedepends: vec![],
                time_limit_hours: 1.0,
                staging: false,
                managed: true,
                allowed_workers: None,
                pre_build_script: None,
                post_build_script: None,
                post_build_always_script: None,
                prepare_script: None,
            },
        );
        recipes.insert(
            "dependent".to_string(),
            RecipeInfo {
                pkgbase: "dependent".into(),
                maintainers: vec![],
                update_on: vec![],
                update_on_build: vec![],
                throttle_info: Default::default(),
                repo_depends: vec![crate::Dependency {
                    pkgbase: "base".into(),
                    pkgname: "base".into(),
                }],
                repo_makedepends: vec![],
                time_limit_hours: 1.0,
                staging: false,
                managed: true,
                allowed_workers: None,
                pre_build_script: None,
                post_build_script: None,
                post_build_always_script: None,
                prepare_script: None,
            },
        );
        let graph = DependencyGraph::build(&recipes);
        let mut initial = HashMap::new();
        initial.insert("base".to_string(), BuildReason::Cmdline(None));
        initial.insert("dependent".to_string(), BuildReason::Cmdline(None));
        let mut state = SchedulerState::seed(initial, &graph);

        assert!(state.ready.contains_key("base"));
        assert!(state.pending.contains_key("dependent"));

        state.cascade_failure(&"base".to_string(), &graph);
        assert!(matches!(
            state.failed.get("dependent"),
            Some(TerminalFailure::FailedByDeps(_))
        ));
        assert!(!state.pending.contains_key("dependent"));
    }
}
