use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use camino::Utf8PathBuf;
use tokio::sync::{mpsc, watch};

use buildwarden::depgraph::DependencyGraph;
use buildwarden::history::HistoryStore;
use buildwarden::scheduler::{self, Completion, SchedulerContext, SchedulerState, TerminalFailure, WorkerLauncher, WorkerSlot};
use buildwarden::worker_manager::{Worker, WorkerState};
use buildwarden::{BuildError, BuildReason, BuildResult, Dependency, Pkgbase, RUsage, RecipeInfo, Rusages};

fn recipe(pkgbase: &str, repo_depends: &[&str]) -> RecipeInfo {
    RecipeInfo {
        pkgbase: pkgbase.to_string(),
        maintainers: vec![],
        update_on: vec![],
        update_on_build: vec![],
        throttle_info: Default::default(),
        repo_depends: repo_depends
            .iter()
            .map(|d| Dependency {
                pkgbase: d.to_string(),
                pkgname: d.to_string(),
            })
            .collect(),
        repo_makedepends: vec![],
        time_limit_hours: 1.0,
        staging: false,
        managed: true,
        allowed_workers: None,
        pre_build_script: None,
        post_build_script: None,
        post_build_always_script: None,
        prepare_script: None,
    }
}

/// A worker whose `run` is never actually invoked: `FakeLauncher` resolves
/// each build itself, so this only exists to satisfy `WorkerSlot`'s type.
struct FakeWorker;

#[async_trait]
impl Worker for FakeWorker {
    fn name(&self) -> &str {
        "local"
    }

    fn worker_cmd(&self, _pkgbase: &Pkgbase) -> tokio::process::Command {
        tokio::process::Command::new("true")
    }

    async fn run(
        &self,
        _deadline: tokio::time::Instant,
        _worker_no: u32,
        _input: &buildwarden::protocol::WorkerInput,
    ) -> anyhow::Result<buildwarden::protocol::WorkerResult> {
        unreachable!("FakeLauncher resolves completions directly")
    }

    async fn resource_usage(&self) -> anyhow::Result<(f64, u64)> {
        Ok((0.0, u64::MAX))
    }

    async fn sync_depended_packages(&self, _paths: &[Utf8PathBuf]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn prepare_batch(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn finish_batch(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Resolves every dispatched package against a fixed outcome table,
/// standing in for the worker subprocess round trip end to end tests would
/// otherwise need a real build toolchain for.
struct FakeLauncher {
    outcomes: HashMap<Pkgbase, BuildResult>,
    dispatched: Mutex<Vec<Pkgbase>>,
}

impl WorkerLauncher for FakeLauncher {
    fn launch(&self, _worker: Arc<dyn Worker>, pkg: buildwarden::PkgToBuild, completions: mpsc::UnboundedSender<Completion>) {
        self.dispatched.lock().unwrap().push(pkg.pkgbase.clone());
        let result = self
            .outcomes
            .get(&pkg.pkgbase)
            .cloned()
            .unwrap_or_else(|| BuildResult::Successful {
                version: "1.0-1".to_string(),
                rusage: RUsage::default(),
                elapsed_seconds: 1.0,
            });
        tokio::spawn(async move {
            let _ = completions.send(Completion {
                pkgbase: pkg.pkgbase,
                worker_name: "local".to_string(),
                result,
            });
        });
    }
}

async fn run_fixture(
    recipes: HashMap<Pkgbase, RecipeInfo>,
    initial: HashMap<Pkgbase, BuildReason>,
    outcomes: HashMap<Pkgbase, BuildResult>,
) -> (SchedulerState, Vec<Pkgbase>) {
    let dir = tempfile::tempdir().unwrap();
    let depgraph = DependencyGraph::build(&recipes);
    let history_path = Utf8PathBuf::from_path_buf(dir.path().join("history.sqlite3")).unwrap();
    let history = HistoryStore::connect(&history_path).await.unwrap();
    let batch_id = history.start_batch().await.unwrap();

    let ctx = SchedulerContext {
        recipes: &recipes,
        depgraph: &depgraph,
        history: &history,
        batch_id,
        batch_deadline: None,
    };

    let state = SchedulerState::seed(initial, &depgraph);
    let slots = vec![WorkerSlot {
        state: WorkerState::new("local".to_string(), 4),
        worker: Arc::new(FakeWorker) as Arc<dyn Worker>,
    }];
    let (completions_tx, completions_rx) = mpsc::unbounded_channel();
    let (_stop_tx, stop_rx) = watch::channel(false);
    let launcher = FakeLauncher {
        outcomes,
        dispatched: Mutex::new(Vec::new()),
    };

    let final_state = scheduler::run(
        &ctx,
        state,
        slots,
        &Rusages::new(),
        completions_tx,
        completions_rx,
        stop_rx,
        &launcher,
    )
    .await
    .unwrap();
    let dispatched = launcher.dispatched.into_inner().unwrap();
    (final_state, dispatched)
}

#[tokio::test]
async fn single_upgrade_reaches_done() {
    let mut recipes = HashMap::new();
    recipes.insert("a".to_string(), recipe("a", &[]));
    let mut initial = HashMap::new();
    initial.insert("a".to_string(), BuildReason::NvChecker(vec![(0, "github".to_string())]));

    let (final_state, dispatched) = run_fixture(recipes, initial, HashMap::new()).await;
    assert_eq!(dispatched, vec!["a".to_string()]);
    assert!(final_state.done.contains("a"));
    assert!(final_state.failed.is_empty());
}

#[tokio::test]
async fn dependency_fan_out_builds_dependent_after_dependency() {
    let mut recipes = HashMap::new();
    recipes.insert("a".to_string(), recipe("a", &["b"]));
    recipes.insert("b".to_string(), recipe("b", &[]));
    let mut initial = HashMap::new();
    initial.insert("a".to_string(), BuildReason::Depended(vec!["b".to_string()]));
    initial.insert("b".to_string(), BuildReason::NvChecker(vec![(0, "github".to_string())]));

    let (final_state, dispatched) = run_fixture(recipes, initial, HashMap::new()).await;
    assert!(final_state.done.contains("a"));
    assert!(final_state.done.contains("b"));
    // b must have been dispatched before a, since a's build-input closure
    // isn't satisfied until b is done.
    let b_pos = dispatched.iter().position(|p| p == "b").unwrap();
    let a_pos = dispatched.iter().position(|p| p == "a").unwrap();
    assert!(b_pos < a_pos);
}

#[tokio::test]
async fn allowed_workers_whitelist_blocks_dispatch_to_other_workers() {
    let mut recipes = HashMap::new();
    let mut restricted = recipe("a", &[]);
    restricted.allowed_workers = Some(vec!["gpu-builder".to_string()]);
    recipes.insert("a".to_string(), restricted);
    let mut initial = HashMap::new();
    initial.insert("a".to_string(), BuildReason::NvChecker(vec![(0, "github".to_string())]));

    let dir = tempfile::tempdir().unwrap();
    let depgraph = DependencyGraph::build(&recipes);
    let history_path = Utf8PathBuf::from_path_buf(dir.path().join("history.sqlite3")).unwrap();
    let history = HistoryStore::connect(&history_path).await.unwrap();
    let batch_id = history.start_batch().await.unwrap();
    let ctx = SchedulerContext {
        recipes: &recipes,
        depgraph: &depgraph,
        history: &history,
        batch_id,
        batch_deadline: None,
    };
    let state = SchedulerState::seed(initial, &depgraph);
    // Only a "local" worker is available, but a is restricted to
    // "gpu-builder": no slot can ever accept it, so the scheduler's deadlock
    // guard must trip instead of handing it to the wrong worker.
    let slots = vec![WorkerSlot {
        state: WorkerState::new("local".to_string(), 4),
        worker: Arc::new(FakeWorker) as Arc<dyn Worker>,
    }];
    let (completions_tx, completions_rx) = mpsc::unbounded_channel();
    let (_stop_tx, stop_rx) = watch::channel(false);
    let launcher = FakeLauncher {
        outcomes: HashMap::new(),
        dispatched: Mutex::new(Vec::new()),
    };

    let result = scheduler::run(
        &ctx,
        state,
        slots,
        &Rusages::new(),
        completions_tx,
        completions_rx,
        stop_rx,
        &launcher,
    )
    .await;

    assert!(launcher.dispatched.into_inner().unwrap().is_empty());
    assert!(matches!(result, Err(buildwarden::error::SchedulerError::NoEligibleWorker(ref p)) if p == "a"));
}

#[tokio::test]
async fn cascading_failure_marks_dependent_failed_by_deps() {
    let mut recipes = HashMap::new();
    recipes.insert("a".to_string(), recipe("a", &["b"]));
    recipes.insert("b".to_string(), recipe("b", &[]));
    let mut initial = HashMap::new();
    initial.insert("a".to_string(), BuildReason::Depended(vec!["b".to_string()]));
    initial.insert("b".to_string(), BuildReason::NvChecker(vec![(0, "github".to_string())]));

    let mut outcomes = HashMap::new();
    outcomes.insert(
        "b".to_string(),
        BuildResult::Failed {
            error: BuildError::CommandFailed("boom".to_string()),
            rusage: RUsage::default(),
            elapsed_seconds: 1.0,
        },
    );

    let (final_state, _dispatched) = run_fixture(recipes, initial, outcomes).await;
    assert!(matches!(
        final_state.failed.get("b"),
        Some(TerminalFailure::BuildFailed(_))
    ));
    assert!(matches!(
        final_state.failed.get("a"),
        Some(TerminalFailure::FailedByDeps(deps)) if deps == &vec!["b".to_string()]
    ));
    assert!(final_state.done.is_empty());
}
