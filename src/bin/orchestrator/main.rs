use std::collections::{HashMap, HashSet};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};

use args::{Args, Command};
use buildwarden::config::GlobalConfig;
use buildwarden::depgraph::DependencyGraph;
use buildwarden::error::RecipeLoadError;
use buildwarden::history::HistoryStore;
use buildwarden::protocol::{MailReport, WorkerInput, WorkerResult};
use buildwarden::scheduler::{self, Completion, SchedulerContext, SchedulerState, WorkerLauncher, WorkerSlot};
use buildwarden::worker_manager::{LocalWorker, RemoteWorker, Worker, WorkerState};
use buildwarden::{build_worker, git, logging, mail, nvcheck, planner, publisher, recipe};
use buildwarden::{BuildError, BuildReason, BuildResult, Pkgbase, RUsage, RecipeInfo};

mod args;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(args.verbose);

    let config = match GlobalConfig::load(args.config.as_std_path()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("failed to load config from {}: {e:#}", args.config);
            return ExitCode::from(1);
        }
    };

    let result = match args.command {
        Command::Batch => run_batch(&config).await,
        Command::Build { pkgbase } => run_single_build(&config, &pkgbase).await,
        Command::Recheck => run_recheck(&config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(2)
        }
    }
}

fn load_recipes(config: &GlobalConfig) -> (HashMap<Pkgbase, RecipeInfo>, HashMap<Pkgbase, RecipeLoadError>) {
    let git_repo = git2::Repository::open(config.recipes_dir.as_std_path()).ok();
    recipe::load(&config.recipes_dir, config.pacman_db_dir.as_str(), &config.repo_name, git_repo.as_ref())
}

/// Extends `ready` with every managed package that transitively depends (at
/// runtime) on one already in `ready`, so that a rebuilt dependency carries
/// its dependents along in the same batch. Seeded with
/// [`BuildReason::Depended`] naming the ready pkgbase(s) that triggered it;
/// [`SchedulerState::seed`] places these in `pending` until their own
/// build-input closure is satisfied.
fn seed_with_dependents(
    ready: HashMap<Pkgbase, BuildReason>,
    recipes: &HashMap<Pkgbase, RecipeInfo>,
    depgraph: &DependencyGraph,
) -> HashMap<Pkgbase, BuildReason> {
    let reverse_dependents = depgraph.reverse_dependents();
    let mut causes: HashMap<Pkgbase, Vec<Pkgbase>> = HashMap::new();
    for pkgbase in ready.keys() {
        let Some(dependents) = reverse_dependents.get(pkgbase) else {
            continue;
        };
        for dependent in dependents {
            if ready.contains_key(dependent) {
                continue;
            }
            if !recipes.get(dependent).is_some_and(|r| r.managed) {
                continue;
            }
            causes.entry(dependent.clone()).or_default().push(pkgbase.clone());
        }
    }

    let mut seeded = ready;
    for (dependent, mut by) in causes {
        by.sort();
        seeded.insert(dependent, BuildReason::Depended(by));
    }
    seeded
}

/// Matches each dependency of `recipe` to artifact files already present in
/// the managed repository, by filename prefix.
fn resolve_depend_packages(config: &GlobalConfig, recipe: &RecipeInfo) -> HashMap<Pkgbase, Vec<Utf8PathBuf>> {
    let artifacts = publisher::scan_artifacts(&config.repo_dir, &config.accepted_suffixes).unwrap_or_default();
    let mut out: HashMap<Pkgbase, Vec<Utf8PathBuf>> = HashMap::new();
    for dep in recipe.repo_depends.iter().chain(recipe.repo_makedepends.iter()) {
        let matching: Vec<Utf8PathBuf> = artifacts
            .iter()
            .filter(|path| path.file_name().is_some_and(|name| name.starts_with(&dep.pkgname)))
            .cloned()
            .collect();
        if !matching.is_empty() {
            out.entry(dep.pkgbase.clone()).or_default().extend(matching);
        }
    }
    out
}

fn worker_input_for(
    config: &GlobalConfig,
    recipe: &RecipeInfo,
    pkgbase: &Pkgbase,
    on_build_vers: Option<(String, String)>,
    reason_json: &str,
    worker_no: u32,
    workerman: &str,
    deadline_unix: i64,
) -> WorkerInput {
    WorkerInput {
        pkgbase: pkgbase.clone(),
        depend_packages: resolve_depend_packages(config, recipe),
        update_info: Some(reason_json.to_string()),
        on_build_vers,
        commit_msg_template: config.commit_msg_template.clone(),
        bindmounts: config.bindmounts.clone(),
        tmpfs: config.tmpfs.clone(),
        worker_no,
        workerman: workerman.to_string(),
        deadline_unix,
        reponame: config.repo_name.clone(),
        result: config.data_dir.join(format!("result-{pkgbase}.json")),
        log_path: config.data_dir.join(format!("{pkgbase}.log")),
    }
}

fn convert_worker_result(result: WorkerResult, staging: bool) -> BuildResult {
    match result {
        WorkerResult::Done {
            version,
            rusage,
            elapsed_seconds,
        } => {
            if staging {
                BuildResult::Staged {
                    version,
                    rusage,
                    elapsed_seconds,
                }
            } else {
                BuildResult::Successful {
                    version,
                    rusage,
                    elapsed_seconds,
                }
            }
        }
        WorkerResult::Skipped { msg, elapsed_seconds } => BuildResult::Skipped {
            reason: msg,
            elapsed_seconds,
        },
        WorkerResult::Failed {
            error,
            rusage,
            elapsed_seconds,
            ..
        } => BuildResult::Failed {
            error,
            rusage,
            elapsed_seconds,
        },
    }
}

fn send_failure_mail(config: &GlobalConfig, recipe: &RecipeInfo, report: &MailReport) {
    let Some(smtp) = &config.smtp else {
        tracing::warn!(pkgbase = %recipe.pkgbase, "build failed but no smtp is configured; dropping report");
        return;
    };
    let report = mail::Report {
        subject: report.subject.clone(),
        body: report.body.clone(),
    };
    if let Err(e) = mail::send(smtp, &recipe.maintainers, &report, config.max_mail_bytes as usize) {
        tracing::warn!(pkgbase = %recipe.pkgbase, "failed to send failure mail: {e:#}");
    }
}

/// Turns the scheduler's admission decisions into actual worker-subprocess
/// launches. The scheduler only ever calls `launch` from inside its own
/// tick; this spawns a detached task so the tick itself never blocks.
struct OrchestratorLauncher {
    config: Arc<GlobalConfig>,
    recipes: Arc<HashMap<Pkgbase, RecipeInfo>>,
    batch_deadline: Instant,
    worker_no_counters: Mutex<HashMap<String, u32>>,
}

impl OrchestratorLauncher {
    fn new(config: Arc<GlobalConfig>, recipes: Arc<HashMap<Pkgbase, RecipeInfo>>, batch_deadline: Instant) -> Self {
        OrchestratorLauncher {
            config,
            recipes,
            batch_deadline,
            worker_no_counters: Mutex::new(HashMap::new()),
        }
    }

    fn next_worker_no(&self, worker_name: &str) -> u32 {
        let mut counters = self.worker_no_counters.lock().expect("worker_no_counters poisoned");
        let counter = counters.entry(worker_name.to_string()).or_insert(0);
        let assigned = *counter;
        *counter += 1;
        assigned
    }
}

impl WorkerLauncher for OrchestratorLauncher {
    fn launch(&self, worker: Arc<dyn Worker>, pkg: buildwarden::PkgToBuild, completions: mpsc::UnboundedSender<Completion>) {
        let config = self.config.clone();
        let recipes = self.recipes.clone();
        let worker_no = self.next_worker_no(worker.name());

        let recipe = match recipes.get(&pkg.pkgbase) {
            Some(r) => r.clone(),
            None => {
                tracing::error!(pkgbase = %pkg.pkgbase, "dispatched package has no matching recipe");
                return;
            }
        };
        let deadline = self
            .batch_deadline
            .min(Instant::now() + Duration::from_secs_f64((recipe.time_limit_hours * 3600.0).max(0.0)));
        let remaining = deadline.saturating_duration_since(Instant::now());
        let deadline_unix = (OffsetDateTime::now_utc() + time::Duration::seconds(remaining.as_secs() as i64)).unix_timestamp();
        let reason_json = serde_json::to_string(&pkg.reason).unwrap_or_else(|_| "null".to_string());

        tokio::spawn(async move {
            let worker_name = worker.name().to_string();
            let input = worker_input_for(
                &config,
                &recipe,
                &pkg.pkgbase,
                pkg.on_build_vers.clone(),
                &reason_json,
                worker_no,
                &worker_name,
                deadline_unix,
            );

            let result = match worker.run(deadline, worker_no, &input).await {
                Ok(worker_result) => {
                    if let WorkerResult::Failed { report: Some(report), .. } = &worker_result {
                        send_failure_mail(&config, &recipe, report);
                    }
                    convert_worker_result(worker_result, recipe.staging)
                }
                Err(e) => {
                    tracing::error!(pkgbase = %pkg.pkgbase, worker = %worker_name, "worker run failed: {e:#}");
                    BuildResult::Failed {
                        error: BuildError::CommandFailed(e.to_string()),
                        rusage: RUsage::default(),
                        elapsed_seconds: 0.0,
                    }
                }
            };

            let _ = completions.send(Completion {
                pkgbase: pkg.pkgbase,
                worker_name,
                result,
            });
        });
    }
}

fn sibling_worker_binary() -> Result<Utf8PathBuf> {
    let exe = std::env::current_exe().context("failed to resolve current executable path")?;
    let dir = exe.parent().context("executable has no parent directory")?;
    Utf8PathBuf::from_path_buf(dir.join("worker")).map_err(|_| anyhow::anyhow!("worker binary path is not valid UTF-8"))
}

fn build_worker_slots(config: &GlobalConfig) -> Result<Vec<WorkerSlot>> {
    let worker_binary = sibling_worker_binary()?;
    let mut slots = Vec::new();
    for wc in &config.workers {
        let worker: Arc<dyn Worker> = if wc.ssh_host.is_some() {
            Arc::new(RemoteWorker {
                config: wc.clone(),
                worker_binary_remote_path: "buildwarden-worker".to_string(),
                recipes_remote_path: config.recipes_dir.to_string(),
            })
        } else {
            Arc::new(LocalWorker {
                name: wc.name.clone(),
                worker_binary: worker_binary.clone(),
            })
        };
        slots.push(WorkerSlot {
            state: WorkerState::new(wc.name.clone(), wc.max_concurrency),
            worker,
        });
    }
    anyhow::ensure!(!slots.is_empty(), "no workers configured");
    Ok(slots)
}

/// Diffs `pkgrel` in every recipe's `.SRCINFO` between the revision recorded
/// at the end of the previous batch and `HEAD`, per §4.5 rule 4. The first
/// batch ever run against a fresh `data_dir` has nothing to diff against and
/// reports no changes.
fn compute_pkgrel_changed(config: &GlobalConfig, recipes: &HashMap<Pkgbase, RecipeInfo>) -> HashSet<Pkgbase> {
    let mut changed = HashSet::new();
    let Ok(repo) = git2::Repository::open(config.recipes_dir.as_std_path()) else {
        return changed;
    };
    let Ok(from_rev) = std::fs::read_to_string(config.last_rev_path().as_std_path()) else {
        return changed;
    };
    let from_rev = from_rev.trim();
    for pkgbase in recipes.keys() {
        if git::pkgrel_changed(&repo, pkgbase, from_rev, "HEAD").unwrap_or(false) {
            changed.insert(pkgbase.clone());
        }
    }
    changed
}

fn record_head_revision(config: &GlobalConfig) -> Result<()> {
    let Ok(repo) = git2::Repository::open(config.recipes_dir.as_std_path()) else {
        return Ok(());
    };
    let head = repo.head()?.peel_to_commit()?.id().to_string();
    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::write(config.last_rev_path().as_std_path(), head)?;
    Ok(())
}

async fn run_batch(config: &GlobalConfig) -> Result<()> {
    let (recipes, load_errors) = load_recipes(config);
    for (pkgbase, err) in &load_errors {
        tracing::warn!("{pkgbase}: {err}");
    }
    let pkgrel_changed = compute_pkgrel_changed(config, &recipes);
    let recipes = Arc::new(recipes);
    let depgraph = DependencyGraph::build(&recipes);

    let history = HistoryStore::connect(&config.history_db_path())
        .await
        .context("failed to open history store")?;
    let batch_id = history.start_batch().await?;

    let pkgbases: Vec<Pkgbase> = recipes.keys().cloned().collect();
    let last_success_times = history.last_success_times(&pkgbases).await?;
    let rusages = history.last_rusages(&pkgbases).await?;

    let mut previously_failed = HashSet::new();
    for pkgbase in &pkgbases {
        if history.is_last_failed(pkgbase).await? {
            previously_failed.insert(pkgbase.clone());
        }
    }

    for (pkgbase, recipe) in recipes.iter() {
        for trigger in &recipe.update_on_build {
            if !last_success_times.contains_key(&trigger.pkgbase) {
                tracing::warn!(
                    pkgbase = %pkgbase,
                    trigger = %trigger.pkgbase,
                    "update_on_build trigger has no build history yet, treating as no trigger this batch"
                );
            }
        }
    }

    let care_set: HashSet<Pkgbase> = recipes
        .iter()
        .filter(|(_, r)| r.managed)
        .map(|(p, _)| p.clone())
        .collect();
    let outcome = nvcheck::check(&recipes, config, Some(&care_set))
        .await
        .context("version check failed")?;
    for (pkgbase, errors) in &outcome.errors {
        for err in errors {
            tracing::warn!(pkgbase = %pkgbase, level = %err.level, "{}", err.message);
        }
    }

    let inputs = planner::PlannerInputs {
        nv_results: outcome.results,
        rebuild: outcome.rebuild,
        previously_failed,
        pkgrel_changed,
        on_build_triggered: HashMap::new(),
        requested: HashMap::new(),
        last_success_times,
    };
    let plan_result = planner::plan(&recipes, &inputs, OffsetDateTime::now_utc());

    if plan_result.ready.is_empty() {
        tracing::info!("nothing to build");
        history.finish_batch(batch_id, "done").await?;
        record_head_revision(config)?;
        return Ok(());
    }

    let seeded = seed_with_dependents(plan_result.ready, &recipes, &depgraph);
    let state = SchedulerState::seed(seeded, &depgraph);
    let slots = build_worker_slots(config)?;

    let batch_deadline_instant = Instant::now()
        + config
            .batch_budget_seconds
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(6 * 3600));
    let batch_deadline = Some(batch_deadline_instant);

    let (completions_tx, completions_rx) = mpsc::unbounded_channel();
    let (_stop_tx, stop_rx) = watch::channel(false);
    let launcher = OrchestratorLauncher::new(Arc::new(config.clone()), recipes.clone(), batch_deadline_instant);

    let ctx = SchedulerContext {
        recipes: &recipes,
        depgraph: &depgraph,
        history: &history,
        batch_id,
        batch_deadline,
    };

    let final_state = scheduler::run(&ctx, state, slots, &rusages, completions_tx, completions_rx, stop_rx, &launcher).await?;

    let built: Vec<Pkgbase> = final_state.done.iter().cloned().collect();
    if let Err(e) = nvcheck::nvtake(config, &built).await {
        tracing::warn!("nvtake failed: {e:#}");
    }

    let status = if final_state.failed.is_empty() { "done" } else { "failed" };
    history.finish_batch(batch_id, status).await?;
    record_head_revision(config)?;

    tracing::info!(
        done = final_state.done.len(),
        failed = final_state.failed.len(),
        skipped = final_state.skipped.len(),
        "batch complete"
    );
    Ok(())
}

async fn run_single_build(config: &GlobalConfig, pkgbase: &str) -> Result<()> {
    let (recipes, _load_errors) = load_recipes(config);
    let recipe = recipes
        .get(pkgbase)
        .with_context(|| format!("no recipe named {pkgbase}"))?;

    let deadline_unix = (OffsetDateTime::now_utc() + time::Duration::hours(6)).unix_timestamp();
    let input = worker_input_for(config, recipe, &pkgbase.to_string(), None, "null", 0, "local", deadline_unix);
    let build_dir = config.recipes_dir.join(pkgbase);
    let ctx = build_worker::BuildContext {
        recipe,
        config,
        input: &input,
        build_dir,
    };

    let result = build_worker::run_build(&ctx).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    match result {
        WorkerResult::Failed { msg, .. } => anyhow::bail!("build failed: {msg}"),
        _ => Ok(()),
    }
}

async fn run_recheck(config: &GlobalConfig) -> Result<()> {
    let (recipes, load_errors) = load_recipes(config);
    for (pkgbase, err) in &load_errors {
        tracing::warn!("{pkgbase}: {err}");
    }
    let outcome = nvcheck::check(&recipes, config, None).await?;
    for (pkgbase, results) in &outcome.results {
        if results.headline_changed() || results.non_headline_changed() {
            println!("{pkgbase}: would rebuild (headline {:?})", results.headline());
        }
    }
    for pkgbase in &outcome.unknown {
        println!("{pkgbase}: checker produced no usable result");
    }
    for (pkgbase, errors) in &outcome.errors {
        for err in errors {
            println!("{pkgbase}: {} {}", err.level, err.message);
        }
    }
    Ok(())
}
