use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub mod accountant;
pub mod build_worker;
pub mod config;
pub mod depgraph;
pub mod error;
pub mod git;
pub mod history;
pub mod hooks;
pub mod logging;
pub mod mail;
pub mod nvcheck;
pub mod pacman;
pub mod pkgver;
pub mod planner;
pub mod protocol;
pub mod publisher;
pub mod recipe;
pub mod scheduler;
pub mod worker_manager;

pub use pkgver::PkgVers;

/// The recipe directory name; the primary key for everything in this system.
pub type Pkgbase = String;
/// The name of a built binary package. One pkgbase may produce several pkgnames.
pub type Pkgname = String;
/// Name of a worker (`local`, or a configured remote worker name).
pub type WorkerName = String;

/// A weak reference to a dependency: the presence of an edge does not own
/// the target, and its lifetime ends with the containing [`depgraph::DependencyGraph`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dependency {
    pub pkgbase: Pkgbase,
    pub pkgname: Pkgname,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyKind {
    Run,
    Make,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependencyEdge {
    pub from_pkgbase: Pkgbase,
    pub to_pkgbase: Pkgbase,
    pub to_pkgname: Pkgname,
    pub kind: DependencyKind,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Maintainer {
    pub name: String,
    pub email: Option<String>,
    pub github: Option<String>,
}

pub type PkgbaseMaintainers = HashMap<Pkgbase, Vec<Maintainer>>;

/// A single `update_on` version-source entry, keyed `pkgbase` or `pkgbase:i`
/// (i >= 1) when forwarded to the external checker.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct UpdateOnEntry {
    pub alias: Option<String>,
    /// Opaque key/value mapping forwarded to the external checker, after
    /// alias expansion.
    pub fields: HashMap<String, toml::Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OnBuildTrigger {
    pub pkgbase: Pkgbase,
    pub from_pattern: Option<String>,
    pub to_pattern: Option<String>,
}

/// `(epoch?, pkgver, pkgrel)`, stringified as `epoch:pkgver-pkgrel` or
/// `pkgver-pkgrel` and compared with the pacman version-compare algorithm.
/// See [`pkgver::PkgVers`] for the type itself.
pub type PkgVersString = String;

/// Per-entry minimum interval, in seconds, between rebuilds driven by that
/// entry.
pub type ThrottleSeconds = u64;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RecipeInfo {
    pub pkgbase: Pkgbase,
    pub maintainers: Vec<Maintainer>,
    pub update_on: Vec<UpdateOnEntry>,
    pub update_on_build: Vec<OnBuildTrigger>,
    /// Per `update_on` index, a minimum interval between rebuilds driven by
    /// that entry.
    pub throttle_info: HashMap<usize, ThrottleSeconds>,
    pub repo_depends: Vec<Dependency>,
    pub repo_makedepends: Vec<Dependency>,
    pub time_limit_hours: f64,
    pub staging: bool,
    pub managed: bool,
    pub allowed_workers: Option<Vec<WorkerName>>,
    pub pre_build_script: Option<String>,
    pub post_build_script: Option<String>,
    pub post_build_always_script: Option<String>,
    pub prepare_script: Option<String>,
}

/// Tagged variant attached to every scheduled build, for logging and mail
/// rendering.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum BuildReason {
    NvChecker(Vec<(usize, String)>),
    UpdatedFailed,
    UpdatedPkgrel,
    Depended(Vec<Pkgbase>),
    FailedByDeps(Vec<Pkgbase>),
    Cmdline(Option<String>),
    OnBuild(Vec<Pkgbase>),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RUsage {
    pub cpu_seconds: f64,
    pub peak_memory_bytes: u64,
}

impl Default for RUsage {
    fn default() -> Self {
        RUsage {
            cpu_seconds: 0.0,
            peak_memory_bytes: 0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, thiserror::Error)]
pub enum BuildError {
    #[error("missing dependencies: {0:?}")]
    MissingDependencies(Vec<Pkgbase>),
    #[error("{pkgname} would replace an official package or shadow an official group")]
    ConflictWithOfficial {
        pkgname: Pkgname,
        groups: Vec<String>,
        packages: Vec<Pkgname>,
    },
    #[error("{pkgname} is older than packaged version")]
    Downgrading {
        pkgname: Pkgname,
        built_version: PkgVersString,
        repo_version: PkgVersString,
    },
    #[error("no package artifact was produced")]
    NoArtifactProduced,
    #[error("unversioned .so in provides for {pkgname}")]
    UnversionedSonameProvides { pkgname: Pkgname },
    #[error("build command failed: {0}")]
    CommandFailed(String),
    #[error("build timed out")]
    TimeoutError,
    #[error("{0}")]
    Other(String),
}

/// Carries attached [`RUsage`] and `elapsed_seconds`. `Successful` and
/// `Staged` are truthy; others are falsy.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum BuildResult {
    Successful {
        version: PkgVersString,
        rusage: RUsage,
        elapsed_seconds: f64,
    },
    Staged {
        version: PkgVersString,
        rusage: RUsage,
        elapsed_seconds: f64,
    },
    Failed {
        error: BuildError,
        rusage: RUsage,
        elapsed_seconds: f64,
    },
    Skipped {
        reason: String,
        elapsed_seconds: f64,
    },
}

impl BuildResult {
    pub fn is_truthy(&self) -> bool {
        matches!(self, BuildResult::Successful { .. } | BuildResult::Staged { .. })
    }

    pub fn elapsed_seconds(&self) -> f64 {
        match self {
            BuildResult::Successful { elapsed_seconds, .. }
            | BuildResult::Staged { elapsed_seconds, .. }
            | BuildResult::Failed { elapsed_seconds, .. }
            | BuildResult::Skipped { elapsed_seconds, .. } => *elapsed_seconds,
        }
    }

    pub fn rusage(&self) -> RUsage {
        match self {
            BuildResult::Successful { rusage, .. } | BuildResult::Staged { rusage, .. } => {
                rusage.clone()
            }
            BuildResult::Failed { rusage, .. } => rusage.clone(),
            BuildResult::Skipped { .. } => RUsage::default(),
        }
    }

    pub fn version(&self) -> Option<&str> {
        match self {
            BuildResult::Successful { version, .. } | BuildResult::Staged { version, .. } => {
                Some(version)
            }
            _ => None,
        }
    }
}

/// A queued work item.
#[derive(Debug, Clone)]
pub struct PkgToBuild {
    pub pkgbase: Pkgbase,
    pub on_build_vers: Option<(PkgVersString, PkgVersString)>,
    pub assigned_worker: Option<WorkerName>,
    pub reason: BuildReason,
}

/// `pkgbase -> worker_name -> UsedResource`, used for scheduling cost
/// prediction.
pub type Rusages = HashMap<Pkgbase, HashMap<WorkerName, RUsage>>;

/// One `update_on` entry's outcome: nullable old/new version strings.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct NvResult {
    pub old_version: Option<String>,
    pub new_version: Option<String>,
}

impl NvResult {
    pub fn changed(&self) -> bool {
        self.old_version != self.new_version
    }
}

/// Ordered per-entry results for one recipe; index 0 (the "headline" entry)
/// drives the default rebuild decision.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct NvResults(pub Vec<NvResult>);

impl NvResults {
    pub fn headline(&self) -> Option<&NvResult> {
        self.0.first()
    }

    pub fn headline_changed(&self) -> bool {
        self.headline().is_some_and(NvResult::changed)
    }

    /// Any non-headline entry whose version changed; these force a rebuild
    /// even when the headline entry did not move.
    pub fn non_headline_changed(&self) -> bool {
        self.0.iter().skip(1).any(NvResult::changed)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentBuildStatus {
    Pending,
    Building,
    Done,
    Failed,
    Skipped,
}

impl std::fmt::Display for CurrentBuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CurrentBuildStatus::Pending => "pending",
            CurrentBuildStatus::Building => "building",
            CurrentBuildStatus::Done => "done",
            CurrentBuildStatus::Failed => "failed",
            CurrentBuildStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for CurrentBuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CurrentBuildStatus::Pending),
            "building" => Ok(CurrentBuildStatus::Building),
            "done" => Ok(CurrentBuildStatus::Done),
            "failed" => Ok(CurrentBuildStatus::Failed),
            "skipped" => Ok(CurrentBuildStatus::Skipped),
            other => Err(format!("unknown build status {other:?}")),
        }
    }
}

/// One immutable row in the append-only build log, identified by `id` and
/// ordered by `ts`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HistoryEntry {
    pub id: i64,
    pub ts: time::OffsetDateTime,
    pub pkgbase: Pkgbase,
    pub nv_version: Option<String>,
    pub pkg_version: Option<PkgVersString>,
    pub elapsed_seconds: f64,
    pub result_tag: String,
    pub cpu_seconds: f64,
    pub peak_memory_bytes: u64,
    pub message: Option<String>,
    pub build_reasons_json: String,
    pub maintainers_json: String,
    pub worker_name: Option<WorkerName>,
}

/// Mutable per-pkgbase row, overwritten on every status transition.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CurrentStatus {
    pub pkgbase: Pkgbase,
    pub updated_at: time::OffsetDateTime,
    pub batch_index: i64,
    pub status: CurrentBuildStatus,
    pub build_reasons_json: String,
}
