use thiserror::Error;

use crate::Pkgbase;

/// Errors raised while loading one recipe or the recipe directory as a whole.
#[derive(Debug, Error)]
pub enum RecipeLoadError {
    #[error("{pkgbase}: missing recipe.toml")]
    MissingConfig { pkgbase: Pkgbase },
    #[error("{pkgbase}: malformed recipe.toml: {source}")]
    MalformedConfig {
        pkgbase: Pkgbase,
        #[source]
        source: toml::de::Error,
    },
    #[error("{pkgbase}: maintainers list is empty")]
    NoMaintainers { pkgbase: Pkgbase },
    #[error("pkgname {pkgname} is claimed by both {first} and {second}")]
    DuplicatePkgname {
        pkgname: String,
        first: Pkgbase,
        second: Pkgbase,
    },
    #[error("{pkgbase}: failed to read directory: {source}")]
    Io {
        pkgbase: Pkgbase,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by the Scheduler Loop that callers need to branch on,
/// distinct from the per-package [`crate::BuildError`] carried in
/// [`crate::BuildResult::Failed`].
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("dependency graph contains a cycle touching {0}")]
    CyclicGraph(Pkgbase),
    #[error("no worker is able to accept {0}")]
    NoEligibleWorker(Pkgbase),
    #[error("deadline for {0} already elapsed before scheduling")]
    DeadlineElapsed(Pkgbase),
    #[error(transparent)]
    History(#[from] sqlx::Error),
}

/// Errors raised by the Artifact Publisher while moving build outputs into
/// the managed repository.
#[derive(Debug, Error)]
pub enum ArtifactPolicyError {
    #[error("{pkgname} would replace official package(s) {packages:?} or shadow group(s) {groups:?}")]
    ConflictWithOfficial {
        pkgname: String,
        groups: Vec<String>,
        packages: Vec<String>,
    },
    #[error("{pkgname} {built_version} is older than repository version {repo_version}")]
    Downgrading {
        pkgname: String,
        built_version: String,
        repo_version: String,
    },
    #[error("signing command failed: {0}")]
    SigningFailed(String),
    #[error("failed to read package metadata: {0}")]
    Metadata(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised by the Resource Accountant while starting or monitoring a
/// worker subprocess's resource scope.
#[derive(Debug, Error)]
pub enum AccountantError {
    #[error("failed to start accounting scope: {0}")]
    ScopeStart(String),
    #[error("failed to read accounting scope: {0}")]
    ScopeRead(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised while parsing or executing a recipe's declarative hook
/// script.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("unrecognized hook action: {0:?}")]
    UnknownAction(String),
    #[error("malformed hook action: {0:?}")]
    MalformedAction(String),
    #[error("hook action failed: {0}")]
    ActionFailed(String),
}
