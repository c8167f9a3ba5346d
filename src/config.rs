use std::collections::HashMap;
use std::path::PathBuf;
use std::{fs, io};

use camino::Utf8PathBuf;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::WorkerName;

/// One configured worker entry, local or remote-over-SSH.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub name: WorkerName,
    pub max_concurrency: u32,
    #[serde(default)]
    pub ssh_host: Option<String>,
    #[serde(default)]
    pub build_prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub from_address: String,
    pub my_address: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Top-level configuration, loaded from `config.toml` next to the recipe
/// tree. `data_dir` is the private data root holding version-check state,
/// the pacman database mirror, the GPG home, and the post-build lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub repo_name: String,
    pub pacman_db_dir: Utf8PathBuf,
    pub repo_dir: Utf8PathBuf,
    pub staging_dir: Utf8PathBuf,
    pub recipes_dir: Utf8PathBuf,
    pub data_dir: Utf8PathBuf,
    pub signing_key: Option<String>,
    pub accepted_suffixes: Vec<String>,
    pub workers: Vec<WorkerConfig>,
    pub smtp: Option<SmtpConfig>,
    #[serde(default)]
    pub log_url_template: Option<String>,
    #[serde(default = "default_max_mail_bytes")]
    pub max_mail_bytes: u64,
    #[serde(default = "default_max_log_bytes")]
    pub max_build_log_bytes: u64,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub batch_budget_seconds: Option<u64>,
    /// Extra bind mounts applied to every build chroot.
    #[serde(default)]
    pub bindmounts: Vec<Utf8PathBuf>,
    /// Paths mounted as tmpfs inside every build chroot.
    #[serde(default)]
    pub tmpfs: Vec<Utf8PathBuf>,
    /// `%s`-style template for the commit message a `commit-source-changes`
    /// hook action uses when none is given on its own line.
    #[serde(default = "default_commit_msg_template")]
    pub commit_msg_template: String,
}

fn default_commit_msg_template() -> String {
    "%s: rebuilt by buildwarden".to_string()
}

fn default_max_mail_bytes() -> u64 {
    5 * 1024 * 1024
}

fn default_max_log_bytes() -> u64 {
    1024 * 1024 * 1024
}

impl GlobalConfig {
    pub fn load(path: &std::path::Path) -> Result<Self, LoadConfigError> {
        let content = fs::read_to_string(path)?;
        let config: GlobalConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn oldver_path(&self) -> Utf8PathBuf {
        self.data_dir.join("oldver")
    }

    pub fn newver_path(&self) -> Utf8PathBuf {
        self.data_dir.join("newver")
    }

    pub fn gnupg_home(&self) -> Utf8PathBuf {
        self.data_dir.join("gnupg")
    }

    pub fn post_build_lock_path(&self) -> Utf8PathBuf {
        self.data_dir.join("post_build.lock")
    }

    pub fn history_db_path(&self) -> Utf8PathBuf {
        self.data_dir.join("history.sqlite3")
    }

    /// The recipe tree revision the last batch diffed `pkgrel` changes
    /// against.
    pub fn last_rev_path(&self) -> Utf8PathBuf {
        self.data_dir.join("last_rev")
    }

    pub fn worker_by_name(&self, name: &str) -> Option<&WorkerConfig> {
        self.workers.iter().find(|w| w.name == name)
    }
}

#[derive(Error, Debug)]
pub enum LoadConfigError {
    #[error("io error: {0:#}")]
    Io(#[from] io::Error),
    #[error("toml error: {0:#}")]
    Toml(#[from] toml::de::Error),
}

/// Nvchecker's `oldver`/`newver` state file, keyed by the entry key used in
/// the version-check interchange (`pkgbase` or `pkgbase:i`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VersionState(pub HashMap<String, String>);

#[derive(Error, Debug)]
pub enum StateDirError {
    #[error("could not resolve a state directory for this platform")]
    Unresolvable,
}

#[derive(Error, Debug)]
pub enum LoadStateError {
    #[error("io error: {0:#}")]
    Io(#[from] io::Error),
    #[error("toml error: {0:#}")]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    StateDir(#[from] StateDirError),
}

#[derive(Error, Debug)]
pub enum SaveStateError {
    #[error("io error: {0:#}")]
    Io(#[from] io::Error),
    #[error("toml error: {0:#}")]
    Toml(#[from] toml::ser::Error),
    #[error(transparent)]
    StateDir(#[from] StateDirError),
}

impl VersionState {
    pub fn load(path: &Utf8PathBuf) -> Result<Self, LoadStateError> {
        if !path.as_std_path().exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn write(&self, path: &Utf8PathBuf) -> Result<(), SaveStateError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn project_state_dir() -> Result<PathBuf, StateDirError> {
        ProjectDirs::from("org", "archlinuxcn", "buildwarden")
            .map(|p| p.data_dir().to_path_buf())
            .ok_or(StateDirError::Unresolvable)
    }
}
