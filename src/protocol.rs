//! JSON wire types exchanged between the orchestrator and the per-build
//! `worker` subprocess, both locally and over SSH.
use std::collections::HashMap;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::{BuildError, Pkgbase, RUsage};

/// Written to the child's stdin; see §4.8 step 1.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerInput {
    pub pkgbase: Pkgbase,
    /// Resolved dependency artifact paths, keyed by the dependency's
    /// pkgbase, injected into the build environment.
    pub depend_packages: HashMap<Pkgbase, Vec<Utf8PathBuf>>,
    pub update_info: Option<String>,
    pub on_build_vers: Option<(String, String)>,
    pub commit_msg_template: String,
    pub bindmounts: Vec<Utf8PathBuf>,
    pub tmpfs: Vec<Utf8PathBuf>,
    pub worker_no: u32,
    pub workerman: String,
    pub deadline_unix: i64,
    pub reponame: String,
    pub result: Utf8PathBuf,
    /// Where the build command's combined stdout/stderr is streamed; the
    /// parent owns this path so it can tail it for a failure report without
    /// waiting on the child.
    pub log_path: Utf8PathBuf,
}

/// Written by the child to the path named by [`WorkerInput::result`]; see
/// §4.8 step 7.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WorkerResult {
    Done {
        version: String,
        rusage: RUsage,
        elapsed_seconds: f64,
    },
    Skipped {
        msg: String,
        elapsed_seconds: f64,
    },
    Failed {
        msg: String,
        error: BuildError,
        rusage: RUsage,
        elapsed_seconds: f64,
        report: Option<MailReport>,
    },
}

/// A pre-rendered maintainer notification, attached to a failed
/// [`WorkerResult`] so the scheduler doesn't need build-local context to
/// send it.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MailReport {
    pub subject: String,
    pub body: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_result_round_trips_through_json() {
        let result = WorkerResult::Failed {
            msg: "boom".to_string(),
            error: BuildError::NoArtifactProduced,
            rusage: RUsage::default(),
            elapsed_seconds: 1.5,
            report: Some(MailReport {
                subject: "foo failed".to_string(),
                body: "see log".to_string(),
            }),
        };
        let json = serde_json::to_string(&result).unwrap();
        let parsed: WorkerResult = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, WorkerResult::Failed { .. }));
    }

    #[test]
    fn worker_input_round_trips_through_json() {
        let input = WorkerInput {
            pkgbase: "foo".to_string(),
            depend_packages: HashMap::new(),
            update_info: None,
            on_build_vers: Some(("1.0-1".to_string(), "1.1-1".to_string())),
            commit_msg_template: "rebuild %s".to_string(),
            bindmounts: vec![],
            tmpfs: vec![],
            worker_no: 0,
            workerman: "local".to_string(),
            deadline_unix: 0,
            reponame: "myrepo".to_string(),
            result: Utf8PathBuf::from("/tmp/result.json"),
            log_path: Utf8PathBuf::from("/tmp/result.log"),
        };
        let json = serde_json::to_string(&input).unwrap();
        let parsed: WorkerInput = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.pkgbase, "foo");
    }
}
