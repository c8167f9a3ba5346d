//! Worker Manager: an abstract pool of named workers (`local`, plus zero or
//! more `remote` workers reached over SSH) that the Scheduler Loop dispatches
//! work through.
use std::collections::HashMap;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use camino::Utf8PathBuf;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::Instant;

use crate::config::WorkerConfig;
use crate::{Pkgbase, PkgToBuild, RUsage, Rusages, WorkerName};

/// Live counters the Worker Manager tracks per worker; owned by the
/// scheduler and mutated only from its thread.
#[derive(Debug, Clone)]
pub struct WorkerState {
    pub name: WorkerName,
    pub max_concurrency: u32,
    pub current_task_count: u32,
    pub last_cpu_ratio: f64,
    pub last_memory_avail_bytes: u64,
}

impl WorkerState {
    pub fn new(name: WorkerName, max_concurrency: u32) -> Self {
        WorkerState {
            name,
            max_concurrency,
            current_task_count: 0,
            last_cpu_ratio: 0.0,
            last_memory_avail_bytes: u64::MAX,
        }
    }
}

#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    /// The command, with the worker input JSON on its stdin, that performs
    /// one build and writes the worker result to the path given in the
    /// input.
    fn worker_cmd(&self, pkgbase: &Pkgbase) -> Command;

    /// Runs one build to completion: feeds `input` to the worker (over a
    /// local pipe or an SSH session, depending on the implementation), waits
    /// up to `deadline`, and returns the parsed result. Does not block the
    /// scheduler loop itself; the caller is expected to run this inside its
    /// own spawned task.
    async fn run(
        &self,
        deadline: Instant,
        worker_no: u32,
        input: &crate::protocol::WorkerInput,
    ) -> Result<crate::protocol::WorkerResult>;

    /// Cheap (≤1s) poll of current CPU utilization ratio and available
    /// memory in bytes.
    async fn resource_usage(&self) -> Result<(f64, u64)>;

    /// Makes the listed artifact files available to the worker's
    /// filesystem.
    async fn sync_depended_packages(&self, paths: &[Utf8PathBuf]) -> Result<()>;

    async fn prepare_batch(&self) -> Result<()>;
    async fn finish_batch(&self) -> Result<()>;
}

pub struct LocalWorker {
    pub name: WorkerName,
    pub worker_binary: Utf8PathBuf,
}

#[async_trait]
impl Worker for LocalWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn worker_cmd(&self, _pkgbase: &Pkgbase) -> Command {
        Command::new(self.worker_binary.as_str())
    }

    async fn run(
        &self,
        deadline: Instant,
        worker_no: u32,
        input: &crate::protocol::WorkerInput,
    ) -> Result<crate::protocol::WorkerResult> {
        let mut cmd = self.worker_cmd(&input.pkgbase);
        cmd.arg("--worker-no").arg(worker_no.to_string());
        cmd.stdin(Stdio::piped());
        let mut child = cmd.spawn().context("failed to spawn local worker")?;
        let mut stdin = child.stdin.take().expect("stdin was piped");
        let payload = serde_json::to_vec(input).context("failed to serialize worker input")?;
        stdin.write_all(&payload).await?;
        drop(stdin);

        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::timeout(remaining, child.wait())
            .await
            .with_context(|| format!("local build of {} exceeded its deadline", input.pkgbase))??;

        let content = tokio::fs::read_to_string(input.result.as_std_path())
            .await
            .context("failed to read local worker result file")?;
        serde_json::from_str(&content).context("local worker result was not valid JSON")
    }

    async fn resource_usage(&self) -> Result<(f64, u64)> {
        let mut system = sysinfo::System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        let cpu_ratio = system.global_cpu_usage() as f64 / 100.0;
        Ok((cpu_ratio, system.available_memory()))
    }

    async fn sync_depended_packages(&self, _paths: &[Utf8PathBuf]) -> Result<()> {
        Ok(())
    }

    async fn prepare_batch(&self) -> Result<()> {
        Ok(())
    }

    async fn finish_batch(&self) -> Result<()> {
        Ok(())
    }
}

pub struct RemoteWorker {
    pub config: WorkerConfig,
    pub worker_binary_remote_path: String,
    pub recipes_remote_path: String,
}

impl RemoteWorker {
    fn ssh_host(&self) -> &str {
        self.config
            .ssh_host
            .as_deref()
            .expect("remote worker must carry ssh_host")
    }

    fn ssh_command(&self, remote_cmd: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg(self.ssh_host()).arg(remote_cmd);
        cmd
    }
}

#[async_trait]
impl Worker for RemoteWorker {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn worker_cmd(&self, _pkgbase: &Pkgbase) -> Command {
        self.ssh_command(&self.worker_binary_remote_path)
    }

    async fn run(
        &self,
        deadline: Instant,
        worker_no: u32,
        input: &crate::protocol::WorkerInput,
    ) -> Result<crate::protocol::WorkerResult> {
        let value = serde_json::to_value(input).context("failed to serialize worker input")?;
        let result = self
            .run_remote(&input.pkgbase, deadline, worker_no, &value, input.result.as_str())
            .await?;
        serde_json::from_value(result).context("remote worker result did not match the expected shape")
    }

    async fn resource_usage(&self) -> Result<(f64, u64)> {
        let output = self
            .ssh_command("cat /proc/loadavg /proc/meminfo")
            .output()
            .await
            .context("ssh resource_usage probe failed")?;
        let text = String::from_utf8_lossy(&output.stdout);
        let mut lines = text.lines();
        let load1: f64 = lines
            .next()
            .and_then(|l| l.split_whitespace().next())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        let ncpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1) as f64;
        let cpu_ratio = load1 / ncpus;

        let avail_kb: u64 = text
            .lines()
            .find(|l| l.starts_with("MemAvailable:"))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        Ok((cpu_ratio, avail_kb * 1024))
    }

    async fn sync_depended_packages(&self, paths: &[Utf8PathBuf]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut cmd = Command::new("rsync");
        cmd.arg("-a").arg("--delete");
        for path in paths {
            cmd.arg(path.as_str());
        }
        cmd.arg(format!(
            "{}:{}/",
            self.ssh_host(),
            self.config
                .build_prefix
                .as_deref()
                .unwrap_or("/var/cache/buildwarden")
        ));
        let status = cmd.status().await.context("rsync to remote worker failed")?;
        anyhow::ensure!(status.success(), "rsync exited with {status}");
        Ok(())
    }

    async fn prepare_batch(&self) -> Result<()> {
        let status = self
            .ssh_command(&format!("git -C {} pull --ff-only", self.recipes_remote_path))
            .status()
            .await
            .context("failed to refresh remote recipe tree")?;
        anyhow::ensure!(status.success(), "remote git pull exited with {status}");
        Ok(())
    }

    async fn finish_batch(&self) -> Result<()> {
        Ok(())
    }
}

impl RemoteWorker {
    /// Opens an interactive SSH session to the worker, streams `input` on
    /// its stdin, waits for completion, then reads back the result file at
    /// `result_path`.
    pub async fn run_remote(
        &self,
        pkgbase: &Pkgbase,
        deadline: Instant,
        worker_no: u32,
        input: &Value,
        result_path: &str,
    ) -> Result<Value> {
        let mut cmd = self.ssh_command(&format!(
            "{} --worker-no {}",
            self.worker_binary_remote_path, worker_no
        ));
        cmd.stdin(Stdio::piped()).stdout(Stdio::null());
        let mut child = cmd.spawn().context("failed to open ssh to remote worker")?;
        let mut stdin = child.stdin.take().expect("stdin was piped");
        let payload = serde_json::to_vec(input)?;
        stdin.write_all(&payload).await?;
        drop(stdin);

        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::timeout(remaining, child.wait())
            .await
            .with_context(|| format!("remote build of {pkgbase} exceeded its deadline"))??;

        let fetch = self
            .ssh_command(&format!("cat {result_path}"))
            .output()
            .await
            .context("failed to fetch remote worker result")?;
        let result: Value = serde_json::from_slice(&fetch.stdout)
            .context("remote worker result was not valid JSON")?;
        Ok(result)
    }
}

/// Predicted CPU intensity of `pkgbase` on this worker: `cpu/elapsed` of its
/// most recent successful build there, defaulting to 1.0.
fn predicted_cpu_intensity(rusages: &Rusages, pkgbase: &Pkgbase, worker: &WorkerName) -> f64 {
    rusages
        .get(pkgbase)
        .and_then(|by_worker| by_worker.get(worker))
        .filter(|u| u.cpu_seconds > 0.0)
        .map(|u| u.cpu_seconds)
        .unwrap_or(1.0)
}

/// Predicted peak memory of `pkgbase` on this worker, defaulting to 0 (no
/// headroom is reserved for packages without build history).
fn predicted_peak_memory(rusages: &Rusages, pkgbase: &Pkgbase, worker: &WorkerName) -> u64 {
    rusages
        .get(pkgbase)
        .and_then(|by_worker| by_worker.get(worker))
        .map(|u| u.peak_memory_bytes)
        .unwrap_or(0)
}

/// Admits packages from `ready` onto `state`, following the five-step
/// admission algorithm: concurrency gate, hot-worker gate, priority/cost
/// ordering, greedy memory-bounded admission, then a final buildability
/// veto from the scheduler.
pub fn try_accept_package(
    state: &mut WorkerState,
    ready: &HashMap<Pkgbase, crate::BuildReason>,
    rusages: &Rusages,
    priority_fn: impl Fn(&Pkgbase) -> u64,
    check_buildability_fn: impl Fn(&Pkgbase) -> bool,
) -> Vec<PkgToBuild> {
    if state.current_task_count >= state.max_concurrency {
        return Vec::new();
    }
    if state.last_cpu_ratio > 1.0 && state.current_task_count > 0 {
        return Vec::new();
    }

    let hot = state.last_cpu_ratio >= 0.9;
    let mut candidates: Vec<&Pkgbase> = ready.keys().collect();
    candidates.sort_by(|a, b| {
        let pa = priority_fn(a);
        let pb = priority_fn(b);
        let ia = predicted_cpu_intensity(rusages, a, &state.name);
        let ib = predicted_cpu_intensity(rusages, b, &state.name);
        if hot {
            // Prefer low intensity first; priority only breaks ties among
            // equally cheap candidates.
            ib.total_cmp(&ia)
                .reverse()
                .then_with(|| pb.cmp(&pa))
        } else {
            pb.cmp(&pa).then_with(|| ia.total_cmp(&ib))
        }
    });

    let mut accepted = Vec::new();
    let mut memory_avail = state.last_memory_avail_bytes;
    for pkgbase in candidates {
        if state.current_task_count as usize + accepted.len() >= state.max_concurrency as usize {
            break;
        }
        let predicted_memory = predicted_peak_memory(rusages, pkgbase, &state.name);
        if predicted_memory > memory_avail {
            continue;
        }
        if !check_buildability_fn(pkgbase) {
            continue;
        }
        memory_avail -= predicted_memory;
        accepted.push(PkgToBuild {
            pkgbase: pkgbase.clone(),
            on_build_vers: None,
            assigned_worker: Some(state.name.clone()),
            reason: ready[pkgbase].clone(),
        });
    }

    state.current_task_count += accepted.len() as u32;
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BuildReason;

    fn ready_with(pkgbases: &[&str]) -> HashMap<Pkgbase, BuildReason> {
        pkgbases
            .iter()
            .map(|p| (p.to_string(), BuildReason::Cmdline(None)))
            .collect()
    }

    #[test]
    fn full_worker_accepts_nothing() {
        let mut state = WorkerState::new("local".into(), 2);
        state.current_task_count = 2;
        let ready = ready_with(&["foo"]);
        let accepted = try_accept_package(&mut state, &ready, &Rusages::new(), |_| 1, |_| true);
        assert!(accepted.is_empty());
    }

    #[test]
    fn overloaded_worker_with_running_task_accepts_nothing() {
        let mut state = WorkerState::new("local".into(), 4);
        state.current_task_count = 1;
        state.last_cpu_ratio = 1.5;
        let ready = ready_with(&["foo"]);
        let accepted = try_accept_package(&mut state, &ready, &Rusages::new(), |_| 1, |_| true);
        assert!(accepted.is_empty());
    }

    #[test]
    fn higher_priority_admitted_first_and_bounded_by_concurrency() {
        let mut state = WorkerState::new("local".into(), 1);
        let ready = ready_with(&["low", "high"]);
        let priority = |p: &Pkgbase| if p == "high" { 10 } else { 1 };
        let accepted = try_accept_package(&mut state, &ready, &Rusages::new(), priority, |_| true);
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].pkgbase, "high");
        assert_eq!(state.current_task_count, 1);
    }

    #[test]
    fn memory_headroom_rejects_expensive_candidates() {
        let mut state = WorkerState::new("local".into(), 2);
        state.last_memory_avail_bytes = 100;
        let ready = ready_with(&["big"]);
        let mut rusages: Rusages = HashMap::new();
        rusages.insert(
            "big".to_string(),
            HashMap::from([(
                "local".to_string(),
                RUsage {
                    cpu_seconds: 1.0,
                    peak_memory_bytes: 1000,
                },
            )]),
        );
        let accepted = try_accept_package(&mut state, &ready, &rusages, |_| 1, |_| true);
        assert!(accepted.is_empty());
    }

    #[test]
    fn buildability_gate_can_veto_a_candidate() {
        let mut state = WorkerState::new("local".into(), 2);
        let ready = ready_with(&["foo"]);
        let accepted = try_accept_package(&mut state, &ready, &Rusages::new(), |_| 1, |_| false);
        assert!(accepted.is_empty());
    }
}
