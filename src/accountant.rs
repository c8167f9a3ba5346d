//! Resource Accountant: supervises one worker subprocess's resource usage
//! and enforces its wall-clock deadline.
use std::process::Stdio;

use anyhow::{Context, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::time::{Duration, Instant};

use crate::error::AccountantError;
use crate::RUsage;

const GRACE_PERIOD: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Wraps `cmd` so it launches inside a transient cgroup-capable scope when
/// `systemd-run --user --scope` is available, falling back to launching it
/// directly (the caller's `/proc` fallback then reports zeroed CPU/memory).
pub fn wrap_in_scope(mut cmd: Command, scope_name: &str) -> Command {
    if which_systemd_run() {
        let mut wrapped = Command::new("systemd-run");
        wrapped
            .arg("--user")
            .arg("--scope")
            .arg("--unit")
            .arg(scope_name)
            .arg("--")
            .arg(cmd.as_std().get_program());
        wrapped.args(cmd.as_std().get_args());
        if let Some(dir) = cmd.as_std().get_current_dir() {
            wrapped.current_dir(dir);
        }
        for (key, value) in cmd.as_std().get_envs() {
            if let Some(value) = value {
                wrapped.env(key, value);
            }
        }
        wrapped
    } else {
        cmd
    }
}

fn which_systemd_run() -> bool {
    std::process::Command::new("which")
        .arg("systemd-run")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// The outcome of supervising one build subprocess to completion or to its
/// deadline, whichever comes first.
pub struct SuperviseOutcome {
    pub rusage: RUsage,
    pub timed_out: bool,
    /// `None` when the process was killed after timing out and never
    /// produced a natural exit status.
    pub status: Option<std::process::ExitStatus>,
}

/// Polls `child`'s resource usage until it exits or `deadline` passes,
/// returning its final `RUsage`, exit status and whether the deadline fired.
pub async fn supervise(mut child: Child, deadline: Instant) -> Result<SuperviseOutcome, AccountantError> {
    let pid = child.id();
    let mut peak_memory_bytes = 0u64;

    loop {
        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| AccountantError::ScopeRead(e.to_string()))?;
                let cpu_seconds = cpu_time_for(pid).unwrap_or(0.0);
                return Ok(SuperviseOutcome {
                    rusage: RUsage { cpu_seconds, peak_memory_bytes },
                    timed_out: false,
                    status: Some(status),
                });
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {
                if let Some(pid) = pid {
                    if let Some(rss) = memory_rss_for(pid) {
                        peak_memory_bytes = peak_memory_bytes.max(rss);
                    }
                }
                if Instant::now() >= deadline {
                    let rusage = timeout_kill(child, pid, peak_memory_bytes).await?;
                    return Ok(SuperviseOutcome { rusage, timed_out: true, status: None });
                }
            }
        }
    }
}

async fn timeout_kill(mut child: Child, pid: Option<u32>, peak_memory_bytes: u64) -> Result<RUsage, AccountantError> {
    if let Some(pid) = pid {
        let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGINT);
    }
    let interrupted = tokio::time::timeout(GRACE_PERIOD, child.wait()).await;
    if interrupted.is_err() {
        if let Some(pid) = pid {
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
        let _ = child.wait().await;
    }
    let cpu_seconds = cpu_time_for(pid).unwrap_or(0.0);
    Ok(RUsage {
        cpu_seconds,
        peak_memory_bytes,
    })
}

/// Reads cumulative CPU seconds for `pid` from `/proc/<pid>/stat`.
fn cpu_time_for(pid: Option<u32>) -> Option<f64> {
    let pid = pid?;
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let after_comm = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // utime is field 14, stime field 15 counting from `pid` (field 1); after
    // stripping `pid (comm)` the remaining fields are 0-indexed from state.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let ticks_per_sec = 100u64;
    Some((utime + stime) as f64 / ticks_per_sec as f64)
}

/// Reads resident-set-size in bytes for `pid` from `/proc/<pid>/status`.
fn memory_rss_for(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

/// Polls a transient systemd scope's accounting attributes until the given
/// process exits, used instead of the `/proc` fallback when available.
pub async fn poll_scope_usage(scope_name: &str) -> Result<RUsage> {
    let output = Command::new("systemctl")
        .arg("--user")
        .arg("show")
        .arg(scope_name)
        .arg("--property=CPUUsageNSec,MemoryPeak")
        .output()
        .await
        .context("failed to query systemd scope accounting")?;
    let text = String::from_utf8_lossy(&output.stdout);
    let mut cpu_seconds = 0.0;
    let mut peak_memory_bytes = 0;
    for line in text.lines() {
        if let Some(ns) = line.strip_prefix("CPUUsageNSec=") {
            cpu_seconds = ns.parse::<f64>().unwrap_or(0.0) / 1_000_000_000.0;
        }
        if let Some(bytes) = line.strip_prefix("MemoryPeak=") {
            peak_memory_bytes = bytes.parse().unwrap_or(0);
        }
    }
    Ok(RUsage {
        cpu_seconds,
        peak_memory_bytes,
    })
}
