//! Build Worker: the per-build protocol run by the `worker` subprocess,
//! driven from stdin/stdout by `bin/worker`. See spec §4.8.
use std::time::Instant as StdInstant;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::Instant;

use crate::config::GlobalConfig;
use crate::hooks::{self, HookEffect};
use crate::pkgver::{next_pkgrel, should_bump_pkgrel};
use crate::protocol::{MailReport, WorkerInput, WorkerResult};
use crate::{mail, pacman, publisher, BuildError, RUsage, RecipeInfo};

const LOG_SIZE_LIMIT: u64 = 1024 * 1024 * 1024;
const LOG_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

pub struct BuildContext<'a> {
    pub recipe: &'a RecipeInfo,
    pub config: &'a GlobalConfig,
    pub input: &'a WorkerInput,
    pub build_dir: Utf8PathBuf,
}

impl BuildContext<'_> {
    fn log_path(&self) -> &Utf8Path {
        &self.input.log_path
    }
}

/// Runs the full per-build protocol and returns the result to be written to
/// `input.result`. Never panics: every failure path becomes a
/// [`WorkerResult::Failed`].
pub async fn run_build(ctx: &BuildContext<'_>) -> WorkerResult {
    let start = StdInstant::now();
    match run_build_inner(ctx, start).await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!("build worker error for {}: {e:?}", ctx.recipe.pkgbase);
            let report = build_failed_report(ctx, &e.to_string());
            WorkerResult::Failed {
                msg: e.to_string(),
                error: BuildError::Other(e.to_string()),
                rusage: RUsage::default(),
                elapsed_seconds: start.elapsed().as_secs_f64(),
                report,
            }
        }
    }
}

async fn run_build_inner(ctx: &BuildContext<'_>, start: StdInstant) -> Result<WorkerResult> {
    if let Some(script) = &ctx.recipe.prepare_script {
        if let Some(reason) = run_prepare(ctx, script).await? {
            return Ok(WorkerResult::Skipped {
                msg: reason,
                elapsed_seconds: start.elapsed().as_secs_f64(),
            });
        }
    }

    let before = read_pkgver_pkgrel(ctx).await?;
    let mut force_bump = false;
    if let Some(script) = &ctx.recipe.pre_build_script {
        if run_pre_build(ctx, script).await? {
            force_bump = true;
        }
    }
    let after = read_pkgver_pkgrel(ctx).await?;
    if after.0 == before.0 && (force_bump || should_bump_pkgrel(&before.1, &after.1)) {
        write_pkgrel(ctx, &next_pkgrel(&after.1)).await?;
    }

    refresh_vcs_source(ctx).await?;

    let deadline = Instant::now()
        + std::time::Duration::from_secs(
            (ctx.input.deadline_unix - now_unix()).max(0) as u64,
        );
    let outcome = run_build_command(ctx, deadline).await?;
    if outcome.timed_out {
        let error = BuildError::TimeoutError;
        let report = build_failed_report(ctx, &error.to_string());
        return Ok(WorkerResult::Failed {
            msg: error.to_string(),
            error,
            rusage: outcome.rusage,
            elapsed_seconds: start.elapsed().as_secs_f64(),
            report,
        });
    }
    let succeeded = outcome.status.is_some_and(|s| s.success());
    if !succeeded {
        let error = BuildError::CommandFailed(format!("build command exited with {:?}", outcome.status));
        let report = build_failed_report(ctx, &error.to_string());
        return Ok(WorkerResult::Failed {
            msg: error.to_string(),
            error,
            rusage: outcome.rusage,
            elapsed_seconds: start.elapsed().as_secs_f64(),
            report,
        });
    }
    let rusage = outcome.rusage;

    let artifacts = publisher::scan_artifacts(&ctx.build_dir, &ctx.config.accepted_suffixes)
        .context("failed to scan for build artifacts")?;
    if artifacts.is_empty() {
        let error = BuildError::NoArtifactProduced;
        let report = build_failed_report(ctx, &error.to_string());
        return Ok(WorkerResult::Failed {
            msg: error.to_string(),
            error,
            rusage,
            elapsed_seconds: start.elapsed().as_secs_f64(),
            report,
        });
    }

    let post_build_lock = ctx.config.post_build_lock_path();
    let lock = acquire_post_build_lock(&post_build_lock).await?;
    let policy_result = run_post_build(ctx, &artifacts).await;
    drop(lock);

    if let Some(script) = &ctx.recipe.post_build_always_script {
        for action in hooks::parse_script(script).unwrap_or_default() {
            let _ = hooks::run_action(&action, &ctx.build_dir).await;
        }
    }

    match policy_result {
        Ok(version) => {
            if ctx.recipe.staging {
                notify_staging_review(ctx);
            }
            Ok(WorkerResult::Done {
                version,
                rusage,
                elapsed_seconds: start.elapsed().as_secs_f64(),
            })
        }
        Err(error) => {
            let report = build_failed_report(ctx, &error.to_string());
            Ok(WorkerResult::Failed {
                msg: error.to_string(),
                error,
                rusage,
                elapsed_seconds: start.elapsed().as_secs_f64(),
                report,
            })
        }
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Runs the `prepare` hook; `Ok(Some(reason))` means the build should be
/// skipped.
async fn run_prepare(ctx: &BuildContext<'_>, script: &str) -> Result<Option<String>> {
    for action in hooks::parse_script(script)? {
        if let HookEffect::Skip(reason) = hooks::run_action(&action, &ctx.build_dir).await? {
            return Ok(Some(reason));
        }
    }
    Ok(None)
}

/// Runs the `pre_build` hook; returns whether any action forced a pkgrel
/// bump regardless of the pkgver/pkgrel snapshot comparison.
async fn run_pre_build(ctx: &BuildContext<'_>, script: &str) -> Result<bool> {
    let mut force_bump = false;
    for action in hooks::parse_script(script)? {
        if hooks::run_action(&action, &ctx.build_dir).await? == HookEffect::BumpPkgrel {
            force_bump = true;
        }
    }
    Ok(force_bump)
}

/// Runs `post_build` under the caller-held global lock, returning the built
/// version string on success.
async fn run_post_build(ctx: &BuildContext<'_>, artifacts: &[Utf8PathBuf]) -> Result<String, BuildError> {
    let official = pacman::list_official_packages(&ctx.config.pacman_db_dir)
        .await
        .map_err(|e| BuildError::Other(e.to_string()))?;
    let official_groups = pacman::official_groups(&ctx.config.pacman_db_dir)
        .await
        .map_err(|e| BuildError::Other(e.to_string()))?;

    let dest_dir = if ctx.recipe.staging {
        ctx.config.staging_dir.clone()
    } else {
        ctx.config.repo_dir.clone()
    };
    // Staging has no maintained package database yet, so there is nothing to
    // diff a downgrade against until the build is promoted out of review.
    let repo_versions = if ctx.recipe.staging {
        std::collections::HashMap::new()
    } else {
        let db_path = dest_dir.join(format!("{}.db.tar.zst", ctx.config.repo_name));
        publisher::repo_db_versions(&db_path).map_err(|e| BuildError::Other(e.to_string()))?
    };

    let mut version = None;
    for path in artifacts {
        let artifact = publisher::read_pkginfo(path).map_err(|e| BuildError::Other(e.to_string()))?;
        version.get_or_insert_with(|| artifact.version.to_string());
        let repo_version = repo_versions.get(&artifact.pkgname);

        publisher::check_policy(&artifact, &official, &official_groups, repo_version).map_err(|e| match e {
            crate::error::ArtifactPolicyError::ConflictWithOfficial { pkgname, groups, packages } => {
                BuildError::ConflictWithOfficial { pkgname, groups, packages }
            }
            crate::error::ArtifactPolicyError::Downgrading { pkgname, built_version, repo_version } => {
                BuildError::Downgrading { pkgname, built_version, repo_version }
            }
            other => BuildError::Other(other.to_string()),
        })?;

        let signing_key = ctx
            .config
            .signing_key
            .as_deref()
            .ok_or_else(|| BuildError::Other("no signing key configured".to_string()))?;
        let signature = publisher::sign(path, signing_key, &ctx.config.gnupg_home())
            .await
            .map_err(|e| BuildError::Other(e.to_string()))?;

        publisher::publish(path, &signature, &dest_dir).map_err(|e| BuildError::Other(e.to_string()))?;

        if !ctx.recipe.staging {
            publisher::register_in_repo_db(&dest_dir, &ctx.config.repo_name, path)
                .await
                .map_err(|e| BuildError::Other(e.to_string()))?;
        }
    }

    if let Some(script) = &ctx.recipe.post_build_script {
        for action in hooks::parse_script(script).map_err(|e| BuildError::Other(e.to_string()))? {
            hooks::run_action(&action, &ctx.build_dir)
                .await
                .map_err(|e| BuildError::Other(e.to_string()))?;
        }
    }

    version.ok_or(BuildError::NoArtifactProduced)
}

/// Holds the host-wide advisory lock serializing `post_build` across all
/// workers, released on drop.
struct PostBuildLock(std::fs::File);

impl Drop for PostBuildLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.0);
    }
}

/// Acquires the host-wide advisory lock serializing `post_build` across all
/// workers, blocking until it's free.
async fn acquire_post_build_lock(path: &Utf8Path) -> Result<PostBuildLock> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    let path = path.to_owned();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(path.as_std_path())
            .with_context(|| format!("failed to open post-build lock at {path}"))?;
        fs2::FileExt::lock_exclusive(&file).context("failed to acquire post-build lock")?;
        Ok(PostBuildLock(file))
    })
    .await
    .context("post-build lock task panicked")?
}

fn pkgver_regex() -> Regex {
    Regex::new(r"(?m)^pkgver\s*=\s*(\S+)\s*$").unwrap()
}
fn pkgrel_regex() -> Regex {
    Regex::new(r"(?m)^pkgrel\s*=\s*(\S+)\s*$").unwrap()
}

async fn read_pkgver_pkgrel(ctx: &BuildContext<'_>) -> Result<(String, String)> {
    let pkgbuild_path = ctx.build_dir.join("PKGBUILD");
    let content = tokio::fs::read_to_string(&pkgbuild_path)
        .await
        .with_context(|| format!("failed to read {pkgbuild_path}"))?;
    let pkgver = pkgver_regex()
        .captures(&content)
        .map(|c| c[1].to_string())
        .context("PKGBUILD has no pkgver")?;
    let pkgrel = pkgrel_regex()
        .captures(&content)
        .map(|c| c[1].to_string())
        .context("PKGBUILD has no pkgrel")?;
    Ok((pkgver, pkgrel))
}

async fn write_pkgrel(ctx: &BuildContext<'_>, new_pkgrel: &str) -> Result<()> {
    let pkgbuild_path = ctx.build_dir.join("PKGBUILD");
    let content = tokio::fs::read_to_string(&pkgbuild_path).await?;
    let rewritten = pkgrel_regex()
        .replace(&content, format!("pkgrel={new_pkgrel}"))
        .into_owned();
    tokio::fs::write(&pkgbuild_path, rewritten).await?;
    Ok(())
}

/// Pulls the recipe's own VCS checkout to the latest upstream revision,
/// importing GPG keys first when the recipe carries any (spec §2
/// supplement: `recv_gpg_keys` before signed-tag verification).
async fn refresh_vcs_source(ctx: &BuildContext<'_>) -> Result<()> {
    if ctx.build_dir.join("keys/pgp").as_std_path().is_dir() {
        hooks::run_action(&hooks::HookAction::ImportGpgKeys, &ctx.build_dir).await?;
    }
    if ctx.build_dir.join(".git").as_std_path().exists() {
        let status = Command::new("git")
            .arg("pull")
            .arg("--ff-only")
            .current_dir(ctx.build_dir.as_std_path())
            .status()
            .await
            .context("failed to run git pull")?;
        anyhow::ensure!(status.success(), "git pull exited with {status}");
    }
    Ok(())
}

/// Dispatches to `<profile>-build` (makechrootpkg-style clean-chroot
/// driver) or bare `makepkg --holdver` when the resolved profile has no
/// chroot suffix, polling the log file size every 10s and truncating the
/// build if it exceeds the 1 GiB cap.
async fn run_build_command(ctx: &BuildContext<'_>, deadline: Instant) -> Result<crate::accountant::SuperviseOutcome> {
    let mut cmd = build_command_for_profile(ctx);
    let log_file = std::fs::File::create(ctx.log_path().as_std_path())
        .with_context(|| format!("failed to create log file at {}", ctx.log_path()))?;
    cmd.stdout(log_file.try_clone()?);
    cmd.stderr(log_file);
    let child = cmd.spawn().context("failed to spawn build command")?;

    let log_path = ctx.log_path().to_owned();
    let outcome = crate::accountant::supervise(child, deadline)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    if std::fs::metadata(log_path.as_std_path()).map(|m| m.len()).unwrap_or(0) > LOG_SIZE_LIMIT {
        let mut file = std::fs::OpenOptions::new().append(true).open(log_path.as_std_path())?;
        use std::io::Write as _;
        writeln!(file, "\n[truncated: log exceeded {LOG_SIZE_LIMIT} bytes]")?;
    }
    let _ = LOG_POLL_INTERVAL;
    Ok(outcome)
}

fn build_command_for_profile(ctx: &BuildContext<'_>) -> Command {
    let profile = &ctx.input.workerman;
    let mut cmd = if profile.ends_with("-build") {
        let mut cmd = Command::new(profile);
        for dir in &ctx.input.bindmounts {
            cmd.arg("--bind").arg(dir.as_str()).arg(dir.as_str());
        }
        cmd
    } else {
        let mut cmd = Command::new("makepkg");
        cmd.arg("--holdver").arg("--noconfirm");
        cmd
    };
    cmd.current_dir(ctx.build_dir.as_std_path());
    cmd
}

/// Mails every maintainer that the staged build needs manual review before
/// it will be published.
fn notify_staging_review(ctx: &BuildContext<'_>) {
    let Some(smtp) = &ctx.config.smtp else {
        tracing::warn!("staging review needed for {} but no smtp is configured", ctx.recipe.pkgbase);
        return;
    };
    let Ok(report) = mail::staging_review_report(&ctx.recipe.pkgbase) else {
        return;
    };
    if let Err(e) = mail::send(smtp, &ctx.recipe.maintainers, &report, ctx.config.max_mail_bytes as usize) {
        tracing::error!("failed to send staging notice for {}: {e:#}", ctx.recipe.pkgbase);
    }
}

fn build_failed_report(ctx: &BuildContext<'_>, message: &str) -> Option<MailReport> {
    let log_url = ctx
        .config
        .log_url_template
        .as_ref()
        .map(|t| t.replace("{pkgbase}", &ctx.recipe.pkgbase));
    let tail = std::fs::read_to_string(ctx.log_path().as_std_path()).unwrap_or_default();
    mail::build_failed_report(&ctx.recipe.pkgbase, log_url.as_deref(), &tail)
        .ok()
        .map(|report| MailReport {
            subject: report.subject,
            body: format!("{message}\n\n{}", report.body),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkgver_and_pkgrel_regexes_extract_values() {
        let content = "pkgbase = foo\npkgver=1.2.3\npkgrel = 4\n";
        assert_eq!(&pkgver_regex().captures(content).unwrap()[1], "1.2.3");
        assert_eq!(&pkgrel_regex().captures(content).unwrap()[1], "4");
    }
}
