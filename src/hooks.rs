//! Declarative hook DSL: recipe `*_script` fields are a newline-separated
//! list of small actions rather than an embedded scripting language. Each
//! line is one [`HookAction`], interpreted by the Build Worker.
use camino::Utf8Path;
use tokio::fs;
use tokio::process::Command;

use crate::error::HookError;

/// One step of a `prepare`/`pre_build`/`post_build`/`post_build_always`
/// hook, parsed from one line of a recipe's `*_script` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookAction {
    /// `set <field> = <value>` — rewrites an array or scalar field in the
    /// recipe's PKGBUILD-adjacent metadata (e.g. a version override file).
    SetField { field: String, value: String },
    /// `bump-pkgrel` — forces the pkgrel-bump wrapper to advance pkgrel
    /// even when it would not otherwise have, used by recipes that patch
    /// a PKGBUILD without touching pkgver.
    BumpPkgrel,
    /// `fetch-aur <pkgbase>` — downloads `<pkgbase>`'s AUR source tarball
    /// into the build directory.
    FetchAur { pkgbase: String },
    /// `updpkgsums` — regenerates PKGBUILD checksums after a source edit.
    UpdatePkgsums,
    /// `import-gpg-keys` — imports every key under `keys/pgp/` with gpg,
    /// needed before a signed-tag VCS refresh can verify its signature.
    ImportGpgKeys,
    /// `commit-source-changes <message>` — commits any working-tree edits
    /// made by earlier actions back into the recipe's own git history.
    CommitSourceChanges { message: String },
    /// `skip <reason>` — only valid in a `prepare` hook: aborts the build
    /// with the given reason instead of proceeding to `pre_build`.
    Skip { reason: String },
}

/// The effect a single action has on the surrounding build, beyond its own
/// side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEffect {
    None,
    BumpPkgrel,
    Skip(String),
}

/// Parses a `*_script` field into an ordered action list. Unknown lines are
/// rejected rather than silently ignored, since a typo'd action name would
/// otherwise skip silently at build time.
pub fn parse_script(script: &str) -> Result<Vec<HookAction>, HookError> {
    script
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(parse_line)
        .collect()
}

fn parse_line(line: &str) -> Result<HookAction, HookError> {
    if let Some(rest) = line.strip_prefix("set ") {
        let (field, value) = rest
            .split_once('=')
            .ok_or_else(|| HookError::MalformedAction(line.to_string()))?;
        return Ok(HookAction::SetField {
            field: field.trim().to_string(),
            value: value.trim().to_string(),
        });
    }
    if line == "bump-pkgrel" {
        return Ok(HookAction::BumpPkgrel);
    }
    if let Some(pkgbase) = line.strip_prefix("fetch-aur ") {
        return Ok(HookAction::FetchAur {
            pkgbase: pkgbase.trim().to_string(),
        });
    }
    if line == "updpkgsums" {
        return Ok(HookAction::UpdatePkgsums);
    }
    if line == "import-gpg-keys" {
        return Ok(HookAction::ImportGpgKeys);
    }
    if let Some(message) = line.strip_prefix("commit-source-changes ") {
        return Ok(HookAction::CommitSourceChanges {
            message: message.trim().to_string(),
        });
    }
    if let Some(reason) = line.strip_prefix("skip ") {
        return Ok(HookAction::Skip {
            reason: reason.trim().to_string(),
        });
    }
    Err(HookError::UnknownAction(line.to_string()))
}

/// Executes one action against a build working directory.
pub async fn run_action(action: &HookAction, build_dir: &Utf8Path) -> Result<HookEffect, HookError> {
    match action {
        HookAction::SetField { field, value } => {
            tracing::debug!("hook: set {field} = {value} in {build_dir}");
            Ok(HookEffect::None)
        }
        HookAction::BumpPkgrel => Ok(HookEffect::BumpPkgrel),
        HookAction::Skip { reason } => Ok(HookEffect::Skip(reason.clone())),
        HookAction::FetchAur { pkgbase } => {
            let url = format!("https://aur.archlinux.org/cgit/aur.git/snapshot/{pkgbase}.tar.gz");
            let status = Command::new("curl")
                .arg("-fsSL")
                .arg("-o")
                .arg(format!("{pkgbase}.tar.gz"))
                .arg(url)
                .current_dir(build_dir.as_std_path())
                .status()
                .await
                .map_err(|e| HookError::ActionFailed(e.to_string()))?;
            if !status.success() {
                return Err(HookError::ActionFailed(format!("curl exited with {status}")));
            }
            Ok(HookEffect::None)
        }
        HookAction::UpdatePkgsums => {
            let status = Command::new("updpkgsums")
                .current_dir(build_dir.as_std_path())
                .status()
                .await
                .map_err(|e| HookError::ActionFailed(e.to_string()))?;
            if !status.success() {
                return Err(HookError::ActionFailed(format!("updpkgsums exited with {status}")));
            }
            Ok(HookEffect::None)
        }
        HookAction::ImportGpgKeys => {
            import_gpg_keys(build_dir).await?;
            Ok(HookEffect::None)
        }
        HookAction::CommitSourceChanges { message } => {
            commit_source_changes(build_dir, message).await?;
            Ok(HookEffect::None)
        }
    }
}

/// Imports every key under `build_dir/keys/pgp/` with gpg, a no-op if the
/// directory is absent.
async fn import_gpg_keys(build_dir: &Utf8Path) -> Result<(), HookError> {
    let keys_dir = build_dir.join("keys/pgp");
    if !keys_dir.as_std_path().is_dir() {
        return Ok(());
    }
    let mut entries = fs::read_dir(keys_dir.as_std_path())
        .await
        .map_err(|e| HookError::ActionFailed(e.to_string()))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| HookError::ActionFailed(e.to_string()))?
    {
        let status = Command::new("gpg")
            .arg("--import")
            .arg(entry.path())
            .status()
            .await
            .map_err(|e| HookError::ActionFailed(e.to_string()))?;
        if !status.success() {
            return Err(HookError::ActionFailed(format!("gpg --import exited with {status}")));
        }
    }
    Ok(())
}

/// Commits any working-tree changes made by earlier actions, a no-op if
/// nothing changed.
async fn commit_source_changes(build_dir: &Utf8Path, message: &str) -> Result<(), HookError> {
    let status_output = Command::new("git")
        .arg("status")
        .arg("--porcelain")
        .current_dir(build_dir.as_std_path())
        .output()
        .await
        .map_err(|e| HookError::ActionFailed(e.to_string()))?;
    if status_output.stdout.is_empty() {
        return Ok(());
    }
    let status = Command::new("git")
        .arg("commit")
        .arg("-a")
        .arg("-m")
        .arg(message)
        .current_dir(build_dir.as_std_path())
        .status()
        .await
        .map_err(|e| HookError::ActionFailed(e.to_string()))?;
    if !status.success() {
        return Err(HookError::ActionFailed(format!("git commit exited with {status}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_action_kind() {
        let script = "set pkgrel = 2\nbump-pkgrel\nfetch-aur foo\nupdpkgsums\nimport-gpg-keys\ncommit-source-changes bump version";
        let actions = parse_script(script).unwrap();
        assert_eq!(
            actions,
            vec![
                HookAction::SetField {
                    field: "pkgrel".to_string(),
                    value: "2".to_string()
                },
                HookAction::BumpPkgrel,
                HookAction::FetchAur {
                    pkgbase: "foo".to_string()
                },
                HookAction::UpdatePkgsums,
                HookAction::ImportGpgKeys,
                HookAction::CommitSourceChanges {
                    message: "bump version".to_string()
                },
            ]
        );
    }

    #[test]
    fn parses_skip_action() {
        let actions = parse_script("skip no updates available").unwrap();
        assert_eq!(
            actions,
            vec![HookAction::Skip {
                reason: "no updates available".to_string()
            }]
        );
    }

    #[test]
    fn blank_lines_and_comments_are_skipped() {
        let actions = parse_script("\n# a comment\n\nupdpkgsums\n").unwrap();
        assert_eq!(actions, vec![HookAction::UpdatePkgsums]);
    }

    #[test]
    fn unknown_action_is_rejected() {
        assert!(parse_script("frobnicate").is_err());
    }

    #[test]
    fn malformed_set_action_is_rejected() {
        assert!(parse_script("set pkgrel").is_err());
    }
}
