//! Narrow git-backed helpers: maintainer lookup from version-control
//! history, and changed-file queries between two revisions of the recipe
//! tree, used by the Config & Recipe Loader and Build Planner.
use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;

use crate::Maintainer;

/// Finds the author of the most recent commit that touched `path` (a
/// directory or file relative to the repository root), skipping commits
/// authored by `skip_author_name` (the bot's own commits, if any).
pub fn find_maintainer(repo: &git2::Repository, path: &str) -> Result<Option<Maintainer>> {
    find_maintainer_excluding(repo, path, None)
}

pub fn find_maintainer_excluding(
    repo: &git2::Repository,
    path: &str,
    skip_author_name: Option<&str>,
) -> Result<Option<Maintainer>> {
    let prefix = normalize_repo_relative(repo, path)?;

    let mut revwalk = repo.revwalk()?;
    revwalk.push_head()?;
    revwalk.set_sorting(git2::Sort::TIME)?;

    for oid in revwalk {
        let oid = oid?;
        let commit = repo.find_commit(oid)?;
        if touches_prefix(repo, &commit, &prefix)? {
            let author = commit.author();
            let name = author.name().unwrap_or("unknown").to_string();
            if skip_author_name == Some(name.as_str()) {
                continue;
            }
            return Ok(Some(Maintainer {
                name,
                email: author.email().map(str::to_string),
                github: None,
            }));
        }
    }
    Ok(None)
}

fn normalize_repo_relative(repo: &git2::Repository, path: &str) -> Result<String> {
    let workdir = repo
        .workdir()
        .context("repository has no working directory")?;
    let candidate = Path::new(path);
    let relative = candidate.strip_prefix(workdir).unwrap_or(candidate);
    Ok(relative.to_string_lossy().replace('\\', "/"))
}

fn touches_prefix(repo: &git2::Repository, commit: &git2::Commit, prefix: &str) -> Result<bool> {
    let tree = commit.tree()?;
    let parent_tree = commit.parent(0).ok().and_then(|p| p.tree().ok());
    let mut diff_opts = git2::DiffOptions::new();
    diff_opts.pathspec(prefix);
    let diff = repo.diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), Some(&mut diff_opts))?;
    Ok(diff.deltas().len() > 0)
}

/// Returns the set of top-level recipe directory names with at least one
/// changed path between `from` and `to` (both revspecs).
pub fn changed_pkgbases_between(
    repo: &git2::Repository,
    from: &str,
    to: &str,
) -> Result<HashSet<String>> {
    let from_tree = repo.revparse_single(from)?.peel_to_tree()?;
    let to_tree = repo.revparse_single(to)?.peel_to_tree()?;
    let diff = repo.diff_tree_to_tree(Some(&from_tree), Some(&to_tree), None)?;

    let mut pkgbases = HashSet::new();
    diff.foreach(
        &mut |delta, _| {
            for file in [delta.old_file(), delta.new_file()] {
                if let Some(path) = file.path() {
                    if let Some(first) = path.components().next() {
                        pkgbases.insert(first.as_os_str().to_string_lossy().to_string());
                    }
                }
            }
            true
        },
        None,
        None,
        None,
    )?;
    Ok(pkgbases)
}

fn pkgrel_regex() -> Regex {
    Regex::new(r#"(?m)^pkgrel\s*=\s*(\S+)\s*$"#).expect("valid regex")
}

/// Reads `pkgrel` out of `{pkgbase}/.SRCINFO` as it existed at `rev`.
pub fn read_pkgrel_at_revision(
    repo: &git2::Repository,
    pkgbase: &str,
    rev: &str,
) -> Result<Option<String>> {
    let tree = repo.revparse_single(rev)?.peel_to_tree()?;
    let entry_path = format!("{pkgbase}/.SRCINFO");
    let Ok(entry) = tree.get_path(Path::new(&entry_path)) else {
        return Ok(None);
    };
    let blob = repo.find_blob(entry.id())?;
    let content = String::from_utf8_lossy(blob.content());
    Ok(pkgrel_regex()
        .captures(&content)
        .map(|c| c[1].to_string()))
}

/// True when `pkgrel` (read from `.SRCINFO`) differs between the two
/// revisions, used by Build Planner rule 4.
pub fn pkgrel_changed(
    repo: &git2::Repository,
    pkgbase: &str,
    from: &str,
    to: &str,
) -> Result<bool> {
    let before = read_pkgrel_at_revision(repo, pkgbase, from)?;
    let after = read_pkgrel_at_revision(repo, pkgbase, to)?;
    Ok(before != after)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkgrel_regex_extracts_value() {
        let re = pkgrel_regex();
        let caps = re.captures("pkgbase = foo\npkgrel = 3\npkgver = 1.0\n").unwrap();
        assert_eq!(&caps[1], "3");
    }
}
