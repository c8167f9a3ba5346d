//! Read-only pacman adapter: queries the pacman database for official-repo
//! membership and version comparison, shelling out rather than linking
//! libalpm.
use std::collections::HashSet;

use anyhow::{Context, Result};
use camino::Utf8Path;
use tokio::process::Command;

use crate::pkgver::PkgVers;

/// A package already present in a repository, as reported by `pacman -Sl`/
/// `pacman -Qi`-style queries against a database directory.
#[derive(Debug, Clone)]
pub struct InstalledPackage {
    pub name: String,
    pub version: PkgVers,
    pub groups: Vec<String>,
}

/// Lists every package known to the official repositories mirrored under
/// `db_dir`, via `pacman --dbpath <db_dir> -Sl`.
pub async fn list_official_packages(db_dir: &Utf8Path) -> Result<Vec<InstalledPackage>> {
    let output = Command::new("pacman")
        .arg("--dbpath")
        .arg(db_dir.as_str())
        .arg("-Sl")
        .output()
        .await
        .context("failed to run pacman -Sl")?;
    anyhow::ensure!(output.status.success(), "pacman -Sl exited with {}", output.status);

    let text = String::from_utf8_lossy(&output.stdout);
    let mut packages = Vec::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let Some(_repo) = fields.next() else { continue };
        let Some(name) = fields.next() else { continue };
        let Some(version) = fields.next() else { continue };
        let Ok(version) = version.parse::<PkgVers>() else {
            continue;
        };
        packages.push(InstalledPackage {
            name: name.to_string(),
            version,
            groups: Vec::new(),
        });
    }
    Ok(packages)
}

/// Official group membership, via `pacman --dbpath <db_dir> -Sg`.
pub async fn official_groups(db_dir: &Utf8Path) -> Result<std::collections::HashMap<String, HashSet<String>>> {
    let output = Command::new("pacman")
        .arg("--dbpath")
        .arg(db_dir.as_str())
        .arg("-Sg")
        .output()
        .await
        .context("failed to run pacman -Sg")?;
    anyhow::ensure!(output.status.success(), "pacman -Sg exited with {}", output.status);

    let text = String::from_utf8_lossy(&output.stdout);
    let mut groups: std::collections::HashMap<String, HashSet<String>> = std::collections::HashMap::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let (Some(group), Some(pkgname)) = (fields.next(), fields.next()) else {
            continue;
        };
        groups.entry(group.to_string()).or_default().insert(pkgname.to_string());
    }
    Ok(groups)
}

/// Refreshes the mirrored pacman database directory, via
/// `pacman --dbpath <db_dir> -Sy`.
pub async fn sync_db(db_dir: &Utf8Path) -> Result<()> {
    let status = Command::new("pacman")
        .arg("--dbpath")
        .arg(db_dir.as_str())
        .arg("-Sy")
        .status()
        .await
        .context("failed to run pacman -Sy")?;
    anyhow::ensure!(status.success(), "pacman -Sy exited with {status}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sl_output_lines() {
        let line = "core linux 6.6.1-1";
        let mut fields = line.split_whitespace();
        let _repo = fields.next();
        let name = fields.next().unwrap();
        let version: PkgVers = fields.next().unwrap().parse().unwrap();
        assert_eq!(name, "linux");
        assert_eq!(version.pkgver, "6.6.1");
    }
}
