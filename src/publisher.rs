//! Artifact Publisher: verifies a successful build's output against policy,
//! signs it, and hard-links it into the managed repository.
use std::collections::{HashMap, HashSet};
use std::io::Read;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use tokio::process::Command;

use crate::error::ArtifactPolicyError;
use crate::pacman::InstalledPackage;
use crate::pkgver::PkgVers;

/// One file produced by a build, matched against `accepted_suffixes`.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: Utf8PathBuf,
    pub pkgname: String,
    pub version: PkgVers,
    pub provides: Vec<String>,
    pub replaces: Vec<String>,
}

/// Scans `dir` for files whose name ends in one of `accepted_suffixes`.
pub fn scan_artifacts(dir: &Utf8Path, accepted_suffixes: &[String]) -> std::io::Result<Vec<Utf8PathBuf>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir.as_std_path())? {
        let entry = entry?;
        let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
            continue;
        };
        if accepted_suffixes.iter().any(|suffix| path.as_str().ends_with(suffix.as_str())) {
            found.push(path);
        }
    }
    Ok(found)
}

/// Opens a build artifact (`.pkg.tar.zst`/`.pkg.tar.xz`/plain `.pkg.tar`) as
/// a tar reader, transparently decompressing by suffix.
fn open_pkg_tar(path: &Utf8Path) -> Result<tar::Archive<Box<dyn Read>>, ArtifactPolicyError> {
    let file = std::fs::File::open(path.as_std_path())?;
    let reader: Box<dyn Read> = if path.as_str().ends_with(".zst") {
        Box::new(zstd::stream::read::Decoder::new(file).map_err(|e| ArtifactPolicyError::Metadata(e.to_string()))?)
    } else if path.as_str().ends_with(".xz") {
        Box::new(xz2::read::XzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(tar::Archive::new(reader))
}

/// Parses a `.PKGINFO`/`desc`-style key/value block (`key = value` lines,
/// blank lines separate records, a key may repeat for multi-valued fields)
/// into a multimap preserving the order each key was first seen.
fn parse_keyval_block(content: &str) -> HashMap<String, Vec<String>> {
    let mut fields: HashMap<String, Vec<String>> = HashMap::new();
    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        fields.entry(key.trim().to_string()).or_default().push(value.trim().to_string());
    }
    fields
}

/// Reads the built package's embedded `.PKGINFO` and returns its pkgname,
/// version, and `provides`/`replaces` entries, the authoritative source for
/// policy checks (a filename alone can't disambiguate a dashed pkgname from
/// its version segments).
pub fn read_pkginfo(path: &Utf8Path) -> Result<Artifact, ArtifactPolicyError> {
    let mut archive = open_pkg_tar(path)?;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.to_path_buf();
        if entry_path != std::path::Path::new(".PKGINFO") {
            continue;
        }
        let mut content = String::new();
        entry.read_to_string(&mut content)?;
        let fields = parse_keyval_block(&content);
        let pkgname = fields
            .get("pkgname")
            .and_then(|v| v.first())
            .ok_or_else(|| ArtifactPolicyError::Metadata(format!("{path}: .PKGINFO has no pkgname")))?
            .clone();
        let version = fields
            .get("pkgver")
            .and_then(|v| v.first())
            .ok_or_else(|| ArtifactPolicyError::Metadata(format!("{path}: .PKGINFO has no pkgver")))?
            .parse::<PkgVers>()
            .map_err(|e| ArtifactPolicyError::Metadata(e.to_string()))?;
        return Ok(Artifact {
            path: path.to_owned(),
            pkgname,
            version,
            provides: fields.get("provides").cloned().unwrap_or_default(),
            replaces: fields.get("replaces").cloned().unwrap_or_default(),
        });
    }
    Err(ArtifactPolicyError::Metadata(format!("{path}: no .PKGINFO entry found")))
}

/// Reads the repository's own package database and returns the currently
/// published version of every package it lists, keyed by pkgname. Returns an
/// empty map if the database doesn't exist yet (first publish into a fresh
/// repository).
pub fn repo_db_versions(db_path: &Utf8Path) -> Result<HashMap<String, PkgVers>, ArtifactPolicyError> {
    let mut versions = HashMap::new();
    let file = match std::fs::File::open(db_path.as_std_path()) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(versions),
        Err(e) => return Err(e.into()),
    };
    let decoder = zstd::stream::read::Decoder::new(file).map_err(|e| ArtifactPolicyError::Metadata(e.to_string()))?;
    let mut archive = tar::Archive::new(decoder);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.to_path_buf();
        if entry_path.file_name().and_then(|n| n.to_str()) != Some("desc") {
            continue;
        }
        let mut content = String::new();
        entry.read_to_string(&mut content)?;
        let fields = parse_desc_block(&content);
        let (Some(name), Some(version)) = (fields.get("NAME"), fields.get("VERSION")) else {
            continue;
        };
        if let Ok(version) = version.parse::<PkgVers>() {
            versions.insert(name.clone(), version);
        }
    }
    Ok(versions)
}

/// Parses a pacman repo database `desc` file: `%KEY%` on its own line,
/// followed by one or more value lines, entries separated by a blank line.
fn parse_desc_block(content: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let mut lines = content.lines().peekable();
    while let Some(line) = lines.next() {
        let Some(key) = line.strip_prefix('%').and_then(|l| l.strip_suffix('%')) else {
            continue;
        };
        let mut values = Vec::new();
        while let Some(value_line) = lines.peek() {
            if value_line.is_empty() {
                break;
            }
            values.push(lines.next().unwrap().to_string());
        }
        fields.insert(key.to_string(), values.join("\n"));
    }
    fields
}

fn soname_version_regex() -> Regex {
    Regex::new(r"\.so(\.\d+)+$").unwrap()
}

/// Rejects artifacts that would replace or shadow an official package,
/// downgrade the repository's version, or provide an unversioned `.so`.
pub fn check_policy(
    artifact: &Artifact,
    official: &[InstalledPackage],
    official_groups: &std::collections::HashMap<String, HashSet<String>>,
    repo_version: Option<&PkgVers>,
) -> Result<(), ArtifactPolicyError> {
    for replaced in &artifact.replaces {
        if official.iter().any(|p| &p.name == replaced) {
            return Err(ArtifactPolicyError::ConflictWithOfficial {
                pkgname: artifact.pkgname.clone(),
                groups: vec![],
                packages: vec![replaced.clone()],
            });
        }
    }
    for (group, members) in official_groups {
        if members.contains(&artifact.pkgname) {
            return Err(ArtifactPolicyError::ConflictWithOfficial {
                pkgname: artifact.pkgname.clone(),
                groups: vec![group.clone()],
                packages: vec![],
            });
        }
    }

    if let Some(repo_version) = repo_version {
        if artifact.version < *repo_version {
            return Err(ArtifactPolicyError::Downgrading {
                pkgname: artifact.pkgname.clone(),
                built_version: artifact.version.to_string(),
                repo_version: repo_version.to_string(),
            });
        }
    }

    let soname_re = soname_version_regex();
    for provide in &artifact.provides {
        let is_soname = provide.contains(".so") && !provide.ends_with(".so");
        let looks_bare_so = provide.ends_with(".so");
        if looks_bare_so || (is_soname && !soname_re.is_match(provide)) {
            return Err(ArtifactPolicyError::SigningFailed(format!(
                "unversioned soname provides entry: {provide}"
            )));
        }
    }

    Ok(())
}

/// Signs `artifact` with `signing_key` using an empty-passphrase loopback,
/// producing a detached `.sig` next to it.
pub async fn sign(artifact: &Utf8Path, signing_key: &str, gnupg_home: &Utf8Path) -> Result<Utf8PathBuf, ArtifactPolicyError> {
    let sig_path = Utf8PathBuf::from(format!("{artifact}.sig"));
    let status = Command::new("gpg")
        .arg("--homedir")
        .arg(gnupg_home.as_str())
        .arg("--batch")
        .arg("--yes")
        .arg("--pinentry-mode")
        .arg("loopback")
        .arg("--passphrase")
        .arg("")
        .arg("--local-user")
        .arg(signing_key)
        .arg("--detach-sign")
        .arg("--output")
        .arg(sig_path.as_str())
        .arg(artifact.as_str())
        .status()
        .await
        .map_err(|e| ArtifactPolicyError::SigningFailed(e.to_string()))?;
    if !status.success() {
        return Err(ArtifactPolicyError::SigningFailed(format!("gpg exited with {status}")));
    }
    Ok(sig_path)
}

/// Hard-links `artifact` and its signature into `dest_dir` (the repository
/// directory, or its `staging` subdirectory). Collisions with an existing
/// hard-link are treated as already-published, not an error.
pub fn publish(artifact: &Utf8Path, signature: &Utf8Path, dest_dir: &Utf8Path) -> Result<(), ArtifactPolicyError> {
    std::fs::create_dir_all(dest_dir.as_std_path())?;
    for source in [artifact, signature] {
        let dest = dest_dir.join(source.file_name().unwrap_or_default());
        match std::fs::hard_link(source.as_std_path(), dest.as_std_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(ArtifactPolicyError::Io(e)),
        }
    }
    Ok(())
}

/// Registers `artifact` in the directory's pacman database via `repo-add`.
pub async fn register_in_repo_db(repo_dir: &Utf8Path, db_name: &str, artifact: &Utf8Path) -> Result<(), ArtifactPolicyError> {
    let db_path = repo_dir.join(format!("{db_name}.db.tar.zst"));
    let status = Command::new("repo-add")
        .arg(db_path.as_str())
        .arg(artifact.as_str())
        .status()
        .await
        .map_err(|e| ArtifactPolicyError::SigningFailed(e.to_string()))?;
    if !status.success() {
        return Err(ArtifactPolicyError::SigningFailed(format!("repo-add exited with {status}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(pkgname: &str, provides: Vec<&str>) -> Artifact {
        Artifact {
            path: "foo-1.0-1-x86_64.pkg.tar.zst".into(),
            pkgname: pkgname.to_string(),
            version: PkgVers::new(0, "1.0", "1"),
            provides: provides.into_iter().map(String::from).collect(),
            replaces: vec![],
        }
    }

    #[test]
    fn rejects_unversioned_soname_provides() {
        let a = artifact("foo", vec!["libfoo.so"]);
        let err = check_policy(&a, &[], &Default::default(), None);
        assert!(err.is_err());
    }

    #[test]
    fn accepts_versioned_soname_provides() {
        let a = artifact("foo", vec!["libfoo.so.1.2"]);
        assert!(check_policy(&a, &[], &Default::default(), None).is_ok());
    }

    #[test]
    fn rejects_downgrade() {
        let a = artifact("foo", vec![]);
        let repo_version = PkgVers::new(0, "2.0", "1");
        let err = check_policy(&a, &[], &Default::default(), Some(&repo_version));
        assert!(matches!(err, Err(ArtifactPolicyError::Downgrading { .. })));
    }

    #[test]
    fn rejects_conflict_with_official_package() {
        let mut a = artifact("foo", vec![]);
        a.replaces = vec!["bar".to_string()];
        let official = vec![InstalledPackage {
            name: "bar".to_string(),
            version: PkgVers::new(0, "1.0", "1"),
            groups: vec![],
        }];
        let err = check_policy(&a, &official, &Default::default(), None);
        assert!(matches!(err, Err(ArtifactPolicyError::ConflictWithOfficial { .. })));
    }

    #[test]
    fn parse_keyval_block_collects_repeated_keys() {
        let content = "pkgname = foo\npkgver = 1.0-1\nprovides = libfoo.so.1\nprovides = bar\n";
        let fields = parse_keyval_block(content);
        assert_eq!(fields.get("pkgname").unwrap(), &vec!["foo".to_string()]);
        assert_eq!(fields.get("provides").unwrap(), &vec!["libfoo.so.1".to_string(), "bar".to_string()]);
    }

    #[test]
    fn parse_desc_block_reads_multiline_records() {
        let content = "%NAME%\nfoo\n\n%VERSION%\n1.0-1\n\n";
        let fields = parse_desc_block(content);
        assert_eq!(fields.get("NAME").unwrap(), "foo");
        assert_eq!(fields.get("VERSION").unwrap(), "1.0-1");
    }

    fn write_tar_zst(dir: &Utf8Path, file_name: &str, entry_path: &str, entry_content: &str) -> Utf8PathBuf {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(entry_content.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, entry_path, entry_content.as_bytes()).unwrap();
        let tar_bytes = builder.into_inner().unwrap();
        let compressed = zstd::stream::encode_all(&tar_bytes[..], 0).unwrap();
        let path = dir.join(file_name);
        std::fs::write(path.as_std_path(), compressed).unwrap();
        path
    }

    #[test]
    fn read_pkginfo_extracts_metadata_from_package_archive() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        let pkginfo = "pkgname = foo-bar\npkgver = 1:2.0-3\nprovides = libfoo.so.1\nreplaces = foo-bar-old\n";
        let path = write_tar_zst(&dir, "foo-bar-2.0-3-x86_64.pkg.tar.zst", ".PKGINFO", pkginfo);

        let artifact = read_pkginfo(&path).unwrap();
        assert_eq!(artifact.pkgname, "foo-bar");
        assert_eq!(artifact.version, PkgVers::new(1, "2.0", "3"));
        assert_eq!(artifact.provides, vec!["libfoo.so.1".to_string()]);
        assert_eq!(artifact.replaces, vec!["foo-bar-old".to_string()]);
    }

    #[test]
    fn repo_db_versions_reads_desc_entries() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        let desc = "%NAME%\nfoo\n\n%VERSION%\n1.1-1\n\n";
        let path = write_tar_zst(&dir, "repo.db.tar.zst", "foo-1.1-1/desc", desc);

        let versions = repo_db_versions(&path).unwrap();
        assert_eq!(versions.get("foo").unwrap(), &PkgVers::new(0, "1.1", "1"));
    }

    #[test]
    fn repo_db_versions_missing_db_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        let versions = repo_db_versions(&dir.join("nonexistent.db.tar.zst")).unwrap();
        assert!(versions.is_empty());
    }
}
