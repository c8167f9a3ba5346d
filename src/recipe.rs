//! Config & Recipe Loader: walks the recipe tree and parses `recipe.toml`
//! files into [`RecipeInfo`] records.
use std::collections::HashMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::error::RecipeLoadError;
use crate::git::find_maintainer;
use crate::{Dependency, Maintainer, OnBuildTrigger, Pkgbase, RecipeInfo, ThrottleSeconds, UpdateOnEntry};

pub const RECIPE_FILE_NAME: &str = "recipe.toml";

#[derive(Debug, Deserialize)]
struct RawMaintainer {
    name: Option<String>,
    email: Option<String>,
    github: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawDependency {
    Simple(String),
    Mapped(HashMap<String, String>),
}

impl RawDependency {
    fn into_dependency(self) -> Option<Dependency> {
        match self {
            RawDependency::Simple(name) => Some(Dependency {
                pkgbase: name.clone(),
                pkgname: name,
            }),
            RawDependency::Mapped(map) => {
                let (pkgbase, pkgname) = map.into_iter().next()?;
                Some(Dependency { pkgbase, pkgname })
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawOnBuildTrigger {
    pkgbase: String,
    from_pattern: Option<String>,
    to_pattern: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRecipeFile {
    #[serde(default)]
    maintainers: Vec<RawMaintainer>,
    #[serde(default)]
    update_on: Vec<HashMap<String, toml::Value>>,
    #[serde(default)]
    update_on_build: Vec<RawOnBuildTrigger>,
    #[serde(default)]
    repo_depends: Vec<RawDependency>,
    #[serde(default)]
    repo_makedepends: Vec<RawDependency>,
    time_limit_hours: f64,
    #[serde(default)]
    staging: bool,
    #[serde(default = "default_managed")]
    managed: bool,
    #[serde(default)]
    allowed_workers: Option<Vec<String>>,
    #[serde(default)]
    pre_build_script: Option<String>,
    #[serde(default)]
    post_build_script: Option<String>,
    #[serde(default)]
    post_build_always_script: Option<String>,
    #[serde(default)]
    prepare_script: Option<String>,
}

fn default_managed() -> bool {
    true
}

/// Built-in `update_on` alias table: `alias name -> field template`, where
/// string values may reference `{pacman_db_dir}` and `{repo_name}`.
fn alias_table() -> HashMap<&'static str, HashMap<&'static str, &'static str>> {
    let mut table = HashMap::new();
    table.insert(
        "aur",
        HashMap::from([("source", "aur")]),
    );
    table.insert(
        "github",
        HashMap::from([("source", "github")]),
    );
    table.insert(
        "gitlab",
        HashMap::from([("source", "gitlab")]),
    );
    table.insert(
        "pypi",
        HashMap::from([("source", "pypi")]),
    );
    table.insert(
        "archpkg",
        HashMap::from([
            ("source", "archpkg"),
            ("dbpath", "{pacman_db_dir}"),
            ("strip_release", "true"),
        ]),
    );
    table
}

fn expand_entry(
    mut raw: HashMap<String, toml::Value>,
    pacman_db_dir: &str,
    repo_name: &str,
) -> UpdateOnEntry {
    let alias = raw
        .remove("alias")
        .and_then(|v| v.as_str().map(str::to_string));

    let mut fields = HashMap::new();
    if let Some(alias_name) = &alias {
        if let Some(template) = alias_table().get(alias_name.as_str()) {
            for (key, value) in template {
                let substituted = value
                    .replace("{pacman_db_dir}", pacman_db_dir)
                    .replace("{repo_name}", repo_name);
                fields.insert(key.to_string(), toml::Value::String(substituted));
            }
        }
    }
    // User-provided keys win over the alias template.
    for (key, value) in raw {
        fields.insert(key, value);
    }

    UpdateOnEntry { alias, fields }
}

fn validate_maintainers(
    pkgbase: &Pkgbase,
    raw: Vec<RawMaintainer>,
) -> Result<Vec<Maintainer>, RecipeLoadError> {
    let mut maintainers = Vec::with_capacity(raw.len());
    for m in raw {
        if m.email.is_none() && m.github.is_none() {
            return Err(RecipeLoadError::NoMaintainers {
                pkgbase: pkgbase.clone(),
            });
        }
        maintainers.push(Maintainer {
            name: m.name.unwrap_or_else(|| pkgbase.clone()),
            email: m.email,
            github: m.github,
        });
    }
    Ok(maintainers)
}

fn throttle_info_from_entries(entries: &[HashMap<String, toml::Value>]) -> HashMap<usize, ThrottleSeconds> {
    let mut throttle = HashMap::new();
    for (i, entry) in entries.iter().enumerate() {
        if let Some(seconds) = entry.get("throttle_seconds").and_then(toml::Value::as_integer) {
            throttle.insert(i, seconds.max(0) as u64);
        }
    }
    throttle
}

fn parse_one(
    pkgbase: &Pkgbase,
    dir: &Utf8Path,
    pacman_db_dir: &str,
    repo_name: &str,
    git_repo: Option<&git2::Repository>,
) -> Result<RecipeInfo, RecipeLoadError> {
    let recipe_path = dir.join(RECIPE_FILE_NAME);
    let content = fs::read_to_string(&recipe_path).map_err(|source| RecipeLoadError::Io {
        pkgbase: pkgbase.clone(),
        source,
    })?;
    let raw: RawRecipeFile =
        toml::from_str(&content).map_err(|source| RecipeLoadError::MalformedConfig {
            pkgbase: pkgbase.clone(),
            source,
        })?;

    if raw.time_limit_hours <= 0.0 {
        use serde::de::Error as _;
        return Err(RecipeLoadError::MalformedConfig {
            pkgbase: pkgbase.clone(),
            source: toml::de::Error::custom("time_limit_hours must be positive"),
        });
    }

    let mut maintainers = validate_maintainers(pkgbase, raw.maintainers)?;
    if maintainers.is_empty() {
        if let Some(repo) = git_repo {
            if let Ok(Some(found)) = find_maintainer(repo, dir.as_str()) {
                maintainers.push(found);
            }
        }
    }

    let throttle_info = throttle_info_from_entries(&raw.update_on);
    let update_on = raw
        .update_on
        .into_iter()
        .map(|entry| expand_entry(entry, pacman_db_dir, repo_name))
        .collect();
    let update_on_build = raw
        .update_on_build
        .into_iter()
        .map(|t| OnBuildTrigger {
            pkgbase: t.pkgbase,
            from_pattern: t.from_pattern,
            to_pattern: t.to_pattern,
        })
        .collect();
    let repo_depends = raw
        .repo_depends
        .into_iter()
        .filter_map(RawDependency::into_dependency)
        .collect();
    let repo_makedepends = raw
        .repo_makedepends
        .into_iter()
        .filter_map(RawDependency::into_dependency)
        .collect();

    Ok(RecipeInfo {
        pkgbase: pkgbase.clone(),
        maintainers,
        update_on,
        update_on_build,
        throttle_info,
        repo_depends,
        repo_makedepends,
        time_limit_hours: raw.time_limit_hours,
        staging: raw.staging,
        managed: raw.managed,
        allowed_workers: raw.allowed_workers,
        pre_build_script: raw.pre_build_script,
        post_build_script: raw.post_build_script,
        post_build_always_script: raw.post_build_always_script,
        prepare_script: raw.prepare_script,
    })
}

/// Walks `repodir`, parsing one [`RecipeInfo`] per subdirectory that
/// contains a [`RECIPE_FILE_NAME`]. Load errors are collected per-pkgbase
/// rather than aborting the whole walk. Returns a second error for any
/// pkgname claimed by more than one pkgbase.
pub fn load(
    repodir: &Utf8Path,
    pacman_db_dir: &str,
    repo_name: &str,
    git_repo: Option<&git2::Repository>,
) -> (HashMap<Pkgbase, RecipeInfo>, HashMap<Pkgbase, RecipeLoadError>) {
    let mut recipes = HashMap::new();
    let mut errors = HashMap::new();

    let entries = match fs::read_dir(repodir) {
        Ok(entries) => entries,
        Err(_) => return (recipes, errors),
    };

    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_dir() {
            continue;
        }
        let Ok(dir) = Utf8PathBuf::from_path_buf(entry.path()) else {
            continue;
        };
        let Some(pkgbase) = dir.file_name().map(str::to_string) else {
            continue;
        };
        if !dir.join(RECIPE_FILE_NAME).as_std_path().exists() {
            continue;
        }
        match parse_one(&pkgbase, &dir, pacman_db_dir, repo_name, git_repo) {
            Ok(info) => {
                recipes.insert(pkgbase, info);
            }
            Err(e) => {
                errors.insert(pkgbase, e);
            }
        }
    }

    check_pkgname_uniqueness(&mut recipes, &mut errors);

    (recipes, errors)
}

/// Enforces that `pkgname -> pkgbase` is a function: if two pkgbases claim
/// the same produced pkgname via `repo_depends`/`repo_makedepends` self
/// advertisement this cannot be checked here (pkgnames of the recipe itself
/// are not modeled by `RecipeInfo`); this only catches a pkgbase claiming
/// its own name twice across the batch, which would indicate a duplicate
/// directory on a case-insensitive filesystem.
fn check_pkgname_uniqueness(
    recipes: &mut HashMap<Pkgbase, RecipeInfo>,
    errors: &mut HashMap<Pkgbase, RecipeLoadError>,
) {
    let mut seen: HashMap<String, Pkgbase> = HashMap::new();
    let mut duplicates = Vec::new();
    for pkgbase in recipes.keys() {
        if let Some(first) = seen.insert(pkgbase.to_lowercase(), pkgbase.clone()) {
            if first != *pkgbase {
                duplicates.push((pkgbase.clone(), first));
            }
        }
    }
    for (pkgbase, first) in duplicates {
        recipes.remove(&pkgbase);
        errors.insert(
            pkgbase.clone(),
            RecipeLoadError::DuplicatePkgname {
                pkgname: pkgbase.clone(),
                first,
                second: pkgbase,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_recipe(dir: &Utf8Path, content: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(RECIPE_FILE_NAME), content).unwrap();
    }

    #[test]
    fn loads_a_minimal_recipe() {
        let tmp = tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let pkg_dir = root.join("foo");
        write_recipe(
            &pkg_dir,
            r#"
            time_limit_hours = 1.0

            [[maintainers]]
            name = "jane"
            email = "jane@example.com"
            "#,
        );

        let (recipes, errors) = load(&root, "/var/lib/pacman", "myrepo", None);
        assert!(errors.is_empty(), "{errors:?}");
        let recipe = recipes.get("foo").unwrap();
        assert_eq!(recipe.maintainers[0].email.as_deref(), Some("jane@example.com"));
    }

    #[test]
    fn rejects_non_positive_time_limit() {
        let tmp = tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let pkg_dir = root.join("foo");
        write_recipe(&pkg_dir, "time_limit_hours = 0.0\n");

        let (recipes, errors) = load(&root, "/var/lib/pacman", "myrepo", None);
        assert!(recipes.is_empty());
        assert!(errors.contains_key("foo"));
    }

    #[test]
    fn rejects_maintainer_without_contact_info() {
        let tmp = tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let pkg_dir = root.join("foo");
        write_recipe(
            &pkg_dir,
            r#"
            time_limit_hours = 1.0

            [[maintainers]]
            name = "jane"
            "#,
        );

        let (_, errors) = load(&root, "/var/lib/pacman", "myrepo", None);
        assert!(matches!(
            errors.get("foo"),
            Some(RecipeLoadError::NoMaintainers { .. })
        ));
    }

    #[test]
    fn alias_expansion_substitutes_placeholders() {
        let tmp = tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let pkg_dir = root.join("foo");
        write_recipe(
            &pkg_dir,
            r#"
            time_limit_hours = 1.0

            [[maintainers]]
            name = "jane"
            email = "jane@example.com"

            [[update_on]]
            alias = "archpkg"
            pkgname = "foo"
            "#,
        );

        let (recipes, _) = load(&root, "/var/lib/pacman", "myrepo", None);
        let entry = &recipes.get("foo").unwrap().update_on[0];
        assert_eq!(
            entry.fields.get("dbpath").and_then(|v| v.as_str()),
            Some("/var/lib/pacman")
        );
        assert_eq!(
            entry.fields.get("pkgname").and_then(|v| v.as_str()),
            Some("foo")
        );
    }
}
