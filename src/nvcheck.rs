//! Version-Check Driver: serializes `update_on` entries to the external
//! checker and streams back per-entry version deltas.
use std::collections::{HashMap, HashSet};
use std::process::Stdio;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::config::{GlobalConfig, VersionState};
use crate::{NvResult, NvResults, Pkgbase, RecipeInfo};

pub const CHECKER_BINARY: &str = "nvchecker";

#[derive(Debug, Clone)]
pub struct CheckerError {
    pub entry_key: String,
    pub level: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct CheckOutcome {
    pub results: HashMap<Pkgbase, NvResults>,
    pub unknown: HashSet<Pkgbase>,
    pub rebuild: HashSet<Pkgbase>,
    pub errors: HashMap<Pkgbase, Vec<CheckerError>>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    event: String,
    name: Option<String>,
    version: Option<String>,
    old_version: Option<String>,
    level: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

fn entry_key(pkgbase: &str, index: usize) -> String {
    if index == 0 {
        pkgbase.to_string()
    } else {
        format!("{pkgbase}:{index}")
    }
}

/// Builds the TOML interchange file: one section per flattened entry plus
/// `__config__` holding the oldver/newver state paths and optional proxy.
fn build_input_toml(
    recipes: &HashMap<Pkgbase, RecipeInfo>,
    config: &GlobalConfig,
    care_set: Option<&HashSet<Pkgbase>>,
) -> Result<(String, HashMap<String, Pkgbase>, HashMap<Pkgbase, usize>)> {
    let mut root = toml::map::Map::new();
    let mut key_to_pkgbase = HashMap::new();
    let mut entry_counts = HashMap::new();

    let mut config_section = toml::map::Map::new();
    config_section.insert(
        "oldver".into(),
        toml::Value::String(config.oldver_path().to_string()),
    );
    config_section.insert(
        "newver".into(),
        toml::Value::String(config.newver_path().to_string()),
    );
    if let Some(proxy) = &config.proxy {
        config_section.insert("proxy".into(), toml::Value::String(proxy.clone()));
    }
    root.insert("__config__".into(), toml::Value::Table(config_section));

    let mut pkgbases: Vec<&Pkgbase> = recipes.keys().collect();
    pkgbases.sort();
    for pkgbase in pkgbases {
        if let Some(care_set) = care_set {
            if !care_set.contains(pkgbase) {
                continue;
            }
        }
        let recipe = &recipes[pkgbase];
        entry_counts.insert(pkgbase.clone(), recipe.update_on.len());
        for (i, entry) in recipe.update_on.iter().enumerate() {
            let key = entry_key(pkgbase, i);
            let mut section = toml::map::Map::new();
            for (field_key, value) in &entry.fields {
                section.insert(field_key.clone(), value.clone());
            }
            root.insert(key.clone(), toml::Value::Table(section));
            key_to_pkgbase.insert(key, pkgbase.clone());
        }
    }

    let rendered = toml::to_string(&toml::Value::Table(root))?;
    Ok((rendered, key_to_pkgbase, entry_counts))
}

fn aggregate(
    raw_results: &HashMap<String, NvResult>,
    entry_counts: &HashMap<Pkgbase, usize>,
) -> (HashMap<Pkgbase, NvResults>, HashSet<Pkgbase>) {
    let mut results = HashMap::new();
    let mut unknown = HashSet::new();
    for (pkgbase, count) in entry_counts {
        let mut entries = Vec::with_capacity(*count);
        for i in 0..*count {
            let key = entry_key(pkgbase, i);
            entries.push(raw_results.get(&key).cloned().unwrap_or_default());
        }
        if entries
            .iter()
            .all(|e| e.old_version.is_none() && e.new_version.is_none())
        {
            unknown.insert(pkgbase.clone());
        }
        results.insert(pkgbase.clone(), NvResults(entries));
    }
    (results, unknown)
}

fn compute_rebuild(
    results: &HashMap<Pkgbase, NvResults>,
    errors: &HashMap<Pkgbase, Vec<CheckerError>>,
) -> HashSet<Pkgbase> {
    results
        .iter()
        .filter(|(pkgbase, r)| r.non_headline_changed() && !errors.contains_key(*pkgbase))
        .map(|(pkgbase, _)| pkgbase.clone())
        .collect()
}

/// Runs the external version checker over every recipe's `update_on`
/// entries (or only those in `care_set`, if given) and aggregates its
/// JSON-line log into per-recipe results.
pub async fn check(
    recipes: &HashMap<Pkgbase, RecipeInfo>,
    config: &GlobalConfig,
    care_set: Option<&HashSet<Pkgbase>>,
) -> Result<CheckOutcome> {
    let state = VersionState::load(&config.oldver_path())?;
    let (toml_input, key_to_pkgbase, entry_counts) =
        build_input_toml(recipes, config, care_set)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let input_path = config.data_dir.join("nvchecker_input.toml");
    std::fs::write(&input_path, toml_input)?;

    let mut child = Command::new(CHECKER_BINARY)
        .arg("--file")
        .arg(input_path.as_str())
        .arg("--logger")
        .arg("json")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to spawn version checker")?;
    let stdout = child.stdout.take().expect("stdout was piped");
    let mut lines = BufReader::new(stdout).lines();

    let mut raw_results: HashMap<String, NvResult> = HashMap::new();
    let mut errors: HashMap<Pkgbase, Vec<CheckerError>> = HashMap::new();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let Ok(event) = serde_json::from_str::<RawEvent>(&line) else {
            continue;
        };
        let Some(name) = event.name.clone() else {
            continue;
        };
        match event.event.as_str() {
            "updated" => {
                let old = event
                    .old_version
                    .clone()
                    .or_else(|| state.0.get(&name).cloned());
                raw_results.insert(
                    name,
                    NvResult {
                        old_version: old,
                        new_version: event.version,
                    },
                );
            }
            "up-to-date" => {
                raw_results.insert(
                    name,
                    NvResult {
                        old_version: event.version.clone(),
                        new_version: event.version,
                    },
                );
            }
            "warning" | "error" => {
                if let Some(pkgbase) = key_to_pkgbase.get(&name) {
                    errors.entry(pkgbase.clone()).or_default().push(CheckerError {
                        entry_key: name,
                        level: event.level.unwrap_or_else(|| event.event.clone()),
                        message: event.message.unwrap_or_default(),
                    });
                }
            }
            _ => {}
        }
    }

    let status = child.wait().await?;
    if !status.success() {
        tracing::warn!("version checker exited with {status}");
    }

    let (results, unknown) = aggregate(&raw_results, &entry_counts);
    let rebuild = compute_rebuild(&results, &errors);

    Ok(CheckOutcome {
        results,
        unknown,
        rebuild,
        errors,
    })
}

/// Commits headline versions into the persisted state file, advancing
/// `oldver -> newver` for the given pkgbases.
pub async fn nvtake(config: &GlobalConfig, pkgbases: &[Pkgbase]) -> Result<()> {
    if pkgbases.is_empty() {
        return Ok(());
    }
    let input_path = config.data_dir.join("nvchecker_input.toml");
    let status = Command::new(CHECKER_BINARY)
        .arg("--file")
        .arg(input_path.as_str())
        .arg("nvtake")
        .args(pkgbases)
        .status()
        .await
        .context("failed to spawn version checker for nvtake")?;
    if !status.success() {
        anyhow::bail!("nvtake exited with {status}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_key_formatting() {
        assert_eq!(entry_key("foo", 0), "foo");
        assert_eq!(entry_key("foo", 1), "foo:1");
    }

    #[test]
    fn aggregate_fills_missing_entries_as_null() {
        let mut raw = HashMap::new();
        raw.insert(
            "foo".to_string(),
            NvResult {
                old_version: Some("1.0".into()),
                new_version: Some("1.1".into()),
            },
        );
        let mut counts = HashMap::new();
        counts.insert("foo".to_string(), 2);

        let (results, unknown) = aggregate(&raw, &counts);
        let foo = &results["foo"];
        assert_eq!(foo.0.len(), 2);
        assert_eq!(foo.0[1], NvResult::default());
        assert!(!unknown.contains("foo"));
    }

    #[test]
    fn aggregate_marks_fully_missing_pkgbase_unknown() {
        let raw = HashMap::new();
        let mut counts = HashMap::new();
        counts.insert("foo".to_string(), 1);

        let (_, unknown) = aggregate(&raw, &counts);
        assert!(unknown.contains("foo"));
    }

    #[test]
    fn rebuild_excludes_errored_pkgbases() {
        let mut results = HashMap::new();
        results.insert(
            "foo".to_string(),
            NvResults(vec![
                NvResult {
                    old_version: Some("1".into()),
                    new_version: Some("1".into()),
                },
                NvResult {
                    old_version: Some("a".into()),
                    new_version: Some("b".into()),
                },
            ]),
        );
        let mut errors = HashMap::new();
        errors.insert(
            "foo".to_string(),
            vec![CheckerError {
                entry_key: "foo:1".into(),
                level: "error".into(),
                message: "boom".into(),
            }],
        );
        let rebuild = compute_rebuild(&results, &errors);
        assert!(rebuild.is_empty());
    }
}
