//! Build Planner: turns version-check results, VCS deltas and cascade
//! triggers into the Scheduler Loop's initial `ready` set.
use std::collections::{HashMap, HashSet};

use time::OffsetDateTime;

use crate::{BuildReason, NvResults, Pkgbase, RecipeInfo};

#[derive(Debug, Default)]
pub struct PlannerInputs {
    pub nv_results: HashMap<Pkgbase, NvResults>,
    /// pkgbases with a non-headline `update_on` entry change (§4.3's
    /// `rebuild` set).
    pub rebuild: HashSet<Pkgbase>,
    pub previously_failed: HashSet<Pkgbase>,
    /// pkgbases whose `.SRCINFO` `pkgrel` changed between the two VCS
    /// revisions under consideration.
    pub pkgrel_changed: HashSet<Pkgbase>,
    /// For each dependent pkgbase, the triggers (trigger pkgbase, rewritten
    /// old version, rewritten new version) whose versions differ.
    pub on_build_triggered: HashMap<Pkgbase, Vec<(Pkgbase, String, String)>>,
    /// Pkgbases requested explicitly on the command line, with an optional
    /// requester identity.
    pub requested: HashMap<Pkgbase, Option<String>>,
    pub last_success_times: HashMap<Pkgbase, OffsetDateTime>,
}

#[derive(Debug, Default)]
pub struct PlanResult {
    pub ready: HashMap<Pkgbase, BuildReason>,
    /// `(old, new)` version pair for every pkgbase whose reason is
    /// `OnBuild`, used to render the trigger message.
    pub on_build_versions: HashMap<Pkgbase, (String, String)>,
}

fn changed_entry_items(results: &NvResults) -> Vec<(usize, String)> {
    results
        .0
        .iter()
        .enumerate()
        .filter(|(_, r)| r.changed())
        .map(|(i, r)| {
            let label = r
                .new_version
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            (i, label)
        })
        .collect()
}

/// Index of the `update_on` entry responsible for a `NvChecker` reason,
/// used to look up a per-entry throttle interval. Headline-driven reasons
/// always resolve to entry 0.
fn throttled(
    recipe: &RecipeInfo,
    entry_index: usize,
    last_success: Option<&OffsetDateTime>,
    now: OffsetDateTime,
) -> bool {
    let Some(&interval_seconds) = recipe.throttle_info.get(&entry_index) else {
        return false;
    };
    let Some(last_success) = last_success else {
        return false;
    };
    (now - *last_success).whole_seconds() < interval_seconds as i64
}

pub fn plan(recipes: &HashMap<Pkgbase, RecipeInfo>, inputs: &PlannerInputs, now: OffsetDateTime) -> PlanResult {
    let mut ready = HashMap::new();
    let mut on_build_versions = HashMap::new();

    for (pkgbase, recipe) in recipes {
        if !recipe.managed {
            continue;
        }

        let nv_results = inputs.nv_results.get(pkgbase);
        let any_entry_changed = nv_results.is_some_and(|r| r.0.iter().any(|e| e.changed()));

        let (reason, throttle_entry_index) = if inputs.rebuild.contains(pkgbase) {
            let items = nv_results.map(changed_entry_items).unwrap_or_default();
            let idx = items.first().map(|(i, _)| *i).unwrap_or(0);
            (Some(BuildReason::NvChecker(items)), Some(idx))
        } else if nv_results.is_some_and(NvResults::headline_changed) {
            let items = nv_results.map(changed_entry_items).unwrap_or_default();
            (Some(BuildReason::NvChecker(items)), Some(0))
        } else if inputs.previously_failed.contains(pkgbase) && any_entry_changed {
            (Some(BuildReason::UpdatedFailed), None)
        } else if inputs.pkgrel_changed.contains(pkgbase) {
            (Some(BuildReason::UpdatedPkgrel), None)
        } else if let Some(triggers) = inputs.on_build_triggered.get(pkgbase) {
            if let Some((trigger_pkgbase, old, new)) = triggers.first() {
                on_build_versions.insert(pkgbase.clone(), (old.clone(), new.clone()));
                let _ = trigger_pkgbase;
            }
            let trigger_pkgbases = triggers.iter().map(|(p, _, _)| p.clone()).collect();
            (Some(BuildReason::OnBuild(trigger_pkgbases)), None)
        } else if let Some(requester) = inputs.requested.get(pkgbase) {
            (Some(BuildReason::Cmdline(requester.clone())), None)
        } else {
            (None, None)
        };

        let Some(reason) = reason else { continue };

        if let Some(entry_index) = throttle_entry_index {
            let last_success = inputs.last_success_times.get(pkgbase);
            if throttled(recipe, entry_index, last_success, now) {
                continue;
            }
        }

        ready.insert(pkgbase.clone(), reason);
    }

    PlanResult {
        ready,
        on_build_versions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NvResult;
    use time::Duration;

    fn recipe(pkgbase: &str) -> RecipeInfo {
        RecipeInfo {
            pkgbase: pkgbase.to_string(),
            maintainers: vec![],
            update_on: vec![Default::default()],
            update_on_build: vec![],
            throttle_info: Default::default(),
            repo_depends: vec![],
            repo_makedepends: vec![],
            time_limit_hours: 1.0,
            staging: false,
            managed: true,
            allowed_workers: None,
            pre_build_script: None,
            post_build_script: None,
            post_build_always_script: None,
            prepare_script: None,
        }
    }

    #[test]
    fn headline_change_yields_nvchecker_reason() {
        let mut recipes = HashMap::new();
        recipes.insert("foo".to_string(), recipe("foo"));
        let mut inputs = PlannerInputs::default();
        inputs.nv_results.insert(
            "foo".to_string(),
            NvResults(vec![NvResult {
                old_version: Some("1.0".into()),
                new_version: Some("1.1".into()),
            }]),
        );

        let result = plan(&recipes, &inputs, OffsetDateTime::now_utc());
        assert!(matches!(result.ready["foo"], BuildReason::NvChecker(_)));
    }

    #[test]
    fn unmanaged_recipes_are_never_scheduled() {
        let mut recipes = HashMap::new();
        let mut r = recipe("foo");
        r.managed = false;
        recipes.insert("foo".to_string(), r);
        let mut inputs = PlannerInputs::default();
        inputs.nv_results.insert(
            "foo".to_string(),
            NvResults(vec![NvResult {
                old_version: Some("1.0".into()),
                new_version: Some("1.1".into()),
            }]),
        );

        let result = plan(&recipes, &inputs, OffsetDateTime::now_utc());
        assert!(result.ready.is_empty());
    }

    #[test]
    fn throttle_suppresses_recent_rebuild() {
        let mut recipes = HashMap::new();
        let mut r = recipe("foo");
        r.throttle_info.insert(0, 3600);
        recipes.insert("foo".to_string(), r);
        let mut inputs = PlannerInputs::default();
        inputs.nv_results.insert(
            "foo".to_string(),
            NvResults(vec![NvResult {
                old_version: Some("1.0".into()),
                new_version: Some("1.1".into()),
            }]),
        );
        let now = OffsetDateTime::now_utc();
        inputs
            .last_success_times
            .insert("foo".to_string(), now - Duration::minutes(10));

        let result = plan(&recipes, &inputs, now);
        assert!(result.ready.is_empty());
    }

    #[test]
    fn updated_failed_requires_some_entry_change() {
        let mut recipes = HashMap::new();
        recipes.insert("foo".to_string(), recipe("foo"));
        let mut inputs = PlannerInputs::default();
        inputs.previously_failed.insert("foo".to_string());
        inputs.nv_results.insert(
            "foo".to_string(),
            NvResults(vec![NvResult {
                old_version: Some("1.0".into()),
                new_version: Some("1.0".into()),
            }]),
        );

        let result = plan(&recipes, &inputs, OffsetDateTime::now_utc());
        assert!(result.ready.is_empty());
    }
}
