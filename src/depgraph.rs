//! Dependency Graph: runtime-closure and build-input-closure over recipe pkgbases.
use std::collections::{BTreeSet, HashMap, HashSet};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::{Dependency, DependencyKind, Pkgbase, RecipeInfo};

/// Two DAGs over recipe pkgbases, built once per batch from the loaded
/// recipe set. Edges point from a dependency towards its dependent so that
/// a lexicographic topological walk resolves dependencies before
/// dependents.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<Pkgbase, DependencyKind>,
    index_map: HashMap<Pkgbase, NodeIndex>,
    topo_order: Vec<Pkgbase>,
    /// pkgbases that sit on a dependency cycle; excluded from scheduling but
    /// still present in `graph` for reverse-dependency lookup.
    cyclic: HashSet<Pkgbase>,
    runtime_closure: HashMap<Pkgbase, HashSet<Dependency>>,
    build_input_closure: HashMap<Pkgbase, HashSet<Dependency>>,
}

impl DependencyGraph {
    pub fn build(recipes: &HashMap<Pkgbase, RecipeInfo>) -> DependencyGraph {
        let mut graph = DiGraph::new();
        let mut index_map = HashMap::new();
        for pkgbase in recipes.keys() {
            let idx = graph.add_node(pkgbase.clone());
            index_map.insert(pkgbase.clone(), idx);
        }

        let mut direct_runtime: HashMap<Pkgbase, HashSet<Dependency>> = HashMap::new();
        let mut direct_make: HashMap<Pkgbase, HashSet<Dependency>> = HashMap::new();

        for (pkgbase, info) in recipes {
            let from_idx = index_map[pkgbase];
            let mut runtime_deps = HashSet::new();
            for dep in &info.repo_depends {
                if let Some(&dep_idx) = index_map.get(&dep.pkgbase) {
                    graph.add_edge(dep_idx, from_idx, DependencyKind::Run);
                    runtime_deps.insert(dep.clone());
                }
            }
            direct_runtime.insert(pkgbase.clone(), runtime_deps);

            let mut make_deps = HashSet::new();
            for dep in &info.repo_makedepends {
                if index_map.contains_key(&dep.pkgbase) {
                    make_deps.insert(dep.clone());
                }
            }
            direct_make.insert(pkgbase.clone(), make_deps);
        }

        let topo_order = lexicographic_toposort(&graph, &index_map);
        let cyclic: HashSet<Pkgbase> = recipes
            .keys()
            .filter(|p| !topo_order.contains(p))
            .cloned()
            .collect();

        // Second pass: walk dependents in topological order, unioning each
        // resolved dependency's full closure into the dependent's set.
        let mut runtime_closure: HashMap<Pkgbase, HashSet<Dependency>> = HashMap::new();
        for pkgbase in &topo_order {
            let direct = direct_runtime.get(pkgbase).cloned().unwrap_or_default();
            let mut closure = direct.clone();
            for dep in &direct {
                if let Some(dep_closure) = runtime_closure.get(&dep.pkgbase) {
                    closure.extend(dep_closure.iter().cloned());
                }
            }
            runtime_closure.insert(pkgbase.clone(), closure);
        }
        for pkgbase in &cyclic {
            runtime_closure.entry(pkgbase.clone()).or_default();
        }

        // Third pass: build-input closure = own runtime closure plus the
        // runtime closures of every direct make-dependency.
        let mut build_input_closure: HashMap<Pkgbase, HashSet<Dependency>> = HashMap::new();
        for pkgbase in recipes.keys() {
            let mut set = runtime_closure.get(pkgbase).cloned().unwrap_or_default();
            if let Some(make_deps) = direct_make.get(pkgbase) {
                for dep in make_deps {
                    set.insert(dep.clone());
                    if let Some(dep_closure) = runtime_closure.get(&dep.pkgbase) {
                        set.extend(dep_closure.iter().cloned());
                    }
                }
            }
            build_input_closure.insert(pkgbase.clone(), set);
        }

        DependencyGraph {
            graph,
            index_map,
            topo_order,
            cyclic,
            runtime_closure,
            build_input_closure,
        }
    }

    pub fn runtime_closure(&self, pkgbase: &str) -> Option<&HashSet<Dependency>> {
        self.runtime_closure.get(pkgbase)
    }

    pub fn build_input_closure(&self, pkgbase: &str) -> Option<&HashSet<Dependency>> {
        self.build_input_closure.get(pkgbase)
    }

    pub fn is_cyclic(&self, pkgbase: &str) -> bool {
        self.cyclic.contains(pkgbase)
    }

    pub fn cyclic_pkgbases(&self) -> impl Iterator<Item = &Pkgbase> {
        self.cyclic.iter()
    }

    pub fn topo_order(&self) -> &[Pkgbase] {
        &self.topo_order
    }

    /// Transitive reverse of the runtime-closure map: `pkgbase -> set of
    /// pkgbases that transitively depend on it`. Used to cascade failures
    /// and evaluate `update_on_build` triggers.
    pub fn reverse_dependents(&self) -> HashMap<Pkgbase, HashSet<Pkgbase>> {
        let mut rdep: HashMap<Pkgbase, HashSet<Pkgbase>> = HashMap::new();
        for (pkgbase, deps) in &self.runtime_closure {
            for dep in deps {
                rdep.entry(dep.pkgbase.clone())
                    .or_default()
                    .insert(pkgbase.clone());
            }
        }
        rdep
    }
}

/// Kahn's algorithm with a `BTreeSet` frontier so ties are always broken
/// lexicographically on `pkgbase`, making the order deterministic.
fn lexicographic_toposort(
    graph: &DiGraph<Pkgbase, DependencyKind>,
    index_map: &HashMap<Pkgbase, NodeIndex>,
) -> Vec<Pkgbase> {
    let mut in_degree: HashMap<NodeIndex, usize> = HashMap::new();
    for idx in graph.node_indices() {
        in_degree.insert(idx, graph.edges_directed(idx, Direction::Incoming).count());
    }

    let mut ready: BTreeSet<(Pkgbase, NodeIndex)> = BTreeSet::new();
    for (pkgbase, &idx) in index_map {
        if in_degree[&idx] == 0 {
            ready.insert((pkgbase.clone(), idx));
        }
    }

    let mut order = Vec::new();
    while let Some((pkgbase, idx)) = ready.iter().next().cloned() {
        ready.remove(&(pkgbase.clone(), idx));
        order.push(pkgbase);
        for edge in graph.edges_directed(idx, Direction::Outgoing) {
            let target = edge.target();
            let deg = in_degree.get_mut(&target).expect("node seen in first pass");
            *deg -= 1;
            if *deg == 0 {
                ready.insert((graph[target].clone(), target));
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DependencyKind as DK;

    fn recipe(pkgbase: &str, runtime_deps: &[&str]) -> RecipeInfo {
        RecipeInfo {
            pkgbase: pkgbase.to_string(),
            maintainers: vec![],
            update_on: vec![],
            update_on_build: vec![],
            throttle_info: Default::default(),
            repo_depends: runtime_deps
                .iter()
                .map(|d| Dependency {
                    pkgbase: d.to_string(),
                    pkgname: d.to_string(),
                })
                .collect(),
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
    fn transitive_closure_and_topo_order() {
        let mut recipes = HashMap::new();
        recipes.insert("a".to_string(), recipe("a", &["b"]));
        recipes.insert("b".to_string(), recipe("b", &["c"]));
        recipes.insert("c".to_string(), recipe("c", &[]));
        let graph = DependencyGraph::build(&recipes);

        assert_eq!(graph.topo_order(), &["c", "b", "a"]);
        let closure = graph.runtime_closure("a").unwrap();
        assert_eq!(closure.len(), 2);
        assert!(closure.iter().any(|d| d.pkgbase == "b"));
        assert!(closure.iter().any(|d| d.pkgbase == "c"));
        assert!(!graph.is_cyclic("a"));
    }

    #[test]
    fn cycle_is_detected_and_excluded() {
        let mut recipes = HashMap::new();
        recipes.insert("a".to_string(), recipe("a", &["b"]));
        recipes.insert("b".to_string(), recipe("b", &["a"]));
        let graph = DependencyGraph::build(&recipes);

        assert!(graph.is_cyclic("a"));
        assert!(graph.is_cyclic("b"));
        assert!(graph.runtime_closure("a").unwrap().is_empty());
    }

    #[test]
    fn build_input_closure_includes_makedeps_runtime_closure() {
        let mut recipes = HashMap::new();
        let mut a = recipe("a", &[]);
        a.repo_makedepends.push(Dependency {
            pkgbase: "b".to_string(),
            pkgname: "b".to_string(),
        });
        recipes.insert("a".to_string(), a);
        recipes.insert("b".to_string(), recipe("b", &["c"]));
        recipes.insert("c".to_string(), recipe("c", &[]));
        let graph = DependencyGraph::build(&recipes);

        let build_input = graph.build_input_closure("a").unwrap();
        assert!(build_input.iter().any(|d| d.pkgbase == "b"));
        assert!(build_input.iter().any(|d| d.pkgbase == "c"));
        assert_eq!(DK::Run, DK::Run);
    }

    #[test]
    fn reverse_dependents_is_transitive() {
        let mut recipes = HashMap::new();
        recipes.insert("a".to_string(), recipe("a", &["b"]));
        recipes.insert("b".to_string(), recipe("b", &["c"]));
        recipes.insert("c".to_string(), recipe("c", &[]));
        let graph = DependencyGraph::build(&recipes);
        let rdep = graph.reverse_dependents();
        assert_eq!(
            rdep.get("c").cloned().unwrap_or_default(),
            HashSet::from(["a".to_string(), "b".to_string()])
        );
    }
}
