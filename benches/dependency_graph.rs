use std::collections::HashMap;

use buildwarden::depgraph::DependencyGraph;
use buildwarden::{Dependency, Pkgbase, RecipeInfo};
use criterion::{criterion_group, criterion_main, Criterion};

/// A chain of `n` recipes, each depending on the one before it, so the
/// closure computation has real transitive work to do.
fn chain_recipes(n: usize) -> HashMap<Pkgbase, RecipeInfo> {
    let mut recipes = HashMap::new();
    for i in 0..n {
        let pkgbase = format!("pkg{i}");
        let repo_depends = if i == 0 {
            vec![]
        } else {
            vec![Dependency {
                pkgbase: format!("pkg{}", i - 1),
                pkgname: format!("pkg{}", i - 1),
            }]
        };
        recipes.insert(
            pkgbase.clone(),
            RecipeInfo {
                pkgbase,
                maintainers: vec![],
                update_on: vec![],
                update_on_build: vec![],
                throttle_info: Default::default(),
                repo_depends,
                repo_makedepends: vec![],
                time_limit_hours: 1.0,
                staging: false,
                managed: true,
                allowed_workers: None,
                pre_build_script: None,
                post_build_script: None,
                post_build_always_script: None,
                prepare_script: None,
            },
        );
    }
    recipes
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("benches");
    group.sample_size(10);
    let recipes = chain_recipes(2000);

    group.bench_function("build_chain", |b| {
        b.iter(|| {
            DependencyGraph::build(&recipes);
        })
    });

    let graph = DependencyGraph::build(&recipes);
    group.bench_function("runtime_closure_tail", |b| {
        b.iter(|| {
            graph.runtime_closure("pkg1999");
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
