use std::io::Read as _;

use anyhow::{Context, Result};
use clap::Parser;

use args::Args;
use buildwarden::build_worker::{self, BuildContext};
use buildwarden::config::GlobalConfig;
use buildwarden::protocol::WorkerInput;
use buildwarden::{logging, recipe};

mod args;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    let mut raw = String::new();
    std::io::stdin()
        .read_to_string(&mut raw)
        .context("failed to read worker input from stdin")?;
    let input: WorkerInput = serde_json::from_str(&raw).context("failed to parse worker input")?;
    // --worker-no only identifies this process for ps/logs; the input JSON's
    // own worker_no is what the build actually uses.
    tracing::debug!(pkgbase = %input.pkgbase, worker_no = args.worker_no, "received worker input");

    let config = GlobalConfig::load(args.config.as_std_path())
        .with_context(|| format!("failed to load config from {}", args.config))?;

    let recipes_dir = args.recipes_dir.clone().unwrap_or_else(|| config.recipes_dir.clone());
    let (recipes, errors) = recipe::load(&recipes_dir, config.pacman_db_dir.as_str(), &config.repo_name, None);
    if let Some(err) = errors.get(&input.pkgbase) {
        anyhow::bail!("recipe for {} failed to load: {err}", input.pkgbase);
    }
    let recipe = recipes
        .get(&input.pkgbase)
        .with_context(|| format!("no recipe found for {}", input.pkgbase))?;

    let build_dir = recipes_dir.join(&input.pkgbase);
    let ctx = BuildContext {
        recipe,
        config: &config,
        input: &input,
        build_dir,
    };

    let result = build_worker::run_build(&ctx).await;
    let result_json = serde_json::to_string_pretty(&result).context("failed to serialize worker result")?;
    std::fs::write(input.result.as_std_path(), result_json)
        .with_context(|| format!("failed to write worker result to {}", input.result))?;

    Ok(())
}
