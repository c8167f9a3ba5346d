use clap::Parser;

/// The per-build worker subprocess. Reads a worker input JSON document from
/// stdin, runs one build, and writes the worker result JSON to the path the
/// input names.
#[derive(Debug, Clone, Parser)]
#[command(name = "buildwarden worker", author, about, version)]
pub struct Args {
    /// Be verbose. Specify twice to be more verbose.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Identifies this worker slot in logs; a remote worker is invoked with
    /// this set by the Worker Manager's SSH command line.
    #[arg(long, default_value_t = 0)]
    pub worker_no: u32,

    /// Path to the recipe tree; defaults to the worker input's own
    /// expectation that it is run with the recipe directory as its current
    /// working directory.
    #[arg(long)]
    pub recipes_dir: Option<camino::Utf8PathBuf>,

    /// Path to config.toml; required to resolve signing keys, accepted
    /// suffixes and SMTP settings for failure mail.
    #[arg(long, default_value = "config.toml")]
    pub config: camino::Utf8PathBuf,
}
