use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the global tracing subscriber. `verbose` follows the CLI `-v`
/// counter: 0 = error, 1 = warn, 2 = info, 3 = debug, 4+ = trace. A
/// `RUST_LOG` environment variable always wins over the counter.
pub fn init(verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match verbose {
            0 => "error",
            1 => "warn",
            2 => "info",
            3 => "debug",
            _ => "trace",
        };
        EnvFilter::new(level)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}
