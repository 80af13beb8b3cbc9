use autoiso::cli::Cli;
use clap::Parser;

#[cfg(debug_assertions)]
const MAX_LEVEL: tracing::Level = tracing::Level::DEBUG;
#[cfg(not(debug_assertions))]
const MAX_LEVEL: tracing::Level = tracing::Level::INFO;

fn main() {
    use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

    // HTTP client internals are only interesting when asked for explicitly.
    let mut filter = EnvFilter::builder()
        .with_default_directive(MAX_LEVEL.into())
        .from_env_lossy();
    for directive in ["ureq=info", "ureq_proto=info", "rustls=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();
    if let Err(e) = cli.run() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
