use anyhow::Result;
use clap::Parser;
use ome_merge::Cli;
use tracing::info;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Some(out) = ome_merge::run(&cli)? {
        info!(output = %out.display(), "done");
    }
    Ok(())
}
