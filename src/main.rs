use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use secrecy::SecretString;
use tracing::info;

use geocode_batch::{
    init_tracing, run_geocode, AppConfig, BatchProgress, ProgressObserver, RunOptions,
};

/// Geocode a CSV of addresses, using the Google Maps API.
#[derive(Parser)]
#[command(name = "geocode-batch", version, about)]
struct Cli {
    /// Google Maps client ID
    #[arg(short = 'i', long = "id", env = "GOOGLE_MAPS_CLIENT_ID")]
    client_id: String,

    /// Google Maps client crypto key
    #[arg(
        short = 'k',
        long = "key",
        env = "GOOGLE_MAPS_CRYPTO_KEY",
        hide_env_values = true
    )]
    crypto_key: String,

    /// CSV of addresses (must have an `address` column)
    #[arg(short = 'f', long = "file")]
    file: PathBuf,

    /// Cache database file
    #[arg(long)]
    cache: Option<PathBuf>,

    /// Maximum rows processed concurrently
    #[arg(long)]
    concurrency: Option<usize>,

    /// Output path (defaults to geocoded-<file> next to the input)
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = AppConfig::from_env();
    config.google_client_id = Some(cli.client_id);
    config.google_crypto_key = Some(SecretString::from(cli.crypto_key));
    if let Some(cache) = cli.cache {
        config.cache_file = cache;
    }
    if let Some(concurrency) = cli.concurrency {
        config.max_concurrency = concurrency.max(1);
    }

    let observer: ProgressObserver = Arc::new(|progress: BatchProgress| {
        let step = (progress.total_rows / 10).max(1);
        if progress.processed % step == 0 || progress.processed == progress.total_rows {
            info!(
                processed = progress.processed,
                total = progress.total_rows,
                failed = progress.failed,
                "progress"
            );
        }
    });

    let input = cli.file.clone();
    let summary = run_geocode(
        RunOptions {
            input: cli.file,
            output: cli.output,
            config,
        },
        Some(observer),
    )
    .await
    .with_context(|| format!("failed to geocode {}", input.display()))?;

    println!("{summary}");
    Ok(())
}
