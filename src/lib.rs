mod address;
mod batch;
mod cache;
mod config;
mod csv_io;
mod db;
mod errors;
mod geocoder;
mod processor;
mod rate_limiter;
mod report;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use address::{normalize_address, AddressRecord, InputRow};
pub use batch::{BatchCoordinator, BatchProgress, BatchReport, ProgressObserver, RowEntry};
pub use cache::{AddressCache, CacheEntry, Claim, InFlight, Pending, RunClaims};
pub use config::{AppConfig, PublicAppConfig};
pub use csv_io::{output_path_for, read_input, read_input_from, write_output, InputTable};
pub use errors::{AppError, AppResult, ResolutionError};
pub use geocoder::{Coordinates, GeocodeResult, GeocodeStatus, Geocoder, GoogleGeocoder};
pub use processor::{
    ProcessingOutcome, ResolutionSource, RetryPolicy, RowFailure, RowProcessor, RunContext,
};
pub use rate_limiter::RateLimiter;
pub use report::{output_headers, output_rows, RunSummary};

pub struct RunOptions {
    pub input: PathBuf,
    pub output: Option<PathBuf>,
    pub config: AppConfig,
}

/// Geocodes `options.input` against Google and the on-disk cache, writing
/// `geocoded-<input>` (or `options.output`).
pub async fn run_geocode(
    options: RunOptions,
    observer: Option<ProgressObserver>,
) -> AppResult<RunSummary> {
    let RunOptions {
        input,
        output,
        config,
    } = options;
    info!(config = ?config.public_profile(), "geocode run configured");

    let geocoder = Arc::new(GoogleGeocoder::new(&config)?);
    let cache = Arc::new(AddressCache::open(&config.cache_file)?);
    let (_, summary) =
        geocode_file(&input, output.as_deref(), &config, cache, geocoder, observer).await?;
    Ok(summary)
}

/// Same pipeline as [`run_geocode`] with the cache and provider supplied by the caller.
pub async fn geocode_file(
    input: &Path,
    output: Option<&Path>,
    config: &AppConfig,
    cache: Arc<AddressCache>,
    geocoder: Arc<dyn Geocoder>,
    observer: Option<ProgressObserver>,
) -> AppResult<(BatchReport, RunSummary)> {
    let table = read_input(input)?;
    let output_path = match output {
        Some(path) => path.to_path_buf(),
        None => output_path_for(input)?,
    };
    info!(
        rows = table.rows.len(),
        cache = %cache.path().display(),
        cached_entries = cache.entry_count()?,
        "loaded input"
    );

    let coordinator = BatchCoordinator::from_config(config, cache, geocoder);
    let report = coordinator.run(table.rows, observer).await;

    write_output(
        &output_path,
        &output_headers(&table.headers),
        &output_rows(&report),
    )?;
    let summary = RunSummary::new(&report, &output_path);
    Ok((report, summary))
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,geocode_batch=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}
