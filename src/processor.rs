use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::address::{AddressRecord, InputRow};
use crate::cache::{AddressCache, Claim, Resolution, RunClaims};
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult, ResolutionError};
use crate::geocoder::{GeocodeResult, Geocoder};
use crate::rate_limiter::RateLimiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionSource {
    Cache,
    Live,
}

impl ResolutionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionSource::Cache => "cache",
            ResolutionSource::Live => "live",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessingOutcome {
    pub row: InputRow,
    pub result: GeocodeResult,
    pub source: ResolutionSource,
}

#[derive(Debug, Clone, Error)]
#[error("row {} ({}) failed with {}: {}", .row.index, .row.address.address, .status, .cause)]
pub struct RowFailure {
    pub row: InputRow,
    pub status: String,
    pub cause: String,
}

impl RowFailure {
    fn new(row: InputRow, error: ResolutionError) -> Self {
        Self {
            row,
            status: error.status,
            cause: error.message,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
        }
    }
}

/// State scoped to one batch run: in-flight markers and the live call count.
#[derive(Default)]
pub struct RunContext {
    claims: RunClaims,
    live_calls: AtomicUsize,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests sent to the provider during this run, retries included.
    pub fn live_calls(&self) -> usize {
        self.live_calls.load(Ordering::SeqCst)
    }
}

/// Resolves one row: cache first, otherwise a rate-limited live call whose
/// terminal result is written back to the cache.
pub struct RowProcessor {
    cache: Arc<AddressCache>,
    limiter: Arc<RateLimiter>,
    geocoder: Arc<dyn Geocoder>,
    retry: RetryPolicy,
    jitter_rng: Mutex<StdRng>,
}

impl RowProcessor {
    pub fn new(
        cache: Arc<AddressCache>,
        limiter: Arc<RateLimiter>,
        geocoder: Arc<dyn Geocoder>,
        retry: RetryPolicy,
    ) -> Self {
        Self::with_rng(cache, limiter, geocoder, retry, StdRng::from_entropy())
    }

    pub fn with_rng(
        cache: Arc<AddressCache>,
        limiter: Arc<RateLimiter>,
        geocoder: Arc<dyn Geocoder>,
        retry: RetryPolicy,
        rng: StdRng,
    ) -> Self {
        Self {
            cache,
            limiter,
            geocoder,
            retry,
            jitter_rng: Mutex::new(rng),
        }
    }

    pub async fn process(
        &self,
        row: InputRow,
        run: &RunContext,
    ) -> Result<ProcessingOutcome, RowFailure> {
        if row.address.is_blank() {
            return Err(RowFailure::new(
                row,
                ResolutionError::new("INVALID_ADDRESS", "address is empty"),
            ));
        }

        let claim = match self.cache.claim(&run.claims, &row.address.normalized_key) {
            Ok(claim) => claim,
            Err(err) => {
                warn!(?err, address = %row.address.address, "cache lookup failed");
                let error = ResolutionError::from(&err);
                return Err(RowFailure::new(row, error));
            }
        };

        let (resolution, source) = match claim {
            Claim::Hit(entry) => {
                debug!(index = row.index, address = %row.address.address, "found in cache");
                (Ok(entry.result), ResolutionSource::Cache)
            }
            Claim::Waiter(pending) => {
                debug!(
                    index = row.index,
                    address = %row.address.address,
                    "awaiting resolution by another row"
                );
                (pending.wait().await, ResolutionSource::Cache)
            }
            Claim::Owner(in_flight) => {
                let resolution = self.resolve_live(&row.address, run).await;
                in_flight.complete(resolution.clone());
                (resolution, ResolutionSource::Live)
            }
        };

        match resolution {
            Ok(result) => Ok(ProcessingOutcome {
                row,
                result,
                source,
            }),
            Err(error) => {
                warn!(
                    index = row.index,
                    address = %row.address.address,
                    status = %error.status,
                    "could not geocode row"
                );
                Err(RowFailure::new(row, error))
            }
        }
    }

    async fn resolve_live(&self, record: &AddressRecord, run: &RunContext) -> Resolution {
        let result = self
            .geocode_with_retry(&record.address, run)
            .await
            .map_err(|err| ResolutionError::from(&err))?;

        if !result.status.is_terminal() {
            let err = AppError::Provider {
                status: result.status.as_str().to_string(),
            };
            return Err(ResolutionError::from(&err));
        }
        debug!(address = %record.address, status = %result.status, "geocoded");

        // A result that cannot be cached counts as a failure so the next run retries it.
        self.cache
            .store(&record.normalized_key, &record.address, &result)
            .map_err(|err| ResolutionError::from(&err))?;
        Ok(result)
    }

    async fn geocode_with_retry(
        &self,
        address: &str,
        run: &RunContext,
    ) -> AppResult<GeocodeResult> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.limiter
                .acquire_with(|| {
                    run.live_calls.fetch_add(1, Ordering::SeqCst);
                })
                .await;
            match self.geocoder.geocode(address).await {
                Ok(result) => return Ok(result),
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        ?err,
                        attempt, address, "geocode request failed; retrying after {:?}", delay
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.retry.base_backoff.as_millis() as u64;
        let exponent = (attempt - 1).min(6);
        let base = Duration::from_millis(base_ms.saturating_mul(1 << exponent));
        let jitter = if base_ms == 0 {
            Duration::ZERO
        } else {
            let mut rng = self.jitter_rng.lock();
            Duration::from_millis(rng.gen_range(0..base_ms))
        };
        base.saturating_add(jitter)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io;

    use async_trait::async_trait;

    use super::*;
    use crate::geocoder::{Coordinates, GeocodeStatus};

    #[derive(Default)]
    struct ScriptedGeocoder {
        scripted: Mutex<HashMap<String, Vec<AppResult<GeocodeResult>>>>,
        calls: AtomicUsize,
    }

    impl ScriptedGeocoder {
        fn script(self, address: &str, mut responses: Vec<AppResult<GeocodeResult>>) -> Self {
            responses.reverse();
            self.scripted.lock().insert(address.to_string(), responses);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Geocoder for ScriptedGeocoder {
        async fn geocode(&self, address: &str) -> AppResult<GeocodeResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.scripted
                .lock()
                .get_mut(address)
                .and_then(|responses| responses.pop())
                .unwrap_or_else(|| Ok(GeocodeResult::ok(1.0, 1.0)))
        }
    }

    fn processor(cache: Arc<AddressCache>, geocoder: Arc<ScriptedGeocoder>) -> RowProcessor {
        RowProcessor::with_rng(
            cache,
            Arc::new(RateLimiter::new(50, Duration::from_millis(1000))),
            geocoder,
            RetryPolicy {
                max_attempts: 3,
                base_backoff: Duration::from_millis(10),
            },
            StdRng::seed_from_u64(7),
        )
    }

    fn network_error() -> AppError {
        AppError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
    }

    #[tokio::test]
    async fn uses_cache_before_api_call() {
        let cache = Arc::new(AddressCache::in_memory().unwrap());
        let record = AddressRecord::new("Cached Street 1");
        cache
            .store(&record.normalized_key, &record.address, &GeocodeResult::ok(2.0, 1.0))
            .unwrap();
        let geocoder = Arc::new(ScriptedGeocoder::default());
        let run = RunContext::new();
        let processor = processor(cache, geocoder.clone());

        let outcome = processor
            .process(InputRow::new(0, vec![], "  cached street 1 "), &run)
            .await
            .unwrap();
        assert_eq!(outcome.source, ResolutionSource::Cache);
        assert_eq!(
            outcome.result.coordinates,
            Some(Coordinates { lat: 2.0, lng: 1.0 })
        );
        assert_eq!(geocoder.calls(), 0);
        assert_eq!(run.live_calls(), 0);
    }

    #[tokio::test]
    async fn stores_live_results() {
        let cache = Arc::new(AddressCache::in_memory().unwrap());
        let geocoder = Arc::new(
            ScriptedGeocoder::default().script("Main St", vec![Ok(GeocodeResult::ok(3.0, 4.0))]),
        );
        let run = RunContext::new();
        let processor = processor(cache.clone(), geocoder.clone());

        let outcome = processor
            .process(InputRow::new(0, vec![], "Main St"), &run)
            .await
            .unwrap();
        assert_eq!(outcome.source, ResolutionSource::Live);
        let entry = cache.lookup("main st").unwrap().unwrap();
        assert_eq!(entry.result.coordinates, outcome.result.coordinates);
        assert_eq!(run.live_calls(), 1);
    }

    #[tokio::test]
    async fn zero_results_is_cached_as_success() {
        let cache = Arc::new(AddressCache::in_memory().unwrap());
        let geocoder = Arc::new(
            ScriptedGeocoder::default().script("Nowhere", vec![Ok(GeocodeResult::zero_results())]),
        );
        let run = RunContext::new();
        let processor = processor(cache.clone(), geocoder);

        let outcome = processor
            .process(InputRow::new(0, vec![], "Nowhere"), &run)
            .await
            .unwrap();
        assert_eq!(outcome.result.status, GeocodeStatus::ZeroResults);
        assert!(cache.lookup("nowhere").unwrap().is_some());
    }

    #[tokio::test]
    async fn provider_errors_fail_without_caching() {
        let cache = Arc::new(AddressCache::in_memory().unwrap());
        let geocoder = Arc::new(ScriptedGeocoder::default().script(
            "Denied",
            vec![Ok(GeocodeResult::with_status(GeocodeStatus::Other(
                "REQUEST_DENIED".into(),
            )))],
        ));
        let run = RunContext::new();
        let processor = processor(cache.clone(), geocoder.clone());

        let failure = processor
            .process(InputRow::new(4, vec![], "Denied"), &run)
            .await
            .unwrap_err();
        assert_eq!(failure.status, "REQUEST_DENIED");
        assert_eq!(failure.row.index, 4);
        assert_eq!(failure.row.address.address, "Denied");
        assert_eq!(geocoder.calls(), 1);
        assert!(cache.lookup("denied").unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_before_succeeding() {
        let cache = Arc::new(AddressCache::in_memory().unwrap());
        let geocoder = Arc::new(ScriptedGeocoder::default().script(
            "Flaky",
            vec![Err(network_error()), Ok(GeocodeResult::ok(5.0, 6.0))],
        ));
        let run = RunContext::new();
        let processor = processor(cache, geocoder.clone());

        let outcome = processor
            .process(InputRow::new(0, vec![], "Flaky"), &run)
            .await
            .unwrap();
        assert_eq!(outcome.source, ResolutionSource::Live);
        assert_eq!(geocoder.calls(), 2);
        assert_eq!(run.live_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let cache = Arc::new(AddressCache::in_memory().unwrap());
        let geocoder = Arc::new(ScriptedGeocoder::default().script(
            "Down",
            vec![Err(network_error()), Err(network_error()), Err(network_error())],
        ));
        let run = RunContext::new();
        let processor = processor(cache, geocoder.clone());

        let failure = processor
            .process(InputRow::new(0, vec![], "Down"), &run)
            .await
            .unwrap_err();
        assert_eq!(failure.status, "NETWORK_ERROR");
        assert_eq!(geocoder.calls(), 3);
    }

    #[tokio::test]
    async fn cache_write_failure_fails_the_row() {
        let cache = Arc::new(AddressCache::in_memory().unwrap());
        cache.fail_next_store();
        let geocoder = Arc::new(ScriptedGeocoder::default());
        let run = RunContext::new();
        let processor = processor(cache.clone(), geocoder);

        let failure = processor
            .process(InputRow::new(0, vec![], "Unwritable"), &run)
            .await
            .unwrap_err();
        assert_eq!(failure.status, "CACHE_ERROR");
        assert!(cache.lookup("unwritable").unwrap().is_none());
    }

    #[tokio::test]
    async fn blank_addresses_never_reach_the_provider() {
        let cache = Arc::new(AddressCache::in_memory().unwrap());
        let geocoder = Arc::new(ScriptedGeocoder::default());
        let run = RunContext::new();
        let processor = processor(cache, geocoder.clone());

        let failure = processor
            .process(InputRow::new(0, vec![], "   "), &run)
            .await
            .unwrap_err();
        assert_eq!(failure.status, "INVALID_ADDRESS");
        assert_eq!(geocoder.calls(), 0);
    }

    #[test]
    fn backoff_grows_exponentially() {
        let cache = Arc::new(AddressCache::in_memory().unwrap());
        let processor = processor(cache, Arc::new(ScriptedGeocoder::default()));
        let first = processor.backoff_delay(1);
        let third = processor.backoff_delay(3);
        assert!(first >= Duration::from_millis(10) && first < Duration::from_millis(20));
        assert!(third >= Duration::from_millis(40) && third < Duration::from_millis(50));
    }

    #[test]
    fn backoff_saturates_for_huge_base_delays() {
        let processor = RowProcessor::with_rng(
            Arc::new(AddressCache::in_memory().unwrap()),
            Arc::new(RateLimiter::new(50, Duration::from_millis(1000))),
            Arc::new(ScriptedGeocoder::default()),
            RetryPolicy {
                max_attempts: 10,
                base_backoff: Duration::from_millis(u64::MAX / 2),
            },
            StdRng::seed_from_u64(7),
        );
        let delay = processor.backoff_delay(9);
        assert!(delay >= Duration::from_millis(u64::MAX / 2));
    }

    #[tokio::test]
    async fn live_calls_are_counted_per_run() {
        let cache = Arc::new(AddressCache::in_memory().unwrap());
        let processor = processor(cache, Arc::new(ScriptedGeocoder::default()));

        let first = RunContext::new();
        processor
            .process(InputRow::new(0, vec![], "First St"), &first)
            .await
            .unwrap();
        let second = RunContext::new();
        processor
            .process(InputRow::new(0, vec![], "Second St"), &second)
            .await
            .unwrap();
        processor
            .process(InputRow::new(1, vec![], "First St"), &second)
            .await
            .unwrap();

        assert_eq!(first.live_calls(), 1);
        assert_eq!(second.live_calls(), 1);
    }
}
