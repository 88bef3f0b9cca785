use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tracing::info;

use crate::address::InputRow;
use crate::cache::AddressCache;
use crate::config::AppConfig;
use crate::geocoder::Geocoder;
use crate::processor::{ProcessingOutcome, RetryPolicy, RowFailure, RowProcessor, RunContext};
use crate::rate_limiter::RateLimiter;

pub const FAILED_STATUS: &str = "FAILED";

#[derive(Debug, Clone, Serialize)]
pub struct BatchProgress {
    pub total_rows: usize,
    pub processed: usize,
    pub failed: usize,
}

pub type ProgressObserver = Arc<dyn Fn(BatchProgress) + Send + Sync>;

#[derive(Debug, Clone)]
pub enum RowEntry {
    Resolved(ProcessingOutcome),
    Failed(RowFailure),
}

impl RowEntry {
    pub fn row(&self) -> &InputRow {
        match self {
            RowEntry::Resolved(outcome) => &outcome.row,
            RowEntry::Failed(failure) => &failure.row,
        }
    }

    pub fn status(&self) -> &str {
        match self {
            RowEntry::Resolved(outcome) => outcome.result.status.as_str(),
            RowEntry::Failed(failure) => &failure.status,
        }
    }
}

/// Result of one run: one entry per input row, in input order.
#[derive(Debug, Clone)]
pub struct BatchReport {
    entries: Vec<RowEntry>,
    pub live_calls: usize,
    pub status_counts: BTreeMap<String, usize>,
}

impl BatchReport {
    fn new(entries: Vec<RowEntry>, live_calls: usize) -> Self {
        let mut status_counts = BTreeMap::new();
        for entry in &entries {
            *status_counts.entry(entry.status().to_string()).or_insert(0) += 1;
        }
        Self {
            entries,
            live_calls,
            status_counts,
        }
    }

    pub fn entries(&self) -> &[RowEntry] {
        &self.entries
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &ProcessingOutcome> {
        self.entries.iter().filter_map(|entry| match entry {
            RowEntry::Resolved(outcome) => Some(outcome),
            RowEntry::Failed(_) => None,
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = &RowFailure> {
        self.entries.iter().filter_map(|entry| match entry {
            RowEntry::Failed(failure) => Some(failure),
            RowEntry::Resolved(_) => None,
        })
    }

    pub fn total_rows(&self) -> usize {
        self.entries.len()
    }

    pub fn resolved_count(&self) -> usize {
        self.outcomes().count()
    }

    pub fn failed_count(&self) -> usize {
        self.failures().count()
    }
}

/// Runs every row through a [`RowProcessor`] with at most `max_concurrency`
/// rows in flight. Row failures are recorded, never fatal.
pub struct BatchCoordinator {
    processor: RowProcessor,
    max_concurrency: usize,
}

impl BatchCoordinator {
    pub fn new(processor: RowProcessor, max_concurrency: usize) -> Self {
        Self {
            processor,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn from_config(
        config: &AppConfig,
        cache: Arc<AddressCache>,
        geocoder: Arc<dyn Geocoder>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit_calls,
            config.rate_window(),
        ));
        let processor =
            RowProcessor::new(cache, limiter, geocoder, RetryPolicy::from_config(config));
        Self::new(processor, config.max_concurrency)
    }

    pub async fn run(
        &self,
        rows: Vec<InputRow>,
        observer: Option<ProgressObserver>,
    ) -> BatchReport {
        let total_rows = rows.len();
        info!(
            total_rows,
            max_concurrency = self.max_concurrency,
            "starting geocode batch"
        );

        let run = RunContext::new();
        let run = &run;
        let mut completions = stream::iter(rows.into_iter().enumerate())
            .map(|(position, row)| async move {
                let entry = match self.processor.process(row, run).await {
                    Ok(outcome) => RowEntry::Resolved(outcome),
                    Err(failure) => RowEntry::Failed(failure),
                };
                (position, entry)
            })
            .buffer_unordered(self.max_concurrency);

        let mut completed = Vec::with_capacity(total_rows);
        let mut failed = 0;
        while let Some((position, entry)) = completions.next().await {
            if matches!(entry, RowEntry::Failed(_)) {
                failed += 1;
            }
            completed.push((position, entry));
            if let Some(callback) = &observer {
                callback(BatchProgress {
                    total_rows,
                    processed: completed.len(),
                    failed,
                });
            }
        }

        completed.sort_by_key(|(position, _)| *position);
        let entries = completed.into_iter().map(|(_, entry)| entry).collect();
        let report = BatchReport::new(entries, run.live_calls());
        info!(
            total_rows,
            resolved = report.resolved_count(),
            failed = report.failed_count(),
            live_calls = report.live_calls,
            "geocode batch finished"
        );
        report
    }
}
