use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::batch::{BatchReport, RowEntry, FAILED_STATUS};

const OUTPUT_COLUMNS: [&str; 4] = ["lat", "lng", "geocode_status", "geocode_source"];

/// Input headers followed by the geocode columns.
pub fn output_headers(input_headers: &[String]) -> Vec<String> {
    input_headers
        .iter()
        .cloned()
        .chain(OUTPUT_COLUMNS.iter().map(|column| column.to_string()))
        .collect()
}

/// One output row per input row, in input order. Failed rows keep their
/// fields with empty coordinates.
pub fn output_rows(report: &BatchReport) -> Vec<Vec<String>> {
    report
        .entries()
        .iter()
        .map(|entry| {
            let mut fields = entry.row().fields.clone();
            match entry {
                RowEntry::Resolved(outcome) => {
                    let (lat, lng) = outcome
                        .result
                        .coordinates
                        .map(|c| (c.lat.to_string(), c.lng.to_string()))
                        .unwrap_or_default();
                    fields.push(lat);
                    fields.push(lng);
                    fields.push(outcome.result.status.as_str().to_string());
                    fields.push(outcome.source.as_str().to_string());
                }
                RowEntry::Failed(failure) => {
                    fields.push(String::new());
                    fields.push(String::new());
                    fields.push(failure.status.clone());
                    fields.push("failed".to_string());
                }
            }
            fields
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub output_path: PathBuf,
    pub rows_written: usize,
    pub live_calls: usize,
    pub failed: usize,
    pub status_counts: Vec<(String, usize)>,
}

impl RunSummary {
    pub fn new(report: &BatchReport, output_path: &Path) -> Self {
        Self {
            output_path: output_path.to_path_buf(),
            rows_written: report.total_rows(),
            live_calls: report.live_calls,
            failed: report.failed_count(),
            status_counts: report
                .status_counts
                .iter()
                .map(|(status, count)| (status.clone(), *count))
                .collect(),
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Wrote {} records to {}.",
            self.rows_written,
            self.output_path.display()
        )?;
        writeln!(f, "Hit Google {} times.", self.live_calls)?;
        let counts = self
            .status_counts
            .iter()
            .map(|(status, count)| format!("{status}={count}"))
            .chain(std::iter::once(format!("{FAILED_STATUS}={}", self.failed)))
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "Statuses: {counts}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_geocode_columns() {
        let headers = output_headers(&["id".to_string(), "address".to_string()]);
        assert_eq!(
            headers,
            vec!["id", "address", "lat", "lng", "geocode_status", "geocode_source"]
        );
    }
}
