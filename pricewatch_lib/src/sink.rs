//! Batched output with retry.
//!
//! All records of a run go out as one keyed table update. Transient
//! failures retry the whole batch with exponential backoff.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::time::sleep;

use crate::aggregate::AggregatedRecord;
use crate::model::{ProductId, SourceId};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    /// Worth retrying (network hiccup, lock contention...).
    #[error("Transient sink failure: {0}")]
    Retryable(String),
    #[error("Sink failure: {0}")]
    Fatal(String),
    #[error("Sink write failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

/// One cell of the output table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Number(f64),
    Text(String),
    Empty,
}

impl CellValue {
    fn number(value: Option<f64>) -> Self {
        value.map(Self::Number).unwrap_or(Self::Empty)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchRow {
    pub key: ProductId,
    pub cells: Vec<CellValue>,
}

/// Name of the key column.
pub const KEY_COLUMN: &str = "product_id";

/// The whole run's output as a keyed table, plus the records it was built
/// from for sinks that prefer structured output.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordBatch {
    pub columns: Vec<String>,
    pub rows: Vec<BatchRow>,
    pub records: Vec<AggregatedRecord>,
}

impl RecordBatch {
    /// Columns: `name` and `base_price` from the input, `price_<source>`
    /// for every source, then `match_<source>`, then `match_source_<source>`,
    /// then `mean_price` and `min_price`.
    pub fn from_records(sources: &[SourceId], records: &[AggregatedRecord]) -> Self {
        let mut columns: Vec<String> = Vec::with_capacity(sources.len() * 3 + 4);
        columns.push("name".to_string());
        columns.push("base_price".to_string());
        columns.extend(sources.iter().map(|s| format!("price_{}", s)));
        columns.extend(sources.iter().map(|s| format!("match_{}", s)));
        columns.extend(sources.iter().map(|s| format!("match_source_{}", s)));
        columns.push("mean_price".to_string());
        columns.push("min_price".to_string());

        let rows = records
            .iter()
            .map(|record| {
                let mut cells = Vec::with_capacity(columns.len());
                cells.push(
                    record
                        .name
                        .as_ref()
                        .map(|n| CellValue::Text(n.clone()))
                        .unwrap_or(CellValue::Empty),
                );
                cells.push(CellValue::number(record.base_price));
                cells.extend(
                    sources
                        .iter()
                        .map(|s| CellValue::number(record.prices.get(s).copied())),
                );
                cells.extend(
                    sources
                        .iter()
                        .map(|s| CellValue::number(record.match_scores.get(s).copied())),
                );
                cells.extend(sources.iter().map(|s| {
                    record
                        .match_sources
                        .get(s)
                        .map(|o| CellValue::Text(o.to_string()))
                        .unwrap_or(CellValue::Empty)
                }));
                cells.push(CellValue::number(record.mean));
                cells.push(CellValue::number(record.min));
                BatchRow {
                    key: record.product_id.clone(),
                    cells,
                }
            })
            .collect();

        Self {
            columns,
            rows,
            records: records.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Destination of a run's batch. Writes must be keyed overwrites so that a
/// replayed batch leaves the same state.
pub trait Sink: Send + Sync {
    fn write_batch(
        &self,
        batch: &RecordBatch,
    ) -> impl Future<Output = Result<(), SinkError>> + Send;
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: u32,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            multiplier: 2,
            max_retries: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteReport {
    pub rows: usize,
    pub attempts: u32,
}

pub struct SinkWriter<S> {
    sink: S,
    backoff: BackoffPolicy,
}

impl<S: Sink> SinkWriter<S> {
    /// Wraps `sink` with the default backoff: 2s initial delay, doubling,
    /// two retries.
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Overrides the retry schedule.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Builds the batch and writes it, retrying transient failures.
    pub async fn write(
        &self,
        sources: &[SourceId],
        records: &[AggregatedRecord],
    ) -> Result<WriteReport, SinkError> {
        let batch = RecordBatch::from_records(sources, records);
        self.write_batch(&batch).await
    }

    /// Writes a prepared batch. Retryable failures are retried with
    /// exponential backoff up to `max_retries` times, then reported as
    /// [`SinkError::Exhausted`]. Any other error is returned at once.
    pub async fn write_batch(&self, batch: &RecordBatch) -> Result<WriteReport, SinkError> {
        let mut attempts = 0u32;
        let mut delay = self.backoff.initial;

        loop {
            attempts += 1;
            match self.sink.write_batch(batch).await {
                Ok(()) => {
                    tracing::info!("Wrote {} rows in {} attempt(s)", batch.len(), attempts);
                    return Ok(WriteReport {
                        rows: batch.len(),
                        attempts,
                    });
                }
                Err(SinkError::Retryable(msg)) => {
                    if attempts > self.backoff.max_retries {
                        return Err(SinkError::Exhausted {
                            attempts,
                            last: msg,
                        });
                    }
                    tracing::warn!(
                        "Batch write failed (attempt {}): {}; retrying in {}s",
                        attempts,
                        msg,
                        delay.as_secs_f64()
                    );
                    sleep(delay).await;
                    delay *= self.backoff.multiplier;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
