use std::path::{Path, PathBuf};

use pricewatch_lib::aggregate::SourceSummary;
use pricewatch_lib::sink::{CellValue, KEY_COLUMN};
use pricewatch_lib::{BlockCount, RecordBatch, Sink, SinkError};
use serde::Serialize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Csv,
    Json,
}

impl OutputFormat {
    /// `.json` files get JSON, anything else CSV.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Csv,
        }
    }
}

/// Integers without decimals, everything else with two decimals and a
/// decimal comma.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{:.2}", value).replace('.', ",")
    }
}

fn format_cell(cell: &CellValue) -> String {
    match cell {
        CellValue::Number(n) => format_number(*n),
        CellValue::Text(s) => s.clone(),
        CellValue::Empty => String::new(),
    }
}

pub fn batch_to_csv(batch: &RecordBatch) -> Result<Vec<u8>, csv::Error> {
    let mut wtr = csv::WriterBuilder::new()
        .delimiter(b';')
        .from_writer(Vec::new());

    let mut header = Vec::with_capacity(batch.columns.len() + 1);
    header.push(KEY_COLUMN.to_string());
    header.extend(batch.columns.iter().cloned());
    wtr.write_record(&header)?;

    for row in &batch.rows {
        let mut fields = Vec::with_capacity(row.cells.len() + 1);
        fields.push(row.key.to_string());
        fields.extend(row.cells.iter().map(format_cell));
        wtr.write_record(&fields)?;
    }
    wtr.flush()?;
    wtr.into_inner().map_err(|e| csv::Error::from(e.into_error()))
}

/// Writes next to the target and renames over it, so a replayed batch
/// replaces the file.
async fn replace_file(path: &Path, contents: Vec<u8>) -> Result<(), SinkError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, contents)
        .await
        .map_err(|e| SinkError::Retryable(format!("{}: {}", tmp.display(), e)))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| SinkError::Retryable(format!("{}: {}", path.display(), e)))
}

pub struct CsvFileSink {
    path: PathBuf,
}

impl CsvFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Sink for CsvFileSink {
    async fn write_batch(&self, batch: &RecordBatch) -> Result<(), SinkError> {
        let contents = batch_to_csv(batch).map_err(|e| SinkError::Fatal(e.to_string()))?;
        replace_file(&self.path, contents).await
    }
}

pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Sink for JsonFileSink {
    async fn write_batch(&self, batch: &RecordBatch) -> Result<(), SinkError> {
        let contents = serde_json::to_vec_pretty(&batch.records)
            .map_err(|e| SinkError::Fatal(e.to_string()))?;
        replace_file(&self.path, contents).await
    }
}

#[derive(Tabled, Serialize)]
struct SummaryRow {
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Found")]
    found: usize,
    #[tabled(rename = "Not found")]
    not_found: usize,
    #[tabled(rename = "Blocked")]
    blocked: usize,
    #[tabled(rename = "Coverage")]
    coverage: String,
    #[tabled(rename = "Mean score")]
    mean_score: String,
    #[tabled(rename = "High/Med/Low")]
    quality: String,
    #[tabled(rename = "Matched via")]
    origins: String,
    #[tabled(rename = "403")]
    forbidden: u32,
    #[tabled(rename = "429")]
    rate_limited: u32,
    #[tabled(rename = "Rate")]
    rate: String,
}

#[derive(Tabled, Serialize)]
struct BlockingRow {
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Status")]
    code: String,
    #[tabled(rename = "Count")]
    count: u32,
    #[tabled(rename = "Last seen")]
    last_at: String,
}

// -- Row builders --

fn build_summary_rows(summaries: &[SourceSummary]) -> Vec<SummaryRow> {
    summaries
        .iter()
        .map(|s| SummaryRow {
            source: s.source.to_string(),
            found: s.found,
            not_found: s.not_found,
            blocked: s.blocked,
            coverage: format!("{:.1}%", s.coverage),
            mean_score: s.mean_score.map(|m| format!("{:.0}", m)).unwrap_or_default(),
            quality: if s.mean_score.is_some() {
                format!("{}/{}/{}", s.quality.high, s.quality.medium, s.quality.low)
            } else {
                String::new()
            },
            origins: s
                .origins
                .iter()
                .map(|(origin, n)| format!("{} {}", origin, n))
                .collect::<Vec<_>>()
                .join(", "),
            forbidden: s.forbidden_count,
            rate_limited: s.rate_limited_count,
            rate: s
                .rate
                .as_ref()
                .map(|r| {
                    let latency = r
                        .mean_latency_ms
                        .map(|ms| format!(", {:.0}ms", ms))
                        .unwrap_or_default();
                    format!("{:.2}s x{}{}", r.delay_secs, r.concurrency, latency)
                })
                .unwrap_or_default(),
        })
        .collect()
}

fn build_blocking_rows(blocking: &[BlockCount]) -> Vec<BlockingRow> {
    blocking
        .iter()
        .map(|b| BlockingRow {
            source: b.source.to_string(),
            code: b.code.to_string(),
            count: b.count,
            last_at: b
                .last_at
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_default(),
        })
        .collect()
}

// -- Table output --

pub fn print_summary_table(summaries: &[SourceSummary]) {
    let mut table = Table::new(build_summary_rows(summaries));
    table.with(Style::rounded());
    println!("{}", table);
}

pub fn print_blocking_table(blocking: &[BlockCount]) {
    if blocking.is_empty() {
        return;
    }
    println!("{}", Table::new(build_blocking_rows(blocking)));
}

// -- JSON output --

pub fn print_json<T: serde::Serialize>(data: &T) {
    match serde_json::to_string_pretty(data) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to serialize to JSON: {}", e),
    }
}
