//! The `run` subcommand: collect prices for a product list and write them.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use pricewatch_lib::progress::LogProgress;
use pricewatch_lib::pricewatch_http::HttpClient;
use pricewatch_lib::{Engine, Product, ProgressSink, RunReport, Sink, SinkWriter, SourceId};
use tokio_util::sync::CancellationToken;

use crate::commands::load_catalog;
use crate::input::read_products;
use crate::output::{self, CsvFileSink, JsonFileSink, OutputFormat};
use crate::progress::BarProgress;

#[derive(Args)]
pub struct RunArgs {
    /// Product list: `name;id[;base price]` rows or one id per line
    pub input: PathBuf,

    /// Output file
    #[arg(short, long)]
    pub output: PathBuf,

    /// Output format (default: from the output file extension)
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,

    /// Source catalog (TOML or YAML); defaults to the built-in catalog
    #[arg(long, env = "PRICEWATCH_CATALOG")]
    pub catalog: Option<PathBuf>,

    /// Only process the first N products
    #[arg(long)]
    pub limit: Option<usize>,

    /// Restrict the run to these sources (repeatable)
    #[arg(long = "source")]
    pub sources: Vec<String>,

    /// Log progress instead of drawing progress bars
    #[arg(long)]
    pub no_progress: bool,
}

pub async fn run(args: &RunArgs) -> Result<()> {
    let mut catalog = load_catalog(args.catalog.as_deref())?;
    if !args.sources.is_empty() {
        let names: Vec<SourceId> = args.sources.iter().map(|s| SourceId::new(s.as_str())).collect();
        catalog = catalog.select(&names)?;
    }

    let mut products = read_products(&args.input)?;
    if let Some(limit) = args.limit {
        products.truncate(limit);
    }
    if products.is_empty() {
        bail!("No products found in {}", args.input.display());
    }
    eprintln!("{} products to process", products.len());

    let client = HttpClient::new().context("Failed to build HTTP client")?;
    let progress: Arc<dyn ProgressSink> = if args.no_progress {
        Arc::new(LogProgress)
    } else {
        Arc::new(BarProgress::new())
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; finishing in-flight requests");
            on_signal.cancel();
        }
    });

    let engine = Engine::new(catalog, Arc::new(client))?
        .with_progress(progress)
        .with_cancel(cancel);

    let format = args
        .format
        .unwrap_or_else(|| OutputFormat::from_path(&args.output));
    let report = match format {
        OutputFormat::Csv => write_with(&engine, products, CsvFileSink::new(&args.output)).await?,
        OutputFormat::Json => write_with(&engine, products, JsonFileSink::new(&args.output)).await?,
    };

    eprintln!(
        "Wrote {} rows to {} ({} attempt(s))",
        report.write.rows,
        args.output.display(),
        report.write.attempts
    );
    if report.duplicates > 0 {
        eprintln!("{} duplicate input rows were ignored", report.duplicates);
    }
    output::print_summary_table(&report.summaries);
    output::print_blocking_table(&report.blocking);
    Ok(())
}

async fn write_with<S: Sink>(
    engine: &Engine<HttpClient>,
    products: Vec<Product>,
    sink: S,
) -> Result<RunReport> {
    let writer = SinkWriter::new(sink);
    Ok(engine.run(products, &writer).await?)
}
