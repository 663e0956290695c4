//! Run orchestration.
//!
//! Sources are grouped into stages by their hint dependencies. Within a stage
//! every source runs its own pool concurrently; a stage starts once the
//! previous one has drained, so names found by a provider are available as
//! hints to its dependents.

use std::collections::HashMap;
use std::sync::Arc;

use pricewatch_http::Fetch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::aggregate::{aggregate, AggregatedRecord, SourceSummary};
use crate::blocking::{BlockCount, BlockingDetector};
use crate::catalog::{Catalog, PacingMode, PeriodicPause, PoolConfig, SourceConfig};
use crate::error::PipelineError;
use crate::model::{dedup_products, FetchResult, FetchStatus, Product, ProductHint, ProductId, SourceId};
use crate::progress::{LogProgress, ProgressSink};
use crate::rate::{Pacer, RateController};
use crate::scheduler::{PoolPolicy, Scheduler, WorkQueue};
use crate::sink::{Sink, SinkWriter, WriteReport};
use crate::source::SourceRunner;

/// One source's runner and pool settings.
struct Pipeline<F> {
    runner: Arc<SourceRunner<F>>,
    policy: PoolPolicy,
    pause: Option<PeriodicPause>,
    hints_from: Option<SourceId>,
}

/// Everything collected by a run, before aggregation.
#[derive(Debug, Clone)]
pub struct Collection {
    /// Distinct input products, in input order.
    pub products: Vec<Product>,
    pub results: Vec<FetchResult>,
    pub summaries: Vec<SourceSummary>,
    pub blocking: Vec<BlockCount>,
    /// Number of input rows dropped as repeated ids.
    pub duplicates: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub records: Vec<AggregatedRecord>,
    pub summaries: Vec<SourceSummary>,
    pub blocking: Vec<BlockCount>,
    pub duplicates: usize,
    pub write: WriteReport,
}

pub struct Engine<F> {
    sources: Vec<SourceId>,
    stages: Vec<Vec<SourceId>>,
    pipelines: HashMap<SourceId, Pipeline<F>>,
    detector: Arc<BlockingDetector>,
    progress: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl<F: Fetch + 'static> Engine<F> {
    /// Validates the catalog and builds one pipeline per enabled source.
    pub fn new(catalog: Catalog, fetcher: Arc<F>) -> Result<Self, PipelineError> {
        catalog.validate()?;
        let catalog = catalog.enabled();
        let stages = catalog.stages()?;
        let detector = Arc::new(BlockingDetector::new(catalog.blocking_threshold));

        let mut sources = Vec::with_capacity(catalog.sources.len());
        let mut pipelines = HashMap::new();
        for config in catalog.sources {
            let extractor = config.extractor.build(config.name.as_str())?;
            let (pacer, policy) = pool_for(&config);
            let name = config.name.clone();
            let pause = config.pause();
            let hints_from = config.hints_from().cloned();
            let runner = SourceRunner::new(
                config,
                Arc::clone(&fetcher),
                extractor,
                pacer,
                Arc::clone(&detector),
            );
            sources.push(name.clone());
            pipelines.insert(
                name,
                Pipeline {
                    runner: Arc::new(runner),
                    policy,
                    pause,
                    hints_from,
                },
            );
        }

        Ok(Self {
            sources,
            stages,
            pipelines,
            detector,
            progress: Arc::new(LogProgress),
            cancel: CancellationToken::new(),
        })
    }

    /// Replaces the default [`LogProgress`] observer. It also receives
    /// blocking alerts.
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Uses an external token, so a signal handler can stop the run. Once
    /// cancelled, workers finish their current product and stop.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Source names in catalog order.
    pub fn sources(&self) -> &[SourceId] {
        &self.sources
    }

    /// Source names grouped by hint dependency, in execution order.
    pub fn stages(&self) -> &[Vec<SourceId>] {
        &self.stages
    }

    pub fn detector(&self) -> &BlockingDetector {
        &self.detector
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs every source over the products and gathers the raw results.
    ///
    /// A cancelled run still returns what was collected, with `cancelled`
    /// set.
    pub async fn collect(&self, products: Vec<Product>) -> Result<Collection, PipelineError> {
        let (products, duplicates) = dedup_products(products);
        if duplicates > 0 {
            tracing::warn!("Dropped {} duplicate product rows", duplicates);
        }
        if products.is_empty() {
            return Err(PipelineError::NoProducts);
        }

        tracing::info!(
            "Collecting {} products from {} sources in {} stage(s)",
            products.len(),
            self.sources.len(),
            self.stages.len()
        );

        let mut results: Vec<FetchResult> = Vec::new();
        for (n, stage) in self.stages.iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            tracing::debug!("Stage {}: {:?}", n + 1, stage);

            let mut join_set = JoinSet::new();
            for name in stage {
                let Some(pipeline) = self.pipelines.get(name) else {
                    continue;
                };
                let stage_products =
                    with_provider_hints(&products, pipeline.hints_from.as_ref(), &results);
                let scheduler = Scheduler::new(
                    name.clone(),
                    pipeline.policy.clone(),
                    Arc::clone(&self.progress),
                    self.cancel.clone(),
                )
                .with_pause(pipeline.pause);
                let runner = Arc::clone(&pipeline.runner);
                let progress = Arc::clone(&self.progress);

                join_set.spawn(async move {
                    let queue = WorkQueue::from_products(&stage_products);
                    scheduler
                        .run(queue, move |item| {
                            let runner = Arc::clone(&runner);
                            let progress = Arc::clone(&progress);
                            async move { runner.fetch_product(&item, progress.as_ref()).await }
                        })
                        .await
                });
            }

            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(stage_results) => results.extend(stage_results),
                    Err(e) => tracing::error!("Source pipeline failed: {}", e),
                }
            }
        }

        let summaries = self
            .sources
            .iter()
            .map(|name| {
                let rate = self
                    .pipelines
                    .get(name)
                    .and_then(|p| p.runner.pacer().controller())
                    .map(|c| c.snapshot());
                SourceSummary::from_results(name, &results, &self.detector, rate)
            })
            .collect();

        let cancelled = self.cancel.is_cancelled();
        if cancelled {
            tracing::warn!("Run cancelled with {} results collected", results.len());
        }

        Ok(Collection {
            products,
            results,
            summaries,
            blocking: self.detector.report(),
            duplicates,
            cancelled,
        })
    }

    /// Collects, aggregates and writes the batch. A cancelled run writes
    /// nothing.
    pub async fn run<S: Sink>(
        &self,
        products: Vec<Product>,
        writer: &SinkWriter<S>,
    ) -> Result<RunReport, PipelineError> {
        let collection = self.collect(products).await?;
        if collection.cancelled {
            return Err(PipelineError::Cancelled {
                completed: collection.results.len(),
            });
        }

        let records = aggregate(&collection.products, &collection.results);
        let write = writer.write(&self.sources, &records).await?;

        Ok(RunReport {
            records,
            summaries: collection.summaries,
            blocking: collection.blocking,
            duplicates: collection.duplicates,
            write,
        })
    }
}

fn pool_for(config: &SourceConfig) -> (Pacer, PoolPolicy) {
    match &config.pool {
        PoolConfig::Adaptive(adaptive) => {
            let controller = Arc::new(RateController::new(adaptive.clone()));
            let policy = PoolPolicy::Adaptive {
                controller: Arc::clone(&controller),
                batch_size: adaptive.batch_size,
            };
            (Pacer::Adaptive(controller), policy)
        }
        PoolConfig::Fixed { workers } => {
            let pacer = match config.pacing {
                PacingMode::Human => Pacer::Human,
                PacingMode::Off => Pacer::Off,
            };
            (pacer, PoolPolicy::Fixed { workers: *workers })
        }
    }
}

/// Adds the names `provider` found as extra hints.
fn with_provider_hints(
    products: &[Product],
    provider: Option<&SourceId>,
    results: &[FetchResult],
) -> Vec<Product> {
    let Some(provider) = provider else {
        return products.to_vec();
    };
    let names: HashMap<&ProductId, &str> = results
        .iter()
        .filter(|r| &r.source == provider && r.status == FetchStatus::Found)
        .filter_map(|r| r.matched_name.as_deref().map(|name| (&r.product_id, name)))
        .collect();

    products
        .iter()
        .map(|product| match names.get(&product.id) {
            Some(name) => product
                .clone()
                .with_hint(ProductHint::from_source(*name, provider)),
            None => product.clone(),
        })
        .collect()
}
