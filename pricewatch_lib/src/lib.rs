//! Library layer for pricewatch: the multi-source price collection engine.
//!
//! Runs one throttled worker pool per source over a product list, detects
//! blocking, reconciles product names across sources with fuzzy matching and
//! merges everything into one record per product before a single batched
//! write.

pub mod aggregate;
pub mod blocking;
pub mod catalog;
pub mod engine;
pub mod error;
pub mod extract;
pub mod lookup_cache;
pub mod matcher;
pub mod model;
pub mod progress;
pub mod rate;
pub mod retry;
pub mod scheduler;
pub mod sink;
pub mod source;

pub use pricewatch_http;

pub use aggregate::{aggregate, AggregatedRecord, SourceSummary};
pub use blocking::{BlockAlert, BlockCode, BlockCount, BlockEvent, BlockingDetector};
pub use catalog::{Catalog, CatalogError, SourceConfig};
pub use engine::{Collection, Engine, RunReport};
pub use error::PipelineError;
pub use extract::{Candidate, Extractor};
pub use model::{FetchResult, FetchStatus, HintOrigin, Product, ProductHint, ProductId, SourceId};
pub use progress::{ProgressEvent, ProgressSink};
pub use sink::{RecordBatch, Sink, SinkError, SinkWriter};
