//! Errors that can end a run.
//!
//! Per-fetch failures never show up here: they are folded into
//! [`FetchResult`](crate::FetchResult) statuses. Only an invalid catalog,
//! an exhausted sink or a cancelled run reach the caller.

use std::fmt;

use crate::catalog::CatalogError;
use crate::sink::SinkError;

#[derive(Debug)]
pub enum PipelineError {
    /// The source catalog failed validation.
    Catalog(CatalogError),
    /// The batch write failed for good.
    Sink(SinkError),
    /// The run was cancelled before every pipeline drained. No aggregated
    /// records were produced.
    Cancelled { completed: usize },
    /// Nothing to do.
    NoProducts,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Catalog(e) => write!(f, "Catalog error: {}", e),
            Self::Sink(e) => write!(f, "Sink error: {}", e),
            Self::Cancelled { completed } => {
                write!(f, "Run cancelled after {} completed fetches", completed)
            }
            Self::NoProducts => write!(f, "No products to process"),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Catalog(e) => Some(e),
            Self::Sink(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CatalogError> for PipelineError {
    fn from(e: CatalogError) -> Self {
        Self::Catalog(e)
    }
}

impl From<SinkError> for PipelineError {
    fn from(e: SinkError) -> Self {
        Self::Sink(e)
    }
}
