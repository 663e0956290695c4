//! Progress reporting hooks. Observers never influence control flow.

use crate::blocking::BlockAlert;
use crate::model::{FetchStatus, SourceId};

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub source: SourceId,
    pub completed: usize,
    pub total: usize,
    pub last: FetchStatus,
}

pub trait ProgressSink: Send + Sync {
    fn on_start(&self, _source: &SourceId, _total: usize) {}

    fn on_event(&self, event: &ProgressEvent);

    /// A source crossed the blocking threshold. Fires once per counter
    /// until the detector is reported.
    fn on_alert(&self, _alert: &BlockAlert) {}

    fn on_finish(&self, _source: &SourceId) {}
}

/// Logs each event at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn on_start(&self, source: &SourceId, total: usize) {
        tracing::info!("{}: {} products queued", source, total);
    }

    fn on_event(&self, event: &ProgressEvent) {
        tracing::debug!(
            "{} [{}/{}] {}",
            event.source,
            event.completed,
            event.total,
            event.last
        );
    }

    fn on_finish(&self, source: &SourceId) {
        tracing::info!("{}: done", source);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_event(&self, _event: &ProgressEvent) {}
}
