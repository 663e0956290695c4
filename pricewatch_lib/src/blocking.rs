//! Per-source 403/429 counters with one-shot threshold alerts.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::SourceId;

/// Default number of same-class rejections before an alert.
pub const DEFAULT_BLOCKING_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum BlockCode {
    Forbidden,
    RateLimited,
}

impl BlockCode {
    pub fn status(&self) -> u16 {
        match self {
            Self::Forbidden => 403,
            Self::RateLimited => 429,
        }
    }
}

impl fmt::Display for BlockCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockEvent {
    pub source: SourceId,
    pub code: BlockCode,
    pub at: DateTime<Utc>,
}

impl BlockEvent {
    pub fn now(source: SourceId, code: BlockCode) -> Self {
        Self {
            source,
            code,
            at: Utc::now(),
        }
    }
}

/// Raised once when a counter reaches the threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockAlert {
    pub source: SourceId,
    pub code: BlockCode,
    pub count: u32,
    pub at: DateTime<Utc>,
}

/// Counter value handed out by [`BlockingDetector::report`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockCount {
    pub source: SourceId,
    pub code: BlockCode,
    pub count: u32,
    pub last_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Counter {
    count: u32,
    alerted: bool,
    last_at: Option<DateTime<Utc>>,
}

/// Run-scoped blocking counters shared by every pipeline.
#[derive(Debug)]
pub struct BlockingDetector {
    threshold: u32,
    counters: Mutex<HashMap<(SourceId, BlockCode), Counter>>,
}

impl BlockingDetector {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Counts one rejection. Returns an alert the first time the counter
    /// reaches the threshold since the last [`report`](Self::report).
    pub fn record(&self, event: BlockEvent) -> Option<BlockAlert> {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let counter = counters
            .entry((event.source.clone(), event.code))
            .or_default();
        counter.count += 1;
        counter.last_at = Some(event.at);

        if counter.count >= self.threshold && !counter.alerted {
            counter.alerted = true;
            tracing::warn!(
                "{} returned {} {} times; requests are likely being blocked",
                event.source,
                event.code,
                counter.count
            );
            return Some(BlockAlert {
                source: event.source,
                code: event.code,
                count: counter.count,
                at: event.at,
            });
        }
        None
    }

    pub fn count(&self, source: &SourceId, code: BlockCode) -> u32 {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters
            .get(&(source.clone(), code))
            .map(|c| c.count)
            .unwrap_or(0)
    }

    /// Reads every counter, sorted by source then code, and re-arms the
    /// alerts. Counts keep growing.
    pub fn report(&self) -> Vec<BlockCount> {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<BlockCount> = counters
            .iter_mut()
            .map(|((source, code), counter)| {
                counter.alerted = false;
                BlockCount {
                    source: source.clone(),
                    code: *code,
                    count: counter.count,
                    last_at: counter.last_at,
                }
            })
            .collect();
        out.sort_by(|a, b| (&a.source, a.code).cmp(&(&b.source, b.code)));
        out
    }
}

impl Default for BlockingDetector {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCKING_THRESHOLD)
    }
}
