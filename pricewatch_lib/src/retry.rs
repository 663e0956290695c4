//! Bounded retry loop around a single fetch.
//!
//! 429s cool down and retry up to a cap, 403s either abort or retry with a
//! longer cooldown depending on the source, and timeouts or transport errors
//! retry immediately a few times. Running out of attempts is an outcome, not
//! an error.

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};

use pricewatch_http::{Fetch, FetchRequest, HttpResponse, StatusClass};

use crate::blocking::{BlockCode, BlockEvent, BlockingDetector};
use crate::model::SourceId;
use crate::progress::ProgressSink;
use crate::rate::{Pacer, SecondsRange};

/// What to do when a source answers 403.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ForbiddenPolicy {
    /// Give up on this product immediately.
    #[default]
    Abort,
    Retry {
        max_retries: u32,
        cooldown: SecondsRange,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries_429: u32,
    pub cooldown_429: SecondsRange,
    pub forbidden: ForbiddenPolicy,
    pub max_transport_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries_429: 3,
            cooldown_429: SecondsRange::new(60.0, 90.0),
            forbidden: ForbiddenPolicy::Abort,
            max_transport_retries: 2,
        }
    }
}

/// Terminal result of [`fetch_with_retry`].
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success(HttpResponse),
    /// Non-blocking failure: 404, 5xx, or transport errors past the cap
    /// (`status` is `None` then).
    Absent { status: Option<u16> },
    /// Still rejected with 403/429 after the allowed retries.
    Blocked(BlockCode),
}

/// Run-scoped collaborators for one source's fetches.
pub struct RetryContext<'a> {
    pub source: &'a SourceId,
    pub policy: &'a RetryPolicy,
    pub pacer: &'a Pacer,
    pub detector: &'a BlockingDetector,
    /// Receives threshold alerts from `detector`.
    pub progress: &'a dyn ProgressSink,
}

pub async fn fetch_with_retry<F: Fetch>(
    fetcher: &F,
    request: FetchRequest,
    ctx: &RetryContext<'_>,
) -> AttemptOutcome {
    let mut rate_limited_retries = 0u32;
    let mut forbidden_retries = 0u32;
    let mut transport_retries = 0u32;

    loop {
        let pause = ctx.pacer.next_delay();
        if !pause.is_zero() {
            sleep(pause).await;
        }

        let started = Instant::now();
        let response = match fetcher.fetch(request.clone()).await {
            Ok(response) => response,
            Err(e) => {
                if transport_retries >= ctx.policy.max_transport_retries {
                    tracing::debug!("{}: giving up on {}: {}", ctx.source, request.url, e);
                    return AttemptOutcome::Absent { status: None };
                }
                transport_retries += 1;
                tracing::debug!(
                    "{}: {} (retry {}/{})",
                    ctx.source,
                    e,
                    transport_retries,
                    ctx.policy.max_transport_retries
                );
                continue;
            }
        };

        let cooldown = match response.class() {
            StatusClass::Success => {
                ctx.pacer.record_success(started.elapsed());
                return AttemptOutcome::Success(response);
            }
            StatusClass::Other(status) => {
                tracing::debug!("{}: {} -> {}", ctx.source, request.url, status);
                return AttemptOutcome::Absent {
                    status: Some(status),
                };
            }
            StatusClass::RateLimited => {
                note_blocking(ctx, BlockCode::RateLimited);
                if rate_limited_retries >= ctx.policy.max_retries_429 {
                    return AttemptOutcome::Blocked(BlockCode::RateLimited);
                }
                rate_limited_retries += 1;
                ctx.policy.cooldown_429.sample()
            }
            StatusClass::Forbidden => {
                note_blocking(ctx, BlockCode::Forbidden);
                match &ctx.policy.forbidden {
                    ForbiddenPolicy::Abort => return AttemptOutcome::Blocked(BlockCode::Forbidden),
                    ForbiddenPolicy::Retry {
                        max_retries,
                        cooldown,
                    } => {
                        if forbidden_retries >= *max_retries {
                            return AttemptOutcome::Blocked(BlockCode::Forbidden);
                        }
                        forbidden_retries += 1;
                        cooldown.sample()
                    }
                }
            }
        };

        tracing::info!(
            "{}: blocked, cooling down {:.0}s before retrying {}",
            ctx.source,
            cooldown.as_secs_f64(),
            request.url
        );
        sleep(cooldown).await;
    }
}

fn note_blocking(ctx: &RetryContext<'_>, code: BlockCode) {
    ctx.pacer.record_blocking(code);
    if let Some(alert) = ctx
        .detector
        .record(BlockEvent::now(ctx.source.clone(), code))
    {
        ctx.progress.on_alert(&alert);
    }
}
