//! Request pacing.
//!
//! Adaptive sources share a [`RateController`]: a feedback loop that speeds up
//! after runs of successes and backs off on 403/429. Every other source
//! either draws human-like think times or is not paced at all.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::blocking::BlockCode;

/// Upper bound for every configured wait or timeout: one day.
pub const MAX_SECS: f64 = 86_400.0;

/// A `[min, max]` window in seconds, sampled uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SecondsRange {
    pub min: f64,
    pub max: f64,
}

impl SecondsRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub const fn zero() -> Self {
        Self { min: 0.0, max: 0.0 }
    }

    /// Non-negative, ordered and no longer than [`MAX_SECS`].
    pub fn is_valid(&self) -> bool {
        self.min.is_finite()
            && self.max.is_finite()
            && self.min >= 0.0
            && self.min <= self.max
            && self.max <= MAX_SECS
    }

    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return Duration::from_secs_f64(self.min.max(0.0));
        }
        let secs = rand::thread_rng().gen_range(self.min..=self.max);
        Duration::from_secs_f64(secs)
    }
}

/// Ramp constants for an adaptive pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    pub min_workers: usize,
    pub initial_workers: usize,
    pub max_workers: usize,
    /// Workers added or removed per adjustment.
    pub step: usize,
    pub min_delay_secs: f64,
    pub max_delay_secs: f64,
    /// Starting delay; `min_delay_secs` when absent.
    pub initial_delay_secs: Option<f64>,
    /// Consecutive successes between two speed-ups.
    pub success_interval: u32,
    pub latency_window: usize,
    pub speedup_factor: f64,
    pub backoff_factor: f64,
    /// Products dispatched between two re-evaluations of the worker count.
    pub batch_size: usize,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            min_workers: 5,
            initial_workers: 10,
            max_workers: 30,
            step: 5,
            min_delay_secs: 0.1,
            max_delay_secs: 0.5,
            initial_delay_secs: None,
            success_interval: 10,
            latency_window: 20,
            speedup_factor: 0.9,
            backoff_factor: 1.5,
            batch_size: 10,
        }
    }
}

impl AdaptiveConfig {
    /// Describes the first inconsistency found, if any.
    pub fn check(&self) -> Result<(), String> {
        if self.min_workers == 0 {
            return Err("min_workers must be at least 1".into());
        }
        if self.min_workers > self.max_workers {
            return Err(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            ));
        }
        if self.initial_workers < self.min_workers || self.initial_workers > self.max_workers {
            return Err(format!(
                "initial_workers ({}) outside [{}, {}]",
                self.initial_workers, self.min_workers, self.max_workers
            ));
        }
        if !SecondsRange::new(self.min_delay_secs, self.max_delay_secs).is_valid() {
            return Err(format!(
                "delay range {}..{} is inverted, negative or too long",
                self.min_delay_secs, self.max_delay_secs
            ));
        }
        if let Some(initial) = self.initial_delay_secs {
            if !(initial >= self.min_delay_secs && initial <= 2.0 * self.max_delay_secs) {
                return Err(format!("initial_delay_secs ({}) out of range", initial));
            }
        }
        if self.success_interval == 0 || self.latency_window == 0 || self.batch_size == 0 {
            return Err("success_interval, latency_window and batch_size must be positive".into());
        }
        if !(self.speedup_factor > 0.0 && self.speedup_factor <= 1.0)
            || !(self.backoff_factor >= 1.0 && self.backoff_factor.is_finite())
        {
            return Err("speedup_factor must be in (0, 1] and backoff_factor >= 1".into());
        }
        Ok(())
    }
}

#[derive(Debug)]
struct RateState {
    current_delay: f64,
    current_concurrency: usize,
    recent_latencies: VecDeque<Duration>,
    consecutive_successes: u32,
}

/// Point-in-time view of a controller, for the run summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateSnapshot {
    pub delay_secs: f64,
    pub concurrency: usize,
    pub mean_latency_ms: Option<f64>,
}

/// Per-source feedback loop computing pacing and concurrency.
///
/// Shared by every worker of one source; state sits behind a mutex that is
/// never held across an await.
#[derive(Debug)]
pub struct RateController {
    config: AdaptiveConfig,
    state: Mutex<RateState>,
}

impl RateController {
    /// Starts at `initial_delay_secs` (or the minimum delay) and
    /// `initial_workers`, clamped to the configured bounds.
    pub fn new(config: AdaptiveConfig) -> Self {
        let initial_delay = config.initial_delay_secs.unwrap_or(config.min_delay_secs);
        let concurrency = config
            .initial_workers
            .clamp(config.min_workers, config.max_workers.max(config.min_workers));
        let state = RateState {
            current_delay: initial_delay,
            current_concurrency: concurrency,
            recent_latencies: VecDeque::with_capacity(config.latency_window),
            consecutive_successes: 0,
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records a successful request's latency. Every `success_interval`
    /// consecutive successes shorten the delay and add `step` workers.
    pub fn record_success(&self, latency: Duration) {
        let mut state = self.lock();
        state.recent_latencies.push_back(latency);
        while state.recent_latencies.len() > self.config.latency_window {
            state.recent_latencies.pop_front();
        }
        state.consecutive_successes += 1;

        if state.consecutive_successes % self.config.success_interval == 0 {
            state.current_delay =
                (state.current_delay * self.config.speedup_factor).max(self.config.min_delay_secs);
            state.current_concurrency =
                (state.current_concurrency + self.config.step).min(self.config.max_workers);
            tracing::debug!(
                "Speeding up: delay {:.2}s, {} workers",
                state.current_delay,
                state.current_concurrency
            );
        }
    }

    /// Backs off after a 403/429: longer delay, `step` fewer workers and a
    /// reset success streak.
    pub fn record_blocking(&self, code: BlockCode) {
        let mut state = self.lock();
        state.current_delay =
            (state.current_delay * self.config.backoff_factor).min(2.0 * self.config.max_delay_secs);
        state.current_concurrency = state
            .current_concurrency
            .saturating_sub(self.config.step)
            .max(self.config.min_workers);
        state.consecutive_successes = 0;
        tracing::debug!(
            "Backing off after {}: delay {:.2}s, {} workers",
            code,
            state.current_delay,
            state.current_concurrency
        );
    }

    /// Pause before the next request, uniform in `[d, 2d]`.
    pub fn delay(&self) -> Duration {
        let current = self.lock().current_delay;
        SecondsRange::new(current, current * 2.0).sample()
    }

    /// Worker count for the next batch.
    pub fn concurrency(&self) -> usize {
        self.lock().current_concurrency
    }

    pub fn current_delay_secs(&self) -> f64 {
        self.lock().current_delay
    }

    /// Current delay, concurrency and mean latency over the window.
    pub fn snapshot(&self) -> RateSnapshot {
        let state = self.lock();
        let mean_latency_ms = if state.recent_latencies.is_empty() {
            None
        } else {
            let total: f64 = state
                .recent_latencies
                .iter()
                .map(|d| d.as_secs_f64() * 1000.0)
                .sum();
            Some(total / state.recent_latencies.len() as f64)
        };
        RateSnapshot {
            delay_secs: state.current_delay,
            concurrency: state.current_concurrency,
            mean_latency_ms,
        }
    }
}

/// Think-time window for a roll in `[0, 1)`: mostly short, occasionally long.
pub fn human_delay_tier(roll: f64) -> SecondsRange {
    if roll < 0.85 {
        SecondsRange::new(0.5, 2.0)
    } else if roll < 0.95 {
        SecondsRange::new(3.0, 8.0)
    } else {
        SecondsRange::new(10.0, 30.0)
    }
}

pub fn human_delay() -> Duration {
    let roll: f64 = rand::thread_rng().gen();
    human_delay_tier(roll).sample()
}

/// How a source waits before each request.
#[derive(Debug, Clone)]
pub enum Pacer {
    Adaptive(Arc<RateController>),
    Human,
    Off,
}

impl Pacer {
    pub fn next_delay(&self) -> Duration {
        match self {
            Self::Adaptive(controller) => controller.delay(),
            Self::Human => human_delay(),
            Self::Off => Duration::ZERO,
        }
    }

    pub fn record_success(&self, latency: Duration) {
        if let Self::Adaptive(controller) = self {
            controller.record_success(latency);
        }
    }

    pub fn record_blocking(&self, code: BlockCode) {
        if let Self::Adaptive(controller) = self {
            controller.record_blocking(code);
        }
    }

    pub fn controller(&self) -> Option<&Arc<RateController>> {
        match self {
            Self::Adaptive(controller) => Some(controller),
            _ => None,
        }
    }
}
