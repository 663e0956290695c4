//! Bounded worker pools for one source.
//!
//! Workers pull from a shared FIFO queue and push results over an mpsc
//! channel to a single receiver, which also reports progress. A fixed pool
//! keeps N workers for the whole run; an adaptive pool works in batches and
//! re-reads the rate controller's concurrency between batches.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::catalog::PeriodicPause;
use crate::model::{FetchResult, Product, ProductId, SourceId};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::rate::RateController;

/// A product and its position in the input list.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub index: usize,
    pub product: Product,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<WorkItem>,
    seen: HashSet<ProductId>,
}

/// FIFO queue where taking an item also marks its id as seen, so a product
/// submitted twice is fetched once.
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
}

impl WorkQueue {
    pub fn new(items: impl IntoIterator<Item = WorkItem>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: items.into_iter().collect(),
                seen: HashSet::new(),
            }),
        }
    }

    pub fn from_products(products: &[Product]) -> Self {
        Self::new(products.iter().cloned().enumerate().map(|(index, product)| WorkItem {
            index,
            product,
        }))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, item: WorkItem) {
        self.lock().pending.push_back(item);
    }

    /// Pops the next item whose id has not been handed out yet.
    pub fn next(&self) -> Option<WorkItem> {
        let mut state = self.lock();
        while let Some(item) = state.pending.pop_front() {
            if state.seen.insert(item.product.id.clone()) {
                return Some(item);
            }
            tracing::debug!("Skipping duplicate submission of {}", item.product.id);
        }
        None
    }

    /// Distinct ids still waiting to be handed out.
    pub fn len(&self) -> usize {
        let state = self.lock();
        state
            .pending
            .iter()
            .map(|item| &item.product.id)
            .filter(|id| !state.seen.contains(*id))
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How many workers a source runs at once.
#[derive(Debug, Clone)]
pub enum PoolPolicy {
    Fixed {
        workers: usize,
    },
    Adaptive {
        controller: Arc<RateController>,
        batch_size: usize,
    },
}

/// Drives one source's worker pool over a [`WorkQueue`].
#[derive(Clone)]
pub struct Scheduler {
    source: SourceId,
    policy: PoolPolicy,
    pause: Option<PeriodicPause>,
    progress: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl Scheduler {
    /// A scheduler for one source. Progress events go to `progress`;
    /// `cancel` stops workers between products.
    pub fn new(
        source: SourceId,
        policy: PoolPolicy,
        progress: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            policy,
            pause: None,
            progress,
            cancel,
        }
    }

    /// Makes every worker sleep `pause.secs` after each `pause.every`-th
    /// dispatched product.
    pub fn with_pause(mut self, pause: Option<PeriodicPause>) -> Self {
        self.pause = pause;
        self
    }

    /// Runs `job` once per distinct queued product and returns the results in
    /// completion order. Stops taking new items once cancelled.
    pub async fn run<J, Fut>(&self, queue: WorkQueue, job: J) -> Vec<FetchResult>
    where
        J: Fn(WorkItem) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FetchResult> + Send + 'static,
    {
        let total = queue.len();
        self.progress.on_start(&self.source, total);

        let queue = Arc::new(queue);
        let job = Arc::new(job);
        let (tx, mut rx) = mpsc::channel::<FetchResult>(64);
        let driver = tokio::spawn(self.clone().drive(queue, job, tx));

        let mut results = Vec::with_capacity(total);
        while let Some(result) = rx.recv().await {
            let event = ProgressEvent {
                source: self.source.clone(),
                completed: results.len() + 1,
                total,
                last: result.status,
            };
            self.progress.on_event(&event);
            results.push(result);
        }

        if let Err(e) = driver.await {
            tracing::error!("{}: scheduler task failed: {}", self.source, e);
        }
        self.progress.on_finish(&self.source);
        results
    }

    async fn drive<J, Fut>(self, queue: Arc<WorkQueue>, job: Arc<J>, tx: mpsc::Sender<FetchResult>)
    where
        J: Fn(WorkItem) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FetchResult> + Send + 'static,
    {
        let dispatched = Arc::new(AtomicUsize::new(0));
        match &self.policy {
            PoolPolicy::Fixed { workers } => {
                self.round(queue, *workers, &job, &tx, &dispatched).await;
            }
            PoolPolicy::Adaptive {
                controller,
                batch_size,
            } => loop {
                if self.cancel.is_cancelled() {
                    break;
                }
                let batch: Vec<WorkItem> =
                    std::iter::from_fn(|| queue.next()).take(*batch_size).collect();
                if batch.is_empty() {
                    break;
                }
                let workers = controller.concurrency();
                tracing::debug!(
                    "{}: batch of {} with {} workers",
                    self.source,
                    batch.len(),
                    workers
                );
                self.round(Arc::new(WorkQueue::new(batch)), workers, &job, &tx, &dispatched)
                    .await;
            },
        }
    }

    /// Spawns up to `workers` tasks draining `queue` and waits for all of them.
    async fn round<J, Fut>(
        &self,
        queue: Arc<WorkQueue>,
        workers: usize,
        job: &Arc<J>,
        tx: &mpsc::Sender<FetchResult>,
        dispatched: &Arc<AtomicUsize>,
    ) where
        J: Fn(WorkItem) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FetchResult> + Send + 'static,
    {
        let mut join_set = JoinSet::new();
        for _ in 0..workers.min(queue.len()) {
            let queue = Arc::clone(&queue);
            let job = Arc::clone(job);
            let tx = tx.clone();
            let dispatched = Arc::clone(dispatched);
            let cancel = self.cancel.clone();
            let pause = self.pause;
            let source = self.source.clone();

            join_set.spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let Some(item) = queue.next() else { break };
                    let n = dispatched.fetch_add(1, Ordering::SeqCst) + 1;

                    let result = job(item).await;
                    if tx.send(result).await.is_err() {
                        break;
                    }

                    if let Some(pause) = pause {
                        if n % pause.every == 0 {
                            let wait = pause.secs.sample();
                            tracing::info!(
                                "{}: pausing {:.1}s after {} requests",
                                source,
                                wait.as_secs_f64(),
                                n
                            );
                            sleep(wait).await;
                        }
                    }
                }
            });
        }

        while let Some(joined) = join_set.join_next().await {
            if let Err(e) = joined {
                tracing::error!("{}: worker task failed: {}", self.source, e);
            }
        }
    }
}
