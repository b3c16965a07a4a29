//! Priority request queue that keeps at most one request in flight.
//!
//! Jobs are ordered by priority (higher first) and, within a priority, by
//! enqueue order. A single background worker pops one job at a time and awaits
//! it to completion before selecting the next, so the backend never sees two
//! queued requests from this client at once.
//!
//! ```text
//! enqueue ──▶ BinaryHeap<QueueItem> ──Notify──▶ worker ──▶ job().await ──▶ oneshot
//! ```

use std::{
    cmp::Ordering as CmpOrdering,
    collections::BinaryHeap,
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::{
    sync::{Notify, oneshot},
    time::Instant,
};
use tracing::{debug, warn};

use crate::error::{TransportError, TransportResult};

/// Highest priority accepted by default.
pub const DEFAULT_MAX_PRIORITY: u8 = 10;

/// Configuration for the request queue.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Whether new jobs are serialized. Disabled queues run jobs immediately.
    pub enabled: bool,
    /// Priorities above this value are clamped down to it.
    pub max_priority: u8,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_priority: DEFAULT_MAX_PRIORITY,
        }
    }
}

impl QueueConfig {
    /// Set whether the queue starts enabled.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the maximum priority.
    #[must_use]
    pub fn max_priority(mut self, max: u8) -> Self {
        self.max_priority = max;
        self
    }
}

/// A type-erased deferred unit of work.
trait QueuedJob: Send {
    /// Run the job and settle its caller.
    fn run(self: Box<Self>) -> BoxFuture<'static, ()>;

    /// Settle the caller with an error without running the job.
    fn cancel(self: Box<Self>, error: TransportError);
}

struct Job<F, T> {
    thunk: F,
    reply_tx: oneshot::Sender<TransportResult<T>>,
}

impl<F, Fut, T> QueuedJob for Job<F, T>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = TransportResult<T>> + Send + 'static,
    T: Send + 'static,
{
    fn run(self: Box<Self>) -> BoxFuture<'static, ()> {
        let Job { thunk, reply_tx } = *self;
        Box::pin(async move {
            let result = thunk().await;
            // Receiver may have been dropped by a cancelled caller
            let _ = reply_tx.send(result);
        })
    }

    fn cancel(self: Box<Self>, error: TransportError) {
        let _ = self.reply_tx.send(Err(error));
    }
}

/// One queued job with its ordering keys.
struct QueueItem {
    id: String,
    priority: u8,
    seq: u64,
    enqueued_at: Instant,
    job: Box<dyn QueuedJob>,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    // Max-heap: higher priority first, then lower sequence number (older) first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueShared {
    items: Mutex<BinaryHeap<QueueItem>>,
    notify: Arc<Notify>,
    enabled: AtomicBool,
    processing: AtomicBool,
    worker_started: AtomicBool,
    next_seq: AtomicU64,
    max_priority: u8,
}

impl Drop for QueueShared {
    fn drop(&mut self) {
        // Wake the worker so it observes the dropped queue and exits.
        self.notify.notify_one();
    }
}

/// Snapshot of the queue state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueStatus {
    /// Jobs waiting to run.
    pub queued: usize,
    /// Whether a job is executing right now.
    pub processing: bool,
    /// Whether new jobs are serialized.
    pub enabled: bool,
}

/// Handle to a priority request queue.
///
/// Cheap to clone; all clones share the same ordering and worker.
#[derive(Clone)]
pub struct RequestQueue {
    shared: Arc<QueueShared>,
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestQueue")
            .field("status", &self.status())
            .finish()
    }
}

impl RequestQueue {
    /// Create a queue. The worker task starts on the first enqueue.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                items: Mutex::new(BinaryHeap::new()),
                notify: Arc::new(Notify::new()),
                enabled: AtomicBool::new(config.enabled),
                processing: AtomicBool::new(false),
                worker_started: AtomicBool::new(false),
                next_seq: AtomicU64::new(0),
                max_priority: config.max_priority,
            }),
        }
    }

    /// Enqueue a job and wait for its outcome.
    ///
    /// The returned result is exactly what the job produced, or
    /// [`TransportError::QueueCleared`] if the queue was cleared first.
    pub async fn enqueue<F, Fut, T>(&self, job: F, priority: u8) -> TransportResult<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TransportResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        if !self.is_enabled() {
            return job().await;
        }
        self.submit(job, priority).await
    }

    /// Enqueue a job without waiting.
    ///
    /// The job is placed in the queue before this returns, so consecutive
    /// calls keep their order. Await the ticket for the outcome. A disabled
    /// queue spawns the job right away. Must be called within a Tokio runtime.
    pub fn submit<F, Fut, T>(&self, job: F, priority: u8) -> QueueTicket<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TransportResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Box<dyn QueuedJob> = Box::new(Job {
            thunk: job,
            reply_tx,
        });

        if !self.is_enabled() {
            debug!("Queue disabled, running request immediately");
            tokio::spawn(job.run());
            return QueueTicket { rx: reply_rx };
        }

        let item = QueueItem {
            id: ulid::Ulid::new().to_string(),
            priority: priority.min(self.shared.max_priority),
            seq: self.shared.next_seq.fetch_add(1, Ordering::Relaxed),
            enqueued_at: Instant::now(),
            job,
        };
        debug!(id = %item.id, priority = item.priority, "Request enqueued");

        self.shared.items.lock().push(item);
        self.ensure_worker();
        self.shared.notify.notify_one();

        QueueTicket { rx: reply_rx }
    }

    /// Reject every queued (not executing) job with [`TransportError::QueueCleared`].
    ///
    /// Returns the number of rejected jobs.
    pub fn clear(&self) -> usize {
        let drained: Vec<QueueItem> = self.shared.items.lock().drain().collect();
        let count = drained.len();
        for item in drained {
            item.job.cancel(TransportError::QueueCleared);
        }
        if count > 0 {
            debug!(count, "Request queue cleared");
        }
        count
    }

    /// Enable or disable serialization of new jobs.
    ///
    /// Jobs already queued keep draining either way.
    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::Release);
    }

    /// Whether new jobs are serialized.
    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire)
    }

    /// Whether a job is executing right now.
    pub fn is_processing(&self) -> bool {
        self.shared.processing.load(Ordering::Acquire)
    }

    /// Number of jobs waiting to run.
    pub fn len(&self) -> usize {
        self.shared.items.lock().len()
    }

    /// Whether no job is waiting.
    pub fn is_empty(&self) -> bool {
        self.shared.items.lock().is_empty()
    }

    /// Snapshot of the queue state.
    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            queued: self.len(),
            processing: self.is_processing(),
            enabled: self.is_enabled(),
        }
    }

    fn ensure_worker(&self) {
        if self.shared.worker_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = Arc::downgrade(&self.shared);
        let notify = Arc::clone(&self.shared.notify);
        tokio::spawn(run_worker(weak, notify));
    }
}

/// Drain loop. Holds only a weak reference so dropping the last handle stops it.
async fn run_worker(shared: Weak<QueueShared>, notify: Arc<Notify>) {
    debug!("Request queue worker started");
    loop {
        let next = {
            let Some(shared) = shared.upgrade() else {
                break;
            };
            let item = shared.items.lock().pop();
            shared.processing.store(item.is_some(), Ordering::Release);
            item
        };

        let Some(item) = next else {
            notify.notified().await;
            continue;
        };

        debug!(
            id = %item.id,
            priority = item.priority,
            waited_ms = item.enqueued_at.elapsed().as_millis() as u64,
            "Executing queued request"
        );

        // A panicking job drops its reply sender; the caller sees an internal error.
        if let Err(e) = tokio::spawn(item.job.run()).await {
            warn!(id = %item.id, error = %e, "Queued request aborted");
        }

        if let Some(shared) = shared.upgrade() {
            shared.processing.store(false, Ordering::Release);
        }
    }
    debug!("Request queue worker stopped");
}

/// Outcome of a submitted job.
#[must_use = "a ticket does nothing unless awaited"]
pub struct QueueTicket<T> {
    rx: oneshot::Receiver<TransportResult<T>>,
}

impl<T> Future for QueueTicket<T> {
    type Output = TransportResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or_else(|_| Err(TransportError::internal("Queued request aborted"))))
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicUsize, time::Duration};

    use super::*;

    /// A job that records its label when it runs.
    fn recording(
        log: &Arc<Mutex<Vec<&'static str>>>,
        label: &'static str,
    ) -> impl FnOnce() -> BoxFuture<'static, TransportResult<&'static str>> + Send + 'static {
        let log = Arc::clone(log);
        move || {
            Box::pin(async move {
                log.lock().push(label);
                Ok(label)
            })
        }
    }

    /// Occupy the worker until the returned sender fires.
    fn block(queue: &RequestQueue) -> (oneshot::Sender<()>, QueueTicket<()>) {
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let ticket = queue.submit(
            move || async move {
                let _ = release_rx.await;
                Ok(())
            },
            DEFAULT_MAX_PRIORITY,
        );
        (release_tx, ticket)
    }

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let queue = RequestQueue::default();
        let log = Arc::new(Mutex::new(Vec::new()));

        let (release, blocker) = block(&queue);
        tokio::task::yield_now().await;

        let a = queue.submit(recording(&log, "A"), 0);
        let b = queue.submit(recording(&log, "B"), 5);
        let c = queue.submit(recording(&log, "C"), 5);

        release.send(()).unwrap();
        blocker.await.unwrap();
        assert_eq!(a.await.unwrap(), "A");
        assert_eq!(b.await.unwrap(), "B");
        assert_eq!(c.await.unwrap(), "C");

        assert_eq!(*log.lock(), vec!["B", "C", "A"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_at_most_one_job_executes() {
        let queue = RequestQueue::default();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..20u8 {
            let queue = queue.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue(
                        move || async move {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(2)).await;
                            running.fetch_sub(1, Ordering::SeqCst);
                            Ok(i)
                        },
                        i % 3,
                    )
                    .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let queue = RequestQueue::default();

        let failing = queue.submit(
            || async { Err::<(), _>(TransportError::network("connection refused")) },
            0,
        );
        let succeeding = queue.submit(|| async { Ok(42) }, 0);

        let err = failing.await.unwrap_err();
        assert!(matches!(err, TransportError::Network { .. }));
        assert_eq!(succeeding.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_stop_worker() {
        let queue = RequestQueue::default();

        let panicking = queue.submit(
            || async {
                panic!("job exploded");
                #[allow(unreachable_code)]
                Ok(())
            },
            0,
        );
        let next = queue.submit(|| async { Ok("still running") }, 0);

        assert!(matches!(
            panicking.await.unwrap_err(),
            TransportError::Internal { .. }
        ));
        assert_eq!(next.await.unwrap(), "still running");
    }

    #[tokio::test]
    async fn test_clear_rejects_queued_but_not_executing() {
        let queue = RequestQueue::default();
        let (release, blocker) = block(&queue);
        tokio::task::yield_now().await;
        assert!(queue.is_processing());

        let waiting_a = queue.submit(|| async { Ok(1) }, 0);
        let waiting_b = queue.submit(|| async { Ok(2) }, 3);
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert!(matches!(waiting_a.await, Err(TransportError::QueueCleared)));
        assert!(matches!(waiting_b.await, Err(TransportError::QueueCleared)));

        release.send(()).unwrap();
        assert!(blocker.await.is_ok());
    }

    #[tokio::test]
    async fn test_disabled_queue_bypasses_ordering() {
        let queue = RequestQueue::new(QueueConfig::default().enabled(false));
        let (release, blocker) = {
            // even with a long-running job, disabled enqueues do not wait
            let (tx, rx) = oneshot::channel::<()>();
            let ticket = queue.submit(
                move || async move {
                    let _ = rx.await;
                    Ok(())
                },
                0,
            );
            (tx, ticket)
        };

        let fast = queue.enqueue(|| async { Ok("fast") }, 0).await.unwrap();
        assert_eq!(fast, "fast");
        assert_eq!(queue.len(), 0);

        release.send(()).unwrap();
        blocker.await.unwrap();
    }

    #[tokio::test]
    async fn test_disable_mid_drain_keeps_queued_items() {
        let queue = RequestQueue::default();
        let (release, blocker) = block(&queue);
        tokio::task::yield_now().await;

        let queued = queue.submit(|| async { Ok("queued") }, 0);
        queue.set_enabled(false);
        let bypass = queue.enqueue(|| async { Ok("bypass") }, 0).await.unwrap();
        assert_eq!(bypass, "bypass");
        assert_eq!(queue.len(), 1);

        release.send(()).unwrap();
        blocker.await.unwrap();
        assert_eq!(queued.await.unwrap(), "queued");
    }

    #[tokio::test]
    async fn test_priority_is_clamped() {
        let queue = RequestQueue::new(QueueConfig::default().max_priority(2));
        let log = Arc::new(Mutex::new(Vec::new()));
        let (release, blocker) = block(&queue);
        tokio::task::yield_now().await;

        // both clamp to 2, so enqueue order decides
        let first = queue.submit(recording(&log, "first"), 2);
        let second = queue.submit(recording(&log, "second"), 200);

        release.send(()).unwrap();
        blocker.await.unwrap();
        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_queue_item_ordering() {
        fn item(priority: u8, seq: u64) -> QueueItem {
            let (reply_tx, _rx) = oneshot::channel::<TransportResult<()>>();
            QueueItem {
                id: seq.to_string(),
                priority,
                seq,
                enqueued_at: Instant::now(),
                job: Box::new(Job {
                    thunk: || async { Ok(()) },
                    reply_tx,
                }),
            }
        }

        let mut heap = BinaryHeap::new();
        heap.push(item(0, 0));
        heap.push(item(5, 1));
        heap.push(item(5, 2));
        heap.push(item(1, 3));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|i| i.seq)).collect();
        assert_eq!(order, vec![1, 2, 3, 0]);
    }
}
