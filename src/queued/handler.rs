use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::config::QueueConfig;
use crate::sync::{lock, panic_message};

/// A queued item together with the moment it was enqueued.
pub struct QueueEntry<T: ?Sized> {
    pub message: Arc<T>,
    pub enqueued_at: Instant,
}

enum Signal<T: ?Sized> {
    Item(QueueEntry<T>),
    Stop,
}

/// Lifecycle of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Created,
    Running,
    /// Stop requested; the worker is draining.
    Stopping,
    Stopped,
}

/// Counters for one queue.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub processed: u64,
    pub duplicates_dropped: u64,
    pub slow: u64,
    pub panicked: u64,
    /// Items left behind by [`QueuedHandler::abort`].
    pub abandoned: u64,
    /// Enqueue calls made after stop.
    pub rejected: u64,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue `{0}` is already started")]
    AlreadyStarted(String),

    #[error("queue `{0}` was stopped")]
    Stopped(String),

    #[error("failed to spawn the worker for queue `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

type BoxedHandler<T> = Box<dyn FnMut(Arc<T>) + Send>;

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    processed: AtomicU64,
    duplicates_dropped: AtomicU64,
    slow: AtomicU64,
    panicked: AtomicU64,
    abandoned: AtomicU64,
    rejected: AtomicU64,
}

/// State visible to both the worker thread and the probes.
struct Shared {
    name: String,
    config: QueueConfig,
    state: Mutex<QueueState>,
    depth: AtomicUsize,
    aborted: AtomicBool,
    busy_since: Mutex<Option<Instant>>,
    last_progress: Mutex<Instant>,
    counters: Counters,
}

impl Shared {
    fn snapshot(&self) -> QueueStats {
        let c = &self.counters;
        QueueStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            processed: c.processed.load(Ordering::Relaxed),
            duplicates_dropped: c.duplicates_dropped.load(Ordering::Relaxed),
            slow: c.slow.load(Ordering::Relaxed),
            panicked: c.panicked.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
        }
    }

    fn reject(&self) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(queue = %self.name, "enqueue after stop; message dropped");
    }
}

struct Control<T: ?Sized> {
    shared: Arc<Shared>,
    /// `None` once stop has been requested.
    sender: Mutex<Option<Sender<Signal<T>>>>,
    /// Taken by `start`.
    startup: Mutex<Option<(Receiver<Signal<T>>, BoxedHandler<T>)>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Single-consumer FIFO queue in front of one handler.
///
/// `enqueue` never blocks and may be called from any thread. One dedicated
/// worker thread drains items strictly in arrival order and calls the
/// handler once per item, so the handler's own state needs no locking.
///
/// ## Lifecycle
///
/// - [`start`](Self::start) spawns the worker. Items enqueued before start
///   wait for it.
/// - [`request_stop`](Self::request_stop) is graceful: a stop marker is
///   queued behind everything already enqueued, and the worker handles all
///   of it before exiting.
/// - [`abort`](Self::abort) is forced: the item in progress finishes, the
///   rest are abandoned.
/// - [`stop`](Self::stop) requests a graceful stop and joins the worker.
///
/// Enqueueing after stop drops the item with a warning.
///
/// The handle is cheap to clone; all clones drive the same queue. When the
/// last clone is dropped the worker drains and exits.
///
/// ## Example
///
/// ```ignore
/// let audit = QueuedHandler::spawn("audit", QueueConfig::default(), |event: Arc<OrderPlaced>| {
///     println!("order {}", event.order_id);
/// })?;
///
/// audit.enqueue(Arc::new(order_placed));
/// let stats = audit.stop();
/// assert_eq!(stats.processed, 1);
/// ```
pub struct QueuedHandler<T: ?Sized> {
    control: Arc<Control<T>>,
}

impl<T: ?Sized> Clone for QueuedHandler<T> {
    fn clone(&self) -> Self {
        Self {
            control: Arc::clone(&self.control),
        }
    }
}

impl<T: ?Sized + Send + Sync + 'static> QueuedHandler<T> {
    /// Create a queue. The worker does not run until [`start`](Self::start).
    pub fn new<F>(name: impl Into<String>, config: QueueConfig, handler: F) -> Self
    where
        F: FnMut(Arc<T>) + Send + 'static,
    {
        let (tx, rx) = channel();
        let shared = Shared {
            name: name.into(),
            config,
            state: Mutex::new(QueueState::Created),
            depth: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
            busy_since: Mutex::new(None),
            last_progress: Mutex::new(Instant::now()),
            counters: Counters::default(),
        };

        Self {
            control: Arc::new(Control {
                shared: Arc::new(shared),
                sender: Mutex::new(Some(tx)),
                startup: Mutex::new(Some((rx, Box::new(handler)))),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Create and start a queue.
    pub fn spawn<F>(name: impl Into<String>, config: QueueConfig, handler: F) -> Result<Self, QueueError>
    where
        F: FnMut(Arc<T>) + Send + 'static,
    {
        let queue = Self::new(name, config, handler);
        queue.start()?;
        Ok(queue)
    }

    pub fn start(&self) -> Result<(), QueueError> {
        let shared = &self.control.shared;
        let mut state = lock(&shared.state);
        match *state {
            QueueState::Created => {}
            QueueState::Running | QueueState::Stopping => {
                return Err(QueueError::AlreadyStarted(shared.name.clone()))
            }
            QueueState::Stopped => return Err(QueueError::Stopped(shared.name.clone())),
        }

        let Some((rx, handler)) = lock(&self.control.startup).take() else {
            return Err(QueueError::AlreadyStarted(shared.name.clone()));
        };

        let worker_shared = Arc::clone(shared);
        let spawned = thread::Builder::new()
            .name(shared.name.clone())
            .spawn(move || run_worker(worker_shared, rx, handler));

        match spawned {
            Ok(handle) => {
                *state = QueueState::Running;
                *lock(&self.control.worker) = Some(handle);
                debug!(queue = %shared.name, "queue started");
                Ok(())
            }
            Err(source) => {
                *state = QueueState::Stopped;
                lock(&self.control.sender).take();
                Err(QueueError::Spawn {
                    name: shared.name.clone(),
                    source,
                })
            }
        }
    }

    /// Append an item. Returns `false` if the queue no longer accepts work.
    pub fn enqueue(&self, message: Arc<T>) -> bool {
        let shared = &self.control.shared;
        let sender = lock(&self.control.sender);
        let Some(tx) = sender.as_ref() else {
            shared.reject();
            return false;
        };

        if shared.depth.fetch_add(1, Ordering::SeqCst) == 0 && lock(&shared.busy_since).is_none() {
            *lock(&shared.last_progress) = Instant::now();
        }

        let entry = QueueEntry {
            message,
            enqueued_at: Instant::now(),
        };
        if tx.send(Signal::Item(entry)).is_err() {
            shared.depth.fetch_sub(1, Ordering::SeqCst);
            shared.reject();
            return false;
        }

        shared.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Graceful stop: everything already enqueued is still handled.
    pub fn request_stop(&self) {
        let shared = &self.control.shared;
        let mut state = lock(&shared.state);
        match *state {
            QueueState::Stopping | QueueState::Stopped => return,
            QueueState::Running => {
                if let Some(tx) = lock(&self.control.sender).take() {
                    let _ = tx.send(Signal::Stop);
                }
                *state = QueueState::Stopping;
                debug!(queue = %shared.name, depth = self.len(), "queue stop requested");
            }
            QueueState::Created => {
                lock(&self.control.sender).take();
                lock(&self.control.startup).take();
                let left = shared.depth.swap(0, Ordering::SeqCst) as u64;
                shared.counters.abandoned.fetch_add(left, Ordering::Relaxed);
                *state = QueueState::Stopped;
            }
        }
    }

    /// Forced stop: the current item finishes, queued items are abandoned.
    pub fn abort(&self) {
        self.control.shared.aborted.store(true, Ordering::SeqCst);
        self.request_stop();
    }

    /// Graceful stop, then wait for the worker to exit.
    ///
    /// Called from the queue's own worker (a handler stopping its own queue)
    /// it only requests the stop.
    pub fn stop(&self) -> QueueStats {
        self.request_stop();

        let handle = lock(&self.control.worker).take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                *lock(&self.control.worker) = Some(handle);
            } else if handle.join().is_err() {
                error!(queue = %self.control.shared.name, "queue worker terminated abnormally");
            }
        }

        self.stats()
    }

    pub fn name(&self) -> &str {
        &self.control.shared.name
    }

    pub fn state(&self) -> QueueState {
        *lock(&self.control.shared.state)
    }

    /// Items waiting, not counting the one in progress.
    pub fn len(&self) -> usize {
        self.control.shared.depth.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nothing queued and nothing in progress.
    pub fn is_idle(&self) -> bool {
        self.is_empty() && lock(&self.control.shared.busy_since).is_none()
    }

    /// Items are waiting and the consumer has made no progress for longer
    /// than `threshold`.
    pub fn is_starving(&self, threshold: Duration) -> bool {
        let shared = &self.control.shared;
        if shared.depth.load(Ordering::SeqCst) == 0 {
            return false;
        }
        let since = lock(&shared.busy_since).unwrap_or_else(|| *lock(&shared.last_progress));
        since.elapsed() > threshold
    }

    /// Poll until the queue is idle. Returns `false` on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_idle() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.control.shared.snapshot()
    }
}

impl<T: ?Sized> fmt::Debug for QueuedHandler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = &self.control.shared;
        f.debug_struct("QueuedHandler")
            .field("name", &shared.name)
            .field("state", &*lock(&shared.state))
            .field("depth", &shared.depth.load(Ordering::Relaxed))
            .finish()
    }
}

fn same_allocation<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

fn run_worker<T: ?Sized + Send + Sync + 'static>(
    shared: Arc<Shared>,
    rx: Receiver<Signal<T>>,
    mut handler: BoxedHandler<T>,
) {
    debug!(queue = %shared.name, "queue worker running");
    let counters = &shared.counters;
    let slow_threshold = shared.config.slow_threshold();
    let mut previous: Option<Arc<T>> = None;

    // A stop marker or a dropped sender both end the loop.
    while let Ok(Signal::Item(entry)) = rx.recv() {
        *lock(&shared.busy_since) = Some(Instant::now());
        shared.depth.fetch_sub(1, Ordering::SeqCst);

        if shared.aborted.load(Ordering::SeqCst) {
            let mut abandoned = 1u64;
            while let Ok(Signal::Item(_)) = rx.try_recv() {
                shared.depth.fetch_sub(1, Ordering::SeqCst);
                abandoned += 1;
            }
            counters.abandoned.fetch_add(abandoned, Ordering::Relaxed);
            *lock(&shared.busy_since) = None;
            warn!(queue = %shared.name, abandoned, "queue aborted");
            break;
        }

        let duplicate = shared.config.idempotent
            && previous
                .as_ref()
                .map(|prev| same_allocation(prev, &entry.message))
                .unwrap_or(false);

        if duplicate {
            counters.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
            trace!(queue = %shared.name, "dropped repeated instance");
        } else {
            let waited = entry.enqueued_at.elapsed();
            let started = Instant::now();
            let message = Arc::clone(&entry.message);

            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(message))) {
                counters.panicked.fetch_add(1, Ordering::Relaxed);
                error!(
                    queue = %shared.name,
                    panic = %panic_message(payload.as_ref()),
                    "queued handler panicked; continuing"
                );
            }
            counters.processed.fetch_add(1, Ordering::Relaxed);

            let elapsed = started.elapsed();
            if elapsed > slow_threshold {
                counters.slow.fetch_add(1, Ordering::Relaxed);
                warn!(
                    queue = %shared.name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    waited_ms = waited.as_millis() as u64,
                    threshold_ms = slow_threshold.as_millis() as u64,
                    depth = shared.depth.load(Ordering::Relaxed),
                    "slow consumer"
                );
            }

            if shared.config.idempotent {
                previous = Some(entry.message);
            }
        }

        *lock(&shared.last_progress) = Instant::now();
        *lock(&shared.busy_since) = None;
    }

    *lock(&shared.state) = QueueState::Stopped;
    debug!(
        queue = %shared.name,
        processed = counters.processed.load(Ordering::Relaxed),
        "queue worker stopped"
    );
}
