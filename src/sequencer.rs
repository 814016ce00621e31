//! Ordered, delayed starting of several scripts.
use std::io;
use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
    mpsc::{self, Sender},
};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::constants::QUEUE_POLL_INTERVAL;
use crate::supervisor::WorkerMessage;

/// Reply to a start request issued by a sequence.
pub(crate) type StartAck = Result<u32, String>;

/// Decrements the active-sequence counter when the worker finishes.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Generation a sequence was spawned in. Bumped by [`Sequencer::cancel`].
pub(crate) type Generation = u64;

/// Runs start sequences on worker threads.
///
/// Each start is marshalled to the coordination point, and the worker waits
/// for its acknowledgement before sleeping the inter-script delay, so
/// consecutive members start at least `delay` apart.
///
/// Cancelling bumps the generation: every sequence spawned earlier stops
/// before its next request, and requests it already queued are refused by
/// the coordination point.
#[derive(Debug, Clone, Default)]
pub struct Sequencer {
    active: Arc<AtomicUsize>,
    generation: Arc<AtomicU64>,
}

impl Sequencer {
    /// Creates a sequencer with no active sequences.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sequences that have not finished yet.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// The current generation; requests tagged with an older one are stale.
    pub(crate) fn generation(&self) -> Generation {
        self.generation.load(Ordering::SeqCst)
    }

    /// Cancels every sequence spawned so far.
    pub fn cancel(&self) {
        let previous = self.generation.fetch_add(1, Ordering::SeqCst);
        debug!("Cancelled start sequences of generation {previous}");
    }

    /// Starts `names` in order with `delay` between consecutive members.
    /// A member that fails to start is logged and skipped.
    pub(crate) fn spawn(
        &self,
        label: &str,
        names: Vec<String>,
        delay: Duration,
        queue: Sender<WorkerMessage>,
    ) -> io::Result<()> {
        self.active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard(Arc::clone(&self.active));
        let label = label.to_string();
        let cancel = CancelToken {
            generation: self.generation(),
            current: Arc::clone(&self.generation),
        };

        let spawned = thread::Builder::new()
            .name(format!("sequence-{label}"))
            .spawn(move || {
                let _guard = guard;
                run_sequence(&label, &names, delay, &queue, &cancel);
            });

        // On failure the closure, and with it the guard, has been dropped.
        spawned.map(|_| ())
    }
}

/// A sequence's view of the shared generation counter.
struct CancelToken {
    generation: Generation,
    current: Arc<AtomicU64>,
}

impl CancelToken {
    fn is_cancelled(&self) -> bool {
        self.current.load(Ordering::SeqCst) != self.generation
    }

    /// Sleeps for `delay`, waking early once cancelled. Returns whether the
    /// full delay elapsed.
    fn sleep(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(QUEUE_POLL_INTERVAL.min(deadline - now));
        }
    }
}

fn run_sequence(
    label: &str,
    names: &[String],
    delay: Duration,
    queue: &Sender<WorkerMessage>,
    cancel: &CancelToken,
) {
    info!("Running {label} for {} script(s)", names.len());

    for (index, name) in names.iter().enumerate() {
        if cancel.is_cancelled() {
            info!("{label} cancelled before '{name}'");
            return;
        }

        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        let request = WorkerMessage::StartRequest {
            name: name.clone(),
            generation: cancel.generation,
            ack: Some(ack_tx),
        };
        if queue.send(request).is_err() {
            debug!("Coordination queue closed; abandoning {label}");
            return;
        }

        match ack_rx.recv() {
            Ok(Ok(pid)) => debug!("{label}: '{name}' running with PID {pid}"),
            Ok(Err(reason)) => warn!("{label}: '{name}' failed to start: {reason}; continuing"),
            Err(_) => {
                debug!("Coordination point dropped the start of '{name}'; abandoning {label}");
                return;
            }
        }

        if index + 1 < names.len() && !delay.is_zero() {
            debug!("{label}: waiting {delay:?} before the next script");
            if !cancel.sleep(delay) {
                info!("{label} cancelled while waiting");
                return;
            }
        }
    }

    info!("{label} finished");
}
