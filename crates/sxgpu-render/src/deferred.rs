use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, SendError, Sender};
use tracing::{debug, trace};

type CleanupFn = Box<dyn FnOnce() + Send>;

/// A queued cleanup, tagged with the frame during which it was submitted.
pub struct DeferredAction {
    pub frame: u64,
    pub label: String,
    action: CleanupFn,
}

impl DeferredAction {
    fn run(self) {
        trace!("running deferred free of {} (frame {})", self.label, self.frame);
        (self.action)()
    }
}

/// Cloneable submission side of the queue. Resource handles hold one and use
/// it from whichever thread drops them.
#[derive(Clone)]
pub struct DeferredFreeSender {
    tx: Sender<DeferredAction>,
    frame: Arc<AtomicU64>,
}

impl DeferredFreeSender {
    /// Queue `action` tagged with the current frame. If the owning queue is
    /// gone the device has already been idled, so the action runs inline.
    pub fn submit(&self, label: impl Into<String>, action: impl FnOnce() + Send + 'static) {
        let item = DeferredAction {
            frame: self.frame.load(Ordering::Acquire),
            label: label.into(),
            action: Box::new(action),
        };
        if let Err(SendError(item)) = self.tx.send(item) {
            debug!("deferred queue closed, freeing {} immediately", item.label);
            item.run();
        }
    }

    pub fn current_frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }
}

/// Holds cleanup actions until every frame that might reference the
/// resource has retired.
///
/// An action tagged with frame F runs at the first frame boundary where
/// `F + frames_in_flight <= current` and no submission from frame F or
/// earlier is still executing. Sweeps must run on the thread that advances
/// the frame counter.
pub struct DeferredDestructionQueue {
    frames_in_flight: u64,
    frame: Arc<AtomicU64>,
    tx: Sender<DeferredAction>,
    rx: Receiver<DeferredAction>,
    pending: Vec<DeferredAction>,
    executed: u64,
}

impl DeferredDestructionQueue {
    pub fn new(frames_in_flight: u32) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            frames_in_flight: u64::from(frames_in_flight.max(1)),
            frame: Arc::new(AtomicU64::new(0)),
            tx,
            rx,
            pending: Vec::new(),
            executed: 0,
        }
    }

    pub fn sender(&self) -> DeferredFreeSender {
        DeferredFreeSender {
            tx: self.tx.clone(),
            frame: self.frame.clone(),
        }
    }

    /// Queue a cleanup action tagged with the current frame.
    pub fn submit_resource_free(&self, label: impl Into<String>, action: impl FnOnce() + Send + 'static) {
        self.sender().submit(label, action);
    }

    pub fn current_frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    /// Move the frame counter forward by one and return the new frame.
    pub fn advance_frame(&self) -> u64 {
        self.frame.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn frames_in_flight(&self) -> u64 {
        self.frames_in_flight
    }

    /// Run every action that is safe at the current frame. `oldest_in_flight`
    /// is the frame of the oldest submission not yet known to be retired.
    /// Returns the number of actions executed.
    pub fn sweep(&mut self, oldest_in_flight: Option<u64>) -> usize {
        self.drain_channel();
        let current = self.current_frame();
        let fif = self.frames_in_flight;
        let is_safe = |tag: u64| {
            tag + fif <= current && oldest_in_flight.map_or(true, |oldest| tag < oldest)
        };

        let (ready, keep): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.pending).into_iter().partition(|a| is_safe(a.frame));
        self.pending = keep;

        let count = ready.len();
        for action in ready {
            action.run();
        }
        self.executed += count as u64;
        if count > 0 {
            debug!(
                "frame {}: executed {} deferred free(s), {} pending",
                current,
                count,
                self.pending.len()
            );
        }
        count
    }

    /// Run everything regardless of tags. Only valid once the device is idle.
    pub fn flush_all(&mut self) -> usize {
        self.drain_channel();
        let pending = std::mem::take(&mut self.pending);
        let count = pending.len();
        for action in pending {
            action.run();
        }
        self.executed += count as u64;
        if count > 0 {
            debug!("flushed {} deferred free(s)", count);
        }
        count
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len() + self.rx.len()
    }

    pub fn executed(&self) -> u64 {
        self.executed
    }

    fn drain_channel(&mut self) {
        self.pending.extend(self.rx.try_iter());
    }
}
