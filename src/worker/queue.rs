//! # Work Queue
//!
//! Unbounded FIFO shared by every producer and the single worker thread. The
//! mutex is held only for a push or a whole-queue drain, and pushes notify a
//! condition variable so an idle worker wakes as soon as work arrives.

use crate::audio::session::Session;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// One unit of work for the worker thread.
pub enum Workload {
    /// Normalized samples destined for one session.
    AudioChunk { session: Arc<Session>, samples: Vec<f32> },
    /// Tear down the session's delivery channel.
    ReleaseSession { session: Arc<Session> },
}

impl Workload {
    #[cfg(test)]
    pub fn session(&self) -> &Arc<Session> {
        match self {
            Workload::AudioChunk { session, .. } | Workload::ReleaseSession { session } => session,
        }
    }
}

#[derive(Default)]
pub struct WorkQueue {
    items: Mutex<VecDeque<Workload>>,
    ready: Condvar,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, workload: Workload) {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(workload);
        self.ready.notify_one();
    }

    /// Take everything currently queued, in FIFO order.
    pub fn drain(&self) -> Vec<Workload> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.drain(..).collect()
    }

    /// Like [`drain`](Self::drain), but waits up to `timeout` when the queue is
    /// empty. May return an empty batch on timeout or spurious wakeup.
    pub fn wait_and_drain(&self, timeout: Duration) -> Vec<Workload> {
        let items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut items, _) = self
            .ready
            .wait_timeout_while(items, timeout, |items| items.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        items.drain(..).collect()
    }

    /// Wake the worker without queueing anything.
    pub fn wake(&self) {
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
