//! # Session State Management
//!
//! A session is one continuous audio stream with its own rolling buffer, prompt
//! context and delivery channel.
//!
//! ## Ownership:
//! - [`Session`] lives in an `Arc` shared by the producer's [`SessionHandle`] and
//!   every workload still sitting in the queue. Memory goes away when the last of
//!   them is dropped.
//! - Producers never touch the buffer. They only decode audio and enqueue
//!   workloads; the worker thread is the sole mutator of [`SessionState`].
//! - `destroyed` is a logical marker that stops further inference and delivery.
//!   It is independent of memory lifetime.

use crate::audio::buffer::RollingBuffer;
use crate::audio::pcm::decode_pcm16_le;
use crate::delivery::{DeliveryChannel, TranscriptSink};
use crate::worker::queue::{WorkQueue, Workload};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Per-stream state mutated by the worker thread.
#[derive(Debug)]
pub struct SessionState {
    pub buffer: RollingBuffer,
    /// Tokens from the previous inference, fed back as context.
    pub prompt_tokens: Vec<u32>,
    pub delivery: DeliveryChannel,
    /// Most recent transcript, set just before delivery.
    pub last_text: String,
}

/// One audio stream.
#[derive(Debug)]
pub struct Session {
    id: String,
    opened_at: DateTime<Utc>,
    destroyed: AtomicBool,
    release_requested: AtomicBool,
    samples_received: AtomicU64,
    deliveries: AtomicU64,
    // Only the worker locks this, so it is never contended.
    state: Mutex<SessionState>,
}

/// Read-only view of a session for the HTTP API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub opened_at: DateTime<Utc>,
    pub destroyed: bool,
    pub samples_received: u64,
    pub deliveries: u64,
}

impl Session {
    pub fn new(id: impl Into<String>, capacity: usize, sink: Box<dyn TranscriptSink>) -> Self {
        Self {
            id: id.into(),
            opened_at: Utc::now(),
            destroyed: AtomicBool::new(false),
            release_requested: AtomicBool::new(false),
            samples_received: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            state: Mutex::new(SessionState {
                buffer: RollingBuffer::new(capacity),
                prompt_tokens: Vec::new(),
                delivery: DeliveryChannel::new(sink),
                last_text: String::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Set the `destroyed` marker. Returns `true` if this call flipped it.
    pub fn mark_destroyed(&self) -> bool {
        !self.destroyed.swap(true, Ordering::SeqCst)
    }

    /// Lock the worker-side state, recovering from a poisoned lock.
    pub fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_delivery(&self) {
        self.deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            opened_at: self.opened_at,
            destroyed: self.is_destroyed(),
            samples_received: self.samples_received.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
        }
    }
}

/// Producer-side handle returned by `SessionManager::open`.
///
/// Dropping the handle destroys the session if `destroy` was never called.
pub struct SessionHandle {
    session: Arc<Session>,
    queue: Arc<WorkQueue>,
}

impl SessionHandle {
    pub(crate) fn new(session: Arc<Session>, queue: Arc<WorkQueue>) -> Self {
        Self { session, queue }
    }

    pub fn id(&self) -> &str {
        self.session.id()
    }

    pub fn is_destroyed(&self) -> bool {
        self.session.is_destroyed()
    }

    /// Decode little-endian 16-bit PCM and queue it for this session.
    ///
    /// ## Returns:
    /// - **true**: the audio was queued (or was empty)
    /// - **false**: the session is destroyed and the audio was ignored
    pub fn submit(&self, bytes: &[u8]) -> bool {
        if self.session.is_destroyed() {
            warn!(session_id = %self.session.id, bytes = bytes.len(), "Ignoring audio submitted to destroyed session");
            return false;
        }

        let samples = decode_pcm16_le(bytes);
        if samples.is_empty() {
            return true;
        }

        self.session
            .samples_received
            .fetch_add(samples.len() as u64, Ordering::Relaxed);
        self.queue.push(Workload::AudioChunk {
            session: self.session.clone(),
            samples,
        });
        true
    }

    /// Stop accepting audio and queue the release of the delivery channel.
    ///
    /// Audio queued before this call is still applied before the release runs.
    /// Calling it again does nothing.
    pub fn destroy(&self) {
        self.session.mark_destroyed();

        if self.session.release_requested.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!(session_id = %self.session.id, "Session destroy requested");
        self.queue.push(Workload::ReleaseSession {
            session: self.session.clone(),
        });
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.destroy();
    }
}
