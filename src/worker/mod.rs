//! # Streaming Session Manager
//!
//! Owns the inference engine, the work queue and the single worker thread that
//! serializes every engine call. Producers (one per connection) only ever push
//! workloads; the worker drains the queue, updates session buffers, and runs the
//! gate, the engine and delivery.
//!
//! ## Lifecycle:
//! - `SessionManager::init` moves the engine into a freshly spawned worker thread.
//! - `open` registers a session and returns its producer handle.
//! - `shutdown` stops the loop after the batch in progress and joins the thread.

pub mod dispatch;
pub mod queue;
pub mod stats;

use crate::audio::session::{Session, SessionHandle, SessionSummary};
use crate::audio::vad::VadSettings;
use crate::config::{AppConfig, InferenceFailurePolicy};
use crate::delivery::{CallbackSink, DeliveryError, TranscriptSink};
use crate::transcription::engine::{DecodeOptions, InferenceEngine, Suppressor};
use anyhow::Result;
use dispatch::Dispatcher;
use queue::WorkQueue;
use stats::{WorkerStats, WorkerStatsSnapshot};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

/// Worker tuning resolved from [`AppConfig`], in samples where it matters.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Rolling buffer and inference window length.
    pub capacity: usize,
    /// Minimum new audio before another attempt, re-included as context.
    pub overlap: usize,
    pub vad: VadSettings,
    pub decode: DecodeOptions,
    pub suppressor: Suppressor,
    pub on_inference_error: InferenceFailurePolicy,
    /// How long an idle worker waits for new work before looping.
    pub idle_wait: Duration,
}

impl StreamSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let streaming = &config.streaming;
        let samples = |ms: u64| (ms as usize * streaming.sample_rate as usize) / 1000;

        Self {
            capacity: samples(streaming.window_ms),
            overlap: samples(streaming.overlap_ms),
            vad: VadSettings {
                sample_rate: streaming.sample_rate,
                analysis_samples: samples(config.vad.analysis_ms),
                energy_threshold: config.vad.energy_threshold,
                high_pass_cutoff_hz: config.vad.high_pass_cutoff_hz,
            },
            decode: DecodeOptions {
                language: config.models.language.clone(),
                max_tokens: streaming.max_tokens,
                threads: config.streaming.resolved_threads(),
            },
            suppressor: Suppressor::new(config.suppression.placeholders.iter().cloned()),
            on_inference_error: streaming.on_inference_error,
            idle_wait: Duration::from_millis(streaming.idle_wait_ms),
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Errors from the session-facing API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A live session already uses this id
    DuplicateId(String),
    /// `shutdown` has been called
    WorkerStopped,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::DuplicateId(id) => write!(f, "session '{}' is already open", id),
            SessionError::WorkerStopped => write!(f, "transcription worker has stopped"),
        }
    }
}

impl std::error::Error for SessionError {}

/// The streaming service: one queue, one worker, many sessions.
pub struct SessionManager {
    queue: Arc<WorkQueue>,
    stats: Arc<WorkerStats>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    // Weak so the registry never extends a session's lifetime.
    registry: Mutex<HashMap<String, Weak<Session>>>,
    capacity: usize,
}

impl SessionManager {
    /// Start the worker thread with `engine` and return the running service.
    pub fn init(engine: Box<dyn InferenceEngine>, settings: StreamSettings) -> Result<Self> {
        let queue = Arc::new(WorkQueue::new());
        let stats = Arc::new(WorkerStats::default());
        let running = Arc::new(AtomicBool::new(true));
        let capacity = settings.capacity;

        info!(
            capacity,
            overlap = settings.overlap,
            threshold = settings.vad.energy_threshold,
            "Starting transcription worker"
        );

        let worker = {
            let queue = queue.clone();
            let running = running.clone();
            let idle_wait = settings.idle_wait;
            let mut dispatcher = Dispatcher::new(engine, settings, stats.clone());

            thread::Builder::new()
                .name("asr-worker".to_string())
                .spawn(move || run_worker(&queue, &running, &mut dispatcher, idle_wait))?
        };

        Ok(Self {
            queue,
            stats,
            running,
            worker: Mutex::new(Some(worker)),
            registry: Mutex::new(HashMap::new()),
            capacity,
        })
    }

    /// Open a session whose transcripts go to `sink`.
    ///
    /// Nothing is acquired here; the worker acquires the sink the first time the
    /// session receives audio.
    pub fn open(&self, id: impl Into<String>, sink: Box<dyn TranscriptSink>) -> Result<SessionHandle, SessionError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(SessionError::WorkerStopped);
        }

        let id = id.into();
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.retain(|_, session| session.strong_count() > 0);

        if let Some(existing) = registry.get(&id).and_then(Weak::upgrade) {
            if !existing.is_destroyed() {
                return Err(SessionError::DuplicateId(id));
            }
        }

        let session = Arc::new(Session::new(id.clone(), self.capacity, sink));
        registry.insert(id.clone(), Arc::downgrade(&session));
        debug!(session_id = %id, "Session opened");

        Ok(SessionHandle::new(session, self.queue.clone()))
    }

    /// Open a session that delivers transcripts to a callback.
    pub fn open_with_callback<F>(&self, id: impl Into<String>, callback: F) -> Result<SessionHandle, SessionError>
    where
        F: FnMut(&str) -> Result<(), DeliveryError> + Send + 'static,
    {
        self.open(id, Box::new(CallbackSink::new(callback)))
    }

    /// Sessions that are still referenced somewhere.
    pub fn sessions(&self) -> Vec<SessionSummary> {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.retain(|_, session| session.strong_count() > 0);

        let mut summaries: Vec<_> = registry
            .values()
            .filter_map(Weak::upgrade)
            .map(|session| session.summary())
            .collect();
        summaries.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        summaries
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the worker after its current batch and wait for it to exit.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.queue.wake();

        // A worker that died on its own has already cleared `running`; still join it.
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::error!("Transcription worker panicked");
            }
            info!("Transcription worker stopped");
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Clears the running flag when the worker exits, including by panic, so
/// health checks and `open` see a dead worker immediately.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if self.0.swap(false, Ordering::SeqCst) && thread::panicking() {
            tracing::error!("Transcription worker exited unexpectedly");
        }
    }
}

fn run_worker(queue: &WorkQueue, running: &AtomicBool, dispatcher: &mut Dispatcher, idle_wait: Duration) {
    let _guard = RunningGuard(running);
    info!("Transcription worker running");

    while running.load(Ordering::SeqCst) {
        let batch = queue.drain();
        if dispatcher.run_batch(batch) {
            continue;
        }

        // Nothing applied: wait for a push instead of spinning.
        let batch = queue.wait_and_drain(idle_wait);
        dispatcher.run_batch(batch);
    }
}

#[cfg(test)]
mod tests {
    use super::dispatch::tests::{small_settings, FakeEngine, RecordingSink};
    use super::*;
    use std::time::Instant;

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    fn pcm(samples: impl IntoIterator<Item = f32>) -> Vec<u8> {
        samples
            .into_iter()
            .flat_map(|s| ((s * 32767.0) as i16).to_le_bytes())
            .collect()
    }

    #[test]
    fn test_settings_from_default_config() {
        let settings = StreamSettings::default();
        assert_eq!(settings.capacity, 480_000);
        assert_eq!(settings.overlap, 3_200);
        assert_eq!(settings.vad.analysis_samples, 16_000);
        assert_eq!(settings.decode.language, "en");
        assert_eq!(settings.decode.max_tokens, 512);
        assert!(settings.suppressor.is_placeholder(" [BLANK_AUDIO]"));
    }

    #[test]
    fn test_duplicate_live_id_rejected() {
        let manager = SessionManager::init(Box::new(FakeEngine::default()), small_settings()).unwrap();

        let first = manager.open("dup", Box::new(RecordingSink::default())).unwrap();
        assert_eq!(
            manager.open("dup", Box::new(RecordingSink::default())).err(),
            Some(SessionError::DuplicateId("dup".to_string()))
        );

        first.destroy();
        assert!(manager.open("dup", Box::new(RecordingSink::default())).is_ok());
        manager.shutdown();
    }

    #[test]
    fn test_open_after_shutdown_fails() {
        let manager = SessionManager::init(Box::new(FakeEngine::default()), small_settings()).unwrap();
        manager.shutdown();
        manager.shutdown();
        assert!(!manager.is_running());
        assert_eq!(
            manager.open_with_callback("late", |_| Ok(())).err(),
            Some(SessionError::WorkerStopped)
        );
    }

    #[test]
    fn test_callback_receives_transcripts_from_worker_thread() {
        let manager = SessionManager::init(Box::new(FakeEngine::default()), small_settings()).unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));

        let handle = {
            let received = received.clone();
            manager
                .open_with_callback("cb", move |text| {
                    received.lock().unwrap().push(text.to_string());
                    Ok(())
                })
                .unwrap()
        };

        assert!(handle.submit(&pcm([0.5; 4])));
        assert!(wait_until(|| received.lock().unwrap().len() == 1));
        assert_eq!(received.lock().unwrap()[0], " hello");

        let sessions = manager.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, "cb");

        drop(handle);
        assert!(wait_until(|| manager.stats().releases == 1));
        assert!(wait_until(|| manager.sessions().is_empty()));
        manager.shutdown();
    }

    struct PanickingEngine;

    impl InferenceEngine for PanickingEngine {
        fn transcribe(
            &mut self,
            _window: &[f32],
            _prompt: &[u32],
            _options: &DecodeOptions,
        ) -> Result<crate::transcription::engine::Transcript> {
            panic!("engine blew up");
        }
    }

    #[test]
    fn test_worker_panic_clears_running() {
        let manager = SessionManager::init(Box::new(PanickingEngine), small_settings()).unwrap();
        let handle = manager.open("doomed", Box::new(RecordingSink::default())).unwrap();
        assert!(manager.is_running());

        assert!(handle.submit(&pcm([0.5; 4])));
        assert!(wait_until(|| !manager.is_running()));
        assert_eq!(
            manager.open_with_callback("after", |_| Ok(())).err(),
            Some(SessionError::WorkerStopped)
        );

        drop(handle);
        manager.shutdown();
    }

    /// 5 s of silence then 1 s of a 4 kHz tone at the production gate settings.
    #[test]
    fn test_silence_then_tone_yields_single_inference() {
        let engine = FakeEngine::default();
        let mut settings = StreamSettings::default();
        settings.on_inference_error = InferenceFailurePolicy::DropSession;
        let manager = SessionManager::init(Box::new(engine.clone()), settings).unwrap();

        let sink = RecordingSink::default();
        let handle = manager.open("e2e", Box::new(sink.clone())).unwrap();

        // 100 ms chunks of digital silence.
        for _ in 0..50 {
            assert!(handle.submit(&pcm(std::iter::repeat(0.0).take(1600))));
        }
        assert!(wait_until(|| manager.stats().samples_applied == 80_000));
        assert!(wait_until(|| manager.queue_depth() == 0));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(engine.call_count(), 0);
        assert!(sink.sent().is_empty());

        let tone = (0..16_000).map(|n| 0.8 * (std::f32::consts::PI * n as f32 / 2.0).sin());
        assert!(handle.submit(&pcm(tone)));

        assert!(wait_until(|| sink.sent().len() == 1));
        assert_eq!(engine.call_count(), 1);
        assert_eq!(engine.calls.lock().unwrap()[0].window.len(), 480_000);

        drop(handle);
        manager.shutdown();
    }
}
