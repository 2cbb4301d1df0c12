//! # Batch Dispatch
//!
//! Everything the worker does with one drained batch:
//!
//! 1. Walk the batch in order. Audio chunks are applied to their session's
//!    buffer, release workloads tear down delivery channels as they are met, so
//!    a release always follows the audio queued before it.
//! 2. Collect the sessions that received audio, first occurrence wins.
//! 3. For each of them: acquire the delivery channel on first use, check the
//!    trigger, build the window, gate it, run the engine, then suppress or
//!    deliver the result.
//!
//! The dispatcher is plain synchronous code so it can be driven directly in
//! tests without the worker thread.

use crate::audio::session::{Session, SessionState};
use crate::audio::vad;
use crate::config::InferenceFailurePolicy;
use crate::delivery::DeliveryState;
use crate::error::fatal;
use crate::transcription::engine::InferenceEngine;
use crate::worker::queue::Workload;
use crate::worker::stats::WorkerStats;
use crate::worker::StreamSettings;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub struct Dispatcher {
    engine: Box<dyn InferenceEngine>,
    settings: StreamSettings,
    /// Reused inference window, always `settings.capacity` long.
    scratch: Vec<f32>,
    stats: Arc<WorkerStats>,
}

impl Dispatcher {
    pub fn new(engine: Box<dyn InferenceEngine>, settings: StreamSettings, stats: Arc<WorkerStats>) -> Self {
        Self {
            engine,
            scratch: vec![0.0; settings.capacity],
            settings,
            stats,
        }
    }

    /// Process one drained batch.
    ///
    /// ## Returns:
    /// `true` if any audio chunk was applied, which the worker loop uses for idle
    /// back-off.
    pub fn run_batch(&mut self, batch: Vec<Workload>) -> bool {
        if batch.is_empty() {
            return false;
        }
        WorkerStats::incr(&self.stats.batches);

        let mut processed_audio = false;
        let mut touched: Vec<Arc<Session>> = Vec::new();

        for workload in batch {
            match workload {
                Workload::AudioChunk { session, samples } => {
                    if !self.apply_chunk(&session, &samples) {
                        continue;
                    }
                    processed_audio = true;
                    if !touched.iter().any(|seen| Arc::ptr_eq(seen, &session)) {
                        touched.push(session);
                    }
                }
                Workload::ReleaseSession { session } => self.release(&session),
            }
        }

        for session in &touched {
            self.evaluate(session);
        }

        processed_audio
    }

    /// Buffer update rule. Audio for a session whose channel is already released
    /// is discarded.
    fn apply_chunk(&self, session: &Session, samples: &[f32]) -> bool {
        let mut state = session.state();
        if state.delivery.state() == DeliveryState::Released {
            debug!(session_id = %session.id(), samples = samples.len(), "Discarding audio for released session");
            return false;
        }

        let dropped = state.buffer.append(samples);
        if dropped > 0 {
            warn!(session_id = %session.id(), "dropping {} samples", dropped);
            WorkerStats::add(&self.stats.samples_dropped, dropped as u64);
        }

        WorkerStats::incr(&self.stats.chunks_applied);
        WorkerStats::add(&self.stats.samples_applied, samples.len() as u64);
        true
    }

    fn release(&self, session: &Session) {
        session.state().delivery.release();
        WorkerStats::incr(&self.stats.releases);
        info!(session_id = %session.id(), "Session delivery channel released");
    }

    /// Trigger, gate, infer and deliver for one session.
    fn evaluate(&mut self, session: &Session) {
        if session.is_destroyed() {
            return;
        }

        let mut guard = session.state();
        let state: &mut SessionState = &mut guard;

        if let Err(err) = state.delivery.ensure_acquired() {
            fatal("acquire delivery channel", err);
        }

        let unprocessed = state.buffer.unprocessed();
        if unprocessed < self.settings.overlap {
            return;
        }
        WorkerStats::incr(&self.stats.inference_attempts);

        let count = self.settings.capacity.min(unprocessed + self.settings.overlap);
        state.buffer.copy_tail_into(&mut self.scratch, count);
        state.buffer.reset_unprocessed();

        if !vad::is_speech(&mut self.scratch, &self.settings.vad) {
            WorkerStats::incr(&self.stats.gate_rejections);
            debug!(session_id = %session.id(), window = count, "No speech in window");
            return;
        }

        let started = Instant::now();
        let transcript = match self
            .engine
            .transcribe(&self.scratch, &state.prompt_tokens, &self.settings.decode)
        {
            Ok(transcript) => transcript,
            Err(err) => {
                WorkerStats::incr(&self.stats.engine_failures);
                match self.settings.on_inference_error {
                    InferenceFailurePolicy::Abort => fatal("run inference", err),
                    InferenceFailurePolicy::DropSession => {
                        warn!(session_id = %session.id(), error = %err, "Inference failed; dropping session");
                        session.mark_destroyed();
                        return;
                    }
                }
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        WorkerStats::incr(&self.stats.inferences);
        WorkerStats::add(&self.stats.inference_ms_total, elapsed_ms);

        let text = transcript.text();
        if self.settings.suppressor.is_placeholder(&text) {
            WorkerStats::incr(&self.stats.suppressed);
            debug!(session_id = %session.id(), text = %text, "Suppressed placeholder transcript");
            return;
        }

        debug!(session_id = %session.id(), elapsed_ms, text = %text, "Window transcribed");
        state.prompt_tokens = transcript.tokens;
        state.last_text = text;

        match state.delivery.send(&state.last_text) {
            Ok(()) => {
                WorkerStats::incr(&self.stats.deliveries);
                session.record_delivery();
            }
            Err(err) => {
                WorkerStats::incr(&self.stats.delivery_failures);
                warn!(session_id = %session.id(), error = %err, "Delivery failed; marking session destroyed");
                session.mark_destroyed();
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::session::SessionHandle;
    use crate::audio::vad::VadSettings;
    use crate::delivery::{DeliveryError, TranscriptSink};
    use crate::transcription::engine::{DecodeOptions, Suppressor, Transcript};
    use crate::worker::queue::WorkQueue;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    pub struct EngineCall {
        pub window: Vec<f32>,
        pub prompt: Vec<u32>,
    }

    /// Records every call and replays scripted results, falling back to " hello".
    #[derive(Clone, Default)]
    pub struct FakeEngine {
        pub calls: Arc<Mutex<Vec<EngineCall>>>,
        pub script: Arc<Mutex<VecDeque<Result<Transcript, String>>>>,
    }

    impl FakeEngine {
        pub fn reply(&self, result: Result<Transcript, String>) {
            self.script.lock().unwrap().push_back(result);
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl InferenceEngine for FakeEngine {
        fn transcribe(&mut self, window: &[f32], prompt: &[u32], _options: &DecodeOptions) -> anyhow::Result<Transcript> {
            self.calls.lock().unwrap().push(EngineCall {
                window: window.to_vec(),
                prompt: prompt.to_vec(),
            });
            match self.script.lock().unwrap().pop_front() {
                Some(Ok(transcript)) => Ok(transcript),
                Some(Err(reason)) => Err(anyhow::anyhow!(reason)),
                None => Ok(text(" hello", &[7])),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    pub enum SinkEvent {
        Acquire,
        Send(String),
        Release,
    }

    #[derive(Clone, Default)]
    pub struct RecordingSink {
        pub events: Arc<Mutex<Vec<SinkEvent>>>,
        pub fail_sends: bool,
    }

    impl RecordingSink {
        pub fn sent(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    SinkEvent::Send(text) => Some(text.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    impl TranscriptSink for RecordingSink {
        fn acquire(&mut self) -> Result<(), DeliveryError> {
            self.events.lock().unwrap().push(SinkEvent::Acquire);
            Ok(())
        }

        fn send(&mut self, text: &str) -> Result<(), DeliveryError> {
            if self.fail_sends {
                return Err(DeliveryError::Closed("receiver gone".to_string()));
            }
            self.events.lock().unwrap().push(SinkEvent::Send(text.to_string()));
            Ok(())
        }

        fn release(&mut self) {
            self.events.lock().unwrap().push(SinkEvent::Release);
        }
    }

    pub fn text(s: &str, tokens: &[u32]) -> Transcript {
        Transcript {
            segments: vec![s.to_string()],
            tokens: tokens.to_vec(),
        }
    }

    /// Capacity 16, overlap 4, unfiltered gate over the last 4 samples.
    pub fn small_settings() -> StreamSettings {
        StreamSettings {
            capacity: 16,
            overlap: 4,
            vad: VadSettings {
                sample_rate: 16000,
                analysis_samples: 4,
                energy_threshold: 0.01,
                high_pass_cutoff_hz: 0.0,
            },
            decode: DecodeOptions::default(),
            suppressor: Suppressor::new([" you", " [BLANK_AUDIO]", " [ Silence ]"]),
            on_inference_error: InferenceFailurePolicy::DropSession,
            idle_wait: Duration::from_millis(1),
        }
    }

    fn setup() -> (Dispatcher, FakeEngine, Arc<WorkerStats>) {
        let engine = FakeEngine::default();
        let stats = Arc::new(WorkerStats::default());
        let dispatcher = Dispatcher::new(Box::new(engine.clone()), small_settings(), stats.clone());
        (dispatcher, engine, stats)
    }

    fn session(sink: &RecordingSink) -> Arc<Session> {
        Arc::new(Session::new("s1", 16, Box::new(sink.clone())))
    }

    fn chunk(session: &Arc<Session>, samples: &[f32]) -> Workload {
        Workload::AudioChunk {
            session: session.clone(),
            samples: samples.to_vec(),
        }
    }

    #[test]
    fn test_dedup_runs_once_on_post_batch_state() {
        let (mut dispatcher, engine, _) = setup();
        let sink = RecordingSink::default();
        let s = session(&sink);

        let processed = dispatcher.run_batch(vec![
            chunk(&s, &[0.5, 0.5]),
            chunk(&s, &[0.6, 0.6]),
            chunk(&s, &[0.7, 0.7]),
        ]);
        assert!(processed);

        let calls = engine.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let window = &calls[0].window;
        assert_eq!(window.len(), 16);
        // 6 new samples + 4 overlap, right aligned; everything before is silence.
        assert!(window[..10].iter().all(|&s| s == 0.0));
        assert_eq!(&window[10..], &[0.5, 0.5, 0.6, 0.6, 0.7, 0.7]);
        assert_eq!(s.state().buffer.unprocessed(), 0);
        assert_eq!(sink.sent(), vec![" hello"]);
    }

    #[test]
    fn test_trigger_requires_overlap_worth_of_audio() {
        let (mut dispatcher, engine, _) = setup();
        let sink = RecordingSink::default();
        let s = session(&sink);

        dispatcher.run_batch(vec![chunk(&s, &[0.5; 3])]);
        assert_eq!(engine.call_count(), 0);
        assert_eq!(s.state().buffer.unprocessed(), 3);
        // Acquired on first touch even without inference.
        assert_eq!(*sink.events.lock().unwrap(), vec![SinkEvent::Acquire]);

        dispatcher.run_batch(vec![chunk(&s, &[0.5])]);
        assert_eq!(engine.call_count(), 1);
        assert_eq!(s.state().buffer.unprocessed(), 0);
    }

    #[test]
    fn test_gate_rejection_still_consumes_samples() {
        let (mut dispatcher, engine, stats) = setup();
        let sink = RecordingSink::default();
        let s = session(&sink);

        dispatcher.run_batch(vec![chunk(&s, &[0.0; 8])]);
        assert_eq!(engine.call_count(), 0);
        assert_eq!(s.state().buffer.unprocessed(), 0);
        assert_eq!(stats.snapshot().gate_rejections, 1);
        assert!(sink.sent().is_empty());
    }

    #[test]
    fn test_audio_before_destroy_applied_before_release() {
        let (mut dispatcher, _engine, _) = setup();
        let sink = RecordingSink::default();
        let s = session(&sink);
        let queue = Arc::new(WorkQueue::new());
        let handle = SessionHandle::new(s.clone(), queue.clone());

        // Acquire the channel first so the release is observable on the sink.
        handle.submit(&[0u8; 2]);
        dispatcher.run_batch(queue.drain());

        let a: Vec<u8> = [8192i16, 8192].iter().flat_map(|v| v.to_le_bytes()).collect();
        let b: Vec<u8> = [16384i16, 16384].iter().flat_map(|v| v.to_le_bytes()).collect();
        handle.submit(&a);
        handle.submit(&b);
        handle.destroy();
        dispatcher.run_batch(queue.drain());

        let state = s.state();
        assert_eq!(state.buffer.tail(4), vec![0.25, 0.25, 0.5, 0.5]);
        assert_eq!(state.delivery.state(), DeliveryState::Released);
        assert_eq!(sink.events.lock().unwrap().last(), Some(&SinkEvent::Release));
    }

    #[test]
    fn test_suppressed_transcript_is_not_delivered() {
        let (mut dispatcher, engine, stats) = setup();
        engine.reply(Ok(text(" [BLANK_AUDIO]", &[1, 2])));
        let sink = RecordingSink::default();
        let s = session(&sink);

        dispatcher.run_batch(vec![chunk(&s, &[0.5; 4])]);
        assert_eq!(engine.call_count(), 1);
        assert!(sink.sent().is_empty());
        assert!(!s.is_destroyed());
        assert!(s.state().prompt_tokens.is_empty());
        assert_eq!(stats.snapshot().suppressed, 1);
    }

    #[test]
    fn test_prompt_context_carries_forward() {
        let (mut dispatcher, engine, _) = setup();
        engine.reply(Ok(text(" first", &[11, 12])));
        engine.reply(Ok(text(" second", &[13])));
        let sink = RecordingSink::default();
        let s = session(&sink);

        dispatcher.run_batch(vec![chunk(&s, &[0.5; 4])]);
        dispatcher.run_batch(vec![chunk(&s, &[0.5; 4])]);

        let calls = engine.calls.lock().unwrap();
        assert!(calls[0].prompt.is_empty());
        assert_eq!(calls[1].prompt, vec![11, 12]);
        assert_eq!(s.state().last_text, " second");
        assert_eq!(sink.sent(), vec![" first", " second"]);
    }

    #[test]
    fn test_delivery_failure_marks_destroyed() {
        let (mut dispatcher, engine, stats) = setup();
        let sink = RecordingSink {
            fail_sends: true,
            ..Default::default()
        };
        let s = session(&sink);

        dispatcher.run_batch(vec![chunk(&s, &[0.5; 4])]);
        assert!(s.is_destroyed());
        assert_eq!(stats.snapshot().delivery_failures, 1);

        dispatcher.run_batch(vec![chunk(&s, &[0.5; 4])]);
        assert_eq!(engine.call_count(), 1);
    }

    #[test]
    fn test_engine_failure_drops_session_under_drop_policy() {
        let (mut dispatcher, engine, stats) = setup();
        engine.reply(Err("decoder exploded".to_string()));
        let sink = RecordingSink::default();
        let s = session(&sink);

        dispatcher.run_batch(vec![chunk(&s, &[0.5; 4])]);
        assert!(s.is_destroyed());
        assert!(sink.sent().is_empty());
        assert_eq!(stats.snapshot().engine_failures, 1);
    }

    #[test]
    fn test_oversized_chunk_truncated() {
        let (mut dispatcher, _engine, stats) = setup();
        let sink = RecordingSink::default();
        let s = session(&sink);
        let samples: Vec<f32> = (0..40).map(|i| i as f32 / 100.0).collect();

        dispatcher.run_batch(vec![chunk(&s, &samples)]);

        let state = s.state();
        assert_eq!(state.buffer.len(), 16);
        assert_eq!(state.buffer.tail(16), samples[24..].to_vec());
        assert_eq!(stats.snapshot().samples_dropped, 24);
    }

    #[test]
    fn test_sessions_evaluated_in_first_occurrence_order() {
        let (mut dispatcher, engine, _) = setup();
        let sink_a = RecordingSink::default();
        let sink_b = RecordingSink::default();
        let a = Arc::new(Session::new("a", 16, Box::new(sink_a.clone())));
        let b = Arc::new(Session::new("b", 16, Box::new(sink_b.clone())));

        dispatcher.run_batch(vec![
            chunk(&b, &[0.2; 4]),
            chunk(&a, &[0.3; 4]),
            chunk(&b, &[0.2; 4]),
        ]);

        let calls = engine.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].window[15], 0.2);
        assert_eq!(calls[1].window[15], 0.3);
    }

    #[test]
    fn test_release_only_batch_reports_idle() {
        let (mut dispatcher, engine, _) = setup();
        let sink = RecordingSink::default();
        let s = session(&sink);
        s.mark_destroyed();

        assert!(!dispatcher.run_batch(vec![Workload::ReleaseSession { session: s.clone() }]));
        assert_eq!(s.state().delivery.state(), DeliveryState::Released);

        // Audio arriving after the release is discarded.
        assert!(!dispatcher.run_batch(vec![chunk(&s, &[0.5; 4])]));
        assert_eq!(engine.call_count(), 0);
        assert!(sink.events.lock().unwrap().is_empty());
    }
}
