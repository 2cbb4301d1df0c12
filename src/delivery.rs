//! # Transcript Delivery Channel
//!
//! Every session owns one path back to whoever opened it. The path is modelled as
//! a [`TranscriptSink`] wrapped in a [`DeliveryChannel`] that enforces the
//! lifecycle:
//!
//! ```text
//! NeedsAcquisition --acquire--> Acquired --release--> Released (terminal)
//! ```
//!
//! Only the worker thread drives the channel. Acquisition is lazy (the first time
//! the session is evaluated), sends block until the sink acknowledges, and release
//! happens exactly once. Sending after release is an error.

use std::fmt;
use tracing::{debug, warn};

/// Errors raised by a delivery channel or its sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// `send` was called before the channel was acquired
    NotAcquired,
    /// `send` or `acquire` was called after release
    Released,
    /// The receiving side is gone
    Closed(String),
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::NotAcquired => write!(f, "delivery channel has not been acquired"),
            DeliveryError::Released => write!(f, "delivery channel has been released"),
            DeliveryError::Closed(reason) => write!(f, "delivery channel closed: {}", reason),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Receiving end of a session's transcripts.
///
/// ## Threading:
/// Implementations are moved into the session and called from the worker thread
/// only, so they need to be `Send` but not `Sync`. `send` must block until the
/// transcript has been handed over.
pub trait TranscriptSink: Send {
    /// Reserve whatever resource the sink needs before the first send.
    fn acquire(&mut self) -> Result<(), DeliveryError> {
        Ok(())
    }

    /// Deliver one transcript, blocking until it has been accepted.
    fn send(&mut self, text: &str) -> Result<(), DeliveryError>;

    /// Give the resource back. Called at most once.
    fn release(&mut self) {}
}

/// Sink backed by a plain closure, for callers that just want a callback.
pub struct CallbackSink<F> {
    callback: F,
}

impl<F> CallbackSink<F>
where
    F: FnMut(&str) -> Result<(), DeliveryError> + Send,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> TranscriptSink for CallbackSink<F>
where
    F: FnMut(&str) -> Result<(), DeliveryError> + Send,
{
    fn send(&mut self, text: &str) -> Result<(), DeliveryError> {
        (self.callback)(text)
    }
}

/// Lifecycle state of a delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    NeedsAcquisition,
    Acquired,
    Released,
}

/// A sink plus the state machine guarding it.
pub struct DeliveryChannel {
    sink: Box<dyn TranscriptSink>,
    state: DeliveryState,
}

impl DeliveryChannel {
    pub fn new(sink: Box<dyn TranscriptSink>) -> Self {
        Self {
            sink,
            state: DeliveryState::NeedsAcquisition,
        }
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    /// Acquire on first use; a no-op once acquired.
    pub fn ensure_acquired(&mut self) -> Result<(), DeliveryError> {
        match self.state {
            DeliveryState::Acquired => Ok(()),
            DeliveryState::Released => Err(DeliveryError::Released),
            DeliveryState::NeedsAcquisition => {
                self.sink.acquire()?;
                self.state = DeliveryState::Acquired;
                debug!("Delivery channel acquired");
                Ok(())
            }
        }
    }

    pub fn send(&mut self, text: &str) -> Result<(), DeliveryError> {
        match self.state {
            DeliveryState::NeedsAcquisition => Err(DeliveryError::NotAcquired),
            DeliveryState::Released => Err(DeliveryError::Released),
            DeliveryState::Acquired => self.sink.send(text),
        }
    }

    /// Move to `Released`.
    ///
    /// The sink's `release` only runs if it was acquired. Releasing twice logs a
    /// warning and does nothing.
    pub fn release(&mut self) {
        match self.state {
            DeliveryState::Released => {
                warn!("Delivery channel released twice; ignoring");
            }
            DeliveryState::NeedsAcquisition => {
                self.state = DeliveryState::Released;
            }
            DeliveryState::Acquired => {
                self.sink.release();
                self.state = DeliveryState::Released;
            }
        }
    }
}

impl fmt::Debug for DeliveryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryChannel")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Calls {
        acquired: usize,
        sent: Vec<String>,
        released: usize,
    }

    struct RecordingSink(Arc<Mutex<Calls>>);

    impl TranscriptSink for RecordingSink {
        fn acquire(&mut self) -> Result<(), DeliveryError> {
            self.0.lock().unwrap().acquired += 1;
            Ok(())
        }

        fn send(&mut self, text: &str) -> Result<(), DeliveryError> {
            self.0.lock().unwrap().sent.push(text.to_string());
            Ok(())
        }

        fn release(&mut self) {
            self.0.lock().unwrap().released += 1;
        }
    }

    fn recording_channel() -> (DeliveryChannel, Arc<Mutex<Calls>>) {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let channel = DeliveryChannel::new(Box::new(RecordingSink(calls.clone())));
        (channel, calls)
    }

    #[test]
    fn test_full_lifecycle() {
        let (mut channel, calls) = recording_channel();
        assert_eq!(channel.state(), DeliveryState::NeedsAcquisition);

        channel.ensure_acquired().unwrap();
        channel.ensure_acquired().unwrap();
        assert_eq!(channel.state(), DeliveryState::Acquired);

        channel.send(" hello").unwrap();
        channel.send(" world").unwrap();
        channel.release();
        assert_eq!(channel.state(), DeliveryState::Released);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.acquired, 1);
        assert_eq!(calls.sent, vec![" hello", " world"]);
        assert_eq!(calls.released, 1);
    }

    #[test]
    fn test_send_requires_acquisition() {
        let (mut channel, calls) = recording_channel();
        assert_eq!(channel.send("x"), Err(DeliveryError::NotAcquired));
        assert!(calls.lock().unwrap().sent.is_empty());
    }

    #[test]
    fn test_send_after_release_is_error() {
        let (mut channel, calls) = recording_channel();
        channel.ensure_acquired().unwrap();
        channel.release();

        assert_eq!(channel.send("late"), Err(DeliveryError::Released));
        assert_eq!(channel.ensure_acquired(), Err(DeliveryError::Released));
        assert!(calls.lock().unwrap().sent.is_empty());
    }

    #[test]
    fn test_release_happens_once() {
        let (mut channel, calls) = recording_channel();
        channel.ensure_acquired().unwrap();
        channel.release();
        channel.release();
        assert_eq!(calls.lock().unwrap().released, 1);
    }

    #[test]
    fn test_release_without_acquire_skips_sink() {
        let (mut channel, calls) = recording_channel();
        channel.release();
        assert_eq!(channel.state(), DeliveryState::Released);
        assert_eq!(calls.lock().unwrap().released, 0);
    }

    #[test]
    fn test_callback_sink_forwards_errors() {
        let mut sink = CallbackSink::new(|text: &str| {
            if text.is_empty() {
                Err(DeliveryError::Closed("empty".to_string()))
            } else {
                Ok(())
            }
        });
        assert!(sink.send("ok").is_ok());
        assert_eq!(sink.send(""), Err(DeliveryError::Closed("empty".to_string())));
    }
}
