//! # WebSocket Audio Streaming Handler
//!
//! Clients connect to `/ws/audio`, start a session, then stream binary PCM
//! frames. Transcripts come back as JSON text frames.
//!
//! ## WebSocket Protocol:
//! 1. **Start**: `{"type":"start_session","session_id":"optional","audio_config":{...}}`
//!    opens a streaming session and answers `session_status` `started`
//! 2. **Audio**: binary frames of 16-bit little-endian mono PCM
//! 3. **Transcripts**: `{"type":"transcription","session_id","text","timestamp"}`
//! 4. **End**: `{"type":"end_session"}` destroys the session; the connection
//!    closing or missing heartbeats does the same
//!
//! ## Delivery:
//! The transcription worker runs on its own thread. [`WsSink`] forwards each
//! transcript to the connection's actor and blocks until the actor has written
//! the frame, so a closed connection surfaces as a failed send.

use crate::audio::pcm::AudioFormat;
use crate::audio::session::SessionHandle;
use crate::delivery::{DeliveryError, TranscriptSink};
use crate::state::AppState;
use crate::worker::SessionError;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// WebSocket message types for client-server communication.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebSocketMessage {
    /// Client opens a streaming session
    StartSession {
        /// Generated when omitted
        #[serde(default)]
        session_id: Option<String>,
        /// Declared format; assumed to match the server when omitted
        #[serde(default)]
        audio_config: Option<AudioFormat>,
    },

    /// Client ends its session
    EndSession {
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Transcript for one window
    Transcription {
        session_id: String,
        text: String,
        /// Unix time in milliseconds
        timestamp: i64,
    },

    /// Session lifecycle: "started", "ended", "released"
    SessionStatus {
        session_id: String,
        status: String,
        message: Option<String>,
    },

    Error {
        code: String,
        message: String,
        session_id: Option<String>,
    },

    Ping {
        timestamp: u64,
    },

    Pong {
        timestamp: u64,
    },
}

impl WebSocketMessage {
    fn status(session_id: &str, status: &str, message: &str) -> Self {
        WebSocketMessage::SessionStatus {
            session_id: session_id.to_string(),
            status: status.to_string(),
            message: Some(message.to_string()),
        }
    }
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Sent by [`WsSink`] from the worker thread; `ack` fires once the frame is written.
#[derive(Message)]
#[rtype(result = "()")]
struct DeliverTranscript {
    session_id: String,
    text: String,
    ack: oneshot::Sender<()>,
}

/// The worker released this connection's delivery channel.
#[derive(Message)]
#[rtype(result = "()")]
struct SessionReleased {
    session_id: String,
}

/// Delivery channel backed by a connection actor.
pub struct WsSink {
    addr: Addr<AudioWebSocket>,
    session_id: String,
}

impl WsSink {
    pub fn new(addr: Addr<AudioWebSocket>, session_id: impl Into<String>) -> Self {
        Self {
            addr,
            session_id: session_id.into(),
        }
    }
}

impl TranscriptSink for WsSink {
    fn send(&mut self, text: &str) -> Result<(), DeliveryError> {
        let (ack, written) = oneshot::channel();
        self.addr.do_send(DeliverTranscript {
            session_id: self.session_id.clone(),
            text: text.to_string(),
            ack,
        });

        // The actor drops `ack` unanswered when the connection has stopped.
        written
            .blocking_recv()
            .map_err(|_| DeliveryError::Closed(format!("connection for {} has stopped", self.session_id)))
    }

    fn release(&mut self) {
        self.addr.do_send(SessionReleased {
            session_id: self.session_id.clone(),
        });
    }
}

/// WebSocket actor: one per connection, holding at most one session.
pub struct AudioWebSocket {
    state: web::Data<AppState>,

    /// Producer handle of the open session
    session: Option<SessionHandle>,

    /// Format every binary frame must be in
    expected_format: AudioFormat,

    last_heartbeat: Instant,
}

impl AudioWebSocket {
    pub fn new(state: web::Data<AppState>) -> Self {
        let expected_format = AudioFormat::pcm16_mono(state.config.streaming.sample_rate);
        Self {
            state,
            session: None,
            expected_format,
            last_heartbeat: Instant::now(),
        }
    }

    fn send_json(&self, ctx: &mut ws::WebsocketContext<Self>, msg: &WebSocketMessage) {
        match serde_json::to_string(msg) {
            Ok(json) => ctx.text(json),
            Err(err) => error!("Failed to serialize WebSocket message: {}", err),
        }
    }

    /// Send error message to client.
    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str, session_id: Option<String>) {
        warn!("WebSocket error {}: {}", code, message);
        self.send_json(
            ctx,
            &WebSocketMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
                session_id,
            },
        );
    }

    fn current_session_id(&self) -> Option<String> {
        self.session.as_ref().map(|handle| handle.id().to_string())
    }

    fn handle_start_session(
        &mut self,
        session_id: Option<String>,
        audio_config: Option<AudioFormat>,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if let Some(format) = audio_config {
            if let Err(err) = format.check_against(&self.expected_format) {
                self.send_error(ctx, "unsupported_format", &err, Some(session_id));
                return;
            }
        }

        if let Some(existing) = self.session.as_ref().filter(|handle| !handle.is_destroyed()) {
            let message = format!("Connection already streaming session {}", existing.id());
            self.send_error(ctx, "session_exists", &message, Some(session_id));
            return;
        }

        let sink = WsSink::new(ctx.address(), session_id.clone());
        match self.state.sessions.open(session_id.clone(), Box::new(sink)) {
            Ok(handle) => {
                // Replacing an ended session's handle; its release is already queued.
                self.session = Some(handle);
                info!("WebSocket session {} started", session_id);
                self.send_json(ctx, &WebSocketMessage::status(&session_id, "started", "Session started"));
            }
            Err(err @ SessionError::DuplicateId(_)) => {
                self.send_error(ctx, "session_exists", &err.to_string(), Some(session_id));
            }
            Err(err @ SessionError::WorkerStopped) => {
                self.send_error(ctx, "unavailable", &err.to_string(), Some(session_id));
                ctx.stop();
            }
        }
    }

    fn handle_end_session(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        match self.session.as_ref() {
            Some(handle) => {
                handle.destroy();
                let session_id = handle.id().to_string();
                info!("WebSocket session {} ended by client", session_id);
                self.send_json(ctx, &WebSocketMessage::status(&session_id, "ended", "Session ended"));
            }
            None => self.send_error(ctx, "session_not_started", "No session to end", None),
        }
    }

    fn handle_audio_data(&mut self, data: &[u8], ctx: &mut ws::WebsocketContext<Self>) {
        let Some(handle) = self.session.as_ref() else {
            self.send_error(ctx, "session_not_started", "Send start_session before audio", None);
            return;
        };

        if !handle.submit(data) {
            let session_id = handle.id().to_string();
            self.send_error(ctx, "session_closed", "Session has ended", Some(session_id));
            return;
        }

        debug!("Queued {} bytes of audio", data.len());
    }
}

impl Actor for AudioWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("WebSocket connection started");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("WebSocket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }

            act.send_json(ctx, &WebSocketMessage::Ping { timestamp: now_millis() });
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(handle) = self.session.take() {
            info!("WebSocket connection stopped, destroying session {}", handle.id());
            handle.destroy();
        } else {
            info!("WebSocket connection stopped");
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for AudioWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<WebSocketMessage>(&text) {
                Ok(WebSocketMessage::StartSession { session_id, audio_config }) => {
                    self.handle_start_session(session_id, audio_config, ctx);
                }
                Ok(WebSocketMessage::EndSession { .. }) => self.handle_end_session(ctx),
                Ok(WebSocketMessage::Ping { timestamp }) => {
                    self.last_heartbeat = Instant::now();
                    self.send_json(ctx, &WebSocketMessage::Pong { timestamp });
                }
                Ok(WebSocketMessage::Pong { .. }) => {
                    self.last_heartbeat = Instant::now();
                }
                Ok(_) => {
                    warn!("Received unexpected message type from client");
                }
                Err(err) => {
                    let session_id = self.current_session_id();
                    self.send_error(ctx, "invalid_json", &format!("Invalid JSON: {}", err), session_id);
                }
            },
            Ok(ws::Message::Binary(data)) => self.handle_audio_data(&data, ctx),
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<DeliverTranscript> for AudioWebSocket {
    type Result = ();

    fn handle(&mut self, msg: DeliverTranscript, ctx: &mut Self::Context) {
        self.send_json(
            ctx,
            &WebSocketMessage::Transcription {
                session_id: msg.session_id,
                text: msg.text,
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
        );
        // The worker may have given up waiting; nothing to do then.
        let _ = msg.ack.send(());
    }
}

impl Handler<SessionReleased> for AudioWebSocket {
    type Result = ();

    fn handle(&mut self, msg: SessionReleased, ctx: &mut Self::Context) {
        debug!("Delivery channel for {} released", msg.session_id);
        self.send_json(
            ctx,
            &WebSocketMessage::status(&msg.session_id, "released", "No further transcripts will be sent"),
        );
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Upgrades the request and hands the connection to an [`AudioWebSocket`] actor.
pub async fn audio_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New WebSocket connection request from: {:?}", req.connection_info().peer_addr());
    ws::start(AudioWebSocket::new(app_state), &req, stream)
}
