use crate::{
    error::{AppError, AppResult},
    state::AppState,
};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn list_sessions(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    if !state.sessions.is_running() {
        return Err(AppError::Unavailable("transcription worker has stopped".to_string()));
    }

    let sessions = state.sessions.sessions();
    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "sessions": sessions
    })))
}

pub async fn get_session(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();

    state
        .sessions
        .sessions()
        .into_iter()
        .find(|summary| summary.session_id == session_id)
        .map(|summary| HttpResponse::Ok().json(summary))
        .ok_or_else(|| AppError::NotFound(format!("Session {} is not open", session_id)))
}
