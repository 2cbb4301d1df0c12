use crate::{error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// The configuration the server is running with. Read-only: the worker's
/// settings are fixed at startup.
pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = serde_json::to_value(state.config.as_ref())?;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}
