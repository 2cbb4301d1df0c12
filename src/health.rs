use crate::device::DeviceSummary;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = &state.config;
    let running = state.sessions.is_running();

    let body = json!({
        "status": if running { "healthy" } else { "degraded" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "worker": {
            "running": running,
            "queue_depth": state.sessions.queue_depth(),
            "active_sessions": state.active_sessions(),
            "stats": state.sessions.stats()
        },
        "memory": get_memory_info(),
        "model": {
            "whisper": config.models.whisper_model,
            "language": config.models.language,
            "compute": DeviceSummary {
                device: state.device,
                threads: config.streaming.resolved_threads(),
            }
        }
    });

    if running {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let uptime_seconds = state.get_uptime_seconds();
    let stats = state.sessions.stats();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "worker": stats,
        "gate_pass_rate": if stats.inference_attempts > 0 {
            stats.inferences as f64 / stats.inference_attempts as f64
        } else {
            0.0
        },
        "queue_depth": state.sessions.queue_depth(),
        "sessions": state.sessions.sessions(),
        "memory": get_memory_info()
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", process::id())) {
            let field = |name: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map_or(0, |kb| kb * 1024)
            };

            return json!({
                "resident_memory_bytes": field("VmRSS:"),
                "virtual_memory_bytes": field("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "pid": process::id(),
        "available": false,
        "note": "Memory info not available on this platform"
    })
}
