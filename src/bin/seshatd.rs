//! seshatd: the seshat ingestion daemon.
//!
//! Hosts the HTTP event intake and runs the bridge worker:
//!
//! - `POST /ingest` — event JSON; 202 on accept, 400 problem document on
//!   schema violation (recorded to the invalid-events sidecar)
//! - `GET  /health` — daemon status
//!
//! Optional bearer auth via `SESHAT_TOKEN`; port via `SESHAT_PORT`
//! (default 8787). Build and run: `cargo run --features server --bin seshatd`.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use serde::Serialize;
use tower_http::cors::CorsLayer;

use seshat::bridge::BridgeDaemon;
use seshat::config::Flags;
use seshat::core::Core;
use seshat::error::SeshatError;
use seshat::event::Event;
use seshat::paths::SeshatPaths;
use seshat::queue::CaptureOutcome;

struct ServerState {
    core: Arc<Core>,
    token: Option<String>,
}

/// Structured problem document for rejected requests.
#[derive(Debug, Serialize)]
struct Problem {
    error: String,
    detail: String,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let paths = match SeshatPaths::resolve() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("seshatd: {e}");
            std::process::exit(1);
        }
    };
    let core = match Core::open(paths, Flags::from_env()) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("seshatd: {e}");
            std::process::exit(1);
        }
    };

    let port: u16 = std::env::var("SESHAT_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8787);
    let token = std::env::var("SESHAT_TOKEN").ok();
    if token.is_none() {
        tracing::warn!("SESHAT_TOKEN not set; /ingest accepts unauthenticated requests");
    }

    let state = Arc::new(ServerState {
        core: Arc::clone(&core),
        token,
    });

    let app = Router::new()
        .route("/ingest", post(ingest))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state);

    // The bridge worker shares the process with the intake.
    let mut daemon = BridgeDaemon::new(core);
    let worker = tokio::spawn(async move { daemon.run().await });

    let addr = format!("127.0.0.1:{port}");
    tracing::info!(%addr, "seshatd listening");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("seshatd: failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        eprintln!("seshatd: server error: {e}");
    }
    worker.abort();
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // SESHAT_LOG_DIR redirects daemon logs to a file.
    if let Ok(dir) = std::env::var("SESHAT_LOG_DIR") {
        let _ = std::fs::create_dir_all(&dir);
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(std::path::Path::new(&dir).join("seshatd.log"))
        {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
            return;
        }
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn authorized(state: &ServerState, headers: &HeaderMap) -> bool {
    let Some(expected) = &state.token else {
        return true;
    };
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|presented| presented == expected)
}

async fn ingest(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(event): Json<Event>,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(Problem {
                error: "unauthorized".into(),
                detail: "missing or invalid bearer token".into(),
            }),
        )
            .into_response();
    }

    match state.core.ingest(&event) {
        Ok(CaptureOutcome::Accepted) | Ok(CaptureOutcome::Dropped) => {
            // Dropped-on-contention still acknowledges: the event is safe in
            // the overflow sidecar.
            StatusCode::ACCEPTED.into_response()
        }
        Err(SeshatError::Queue(e)) => (
            StatusCode::BAD_REQUEST,
            Json(Problem {
                error: "schema_violation".into(),
                detail: e.to_string(),
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(Problem {
                error: "internal".into(),
                detail: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn health(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let queue_state = state.core.queue().state();
    Json(serde_json::json!({
        "status": "ok",
        "queue_head": queue_state.head,
        "queue_active": queue_state.active_records,
        "insights": state.core.insights().len(),
    }))
}
