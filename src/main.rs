use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use gst_scout::core::app_state::RefreshRequest;
use gst_scout::core::config::load_scout_config;
use gst_scout::core::error::RefreshError;
use gst_scout::AppState;

fn parse_port_from_args() -> Option<u16> {
    let mut args = std::env::args().peekable();
    while let Some(a) = args.next() {
        if a == "--port" {
            if let Some(v) = args.next() {
                if let Ok(p) = v.parse::<u16>() {
                    return Some(p);
                }
            }
        } else if let Some(rest) = a.strip_prefix("--port=") {
            if let Ok(p) = rest.parse::<u16>() {
                return Some(p);
            }
        }
    }
    None
}

fn today() -> chrono::NaiveDate {
    chrono::Local::now().date_naive()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tower_http=warn"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    info!("Starting gst-scout {}", env!("CARGO_PKG_VERSION"));

    let config = load_scout_config();
    let http_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(60))
        .connect_timeout(std::time::Duration::from_secs(10))
        .build()?;

    let refresh_every = config.service.resolve_refresh_interval();
    let port = parse_port_from_args().unwrap_or_else(|| config.service.resolve_port());
    let state = Arc::new(AppState::new(config, http_client)?);

    let cycle = tokio::spawn(refresh_loop(state.clone(), refresh_every));

    let app = Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/refresh", post(refresh_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let bind_addr = format!("0.0.0.0:{}", port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Address already in use: {}. Stop the existing process or run with --port {} (or set PORT).",
                bind_addr,
                port.saturating_add(1)
            )
        }
        Err(e) => return Err(e.into()),
    };
    info!("gst-scout listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    cycle.abort();
    Ok(())
}

/// Periodic refresh of every taxpayer due for it. The first cycle runs at startup.
async fn refresh_loop(state: Arc<AppState>, every: std::time::Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        match state.start_refresh(RefreshRequest::default(), today()).await {
            Ok(ticket) => info!(
                "scheduled refresh cycle: {} GSTs ({} skipped)",
                ticket.scheduled, ticket.skipped
            ),
            Err(e) => error!("scheduled refresh cycle not started: {}", e),
        }
    }
}

async fn shutdown_signal(state: Arc<AppState>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).ok();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                if let Some(ref mut s) = sigterm {
                    s.recv().await;
                } else {
                    futures::future::pending::<()>().await;
                }
            } => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    let in_flight = state.scraper.in_flight();
    if !in_flight.is_empty() {
        warn!(
            "shutting down with {} GSTs still being scraped; their results are lost",
            in_flight.len()
        );
    }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "gst-scout",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let request: RefreshRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RefreshRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": format!("invalid request body: {}", e) })),
            )
        })?
    };

    match state.start_refresh(request, today()).await {
        Ok(ticket) => Ok(Json(serde_json::json!({
            "message": format!("Job scheduled to update {} GSTs", ticket.scheduled),
            "skipped": ticket.skipped,
        }))),
        Err(RefreshError::Config(e)) => Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "error": e.to_string() })),
        )),
        Err(e) => {
            error!("refresh request failed: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            ))
        }
    }
}
