mod config;
mod monitoring;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use bourracho_api::middleware::decode_token;
use bourracho_api::{ApiError, AppStateInner};
use bourracho_db::Database;
use bourracho_db::media::MediaStorage;
use bourracho_gateway::connection::{self, CommandHandler};
use bourracho_gateway::{Dispatcher, DispatcherConfig, Metrics};
use bourracho_sync::analysis::{AnalysisGenerator, HttpAnalysisGenerator, LocalAnalysisGenerator};
use bourracho_sync::{Engine, EngineConfig};

use crate::config::Config;

#[derive(Clone)]
struct ServerState {
    engine: Arc<Engine>,
    jwt_secret: String,
}

#[derive(Deserialize)]
struct WsParams {
    token: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bourracho=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Storage
    let db = Database::open(&config.db_path)?;
    let media = MediaStorage::new(config.media_dir.clone()).await?;

    // Engine
    let metrics = Arc::new(Metrics::new()?);
    let dispatcher = Dispatcher::with_metrics(
        DispatcherConfig {
            queue_capacity: config.subscriber_queue,
            send_timeout: config.send_timeout,
        },
        metrics.clone(),
    );
    let analysis: Arc<dyn AnalysisGenerator> = match &config.analysis_url {
        Some(url) => {
            info!("Using remote analysis generator at {}", url);
            Arc::new(HttpAnalysisGenerator::new(url.clone(), config.analysis_timeout)?)
        }
        None => {
            info!("Using built-in analysis generator");
            Arc::new(LocalAnalysisGenerator)
        }
    };
    let engine = Arc::new(Engine::new(
        Arc::new(db),
        dispatcher,
        analysis,
        EngineConfig {
            announce_rejoin: config.announce_rejoin,
        },
    ));

    let app_state = Arc::new(AppStateInner {
        engine: engine.clone(),
        media,
        jwt_secret: config.jwt_secret.clone(),
    });

    let ws_route = Router::new()
        .route("/chat/{conversation_id}/ws", get(ws_upgrade))
        .with_state(ServerState {
            engine: engine.clone(),
            jwt_secret: config.jwt_secret.clone(),
        });

    let app = Router::new()
        .merge(monitoring::router(engine, metrics))
        .merge(bourracho_api::router(app_state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Bourracho server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Browsers cannot set headers on a WebSocket handshake, so the token comes
/// in the query string. Membership is checked before upgrading.
async fn ws_upgrade(
    State(state): State<ServerState>,
    Path(conversation_id): Path<String>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Result<Response, Response> {
    let claims = decode_token(&state.jwt_secret, &params.token)
        .ok_or_else(|| StatusCode::UNAUTHORIZED.into_response())?;

    state
        .engine
        .ensure_member(&conversation_id, &claims.sub)
        .await
        .map_err(|e| {
            warn!(
                "{} refused live access to {}: {}",
                claims.sub, conversation_id, e
            );
            ApiError(e).into_response()
        })?;

    let dispatcher = state.engine.dispatcher().clone();
    let commands: Arc<dyn CommandHandler> = state.engine.clone();
    Ok(ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, dispatcher, commands, conversation_id, claims.sub)
    }))
}
