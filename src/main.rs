//! Keiba-PL ranking engine
//!
//! Plackett-Luce skill estimation, Power EP rank probabilities, isotonic
//! calibration and coverage-fixed grades, served over REST or run from the
//! CLI.

mod artifacts;
mod audit;
mod calibration;
mod cli;
mod config;
mod corpus;
mod error;
mod forbidden;
mod grading;
mod inference;
mod metrics;
mod model;
mod pipeline;
mod routes;
mod skill;
mod storage;
mod types;

use axum::{routing::get, routing::post, Router};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::calibration::Calibrator;
use crate::cli::{Cli, Commands};
use crate::config::AppConfig;
use crate::model::create_shared_model;
use crate::routes::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging; stdout is reserved for command output
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keiba_pl=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { host, port } => run_server(Some(host), Some(port)).await,
        Commands::Train {
            corpus,
            splits,
            output,
        } => cli::run_train(corpus, splits, output).await,
        Commands::Run {
            corpus,
            splits,
            out_dir,
        } => cli::run_pipeline_command(corpus, splits, out_dir).await,
        Commands::Predict {
            input,
            format,
            model,
            calibration,
            db,
        } => cli::run_predict(input, format, model, calibration, db).await,
        Commands::Audit { splits, corpus } => cli::run_audit(splits, corpus).await,
    }
}

/// Run the API server.
async fn run_server(host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    // Load configuration
    let mut config = AppConfig::load()?;

    // Override with CLI args
    if let Some(h) = host {
        config.server.host = h;
    }
    if let Some(p) = port {
        config.server.port = p;
    }

    tracing::info!("Configuration loaded");
    tracing::info!("Model path: {}", config.model.path);

    let model = create_shared_model(&config.model.path)?;

    let calibrator = match config.model.calibration_path {
        Some(ref path) => {
            tracing::info!("Loading calibrator from: {}", path);
            match Calibrator::from_file(path) {
                Ok(cal) => cal,
                Err(e) => {
                    tracing::warn!("Failed to load calibrator: {}, using None", e);
                    Calibrator::None
                }
            }
        }
        None => {
            tracing::info!("No calibration artifact configured; serving raw probabilities");
            Calibrator::None
        }
    };

    // Create application state
    let state = Arc::new(AppState {
        model,
        config: config.clone(),
        calibrator,
    });

    // Build router
    let app = Router::new()
        .route("/health", get(routes::health))
        .route("/model/info", get(routes::model_info))
        .route("/predict", post(routes::predict))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    // Start server
    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
