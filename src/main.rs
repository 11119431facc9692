use anyhow::Context;
use clap::Parser;
use colored::*;
use std::sync::Arc;
use tracing::info;

use signlingo_ml::args::Args;
use signlingo_ml::config::AppConfig;
use signlingo_ml::server;
use signlingo_ml::service::PredictionService;
use signlingo_ml::types::Mode;

fn mode_status(service: &PredictionService, mode: Mode) -> ColoredString {
    if service.is_enabled(mode) {
        format!("{}: up", mode).green()
    } else {
        format!("{}: disabled", mode).yellow()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signlingo_ml=info,tower_http=warn".into()),
        )
        .init();

    info!("signlingo-ml v{} starting", env!("CARGO_PKG_VERSION"));

    let mut config = AppConfig::load(&args.config)?;
    args.apply(&mut config);
    if args.write_config {
        config.save(&args.config)?;
        info!("wrote effective configuration to {}", args.config.display());
    }

    // model loading is blocking (file IO, ONNX session setup, possible artifact patch)
    let load_config = config.clone();
    let service = tokio::task::spawn_blocking(move || PredictionService::load(&load_config))
        .await
        .context("model loading task failed")?;
    let service = Arc::new(service);

    println!(
        "{} [{}] [{}]",
        "SignLingo ML".bold(),
        mode_status(&service, Mode::Letters),
        mode_status(&service, Mode::Gestures)
    );

    let listener = tokio::net::TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;
    info!("listening on {}", config.server.listen_addr);

    axum::serve(listener, server::router(service))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}
