use std::{net::TcpListener, sync::Arc};

use anyhow::{Context as _, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

use pubsubview::{
    api::{self, AppState},
    backends,
    cli::{Cli, Command},
    config::Config,
    hub::Hub,
    ingest::{IngestOptions, Ingestor},
    Context, Registry,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::load(&cli)?;
    let level = if cfg.logging_enabled {
        LevelFilter::INFO
    } else {
        LevelFilter::WARN
    };
    // RUST_LOG directives refine the configured level
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command.unwrap_or_default() {
        Command::Topics => {
            for topic in &cfg.topics {
                println!(
                    "{:<30} {:<30} {}",
                    topic.key(),
                    topic.subscription_name(),
                    topic.project
                );
            }
            Ok(())
        }
        Command::Run => run(cfg).await,
    }
}

async fn run(cfg: Config) -> Result<()> {
    let factory = backends::factory(cfg.backend, &cfg.endpoint);
    let registry = Registry::resolve(&cfg.topics, factory.as_ref())
        .await
        .context("setting up topics")?;
    info!(topics = registry.len(), "topics ready");

    let ingest = IngestOptions {
        pull_batch: cfg.pull_batch,
        ack: cfg.ack,
    };
    let ctx = Arc::new(Context::new(
        registry,
        cfg.max_messages,
        Hub::new(cfg.viewer_buffer),
        ingest,
    ));

    let listener =
        TcpListener::bind(&cfg.bind).with_context(|| format!("binding {}", cfg.bind))?;
    let shutdown = CancellationToken::new();
    let ingestor = Ingestor::start(ctx.clone(), shutdown.child_token());
    let mut server = tokio::spawn(api::serve(
        listener,
        AppState::new(ctx.clone()),
        shutdown.clone(),
    ));

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("shutting down");
        }
        res = &mut server => {
            shutdown.cancel();
            ingestor.shutdown().await;
            return match res {
                Ok(res) => res.context("http server stopped"),
                Err(err) => Err(err).context("http server task failed"),
            };
        }
    }
    shutdown.cancel();
    ingestor.shutdown().await;
    // end open SSE and websocket streams so the server can drain
    ctx.hub().disconnect_all();
    match server.await {
        Ok(Err(err)) => error!(error = %err, "http server failed"),
        Err(err) => error!(error = %err, "http server task panicked"),
        Ok(Ok(())) => {}
    }
    Ok(())
}
