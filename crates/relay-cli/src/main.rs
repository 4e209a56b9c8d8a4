use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relay_adapters::{CanvasSource, CanvasSourceConfig};
use relay_core::WatermarkState;
use relay_storage::{HttpClientConfig, HttpFetcher, StateStore};
use relay_sync::{
    interval_ticker, run_until, CycleOptions, DiscordSink, DiscordSinkConfig, Relay, RelayConfig,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "relay-cli")]
#[command(about = "Relays course announcements into a chat channel")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll on the configured interval (default).
    Run,
    /// Post the newest announcements once without touching the watermark.
    Replay {
        #[arg(long)]
        count: usize,
    },
    /// Print the persisted watermark.
    State {
        #[arg(long, env = "STATE_PATH")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let config = RelayConfig::from_env().context("loading configuration")?;
            run(config).await?;
        }
        Commands::Replay { count } => {
            let config = RelayConfig::from_env().context("loading configuration")?;
            let relay = build_relay(&config).await?;
            let delivered = relay.replay(count).await.context("replay failed")?;
            println!("replay complete: delivered={delivered}");
        }
        Commands::State { path } => {
            let state = StateStore::at_path(&path)
                .load()
                .await
                .with_context(|| format!("reading {}", path.display()))?
                .unwrap_or_default();
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
    }

    Ok(())
}

async fn run(config: RelayConfig) -> Result<()> {
    let relay = build_relay(&config).await?;

    if let Some(count) = config.replay_count {
        let delivered = relay.replay(count).await.context("replay failed")?;
        info!(delivered, "one-shot replay finished; exiting");
        return Ok(());
    }

    if let Some(port) = config.health_port {
        let status = relay.status();
        tokio::spawn(async move {
            if let Err(err) = relay_web::serve(port, status, shutdown_signal()).await {
                error!(error = %err, "health endpoint stopped");
            }
        });
    }

    let (mut scheduler, ticker) = interval_ticker(config.poll_interval).await?;
    info!(interval_secs = config.poll_interval.as_secs(), "poll schedule started");

    // errors are logged inside the cycle; the schedule retries on the next tick
    let _ = relay.poll_once().await;
    run_until(&relay, ticker, shutdown_signal()).await;

    scheduler.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

/// Boot phase: initial state, source client, then chat login and channel resolution.
async fn build_relay(config: &RelayConfig) -> Result<Relay> {
    let store = config
        .state_path
        .clone()
        .map(StateStore::at_path)
        .unwrap_or_default();
    let state = store.load_or(WatermarkState::seeded(config.start_from)).await;
    info!(
        durable = store.is_durable(),
        watermark = ?state.last_timestamp,
        seen = state.seen_count(),
        "relay state loaded"
    );

    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })?;

    let source = CanvasSource::new(
        http.clone(),
        CanvasSourceConfig {
            base_url: config.canvas_base_url.clone(),
            token: config.canvas_token.clone(),
            course_id: config.canvas_course_id.clone(),
        },
    );

    let sink = DiscordSink::connect(
        http.client().clone(),
        DiscordSinkConfig {
            api_base: config.discord_api_base.clone(),
            token: config.discord_token.clone(),
            channel_id: config.discord_channel_id.clone(),
        },
    )
    .await
    .context("connecting to the chat channel")?;

    Ok(Relay::new(
        Box::new(source),
        Box::new(sink),
        store,
        state,
        CycleOptions {
            page_size: config.page_size,
            ..CycleOptions::default()
        },
    ))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
