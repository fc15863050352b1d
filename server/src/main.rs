use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tts_core::{AudioPlayer, CommandPlayer, HeadlessPlayer, SynthesisBackend};

use server::backend::{HttpSynthesisBackend, SilentBackend};
use server::source::{run_source, LineSource};
use server::{create_router, Relay, RelayConfig};

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _ = dotenv::dotenv();

    async_main().await
}

async fn async_main() -> anyhow::Result<()> {
    info!("Starting chat TTS relay...");

    let config = RelayConfig::from_env();
    info!(
        "Relay configuration loaded: port={}, batch={}x{} chars, delay={}ms",
        config.port, config.max_batch_size, config.max_batch_text_length, config.playback_delay_ms
    );

    let http_backend = match config.backend_url.as_deref() {
        Some(url) => {
            info!("Using synthesis backend at {}", url);
            Some(Arc::new(HttpSynthesisBackend::new(
                url,
                config.api_key.clone(),
                config
                    .request_timeout()
                    .max(Duration::from_secs(config.waiting_for_cache_timeout_secs)),
            )?))
        }
        None => None,
    };
    let backend: Arc<dyn SynthesisBackend> = match &http_backend {
        Some(http) => Arc::clone(http) as Arc<dyn SynthesisBackend>,
        None => {
            warn!("TTS_BACKEND_URL not set, rendering silence");
            Arc::new(SilentBackend::default())
        }
    };

    let player: Arc<dyn AudioPlayer> = match config.player_command.as_deref() {
        Some(template) => {
            info!("Playing audio with `{}`", template);
            Arc::new(CommandPlayer::new(template)?)
        }
        None => {
            warn!("PLAYER_COMMAND not set, playback is simulated");
            Arc::new(HeadlessPlayer::new())
        }
    };

    let mut relay = Relay::start(config.clone(), backend, player).await?;
    let shutdown = relay.shutdown_token();

    if let Some(http) = http_backend {
        relay.track(http.spawn_health_monitor(HEALTH_CHECK_INTERVAL, shutdown.clone()));
    }
    relay.track(tokio::spawn(run_source(
        Box::new(LineSource::stdin()?),
        relay.ingest(),
        shutdown.clone(),
    )));

    let app = create_router(relay.app_state());
    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        anyhow::anyhow!("Failed to bind {addr}: {e}. Try a different PORT.")
    })?;

    info!("Relay listening on http://{addr}");
    let serve_shutdown = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
                _ = serve_shutdown.cancelled() => {}
            }
        })
        .await;

    relay.shutdown().await;
    served?;
    Ok(())
}
