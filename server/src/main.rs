//! nerede — live location relay server.

use std::future::IntoFuture;
use std::process::ExitCode;
use std::sync::Arc;

use nerede::broker::{self, MqttPublisher};
use nerede::config::Config;
use nerede::hub::{Hub, Registry};
use nerede::ingest::Ingestor;
use nerede::routes::build_router;
use nerede::state::AppState;
use nerede::store::RedisStore;
use nerede::tasks::{first_exit, Supervised};
use nerede::timestamp::{KeyFormatter, SystemClock};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env if present (local dev).
    let _ = dotenvy::dotenv();

    let config = Config::from_env();
    init_tracing(&config);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(config: &Config) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(&config.log_level)
        .with_target(true);
    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!("nerede starting");
    info!(listen = %config.listen_addr, topic = %config.mqtt.topic);

    // ── Redis ───────────────────────────────────────────────
    let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
    info!("store ready");

    // ── Fan-out ─────────────────────────────────────────────
    let registry = Registry::new(config.write_timeout);
    let (hub, hub_task) = Hub::spawn(Arc::clone(&registry));

    // ── MQTT ────────────────────────────────────────────────
    let link = broker::connect(&config.mqtt).await?;
    let ingestor = Ingestor::new(
        store.clone(),
        hub,
        Arc::new(SystemClock),
        KeyFormatter::new(config.utc_offset),
    );
    let ingest_task = tokio::spawn(ingestor.run(link.payloads));

    let publisher = Arc::new(MqttPublisher::new(
        link.client,
        config.mqtt.topic.clone(),
        link.state,
    ));

    // ── Routes ──────────────────────────────────────────────
    let listen_addr = config.listen_addr.clone();
    let state = AppState::new(store, registry, publisher, config);
    let app = build_router(state);

    // ── Bind & serve ────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    info!(addr = %listen_addr, "nerede listening");

    let tasks = vec![
        Supervised::new("broadcast hub", hub_task),
        Supervised::new("ingest", ingest_task),
        Supervised::new("mqtt event loop", link.task),
    ];
    tokio::select! {
        served = axum::serve(listener, app).into_future() => served?,
        name = first_exit(tasks) => return Err(format!("{name} task stopped").into()),
    }
    Ok(())
}
