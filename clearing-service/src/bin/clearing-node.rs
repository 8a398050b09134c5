use actix_web::{web, App, HttpServer};
use anyhow::Context;
use clearing_service::{
    api::{self, AppState},
    ClearingConfig, ClearingConsumer, ClearingEngine, RoutingTable,
};
use ledger_core::{storage::Storage, types::Stage};
use message_bus::{JetStreamPublisher, NatsClient, Subscriber, Transport};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use transfer_saga::{telemetry, OutboxRelay};
use uuid::Uuid;

fn load_config() -> anyhow::Result<ClearingConfig> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CLEARING_CONFIG").ok());
    let config = match path {
        Some(path) => ClearingConfig::from_file(&path)
            .with_context(|| format!("loading {}", path))?
            .with_env_overrides(),
        None => ClearingConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    telemetry::init(&config.log);

    info!(
        participant = %config.participant,
        data_dir = %config.ledger.data_dir.display(),
        "Clearing node starting"
    );

    let storage = Arc::new(Storage::open(&config.ledger).context("opening clearing store")?);
    let routing = RoutingTable::new(storage.clone());
    let consumer = Arc::new(ClearingConsumer::new(ClearingEngine::new(storage.clone())));

    let nats = Arc::new(NatsClient::new(config.nats.clone()));
    nats.ensure_streams().await.context("creating JetStream streams")?;
    let publisher: Arc<dyn Transport> =
        Arc::new(JetStreamPublisher::new(nats.clone(), config.publisher.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    let relay = OutboxRelay::new(
        storage.clone(),
        publisher,
        config.relay.clone(),
        format!("{}-{}", config.participant, Uuid::new_v4()),
    );
    let rx = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move { relay.run(rx).await }));

    for stage in [Stage::Initiated, Stage::Processed] {
        let subscriber = Subscriber::new(
            nats.clone(),
            config.subscriber.clone(),
            &config.participant,
            stage,
            None,
        );
        let handler = consumer.clone();
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = subscriber.run(handler, rx).await {
                error!(stage = %stage, error = %e, "Subscriber stopped with error");
            }
        }));
    }

    let state = web::Data::new(AppState { storage, routing });
    let listen_addr = config.http.listen_addr.clone();
    info!(addr = %listen_addr, "HTTP server listening");

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(api::configure)
    })
    .bind(&listen_addr)
    .with_context(|| format!("binding {}", listen_addr))?
    .run()
    .await?;

    info!("Shutting down background tasks");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Background task panicked");
        }
    }
    info!("Clearing node stopped");
    Ok(())
}
