use actix_web::{web, App, HttpServer};
use anyhow::Context;
use ledger_core::{types::Stage, Ledger};
use message_bus::{JetStreamPublisher, NatsClient, PartitionKey, Subscriber, Transport};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use transfer_saga::{
    api::{self, AppState},
    telemetry, BankConfig, BankConsumer, DestinationSaga, OriginSaga, OutboxRelay,
    ReservationSweeper,
};
use uuid::Uuid;

fn load_config() -> anyhow::Result<BankConfig> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("BANK_CONFIG").ok());
    let config = match path {
        Some(path) => BankConfig::from_file(&path)
            .with_context(|| format!("loading {}", path))?
            .with_env_overrides()?,
        None => BankConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    telemetry::init(&config.log);

    info!(
        institution = %config.institution_id,
        participant = %config.participant,
        data_dir = %config.ledger.data_dir.display(),
        "Bank node starting"
    );

    let ledger = Ledger::open(&config.ledger).context("opening ledger")?;
    let storage = ledger.storage().clone();
    let institution = config.institution();
    let origin = OriginSaga::new(storage.clone(), institution.clone());
    let destination = DestinationSaga::new(storage.clone(), institution.clone());
    let consumer = Arc::new(BankConsumer::new(origin.clone(), destination));

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

    if let Some(ttl) = config.expiry.reservation_ttl() {
        let sweeper = ReservationSweeper::new(storage.clone(), ttl, config.expiry.sweep_interval());
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { sweeper.run(rx).await }));
    }

    let key = PartitionKey::Institution(institution);
    for stage in [Stage::Forwarded, Stage::Completed] {
        let subscriber = Subscriber::new(
            nats.clone(),
            config.subscriber.clone(),
            &config.participant,
            stage,
            Some(key.clone()),
        );
        let handler = consumer.clone();
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = subscriber.run(handler, rx).await {
                error!(stage = %stage, error = %e, "Subscriber stopped with error");
            }
        }));
    }

    let state = web::Data::new(AppState { ledger, origin });
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
    info!("Bank node stopped");
    Ok(())
}
