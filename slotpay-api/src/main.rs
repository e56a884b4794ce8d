use anyhow::Context;
use slotpay_api::{app, AppState, Backends};
use slotpay_core::events::{EventPublisher, NoopPublisher};
use slotpay_core::payment::{MockPaymentGateway, PaymentGateway};
use slotpay_core::repository::{PaymentStore, RateLimitStore, ReservationStore};
use slotpay_core::{Clock, SystemClock};
use slotpay_engine::{spawn_periodic, ExpirySweeper, ReconciliationTask};
use slotpay_store::app_config::Config;
use slotpay_store::{DbClient, HttpPaymentGateway, MemoryStore, PgStore, RedisClient};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "slotpay_api=debug,slotpay_engine=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting SlotPay API on port {}", config.server.port);

    let memory = Arc::new(MemoryStore::new());

    // Postgres Connection
    let (reservations, payments): (Arc<dyn ReservationStore>, Arc<dyn PaymentStore>) = match &config.database.url {
        Some(url) => {
            let db = DbClient::new(url, config.database.max_connections)
                .await
                .context("Failed to connect to Postgres")?;
            db.migrate().await.context("Failed to run migrations")?;
            let store = Arc::new(PgStore::new(&db));
            (store.clone() as Arc<dyn ReservationStore>, store as Arc<dyn PaymentStore>)
        }
        None => {
            tracing::warn!("No database configured, reservations and payments are kept in memory");
            (
                memory.clone() as Arc<dyn ReservationStore>,
                memory.clone() as Arc<dyn PaymentStore>,
            )
        }
    };

    // Redis Connection
    let rate_limits: Arc<dyn RateLimitStore> = match &config.redis.url {
        Some(url) => Arc::new(RedisClient::new(url).await.context("Failed to connect to Redis")?),
        None => memory.clone(),
    };

    let gateway: Arc<dyn PaymentGateway> = match &config.gateway.base_url {
        Some(base_url) => Arc::new(
            HttpPaymentGateway::new(
                config.gateway.name.clone(),
                base_url.clone(),
                config.gateway.api_key.clone(),
                Duration::from_secs(config.gateway.timeout_seconds),
            )
            .context("Failed to build gateway client")?,
        ),
        None => {
            tracing::warn!(gateway = %config.gateway.name, "No gateway endpoint configured, using the mock gateway");
            Arc::new(MockPaymentGateway::new(
                config.gateway.name.clone(),
                config.gateway.redirect_base_url.clone(),
            ))
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = AppState::new(
        Backends {
            reservations,
            payments,
            rate_limits,
            events: event_publisher(&config)?,
            gateway,
            clock: clock.clone(),
        },
        &config,
    );

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();
    if config.scheduler.enabled {
        tasks.push(spawn_periodic(
            Arc::new(ExpirySweeper::new(state.reservations.clone())),
            Duration::from_secs(config.scheduler.sweep_interval_seconds),
            clock.clone(),
            shutdown.clone(),
        ));
        tasks.push(spawn_periodic(
            Arc::new(ReconciliationTask::new(state.reconciler.clone())),
            Duration::from_secs(config.scheduler.reconcile_interval_seconds),
            clock.clone(),
            shutdown.clone(),
        ));
    }

    let app = app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!("Scheduled task did not stop cleanly: {}", e);
        }
    }
    Ok(())
}

#[cfg(feature = "kafka")]
fn event_publisher(config: &Config) -> anyhow::Result<Arc<dyn EventPublisher>> {
    match &config.kafka.brokers {
        Some(brokers) => {
            let producer = slotpay_store::EventProducer::new(brokers).context("Failed to create Kafka producer")?;
            Ok(Arc::new(producer))
        }
        None => Ok(Arc::new(NoopPublisher)),
    }
}

#[cfg(not(feature = "kafka"))]
fn event_publisher(config: &Config) -> anyhow::Result<Arc<dyn EventPublisher>> {
    if config.kafka.brokers.is_some() {
        tracing::warn!("kafka.brokers is set but this build has no Kafka support, events are dropped");
    }
    Ok(Arc::new(NoopPublisher))
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received, draining");
    shutdown.cancel();
}
