//! Cadenza release delivery service.
//!
//! Loads configuration, connects to Postgres, registers the configured
//! partners and runs the retry sweeper and webhook dispatch until a shutdown
//! signal arrives.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use cadenza::{Backends, Config, LogFormat, Service};
use cadenza_core::{storage::Storage, time::RealClock};
use cadenza_delivery::{PostgresCatalog, PostgresDeliveryStorage};
use cadenza_webhooks::PostgresWebhookStorage;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config)?;

    info!(
        database_url = %config.database.url_masked(),
        partners = config.partners.len(),
        concurrency = config.delivery.concurrency,
        "configuration loaded"
    );

    let pool = create_database_pool(&config).await?;
    sqlx::migrate!("./migrations").run(&pool).await.context("failed to run database migrations")?;
    info!("database migrations completed");

    let storage = Arc::new(Storage::new(pool.clone()));
    register_partners(&config, &storage).await?;

    let service = Service::build(
        &config,
        Backends {
            catalog: Arc::new(PostgresCatalog::new(storage.clone())),
            delivery_storage: Arc::new(PostgresDeliveryStorage::new(storage.clone())),
            webhook_storage: Arc::new(PostgresWebhookStorage::new(storage)),
            clock: Arc::new(RealClock::new()),
        },
    )?;

    let token = service.cancellation_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        token.cancel();
    });

    service.run().await;

    pool.close().await;
    info!("cadenza shutdown complete");
    Ok(())
}

fn init_tracing(config: &Config) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.filter))
        .context("invalid log filter")?;
    let registry = tracing_subscriber::registry().with(filter);

    match config.logging.format {
        LogFormat::Json => {
            let layer = fmt::layer().json().with_current_span(true).with_span_list(false);
            registry.with(layer).try_init()
        },
        LogFormat::Text => {
            registry.with(fmt::layer().with_target(true).with_line_number(true)).try_init()
        },
    }
    .context("failed to install tracing subscriber")
}

async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let database = &config.database;
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(database.max_connections)
            .min_connections(database.min_connections)
            .acquire_timeout(Duration::from_secs(database.acquire_timeout_seconds))
            .idle_timeout(Duration::from_secs(database.idle_timeout_seconds))
            .max_lifetime(Duration::from_secs(database.max_lifetime_seconds))
            .connect(&database.url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("failed to verify database connection")?;
                info!("database connection pool established");
                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Upserts the configured partners into the catalog.
async fn register_partners(config: &Config, storage: &Storage) -> Result<()> {
    let now = Utc::now();
    for partner in &config.partners {
        storage
            .partners
            .upsert(&partner.to_partner(now))
            .await
            .with_context(|| format!("failed to register partner {}", partner.id))?;
        info!(partner_id = %partner.id, priority = partner.priority, "partner registered");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c"),
        () = terminate => info!("received SIGTERM"),
    }
}
