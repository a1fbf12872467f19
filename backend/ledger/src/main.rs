//! EcoMapa donation ledger: entry point.
//!
//! Serves the withdrawal, balance, donation and payment-webhook API over
//! SQLite, and runs a background sweeper that reconciles donations whose
//! webhooks never arrived.

mod api;
mod auth;
mod config;
mod db;
mod donations;
mod errors;
mod ledger;
mod models;
mod money;
mod notify;
mod pix;
mod providers;
mod reconciliation;
mod reputation;
mod sweeper;
mod withdrawals;

#[cfg(test)]
mod testutil;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use providers::{MercadoPagoClient, Providers, StripeClient};
use reconciliation::Reconciler;
use reputation::SqliteReputation;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    let pool = db::init_pool(&config.database_url).await?;

    // One client for both payment providers and the e-mail sender.
    let client = providers::http_client(config.http_timeout_secs)?;

    let providers = Providers::new()
        .with(Arc::new(StripeClient::new(
            client.clone(),
            &config.stripe,
            config.webhook_tolerance_secs,
        )))
        .with(Arc::new(MercadoPagoClient::new(
            client.clone(),
            &config.mercadopago,
        )));
    let notifier: Arc<dyn notify::Notifier> = Arc::from(notify::from_config(client, &config.email));

    let reconciler = Arc::new(Reconciler {
        pool: pool.clone(),
        providers: providers.clone(),
        reputation: Arc::new(SqliteReputation::new(pool.clone())),
        notifier: notifier.clone(),
        site_url: config.email.site_url.clone(),
    });

    // ─── Background sweeper ───────────────────────────────
    let shutdown = CancellationToken::new();
    let sweeper = if config.sweep_interval_secs > 0 {
        Some(tokio::spawn(sweeper::run(
            reconciler.clone(),
            sweeper::SweeperConfig {
                interval: Duration::from_secs(config.sweep_interval_secs),
                min_age_secs: config.sweep_min_age_secs,
            },
            shutdown.clone(),
        )))
    } else {
        info!("SWEEP_INTERVAL_SECS=0, pending-donation sweeper disabled");
        None
    };

    // ─── REST API ─────────────────────────────────────────
    let api_state = Arc::new(api::ApiState {
        pool,
        providers,
        notifier,
        reconciler,
        admin_email: config.email.admin_email.clone(),
        admin_api_key: config.admin_api_key.clone(),
    });
    let app = api::router(api_state);

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            token.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Some(handle) = sweeper {
        handle.await?;
    }
    Ok(())
}
