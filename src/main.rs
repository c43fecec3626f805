//! Storegate - storefront access control with visit analytics
//!
//! Decides, per incoming request, whether a visitor may reach a merchant's
//! storefront based on country, IP address, and bot identity, and records
//! visit telemetry for reporting:
//! - Whitelist/blacklist rules per shop (bot / IP / country)
//! - Session-merged visit analytics
//! - Fail-open decision pipeline

mod analytics;
mod bots;
mod config;
mod db;
mod decision;
mod rules;
mod signals;
mod web;

use anyhow::Result;
use tracing::{info, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    // Initialize logging based on LOG_FORMAT env var
    // Use LOG_FORMAT=gcp for structured GCP Cloud Logging
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(tracing_subscriber::filter::LevelFilter::INFO)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .init();
    }

    info!("Starting Storegate...");

    // Load configuration
    let config = config::Config::load()?;
    info!("Configuration loaded ({} mode)", config.access.environment);

    // Initialize database
    let db = db::Database::new(&config.database).await?;
    db.run_migrations().await?;
    info!("Database initialized");

    // Start web server (blocking)
    web::start_server(&config, db).await?;

    Ok(())
}
