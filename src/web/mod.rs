//! Web server module

mod routes;

use anyhow::Result;
use axum::{
    routing::{delete, get, post},
    Router,
};
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::Config;
use crate::db::Database;

pub struct AppState {
    pub db: Database,
    pub config: Config,
}

pub async fn start_server(config: &Config, db: Database) -> Result<()> {
    let state = Arc::new(AppState {
        db,
        config: config.clone(),
    });

    let app = Router::new()
        // Storefront-facing endpoints; served cross-origin from shop domains
        .route("/api/check", get(routes::check_get).post(routes::check_post))
        .route("/api/beacon", post(routes::beacon))
        // Admin backend (authentication handled by the embedding admin app)
        .route(
            "/api/admin/rules",
            get(routes::list_rules).post(routes::create_rule),
        )
        .route(
            "/api/admin/rules/:id",
            axum::routing::patch(routes::update_rule).delete(routes::delete_rule),
        )
        .route("/api/admin/stats", get(routes::shop_stats))
        .route("/api/admin/recent", get(routes::recent_sessions))
        .route("/api/admin/shops/:shop", delete(routes::purge_shop))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.http_port);
    info!("Web server starting on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
