mod clock;
mod config;
mod db;
mod engine;
mod error;
mod repo;
mod scheduler;
mod seating;
mod server;
mod session;

#[cfg(test)]
mod flow_tests;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::config::AppConfig;
use crate::db::Database;
use crate::engine::ReservationEngine;
use crate::repo::hours::HoursRepo;
use crate::repo::orders::OrdersRepo;
use crate::repo::tables::TablesRepo;
use crate::repo::users::UsersRepo;
use crate::seating::SeatingController;
use crate::server::registry::ClientRegistry;
use crate::session::SessionManager;

/// Shared application state available to all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub db: Database,
    pub sessions: SessionManager,
    pub registry: ClientRegistry,
    pub engine: ReservationEngine,
    pub seating: SeatingController,
    pub orders: OrdersRepo,
    pub tables: TablesRepo,
    pub users: UsersRepo,
    pub hours: HoursRepo,
}

impl AppState {
    pub fn new(config: AppConfig, db: Database) -> Self {
        let pool = db.pool.clone();
        Self {
            config,
            sessions: SessionManager::new(pool.clone()),
            registry: ClientRegistry::new(),
            engine: ReservationEngine::new(pool.clone()),
            seating: SeatingController::new(pool.clone()),
            orders: OrdersRepo::new(pool.clone()),
            tables: TablesRepo::new(pool.clone()),
            users: UsersRepo::new(pool.clone()),
            hours: HoursRepo::new(pool),
            db,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present (not required)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bistro_server=info".into()),
        )
        .init();

    info!("Starting Bistro server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::from_env()?;
    info!(port = config.listen_port, "Configuration loaded");

    // Initialize the database: open the pool, fail fast on bad credentials,
    // apply the schema.
    let db = Database::connect(
        &config.database_url,
        config.db_password.as_deref(),
        config.pool_capacity,
    )
    .await?;
    db.pool.test_open().await?;
    db.migrate().await?;
    info!("Database initialized");

    let state = Arc::new(AppState::new(config, db));

    // Clear login flags left behind by an unclean shutdown.
    let cleared = state.users.reset_all_login_flags().await?;
    if cleared > 0 {
        info!(cleared, "Cleared stale login flags");
    }

    // Background tasks: pool eviction and the order-maintenance timer.
    state.db.pool.spawn_evictor();
    scheduler::spawn(state.db.clone(), state.registry.clone());

    server::run(state).await
}
