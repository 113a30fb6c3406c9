//! Meridian Server Entry Point
//!
//! Loads configuration from the environment, connects both datastore pools
//! and the account directory, and serves until interrupted. Startup aborts
//! if the credentials store or either datastore cannot be reached.

use std::sync::Arc;

use meridian_server::telemetry::{init_logging, LoggingConfig};
use meridian_server::{HandlerRegistry, MeridianServer, ServerConfig, ServerResult, ServerState};
use meridian_storage::{DbConfig, PgDatastore, PgDirectory, StoreRole};

#[tokio::main]
async fn main() -> ServerResult<()> {
    init_logging(&LoggingConfig::from_env())?;

    let config = ServerConfig::from_env()?;
    let primary_config = DbConfig::primary_from_env();
    let secondary_config = DbConfig::secondary_from_env();

    let primary_pool = primary_config.create_pool()?;
    let secondary_pool = secondary_config.create_pool()?;

    let directory = Arc::new(PgDirectory::new(primary_pool.clone()));
    let primary = Arc::new(PgDatastore::new(StoreRole::Primary, primary_pool));
    let secondary = Arc::new(PgDatastore::new(StoreRole::Secondary, secondary_pool));

    // Domain handlers are registered by the deployment; the core ships the
    // introspection operations only.
    let handlers = HandlerRegistry::new();

    let state = Arc::new(ServerState::new(config, directory, primary, secondary, handlers)?);
    state.preflight().await?;
    tracing::info!(
        bind = %state.config.bind,
        handlers = state.handlers.len(),
        "Starting Meridian server"
    );

    MeridianServer::new(state).run().await
}
