//! Shared server state.

use meridian_storage::{AccountDirectory, Datastore};
use std::sync::Arc;
use std::time::Instant;

use crate::admin;
use crate::auth::AccessControl;
use crate::broadcast::ListenerRegistry;
use crate::caches::{InvalidationHook, ProcessCaches};
use crate::catalog::TableCatalog;
use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::executor::TransactionalExecutor;
use crate::registry::HandlerRegistry;
use crate::scheduling::SchedulingLanes;
use crate::session::{Clock, ConnectorIdAllocator};
use crate::stats::{CommandHistory, ServerStats};

/// Everything every connection task shares.
pub struct ServerState {
    pub config: ServerConfig,
    pub caches: Arc<ProcessCaches>,
    pub access: AccessControl,
    pub catalog: TableCatalog,
    pub listeners: Arc<ListenerRegistry>,
    pub handlers: HandlerRegistry,
    pub executor: TransactionalExecutor,
    pub stats: Arc<ServerStats>,
    pub history: Arc<CommandHistory>,
    pub connector_ids: ConnectorIdAllocator,
    pub start_time: Instant,
}

impl ServerState {
    /// Wire the shared services together. The administrative introspection
    /// handlers are registered into `handlers` here.
    pub fn new(
        config: ServerConfig,
        directory: Arc<dyn AccountDirectory>,
        primary: Arc<dyn Datastore>,
        secondary: Arc<dyn Datastore>,
        mut handlers: HandlerRegistry,
    ) -> ServerResult<Self> {
        let caches = Arc::new(ProcessCaches::new(directory));
        let access = AccessControl::new(Arc::clone(&caches));
        let catalog = TableCatalog::new(access.clone());
        let listeners = Arc::new(
            ListenerRegistry::new(access.clone(), catalog.clone())
                .with_hook(Arc::clone(&caches) as Arc<dyn InvalidationHook>),
        );
        let lanes = SchedulingLanes::new(config.background_permits);
        let executor = TransactionalExecutor::new(
            primary,
            secondary,
            access.clone(),
            catalog.clone(),
            lanes,
        );
        let stats = Arc::new(ServerStats::new());
        let history = Arc::new(CommandHistory::new(config.history_capacity));
        admin::register(&mut handlers, Arc::clone(&stats), Arc::clone(&history))?;

        Ok(Self {
            config,
            caches,
            access,
            catalog,
            listeners,
            handlers,
            executor,
            stats,
            history,
            connector_ids: ConnectorIdAllocator::system(),
            start_time: Instant::now(),
        })
    }

    /// Allocate connector ids from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.connector_ids = ConnectorIdAllocator::new(clock);
        self
    }

    /// Fail fast when the credentials store or a datastore is unreachable.
    /// Pools connect lazily, so without this the first login would be the
    /// first to notice.
    pub async fn preflight(&self) -> ServerResult<()> {
        let masters = self.caches.master_users().await?;
        self.caches.master_hosts().await?;
        self.caches.switch_grants().await?;
        self.executor.check_stores().await?;
        tracing::info!(master_users = masters.len(), "Startup checks passed");
        Ok(())
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
