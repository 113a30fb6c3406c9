//! Meridian Server - Request Dispatch and Cache Coherence
//!
//! Accepts authenticated client connections, runs each request through a
//! registered handler inside a transaction on both datastores, and keeps every
//! connected client's object cache consistent by broadcasting the tables each
//! committed request invalidated.

pub mod admin;
pub mod auth;
pub mod broadcast;
pub mod caches;
pub mod catalog;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod handshake;
pub mod http;
pub mod ledger;
pub mod listen;
pub mod registry;
pub mod response;
pub mod scheduling;
pub mod server;
pub mod session;
pub mod state;
pub mod stats;
pub mod telemetry;

// Re-export commonly used types
pub use auth::{
    hash_password, verify_password, AccessControl, AuthError, AuthResult, MasterScope, Principal,
};
pub use broadcast::{BroadcastReport, ListenerGuard, ListenerRegistry};
pub use caches::{AccountMemo, CachedView, InvalidationHook, ProcessCaches};
pub use catalog::TableCatalog;
pub use config::ServerConfig;
pub use dispatcher::{Dispatcher, LoopExit};
pub use error::{FaultKind, ServerError, ServerResult};
pub use executor::{Execution, TransactionalExecutor};
pub use handshake::{handshake, Peer};
pub use ledger::{InvalidationLedger, TableScope};
pub use listen::{listen_for_invalidations, ListenExit};
pub use registry::{
    ArgSpec, Arguments, HandlerRegistry, OperationContext, OperationHandler, Reply,
};
pub use scheduling::{current_class, LanePermit, SchedulingClass, SchedulingLanes};
pub use server::{serve_connection, spawn_connection, MeridianServer};
pub use session::{
    Clock, ConnectorIdAllocator, FixedClock, Mailbox, MailboxEvent, Session, SessionInit,
    SystemClock, TransportKind,
};
pub use state::ServerState;
pub use stats::{CommandHistory, HistoryEntry, RequestTicket, ServerStats, StatsSnapshot};
