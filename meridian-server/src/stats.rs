//! Request counters and the command history ring.

use meridian_core::{ConnectorId, ProtocolVersion, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::session::Session;
use crate::telemetry::metrics::with_metrics;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("Stats lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

// ============================================================================
// COUNTERS
// ============================================================================

#[derive(Debug, Default)]
struct Counters {
    concurrency: u64,
    peak_concurrency: u64,
    total_requests: u64,
    total_time: Duration,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub concurrency: u64,
    pub peak_concurrency: u64,
    pub total_requests: u64,
    pub total_time: Duration,
}

/// Process-wide request counters behind one mutex.
#[derive(Debug, Default)]
pub struct ServerStats {
    counters: Mutex<Counters>,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request as started. Dropping the ticket finishes it.
    pub fn begin(self: &Arc<Self>) -> RequestTicket {
        {
            let mut counters = lock(&self.counters);
            counters.concurrency += 1;
            counters.total_requests += 1;
            counters.peak_concurrency = counters.peak_concurrency.max(counters.concurrency);
        }
        with_metrics(|m| m.active_requests.inc());
        RequestTicket {
            stats: Arc::clone(self),
            started: Instant::now(),
        }
    }

    fn finish(&self, elapsed: Duration) {
        let mut counters = lock(&self.counters);
        counters.concurrency = counters.concurrency.saturating_sub(1);
        counters.total_time += elapsed;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let counters = lock(&self.counters);
        StatsSnapshot {
            concurrency: counters.concurrency,
            peak_concurrency: counters.peak_concurrency,
            total_requests: counters.total_requests,
            total_time: counters.total_time,
        }
    }
}

/// A request in flight.
#[derive(Debug)]
pub struct RequestTicket {
    stats: Arc<ServerStats>,
    started: Instant,
}

impl RequestTicket {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for RequestTicket {
    fn drop(&mut self) {
        self.stats.finish(self.started.elapsed());
        with_metrics(|m| m.active_requests.dec());
    }
}

// ============================================================================
// HISTORY
// ============================================================================

/// One completed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub process_id: u32,
    pub connector_id: ConnectorId,
    pub authenticated_user: UserId,
    pub effective_user: UserId,
    pub host: String,
    pub protocol: ProtocolVersion,
    pub secure: bool,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub command: String,
}

impl HistoryEntry {
    pub fn for_session(
        session: &Session,
        command: impl Into<String>,
        start_time: Timestamp,
        end_time: Timestamp,
    ) -> Self {
        Self {
            process_id: std::process::id(),
            connector_id: session.connector_id,
            authenticated_user: session.authenticated_user.clone(),
            effective_user: session.effective_user.clone(),
            host: session.remote_host.clone(),
            protocol: session.version,
            secure: session.secure,
            start_time,
            end_time,
            command: command.into(),
        }
    }
}

/// Fixed-size ring of the most recent commands. The oldest entry is
/// overwritten when full.
#[derive(Debug)]
pub struct CommandHistory {
    capacity: usize,
    entries: Mutex<VecDeque<HistoryEntry>>,
}

impl CommandHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, entry: HistoryEntry) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = lock(&self.entries);
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Entries oldest first.
    pub fn entries(&self) -> Vec<HistoryEntry> {
        lock(&self.entries).iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
