//! Connection sessions, connector ids and the invalidation mailbox.

use chrono::Utc;
use meridian_core::{CodecTable, ConnectorId, ProtocolVersion, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

// ============================================================================
// CLOCK ABSTRACTION
// ============================================================================

/// Wall-clock source for connector ids.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;
}

/// Production clock using system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock frozen at one instant, for deterministic tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn now_millis(&self) -> i64 {
        self.0
    }
}

// ============================================================================
// CONNECTOR IDS
// ============================================================================

/// Allocates process-unique, strictly increasing connector ids.
///
/// Ids are wall-clock milliseconds, bumped past the previous id whenever the
/// clock has not advanced (or has gone backwards).
pub struct ConnectorIdAllocator {
    clock: Arc<dyn Clock>,
    last: AtomicI64,
}

impl ConnectorIdAllocator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            last: AtomicI64::new(i64::MIN),
        }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    pub fn next(&self) -> ConnectorId {
        let now = self.clock.now_millis();
        let mut current = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = if current == i64::MIN {
                now
            } else {
                now.max(current.saturating_add(1))
            };
            match self
                .last
                .compare_exchange(current, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return ConnectorId(candidate),
                Err(actual) => current = actual,
            }
        }
    }
}

impl fmt::Debug for ConnectorIdAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorIdAllocator")
            .field("last", &self.last.load(Ordering::SeqCst))
            .finish()
    }
}

// ============================================================================
// MAILBOX
// ============================================================================

/// What woke a long-polling session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailboxEvent {
    /// Client table ids to deliver, ascending.
    Batch(Vec<i32>),
    /// Account-related tables changed; the session must recheck its account.
    Recheck,
    /// Nothing arrived before the deadline.
    Timeout,
}

#[derive(Debug, Default)]
struct MailboxSlot {
    batch: Option<BTreeSet<i32>>,
    recheck: bool,
}

/// Holds at most one pending invalidation batch.
///
/// Deliveries that arrive before the session collects the batch are merged
/// into it. Delivery never blocks on the receiving session.
#[derive(Debug, Default)]
pub struct Mailbox {
    slot: Mutex<MailboxSlot>,
    notify: Notify,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `ids` into the pending batch and wake the session.
    ///
    /// Returns false, without waking anyone, when `ids` is empty.
    pub fn deliver(&self, ids: impl IntoIterator<Item = i32>) -> bool {
        let mut ids = ids.into_iter().peekable();
        if ids.peek().is_none() {
            return false;
        }
        match self.slot.lock() {
            Ok(mut slot) => slot.batch.get_or_insert_with(BTreeSet::new).extend(ids),
            Err(poisoned) => poisoned
                .into_inner()
                .batch
                .get_or_insert_with(BTreeSet::new)
                .extend(ids),
        }
        self.notify.notify_one();
        true
    }

    /// Ask the session to recheck its account state.
    pub fn interrupt(&self) {
        match self.slot.lock() {
            Ok(mut slot) => slot.recheck = true,
            Err(poisoned) => poisoned.into_inner().recheck = true,
        }
        self.notify.notify_one();
    }

    /// Take whatever is pending without waiting.
    pub fn try_take(&self) -> Option<MailboxEvent> {
        let mut slot = match self.slot.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(batch) = slot.batch.take() {
            return Some(MailboxEvent::Batch(batch.into_iter().collect()));
        }
        if std::mem::take(&mut slot.recheck) {
            return Some(MailboxEvent::Recheck);
        }
        None
    }

    /// Wait up to `timeout` for a batch or a recheck request.
    pub async fn wait(&self, timeout: Duration) -> MailboxEvent {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.try_take() {
                return event;
            }
            // notify_one stores a permit when nobody is waiting, so a delivery
            // between try_take and here is not lost.
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.try_take().unwrap_or(MailboxEvent::Timeout);
            }
        }
    }

    pub fn has_pending(&self) -> bool {
        match self.slot.lock() {
            Ok(slot) => slot.batch.is_some() || slot.recheck,
            Err(poisoned) => {
                let slot = poisoned.into_inner();
                slot.batch.is_some() || slot.recheck
            }
        }
    }
}

// ============================================================================
// SESSION
// ============================================================================

/// How the client reached the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Tcp,
    Unix,
    /// In-process stream (tests, embedded use).
    Memory,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Unix => "unix",
            TransportKind::Memory => "memory",
        }
    }
}

/// An authenticated connection.
#[derive(Debug)]
pub struct Session {
    pub connector_id: ConnectorId,
    /// Whose credentials were checked.
    pub authenticated_user: UserId,
    /// Whose authority requests run under.
    pub effective_user: UserId,
    pub remote_host: String,
    pub version: ProtocolVersion,
    pub codec: CodecTable,
    pub transport: TransportKind,
    pub secure: bool,
    pub client_label: String,
    pub connected_at: Timestamp,
    mailbox: Mailbox,
}

/// Everything known about a connection once its handshake succeeds.
#[derive(Debug, Clone)]
pub struct SessionInit {
    pub connector_id: ConnectorId,
    pub authenticated_user: UserId,
    pub effective_user: UserId,
    pub remote_host: String,
    pub version: ProtocolVersion,
    pub transport: TransportKind,
    pub secure: bool,
    pub client_label: String,
}

impl Session {
    pub fn new(init: SessionInit) -> Self {
        Self {
            connector_id: init.connector_id,
            authenticated_user: init.authenticated_user,
            effective_user: init.effective_user,
            remote_host: init.remote_host,
            codec: CodecTable::for_version(init.version),
            version: init.version,
            transport: init.transport,
            secure: init.secure,
            client_label: init.client_label,
            connected_at: Utc::now(),
            mailbox: Mailbox::new(),
        }
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Whether the session acts on behalf of another user.
    pub fn is_switched(&self) -> bool {
        self.authenticated_user != self.effective_user
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SteppingClock(AtomicI64);

    impl Clock for SteppingClock {
        fn now_millis(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn session(user: &str) -> Session {
        Session::new(SessionInit {
            connector_id: ConnectorId(1),
            authenticated_user: UserId::from(user),
            effective_user: UserId::from(user),
            remote_host: "127.0.0.1".to_string(),
            version: ProtocolVersion::CURRENT,
            transport: TransportKind::Memory,
            secure: false,
            client_label: String::new(),
        })
    }

    #[test]
    fn test_connector_ids_increase_on_frozen_clock() {
        let allocator = ConnectorIdAllocator::new(Arc::new(FixedClock(1_000)));
        let a = allocator.next();
        let b = allocator.next();
        let c = allocator.next();
        assert_eq!(a, ConnectorId(1_000));
        assert!(a < b && b < c);
    }

    #[test]
    fn test_connector_ids_survive_clock_going_backwards() {
        let clock = Arc::new(SteppingClock(AtomicI64::new(5_000)));
        let allocator = ConnectorIdAllocator::new(clock.clone());
        let first = allocator.next();
        clock.0.store(4_000, Ordering::SeqCst);
        let second = allocator.next();
        assert_eq!(second, ConnectorId(5_001));
        clock.0.store(9_000, Ordering::SeqCst);
        assert_eq!(allocator.next(), ConnectorId(9_000));
        assert!(first < second);
    }

    #[test]
    fn test_connector_ids_unique_across_threads() {
        let allocator = Arc::new(ConnectorIdAllocator::new(Arc::new(FixedClock(0))));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                std::thread::spawn(move || (0..250).map(|_| allocator.next()).collect::<Vec<_>>())
            })
            .collect();
        let mut all = BTreeSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all.insert(id));
            }
        }
        assert_eq!(all.len(), 1_000);
    }

    #[test]
    fn test_mailbox_coalesces() {
        let mailbox = Mailbox::new();
        assert!(mailbox.deliver([7, 3]));
        assert!(mailbox.deliver([3, 12]));
        assert!(!mailbox.deliver(Vec::new()));
        assert_eq!(mailbox.try_take(), Some(MailboxEvent::Batch(vec![3, 7, 12])));
        assert_eq!(mailbox.try_take(), None);
    }

    #[tokio::test]
    async fn test_mailbox_wait_times_out() {
        let mailbox = Mailbox::new();
        let event = mailbox.wait(Duration::from_millis(20)).await;
        assert_eq!(event, MailboxEvent::Timeout);
    }

    #[tokio::test]
    async fn test_mailbox_wakes_waiter() {
        let session = Arc::new(session("alice"));
        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.mailbox().wait(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.mailbox().deliver([4]);
        assert_eq!(waiter.await.unwrap(), MailboxEvent::Batch(vec![4]));
    }

    #[tokio::test]
    async fn test_delivery_before_wait_is_kept() {
        let mailbox = Mailbox::new();
        mailbox.deliver([1]);
        assert_eq!(
            mailbox.wait(Duration::from_millis(10)).await,
            MailboxEvent::Batch(vec![1])
        );
    }

    #[tokio::test]
    async fn test_interrupt_requests_recheck() {
        let mailbox = Mailbox::new();
        mailbox.interrupt();
        assert_eq!(
            mailbox.wait(Duration::from_millis(10)).await,
            MailboxEvent::Recheck
        );
        assert!(!mailbox.has_pending());
    }

    #[test]
    fn test_switched_session() {
        let mut s = session("alice");
        assert!(!s.is_switched());
        s.effective_user = UserId::from("bob");
        assert!(s.is_switched());
    }
}
