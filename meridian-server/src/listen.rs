//! Invalidation long-poll loop.
//!
//! ```text
//! client                          server
//!   LISTEN_CACHES  ───────────▶   register listener
//!                  ◀───────────   id id … -1        (batch)
//!   LISTEN_ACK     ───────────▶
//!                  ◀───────────   -1                (keepalive, 1.44+)
//! ```
//!
//! The loop ends when the session's account is disabled or the peer goes
//! away; either way the connection is closed afterwards. Waiting for an
//! acknowledgement counts too: the account is rechecked every keepalive
//! period until the ack arrives, but no keepalive is written meanwhile.

use meridian_core::{status, WireField, WireReader, WireWriter, INVALIDATION_SENTINEL};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::auth::AccessControl;
use crate::broadcast::ListenerRegistry;
use crate::error::{ServerError, ServerResult};
use crate::session::{MailboxEvent, Session};

/// Why a long-poll loop returned normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenExit {
    AccountDisabled,
}

/// Run the long-poll loop for `session` until it must end.
pub async fn listen_for_invalidations<R, W>(
    registry: &Arc<ListenerRegistry>,
    access: &AccessControl,
    session: Arc<Session>,
    reader: &mut WireReader<R>,
    writer: &mut WireWriter<W>,
    keepalive: Duration,
) -> ServerResult<ListenExit>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let _guard = registry.register(Arc::clone(&session));
    tracing::info!(connector_id = %session.connector_id, "Listening for invalidations");

    loop {
        match session.mailbox().wait(keepalive).await {
            MailboxEvent::Batch(ids) => {
                writer.write_int_list(&ids, INVALIDATION_SENTINEL).await?;
                writer.flush().await?;
                if let Some(exit) = await_ack(access, &session, reader, keepalive).await? {
                    return Ok(exit);
                }
            }
            MailboxEvent::Recheck => {
                if account_disabled(access, &session).await {
                    return Ok(ListenExit::AccountDisabled);
                }
            }
            MailboxEvent::Timeout => {
                if account_disabled(access, &session).await {
                    return Ok(ListenExit::AccountDisabled);
                }
                if session.codec.includes(WireField::ListenKeepalive) {
                    writer.write_int_list(&[], INVALIDATION_SENTINEL).await?;
                    writer.flush().await?;
                }
            }
        }
    }
}

/// Wait for the batch acknowledgement. Each keepalive period without one
/// rechecks the account, so a silent client cannot outlive its account.
async fn await_ack<R: AsyncRead + Unpin>(
    access: &AccessControl,
    session: &Session,
    reader: &mut WireReader<R>,
    keepalive: Duration,
) -> ServerResult<Option<ListenExit>> {
    loop {
        match tokio::time::timeout(keepalive, reader.read_byte()).await {
            Ok(ack) => {
                let ack = ack?;
                if ack != status::LISTEN_ACK {
                    return Err(ServerError::malformed(format!(
                        "Expected invalidation acknowledgement, got {:#04x}",
                        ack
                    )));
                }
                return Ok(None);
            }
            Err(_) => {
                tracing::debug!(connector_id = %session.connector_id, "Still waiting for acknowledgement");
                if account_disabled(access, session).await {
                    return Ok(Some(ListenExit::AccountDisabled));
                }
            }
        }
    }
}

async fn account_disabled(access: &AccessControl, session: &Session) -> bool {
    let mut disabled = false;
    for user in [&session.authenticated_user, &session.effective_user] {
        match access.is_account_disabled(user).await {
            Ok(true) => {
                tracing::info!(connector_id = %session.connector_id, user = %user, "Account disabled, ending listen loop");
                disabled = true;
                break;
            }
            Ok(false) => {}
            Err(err) => {
                // Keep listening; the next wake-up checks again.
                tracing::warn!(connector_id = %session.connector_id, error = %err, "Account recheck failed");
            }
        }
    }
    disabled
}
