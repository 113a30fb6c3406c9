//! Administrative introspection operations.

use async_trait::async_trait;
use meridian_core::{Opcode, WireField, WireValue};
use std::sync::Arc;

use crate::error::ServerResult;
use crate::registry::{Arguments, HandlerRegistry, OperationContext, OperationHandler, Reply};
use crate::stats::{CommandHistory, HistoryEntry, ServerStats};

/// Register the introspection handlers.
pub fn register(
    registry: &mut HandlerRegistry,
    stats: Arc<ServerStats>,
    history: Arc<CommandHistory>,
) -> ServerResult<()> {
    registry.register(Opcode::GET_SERVER_STATS, Arc::new(GetServerStats { stats }))?;
    registry.register(Opcode::GET_COMMAND_HISTORY, Arc::new(GetCommandHistory { history }))?;
    Ok(())
}

fn to_long(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Concurrency, peak concurrency, total requests and (1.62+) total time in
/// milliseconds.
pub struct GetServerStats {
    stats: Arc<ServerStats>,
}

#[async_trait]
impl OperationHandler for GetServerStats {
    fn label(&self) -> &str {
        "get_server_stats"
    }

    fn invalidates(&self) -> bool {
        false
    }

    async fn execute(
        &self,
        ctx: &mut OperationContext<'_>,
        _args: &Arguments,
    ) -> ServerResult<Reply> {
        ctx.require_master().await?;
        let snapshot = self.stats.snapshot();
        let mut values = vec![
            WireValue::Long(to_long(snapshot.concurrency)),
            WireValue::Long(to_long(snapshot.peak_concurrency)),
            WireValue::Long(to_long(snapshot.total_requests)),
        ];
        if ctx.session.codec.includes(WireField::StatsTotalTime) {
            let millis = u64::try_from(snapshot.total_time.as_millis()).unwrap_or(u64::MAX);
            values.push(WireValue::Long(to_long(millis)));
        }
        Ok(Reply::Values(values))
    }
}

/// The history ring, oldest first, limited to entries whose users the
/// requester may see.
pub struct GetCommandHistory {
    history: Arc<CommandHistory>,
}

impl GetCommandHistory {
    fn row(entry: &HistoryEntry, ctx: &OperationContext<'_>) -> Vec<WireValue> {
        let codec = &ctx.session.codec;
        let mut row = vec![
            WireValue::Int(i32::try_from(entry.process_id).unwrap_or(i32::MAX)),
            WireValue::Long(entry.connector_id.0),
            WireValue::Str(entry.authenticated_user.to_string()),
        ];
        if codec.includes(WireField::HistoryEffectiveUser) {
            row.push(WireValue::Str(entry.effective_user.to_string()));
        }
        row.push(WireValue::Str(entry.host.clone()));
        row.push(WireValue::Str(entry.protocol.to_string()));
        if codec.includes(WireField::HistorySecureFlag) {
            row.push(WireValue::Bool(entry.secure));
        }
        row.push(WireValue::Long(entry.start_time.timestamp_millis()));
        row.push(WireValue::Long(entry.end_time.timestamp_millis()));
        row.push(WireValue::Str(entry.command.clone()));
        row
    }
}

#[async_trait]
impl OperationHandler for GetCommandHistory {
    fn label(&self) -> &str {
        "get_command_history"
    }

    fn invalidates(&self) -> bool {
        false
    }

    async fn execute(
        &self,
        ctx: &mut OperationContext<'_>,
        _args: &Arguments,
    ) -> ServerResult<Reply> {
        let requester = ctx.principal().await?.clone();
        let mut rows = Vec::new();
        for entry in self.history.entries() {
            let visible = ctx
                .access
                .can_see_user(&requester, &entry.authenticated_user)
                .await?
                && ctx
                    .access
                    .can_see_user(&requester, &entry.effective_user)
                    .await?;
            if visible {
                rows.push(Self::row(&entry, ctx));
            }
        }
        Ok(Reply::Rows(rows))
    }
}
