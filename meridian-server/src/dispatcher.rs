//! Command Dispatcher
//!
//! One loop per authenticated connection:
//!
//! 1. Read an opcode. End of stream or QUIT closes the connection silently.
//! 2. PING and TEST_CONNECTION answer SUCCESS at once; no ledger, no stats.
//! 3. LISTEN_CACHES hands the connection to the long-poll loop for good.
//! 4. Anything else is routed to its handler through the transactional
//!    executor. After commit the ledger is broadcast to other listeners and
//!    the reply is followed by the caller's own invalidation footer.
//!
//! Faults fail the current request only, unless they are fatal (framing
//! lost, peer gone), in which case the connection closes after the fault is
//! reported.
//!
//! An unknown opcode or table id leaves the rest of that request unreadable.
//! The dispatcher resynchronises by dropping every byte already buffered from
//! the peer, which includes any requests pipelined behind the rejected one.
//! Clients must wait for the fault before sending anything else.

use chrono::Utc;
use meridian_core::{status, Opcode, TableId, WireReader, WireWriter};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::Instrument;

use crate::error::{ServerError, ServerResult};
use crate::executor::Execution;
use crate::ledger::InvalidationLedger;
use crate::listen::listen_for_invalidations;
use crate::registry::{Arguments, OperationHandler};
use crate::response::{write_fault, write_footer, write_reply};
use crate::session::Session;
use crate::state::ServerState;
use crate::stats::HistoryEntry;
use crate::telemetry::metrics::with_metrics;

/// How a command loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// End of stream or QUIT.
    ClientClosed,
    /// The long-poll loop ended.
    ListenEnded,
}

pub struct Dispatcher<'a, R, W> {
    state: &'a ServerState,
    session: Arc<Session>,
    reader: &'a mut WireReader<R>,
    writer: &'a mut WireWriter<W>,
}

impl<'a, R, W> Dispatcher<'a, R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        state: &'a ServerState,
        session: Arc<Session>,
        reader: &'a mut WireReader<R>,
        writer: &'a mut WireWriter<W>,
    ) -> Self {
        Self {
            state,
            session,
            reader,
            writer,
        }
    }

    /// Serve requests until the connection should close.
    pub async fn run(mut self) -> ServerResult<LoopExit> {
        loop {
            let Some(raw) = self.reader.read_opcode().await? else {
                return Ok(LoopExit::ClientClosed);
            };
            let opcode = Opcode(raw);

            match opcode {
                Opcode::QUIT => return Ok(LoopExit::ClientClosed),
                Opcode::PING | Opcode::TEST_CONNECTION => {
                    self.writer.write_byte(status::SUCCESS).await?;
                    self.writer.flush().await?;
                    continue;
                }
                Opcode::LISTEN_CACHES => {
                    let exit = listen_for_invalidations(
                        &self.state.listeners,
                        &self.state.access,
                        Arc::clone(&self.session),
                        self.reader,
                        self.writer,
                        self.state.config.keepalive,
                    )
                    .await?;
                    tracing::info!(connector_id = %self.session.connector_id, ?exit, "Listen loop ended");
                    return Ok(LoopExit::ListenEnded);
                }
                _ => {}
            }

            if let Err(err) = self.dispatch(opcode).await {
                self.report(opcode, &err).await?;
                if err.fatal {
                    return Err(err);
                }
            }
        }
    }

    async fn report(&mut self, opcode: Opcode, err: &ServerError) -> ServerResult<()> {
        tracing::debug!(
            connector_id = %self.session.connector_id,
            opcode = %opcode,
            kind = %err.kind,
            fatal = err.fatal,
            error = %err.message,
            "Request failed"
        );
        let written = match write_fault(self.writer, &self.session.codec, err).await {
            Ok(()) => self.writer.flush().await,
            Err(write_err) => Err(write_err),
        };
        match written {
            Ok(()) => Ok(()),
            // The peer is already gone; the original fault says why.
            Err(_) if err.fatal => Ok(()),
            Err(write_err) => Err(write_err.into()),
        }
    }

    /// Resolve the route of a request and reject it without touching a
    /// datastore if nothing can serve it.
    async fn route(
        &mut self,
        opcode: Opcode,
    ) -> ServerResult<(Arc<dyn OperationHandler>, Option<TableId>)> {
        let table = if opcode.is_table_keyed() {
            let client_id = self.reader.read_compact_int().await?;
            match self
                .state
                .catalog
                .to_stable_table_id(client_id, &self.session)
                .await?
            {
                Some(table) => Some(table),
                None => {
                    self.reader.discard_buffered();
                    return Err(ServerError::unsupported_table(client_id));
                }
            }
        } else {
            None
        };

        match self.state.handlers.lookup(opcode, table) {
            Some(handler) => Ok((handler, table)),
            None => {
                self.reader.discard_buffered();
                Err(match table {
                    Some(table) => ServerError::unknown_opcode(format!("{} on {}", opcode, table)),
                    None => ServerError::unknown_opcode(opcode),
                })
            }
        }
    }

    async fn dispatch(&mut self, opcode: Opcode) -> ServerResult<()> {
        let (handler, table) = self.route(opcode).await?;
        let args = Arguments::read(self.reader, handler.arguments(), self.session.version).await?;

        let ticket = self.state.stats.begin();
        let start_time = Utc::now();
        let span = tracing::debug_span!(
            "request",
            connector_id = %self.session.connector_id,
            opcode = %opcode,
            command = handler.label()
        );
        let result = self
            .execute(handler.as_ref(), table, &args)
            .instrument(span)
            .await;

        self.state.history.push(HistoryEntry::for_session(
            &self.session,
            handler.label(),
            start_time,
            Utc::now(),
        ));
        let elapsed = ticket.elapsed();
        drop(ticket);
        with_metrics(|m| m.record_request(handler.label(), result.is_ok(), elapsed.as_secs_f64()));
        result
    }

    async fn execute(
        &mut self,
        handler: &dyn OperationHandler,
        table: Option<TableId>,
        args: &Arguments,
    ) -> ServerResult<()> {
        let execution = self
            .state
            .executor
            .execute(handler, &self.session, table, args, self.writer)
            .await?;
        self.complete(handler, execution).await
    }

    /// Publish a committed request and write its response.
    async fn complete(
        &mut self,
        handler: &dyn OperationHandler,
        execution: Execution,
    ) -> ServerResult<()> {
        if handler.invalidates() && !execution.ledger.is_empty() {
            self.state
                .listeners
                .broadcast(&execution.ledger, Some(self.session.connector_id))
                .await;
        }

        write_reply(self.writer, &execution.reply).await?;
        if handler.invalidates() {
            let footer = client_footer(self.state, &self.session, &execution.ledger).await;
            write_footer(self.writer, &footer).await?;
        }
        self.writer.flush().await?;
        Ok(())
    }
}

/// Every invalidated table the caller can see, without scope filtering.
async fn client_footer(
    state: &ServerState,
    session: &Session,
    ledger: &InvalidationLedger,
) -> Vec<i32> {
    let mut ids = Vec::with_capacity(ledger.len());
    for table in ledger.tables() {
        match state.catalog.to_client_table_id(table, session).await {
            Ok(Some(id)) => ids.push(id),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(
                    connector_id = %session.connector_id,
                    table = %table,
                    error = %err,
                    "Cannot resolve footer table id"
                );
            }
        }
    }
    ids
}
