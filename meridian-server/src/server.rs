//! Listeners and per-connection tasks.

use meridian_core::{WireReader, WireWriter};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::Instrument;

use crate::dispatcher::{Dispatcher, LoopExit};
use crate::error::{FaultKind, ServerError, ServerResult};
use crate::handshake::{handshake, Peer};
use crate::http::serve_admin;
use crate::session::TransportKind;
use crate::state::ServerState;
use crate::telemetry::metrics::with_metrics;

struct ConnectionGauge;

impl ConnectionGauge {
    fn open() -> Self {
        with_metrics(|m| m.connections.inc());
        ConnectionGauge
    }
}

impl Drop for ConnectionGauge {
    fn drop(&mut self) {
        with_metrics(|m| m.connections.dec());
    }
}

/// Serve one client connection from handshake to close.
pub async fn serve_connection<S>(
    state: Arc<ServerState>,
    stream: S,
    peer: Peer,
) -> ServerResult<()>
where
    S: AsyncRead + AsyncWrite + Send + Sync + 'static,
{
    let _gauge = ConnectionGauge::open();
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = WireReader::new(read_half);
    let mut writer = WireWriter::new(write_half);

    let Some(session) = handshake(&state, &peer, &mut reader, &mut writer).await? else {
        return Ok(());
    };
    tracing::Span::current().record("connector_id", tracing::field::display(session.connector_id));

    let exit = Dispatcher::new(&state, session, &mut reader, &mut writer)
        .run()
        .await?;
    match exit {
        LoopExit::ClientClosed => tracing::debug!("Client closed connection"),
        LoopExit::ListenEnded => tracing::debug!("Connection closed after listen loop"),
    }
    Ok(())
}

/// Spawn a task for one accepted stream.
pub fn spawn_connection<S>(state: Arc<ServerState>, stream: S, peer: Peer)
where
    S: AsyncRead + AsyncWrite + Send + Sync + 'static,
{
    let span = tracing::info_span!(
        "connection",
        peer = %peer.remote_host,
        transport = peer.transport.as_str(),
        connector_id = tracing::field::Empty
    );
    tokio::spawn(
        async move {
            match serve_connection(state, stream, peer).await {
                Ok(()) => {}
                Err(err) if err.kind == FaultKind::Transport => {
                    tracing::debug!(error = %err, "Connection dropped")
                }
                Err(err) => tracing::warn!(error = %err, "Connection closed with fault"),
            }
        }
        .instrument(span),
    );
}

/// Accept loops for every configured listener.
pub struct MeridianServer {
    state: Arc<ServerState>,
}

impl MeridianServer {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    async fn accept_tcp(state: Arc<ServerState>, listener: TcpListener) -> ServerResult<()> {
        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .map_err(|e| ServerError::internal(format!("TCP accept failed: {}", e)))?;
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
            }
            let peer = Peer {
                remote_host: addr.ip().to_string(),
                transport: TransportKind::Tcp,
            };
            spawn_connection(Arc::clone(&state), stream, peer);
        }
    }

    #[cfg(unix)]
    async fn accept_unix(
        state: Arc<ServerState>,
        listener: tokio::net::UnixListener,
    ) -> ServerResult<()> {
        loop {
            let (stream, _) = listener
                .accept()
                .await
                .map_err(|e| ServerError::internal(format!("Unix accept failed: {}", e)))?;
            let peer = Peer {
                remote_host: "localhost".to_string(),
                transport: TransportKind::Unix,
            };
            spawn_connection(Arc::clone(&state), stream, peer);
        }
    }

    #[cfg(unix)]
    fn bind_unix(&self, tasks: &mut tokio::task::JoinSet<ServerResult<()>>) -> ServerResult<()> {
        let Some(path) = &self.state.config.unix_socket else {
            return Ok(());
        };
        if path.exists() {
            std::fs::remove_file(path).map_err(|e| {
                ServerError::internal(format!("Failed to remove stale socket {}: {}", path.display(), e))
            })?;
        }
        let listener = tokio::net::UnixListener::bind(path).map_err(|e| {
            ServerError::internal(format!("Failed to bind {}: {}", path.display(), e))
        })?;
        tracing::info!(path = %path.display(), "Accepting local connections");
        tasks.spawn(Self::accept_unix(Arc::clone(&self.state), listener));
        Ok(())
    }

    #[cfg(not(unix))]
    fn bind_unix(&self, _tasks: &mut tokio::task::JoinSet<ServerResult<()>>) -> ServerResult<()> {
        if self.state.config.unix_socket.is_some() {
            tracing::warn!("Unix sockets are not supported on this platform");
        }
        Ok(())
    }

    /// Bind every listener and serve until ctrl-c or a listener fails.
    pub async fn run(self) -> ServerResult<()> {
        let config = &self.state.config;
        let tcp = TcpListener::bind(config.bind)
            .await
            .map_err(|e| ServerError::internal(format!("Failed to bind {}: {}", config.bind, e)))?;
        tracing::info!(addr = %config.bind, "Accepting client connections");

        let mut tasks = tokio::task::JoinSet::new();
        tasks.spawn(Self::accept_tcp(Arc::clone(&self.state), tcp));

        self.bind_unix(&mut tasks)?;

        if let Some(addr) = config.admin_bind {
            tasks.spawn(serve_admin(addr, Arc::clone(&self.state)));
        }

        let finished = tokio::select! {
            joined = tasks.join_next() => joined,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                None
            }
        };
        tasks.abort_all();
        match finished {
            Some(Ok(result)) => result,
            Some(Err(e)) => Err(ServerError::internal(format!("Listener task failed: {}", e))),
            None => Ok(()),
        }
    }
}
