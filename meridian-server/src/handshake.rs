//! Connection handshake.
//!
//! ```text
//! client → version:str
//! server ← UNSUPPORTED_VERSION current:str           (connection closes)
//! client → connect_as:str authenticate_as:str password:str [label:str 1.80+]
//! server ← SUCCESS [connector_id:long 1.44+]
//!        | fault                                     (client may retry)
//! ```

use meridian_core::{
    status, CodecTable, ProtocolVersion, UserId, WireField, WireReader, WireWriter,
};
use secrecy::SecretString;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{ServerError, ServerResult};
use crate::response::write_fault;
use crate::session::{Session, SessionInit, TransportKind};
use crate::state::ServerState;
use crate::telemetry::metrics::with_metrics;

/// Where a connection came from.
#[derive(Debug, Clone)]
pub struct Peer {
    pub remote_host: String,
    pub transport: TransportKind,
}

struct Credentials {
    connect_as: UserId,
    authenticate_as: UserId,
    password: SecretString,
    client_label: String,
}

async fn read_credentials<R: AsyncRead + Unpin>(
    reader: &mut WireReader<R>,
    codec: &CodecTable,
) -> ServerResult<Credentials> {
    let connect_as = UserId::from(reader.read_string().await?);
    let authenticate_as = UserId::from(reader.read_string().await?);
    let password = SecretString::from(reader.read_string().await?);
    let client_label = if codec.includes(WireField::HandshakeClientLabel) {
        reader.read_string().await?
    } else {
        codec
            .default_for(WireField::HandshakeClientLabel)
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_default()
    };
    Ok(Credentials {
        connect_as,
        authenticate_as,
        password,
        client_label,
    })
}

/// Negotiate the protocol version and authenticate.
///
/// `None` means the handshake ended without a session and the connection
/// should close.
pub async fn handshake<R, W>(
    state: &ServerState,
    peer: &Peer,
    reader: &mut WireReader<R>,
    writer: &mut WireWriter<W>,
) -> ServerResult<Option<Arc<Session>>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let requested = reader.read_string().await?;
    let Some(version) = ProtocolVersion::parse(&requested) else {
        tracing::info!(host = %peer.remote_host, version = %requested, "Unsupported protocol version");
        with_metrics(|m| m.record_handshake("unsupported_version"));
        writer.write_byte(status::UNSUPPORTED_VERSION).await?;
        writer.write_string(ProtocolVersion::CURRENT.as_str()).await?;
        writer.flush().await?;
        return Ok(None);
    };
    let codec = CodecTable::for_version(version);

    let attempts = state.config.max_login_attempts.max(1);
    for attempt in 1..=attempts {
        let credentials = read_credentials(reader, &codec).await?;
        let result = state
            .access
            .authenticate(
                &peer.remote_host,
                &credentials.connect_as,
                &credentials.authenticate_as,
                &credentials.password,
            )
            .await;

        match result {
            Ok(()) => {
                let connector_id = state.connector_ids.next();
                writer.write_byte(status::SUCCESS).await?;
                if codec.includes(WireField::HandshakeConnectorId) {
                    writer.write_long(connector_id.0).await?;
                }
                writer.flush().await?;
                with_metrics(|m| m.record_handshake("success"));
                tracing::info!(
                    connector_id = %connector_id,
                    user = %credentials.authenticate_as,
                    connect_as = %credentials.connect_as,
                    version = %version,
                    "Session established"
                );

                let secure = state.config.secure || peer.transport == TransportKind::Unix;
                return Ok(Some(Arc::new(Session::new(SessionInit {
                    connector_id,
                    authenticated_user: credentials.authenticate_as,
                    effective_user: credentials.connect_as,
                    remote_host: peer.remote_host.clone(),
                    version,
                    transport: peer.transport,
                    secure,
                    client_label: credentials.client_label,
                }))));
            }
            Err(err) => {
                with_metrics(|m| m.record_handshake("rejected"));
                tracing::warn!(
                    host = %peer.remote_host,
                    user = %credentials.authenticate_as,
                    attempt,
                    error = %err,
                    "Authentication failed"
                );
                let fault = ServerError::from(err);
                write_fault(writer, &codec, &fault).await?;
                writer.flush().await?;
            }
        }
    }

    tracing::info!(host = %peer.remote_host, attempts, "Too many failed login attempts");
    Ok(None)
}
