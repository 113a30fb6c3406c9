//! Response framing.
//!
//! ```text
//! SUCCESS [payload]              Done / Value / Values
//! NEXT row … NEXT row NO_MORE_ROWS
//! DATA_FAULT [code] message      code only where the version carries it
//! TRANSPORT_FAULT [code] message
//! ```
//!
//! Handlers that invalidate are followed by the caller's footer: client
//! table ids terminated by -1.

use meridian_core::{
    status, CodecTable, WireField, WireResult, WireValue, WireWriter, INVALIDATION_SENTINEL,
};
use tokio::io::AsyncWrite;

use crate::error::ServerError;
use crate::registry::Reply;

pub async fn write_fault<W: AsyncWrite + Unpin>(
    writer: &mut WireWriter<W>,
    codec: &CodecTable,
    err: &ServerError,
) -> WireResult<()> {
    writer.write_byte(err.status_byte()).await?;
    if codec.includes(WireField::FaultCode) {
        writer.write_compact_int(err.kind.code()).await?;
    }
    writer.write_string(&err.message).await
}

pub async fn write_row<W: AsyncWrite + Unpin>(
    writer: &mut WireWriter<W>,
    row: &[WireValue],
) -> WireResult<()> {
    writer.write_byte(status::NEXT).await?;
    for value in row {
        writer.write_value(value).await?;
    }
    Ok(())
}

/// Final status of a committed request. Rows were streamed already.
pub async fn write_reply<W: AsyncWrite + Unpin>(
    writer: &mut WireWriter<W>,
    reply: &Reply,
) -> WireResult<()> {
    match reply {
        Reply::Rows(_) => writer.write_byte(status::NO_MORE_ROWS).await,
        Reply::Done => writer.write_byte(status::SUCCESS).await,
        Reply::Value(value) => {
            writer.write_byte(status::SUCCESS).await?;
            writer.write_value(value).await
        }
        Reply::Values(values) => {
            writer.write_byte(status::SUCCESS).await?;
            for value in values {
                writer.write_value(value).await?;
            }
            Ok(())
        }
    }
}

pub async fn write_footer<W: AsyncWrite + Unpin>(
    writer: &mut WireWriter<W>,
    client_table_ids: &[i32],
) -> WireResult<()> {
    writer
        .write_int_list(client_table_ids, INVALIDATION_SENTINEL)
        .await
}
