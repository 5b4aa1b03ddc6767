//! # Session Driver
//!
//! Runs one session over any `AsyncRead + AsyncWrite` stream.
//!
//! The stream is split in two. A writer task drains the connection's
//! [`OutboundQueue`] in order and reports the first write failure to the
//! handler. The reader loop cuts the inbound stream into frames with
//! [`FrameCodec`] and hands each to the handler in arrival order.
//!
//! The session ends on the first of: end of stream (`Closed`), a closed
//! transport (`Closed`), no frame within the read timeout (`ReadTimeout`), an
//! I/O error (`Reset`) or an unframeable stream (`ProtocolException`). The
//! handler hears about it exactly once through `on_closed`.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace};

use crate::core::codec::FrameCodec;
use crate::error::{ProtocolError, Result};
use crate::protocol::connection::{Connection, DisconnectReason};
use crate::transport::{ChannelTransport, OutboundQueue, SessionHandler};

/// Create the transport, let the handler register the connection, then drive
/// the session to completion
pub async fn run_session<C, S, H>(io: S, handler: Arc<H>, read_timeout: Duration) -> Result<()>
where
    C: Send + Sync + 'static,
    S: AsyncRead + AsyncWrite + Send + 'static,
    H: SessionHandler<C>,
{
    let (transport, outbound) = ChannelTransport::new();
    let conn = handler.on_ready(transport)?;
    drive(io, conn, outbound, handler, read_timeout).await;
    Ok(())
}

/// Drive an already registered connection until the session ends
pub async fn drive<C, S, H>(
    io: S,
    conn: Arc<Connection<C>>,
    outbound: OutboundQueue,
    handler: Arc<H>,
    read_timeout: Duration,
) where
    C: Send + Sync + 'static,
    S: AsyncRead + AsyncWrite + Send + 'static,
    H: SessionHandler<C> + ?Sized,
{
    let (read_half, write_half) = tokio::io::split(io);
    let mut reader = FramedRead::new(read_half, FrameCodec);
    let mut writer = FramedWrite::new(write_half, FrameCodec);
    let (mut rx, closed) = outbound.into_parts();

    let writer_conn = conn.clone();
    let writer_handler = handler.clone();
    let writer_closed = closed.clone();
    let mut writer_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = writer.send(frame).await {
                            writer_handler.on_write_error(&writer_conn, &e);
                            break;
                        }
                    }
                    None => break,
                },
                _ = writer_closed.cancelled() => {
                    // Flush what was queued before the close
                    while let Ok(frame) = rx.try_recv() {
                        if writer.send(frame).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }
        let _ = writer.close().await;
    });

    let reason = loop {
        tokio::select! {
            _ = closed.cancelled() => break DisconnectReason::Closed,
            next = tokio::time::timeout(read_timeout, reader.next()) => match next {
                Err(_) => break DisconnectReason::ReadTimeout,
                Ok(None) => break DisconnectReason::Closed,
                Ok(Some(Ok(frame))) => {
                    trace!(connection = ?conn.id(), frame_len = frame.len(), "Frame received");
                    handler.on_frame(&conn, &frame);
                }
                Ok(Some(Err(ProtocolError::Io(e)))) => {
                    debug!(connection = ?conn.id(), error = %e, "Transport read failed");
                    break DisconnectReason::Reset;
                }
                Ok(Some(Err(e))) => {
                    debug!(connection = ?conn.id(), error = %e, "Stream framing failed");
                    break DisconnectReason::ProtocolException;
                }
            }
        }
    };

    closed.cancel();
    handler.on_closed(&conn, reason);
    // A peer that stopped reading must not pin the session forever
    if tokio::time::timeout(read_timeout, &mut writer_task).await.is_err() {
        writer_task.abort();
    }
    debug!(connection = ?conn.id(), %reason, "Session ended");
}
