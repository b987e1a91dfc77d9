//! Length-prefixed RPC frame I/O over a byte stream

use crate::{Result, TransportError};
use bytes::{Buf, BytesMut};
use codec::{decode_rpc_frame, encode_rpc_frame, RpcMessage};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

const INITIAL_READ_CAPACITY: usize = 8 * 1024;

/// Reads whole RPC frames, buffering partial reads
pub struct FrameReader<R> {
    inner: R,
    buffer: BytesMut,
    max_message_size: usize,
    bytes_received: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_message_size: usize) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(INITIAL_READ_CAPACITY),
            max_message_size,
            bytes_received: 0,
        }
    }

    /// Next message, or `None` on a clean end of stream
    pub async fn read_message(&mut self) -> Result<Option<RpcMessage>> {
        loop {
            if let Some((message, consumed)) =
                decode_rpc_frame(&self.buffer, self.max_message_size)?
            {
                self.buffer.advance(consumed);
                self.bytes_received += consumed as u64;
                trace!(
                    kind = ?message.message_type(),
                    bytes = consumed,
                    total_received = self.bytes_received,
                    "received rpc frame"
                );
                return Ok(Some(message));
            }

            let read = self
                .inner
                .read_buf(&mut self.buffer)
                .await
                .map_err(|e| TransportError::network_with_source("Failed to read rpc frame", e))?;

            if read == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::connection(
                    format!("stream closed with {} bytes of a partial frame", self.buffer.len()),
                    None,
                ));
            }
        }
    }
}

/// Writes whole RPC frames, one write and flush per message
pub struct FrameWriter<W> {
    inner: W,
    bytes_sent: u64,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            bytes_sent: 0,
        }
    }

    pub async fn write_message(&mut self, message: &RpcMessage) -> Result<()> {
        let frame = encode_rpc_frame(message)?;

        self.inner
            .write_all(&frame)
            .await
            .map_err(|e| TransportError::network_with_source("Failed to write rpc frame", e))?;
        self.inner
            .flush()
            .await
            .map_err(|e| TransportError::network_with_source("Failed to flush rpc stream", e))?;

        self.bytes_sent += frame.len() as u64;
        trace!(
            kind = ?message.message_type(),
            bytes = frame.len(),
            total_sent = self.bytes_sent,
            "sent rpc frame"
        );
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner
            .shutdown()
            .await
            .map_err(|e| TransportError::network_with_source("Failed to shut down rpc stream", e))
    }
}
