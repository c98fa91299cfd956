//! Async duplex transport over any byte stream.

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use tracing::debug;

use crate::codec::{decode_frame, encode_frame, FrameConfig};
use crate::error::{FrameError, Result};

/// `tokio_util` codec for shellmux frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload_size: usize,
}

impl FrameCodec {
    pub fn new(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(FrameConfig::default().max_payload_size)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        decode_frame(src, self.max_payload_size)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => {
                debug!(buffered = src.len(), "stream ended inside a frame");
                Err(FrameError::ConnectionClosed)
            }
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        if item.len() > self.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: item.len(),
                max: self.max_payload_size,
            });
        }
        encode_frame(&item, dst)
    }
}

/// Ordered duplex pipe of whole frames.
pub struct Transport<T> {
    rx: TransportRx<T>,
    tx: TransportTx<T>,
}

impl<T> Transport<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(io: T) -> Self {
        Self::with_config(io, &FrameConfig::default())
    }

    pub fn with_config(io: T, config: &FrameConfig) -> Self {
        let (read, write) = tokio::io::split(io);
        let codec = FrameCodec::new(config.max_payload_size);
        Self {
            rx: TransportRx {
                inner: FramedRead::new(read, codec.clone()),
                closed: false,
            },
            tx: TransportTx {
                inner: FramedWrite::new(write, codec),
                closed: false,
            },
        }
    }

    /// Send one frame.
    pub async fn send(&mut self, payload: Bytes) -> Result<()> {
        self.tx.send(payload).await
    }

    /// Wait for the next whole frame.
    pub async fn receive(&mut self) -> Result<Bytes> {
        self.rx.receive().await
    }

    /// Flush and shut down the write side.
    pub async fn close(&mut self) -> Result<()> {
        self.tx.close().await
    }

    /// Split into independently owned receive and send halves.
    pub fn into_split(self) -> (TransportRx<T>, TransportTx<T>) {
        (self.rx, self.tx)
    }
}

/// Receive half of a [`Transport`].
pub struct TransportRx<T> {
    inner: FramedRead<ReadHalf<T>, FrameCodec>,
    closed: bool,
}

impl<T: AsyncRead> TransportRx<T> {
    /// Wait for the next whole frame.
    ///
    /// EOF and stream errors both end the transport: the error is reported
    /// as [`FrameError::ConnectionClosed`] unless it is a framing violation,
    /// and every later call returns `ConnectionClosed`.
    pub async fn receive(&mut self) -> Result<Bytes> {
        if self.closed {
            return Err(FrameError::ConnectionClosed);
        }
        match self.inner.next().await {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(err)) => {
                self.closed = true;
                debug!(error = %err, "transport receive failed");
                match err {
                    FrameError::InvalidMagic | FrameError::PayloadTooLarge { .. } => Err(err),
                    _ => Err(FrameError::ConnectionClosed),
                }
            }
            None => {
                self.closed = true;
                debug!("transport reached EOF");
                Err(FrameError::ConnectionClosed)
            }
        }
    }
}

/// Send half of a [`Transport`].
pub struct TransportTx<T> {
    inner: FramedWrite<WriteHalf<T>, FrameCodec>,
    closed: bool,
}

impl<T: AsyncWrite> TransportTx<T> {
    /// Send one frame and flush it.
    pub async fn send(&mut self, payload: Bytes) -> Result<()> {
        if self.closed {
            return Err(FrameError::ConnectionClosed);
        }
        match self.inner.send(payload).await {
            Ok(()) => Ok(()),
            Err(err @ FrameError::PayloadTooLarge { .. }) => Err(err),
            Err(err) => {
                self.closed = true;
                debug!(error = %err, "transport send failed");
                Err(FrameError::ConnectionClosed)
            }
        }
    }

    /// Queue a frame without flushing. Pair with [`Self::flush`].
    pub async fn feed(&mut self, payload: Bytes) -> Result<()> {
        if self.closed {
            return Err(FrameError::ConnectionClosed);
        }
        match self.inner.feed(payload).await {
            Ok(()) => Ok(()),
            Err(err @ FrameError::PayloadTooLarge { .. }) => Err(err),
            Err(err) => {
                self.closed = true;
                debug!(error = %err, "transport feed failed");
                Err(FrameError::ConnectionClosed)
            }
        }
    }

    pub async fn flush(&mut self) -> Result<()> {
        if self.closed {
            return Err(FrameError::ConnectionClosed);
        }
        SinkExt::<Bytes>::flush(&mut self.inner).await.map_err(|err| {
            self.closed = true;
            debug!(error = %err, "transport flush failed");
            FrameError::ConnectionClosed
        })
    }

    /// Flush and shut down the write side. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        SinkExt::<Bytes>::close(&mut self.inner).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
