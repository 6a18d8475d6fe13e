//! The response body stream: a pollable input stream over received DATA
//! payloads.
//!
//! The original design (libsoup over nghttp2) re-enters the connection's
//! read pump synchronously from inside a consumer read, because nghttp2's
//! read pump and the body consumer share one call stack. Wrapping `h2`
//! collapses that trick: `h2::client::Connection` is driven continuously by
//! its own background task (see [`crate::connection::Connection`]), so a
//! consumer simply awaits [`RecvStream::poll_data`] and the executor
//! schedules the driver task to make progress — no explicit reentry guard is
//! needed. `DESIGN.md` records this simplification; the externally
//! observable behavior (more bytes eventually arrive, EOF is reported once)
//! is unchanged.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use h2::RecvStream;
use tracing::trace;

use crate::error::Error;
use crate::message::{MessageId, PauseGateHandle};
use crate::metrics::MetricsHandle;

/// A pollable stream of received DATA payloads for one message.
///
/// Constructed lazily on the first response DATA frame; a 204/
/// informational-only response never constructs one — [`ResponseBodyStream::empty`]
/// is used instead.
pub struct ResponseBodyStream {
    msg: MessageId,
    inner: Option<RecvStream>,
    buffered: BytesMut,
    /// Set by the connection when it observes END_STREAM on a DATA frame.
    /// Once true and `buffered` is drained, reads return `Ok(0)` — true
    /// EOF, not would-block.
    complete: bool,
    error: Option<Error>,
    metrics: Option<MetricsHandle>,
    /// Shared with the owning [`crate::message::Message`]; while set, reads
    /// withhold delivery instead of handing out buffered or freshly
    /// received bytes, even past `get_response_istream` handing the stream
    /// to a consumer.
    pause_gate: PauseGateHandle,
}

impl ResponseBodyStream {
    pub(crate) fn new(
        msg: MessageId,
        inner: RecvStream,
        metrics: Option<MetricsHandle>,
        pause_gate: PauseGateHandle,
    ) -> Self {
        ResponseBodyStream {
            msg,
            inner: Some(inner),
            buffered: BytesMut::new(),
            complete: false,
            error: None,
            metrics,
            pause_gate,
        }
    }

    /// A body-less stream, for 204 No Content / informational-only
    /// responses.
    pub fn empty(msg: MessageId, pause_gate: PauseGateHandle) -> Self {
        ResponseBodyStream {
            msg,
            inner: None,
            buffered: BytesMut::new(),
            complete: true,
            error: None,
            metrics: None,
            pause_gate,
        }
    }

    pub(crate) fn mark_complete(&mut self) {
        self.complete = true;
    }

    pub(crate) fn set_error(&mut self, e: Error) {
        if self.error.is_none() {
            self.error = Some(e);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete && self.buffered.is_empty()
    }

    /// Releases `n` bytes of local flow-control window back to the peer.
    /// Called automatically as bytes are handed to the consumer.
    fn release(&mut self, n: usize) {
        if let Some(recv) = &mut self.inner {
            let _ = recv.flow_control().release_capacity(n);
        }
        if let Some(metrics) = &self.metrics {
            metrics.add_response_body_bytes(n as u64);
        }
    }

    /// Pulls the next chunk directly from the codec, bypassing any buffered
    /// leftover. Used to drive the stream forward even when no consumer is
    /// currently reading (e.g. while sniffing).
    pub(crate) fn poll_next_chunk(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, Error>>> {
        if self.pause_gate.is_paused() {
            self.pause_gate.register(cx.waker());
            return Poll::Pending;
        }
        let Some(recv) = &mut self.inner else {
            return Poll::Ready(None);
        };
        match recv.poll_data(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                trace!(msg = %self.msg, bytes = bytes.len(), "response body chunk received");
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(e))) => {
                let e = Error::from(e);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.complete = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    /// Reads up to `buf.len()` bytes. Returns `Ok(0)` for true EOF (complete
    /// and drained), `Pending` while the message is paused or the consumer
    /// asked for a non-blocking read and none is ready, or the latched
    /// error if one was set on the message.
    pub fn poll_read(&mut self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<Result<usize, Error>> {
        if self.pause_gate.is_paused() {
            self.pause_gate.register(cx.waker());
            return Poll::Pending;
        }
        if let Some(e) = self.error.take() {
            return Poll::Ready(Err(e));
        }
        if !self.buffered.is_empty() {
            let n = std::cmp::min(buf.len(), self.buffered.len());
            buf[..n].copy_from_slice(&self.buffered[..n]);
            self.buffered.advance(n);
            self.release(n);
            return Poll::Ready(Ok(n));
        }
        if self.complete {
            return Poll::Ready(Ok(0));
        }
        match self.poll_next_chunk(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                let n = std::cmp::min(buf.len(), bytes.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    self.buffered.extend_from_slice(&bytes[n..]);
                }
                self.release(n);
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Err(e)),
            Poll::Ready(None) => Poll::Ready(Ok(0)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl tokio::io::AsyncRead for ResponseBodyStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let mut tmp = vec![0u8; buf.remaining()];
        match ResponseBodyStream::poll_read(&mut self, cx, &mut tmp) {
            Poll::Ready(Ok(n)) => {
                buf.put_slice(&tmp[..n]);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) if e.is_would_block() => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Err(std::io::Error::other(e))),
            Poll::Pending => Poll::Pending,
        }
    }
}
