//! The request body pump: pulls bytes from an upper-layer source and
//! pushes them into the codec's send-side flow control, on demand.

use std::io;
use std::pin::Pin;

use bytes::Bytes;
use h2::SendStream;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::message::MessageId;
use crate::metrics::MetricsHandle;

/// Size of the buffer used on the non-pollable (blocking) path, and the
/// largest chunk the pollable path reads in one shot. Arbitrary but modest;
/// the codec's own flow-control window is the real limiter.
const CHUNK_SIZE: usize = 16 * 1024;

/// A closure-shaped blocking body source: each call reads up to `len` bytes
/// and blocks the calling (blocking-pool) thread until it has data, EOF, or
/// an error. This is the "blocking source" variant of the two-valued body
/// source below.
pub type BlockingRead = Box<dyn FnMut(usize) -> io::Result<Vec<u8>> + Send>;

/// The upper layer's request body, encoded as two mutually exclusive
/// producer capabilities: a pollable, non-blocking async source, or a
/// blocking source driven on the blocking thread pool.
pub enum RequestBodySource {
    /// Supports non-blocking reads and readiness polling — in this
    /// implementation, any `AsyncRead`. The pump calls `poll_read`/`read`
    /// directly on the connection's own task; awaiting it is the async
    /// equivalent of "install a readiness source and return DEFERRED".
    Pollable(Pin<Box<dyn AsyncRead + Send>>),

    /// A blocking source. Each read is run via `spawn_blocking`; the pump
    /// returns DEFERRED (it simply awaits the `JoinHandle`) and resumes the
    /// codec once the blocking read completes.
    Blocking(BlockingRead),
}

impl std::fmt::Debug for RequestBodySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestBodySource::Pollable(_) => f.write_str("RequestBodySource::Pollable"),
            RequestBodySource::Blocking(_) => f.write_str("RequestBodySource::Blocking"),
        }
    }
}

/// Pump state attached to a [`crate::message::Message`] whose request has a
/// body.
pub struct BodyPump {
    source: RequestBodySource,
    /// Non-empty buffer left over from a completed blocking read that
    /// hasn't been handed to the codec yet (non-pollable path).
    buffered: Vec<u8>,
    eof: bool,
    /// Latched pump error, surfaced the next time a chunk is requested.
    error: Option<io::Error>,
    bytes_sent: u64,
}

impl BodyPump {
    pub fn new(source: RequestBodySource) -> Self {
        BodyPump {
            source,
            buffered: Vec::new(),
            eof: false,
            error: None,
            bytes_sent: 0,
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Reads one chunk from the source, honoring whichever path it is.
    /// Returns `Ok(None)` on EOF. A cancellation firing mid-read returns
    /// `Err(Error::Cancelled)` without touching the record further — the
    /// caller (the pump-drive loop) must stop immediately.
    async fn next_chunk(&mut self, cancel: &CancellationToken) -> Result<Option<Vec<u8>>> {
        if let Some(e) = self.error.take() {
            return Err(Error::Body(e));
        }
        if !self.buffered.is_empty() {
            let chunk = std::mem::take(&mut self.buffered);
            return Ok(Some(chunk));
        }
        if self.eof {
            return Ok(None);
        }

        match &mut self.source {
            RequestBodySource::Pollable(reader) => {
                let mut buf = vec![0u8; CHUNK_SIZE];
                let read = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    res = reader.read(&mut buf) => res,
                };
                match read {
                    Ok(0) => {
                        self.eof = true;
                        Ok(None)
                    }
                    Ok(n) => {
                        buf.truncate(n);
                        trace!(bytes = n, "pollable body source yielded chunk");
                        Ok(Some(buf))
                    }
                    Err(e) => {
                        self.error = None;
                        Err(Error::Body(e))
                    }
                }
            }
            RequestBodySource::Blocking(read_fn) => {
                // SAFETY-free: we move the closure out for the duration of
                // the blocking call and put it back, since `spawn_blocking`
                // needs a `'static` closure and `read_fn` only lives as long
                // as `self`. We swap in a no-op closure as a placeholder.
                let mut taken: BlockingRead = Box::new(|_| Ok(Vec::new()));
                std::mem::swap(read_fn, &mut taken);
                let join = tokio::task::spawn_blocking(move || {
                    let result = taken(CHUNK_SIZE);
                    (taken, result)
                });
                let (restored, result) = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    res = join => res.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?,
                };
                if let RequestBodySource::Blocking(slot) = &mut self.source {
                    *slot = restored;
                }
                match result {
                    Ok(bytes) if bytes.is_empty() => {
                        self.eof = true;
                        Ok(None)
                    }
                    Ok(bytes) => Ok(Some(bytes)),
                    Err(e) => Err(Error::Body(e)),
                }
            }
        }
    }

    /// Drains the body into `send_stream`, respecting the codec's send-side
    /// flow control by reserving capacity before each `send_data` (the
    /// analogue of the codec pulling bytes on demand via its read
    /// callback). Emits exactly one end-of-stream `send_data` call when the
    /// source is exhausted.
    pub async fn drive(
        &mut self,
        msg: MessageId,
        send_stream: &mut SendStream<Bytes>,
        cancel: &CancellationToken,
        metrics: Option<&MetricsHandle>,
    ) -> Result<u64> {
        loop {
            let chunk = match self.next_chunk(cancel).await {
                Ok(c) => c,
                Err(e) => {
                    send_stream.send_reset(h2::Reason::INTERNAL_ERROR);
                    return Err(e);
                }
            };

            match chunk {
                None => {
                    send_stream
                        .send_data(Bytes::new(), true)
                        .map_err(Error::from)?;
                    debug!(%msg, total = self.bytes_sent, "request body pump reached EOF");
                    return Ok(self.bytes_sent);
                }
                Some(bytes) => {
                    let len = bytes.len();
                    send_stream.reserve_capacity(len);
                    let granted = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        granted = futures_util::future::poll_fn(|cx| send_stream.poll_capacity(cx)) => granted,
                    };
                    match granted {
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(Error::from(e)),
                        None => {
                            return Err(Error::Internal(
                                "send stream closed while waiting for capacity",
                            ))
                        }
                    }
                    send_stream
                        .send_data(Bytes::from(bytes), false)
                        .map_err(Error::from)?;
                    self.bytes_sent += len as u64;
                    if let Some(m) = metrics {
                        m.add_request_body_bytes(len as u64);
                    }
                }
            }
        }
    }
}
