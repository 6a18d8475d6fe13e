//! Connection I/O and the codec callback glue that drives one message's
//! state machine forward.
//!
//! Wrapping `h2` instead of a raw C codec changes where the callback-style
//! dispatch lives. `h2::client::Connection<T, B>` already drives its own
//! read/write pump on a background task and hands the embedder complete,
//! assembled values (a `Response<RecvStream>` once headers are in, a
//! `Bytes` chunk per `RecvStream::poll_data`) rather than invoking a
//! per-frame callback. The original design's named callbacks
//! (`on_header`/`on_begin_frame`/...) are therefore implemented here as a
//! sequence of `await` points inside [`Connection::run_until`] — see
//! `DESIGN.md` for the full mapping from one to the other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::FutureExt;
use h2::client::{Builder as H2Builder, ResponseFuture, SendRequest};
use http::{HeaderMap, HeaderName, Method, Request, StatusCode, Uri};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::body::{BodyPump, RequestBodySource, ResponseBodyStream};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::message::{Completion, CompletionCallback, Message, MessageId, State};
use crate::metrics::MetricsHandle;

/// HTTP/1-specific headers stripped before transmission, compared
/// case-insensitively.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A request as the upper layer presents it to `submit`.
pub struct OutgoingRequest {
    pub method: Method,
    pub scheme: &'static str,
    pub authority: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Option<RequestBodySource>,
    pub metrics: Option<MetricsHandle>,
}

impl OutgoingRequest {
    fn is_options_ping(&self) -> bool {
        self.method == Method::OPTIONS && self.path == "*"
    }
}

/// Driver-side shared state: what the background task that pumps
/// `h2::client::Connection` reports back, since it runs independently of
/// whichever task calls [`Connection::submit`] / [`Connection::run_until`].
struct DriverState {
    shutdown: AtomicBool,
    /// Set once the driver task ends with an error (a GOAWAY from the peer,
    /// or some other connection-level failure). Checked and fanned out to
    /// messages at the next `run_until` boundary.
    goaway_error: AsyncMutex<Option<Arc<h2::Error>>>,
}

/// One HTTP/2 connection's message I/O engine.
///
/// Pinned to a single scheduling context: nothing here is designed to be
/// called from more than one task concurrently. `Connection` is
/// intentionally `!Sync`-by-convention (enforced by discipline, not the
/// type system — no locks are needed if nothing calls in concurrently).
pub struct Connection {
    id: u64,
    send_request: SendRequest<Bytes>,
    messages: HashMap<MessageId, Message>,
    next_msg_id: u64,
    driver: Arc<DriverState>,
    config: Config,
}

impl Connection {
    /// Performs the HTTP/2 client handshake over `io` and spawns the
    /// background task that drives the wrapped codec.
    ///
    /// Submits `{INITIAL_WINDOW_SIZE, HEADER_TABLE_SIZE, ENABLE_PUSH=0}` as
    /// part of the handshake and sets the connection-wide local window to
    /// `config.local_connection_window`.
    #[instrument(skip(io, config))]
    pub async fn handshake<T>(io: T, config: Config) -> Result<Connection>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

        let (send_request, h2_connection) = H2Builder::new()
            .initial_window_size(config.initial_window_size)
            .initial_connection_window_size(config.local_connection_window)
            .header_table_size(config.header_table_size)
            .enable_push(config.enable_push)
            .handshake(io)
            .await?;

        let driver = Arc::new(DriverState {
            shutdown: AtomicBool::new(false),
            goaway_error: AsyncMutex::new(None),
        });

        let driver_for_task = driver.clone();
        tokio::spawn(async move {
            let result = h2_connection.await;
            driver_for_task.shutdown.store(true, Ordering::Release);
            if let Err(e) = result {
                warn!(connection = id, error = %e, "connection driver task ended with an error");
                *driver_for_task.goaway_error.lock().await = Some(Arc::new(e));
            } else {
                debug!(connection = id, "connection driver task ended cleanly");
            }
        });

        Ok(Connection {
            id,
            send_request,
            messages: HashMap::new(),
            next_msg_id: 1,
            driver,
            config,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Builds pseudo-headers, filters hop-by-hop headers, obtains a stream
    /// from the codec, and attaches the request body pump if one was
    /// supplied.
    #[instrument(skip(self, item, completion), fields(connection = self.id))]
    pub async fn submit(
        &mut self,
        item: OutgoingRequest,
        completion: CompletionCallback,
    ) -> Result<MessageId> {
        if self.driver.shutdown.load(Ordering::Acquire) {
            return Err(Error::Internal("connection is shut down; no new requests admitted"));
        }

        futures_util::future::poll_fn(|cx| self.send_request.poll_ready(cx)).await?;

        let uri = self.build_uri(&item)?;
        let mut builder = Request::builder().method(item.method.clone()).uri(uri);
        for (name, value) in item.headers.iter() {
            if !is_hop_by_hop(name) {
                builder = builder.header(name, value);
            }
        }
        let request = builder.body(()).map_err(|_| Error::Internal("invalid request parts"))?;

        let metrics = item.metrics.clone();
        let has_body = item.body.is_some();

        let (response_future, send_stream) = self
            .send_request
            .send_request(request, !has_body)?;

        let msg_id = MessageId(self.next_msg_id);
        self.next_msg_id += 1;

        let mut message = Message::new(msg_id, metrics.clone());
        message.completion = Some(completion);
        message.advance(State::None, State::WriteHeaders);

        if let Some(m) = &metrics {
            // h2 does not expose raw frame byte counts to the embedder; we
            // approximate header bytes from the encoded header map length,
            // which is noted as an approximation in DESIGN.md.
            let approx: u64 = item.headers.iter().map(|(n, v)| (n.as_str().len() + v.len() + 4) as u64).sum();
            m.add_request_header_bytes(approx);
        }

        let cancel = message.cancel.clone();

        if has_body {
            let mut pump = BodyPump::new(item.body.unwrap());
            let mut send_stream = send_stream;
            let msg_metrics = metrics.clone();
            let driver_cancel = cancel.clone();
            let pump_id = msg_id;
            let task = tokio::spawn(async move {
                pump.drive(pump_id, &mut send_stream, &driver_cancel, msg_metrics.as_ref()).await
            });
            message.body_task = Some(task);
        } else {
            message.advance(State::WriteHeaders, State::WriteDone);
            message.send_stream = Some(send_stream);
        }

        message.response_future_fut = Some(response_future);

        self.messages.insert(msg_id, message);
        Ok(msg_id)
    }

    fn build_uri(&self, item: &OutgoingRequest) -> Result<Uri> {
        let path_and_query = if item.is_options_ping() {
            "*".to_string()
        } else if let Some(q) = &item.query {
            format!("{}?{}", item.path, q)
        } else {
            item.path.clone()
        };

        let uri = format!("{}://{}{}", item.scheme, item.authority, path_and_query);
        uri.parse::<Uri>().map_err(|_| Error::Internal("failed to build request URI"))
    }

    /// Runs the state machine forward until `msg` reaches `target`, an
    /// error is latched, or the message is gone.
    ///
    /// This is the "blocking" mode: the call awaits whatever the next step
    /// needs. [`Connection::try_run_until`] is the non-blocking counterpart.
    #[instrument(skip(self), fields(connection = self.id))]
    pub async fn run_until(&mut self, msg: MessageId, target: State) -> Result<()> {
        loop {
            self.apply_driver_goaway().await;

            let cancelled = {
                let m = self.messages.get(&msg).ok_or(Error::Internal("unknown message"))?;
                m.cancel.is_cancelled()
            };
            if cancelled {
                return Err(Error::Cancelled);
            }

            if let Some(e) = self.messages.get(&msg).and_then(|m| m.error.as_ref()) {
                return Err(clone_error(e));
            }

            let state = self.messages.get(&msg).map(|m| m.state).ok_or(Error::Internal("unknown message"))?;
            if state >= target {
                return Ok(());
            }

            match state {
                State::None | State::WriteHeaders | State::WriteData => {
                    self.advance_write(msg).await?;
                }
                State::WriteDone => {
                    self.advance_read_headers(msg).await?;
                }
                State::ReadHeaders => {
                    self.advance_read_data_start(msg);
                }
                State::ReadDataStart => {
                    if !self.sniff(msg) {
                        // Not enough bytes yet; yield once so the driver
                        // task can make progress, then retry.
                        tokio::task::yield_now().await;
                    }
                }
                State::ReadData | State::ReadDone => return Ok(()),
            }
        }
    }

    /// Non-blocking variant: attempts one step without suspending. Returns
    /// `Error::would_block()` if the step can't complete immediately.
    pub fn try_run_until(&mut self, msg: MessageId, target: State) -> Result<()> {
        self.run_until(msg, target)
            .now_or_never()
            .unwrap_or_else(|| Err(Error::would_block()))
    }

    /// Readiness-driven resumption variant.
    ///
    /// The original design installs a readiness source on whichever
    /// half-stream is the message's current frontier and re-enters on fire.
    /// With `h2` driving its own background task, the equivalent is simply
    /// awaiting [`Connection::run_until`] and invoking `callback` with the
    /// result — the executor is what re-enters us, via the driver task's
    /// wakers. `priority` is accepted for interface parity but is not
    /// otherwise consulted (the wrapped codec schedules background I/O
    /// itself and exposes no priority knob to embedders).
    pub async fn run_until_read_async<F>(&mut self, msg: MessageId, target: State, _priority: u32, callback: F)
    where
        F: FnOnce(Result<()>),
    {
        let result = self.run_until(msg, target).await;
        callback(result);
    }

    async fn advance_write(&mut self, msg: MessageId) -> Result<()> {
        let task = {
            let m = self.messages.get_mut(&msg).ok_or(Error::Internal("unknown message"))?;
            m.body_task.take()
        };
        if let Some(task) = task {
            match task.await {
                Ok(Ok(sent)) => {
                    trace!(%msg, sent, "request body pump finished");
                }
                Ok(Err(e)) => {
                    if let Some(m) = self.messages.get_mut(&msg) {
                        m.set_error(e);
                    }
                }
                Err(join_err) => {
                    warn!(%msg, error = %join_err, "request body pump task panicked");
                    if let Some(m) = self.messages.get_mut(&msg) {
                        m.set_error(Error::Internal("request body pump task panicked"));
                    }
                }
            }
        }
        if let Some(m) = self.messages.get_mut(&msg) {
            m.advance_to_at_least(State::WriteDone);
        }
        Ok(())
    }

    async fn advance_read_headers(&mut self, msg: MessageId) -> Result<()> {
        let fut = {
            let m = self.messages.get_mut(&msg).ok_or(Error::Internal("unknown message"))?;
            m.response_future_fut.take()
        };
        let Some(fut) = fut else {
            // Already consumed by a previous call; nothing to do but wait
            // for the response body stream to exist.
            return Ok(());
        };

        match fut.await {
            Ok(response) => self.on_response_headers(msg, response),
            Err(e) => {
                if let Some(m) = self.messages.get_mut(&msg) {
                    m.set_error(Error::from(e));
                }
                Ok(())
            }
        }
    }

    /// The collapsed equivalent of the original design's `on_begin_frame`
    /// (HEADERS) followed by `on_frame_recv` (HEADERS, END_HEADERS) for the
    /// response side. Since `h2::client::ResponseFuture` only resolves once
    /// with the final, non-1xx response, an informational response (if any
    /// occurred) is not separately observable through this wrapped API —
    /// see `DESIGN.md`.
    fn on_response_headers(&mut self, msg: MessageId, response: http::Response<h2::RecvStream>) -> Result<()> {
        let (parts, recv) = response.into_parts();
        let Some(m) = self.messages.get_mut(&msg) else {
            return Ok(());
        };

        m.status = Some(parts.status);
        m.response_headers = parts.headers;
        if let Some(metrics) = &m.metrics {
            let approx: u64 = m
                .response_headers
                .iter()
                .map(|(n, v)| (n.as_str().len() + v.len() + 4) as u64)
                .sum();
            metrics.add_response_header_bytes(approx);
        }

        m.advance(State::WriteDone, State::ReadHeaders);

        let is_no_content = parts.status == StatusCode::NO_CONTENT;
        if is_no_content {
            m.response_body = Some(ResponseBodyStream::empty(msg, m.pause_gate.clone()));
            m.advance(State::ReadHeaders, State::ReadData);
        } else {
            m.response_body = Some(ResponseBodyStream::new(msg, recv, m.metrics.clone(), m.pause_gate.clone()));
            m.advance(State::ReadHeaders, State::ReadDataStart);
        }
        Ok(())
    }

    /// A non-blocking attempt to classify content from the decoded stream.
    /// Returns `true` on success (advancing `READ_DATA_START → READ_DATA`);
    /// `false` means "not enough bytes yet", which is not an error.
    fn sniff(&mut self, msg: MessageId) -> bool {
        let Some(m) = self.messages.get_mut(&msg) else { return false };
        if m.state != State::ReadDataStart {
            return true;
        }
        // This engine does not implement content-type sniffing itself (an
        // external collaborator); it only carves out the state window.
        // Upper layers that want sniffing poll the body stream through
        // `get_response_istream` before `READ_DATA` and can hold bytes back
        // themselves. We advance immediately.
        m.advance(State::ReadDataStart, State::ReadData);
        true
    }

    fn advance_read_data_start(&mut self, msg: MessageId) {
        if let Some(m) = self.messages.get_mut(&msg) {
            m.advance(State::ReadHeaders, State::ReadDataStart);
        }
    }

    async fn apply_driver_goaway(&mut self) {
        let maybe_err = {
            let mut guard = self.driver.goaway_error.lock().await;
            guard.take()
        };
        let Some(err) = maybe_err else { return };

        info!(connection = self.id, error = %err, "fanning out GOAWAY/driver failure to incomplete messages");
        // Every message not yet READ_DONE is latched with a protocol
        // failure. The released `h2::Error` type exposes `reason()` (the
        // GOAWAY/RST_STREAM error code) but not the peer's last_stream_id,
        // so narrowing to "stream id > last_stream_id" isn't possible from
        // here; this fans out to every incomplete message instead, a
        // conservative superset — see DESIGN.md.
        for m in self.messages.values_mut() {
            if m.state < State::ReadDone {
                m.set_error(Error::Protocol(clone_h2_error(&err)));
            }
        }
        // Put it back so a second `run_until` on an already-affected
        // message still observes shutdown without double-latching (each
        // message's own `error` field is now authoritative).
        *self.driver.goaway_error.lock().await = None;
    }

    /// Pauses a message: its response body stream withholds delivery (reads
    /// block instead of returning buffered or freshly received bytes) until
    /// [`Connection::unpause`] clears the flag.
    pub fn pause(&mut self, msg: MessageId) {
        if let Some(m) = self.messages.get_mut(&msg) {
            debug_assert!(!m.is_paused(), "pause() called on an already-paused message");
            m.pause_gate.set_paused(true);
        }
    }

    pub fn unpause(&mut self, msg: MessageId) {
        if let Some(m) = self.messages.get_mut(&msg) {
            debug_assert!(m.is_paused(), "unpause() called on a message that wasn't paused");
            m.pause_gate.set_paused(false);
        }
    }

    pub fn is_reusable(&self) -> bool {
        !self.driver.shutdown.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        !self.driver.shutdown.load(Ordering::Acquire)
    }

    pub fn in_progress(&self, msg: MessageId) -> bool {
        self.messages
            .get(&msg)
            .map(|m| m.state < State::ReadDone)
            .unwrap_or(false)
    }

    /// Wraps the decoded response body (or an empty body for 204/
    /// informational-only responses). The returned stream is the same
    /// `ResponseBodyStream` the connection tracks; EOF handling (advancing
    /// `READ_DATA → READ_DONE`) happens in [`Connection::note_body_eof`],
    /// which callers invoke once they observe a zero-length read.
    pub fn get_response_istream(&mut self, msg: MessageId) -> Option<ResponseBodyStream> {
        self.messages.get_mut(&msg).and_then(|m| m.response_body.take())
    }

    /// Called once a consumer of `get_response_istream`'s stream observes
    /// EOF, advancing `READ_DATA → READ_DONE`.
    pub fn note_body_eof(&mut self, msg: MessageId) {
        if let Some(m) = self.messages.get_mut(&msg) {
            m.advance(State::ReadData, State::ReadDone);
        }
    }

    /// Terminates the message: submits a reset, clears it from the table,
    /// and invokes its completion callback. Completion is always reported
    /// as `Completion::Complete`, even when the underlying stream was
    /// interrupted — this is intentional (see `DESIGN.md`'s open-question
    /// notes); the interrupted/complete distinction is logged only.
    #[instrument(skip(self), fields(connection = self.id))]
    pub fn finished(&mut self, msg: MessageId) {
        let Some(mut m) = self.messages.remove(&msg) else {
            return;
        };

        m.cancel.cancel();
        if let Some(task) = m.body_task.take() {
            task.abort();
        }

        if let Some(stream) = m.send_stream.take() {
            let reason = if m.state >= State::ReadDone {
                h2::Reason::NO_ERROR
            } else {
                h2::Reason::CANCEL
            };
            let mut stream = stream;
            stream.send_reset(reason);
        }

        if m.state >= State::ReadDone {
            debug!(%msg, "message finished cleanly");
        } else {
            info!(%msg, state = %m.state, has_error = m.error.is_some(), "message finished while interrupted");
        }

        if let Some(completion) = m.completion.take() {
            completion(Completion::Complete);
        }
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| name.as_str().eq_ignore_ascii_case(h))
}

fn clone_error(e: &Error) -> Error {
    match e {
        Error::Transport(io_err) => Error::Transport(std::io::Error::new(io_err.kind(), io_err.to_string())),
        Error::Protocol(h2_err) => Error::Protocol(clone_h2_error(h2_err)),
        Error::Body(io_err) => Error::Body(std::io::Error::new(io_err.kind(), io_err.to_string())),
        Error::Cancelled => Error::Cancelled,
        Error::Internal(s) => Error::Internal(s),
    }
}

fn clone_h2_error(e: &h2::Error) -> h2::Error {
    // `h2::Error` isn't `Clone`; we only ever need its rendered reason when
    // fanning a single driver failure out to many messages, so reconstruct
    // an equivalent value from its `Reason` where possible.
    if let Some(reason) = e.reason() {
        h2::Error::from(reason)
    } else {
        h2::Error::from(h2::Reason::INTERNAL_ERROR)
    }
}
