//! The per-message state machine and its backing record.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Waker;

use bytes::Bytes;
use h2::client::ResponseFuture;
use h2::SendStream;
use http::HeaderMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::body::ResponseBodyStream;
use crate::error::{Error, Result};
use crate::metrics::MetricsHandle;

/// The canonical, strictly monotone state ordering a message moves through.
///
/// `NONE → WRITE_HEADERS → (WRITE_DATA)* → WRITE_DONE → READ_HEADERS →
/// READ_DATA_START → READ_DATA → READ_DONE`.
///
/// `WRITE_DATA` and `WRITE_DONE` compare equal in ordering terms once a
/// message has entered the write-body phase: the variant carries no extra
/// data, repeated DATA frames just re-enter the same state. Comparisons use
/// the derived `PartialOrd`, which relies on declaration order below — do
/// not reorder these variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum State {
    None = 0,
    WriteHeaders = 1,
    WriteData = 2,
    WriteDone = 3,
    ReadHeaders = 4,
    ReadDataStart = 5,
    ReadData = 6,
    ReadDone = 7,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::None => "NONE",
            State::WriteHeaders => "WRITE_HEADERS",
            State::WriteData => "WRITE_DATA",
            State::WriteDone => "WRITE_DONE",
            State::ReadHeaders => "READ_HEADERS",
            State::ReadDataStart => "READ_DATA_START",
            State::ReadData => "READ_DATA",
            State::ReadDone => "READ_DONE",
        };
        f.write_str(s)
    }
}

/// A completion callback, reported exactly once per message.
///
/// The upper layer always receives [`Completion::Complete`], even for
/// interrupted streams — this is intentional (see `DESIGN.md`); a caller
/// that needs to tell a clean close from a mid-stream cancel has to look at
/// the message's latched error, not the completion value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Complete,
}

pub type CompletionCallback = Box<dyn FnOnce(Completion) + Send + 'static>;

/// An opaque handle identifying one message within a connection's table.
///
/// This plays the role of the HTTP/2 stream id, but is the engine's own
/// counter: the wrapped `h2` codec does not expose its internal stream id
/// assignment to embedders (see `DESIGN.md`), so this id exists purely for
/// the engine's own bookkeeping, diagnostics, and test assertions (tests
/// that run several requests on one connection compare ids across them).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub(crate) u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg#{}", self.0)
    }
}

/// Shared pause/resume signal for one message.
///
/// `Connection::pause`/`unpause` flip the flag here; the message's
/// [`ResponseBodyStream`] holds the same handle (even after it has been
/// handed out via `get_response_istream`) and consults it on every read, so
/// pausing actually withholds delivery instead of just toggling a flag
/// nothing looks at. Waking is edge-triggered: `set_paused(false)` wakes
/// whichever task last registered a waker while blocked on the pause.
pub(crate) struct PauseGate {
    paused: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

pub(crate) type PauseGateHandle = Arc<PauseGate>;

impl PauseGate {
    fn new() -> PauseGateHandle {
        Arc::new(PauseGate {
            paused: AtomicBool::new(false),
            waker: Mutex::new(None),
        })
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
        if !paused {
            if let Some(waker) = self.waker.lock().unwrap().take() {
                waker.wake();
            }
        }
    }

    /// Registers `waker` to be woken the next time the gate is cleared.
    /// Called by the response body stream when it finds itself paused.
    pub(crate) fn register(&self, waker: &Waker) {
        *self.waker.lock().unwrap() = Some(waker.clone());
    }
}

/// Per-message state.
pub struct Message {
    pub(crate) id: MessageId,

    /// 0 until the codec has assigned a stream; see [`MessageId`] doc.
    pub(crate) stream_id: u32,

    pub(crate) state: State,

    /// While set, the response body stream withholds delivery and reports
    /// would-block/pending instead of handing out buffered or freshly
    /// received bytes.
    pub(crate) pause_gate: PauseGateHandle,

    pub(crate) completion: Option<CompletionCallback>,

    /// The spawned task draining the request body pump into the codec's
    /// send-side flow control; the [`crate::body::BodyPump`] itself is
    /// moved into this task rather than kept here, since only the task
    /// needs `&mut` access to it while it runs (see `Connection::submit`).
    pub(crate) body_task: Option<JoinHandle<Result<u64>>>,

    /// Retained only for bodyless requests, so `finished` can still send an
    /// explicit RST_STREAM. When a body pump is attached, the send-stream
    /// handle lives inside `body_task` instead.
    pub(crate) send_stream: Option<SendStream<Bytes>>,

    /// Taken by [`crate::connection::Connection::run_until`] the first time
    /// it needs to await the response; `None` afterwards.
    pub(crate) response_future_fut: Option<ResponseFuture>,

    pub(crate) response_body: Option<ResponseBodyStream>,

    /// Response headers, repaired for invalid UTF-8 before being appended.
    pub(crate) response_headers: HeaderMap,

    pub(crate) status: Option<http::StatusCode>,

    /// First-seen error; subsequent `set_error` calls are no-ops.
    pub(crate) error: Option<Error>,

    pub(crate) metrics: Option<MetricsHandle>,

    /// Triggered on `finished`; cancels the pump's in-flight async read.
    pub(crate) cancel: CancellationToken,
}

impl Message {
    pub(crate) fn new(id: MessageId, metrics: Option<MetricsHandle>) -> Self {
        Message {
            id,
            stream_id: 0,
            state: State::None,
            pause_gate: PauseGate::new(),
            completion: None,
            body_task: None,
            send_stream: None,
            response_future_fut: None,
            response_body: None,
            response_headers: HeaderMap::new(),
            status: None,
            error: None,
            metrics,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.pause_gate.is_paused()
    }

    /// Stores `e` only if no error has been latched yet.
    pub(crate) fn set_error(&mut self, e: Error) {
        if self.error.is_none() {
            self.error = Some(e);
        }
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Advances `state` from `from` to `to`. Logs and discards the change if
    /// `self.state != from`; discards silently if `to < state`
    /// (transitions never move the state machine backward).
    pub(crate) fn advance(&mut self, from: State, to: State) {
        if self.state != from {
            warn!(
                msg = %self.id,
                current = %self.state,
                expected = %from,
                attempted = %to,
                "discarding non-matching state transition"
            );
            return;
        }
        if to < self.state {
            warn!(msg = %self.id, current = %self.state, attempted = %to, "discarding non-monotone state transition");
            return;
        }
        self.state = to;
    }

    /// Unconditional forward transition used by frame-send callbacks, which
    /// only ever move state forward and don't need the `from` check that
    /// `advance` performs (entering the write-body phase on the first DATA
    /// frame has no single well-defined `from`).
    pub(crate) fn advance_to_at_least(&mut self, to: State) {
        if to > self.state {
            self.state = to;
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("state", &self.state)
            .field("paused", &self.is_paused())
            .field("status", &self.status)
            .field("has_error", &self.error.is_some())
            .finish()
    }
}
