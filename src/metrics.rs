//! Optional, upper-layer-owned byte counters.
//!
//! The engine never owns a `Metrics` block; it only increments fields on one
//! it was handed at `submit` time. Upper layers that don't care about
//! per-message accounting simply never attach one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Byte counters for one message, in both directions.
///
/// All fields use relaxed atomics: the connection task is the only writer,
/// and readers (the upper layer, inspecting the counters after completion
/// or mid-flight for progress reporting) only need eventual consistency.
#[derive(Debug, Default)]
pub struct Metrics {
    request_header_bytes: AtomicU64,
    request_body_bytes: AtomicU64,
    response_header_bytes: AtomicU64,
    response_body_bytes: AtomicU64,
}

pub type MetricsHandle = Arc<Metrics>;

impl Metrics {
    pub fn new() -> MetricsHandle {
        Arc::new(Metrics::default())
    }

    pub(crate) fn add_request_header_bytes(&self, n: u64) {
        self.request_header_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_request_body_bytes(&self, n: u64) {
        self.request_body_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_response_header_bytes(&self, n: u64) {
        self.response_header_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_response_body_bytes(&self, n: u64) {
        self.response_body_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn request_header_bytes(&self) -> u64 {
        self.request_header_bytes.load(Ordering::Relaxed)
    }

    pub fn request_body_bytes(&self) -> u64 {
        self.request_body_bytes.load(Ordering::Relaxed)
    }

    pub fn response_header_bytes(&self) -> u64 {
        self.response_header_bytes.load(Ordering::Relaxed)
    }

    pub fn response_body_bytes(&self) -> u64 {
        self.response_body_bytes.load(Ordering::Relaxed)
    }
}
