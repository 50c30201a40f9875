// ABOUTME: Counters for routing, transport retries, and rate limiting.
// ABOUTME: Recording is a no-op until the binary installs a metrics recorder.

/// Metric names used throughout the application.
pub mod names {
    /// Envelopes handed to a handler, labeled by handler name.
    pub const EVENTS_DISPATCHED: &str = "hookslack_events_dispatched_total";
    /// Envelopes with no matching handler.
    pub const EVENTS_UNKNOWN: &str = "hookslack_events_unknown_total";
    /// Handlers that returned an error.
    pub const HANDLER_FAILURES: &str = "hookslack_handler_failures_total";
    /// Transport-level HTTP retries.
    pub const TRANSPORT_RETRIES: &str = "hookslack_transport_retries_total";
    /// Waits caused by a 429 with retry-after.
    pub const RATE_LIMIT_WAITS: &str = "hookslack_rate_limit_waits_total";
    /// Router requests given up, labeled by reason.
    pub const REQUESTS_DROPPED: &str = "hookslack_requests_dropped_total";
    /// Streamed frames dropped before routing.
    pub const FRAMES_DROPPED: &str = "hookslack_frames_dropped_total";
    /// Streaming connections lost.
    pub const CONNECTIONS_LOST: &str = "hookslack_connections_lost_total";
    pub const UNCAUGHT_ERRORS: &str = "hookslack_uncaught_errors_total";
}

#[inline]
pub fn event_dispatched(handler: &str) {
    metrics::counter!(names::EVENTS_DISPATCHED, "handler" => handler.to_string()).increment(1);
}

#[inline]
pub fn event_unknown(kind: &str) {
    metrics::counter!(names::EVENTS_UNKNOWN, "type" => kind.to_string()).increment(1);
}

#[inline]
pub fn handler_failed(handler: &str) {
    metrics::counter!(names::HANDLER_FAILURES, "handler" => handler.to_string()).increment(1);
}

#[inline]
pub fn transport_retry() {
    metrics::counter!(names::TRANSPORT_RETRIES).increment(1);
}

#[inline]
pub fn rate_limit_wait() {
    metrics::counter!(names::RATE_LIMIT_WAITS).increment(1);
}

#[inline]
pub fn request_dropped(reason: &'static str) {
    metrics::counter!(names::REQUESTS_DROPPED, "reason" => reason).increment(1);
}

#[inline]
pub fn frame_dropped() {
    metrics::counter!(names::FRAMES_DROPPED).increment(1);
}

#[inline]
pub fn connection_lost() {
    metrics::counter!(names::CONNECTIONS_LOST).increment(1);
}

#[inline]
pub fn uncaught_error() {
    metrics::counter!(names::UNCAUGHT_ERRORS).increment(1);
}
