//! Span builder helpers for graftcp-local instrumentation.

/// Create a tracing span covering one accepted connection.
///
/// Usage: `let span = connection_span!(session_id, peer_addr);`
///
/// Fields recorded once known:
/// - `pid`, `dest_addr`: the correlation result
/// - `dialer`: which upstream transport served the session
/// - `bytes_up`, `bytes_down`: relay totals, recorded at teardown
#[macro_export]
macro_rules! connection_span {
    ($session_id:expr, $peer:expr) => {
        tracing::info_span!(
            "connection",
            session_id = %$session_id,
            peer = %$peer,
            pid = tracing::field::Empty,
            dest_addr = tracing::field::Empty,
            dialer = tracing::field::Empty,
            bytes_up = tracing::field::Empty,
            bytes_down = tracing::field::Empty,
        )
    };
}

/// Create a tracing span for one outbound dial attempt.
#[macro_export]
macro_rules! dial_span {
    ($dialer:expr, $dest:expr) => {
        tracing::debug_span!(
            "dial",
            dialer = %$dialer,
            dest_addr = %$dest,
            latency_ms = tracing::field::Empty,
        )
    };
}

/// Create a tracing span for the FIFO decode loop.
#[macro_export]
macro_rules! fifo_span {
    ($path:expr) => {
        tracing::info_span!(
            "fifo_decoder",
            path = %$path,
            records = tracing::field::Empty,
        )
    };
}
