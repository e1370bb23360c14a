//! Unified error type.

/// The error type returned by braid's fallible operations.
///
/// Application-level failures (404, 500, etc.) are expressed as HTTP
/// responses written through the [`Context`](crate::Context), not as `Error`s.
/// This type surfaces transport and infrastructure failures: binding a port,
/// loading TLS material, writing to a connection that is no longer ours.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls: {0}")]
    Tls(String),

    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),

    /// The connection was taken over through [`Context::hijack`](crate::Context::hijack);
    /// the response body can no longer be written.
    #[error("connection has been hijacked")]
    Hijacked,

    /// The client is gone, or the chain already finished its response.
    #[error("response stream is closed")]
    Closed,

    /// The chain failed after the head was sent; the body ends early.
    #[error("response aborted before completion")]
    Aborted,

    /// The underlying transport cannot hand out the raw connection
    /// (HTTP/2 streams, synthetic requests built in tests, ...).
    #[error("connection does not support hijacking")]
    HijackUnsupported,
}

impl From<tokio_rustls::rustls::Error> for Error {
    fn from(e: tokio_rustls::rustls::Error) -> Self {
        Self::Tls(e.to_string())
    }
}
