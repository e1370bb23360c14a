//! Incoming HTTP request type.

use std::net::SocketAddr;

use bytes::Bytes;
use http::{HeaderMap, Method, Uri, Version};
use hyper::upgrade::OnUpgrade;
use parking_lot::Mutex;

/// An incoming HTTP request with its body already collected.
///
/// Everything is read-only except the *visible path*, which
/// [`mount`](crate::middleware::mount) rewrites while a mounted middleware
/// runs. [`uri`](Request::uri) always reports what the client sent.
pub struct Request {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    path: Mutex<String>,
    remote_addr: Option<SocketAddr>,
    upgrade: Mutex<Option<OnUpgrade>>,
}

impl Request {
    pub(crate) fn from_parts(parts: http::request::Parts, body: Bytes) -> Self {
        let http::request::Parts { method, uri, version, headers, mut extensions, .. } = parts;
        let path = uri.path().to_owned();
        Self {
            method,
            uri,
            version,
            headers,
            body,
            path: Mutex::new(path),
            remote_addr: None,
            upgrade: Mutex::new(extensions.remove::<OnUpgrade>()),
        }
    }

    pub(crate) fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn method(&self) -> &Method { &self.method }
    pub fn uri(&self) -> &Uri { &self.uri }
    pub fn version(&self) -> Version { self.version }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn body(&self) -> &[u8] { &self.body }
    pub fn query(&self) -> Option<&str> { self.uri.query() }

    /// Peer address, when the request came in over a socket.
    pub fn remote_addr(&self) -> Option<SocketAddr> { self.remote_addr }

    /// Case-insensitive header lookup. Non-UTF-8 values are skipped.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The path as seen from the current position in the chain.
    ///
    /// Equal to `uri().path()` unless a [`mount`](crate::middleware::mount)
    /// prefix is currently stripped.
    pub fn path(&self) -> String {
        self.path.lock().clone()
    }

    pub(crate) fn set_path(&self, path: String) {
        *self.path.lock() = path;
    }

    pub(crate) fn take_upgrade(&self) -> Option<OnUpgrade> {
        self.upgrade.lock().take()
    }
}

/// Builds a request from a fully buffered `http::Request`.
///
/// Handy for driving an [`App`](crate::App) without a socket:
///
/// ```rust
/// let req = braid::Request::from(
///     http::Request::get("/users/42").body(bytes::Bytes::new()).unwrap(),
/// );
/// assert_eq!(req.path(), "/users/42");
/// ```
impl From<http::Request<Bytes>> for Request {
    fn from(req: http::Request<Bytes>) -> Self {
        let (parts, body) = req.into_parts();
        Self::from_parts(parts, body)
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("path", &*self.path.lock())
            .finish_non_exhaustive()
    }
}
