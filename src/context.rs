//! Per-request context.
//!
//! A [`Context`] is a cheap handle. Cloning it, or deriving a new one with
//! [`evolve`](Context::evolve) / [`with_value`](Context::with_value), yields
//! another view of the *same* exchange: request, status cell, headers, body
//! stream and pre-write hooks are shared. Only the [`Scope`] differs between
//! views.

use std::fmt;
use std::sync::Arc;

use http::header::{HeaderMap, HeaderValue, IntoHeaderName, CONTENT_TYPE, LOCATION};
use http::{Method, StatusCode};
use hyper::upgrade::OnUpgrade;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::request::Request;
use crate::response::{set_error_headers, Response, ResponseWriter};
use crate::scope::Scope;

struct Exchange {
    request: Request,
    response: ResponseWriter,
}

/// Request, response surface, cancellation and scoped values for one exchange.
#[derive(Clone)]
pub struct Context {
    exchange: Arc<Exchange>,
    scope: Scope,
}

impl Context {
    /// Creates a context for `request` rooted at `scope`.
    ///
    /// The dispatcher does this for every request; call it yourself to drive
    /// an [`App`](crate::App) by hand, e.g. through
    /// [`App::execute`](crate::App::execute).
    pub fn new(request: Request, scope: Scope) -> Self {
        Self {
            exchange: Arc::new(Exchange { request, response: ResponseWriter::default() }),
            scope,
        }
    }

    pub fn req(&self) -> &Request {
        &self.exchange.request
    }

    // ── Response surface ──────────────────────────────────────────────────────

    /// Sets a response header, replacing any previous value.
    ///
    /// Has no effect on the wire once the head is committed.
    pub fn set_header<K: IntoHeaderName>(&self, name: K, value: HeaderValue) {
        self.headers_mut(|headers| {
            headers.insert(name, value);
        });
    }

    /// Current value of a response header.
    ///
    /// Inside a [`before`](Context::before) hook or a
    /// [`headers_mut`](Context::headers_mut) closure this reports the map as
    /// it was when the closure started, plus anything set directly through
    /// the context since; edits the closure makes to its `&mut HeaderMap` show
    /// up once it returns.
    pub fn header(&self, name: &str) -> Option<HeaderValue> {
        self.exchange.response.header(name)
    }

    /// Gives `f` mutable access to the response headers.
    pub fn headers_mut<R>(&self, f: impl FnOnce(&mut HeaderMap) -> R) -> R {
        self.exchange.response.with_headers(f)
    }

    /// Records `code` and, on the first call, commits the head.
    ///
    /// Hooks registered with [`before`](Context::before) run first, in
    /// registration order. Later calls only update [`status`](Context::status);
    /// the committed head keeps the first code.
    pub fn write_header(&self, code: StatusCode) {
        self.exchange.response.write_header(code);
    }

    /// Sends `buf` as the next body chunk, committing a `200 OK` head first
    /// if no status was written yet.
    ///
    /// Waits while the client is behind. Fails with [`Error::Closed`] once
    /// the client is gone and with [`Error::Hijacked`] after
    /// [`hijack`](Context::hijack).
    pub async fn write(&self, buf: impl AsRef<[u8]>) -> Result<usize, Error> {
        self.exchange.response.write(buf.as_ref()).await
    }

    /// Registers a hook to run once, right before the head is committed.
    ///
    /// The usual job of a hook is a last-moment header, like a session cookie
    /// that must reflect whatever downstream middlewares did.
    pub fn before(&self, hook: impl FnOnce(&mut HeaderMap) + Send + 'static) {
        self.exchange.response.before(Box::new(hook));
    }

    /// Status of the most recent [`write_header`](Context::write_header), or
    /// `None` while nothing has been written.
    pub fn status(&self) -> Option<StatusCode> {
        self.exchange.response.status()
    }

    /// Whether the head has been committed.
    pub fn written(&self) -> bool {
        self.exchange.response.written()
    }

    /// Replies with `302 Found` pointing at `location`.
    ///
    /// GET and HEAD requests also get a tiny HTML body, as browsers expect.
    pub async fn redirect(&self, location: &str) -> Result<(), Error> {
        let value = HeaderValue::try_from(location)?;
        let with_body = matches!(*self.req().method(), Method::GET | Method::HEAD);

        self.headers_mut(|headers| {
            headers.insert(LOCATION, value);
            if with_body {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
            }
        });
        self.write_header(StatusCode::FOUND);

        if with_body {
            self.write(format!("<a href=\"{}\">Found</a>.\n", html_escape(location))).await?;
        }
        Ok(())
    }

    /// Replies with `code` and a plain-text `message`.
    pub async fn error(&self, code: StatusCode, message: &str) -> Result<(), Error> {
        self.headers_mut(set_error_headers);
        self.write_header(code);
        self.write(format!("{message}\n")).await?;
        Ok(())
    }

    /// Takes over the connection for a protocol upgrade.
    ///
    /// Set the `upgrade` / `connection` response headers first. Unless a head
    /// was already written, this commits `101 Switching Protocols`; the
    /// returned future resolves to the raw I/O once hyper has sent it. Body
    /// writes fail with [`Error::Hijacked`] from here on.
    ///
    /// Fails with [`Error::HijackUnsupported`] when the transport offers no
    /// upgrade (HTTP/2, requests without `Upgrade`, requests built by hand),
    /// and with [`Error::Hijacked`] when the connection was already taken.
    pub fn hijack(&self) -> Result<OnUpgrade, Error> {
        match self.req().take_upgrade() {
            Some(upgrade) => {
                self.exchange.response.mark_hijacked();
                if !self.written() {
                    self.write_header(StatusCode::SWITCHING_PROTOCOLS);
                }
                Ok(upgrade)
            }
            None if self.exchange.response.hijacked() => Err(Error::Hijacked),
            None => Err(Error::HijackUnsupported),
        }
    }

    // ── Scope ─────────────────────────────────────────────────────────────────

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Another view of this exchange rooted at `scope`.
    pub fn evolve(&self, scope: Scope) -> Self {
        Self { exchange: Arc::clone(&self.exchange), scope }
    }

    /// Another view of this exchange carrying one more value.
    ///
    /// Pass the result to `next.run(...)` to make the value visible
    /// downstream; `self` does not see it.
    pub fn with_value<K, V>(&self, key: K, value: V) -> Self
    where
        K: PartialEq + fmt::Debug + Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        self.evolve(self.scope.with_value(key, value))
    }

    pub fn value<K, V>(&self, key: &K) -> Option<&V>
    where
        K: PartialEq + 'static,
        V: 'static,
    {
        self.scope.value(key)
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        self.scope.token()
    }

    /// Cancels this context's scope.
    ///
    /// On the context handed out by the dispatcher, and on every view sharing
    /// its token, this aborts the exchange: the client gets a `500`, or a
    /// truncated body if the head was already sent.
    pub fn cancel(&self) {
        self.scope.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.scope.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.scope.cancelled().await;
    }

    // ── Dispatcher side ───────────────────────────────────────────────────────

    pub(crate) fn on_commit(&self) -> oneshot::Receiver<()> {
        self.exchange.response.on_commit()
    }

    /// The committed response; its body keeps streaming what the chain writes.
    pub(crate) fn take_response(&self) -> Response {
        self.exchange.response.take()
    }

    /// The response of a chain that has returned, body complete.
    pub(crate) fn finish(&self) -> Response {
        let response = self.exchange.response.take();
        self.exchange.response.close_body();
        response
    }

    pub(crate) fn close_body(&self) {
        self.exchange.response.close_body();
    }

    pub(crate) fn discard_response(&self) {
        self.exchange.response.discard();
    }

    pub(crate) async fn abort_body(&self) {
        self.exchange.response.abort_body().await;
    }

    pub(crate) async fn body_closed(&self) {
        self.exchange.response.body_closed().await;
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("method", self.req().method())
            .field("path", &self.req().path())
            .field("status", &self.status())
            .field("scope", &self.scope)
            .finish()
    }
}

fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
