//! The response-writing surface behind a [`Context`](crate::Context).
//!
//! The first `write_header` (explicit, or implied by the first `write`)
//! *commits the head*: pending hooks run, and status plus a snapshot of the
//! headers become the response hyper sends. From then on the body is a stream
//! fed by `write`. The dispatcher hands that response to hyper as soon as it
//! is committed, so the client gets the head and each chunk while the chain
//! is still running. Header edits after the commit never reach the wire.

use std::mem;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderMap, HeaderValue, X_CONTENT_TYPE_OPTIONS};
use http::StatusCode;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::error::Error;

/// Response body: either complete up front or streamed from the chain.
pub type Body = UnsyncBoxBody<Bytes, Error>;

/// What hyper gets back for every request.
pub type Response = http::Response<Body>;

/// A pre-write hook, see [`Context::before`](crate::Context::before).
pub(crate) type Hook = Box<dyn FnOnce(&mut HeaderMap) + Send + 'static>;

/// Chunks queued towards the connection before `write` waits for the client.
const QUEUED_FRAMES: usize = 16;

type BodySender = mpsc::Sender<Result<Frame<Bytes>, Error>>;

#[derive(Default)]
struct State {
    status: Option<StatusCode>,
    headers: HeaderMap,
    /// Snapshots of header maps currently lent to a closure, innermost last.
    lent: Vec<HeaderMap>,
    committed: bool,
    /// The committed response until the dispatcher picks it up.
    ready: Option<Response>,
    body: Option<BodySender>,
    on_commit: Option<oneshot::Sender<()>>,
    hooks: Vec<Hook>,
    hijacked: bool,
}

/// Shared by every view of one exchange.
///
/// The lock is never held while user code runs: hooks and header closures get
/// the map moved out to them, so they may call back into the context.
#[derive(Default)]
pub(crate) struct ResponseWriter {
    state: Mutex<State>,
}

impl ResponseWriter {
    pub(crate) fn status(&self) -> Option<StatusCode> {
        self.state.lock().status
    }

    pub(crate) fn written(&self) -> bool {
        self.state.lock().committed
    }

    /// Direct writes win; while the map is lent out, the lent snapshot answers.
    pub(crate) fn header(&self, name: &str) -> Option<HeaderValue> {
        let state = self.state.lock();
        state
            .headers
            .get(name)
            .or_else(|| state.lent.iter().rev().find_map(|lent| lent.get(name)))
            .cloned()
    }

    pub(crate) fn with_headers<R>(&self, f: impl FnOnce(&mut HeaderMap) -> R) -> R {
        let mut headers = {
            let mut state = self.state.lock();
            let headers = mem::take(&mut state.headers);
            state.lent.push(headers.clone());
            headers
        };
        let out = f(&mut headers);

        let mut state = self.state.lock();
        state.lent.pop();
        // Anything set through the context while `f` ran lands on top.
        let direct = mem::replace(&mut state.headers, headers);
        state.headers.extend(direct);
        out
    }

    pub(crate) fn before(&self, hook: Hook) {
        self.state.lock().hooks.push(hook);
    }

    pub(crate) fn write_header(&self, code: StatusCode) {
        let hooks = {
            let mut state = self.state.lock();
            if state.committed {
                warn!(ignored = %code, "superfluous write_header call");
                state.status = Some(code);
                return;
            }
            mem::take(&mut state.hooks)
        };

        if !hooks.is_empty() {
            self.with_headers(|headers| {
                for hook in hooks {
                    hook(headers);
                }
            });
        }

        let mut state = self.state.lock();
        state.status = Some(code);
        if state.committed {
            // A hook committed the head itself.
            return;
        }
        state.committed = true;

        let body = if code == StatusCode::SWITCHING_PROTOCOLS || state.hijacked {
            empty()
        } else {
            let (tx, rx) = mpsc::channel(QUEUED_FRAMES);
            state.body = Some(tx);
            StreamBody::new(ReceiverStream::new(rx)).boxed_unsync()
        };
        let mut response = http::Response::new(body);
        *response.status_mut() = code;
        *response.headers_mut() = state.headers.clone();
        state.ready = Some(response);

        if let Some(notify) = state.on_commit.take() {
            let _ = notify.send(());
        }
    }

    /// Sends `buf` as one body chunk, waiting while the client lags behind.
    pub(crate) async fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        if self.hijacked() {
            return Err(Error::Hijacked);
        }
        if !self.written() {
            self.write_header(StatusCode::OK);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let Some(body) = self.state.lock().body.clone() else {
            return Err(Error::Closed);
        };
        body.send(Ok(Frame::data(Bytes::copy_from_slice(buf))))
            .await
            .map_err(|_| Error::Closed)?;
        Ok(buf.len())
    }

    pub(crate) fn hijacked(&self) -> bool {
        self.state.lock().hijacked
    }

    pub(crate) fn mark_hijacked(&self) {
        self.state.lock().hijacked = true;
    }

    /// Resolves once the head is committed.
    pub(crate) fn on_commit(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        if state.committed {
            let _ = tx.send(());
        } else {
            state.on_commit = Some(tx);
        }
        rx
    }

    /// Moves the committed response out, committing a `200` head first if
    /// nothing was written. The body keeps streaming until
    /// [`close_body`](Self::close_body) or [`abort_body`](Self::abort_body).
    pub(crate) fn take(&self) -> Response {
        if !self.written() {
            self.write_header(StatusCode::OK);
        }
        match self.state.lock().ready.take() {
            Some(response) => response,
            None => {
                debug!("response already handed out");
                error_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    /// Ends the body stream cleanly. Later writes fail with
    /// [`Error::Closed`].
    pub(crate) fn close_body(&self) {
        self.state.lock().body = None;
    }

    /// Ends the body stream with an error, so the client sees a truncated
    /// response instead of a complete one.
    pub(crate) async fn abort_body(&self) {
        let body = self.state.lock().body.take();
        if let Some(body) = body {
            let _ = body.send(Err(Error::Aborted)).await;
        }
    }

    /// Drops whatever the chain committed. The exchange is over: later writes
    /// fail with [`Error::Closed`] instead of piling up unread.
    pub(crate) fn discard(&self) {
        let mut state = self.state.lock();
        state.committed = true;
        state.ready = None;
        state.body = None;
        state.on_commit = None;
    }

    /// Resolves when the receiving side of the body stream is gone.
    pub(crate) async fn body_closed(&self) {
        let body = self.state.lock().body.clone();
        match body {
            Some(body) => body.closed().await,
            None => std::future::pending().await,
        }
    }
}

fn full(bytes: Bytes) -> Body {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

fn empty() -> Body {
    full(Bytes::new())
}

/// Headers for a plain-text error body.
pub(crate) fn set_error_headers(headers: &mut HeaderMap) {
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
}

/// A standalone error response carrying only the canonical reason phrase.
///
/// Used when the chain cannot be trusted to have produced anything sensible;
/// nothing the chain wrote is included.
pub(crate) fn error_response(code: StatusCode) -> Response {
    let text = format!("{}\n", code.canonical_reason().unwrap_or("Error"));
    let mut response = http::Response::new(full(Bytes::from(text)));
    *response.status_mut() = code;
    set_error_headers(response.headers_mut());
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn finish(w: &ResponseWriter) -> (Response, String) {
        let res = w.take();
        w.close_body();
        let (parts, body) = res.into_parts();
        let bytes = body.collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        (http::Response::from_parts(parts, empty()), text)
    }

    #[tokio::test]
    async fn write_implies_ok_head() {
        let w = ResponseWriter::default();
        assert_eq!(w.write(b"foobar").await.unwrap(), 6);
        assert_eq!(w.status(), Some(StatusCode::OK));
        assert!(w.written());

        let (res, body) = finish(&w).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body, "foobar");
    }

    #[test]
    fn first_head_wins_but_status_tracks_latest() {
        let w = ResponseWriter::default();
        w.write_header(StatusCode::BAD_REQUEST);
        w.write_header(StatusCode::CREATED);
        assert_eq!(w.status(), Some(StatusCode::CREATED));
        assert_eq!(w.take().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn headers_after_commit_are_not_sent() {
        let w = ResponseWriter::default();
        w.with_headers(|h| h.insert("x-early", HeaderValue::from_static("1")));
        w.write(b"x").await.unwrap();
        w.with_headers(|h| h.insert("x-late", HeaderValue::from_static("1")));

        let res = w.take();
        assert!(res.headers().contains_key("x-early"));
        assert!(!res.headers().contains_key("x-late"));
    }

    #[tokio::test]
    async fn hooks_run_once_in_order_before_commit() {
        let w = ResponseWriter::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&calls);
        w.before(Box::new(move |h: &mut HeaderMap| {
            assert_eq!(c.fetch_add(1, Ordering::SeqCst), 0);
            h.insert("x-hook", HeaderValue::from_static("first"));
        }));
        let c = Arc::clone(&calls);
        w.before(Box::new(move |h: &mut HeaderMap| {
            assert_eq!(c.fetch_add(1, Ordering::SeqCst), 1);
            h.insert("x-hook", HeaderValue::from_static("second"));
        }));

        w.write_header(StatusCode::OK);
        w.write_header(StatusCode::OK);
        w.write(b"body").await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(w.take().headers()["x-hook"], "second");
    }

    #[test]
    fn lent_headers_stay_readable() {
        let w = ResponseWriter::default();
        w.with_headers(|h| h.insert("x-a", HeaderValue::from_static("1")));

        let seen = w.with_headers(|h| {
            h.insert("x-b", HeaderValue::from_static("2"));
            (w.header("x-a"), w.header("x-b"))
        });
        assert_eq!(seen, (Some(HeaderValue::from_static("1")), None));
        assert_eq!(w.header("x-b"), Some(HeaderValue::from_static("2")));
    }

    #[tokio::test]
    async fn untouched_writer_yields_empty_ok() {
        let w = ResponseWriter::default();
        assert_eq!(w.status(), None);

        let (res, body) = finish(&w).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body, "");
    }

    #[tokio::test]
    async fn head_is_available_before_the_body_ends() {
        let w = ResponseWriter::default();
        let committed = w.on_commit();

        w.write(b"first").await.unwrap();
        committed.await.unwrap();

        let mut body = w.take().into_body();
        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), "first");

        w.write(b"second").await.unwrap();
        w.close_body();
        let rest = body.collect().await.unwrap().to_bytes();
        assert_eq!(rest, "second");
    }

    #[tokio::test]
    async fn write_after_client_left_is_an_error() {
        let w = ResponseWriter::default();
        w.write_header(StatusCode::OK);
        drop(w.take());

        assert!(matches!(w.write(b"late").await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn aborted_body_fails_to_collect() {
        let w = ResponseWriter::default();
        w.write(b"partial").await.unwrap();
        let body = w.take().into_body();

        w.abort_body().await;
        assert!(matches!(body.collect().await, Err(Error::Aborted)));
    }

    #[test]
    fn switching_protocols_head_has_no_body_stream() {
        let w = ResponseWriter::default();
        w.mark_hijacked();
        w.write_header(StatusCode::SWITCHING_PROTOCOLS);
        assert!(w.state.lock().body.is_none());
        assert_eq!(w.take().status(), StatusCode::SWITCHING_PROTOCOLS);
    }

    #[tokio::test]
    async fn hijacked_writer_rejects_body() {
        let w = ResponseWriter::default();
        w.mark_hijacked();
        assert!(matches!(w.write(b"x").await, Err(Error::Hijacked)));
    }

    #[test]
    fn error_response_is_generic_text() {
        let res = error_response(StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(res.headers()[CONTENT_TYPE], "text/plain; charset=utf-8");
        assert_eq!(res.headers()[X_CONTENT_TYPE_OPTIONS], "nosniff");
    }
}
