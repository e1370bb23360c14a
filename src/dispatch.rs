//! Per-request entry point.
//!
//! Every request moves through one small state machine:
//!
//! ```text
//! Pending ──spawn──▶ Running ──┬──▶ Completed   chain returned; send what it wrote
//!                              ├──▶ Streaming   head committed; send it, keep following
//!                              ├──▶ Faulted     chain panicked; 500, log the panic
//!                              └──▶ Cancelled   token fired / deadline hit; 500
//! ```
//!
//! The chain runs on its own tokio task. A panic unwinds that task only and
//! comes back as a [`JoinError`]; the server loop never sees it. Once the head
//! is committed the response goes to hyper right away and a follower task
//! watches the rest of the chain: a fault or cancellation from then on can no
//! longer become a `500`, so the body is aborted instead. Cancellation is
//! cooperative; an abandoned chain runs to its end and its writes fail.

use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, warn, Instrument};

use crate::app::{App, Next};
use crate::context::Context;
use crate::request::Request;
use crate::response::{error_response, Response};
use crate::scope::Scope;

enum Outcome {
    Completed,
    Streaming,
    Faulted(String),
    Cancelled(&'static str),
}

impl App {
    /// Runs one request through the chain and returns the response to send.
    ///
    /// Returns as soon as the head is committed; the body streams whatever
    /// the chain writes afterwards. An exhausted chain answers
    /// `404 Not Found`. This is what the [`Server`](crate::Server) calls per
    /// request; tests can call it directly.
    pub async fn handle(self: Arc<Self>, request: Request) -> Response {
        dispatch(self, request, None).await
    }
}

pub(crate) async fn dispatch(app: Arc<App>, request: Request, timeout: Option<Duration>) -> Response {
    let token = CancellationToken::new();
    // Released on every way out of the exchange, including hyper dropping
    // this future when the client goes away.
    let release = token.clone().drop_guard();
    let deadline = timeout.map(|timeout| Instant::now() + timeout);

    let ctx = Context::new(request, Scope::with_token(token.clone()));
    let method = ctx.req().method().clone();
    let path = ctx.req().path();
    let span = tracing::debug_span!("request", %method, %path);

    let committed = ctx.on_commit();
    let chain = {
        let ctx = ctx.clone();
        async move { app.execute(ctx, Next::terminal(not_found)).await }
    };
    let mut task = tokio::spawn(chain.instrument(span));

    let outcome = tokio::select! {
        biased;

        joined = &mut task => settle(joined),
        Ok(()) = committed => Outcome::Streaming,
        () = token.cancelled() => Outcome::Cancelled("cancelled"),
        () = expired(deadline) => Outcome::Cancelled("deadline exceeded"),
    };

    match outcome {
        Outcome::Completed => {
            let response = ctx.finish();
            debug!(%method, %path, status = %response.status(), "request completed");
            response
        }
        Outcome::Streaming => {
            let response = ctx.take_response();
            debug!(%method, %path, status = %response.status(), "head committed, streaming");
            let follower = Follower { ctx, token, release, deadline, method, path };
            tokio::spawn(follower.follow(task));
            response
        }
        Outcome::Faulted(message) => {
            error!(%method, %path, "PANIC: {message}");
            ctx.discard_response();
            error_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
        Outcome::Cancelled(cause) => {
            warn!(%method, %path, cause, "request aborted before the chain finished");
            ctx.discard_response();
            error_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Watches a chain whose head is already on its way to the client.
struct Follower {
    ctx: Context,
    token: CancellationToken,
    release: DropGuard,
    deadline: Option<Instant>,
    method: Method,
    path: String,
}

impl Follower {
    async fn follow(self, task: JoinHandle<()>) {
        let Self { ctx, token, release, deadline, method, path } = self;

        let outcome = tokio::select! {
            biased;

            joined = task => settle(joined),
            () = token.cancelled() => Outcome::Cancelled("cancelled"),
            () = ctx.body_closed() => Outcome::Cancelled("client went away"),
            () = expired(deadline) => Outcome::Cancelled("deadline exceeded"),
        };

        // Whoever sees the body end also sees the token cancelled.
        drop(release);

        match outcome {
            Outcome::Completed | Outcome::Streaming => {
                debug!(%method, %path, "response stream completed");
                ctx.close_body();
            }
            Outcome::Faulted(message) => {
                error!(%method, %path, "PANIC after the head was sent: {message}");
                ctx.abort_body().await;
            }
            Outcome::Cancelled(cause) => {
                warn!(%method, %path, cause, "response stream aborted");
                ctx.abort_body().await;
            }
        }
    }
}

fn settle(joined: Result<(), JoinError>) -> Outcome {
    match joined {
        Ok(()) => Outcome::Completed,
        Err(e) => Outcome::Faulted(fault_message(e)),
    }
}

async fn not_found(ctx: Context) {
    if let Err(e) = ctx.error(StatusCode::NOT_FOUND, "404 page not found").await {
        debug!("not found fallback: {e}");
    }
}

async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn fault_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
