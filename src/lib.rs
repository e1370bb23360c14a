//! # braid
//!
//! A minimal HTTP middleware chain for Rust services.
//! You register middlewares in order; each one decides whether the rest of
//! the chain runs.
//!
//! ## The contract
//!
//! A middleware is `async fn(Context, Next)`. Calling `next.run(ctx).await`
//! proceeds; returning without it stops the chain. Code after the call runs
//! once everything downstream has finished. That is the entire model.
//!
//! What braid leaves to other middlewares, written the same way:
//!
//! - **Routing**: match on `ctx.req().method()` / `ctx.req().path()`
//! - **Sessions, cookies, templates, static files**: plain middlewares
//!
//! What braid does:
//!
//! - Singly linked chain, O(1) append, per-request continuation
//! - [`combine!`] and [`middleware::mount`] to build reusable pieces
//! - Streaming responses: the head goes out on the first write
//! - A panic in the chain answers `500`; the process keeps serving
//! - Cancellation and deadlines through the context's token
//! - Graceful shutdown on SIGTERM / Ctrl-C, optional TLS
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use braid::middleware::mount;
//! use braid::{App, Context, Next};
//! use http::StatusCode;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), braid::Error> {
//!     let app = App::new()
//!         .with(log)
//!         .with(mount("/admin", require_token))
//!         .with(hello);
//!
//!     app.run("0.0.0.0:3000").await
//! }
//!
//! async fn log(ctx: Context, next: Next) {
//!     let path = ctx.req().path();
//!     next.run(ctx.clone()).await;
//!     tracing::info!(%path, status = ?ctx.status(), "served");
//! }
//!
//! async fn require_token(ctx: Context, next: Next) {
//!     if ctx.req().header("authorization").is_none() {
//!         let _ = ctx.error(StatusCode::UNAUTHORIZED, "missing token").await;
//!         return;
//!     }
//!     next.run(ctx).await;
//! }
//!
//! async fn hello(ctx: Context, _next: Next) {
//!     let _ = ctx.write("hello").await;
//! }
//! ```

mod app;
mod context;
mod dispatch;
mod error;
mod handler;
mod request;
mod response;
mod scope;
mod server;
mod tls;

pub mod middleware;

pub use app::{App, Next};
pub use context::Context;
pub use error::Error;
pub use handler::Handler;
pub use middleware::{combine, BoxFuture, Middleware};
pub use request::Request;
pub use response::{Body, Response};
pub use scope::Scope;
pub use server::{Server, DEFAULT_MAX_BODY_SIZE};
