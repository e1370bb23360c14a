//! Middleware trait and the built-in combinators.
//!
//! A middleware receives the [`Context`] and a [`Next`] continuation. It
//! proceeds by running the continuation and stops by not running it:
//!
//! ```rust
//! use braid::{App, Context, Next};
//! use http::HeaderValue;
//!
//! let app = App::new()
//!     .with(|ctx: Context, next: Next| async move {
//!         ctx.set_header("x-powered-by", HeaderValue::from_static("braid"));
//!         next.run(ctx).await;
//!         // everything downstream has finished here
//!     })
//!     .with(|ctx: Context, _next: Next| async move {
//!         let _ = ctx.write("hello").await;
//!     });
//! ```
//!
//! There is no separate "after" pass. Code placed after `next.run(ctx).await`
//! runs once the rest of the chain is done, which gives the usual onion shape.
//!
//! Closures need their parameter types spelled out (`ctx: Context,
//! next: Next`) since the compiler only sees the [`Middleware`] bound.

mod combine;
mod mount;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::app::Next;
use crate::context::Context;

pub use crate::handler::{handler, Handler};
pub use combine::combine;
pub use mount::mount;

/// A heap-allocated, type-erased future driving one middleware invocation.
///
/// `Send + 'static` so the dispatcher can run the chain on its own task.
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// One unit of the request-handling chain.
///
/// Implemented for every `Fn(Context, Next) -> impl Future<Output = ()>` and
/// for [`App`](crate::App), so a whole chain nests as a single middleware.
pub trait Middleware: Send + Sync + 'static {
    fn call(&self, ctx: Context, next: Next) -> BoxFuture;
}

/// A type-erased middleware as stored in a chain link.
pub type BoxedMiddleware = Arc<dyn Middleware>;

impl<F, Fut> Middleware for F
where
    F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, ctx: Context, next: Next) -> BoxFuture {
        Box::pin(self(ctx, next))
    }
}
