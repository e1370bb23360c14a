//! Handlers: endpoints that write a response but know nothing of the chain.
//!
//! A [`Handler`] is the shape most existing request handlers already have:
//! it gets the request, writes to the response, returns. Wrapped with
//! [`handler`], it behaves as a middleware:
//!
//! ```text
//! handler(h)  ──▶  h.serve(ctx)
//!                     │
//!                     ├─ response written?  yes ─▶ stop, h was terminal
//!                     └─                    no  ─▶ next.run(ctx)
//! ```
//!
//! So a static-file handler that only answers for files it actually has can
//! sit in the middle of a chain and fall through for everything else.

use std::future::Future;
use std::sync::Arc;

use crate::app::Next;
use crate::context::Context;
use crate::middleware::{BoxFuture, Middleware};

/// An endpoint that writes through the [`Context`] and returns.
///
/// Implemented for every `Fn(Context) -> impl Future<Output = ()>`.
pub trait Handler: Send + Sync + 'static {
    fn serve(&self, ctx: Context) -> BoxFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn serve(&self, ctx: Context) -> BoxFuture {
        Box::pin(self(ctx))
    }
}

/// Adapts `h` into a middleware that proceeds only when `h` left the
/// response unwritten.
pub fn handler(h: impl Handler) -> impl Middleware {
    let h = Arc::new(h);
    move |ctx: Context, next: Next| {
        let h = Arc::clone(&h);
        async move {
            h.serve(ctx.clone()).await;
            if !ctx.written() {
                next.run(ctx).await;
            }
        }
    }
}
