//! The middleware chain and its continuation.
//!
//! # How a chain runs
//!
//! Links form a singly linked list. Running the chain means handing the first
//! middleware a [`Next`] that points at the second link; that middleware
//! decides whether to run it. When the list is exhausted, `Next` runs the
//! terminal fallback instead.
//!
//! ```text
//! first ──▶ [logger] ──▶ [mount /api] ──▶ [auth] ──▶ (terminal: 404)
//!              │  next.run ▲    │  next.run ▲
//!              └───────────┘    └───────────┘
//! ```
//!
//! Each `Next` carries its own pointer into the list, so nothing about the
//! traversal is shared between requests or between continuations.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use crate::context::Context;
use crate::handler::{handler, Handler};
use crate::middleware::{BoxFuture, BoxedMiddleware, Middleware};

struct Link {
    middleware: BoxedMiddleware,
    /// Filled exactly once, when the following link is appended.
    next: OnceLock<Arc<Link>>,
}

type Terminal = Arc<dyn Fn(Context) -> BoxFuture + Send + Sync>;

#[derive(Clone)]
enum Done {
    Terminal(Terminal),
    Resume(Box<Next>),
}

/// The rest of the chain, as seen from the middleware holding it.
///
/// Running a `Next` consumes it, so a middleware proceeds at most once by
/// construction. `Next` is `Clone`: running a clone re-runs everything
/// downstream from the same link, which is occasionally useful (retries) and
/// never corrupts the chain.
#[derive(Clone)]
pub struct Next {
    link: Option<Arc<Link>>,
    done: Done,
}

impl Next {
    /// A continuation with no links left: running it calls `f`.
    ///
    /// This is how a chain gets its fallback, see [`App::execute`].
    pub fn terminal<F, Fut>(f: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let terminal: Terminal = Arc::new(move |ctx: Context| -> BoxFuture { Box::pin(f(ctx)) });
        Self { link: None, done: Done::Terminal(terminal) }
    }

    /// Hands `ctx` to the next link, or to the fallback when none is left.
    pub fn run(self, ctx: Context) -> BoxFuture {
        match self.link {
            Some(link) => {
                let next = Next { link: link.next.get().cloned(), done: self.done };
                link.middleware.call(ctx, next)
            }
            None => match self.done {
                Done::Terminal(f) => f(ctx),
                Done::Resume(next) => next.run(ctx),
            },
        }
    }
}

/// An ordered, append-only chain of middlewares.
///
/// Build it once at startup; pass it to [`Server::serve`](crate::Server::serve)
/// or [`App::run`]. [`App::with`] returns `self` so registrations chain
/// naturally. An `App` is itself a [`Middleware`]: nested, it runs its own
/// links and then continues with the enclosing chain.
pub struct App {
    first: Option<Arc<Link>>,
    last: Option<Arc<Link>>,
}

impl App {
    pub fn new() -> Self {
        Self { first: None, last: None }
    }

    /// Appends `middleware` to the end of the chain. O(1).
    pub fn push(&mut self, middleware: impl Middleware) -> &mut Self {
        let link = Arc::new(Link {
            middleware: Arc::new(middleware),
            next: OnceLock::new(),
        });

        match self.last.replace(Arc::clone(&link)) {
            Some(tail) => {
                let appended = tail.next.set(link).is_ok();
                debug_assert!(appended, "tail link already had a successor");
            }
            None => self.first = Some(link),
        }
        self
    }

    /// Appends `middleware` and returns `self` for chaining.
    pub fn with(mut self, middleware: impl Middleware) -> Self {
        self.push(middleware);
        self
    }

    /// Appends a [`Handler`], see [`handler`](crate::middleware::handler).
    pub fn use_handler(&mut self, h: impl Handler) -> &mut Self {
        self.push(handler(h))
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    /// Runs the chain against `ctx`. Once the last link proceeds, `done`
    /// runs.
    pub fn execute(&self, ctx: Context, done: Next) -> BoxFuture {
        Next { link: self.first.clone(), done: Done::Resume(Box::new(done)) }.run(ctx)
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl Middleware for App {
    fn call(&self, ctx: Context, next: Next) -> BoxFuture {
        self.execute(ctx, next)
    }
}
