//! Minimal braid demo: logging, a mounted sub-chain, a handler, a redirect
//! and a panicking endpoint that still leaves the server up.
//!
//! Run with:
//!   cargo run --example basic
//!
//! Try:
//!   curl -i http://localhost:3000/api/users/42
//!   curl -i http://localhost:3000/api/users/42 -H 'authorization: Bearer x'
//!   curl -i http://localhost:3000/old
//!   curl -i http://localhost:3000/boom
//!   curl -i http://localhost:3000/healthz
//!   curl -i http://localhost:3000/nowhere

use std::time::{Duration, Instant};

use braid::middleware::mount;
use braid::{combine, App, Context, Next, Server};
use http::{HeaderValue, StatusCode};

#[derive(Debug, PartialEq)]
struct UserKey;

#[tokio::main]
async fn main() -> Result<(), braid::Error> {
    tracing_subscriber::fmt::init();

    let mut app = App::new();
    app.push(access_log)
        .push(mount("/api", combine![authenticate, users]))
        .push(mount("/old", |ctx: Context, _next: Next| async move {
            let _ = ctx.redirect("/api/users/1").await;
        }))
        .push(mount("/boom", |_ctx: Context, _next: Next| async move {
            panic!("this request is doomed");
        }));
    app.use_handler(healthz);

    Server::bind("0.0.0.0:3000")
        .request_timeout(Duration::from_secs(15))
        .serve(app)
        .await
}

// Everything downstream runs inside `next.run`, so the timing covers it all.
async fn access_log(ctx: Context, next: Next) {
    let started = Instant::now();
    let path = ctx.req().path();
    next.run(ctx.clone()).await;
    tracing::info!(
        method = %ctx.req().method(),
        %path,
        status = ?ctx.status(),
        elapsed = ?started.elapsed(),
        "request",
    );
}

async fn authenticate(ctx: Context, next: Next) {
    match ctx.req().header("authorization") {
        Some(token) if token.starts_with("Bearer ") => {
            let user = token.trim_start_matches("Bearer ").to_owned();
            ctx.before(|headers| {
                headers.insert("x-authenticated", HeaderValue::from_static("1"));
            });
            next.run(ctx.with_value(UserKey, user)).await;
        }
        _ => {
            let _ = ctx.error(StatusCode::UNAUTHORIZED, "missing bearer token").await;
        }
    }
}

// Sees "/users/42" for a request to "/api/users/42".
async fn users(ctx: Context, next: Next) {
    let path = ctx.req().path();
    let Some(id) = path.strip_prefix("/users/") else {
        return next.run(ctx).await;
    };
    let user = ctx.value::<UserKey, String>(&UserKey).cloned().unwrap_or_default();

    ctx.set_header("content-type", HeaderValue::from_static("application/json"));
    let _ = ctx.write(format!(r#"{{"id":"{id}","requested_by":"{user}"}}"#)).await;
}

// A handler only answers for the path it knows; everything else falls through
// to the 404 fallback.
async fn healthz(ctx: Context) {
    if ctx.req().path() == "/healthz" {
        let _ = ctx.write("ok").await;
    }
}
