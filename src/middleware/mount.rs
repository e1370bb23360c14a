use std::sync::Arc;

use crate::app::Next;
use crate::context::Context;
use crate::middleware::Middleware;

/// Restricts `middleware` to requests under `prefix`.
///
/// A request matches when its path equals `prefix` or starts with
/// `prefix + "/"` (a trailing `/` on `prefix` is ignored). On a match the
/// prefix is stripped from [`Request::path`](crate::Request::path) (`"/"` if
/// nothing is left) while `middleware` runs; the original path is back in
/// place before its continuation proceeds, and again once `middleware`
/// returns, whether or not it proceeded. Other requests skip `middleware`.
///
/// ```rust
/// use braid::{middleware::mount, App, Context, Next};
///
/// let assets = |ctx: Context, _next: Next| async move {
///     // "/assets/app.css" arrives here as "/app.css"
///     let _ = ctx.write(ctx.req().path()).await;
/// };
///
/// let app = App::new().with(mount("/assets", assets));
/// ```
pub fn mount(prefix: &str, middleware: impl Middleware) -> impl Middleware {
    let prefix: Arc<str> = prefix.strip_suffix('/').unwrap_or(prefix).into();
    let middleware = Arc::new(middleware);

    move |ctx: Context, next: Next| {
        let prefix = Arc::clone(&prefix);
        let middleware = Arc::clone(&middleware);
        async move {
            let original = ctx.req().path();
            let Some(inner) = strip_prefix(&original, &prefix) else {
                return next.run(ctx).await;
            };

            ctx.req().set_path(inner);
            let restore = {
                let original = original.clone();
                Next::terminal(move |ctx: Context| {
                    ctx.req().set_path(original.clone());
                    next.clone().run(ctx)
                })
            };

            middleware.call(ctx.clone(), restore).await;
            ctx.req().set_path(original);
        }
    }
}

fn strip_prefix(path: &str, prefix: &str) -> Option<String> {
    match path.strip_prefix(prefix)? {
        "" => Some("/".to_owned()),
        rest if rest.starts_with('/') => Some(rest.to_owned()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use parking_lot::Mutex;

    use crate::app::App;
    use crate::request::Request;
    use crate::scope::Scope;

    type Seen = Arc<Mutex<Vec<String>>>;

    fn context(path: &str) -> Context {
        let req = http::Request::get(path).body(Bytes::new()).unwrap();
        Context::new(Request::from(req), Scope::background())
    }

    /// Records the visible path, then proceeds or not.
    fn recorder(seen: &Seen, label: &'static str, proceed: bool) -> impl Middleware {
        let seen = Arc::clone(seen);
        move |ctx: Context, next: Next| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().push(format!("{label}:{}", ctx.req().path()));
                if proceed {
                    next.run(ctx).await;
                }
            }
        }
    }

    fn terminal(seen: &Seen) -> Next {
        let seen = Arc::clone(seen);
        Next::terminal(move |ctx: Context| {
            let seen = Arc::clone(&seen);
            async move { seen.lock().push(format!("done:{}", ctx.req().path())) }
        })
    }

    #[test]
    fn prefix_matching() {
        assert_eq!(strip_prefix("/foo", "/foo").as_deref(), Some("/"));
        assert_eq!(strip_prefix("/foo/", "/foo").as_deref(), Some("/"));
        assert_eq!(strip_prefix("/foo/bar", "/foo").as_deref(), Some("/bar"));
        assert_eq!(strip_prefix("/foobar", "/foo"), None);
        assert_eq!(strip_prefix("/bar", "/foo"), None);
        assert_eq!(strip_prefix("/anything", "").as_deref(), Some("/anything"));
    }

    #[tokio::test]
    async fn strips_inside_and_restores_on_proceed() {
        let seen = Seen::default();
        let app = App::new()
            .with(mount("/foo", recorder(&seen, "inner", true)))
            .with(recorder(&seen, "after", true));

        let ctx = context("/foo/bar");
        app.execute(ctx.clone(), terminal(&seen)).await;

        assert_eq!(*seen.lock(), ["inner:/bar", "after:/foo/bar", "done:/foo/bar"]);
        assert_eq!(ctx.req().path(), "/foo/bar");
    }

    #[tokio::test]
    async fn exact_prefix_becomes_root() {
        let seen = Seen::default();
        let app = App::new().with(mount("/foo/", recorder(&seen, "inner", false)));

        app.execute(context("/foo"), terminal(&seen)).await;
        assert_eq!(*seen.lock(), ["inner:/"]);
    }

    #[tokio::test]
    async fn non_matching_request_skips_middleware() {
        let seen = Seen::default();
        let app = App::new()
            .with(mount("/bar", recorder(&seen, "bar", true)))
            .with(mount("/foo", recorder(&seen, "foo", false)));

        app.execute(context("/foo/bar"), terminal(&seen)).await;
        assert_eq!(*seen.lock(), ["foo:/bar"]);
    }

    #[tokio::test]
    async fn path_is_restored_when_inner_stops() {
        let seen = Seen::default();
        let outer = {
            let seen = Arc::clone(&seen);
            move |ctx: Context, next: Next| {
                let seen = Arc::clone(&seen);
                async move {
                    next.run(ctx.clone()).await;
                    seen.lock().push(format!("outer:after:{}", ctx.req().path()));
                }
            }
        };
        let app = App::new()
            .with(outer)
            .with(mount("/api", recorder(&seen, "inner", false)));

        let ctx = context("/api/v1");
        app.execute(ctx.clone(), terminal(&seen)).await;

        assert_eq!(*seen.lock(), ["inner:/v1", "outer:after:/api/v1"]);
        assert_eq!(ctx.req().path(), "/api/v1");
    }

    #[tokio::test]
    async fn nested_mounts_strip_cumulatively() {
        let seen = Seen::default();
        let app = App::new().with(mount("/api", mount("/v1", recorder(&seen, "inner", true))));

        let ctx = context("/api/v1/users");
        app.execute(ctx.clone(), terminal(&seen)).await;

        assert_eq!(*seen.lock(), ["inner:/users", "done:/api/v1/users"]);
        assert_eq!(ctx.req().uri().path(), "/api/v1/users");
    }
}
