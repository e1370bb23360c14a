use crate::app::App;
use crate::middleware::Middleware;

/// Bundles `middlewares` into one reusable middleware.
///
/// The result is an [`App`] whose terminal is the enclosing continuation, so
/// using it is indistinguishable from inlining its members at that position.
/// Use the [`combine!`](crate::combine!) macro for middlewares of different
/// types.
pub fn combine<I>(middlewares: I) -> App
where
    I: IntoIterator,
    I::Item: Middleware,
{
    middlewares.into_iter().fold(App::new(), |app, middleware| app.with(middleware))
}

/// Bundles middlewares of arbitrary types into one [`App`].
///
/// ```rust
/// use braid::{combine, App, Context, Next};
///
/// let auth = |ctx: Context, next: Next| async move { next.run(ctx).await };
/// let audit = |ctx: Context, next: Next| async move { next.run(ctx).await };
///
/// let app = App::new().with(combine![auth, audit]);
/// ```
#[macro_export]
macro_rules! combine {
    ($($middleware:expr),* $(,)?) => {
        $crate::App::new()$(.with($middleware))*
    };
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use parking_lot::Mutex;

    use crate::app::{App, Next};
    use crate::context::Context;
    use crate::middleware::Middleware;
    use crate::request::Request;
    use crate::scope::Scope;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn step(log: &Log, name: &'static str, proceed: bool) -> impl Middleware + Clone {
        let log = Arc::clone(log);
        move |ctx: Context, next: Next| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(name);
                if proceed {
                    next.run(ctx).await;
                }
            }
        }
    }

    fn done(log: &Log) -> Next {
        let log = Arc::clone(log);
        Next::terminal(move |_ctx| {
            let log = Arc::clone(&log);
            async move { log.lock().push("done") }
        })
    }

    async fn run(app: &App, log: &Log) -> Vec<&'static str> {
        let req = http::Request::get("/").body(Bytes::new()).unwrap();
        let ctx = Context::new(Request::from(req), Scope::background());
        app.execute(ctx, done(log)).await;
        std::mem::take(&mut *log.lock())
    }

    #[tokio::test]
    async fn combined_short_circuit_stops_enclosing_chain() {
        let log = Log::default();
        let app = App::new()
            .with(crate::combine![
                step(&log, "first", true),
                step(&log, "second", false),
                step(&log, "third", true),
            ])
            .with(step(&log, "after", true));

        assert_eq!(run(&app, &log).await, ["first", "second"]);
    }

    #[tokio::test]
    async fn combined_equals_inlined() {
        let log = Log::default();
        for stop_at in [None, Some(0), Some(1), Some(2)] {
            let members = ["a", "b", "c"].map(|name| {
                let proceed = Some(name) != stop_at.map(|i| ["a", "b", "c"][i]);
                step(&log, name, proceed)
            });

            let inlined = App::new()
                .with(step(&log, "head", true))
                .with(members[0].clone())
                .with(members[1].clone())
                .with(members[2].clone())
                .with(step(&log, "tail", true));
            let combined = App::new()
                .with(step(&log, "head", true))
                .with(super::combine(members))
                .with(step(&log, "tail", true));

            assert_eq!(run(&inlined, &log).await, run(&combined, &log).await, "stop at {stop_at:?}");
        }
    }

    #[tokio::test]
    async fn empty_combination_is_transparent() {
        let log = Log::default();
        let app = App::new()
            .with(step(&log, "a", true))
            .with(crate::combine![])
            .with(step(&log, "b", true));

        assert_eq!(run(&app, &log).await, ["a", "b", "done"]);
    }
}
