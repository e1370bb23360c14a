//! Cancellation and request-scoped values.
//!
//! A [`Scope`] is the part of a [`Context`](crate::Context) that flows
//! *down* the chain: a cancellation token and an immutable list of key/value
//! bindings. Adding a value never mutates the scope it came from; it creates a
//! new node pointing at its parent, so upstream middlewares keep seeing exactly
//! what they saw before.
//!
//! ```text
//! Background ← ("user", alice) ← ("request-id", 42)
//!                                      ↑ lookups start here and walk left
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Cancellation token plus value lineage.
///
/// Cloning is cheap: one token clone and one `Arc` increment.
#[derive(Clone)]
pub struct Scope {
    token: CancellationToken,
    values: Option<Arc<Binding>>,
}

struct Binding {
    key: Box<dyn Any + Send + Sync>,
    label: String,
    value: Box<dyn Any + Send + Sync>,
    parent: Option<Arc<Binding>>,
}

impl Scope {
    /// A root scope: no values, never cancelled unless [`cancel`](Scope::cancel)
    /// is called on it.
    pub fn background() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// A root scope driven by an existing token.
    pub fn with_token(token: CancellationToken) -> Self {
        Self { token, values: None }
    }

    /// Same values, cancellation token derived from this one.
    ///
    /// Cancelling the parent cancels the child; cancelling the child leaves
    /// the parent untouched.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            values: self.values.clone(),
        }
    }

    /// Returns a new scope carrying one more binding. `self` is unchanged.
    ///
    /// Keys are compared by type *and* value, so two unrelated key types never
    /// collide even if they compare equal in spirit. A later binding for an
    /// equal key shadows the earlier one.
    pub fn with_value<K, V>(&self, key: K, value: V) -> Self
    where
        K: PartialEq + fmt::Debug + Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        let label = format!("{key:?}");
        Self {
            token: self.token.clone(),
            values: Some(Arc::new(Binding {
                key: Box::new(key),
                label,
                value: Box::new(value),
                parent: self.values.clone(),
            })),
        }
    }

    /// Looks `key` up, newest binding first.
    ///
    /// Returns `None` when the key is unbound, or when the nearest binding for
    /// it holds a value of another type than `V`.
    pub fn value<K, V>(&self, key: &K) -> Option<&V>
    where
        K: PartialEq + 'static,
        V: 'static,
    {
        let mut node = self.values.as_deref();
        while let Some(binding) = node {
            if binding.key.downcast_ref::<K>() == Some(key) {
                return binding.value.downcast_ref::<V>();
            }
            node = binding.parent.as_deref();
        }
        None
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::background()
    }
}

/// Renders the lineage root-first, e.g. `Background.WithValue("foo")`.
impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut labels = Vec::new();
        let mut node = self.values.as_deref();
        while let Some(binding) = node {
            labels.push(binding.label.as_str());
            node = binding.parent.as_deref();
        }

        f.write_str("Background")?;
        for label in labels.iter().rev() {
            write!(f, ".WithValue({label})")?;
        }
        if self.is_cancelled() {
            f.write_str(".Cancelled")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct UserKey;

    #[test]
    fn value_is_visible_in_derived_scope_only() {
        let root = Scope::background();
        let derived = root.with_value("foo", "bar");

        assert_eq!(derived.value::<&str, &str>(&"foo"), Some(&"bar"));
        assert_eq!(root.value::<&str, &str>(&"foo"), None);
    }

    #[test]
    fn newest_binding_shadows_older_one() {
        let scope = Scope::background()
            .with_value("n", 1_u32)
            .with_value("n", 2_u32);

        assert_eq!(scope.value::<&str, u32>(&"n"), Some(&2));
    }

    #[test]
    fn keys_of_different_types_do_not_collide() {
        let scope = Scope::background()
            .with_value(UserKey, "alice".to_owned())
            .with_value("UserKey", 7_i64);

        assert_eq!(scope.value::<UserKey, String>(&UserKey).map(String::as_str), Some("alice"));
        assert_eq!(scope.value::<&str, i64>(&"UserKey"), Some(&7));
    }

    #[test]
    fn wrong_value_type_yields_none() {
        let scope = Scope::background().with_value("n", 1_u32);
        assert_eq!(scope.value::<&str, String>(&"n"), None);
    }

    #[test]
    fn child_cancellation_does_not_reach_parent() {
        let parent = Scope::background();
        let child = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let other = parent.child();
        parent.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn debug_lists_bindings_root_first() {
        let scope = Scope::background()
            .with_value("foo", "bar")
            .with_value(UserKey, 1_u8);

        assert_eq!(format!("{scope:?}"), r#"Background.WithValue("foo").WithValue(UserKey)"#);
    }
}
