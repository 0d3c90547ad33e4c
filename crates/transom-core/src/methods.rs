//! Method registry: the callable surface one side exposes to its peer.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;

use crate::CallError;

/// Positional call arguments.
pub type CallArgs = Vec<Value>;

/// Future returned by a method handler.
pub type HandlerFuture = BoxFuture<'static, Result<Value, CallError>>;

/// A registered method handler.
pub type MethodHandler = Arc<dyn Fn(CallArgs) -> HandlerFuture + Send + Sync>;

/// Build a boxed [`MethodHandler`] from an async closure.
///
/// Useful for bulk registration via [`MethodTable::register_all`]; for single
/// registrations [`MethodTable::register`] boxes for you.
pub fn handler<F, Fut>(f: F) -> MethodHandler
where
    F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, CallError>> + Send + 'static,
{
    Arc::new(move |args| Box::pin(f(args)))
}

/// Name-keyed table of method handlers, shared live-by-reference.
///
/// Cloning a `MethodTable` yields another handle to the same underlying map:
/// the channel manager and the handshake collaborator hold the same table, so
/// a method registered after a connection is established is immediately
/// callable by the peer. The table never invokes handlers itself; dispatch is
/// the established connection's job.
#[derive(Clone, Default)]
pub struct MethodTable {
    inner: Arc<Mutex<HashMap<String, MethodHandler>>>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the handler for `name`. Last write wins.
    pub fn register<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CallError>> + Send + 'static,
    {
        self.register_handler(name, handler(f));
    }

    /// Insert or overwrite a pre-boxed handler for `name`.
    pub fn register_handler(&self, name: impl Into<String>, handler: MethodHandler) {
        let name = name.into();
        let replaced = self.inner.lock().insert(name.clone(), handler).is_some();
        tracing::debug!(method = %name, replaced, "method registered");
    }

    /// Bulk merge, key by key, with the same overwrite semantics as
    /// [`register`](Self::register).
    pub fn register_all<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, MethodHandler)>,
    {
        for (name, handler) in entries {
            self.register_handler(name, handler);
        }
    }

    /// Remove the handler for `name` if present. Idempotent.
    pub fn unregister(&self, name: &str) {
        if self.inner.lock().remove(name).is_some() {
            tracing::debug!(method = %name, "method unregistered");
        }
    }

    /// Look up the current handler for `name`.
    pub fn lookup(&self, name: &str) -> Option<MethodHandler> {
        self.inner.lock().get(name).cloned()
    }

    /// Sorted names of all registered methods.
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("methods", &self.method_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn last_registration_wins() {
        let table = MethodTable::new();
        table.register("greet", |_args| async { Ok(json!("old")) });
        table.register("greet", |_args| async { Ok(json!("new")) });

        let handler = table.lookup("greet").expect("registered");
        let result = futures::executor::block_on(handler(vec![])).unwrap();
        assert_eq!(result, json!("new"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn unregister_is_idempotent() {
        let table = MethodTable::new();
        table.register("x", |_args| async { Ok(Value::Null) });
        table.unregister("x");
        table.unregister("x");
        assert!(table.lookup("x").is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn clones_share_one_table() {
        let table = MethodTable::new();
        let alias = table.clone();
        alias.register("shared", |_args| async { Ok(Value::Null) });
        assert!(table.lookup("shared").is_some());
        assert_eq!(table.method_names(), ["shared"]);
    }

    #[test]
    fn register_all_merges_key_by_key() {
        let table = MethodTable::new();
        table.register("keep", |_args| async { Ok(json!(1)) });
        table.register_all(vec![
            ("keep".to_string(), handler(|_args| async { Ok(json!(2)) })),
            ("more".to_string(), handler(|_args| async { Ok(json!(3)) })),
        ]);

        assert_eq!(table.method_names(), ["keep", "more"]);
        let keep = table.lookup("keep").expect("registered");
        let result = futures::executor::block_on(keep(vec![])).unwrap();
        assert_eq!(result, json!(2));
    }
}
