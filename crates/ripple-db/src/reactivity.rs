use std::sync::Arc;

/// A single reactive dependency: something a computation can depend on
/// and something a data source can invalidate.
pub trait Dependency: Send + Sync {
    /// Record that the current computation depends on this value.
    fn depend(&self);
    /// Invalidate every computation recorded via [`depend`](Self::depend).
    fn notify(&self);
}

/// Seam for plugging a reactive runtime into cursors. The core never
/// names a concrete reactive system; it only creates dependencies,
/// asks whether a reactive scope is active, and registers scope
/// disposal callbacks.
pub trait ReactivityAdapter: Send + Sync {
    fn create_dependency(&self) -> Arc<dyn Dependency>;

    /// Whether a reactive computation is currently in scope. Cursors
    /// only establish subscriptions when this reports `true`.
    fn is_in_scope(&self) -> bool {
        true
    }

    /// Invoke `callback` when the current reactive scope is disposed.
    fn on_dispose(&self, callback: Box<dyn FnOnce() + Send>) {
        // adapters without scopes drop the callback
        let _ = callback;
    }
}
