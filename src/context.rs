//! Call context with cancellation support.
//!
//! Every blocking operation in the runtime takes a [`Context`] and returns
//! early with [`Error::Cancelled`](crate::error::Error::Cancelled) when it is
//! cancelled. Cancellation never tears down a stream by itself; it only
//! interrupts the operation that observed it, so the stream stays usable
//! for further operations.

use tokio_util::sync::CancellationToken;

/// Cancellation scope for a call or stream operation.
///
/// Cancelling a context cancels every child derived from it; a child can be
/// cancelled on its own without affecting the parent, which is how a
/// handler scopes the lifetime of a producer or consumer task to one
/// dispatch.
#[derive(Debug, Clone)]
pub struct Context {
    cancel_token: CancellationToken,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Creates a root context.
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
        }
    }

    /// Derives a child context cancelled together with this one.
    pub fn child(&self) -> Self {
        Self {
            cancel_token: self.cancel_token.child_token(),
        }
    }

    /// Cancels this context and all children.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Returns true if this context has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Waits until the context is cancelled.
    pub async fn cancelled(&self) {
        self.cancel_token.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_observable() {
        let ctx = Context::new();
        assert!(!ctx.is_cancelled());
        ctx.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_cancellation_propagates_to_children_only() {
        let parent = Context::new();
        let child = parent.child();

        // A child cancel leaves the parent alone.
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        // A parent cancel reaches a fresh child.
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiters() {
        let ctx = Context::new();

        let waiter = ctx.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        ctx.cancel();
        handle.await.unwrap();
        assert!(ctx.is_cancelled());
    }
}
