//! Owner context for multi-account logging
//!
//! A process can run several story engines side by side, one per signed-in
//! account. The thread-local context set here names the account whose engine
//! is running so that spans opened inside the scope carry it.

use std::cell::RefCell;

use ephemera_core::OwnerId;
use tracing::Span;
use uuid::Uuid;

/// Owner context data stored in thread-local storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerContextData {
    /// The account running the engine
    pub owner_id: OwnerId,
    /// Unique instance ID for this engine session
    pub instance_id: Uuid,
}

impl OwnerContextData {
    /// A span tagged with the owner and instance fields
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "engine",
            owner_id = self.owner_id.0,
            instance_id = %self.instance_id,
        )
    }
}

thread_local! {
    static OWNER_CONTEXT: RefCell<Option<OwnerContextData>> = const { RefCell::new(None) };
}

/// RAII guard for owner context
///
/// Creating the guard sets the context for the current thread; dropping it
/// restores whatever was set before.
///
/// ```ignore
/// use ephemera_core::OwnerId;
/// use ephemera_logging::OwnerContextGuard;
///
/// let _guard = OwnerContextGuard::new(OwnerId(1));
/// tracing::info!("sending story");
/// ```
pub struct OwnerContextGuard {
    previous: Option<OwnerContextData>,
}

impl OwnerContextGuard {
    /// Set the owner for the current scope with a fresh instance ID
    pub fn new(owner_id: OwnerId) -> Self {
        Self::with_instance_id(owner_id, Uuid::new_v4())
    }

    /// Set the owner with a specific instance ID
    ///
    /// Keeps one instance ID across an engine restart.
    pub fn with_instance_id(owner_id: OwnerId, instance_id: Uuid) -> Self {
        let data = OwnerContextData {
            owner_id,
            instance_id,
        };
        let previous = OWNER_CONTEXT.with(|ctx| ctx.borrow_mut().replace(data));
        Self { previous }
    }

    /// Get the current owner context (if any)
    pub fn current() -> Option<OwnerContextData> {
        OWNER_CONTEXT.with(|ctx| ctx.borrow().clone())
    }

    /// Get the current owner (if set)
    pub fn current_owner() -> Option<OwnerId> {
        Self::current().map(|ctx| ctx.owner_id)
    }

    /// Get the current instance ID (if set)
    pub fn current_instance_id() -> Option<Uuid> {
        Self::current().map(|ctx| ctx.instance_id)
    }

    /// Span for the current context, or a disabled span outside one
    pub fn current_span() -> Span {
        Self::current().map_or_else(Span::none, |ctx| ctx.span())
    }
}

impl Drop for OwnerContextGuard {
    fn drop(&mut self) {
        OWNER_CONTEXT.with(|ctx| *ctx.borrow_mut() = self.previous.take());
    }
}

/// Run a block with the owner context set
///
/// ```ignore
/// with_owner_context!(OwnerId(1), {
///     tracing::info!("loading lists");
/// });
/// ```
#[macro_export]
macro_rules! with_owner_context {
    ($owner:expr, $body:block) => {{
        let _guard = $crate::context::OwnerContextGuard::new($owner);
        $body
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_context_guard() {
        assert!(OwnerContextGuard::current().is_none());

        {
            let _guard = OwnerContextGuard::new(OwnerId(1));
            let ctx = OwnerContextGuard::current().unwrap();
            assert_eq!(ctx.owner_id, OwnerId(1));
        }

        assert!(OwnerContextGuard::current().is_none());
    }

    #[test]
    fn test_nested_contexts() {
        {
            let _outer = OwnerContextGuard::new(OwnerId(1));
            assert_eq!(OwnerContextGuard::current_owner(), Some(OwnerId(1)));

            {
                let _inner = OwnerContextGuard::new(OwnerId(2));
                assert_eq!(OwnerContextGuard::current_owner(), Some(OwnerId(2)));
            }

            assert_eq!(OwnerContextGuard::current_owner(), Some(OwnerId(1)));
        }

        assert!(OwnerContextGuard::current_owner().is_none());
    }

    #[test]
    fn test_with_instance_id() {
        let instance_id = Uuid::new_v4();
        let _guard = OwnerContextGuard::with_instance_id(OwnerId(5), instance_id);
        assert_eq!(OwnerContextGuard::current_instance_id(), Some(instance_id));
    }

    #[test]
    fn test_macro_scopes_the_context() {
        let seen = with_owner_context!(OwnerId(9), { OwnerContextGuard::current_owner() });
        assert_eq!(seen, Some(OwnerId(9)));
        assert!(OwnerContextGuard::current_owner().is_none());
    }

    #[test]
    fn test_contexts_are_per_thread() {
        let _guard = OwnerContextGuard::new(OwnerId(1));
        let other = std::thread::spawn(OwnerContextGuard::current_owner)
            .join()
            .unwrap();
        assert!(other.is_none());
        assert_eq!(OwnerContextGuard::current_owner(), Some(OwnerId(1)));
    }
}
