//! Single-threaded observer lists
//!
//! A [`Signal`] holds an ordered list of callbacks. Registering a callback returns a [`HookId`]
//! which can later be used to revoke it. Emission is safe against listeners that remove
//! themselves, or other listeners, from within their callback: a listener removed during an
//! emission is not invoked anymore for that emission.

use std::{cell::RefCell, fmt, rc::Rc, sync::Arc};

crate::utils::ids::id_gen!(hooks_id);

/// Unique hook identifier used to unregister listeners
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HookId(Arc<InnerId>);

#[derive(Debug, Eq, PartialEq)]
struct InnerId(usize);

impl InnerId {
    fn new() -> Self {
        Self(hooks_id::next())
    }
}

impl Drop for InnerId {
    fn drop(&mut self) {
        hooks_id::remove(self.0);
    }
}

struct Hook<T> {
    id: HookId,
    cb: Rc<dyn Fn(&T)>,
}

impl<T> Clone for Hook<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            cb: self.cb.clone(),
        }
    }
}

/// An ordered list of listeners, notified synchronously on [`emit`](Signal::emit)
pub struct Signal<T> {
    hooks: RefCell<Vec<Hook<T>>>,
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("listeners", &self.hooks.borrow().len())
            .finish()
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Signal {
            hooks: RefCell::new(Vec::new()),
        }
    }
}

impl<T> Signal<T> {
    /// Create a signal without any listeners
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener, it is invoked after all previously registered ones
    pub fn add<F>(&self, cb: F) -> HookId
    where
        F: Fn(&T) + 'static,
    {
        let id = HookId(Arc::new(InnerId::new()));
        self.hooks.borrow_mut().push(Hook {
            id: id.clone(),
            cb: Rc::new(cb),
        });
        id
    }

    /// Revoke a listener
    ///
    /// Returns `false` if the listener was not registered (anymore).
    pub fn remove(&self, id: &HookId) -> bool {
        let mut hooks = self.hooks.borrow_mut();
        let len = hooks.len();
        hooks.retain(|hook| &hook.id != id);
        hooks.len() != len
    }

    /// Whether the given listener is currently registered
    pub fn contains(&self, id: &HookId) -> bool {
        self.hooks.borrow().iter().any(|hook| &hook.id == id)
    }

    /// Amount of registered listeners
    pub fn len(&self) -> usize {
        self.hooks.borrow().len()
    }

    /// Returns `true` if no listener is registered
    pub fn is_empty(&self) -> bool {
        self.hooks.borrow().is_empty()
    }

    /// Drop all listeners
    pub fn clear(&self) {
        // Listeners may own handles whose drop touches this signal again
        let hooks = std::mem::take(&mut *self.hooks.borrow_mut());
        drop(hooks);
    }

    /// Notify all listeners in registration order
    ///
    /// Listeners added during the emission are not invoked until the next emission.
    pub fn emit(&self, data: &T) {
        let snapshot = self.hooks.borrow().clone();
        for hook in snapshot {
            if self.contains(&hook.id) {
                (hook.cb)(data);
            }
        }
    }
}
