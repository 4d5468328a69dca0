//! Strong and weak callback storage shared by store listeners and autorun
//! subscribers.
//!
//! A [`Callback`] is an `Arc`-backed callable. Subscribing with
//! `keep_ref = false` stores only a [`WeakCallback`]; the subscription stays
//! alive exactly as long as the caller keeps its own `Callback` clone, and
//! dead entries are pruned the next time the subscription table is walked.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};


/// A shareable callback receiving values by reference.
pub struct Callback<T> {
    inner: Arc<dyn Fn(&T) + Send + Sync>,
}

impl<T> Callback<T> {
    /// Wrap a function in a callback.
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(func),
        }
    }

    /// Invoke the callback.
    pub fn emit(&self, value: &T) {
        (self.inner)(value)
    }

    /// Create a weak handle that does not keep the callback alive.
    pub fn downgrade(&self) -> WeakCallback<T> {
        WeakCallback {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl<T> Clone for Callback<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, F> From<F> for Callback<T>
where
    F: Fn(&T) + Send + Sync + 'static,
{
    fn from(func: F) -> Self {
        Self::new(func)
    }
}

impl<T> fmt::Debug for Callback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("callback", &"<function>")
            .finish()
    }
}

impl<T> PartialEq for Callback<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// A weak handle to a [`Callback`].
pub struct WeakCallback<T> {
    inner: Weak<dyn Fn(&T) + Send + Sync>,
}

impl<T> WeakCallback<T> {
    /// Attempt to upgrade to a strong callback.
    pub fn upgrade(&self) -> Option<Callback<T>> {
        self.inner.upgrade().map(|inner| Callback { inner })
    }

    /// Whether the callback is still alive.
    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl<T> Clone for WeakCallback<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Strong-or-weak storage for a subscribed callback.
pub(crate) enum CallbackRef<T> {
    Strong(Callback<T>),
    Weak(WeakCallback<T>),
}

impl<T> CallbackRef<T> {
    pub(crate) fn new(callback: &Callback<T>, keep_ref: bool) -> Self {
        if keep_ref {
            CallbackRef::Strong(callback.clone())
        } else {
            CallbackRef::Weak(callback.downgrade())
        }
    }

    /// Resolve to a live callback, `None` when a weak referent died.
    pub(crate) fn get(&self) -> Option<Callback<T>> {
        match self {
            CallbackRef::Strong(callback) => Some(callback.clone()),
            CallbackRef::Weak(weak) => weak.upgrade(),
        }
    }

}

impl<T> Clone for CallbackRef<T> {
    fn clone(&self) -> Self {
        match self {
            CallbackRef::Strong(callback) => CallbackRef::Strong(callback.clone()),
            CallbackRef::Weak(weak) => CallbackRef::Weak(weak.clone()),
        }
    }
}

/// Options for a state-listener subscription.
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionOptions {
    /// Keep a strong reference to the listener. With `false` the caller
    /// must hold its own [`Callback`] clone to keep the subscription alive.
    pub keep_ref: bool,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self { keep_ref: true }
    }
}

/// An idempotent unsubscribe token returned by every subscription.
///
/// Calling [`Unsubscribe::call`] more than once is a no-op, and the token
/// holds no strong reference to the store, so it may outlive it.
#[derive(Clone)]
pub struct Unsubscribe {
    action: Arc<dyn Fn() + Send + Sync>,
    spent: Arc<AtomicBool>,
}

impl Unsubscribe {
    pub(crate) fn new<F>(action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            action: Arc::new(action),
            spent: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Remove the subscription. Subsequent calls do nothing.
    pub fn call(&self) {
        if !self.spent.swap(true, Ordering::SeqCst) {
            (self.action)();
        }
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("spent", &self.spent.load(Ordering::SeqCst))
            .finish()
    }
}
