//! Selector-binding convenience wrappers over the store.
//!
//! [`WithState`] binds a selector in front of a plain function; it is not
//! reactive and performs no memoization. [`Store::view`] builds a lazy
//! memoized view: a non-reactive autorun recomputed only when invoked with
//! a changed selector result.

use std::sync::Weak;

use crate::autorun::{Autorun, AutorunOptions};
use crate::error::StoreError;
use crate::store::{Store, StoreInner};


/// Options for [`Store::view`].
pub struct ViewOptions<R> {
    /// Value reported before the first computation.
    pub default_value: Option<R>,
    /// Return the cached value while the selector result is unchanged.
    pub memoization: bool,
    /// Default for the `initial_run` of attached subscribers.
    pub subscribers_initial_run: bool,
    /// Default for the `keep_ref` of attached subscribers.
    pub subscribers_keep_ref: bool,
}

impl<R> Default for ViewOptions<R> {
    fn default() -> Self {
        Self {
            default_value: None,
            memoization: true,
            subscribers_initial_run: true,
            subscribers_keep_ref: true,
        }
    }
}

/// A function bound to a selector over the current store state.
///
/// Calling it reads the state, applies the selector and invokes the wrapped
/// function with the result; the state must already be initialized.
pub struct WithState<S, K, R> {
    store: Weak<StoreInner<S>>,
    selector: Box<dyn Fn(&S) -> K + Send + Sync>,
    func: Box<dyn Fn(&K) -> R + Send + Sync>,
}

impl<S, K, R> WithState<S, K, R>
where
    S: Clone + Send + Sync + 'static,
{
    /// Invoke the wrapped function against the current state.
    ///
    /// Returns [`StoreError::Uninitialized`] while the state is unset and
    /// [`StoreError::Finished`] once the store is gone; callers that want
    /// the suppressed form use `.ok()`.
    pub fn call(&self) -> Result<R, StoreError> {
        let inner = self.store.upgrade().ok_or(StoreError::Finished)?;
        let state = inner
            .state
            .read()
            .clone()
            .ok_or(StoreError::Uninitialized)?;
        let selected = (self.selector)(&state);
        Ok((self.func)(&selected))
    }
}

impl<S> Store<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// Bind `func` behind `selector` over this store's current state.
    pub fn with_state<K, R, Sel, F>(&self, selector: Sel, func: F) -> WithState<S, K, R>
    where
        Sel: Fn(&S) -> K + Send + Sync + 'static,
        F: Fn(&K) -> R + Send + Sync + 'static,
    {
        WithState {
            store: std::sync::Arc::downgrade(&self.inner),
            selector: Box::new(selector),
            func: Box::new(func),
        }
    }

    /// A lazy memoized view over `selector`.
    ///
    /// The first call computes; subsequent calls with an unchanged selector
    /// result return the cached value. Views are not reactive: state
    /// changes invalidate them implicitly through the comparator check
    /// performed at each invocation.
    pub fn view<K, R, Sel, F>(
        &self,
        selector: Sel,
        func: F,
        options: ViewOptions<R>,
    ) -> Autorun<S, K, K, R>
    where
        Sel: Fn(&S) -> K + Send + Sync + 'static,
        F: Fn(&K) -> R + Send + Sync + 'static,
        K: Clone + PartialEq + Send + Sync + 'static,
        R: Clone + PartialEq + Send + Sync + 'static,
    {
        self.autorun_with_options(
            selector,
            func,
            AutorunOptions {
                default_value: options.default_value,
                initial_call: false,
                reactive: false,
                memoization: options.memoization,
                subscribers_initial_run: options.subscribers_initial_run,
                subscribers_keep_ref: options.subscribers_keep_ref,
            },
        )
    }
}
