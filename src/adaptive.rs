//! Live-updatable settings.
//!
//! The admission window is read on every check and written rarely (operator changes), so it
//! sits behind an `ArcSwap` for lock-free reads.

use arc_swap::ArcSwap;
use std::sync::Arc;

/// Shared handle to a value that can be swapped at runtime.
///
/// Clones observe the same value.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value.
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    /// Update via closure; retried if a concurrent writer wins.
    pub fn update<F>(&self, f: F)
    where
        F: Fn(&T) -> T,
    {
        self.inner.rcu(|cur| f(cur));
    }
}
