//! Intrusive reference counting for natively owned objects bound to
//! script handles.

use std::cell::Cell;
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;

/// An object carrying its own reference count.
///
/// # Safety
///
/// `release` must return the count left after the decrement, and an
/// object whose count reached zero must not be touched again except by
/// [`destroy`](RefCounted::destroy). Objects handed to `destroy` must have
/// been allocated with `Box`.
pub unsafe trait RefCounted: Sized {
    fn add_ref(&self);

    fn release(&self) -> usize;

    /// Free an object whose count dropped to zero.
    ///
    /// # Safety
    ///
    /// `this` must come from `Box::into_raw` and must not be used afterwards.
    unsafe fn destroy(this: NonNull<Self>) {
        drop(Box::from_raw(this.as_ptr()));
    }
}

/// Increment the count of `target`.
///
/// # Safety
///
/// `target` must point to a live object.
pub unsafe fn retain<T: RefCounted>(target: NonNull<T>) {
    target.as_ref().add_ref();
}

/// Decrement the count of `target`, destroying it at zero. Returns true if
/// it was destroyed.
///
/// # Safety
///
/// `target` must point to a live object the caller holds a reference to.
pub unsafe fn release<T: RefCounted>(target: NonNull<T>) -> bool {
    if target.as_ref().release() == 0 {
        T::destroy(target);
        true
    } else {
        false
    }
}

/// A non-atomic counter to embed in reference-counted types.
#[derive(Debug, Default)]
pub struct RefCount(Cell<usize>);

impl RefCount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> usize {
        self.0.get()
    }

    pub fn increment(&self) {
        self.0.set(self.0.get() + 1);
    }

    /// Returns the remaining count. Decrementing zero stays at zero.
    pub fn decrement(&self) -> usize {
        let n = self.0.get().saturating_sub(1);
        self.0.set(n);
        n
    }
}

/// Wraps any value with a reference count.
pub struct Counted<T> {
    count: RefCount,
    value: T,
}

impl<T> Counted<T> {
    pub fn new(value: T) -> Self {
        Counted {
            count: RefCount::new(),
            value,
        }
    }

    /// Move `value` to the heap with a count of zero; the first owner
    /// retains it.
    pub fn allocate(value: T) -> NonNull<Counted<T>> {
        NonNull::from(Box::leak(Box::new(Counted::new(value))))
    }

    pub fn ref_count(&self) -> usize {
        self.count.get()
    }
}

impl<T: Default> Default for Counted<T> {
    fn default() -> Self {
        Counted::new(T::default())
    }
}

impl<T> Deref for Counted<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for Counted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Counted")
            .field("count", &self.count.get())
            .field("value", &self.value)
            .finish()
    }
}

unsafe impl<T> RefCounted for Counted<T> {
    fn add_ref(&self) {
        self.count.increment();
    }

    fn release(&self) -> usize {
        self.count.decrement()
    }
}

/// An owned reference: retains on creation and clone, releases on drop.
pub struct Retained<T: RefCounted> {
    ptr: NonNull<T>,
}

impl<T: RefCounted> Retained<T> {
    /// Take a new reference to `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live object.
    pub unsafe fn new(ptr: NonNull<T>) -> Self {
        retain(ptr);
        Retained { ptr }
    }

    /// Adopt a reference the caller already holds.
    ///
    /// # Safety
    ///
    /// The caller must own one reference to `ptr`, which moves into the
    /// returned handle.
    pub unsafe fn from_raw(ptr: NonNull<T>) -> Self {
        Retained { ptr }
    }

    /// Give up the handle without releasing its reference.
    pub fn into_raw(self) -> NonNull<T> {
        let ptr = self.ptr;
        std::mem::forget(self);
        ptr
    }

    pub fn as_ptr(&self) -> NonNull<T> {
        self.ptr
    }
}

impl<T: RefCounted> Clone for Retained<T> {
    fn clone(&self) -> Self {
        // SAFETY: this handle keeps the object alive.
        unsafe { Retained::new(self.ptr) }
    }
}

impl<T: RefCounted> Deref for Retained<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: this handle keeps the object alive.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: RefCounted> Drop for Retained<T> {
    fn drop(&mut self) {
        // SAFETY: this handle owns one reference.
        unsafe {
            release(self.ptr);
        }
    }
}

impl<T: RefCounted> fmt::Debug for Retained<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Retained({:p})", self.ptr)
    }
}
