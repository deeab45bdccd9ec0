//! Reentrant lock with a manually releasable scoped guard
//!
//! Unlike `std::sync::Mutex`, the owning thread may acquire the lock again
//! without deadlocking; the recursion depth is tracked by the lock. The guard
//! can drop the lock early (`release`) and take it back (`reacquire`), which
//! is what a session does around a blocking readiness wait.
//!
//! Because the owner may hold several guards at once, guards only hand out
//! shared references. Use interior mutability (`RefCell`) for the protected
//! state, and never keep a `RefCell` borrow alive across a nested acquire.

use core::marker::PhantomData;
use core::ops::Deref;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use crate::error::LockError;

#[derive(Debug, Default)]
struct Ownership {
    owner: Option<ThreadId>,
    depth: usize,
}

/// A mutual-exclusion lock the owning thread may re-acquire.
///
/// # Example
///
/// ```ignore
/// let lock = ReentrantLock::new(RefCell::new(0));
///
/// let outer = lock.lock()?;
/// let inner = lock.lock()?; // same thread: no deadlock
/// *inner.borrow_mut() += 1;
/// ```
pub struct ReentrantLock<T> {
    state: Mutex<Ownership>,
    available: Condvar,
    data: T,
}

// Safety: only the owning thread ever reaches `data`, one thread at a time.
unsafe impl<T: Send> Send for ReentrantLock<T> {}
unsafe impl<T: Send> Sync for ReentrantLock<T> {}

impl<T> ReentrantLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(Ownership::default()),
            available: Condvar::new(),
            data: value,
        }
    }

    /// Acquire the lock, blocking while another thread owns it.
    pub fn lock(&self) -> Result<ScopedLockGuard<'_, T>, LockError> {
        self.acquire()?;
        Ok(ScopedLockGuard {
            lock: self,
            held: true,
            _not_send: PhantomData,
        })
    }

    /// Acquire only if free or already owned by this thread.
    pub fn try_lock(&self) -> Option<ScopedLockGuard<'_, T>> {
        let me = thread::current().id();
        let mut state = self.state.lock().ok()?;
        match state.owner {
            None => {
                state.owner = Some(me);
                state.depth = 1;
            }
            Some(owner) if owner == me => {
                state.depth = state.depth.checked_add(1)?;
            }
            Some(_) => return None,
        }
        Some(ScopedLockGuard {
            lock: self,
            held: true,
            _not_send: PhantomData,
        })
    }

    /// True if the calling thread currently owns the lock.
    pub fn is_held_by_current_thread(&self) -> bool {
        let me = thread::current().id();
        self.ownership().owner == Some(me)
    }

    /// Current recursion depth (0 when free).
    pub fn depth(&self) -> usize {
        self.ownership().depth
    }

    /// Consume the lock and return the protected value
    pub fn into_inner(self) -> T {
        self.data
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.data
    }

    fn ownership(&self) -> MutexGuard<'_, Ownership> {
        // bookkeeping never panics while locked; recover the state if it did
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn acquire(&self) -> Result<(), LockError> {
        let me = thread::current().id();
        let mut state = self.state.lock().map_err(|_| LockError::Poisoned)?;
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    return Ok(());
                }
                Some(owner) if owner == me => {
                    state.depth = state.depth.checked_add(1).ok_or(LockError::DepthOverflow)?;
                    return Ok(());
                }
                Some(_) => {
                    state = self.available.wait(state).map_err(|_| LockError::Poisoned)?;
                }
            }
        }
    }

    fn release_one(&self) {
        let mut state = self.ownership();
        debug_assert_eq!(state.owner, Some(thread::current().id()));
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            self.available.notify_one();
        }
    }
}

impl<T: Default> Default for ReentrantLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> core::fmt::Debug for ReentrantLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.ownership();
        f.debug_struct("ReentrantLock")
            .field("owner", &state.owner)
            .field("depth", &state.depth)
            .finish()
    }
}

/// Guard holding one level of a [`ReentrantLock`].
///
/// Releases on drop if still held. `release` and `reacquire` are idempotent.
/// Dereferencing a released guard panics.
pub struct ScopedLockGuard<'a, T> {
    lock: &'a ReentrantLock<T>,
    held: bool,
    // the lock is owned by a thread, so is the guard
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> ScopedLockGuard<'a, T> {
    /// Drop this guard's level of the lock early. No-op if already released.
    pub fn release(&mut self) {
        if self.held {
            self.held = false;
            self.lock.release_one();
        }
    }

    /// Take the lock back after `release`. No-op if already held.
    pub fn reacquire(&mut self) -> Result<(), LockError> {
        if !self.held {
            self.lock.acquire()?;
            self.held = true;
        }
        Ok(())
    }

    #[inline]
    pub fn is_held(&self) -> bool {
        self.held
    }
}

impl<'a, T> Deref for ScopedLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        assert!(self.held, "ScopedLockGuard dereferenced while released");
        &self.lock.data
    }
}

impl<'a, T> Drop for ScopedLockGuard<'a, T> {
    fn drop(&mut self) {
        self.release();
    }
}
