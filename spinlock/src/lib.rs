//! Implements a simple spin-lock based mutex.
//!
//! The kernel core runs on a single CPU and protects its state by ordering
//! and by disabling interrupts; these locks exist for the code that will
//! eventually run on multiple cores. Acquisition spins on an atomic exchange
//! with a PAUSE backoff and maintains a per-CPU preemption counter.

#![cfg_attr(not(test), no_std)]

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

// Preemption depth of the current CPU: the number of spin locks it is
// holding. Becomes a per-CPU variable once there is more than one CPU.
static PREEMPT_COUNT: AtomicU32 = AtomicU32::new(0);

/// Number of spin locks held by the current CPU.
pub fn preempt_count() -> u32 {
    PREEMPT_COUNT.load(Ordering::Relaxed)
}

/// A raw spin lock without an associated value.
pub struct SpinLock {
    latch: AtomicBool,
}

impl SpinLock {
    pub const fn new() -> SpinLock {
        SpinLock {
            latch: AtomicBool::new(false),
        }
    }

    /// Acquire the lock, spinning until it becomes available.
    pub fn lock(&self) {
        while !self.try_lock() {
            // wait for the holder to release before exchanging again
            while self.latch.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    /// Attempt to acquire the lock without spinning. Returns whether the lock
    /// was acquired.
    pub fn try_lock(&self) -> bool {
        if self.latch.swap(true, Ordering::Acquire) {
            false
        } else {
            PREEMPT_COUNT.fetch_add(1, Ordering::Relaxed);
            true
        }
    }

    /// Release the lock. May only be called by the holder.
    pub fn unlock(&self) {
        PREEMPT_COUNT.fetch_sub(1, Ordering::Relaxed);
        self.latch.store(false, Ordering::Release);
    }
}

/// A value guarded by a spin lock.
pub struct Mutex<T> {
    guarded_value: UnsafeCell<T>,
    lock: SpinLock,
}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Mutex<T> {
        Mutex {
            guarded_value: UnsafeCell::new(value),
            lock: SpinLock::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<T> {
        self.lock.lock();
        MutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<T>> {
        if self.lock.try_lock() {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<'a, T> Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.guarded_value.get() }
    }
}

impl<'a, T> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.guarded_value.get() }
    }
}

impl<'a, T> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}
