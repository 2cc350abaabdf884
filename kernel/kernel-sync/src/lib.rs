//! # Kernel synchronization primitives
//!
//! The VM subsystem serializes all of its shared state with plain spin
//! locks: the frame-table lock, the swap-bitmap lock and the file-access
//! lock are all [`SpinLock`]s. Preemptible kernel threads block by
//! spinning; there is no sleeping lock in this layer.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
