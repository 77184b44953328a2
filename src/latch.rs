//! Latch primitives for the B+ tree.
//!
//! Every node carries a [`NodeLatch`], a reader/writer latch with the usual
//! semantics: any number of SHARED holders, or a single EXCLUSIVE holder.
//! The tree carries one more `NodeLatch` acting as the root's "parent latch"
//! so the crabbing protocol is uniform from the first step of a descent.
//!
//! ## Why a raw lock
//!
//! The crabbing protocol does not fit RAII guards. A latch acquired at one
//! depth of the recursion is released at a different depth, sometimes by an
//! ancestor frame, sometimes by the tree after a root split, and in one case
//! (merge) the latch recorded for a depth changes identity entirely. The
//! [`LatchContext`](crate::context::LatchContext) owns that bookkeeping, so
//! the latch itself is a thin wrapper over `parking_lot::RawRwLock`: lock by
//! mode, unlock by mode, with the unlock `unsafe` because the caller asserts
//! it holds the claim being released.
//!
//! A [`Spinlock`] is also provided for short critical sections outside the
//! tree (the concurrency tests use it for per-key coordination). The tree
//! itself only ever uses reader/writer latches.

use parking_lot::lock_api::RawRwLock as _;
use parking_lot::RawRwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// Latch acquisition mode.
///
/// A single operation uses one mode for its whole descent; mixing modes
/// within one [`LatchContext`](crate::context::LatchContext) is a contract
/// violation and is asserted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
	Shared,
	Exclusive,
}

/// Reader/writer latch guarding one node (or the tree root pointer).
pub(crate) struct NodeLatch {
	raw: RawRwLock,
}

impl NodeLatch {
	pub(crate) const fn new() -> Self {
		NodeLatch {
			raw: RawRwLock::INIT,
		}
	}

	/// Blocks until the latch is granted in the requested mode.
	#[inline]
	pub(crate) fn lock(&self, mode: Mode) {
		match mode {
			Mode::Shared => self.raw.lock_shared(),
			Mode::Exclusive => self.raw.lock_exclusive(),
		}
	}

	/// Non-blocking SHARED acquisition, used by the iterator handoff.
	#[inline]
	pub(crate) fn try_lock_shared(&self) -> bool {
		self.raw.try_lock_shared()
	}

	/// Releases a claim previously granted in `mode`.
	///
	/// # Safety
	///
	/// The caller must hold the latch in exactly that mode. The crabbing
	/// protocol guarantees this: every unlock goes through the context that
	/// recorded the acquisition.
	#[inline]
	pub(crate) unsafe fn unlock(&self, mode: Mode) {
		match mode {
			Mode::Shared => self.raw.unlock_shared(),
			Mode::Exclusive => self.raw.unlock_exclusive(),
		}
	}

	#[cfg(test)]
	pub(crate) fn is_locked(&self) -> bool {
		self.raw.is_locked()
	}
}

impl std::fmt::Debug for NodeLatch {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("NodeLatch").finish_non_exhaustive()
	}
}

// ===========================================================================
// Spinlock
// ===========================================================================

/// A test-and-set spinlock for short critical sections.
///
/// Spins with a CPU pause hint until the flag is won. Not fair, not
/// reentrant; only suitable where the critical section is a handful of
/// instructions.
pub struct Spinlock {
	flag: AtomicBool,
}

impl Spinlock {
	pub const fn new() -> Self {
		Spinlock {
			flag: AtomicBool::new(false),
		}
	}

	/// Spins until the lock is acquired.
	#[inline]
	pub fn lock(&self) {
		while self
			.flag
			.compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
			.is_err()
		{
			std::hint::spin_loop();
		}
	}

	/// Attempts to acquire the lock without spinning.
	#[inline]
	pub fn try_lock(&self) -> bool {
		self.flag
			.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
			.is_ok()
	}

	/// Releases the lock. The caller must hold it.
	#[inline]
	pub fn unlock(&self) {
		self.flag.store(false, Ordering::Release);
	}
}

impl Default for Spinlock {
	fn default() -> Self {
		Self::new()
	}
}
