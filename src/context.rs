//! Per-operation latch bookkeeping for the crabbing protocol.
//!
//! A [`LatchContext`] records, in acquisition order, every latch taken during
//! one descent, together with a cursor `smallest_unlocked` marking the prefix
//! that has already been released. The protocol's release points then become
//! cheap batch operations:
//!
//! - a node that proves itself *safe* releases all retained ancestors with
//!   [`release_prefix`](LatchContext::release_prefix);
//! - the lowest safe ancestor of a finished structural change drops itself
//!   and everything still retained below it with
//!   [`release_from_parent`](LatchContext::release_from_parent);
//! - a merge that consumes the node recorded at some depth swaps in the
//!   survivor's latch with [`replace_latch`](LatchContext::replace_latch)
//!   before the consumed node is destroyed.
//!
//! One context never mixes SHARED and EXCLUSIVE acquisitions, and
//! [`clear`](LatchContext::clear) asserts that every recorded latch has been
//! released. Both are asserted unconditionally: a violated context is a
//! protocol bug, not a runtime condition to tolerate.
//!
//! The context stores raw latch pointers rather than borrows: the node that
//! owns a recorded latch may be destroyed mid-operation (merge), and the
//! protocol, not the borrow checker, is what guarantees each pointer is live
//! until its slot is released or replaced.

use smallvec::SmallVec;
use std::ptr::NonNull;

use crate::latch::{Mode, NodeLatch};

/// Maximum expected tree height; descents deeper than this spill the latch
/// list to the heap but remain correct.
pub(crate) const MAX_HEIGHT: usize = 20;

pub(crate) struct LatchContext {
	pub(crate) latches: SmallVec<[NonNull<NodeLatch>; MAX_HEIGHT]>,
	pub(crate) smallest_unlocked: usize,
	mode: Option<Mode>,
}

impl LatchContext {
	pub(crate) fn new() -> Self {
		LatchContext {
			latches: SmallVec::new(),
			smallest_unlocked: 0,
			mode: None,
		}
	}

	#[inline]
	fn check_mode(&mut self, mode: Mode) {
		match self.mode {
			None => self.mode = Some(mode),
			Some(m) => assert_eq!(m, mode, "latch modes may not be mixed within one context"),
		}
	}

	/// Blocks until `latch` is granted in `mode`, records it, and returns its
	/// position in the acquisition order.
	pub(crate) fn acquire(&mut self, latch: &NodeLatch, mode: Mode) -> usize {
		self.check_mode(mode);
		latch.lock(mode);
		self.latches.push(NonNull::from(latch));
		self.latches.len() - 1
	}

	/// Records a latch the caller already holds (iterator handoff after a
	/// successful try-lock) and returns its position.
	pub(crate) fn adopt(&mut self, latch: &NodeLatch) -> usize {
		self.latches.push(NonNull::from(latch));
		self.latches.len() - 1
	}

	/// Releases latches `[smallest_unlocked, upto)` in `mode` and advances
	/// the cursor. No-op when `upto` is at or behind the cursor.
	pub(crate) fn release_prefix(&mut self, upto: usize, mode: Mode) {
		if upto <= self.smallest_unlocked {
			return;
		}
		assert!(upto <= self.latches.len(), "release past the acquisition list");
		self.check_mode(mode);
		for idx in self.smallest_unlocked..upto {
			// SAFETY: slot `idx` was recorded by acquire/adopt in this mode
			// and has not been released or replaced since.
			unsafe { self.latches[idx].as_ref().unlock(mode) };
		}
		self.smallest_unlocked = upto;
	}

	/// Releases everything from `depth` to the end of the list: the lowest
	/// safe ancestor dropping itself and all retained descendants.
	///
	/// Precondition: all latches above `depth` were already released.
	pub(crate) fn release_from_parent(&mut self, depth: usize, mode: Mode) {
		assert_eq!(
			self.smallest_unlocked, depth,
			"release_from_parent must start exactly at the release cursor"
		);
		self.check_mode(mode);
		for idx in depth..self.latches.len() {
			// SAFETY: as in release_prefix.
			unsafe { self.latches[idx].as_ref().unlock(mode) };
		}
		self.smallest_unlocked = self.latches.len();
	}

	/// Unlocks the latch recorded at `idx` and substitutes `latch`, which the
	/// caller already holds in the same mode. Used when a merge changes the
	/// identity of the node owning a depth.
	pub(crate) fn replace_latch(&mut self, idx: usize, latch: &NodeLatch, mode: Mode) {
		assert!(
			idx >= self.smallest_unlocked && idx < self.latches.len(),
			"replace_latch on a released slot"
		);
		self.check_mode(mode);
		// SAFETY: slot `idx` is still held in `mode`.
		unsafe { self.latches[idx].as_ref().unlock(mode) };
		self.latches[idx] = NonNull::from(latch);
	}

	/// Resets the context at the end of an operation, asserting that every
	/// recorded latch was released.
	pub(crate) fn clear(&mut self) {
		assert_eq!(
			self.smallest_unlocked,
			self.latches.len(),
			"context cleared with latches outstanding"
		);
		self.latches.clear();
		self.smallest_unlocked = 0;
		self.mode = None;
	}

	pub(crate) fn is_empty(&self) -> bool {
		self.latches.is_empty()
	}
}

impl Default for LatchContext {
	fn default() -> Self {
		Self::new()
	}
}
