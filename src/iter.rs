//! Range iteration over the leaf chain.
//!
//! A [`RangeIter`] is a lazy forward cursor. It is created by
//! [`GenericTree::range_query`](crate::GenericTree::range_query) or
//! [`GenericTree::tree_scan`](crate::GenericTree::tree_scan) positioned on a
//! leaf whose SHARED latch was retained by the descent, and walks the
//! sibling links from there.
//!
//! ## Latch handoff
//!
//! Moving to the next leaf uses a *non-blocking* try on its SHARED latch,
//! and only then releases the current leaf. Blocking would invite deadlock:
//! a writer rebalancing the next leaf may need an exclusive latch on the
//! iterator's current leaf (merges always latch the in-parent left sibling),
//! while the iterator waits on the leaf the writer holds. A failed try
//! surfaces [`Error::Contended`] without moving, so the caller can retry or
//! give up.
//!
//! Scans are not snapshot-consistent: each leaf is observed as it existed
//! when its latch was acquired.

use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::context::LatchContext;
use crate::error::{Error, Result};
use crate::latch::Mode;
use crate::{GenericTree, NodeCell};

/// Forward cursor over leaf entries, bounded above when created by a range
/// query.
pub struct RangeIter<'t, K, V, const IC: usize, const LC: usize> {
	current: Option<NonNull<NodeCell<K, V, IC, LC>>>,
	offset: usize,
	high: Option<K>,
	cx: LatchContext,
	_tree: PhantomData<&'t GenericTree<K, V, IC, LC>>,
}

impl<'t, K, V, const IC: usize, const LC: usize> RangeIter<'t, K, V, IC, LC> {
	/// `cx` holds exactly one unreleased latch: SHARED on `leaf`.
	pub(crate) fn new(
		leaf: NonNull<NodeCell<K, V, IC, LC>>,
		offset: usize,
		high: Option<K>,
		cx: LatchContext,
	) -> Self {
		RangeIter {
			current: Some(leaf),
			offset,
			high,
			cx,
			_tree: PhantomData,
		}
	}
}

impl<'t, K: Ord + Clone, V: Clone, const IC: usize, const LC: usize> RangeIter<'t, K, V, IC, LC> {
	/// Returns the next entry in key order, `Ok(None)` once the scan is
	/// exhausted or past its upper bound.
	///
	/// # Errors
	///
	/// [`Error::Contended`] when the next leaf is held by a writer. The
	/// cursor has not moved; calling `next` again retries the handoff.
	pub fn next(&mut self) -> Result<Option<(K, V)>> {
		loop {
			let Some(cell) = self.current else {
				return Ok(None);
			};
			// SAFETY: the iterator holds a SHARED latch on `current`, so the
			// leaf can neither change nor be destroyed under us.
			let leaf = unsafe { &*cell.as_ref().node.get() }.as_leaf();

			if self.offset < leaf.len() {
				let key = leaf.keys[self.offset].clone();
				if let Some(high) = &self.high {
					if key > *high {
						self.finish();
						return Ok(None);
					}
				}
				let value = leaf.values[self.offset].clone();
				self.offset += 1;
				return Ok(Some((key, value)));
			}

			match leaf.right {
				None => {
					self.finish();
					return Ok(None);
				}
				Some(next) => {
					// SAFETY: `next` cannot be freed while `current` is
					// latched: destroying a leaf merges it into its
					// in-parent left sibling, which is exactly `current`,
					// and that merge needs `current` exclusively.
					let next_latch = unsafe { &next.as_ref().latch };
					if !next_latch.try_lock_shared() {
						return Err(Error::Contended);
					}
					let depth = self.cx.adopt(next_latch);
					self.cx.release_prefix(depth, Mode::Shared);
					self.current = Some(next);
					self.offset = 0;
				}
			}
		}
	}

	/// Releases whatever the cursor still holds and parks it.
	fn finish(&mut self) {
		if !self.cx.is_empty() {
			let end = self.cx.latches.len();
			self.cx.release_prefix(end, Mode::Shared);
			self.cx.clear();
		}
		self.current = None;
	}
}

impl<'t, K, V, const IC: usize, const LC: usize> Drop for RangeIter<'t, K, V, IC, LC> {
	fn drop(&mut self) {
		if !self.cx.is_empty() {
			let end = self.cx.latches.len();
			self.cx.release_prefix(end, Mode::Shared);
			self.cx.clear();
		}
	}
}
