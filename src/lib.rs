//! In-memory concurrent B+ tree using pessimistic lock coupling ("latch
//! crabbing").
//!
//! Every node carries a reader/writer latch and the tree carries one more
//! acting as the root's parent latch. Descents crab down the tree: a child is
//! latched before its parent is released. Readers release the parent as soon
//! as the child is latched; writers keep the whole latched spine until the
//! child proves itself *safe* — unable to split (insert) or underflow
//! (delete) — at which point every retained ancestor latch is released in one
//! sweep. When a structural change does propagate, the lowest safe ancestor
//! absorbs it and unlatches itself and everything below.
//!
//! All keys live in the leaves, which form a singly linked chain for in-order
//! iteration; interior nodes hold separator keys for routing only.
//!
//! ```
//! use crabtree::Tree;
//!
//! let tree: Tree<i32, i32> = Tree::new();
//!
//! tree.insert(1, 10);
//! tree.insert(2, 20);
//!
//! assert_eq!(tree.search(&1), Some(10));
//! assert!(tree.remove(&1));
//! assert_eq!(tree.search(&1), None);
//! ```

use smallvec::SmallVec;

use std::cell::UnsafeCell;
use std::fmt;
use std::ptr::NonNull;

pub mod error;
pub mod iter;
pub mod latch;

pub(crate) mod context;

#[cfg(test)]
mod util;

use context::LatchContext;
use latch::{Mode, NodeLatch};

const INNER_CAPACITY: usize = 64;
const LEAF_CAPACITY: usize = 64;

/// Type alias for the `GenericTree` with preset node sizes.
pub type Tree<K, V> = GenericTree<K, V, INNER_CAPACITY, LEAF_CAPACITY>;

/// Minimum entry count for a non-root node of capacity `n`.
///
/// A node that would drop below this after one removal is unsafe for delete;
/// a split at this pivot leaves both halves at or near the bound.
#[inline]
pub(crate) const fn underflow_bound(n: usize) -> usize {
	(n + 1) / 2
}

/// Concurrent B+ tree with per-node latches and a crabbing descent protocol.
///
/// `InternalNode` and `LeafNode` capacities can be configured through the
/// const generic parameters `IC` and `LC` respectively. Both must be at
/// least 3 for borrow and merge to be meaningful.
pub struct GenericTree<K, V, const IC: usize, const LC: usize> {
	/// The root's "parent latch": descent starts here, so the crabbing rules
	/// are uniform from the first step and root replacement is serialized.
	pub(crate) latch: NodeLatch,
	pub(crate) root: UnsafeCell<Box<NodeCell<K, V, IC, LC>>>,
}

// SAFETY: the latch protocol serializes all access to the cells behind the
// UnsafeCell; the tree can move between threads if its contents can.
unsafe impl<K: Send, V: Send, const IC: usize, const LC: usize> Send for GenericTree<K, V, IC, LC> {}
unsafe impl<K: Send + Sync, V: Send + Sync, const IC: usize, const LC: usize> Sync
	for GenericTree<K, V, IC, LC>
{
}

impl<K: Ord + Clone, V, const IC: usize, const LC: usize> Default for GenericTree<K, V, IC, LC> {
	fn default() -> Self {
		Self::new()
	}
}

impl<K: Ord + Clone, V, const IC: usize, const LC: usize> GenericTree<K, V, IC, LC> {
	/// Makes a new, empty tree whose root is an empty leaf.
	pub fn new() -> Self {
		assert!(IC >= 3 && LC >= 3, "node capacities below 3 cannot borrow or merge");
		GenericTree {
			latch: NodeLatch::new(),
			root: UnsafeCell::new(Box::new(NodeCell::new(Node::Leaf(LeafNode::new())))),
		}
	}

	/// Inserts a key-value pair; an existing key has its value overwritten.
	pub fn insert(&self, key: K, value: V) {
		let mut cx = LatchContext::new();
		cx.acquire(&self.latch, Mode::Exclusive);
		// SAFETY: the tree latch is held; the root slot is only rewritten
		// under it, and the root cell latches itself before it is released.
		let root = unsafe { &**self.root.get() };
		if let Some(split) = root.insert(key, value, &mut cx) {
			// The split reached the root: grow a new internal root over the
			// two halves. The tree latch is necessarily still held, since a
			// root with room would have absorbed the split below.
			let mut grown = InternalNode::new();
			grown.keys.push(split.boundary);
			// SAFETY: tree latch held EXCLUSIVE.
			let slot = unsafe { &mut *self.root.get() };
			let old_root = std::mem::replace(slot, Box::new(NodeCell::new(Node::Internal(grown))));
			let internal = slot.node_mut().as_internal_mut();
			internal.children.push(old_root);
			internal.children.push(split.right);
			cx.release_from_parent(0, Mode::Exclusive);
		}
		cx.clear();
	}

	/// Returns a copy of the value stored under `key`, if any.
	pub fn search(&self, key: &K) -> Option<V>
	where
		V: Clone,
	{
		let mut cx = LatchContext::new();
		cx.acquire(&self.latch, Mode::Shared);
		// SAFETY: as in insert.
		let root = unsafe { &**self.root.get() };
		let result = root.search(key, &mut cx);
		cx.clear();
		result
	}

	/// Overwrites the value stored under `key` in place.
	///
	/// Returns false (and stores nothing) when the key is absent. Unlike
	/// insert, an update can never restructure the tree.
	pub fn update(&self, key: &K, value: V) -> bool {
		let mut cx = LatchContext::new();
		cx.acquire(&self.latch, Mode::Exclusive);
		// SAFETY: as in insert.
		let root = unsafe { &**self.root.get() };
		let updated = root.update(key, value, &mut cx);
		cx.clear();
		updated
	}

	/// Removes `key` from the tree; true if a matching entry existed.
	pub fn remove(&self, key: &K) -> bool {
		let mut cx = LatchContext::new();
		cx.acquire(&self.latch, Mode::Exclusive);
		// SAFETY: as in insert.
		let root = unsafe { &**self.root.get() };
		let (deleted, underflow) = root.delete(key, &mut cx);
		if !deleted {
			cx.clear();
			return false;
		}

		// An internal root left with a single child collapses: the child is
		// promoted and the old root becomes a childless husk. The husk must
		// outlive the release below, which still unlocks its latch.
		let mut husk = None;
		if underflow {
			// SAFETY: underflow at the top means the whole spine, tree latch
			// included, is still latched EXCLUSIVE.
			let slot = unsafe { &mut *self.root.get() };
			if let Node::Internal(internal) = slot.node_mut() {
				if internal.len() == 1 {
					let child =
						internal.children.pop().expect("collapsing root has exactly one child");
					husk = Some(std::mem::replace(slot, child));
				}
			}
			cx.release_from_parent(0, Mode::Exclusive);
		}
		cx.clear();
		drop(husk);
		true
	}

	/// Replaces the contents with a fresh empty leaf.
	///
	/// Exclusive access is required by the receiver type; there is no
	/// latching here.
	pub fn clear(&mut self) {
		*self.root.get_mut() = Box::new(NodeCell::new(Node::Leaf(LeafNode::new())));
	}

	/// Returns a cursor over the entries with `low <= key <= high`, in
	/// ascending key order.
	pub fn range_query(&self, low: &K, high: &K) -> iter::RangeIter<'_, K, V, IC, LC> {
		let mut cx = LatchContext::new();
		cx.acquire(&self.latch, Mode::Shared);
		// SAFETY: as in insert.
		let root = unsafe { &**self.root.get() };
		let (leaf, offset) = root.locate_key(low, &mut cx);
		iter::RangeIter::new(leaf, offset, Some(high.clone()), cx)
	}

	/// Returns a cursor over all entries in ascending key order.
	pub fn tree_scan(&self) -> iter::RangeIter<'_, K, V, IC, LC> {
		let mut cx = LatchContext::new();
		cx.acquire(&self.latch, Mode::Shared);
		// SAFETY: as in insert.
		let mut current = NonNull::from(unsafe { &**self.root.get() });
		let depth = cx.acquire(unsafe { &current.as_ref().latch }, Mode::Shared);
		cx.release_prefix(depth, Mode::Shared);
		loop {
			// SAFETY: `current` is latched SHARED.
			let node = unsafe { &*current.as_ref().node.get() };
			match node {
				Node::Leaf(_) => break,
				Node::Internal(internal) => {
					let child = NonNull::from(internal.child(0));
					// SAFETY: the child outlives the coupling step; detaching
					// it would require this node's latch exclusively.
					let depth = cx.acquire(unsafe { &child.as_ref().latch }, Mode::Shared);
					cx.release_prefix(depth, Mode::Shared);
					current = child;
				}
			}
		}
		iter::RangeIter::new(current, 0, None, cx)
	}

	/// Returns the number of entries by scanning the leaf chain.
	///
	/// A scan that loses the latch handoff race restarts from the root
	/// rather than spinning against a writer that may need its current leaf.
	pub fn len(&self) -> usize
	where
		V: Clone,
	{
		loop {
			let mut scan = self.tree_scan();
			let mut count = 0usize;
			let complete = loop {
				match scan.next() {
					Ok(Some(_)) => count += 1,
					Ok(None) => break true,
					Err(error::Error::Contended) => break false,
				}
			};
			if complete {
				return count;
			}
		}
	}

	/// Returns true if the tree holds no entries.
	pub fn is_empty(&self) -> bool {
		let mut cx = LatchContext::new();
		cx.acquire(&self.latch, Mode::Shared);
		// SAFETY: as in insert.
		let root = unsafe { &**self.root.get() };
		let depth = cx.acquire(&root.latch, Mode::Shared);
		// SAFETY: root latched SHARED. An internal root always has children.
		let empty = match unsafe { &*root.node.get() } {
			Node::Leaf(leaf) => leaf.len() == 0,
			Node::Internal(_) => false,
		};
		cx.release_prefix(depth + 1, Mode::Shared);
		cx.clear();
		empty
	}

	/// Validates the structural invariants over the whole tree.
	///
	/// Checked: node fill bounds (with the root exceptions), strictly
	/// ascending keys, separator bounds between siblings, uniform leaf
	/// depth, and a leaf chain that enumerates every leaf exactly once in
	/// order. Exclusive access is required by the receiver type.
	///
	/// The leaf lower bound is `LC / 2` rather than the underflow bound:
	/// splitting a full leaf at the underflow-bound pivot hands the right
	/// sibling `LC - underflow_bound(LC)` entries, one short of the bound
	/// when `LC` is odd, and that state is legitimate until a delete next
	/// touches the leaf.
	pub fn check_invariants(&mut self)
	where
		K: fmt::Debug,
	{
		let mut leaves: Vec<LeafLink<K, V, IC, LC>> = Vec::new();
		let mut keys = Vec::new();
		let mut leaf_depths = Vec::new();
		self.root.get_mut().check(true, None, None, 0, &mut leaves, &mut keys, &mut leaf_depths);

		for pair in keys.windows(2) {
			assert!(pair[0] < pair[1], "tree keys out of order: {:?} !< {:?}", pair[0], pair[1]);
		}
		for depth in &leaf_depths {
			assert_eq!(*depth, leaf_depths[0], "leaves at unequal depths");
		}
		for pair in leaves.windows(2) {
			assert_eq!(pair[0].1, Some(pair[1].0), "leaf chain skips or revisits a leaf");
		}
		if let Some(last) = leaves.last() {
			assert_eq!(last.1, None, "rightmost leaf has a dangling sibling link");
		}
	}
}

/// (leaf address, its right-sibling address) recorded during invariant
/// checking; comparing consecutive pairs validates the chain.
type LeafLink<K, V, const IC: usize, const LC: usize> =
	(*const NodeCell<K, V, IC, LC>, Option<*const NodeCell<K, V, IC, LC>>);

impl<K: fmt::Display, V: fmt::Display, const IC: usize, const LC: usize> fmt::Display
	for GenericTree<K, V, IC, LC>
{
	/// Renders the tree as `[LEAF: …]` / `[INTERNAL: …]` text.
	///
	/// Rendering takes no latches; like `clear`, the caller ensures no
	/// concurrent writers.
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		// SAFETY: caller-provided quiescence.
		write!(f, "{}", unsafe { &**self.root.get() })
	}
}

// ===========================================================================
// Nodes
// ===========================================================================

/// A heap-allocated node together with its latch.
///
/// The cell's address is stable from creation (split, or the empty-tree
/// constructor) to destruction (merge of the right participant, or root
/// collapse), which is what makes the raw sibling links and the latch
/// pointers recorded in a [`LatchContext`] sound.
pub(crate) struct NodeCell<K, V, const IC: usize, const LC: usize> {
	pub(crate) latch: NodeLatch,
	pub(crate) node: UnsafeCell<Node<K, V, IC, LC>>,
}

pub(crate) enum Node<K, V, const IC: usize, const LC: usize> {
	Internal(InternalNode<K, V, IC, LC>),
	Leaf(LeafNode<K, V, IC, LC>),
}

impl<K, V, const IC: usize, const LC: usize> Node<K, V, IC, LC> {
	#[inline]
	pub(crate) fn is_leaf(&self) -> bool {
		matches!(self, Node::Leaf(_))
	}

	#[inline]
	pub(crate) fn as_leaf(&self) -> &LeafNode<K, V, IC, LC> {
		match self {
			Node::Leaf(leaf) => leaf,
			Node::Internal(_) => panic!("expected leaf node"),
		}
	}

	#[inline]
	pub(crate) fn as_leaf_mut(&mut self) -> &mut LeafNode<K, V, IC, LC> {
		match self {
			Node::Leaf(leaf) => leaf,
			Node::Internal(_) => panic!("expected leaf node"),
		}
	}

	#[inline]
	pub(crate) fn as_internal_mut(&mut self) -> &mut InternalNode<K, V, IC, LC> {
		match self {
			Node::Internal(internal) => internal,
			Node::Leaf(_) => panic!("expected internal node"),
		}
	}
}

/// Leaf: ordered entries plus a non-owning link to the next leaf.
pub(crate) struct LeafNode<K, V, const IC: usize, const LC: usize> {
	pub(crate) keys: SmallVec<[K; LC]>,
	pub(crate) values: SmallVec<[V; LC]>,
	pub(crate) right: Option<NonNull<NodeCell<K, V, IC, LC>>>,
}

/// Internal: `n` owned children separated by `n - 1` routing keys. Every key
/// in `children[i]` is `<= keys[i]`, and the last child holds everything
/// greater than the last separator. One slot of transient overflow lives in
/// the same vectors while the node's exclusive latch is held.
pub(crate) struct InternalNode<K, V, const IC: usize, const LC: usize> {
	pub(crate) keys: SmallVec<[K; IC]>,
	pub(crate) children: SmallVec<[Box<NodeCell<K, V, IC, LC>>; IC]>,
}

/// Result of a node split: the new right sibling (owned until a parent or a
/// new root adopts it) and the separator between the halves.
pub(crate) struct SplitInfo<K, V, const IC: usize, const LC: usize> {
	pub(crate) boundary: K,
	pub(crate) right: Box<NodeCell<K, V, IC, LC>>,
}

impl<K, V, const IC: usize, const LC: usize> NodeCell<K, V, IC, LC> {
	pub(crate) fn new(node: Node<K, V, IC, LC>) -> Self {
		NodeCell {
			latch: NodeLatch::new(),
			node: UnsafeCell::new(node),
		}
	}

	#[inline]
	pub(crate) fn node_mut(&mut self) -> &mut Node<K, V, IC, LC> {
		self.node.get_mut()
	}
}

impl<K: Ord + Clone, V, const IC: usize, const LC: usize> NodeCell<K, V, IC, LC> {
	/// Recursive insert with exclusive crabbing.
	///
	/// Returns the split information when this node had to split; its latch
	/// is then left held for the lowest safe ancestor to release. The caller
	/// holds the parent latch (or the tree latch) in EXCLUSIVE mode.
	pub(crate) fn insert(
		&self,
		key: K,
		value: V,
		cx: &mut LatchContext,
	) -> Option<SplitInfo<K, V, IC, LC>> {
		let depth = cx.acquire(&self.latch, Mode::Exclusive);
		// SAFETY: exclusive latch held for the kind probe.
		if unsafe { &*self.node.get() }.is_leaf() {
			self.leaf_insert(depth, key, value, cx)
		} else {
			self.internal_insert(depth, key, value, cx)
		}
	}

	fn leaf_insert(
		&self,
		depth: usize,
		key: K,
		value: V,
		cx: &mut LatchContext,
	) -> Option<SplitInfo<K, V, IC, LC>> {
		// SAFETY: exclusive latch held; the borrow ends before the latch can
		// leave this operation's hands.
		let leaf = unsafe { (*self.node.get()).as_leaf_mut() };

		// A leaf with a free slot cannot split: the retained ancestors can
		// go right away.
		if leaf.len() < LC {
			cx.release_prefix(depth, Mode::Exclusive);
		}

		let (pos, found) = leaf.search_key_index(&key);
		if found {
			leaf.values[pos] = value;
			cx.release_prefix(depth + 1, Mode::Exclusive);
			return None;
		}
		if leaf.len() < LC {
			leaf.keys.insert(pos, key);
			leaf.values.insert(pos, value);
			cx.release_prefix(depth + 1, Mode::Exclusive);
			return None;
		}

		// Full: split. The new right sibling takes the upper entries and the
		// chain link; the new entry goes to whichever side covers its
		// position. The boundary is the left half's rightmost key after the
		// insertion. Our latch stays held.
		let pivot = underflow_bound(leaf.len());
		let mut right = LeafNode::new();
		right.keys.extend(leaf.keys.drain(pivot..));
		right.values.extend(leaf.values.drain(pivot..));
		right.right = leaf.right.take();

		let mut right_cell = Box::new(NodeCell::new(Node::Leaf(right)));
		leaf.right = Some(NonNull::from(&*right_cell));

		if pos < pivot {
			leaf.keys.insert(pos, key);
			leaf.values.insert(pos, value);
		} else {
			let sibling = right_cell.node_mut().as_leaf_mut();
			sibling.keys.insert(pos - pivot, key);
			sibling.values.insert(pos - pivot, value);
		}

		let boundary = leaf.keys.last().expect("left split half cannot be empty").clone();
		Some(SplitInfo {
			boundary,
			right: right_cell,
		})
	}

	fn internal_insert(
		&self,
		depth: usize,
		key: K,
		value: V,
		cx: &mut LatchContext,
	) -> Option<SplitInfo<K, V, IC, LC>> {
		let (idx, child) = {
			// SAFETY: exclusive latch held; the borrow ends before descent.
			let internal = unsafe { &(*self.node.get()) }.as_internal();
			// With a free child slot this node absorbs any child split, so
			// the ancestors can go right away.
			if internal.len() < IC {
				cx.release_prefix(depth, Mode::Exclusive);
			}
			let idx = internal.search_child_index(&key);
			(idx, NonNull::from(internal.child(idx)))
		};

		// SAFETY: the child cell stays alive across the call: restructuring
		// it away requires this node's latch, which we hold until the child
		// (or a safe descendant) releases it through the context.
		let split = unsafe { child.as_ref() }.insert(key, value, cx);
		let Some(split) = split else {
			// Nothing propagated; the chain below already unlatched itself.
			cx.release_prefix(depth + 1, Mode::Exclusive);
			return None;
		};

		// The child split. Our latch is necessarily still held: a child with
		// a safe parent releases only latches above that parent. The split
		// boundary becomes the separator between the child and its new
		// sibling; the child's old separator now bounds the sibling.
		// SAFETY: exclusive latch still held; no other live reference.
		let internal = unsafe { (*self.node.get()).as_internal_mut() };
		internal.keys.insert(idx, split.boundary);
		internal.children.insert(idx + 1, split.right);

		if internal.len() <= IC {
			// Absorbed: this node was the lowest safe ancestor. Release it
			// and the whole retained chain below.
			cx.release_from_parent(depth, Mode::Exclusive);
			return None;
		}

		// Overflowed by the transient slot: split. The right sibling takes
		// the upper children and the separators between them; the separator
		// at the pivot is promoted as the boundary.
		let pivot = underflow_bound(internal.len());
		let mut right = InternalNode::new();
		right.children.extend(internal.children.drain(pivot..));
		let mut moved = internal.keys.drain(pivot - 1..);
		let boundary = moved.next().expect("overflowed node promotes a separator");
		right.keys.extend(moved);

		Some(SplitInfo {
			boundary,
			right: Box::new(NodeCell::new(Node::Internal(right))),
		})
	}

	/// Recursive search with shared crabbing: each node is released as soon
	/// as the next one is latched.
	pub(crate) fn search(&self, key: &K, cx: &mut LatchContext) -> Option<V>
	where
		V: Clone,
	{
		let depth = cx.acquire(&self.latch, Mode::Shared);
		cx.release_prefix(depth, Mode::Shared);
		// SAFETY: shared latch held; writers are excluded while the borrow
		// lives, and it ends before this latch is released below.
		let node = unsafe { &*self.node.get() };
		match node {
			Node::Leaf(leaf) => {
				let (pos, found) = leaf.search_key_index(key);
				let result = if found { Some(leaf.values[pos].clone()) } else { None };
				cx.release_prefix(depth + 1, Mode::Shared);
				result
			}
			Node::Internal(internal) => {
				let child = NonNull::from(internal.child(internal.search_child_index(key)));
				// SAFETY: as in internal_insert; the child latches itself
				// before our latch is released.
				unsafe { child.as_ref() }.search(key, cx)
			}
		}
	}

	/// Recursive in-place update.
	///
	/// Exclusive latches (the leaf is mutated), but released as eagerly as a
	/// read descent: an update can never restructure, so every node is safe.
	pub(crate) fn update(&self, key: &K, value: V, cx: &mut LatchContext) -> bool {
		let depth = cx.acquire(&self.latch, Mode::Exclusive);
		cx.release_prefix(depth, Mode::Exclusive);
		// SAFETY: exclusive latch held.
		let node = unsafe { &mut *self.node.get() };
		match node {
			Node::Leaf(leaf) => {
				let (pos, found) = leaf.search_key_index(key);
				if found {
					leaf.values[pos] = value;
				}
				cx.release_prefix(depth + 1, Mode::Exclusive);
				found
			}
			Node::Internal(internal) => {
				let child = NonNull::from(internal.child(internal.search_child_index(key)));
				// SAFETY: as in search.
				unsafe { child.as_ref() }.update(key, value, cx)
			}
		}
	}

	/// Recursive delete. Returns `(deleted, underflow)`; an underflowing
	/// node keeps its latch for the parent's rebalance.
	pub(crate) fn delete(&self, key: &K, cx: &mut LatchContext) -> (bool, bool) {
		let depth = cx.acquire(&self.latch, Mode::Exclusive);
		// SAFETY: exclusive latch held for the kind probe.
		if unsafe { &*self.node.get() }.is_leaf() {
			self.leaf_delete(depth, key, cx)
		} else {
			self.internal_delete(depth, key, cx)
		}
	}

	fn leaf_delete(&self, depth: usize, key: &K, cx: &mut LatchContext) -> (bool, bool) {
		// SAFETY: exclusive latch held.
		let leaf = unsafe { (*self.node.get()).as_leaf_mut() };

		// Safe when one removal cannot underflow it.
		if leaf.len() > underflow_bound(LC) {
			cx.release_prefix(depth, Mode::Exclusive);
		}

		let (pos, found) = leaf.search_key_index(key);
		let mut underflow = false;
		if found {
			leaf.keys.remove(pos);
			leaf.values.remove(pos);
			underflow = leaf.len() < underflow_bound(LC);
		}

		// An underflowing leaf keeps its latch for the parent to
		// orchestrate the rebalance; otherwise release everything retained.
		if !found || !underflow {
			cx.release_prefix(depth + 1, Mode::Exclusive);
		}
		(found, underflow)
	}

	fn internal_delete(&self, depth: usize, key: &K, cx: &mut LatchContext) -> (bool, bool) {
		let (idx, child) = {
			// SAFETY: exclusive latch held; the borrow ends before descent.
			let internal = unsafe { &(*self.node.get()) }.as_internal();
			// Safe when losing one child cannot underflow it.
			if internal.len() > underflow_bound(IC) {
				cx.release_prefix(depth, Mode::Exclusive);
			}
			let idx = internal.search_child_index(key);
			(idx, NonNull::from(internal.child(idx)))
		};

		// SAFETY: as in internal_insert.
		let (deleted, child_underflow) = unsafe { child.as_ref() }.delete(key, cx);
		if !deleted || !child_underflow {
			cx.release_prefix(depth + 1, Mode::Exclusive);
			return (deleted, false);
		}

		// The child underflowed, so it was unsafe and the chain from here
		// down is still latched.
		// SAFETY: exclusive latch still held; no other live reference.
		let internal = unsafe { (*self.node.get()).as_internal_mut() };
		if internal.len() <= 1 {
			// No sibling to rebalance against. Only a root mid-collapse
			// shrinks this far; the tree resolves it above us.
			return (true, true);
		}

		// Rebalance against a sibling, preferring the left one. The sibling
		// latch is the only latch ever taken off the descent spine, and
		// always in parent, child, sibling order.
		let target_is_right = idx >= 1;
		let left_idx = if target_is_right { idx - 1 } else { idx };
		let sibling_idx = if target_is_right { idx - 1 } else { idx + 1 };
		let sibling_latch = NonNull::from(&internal.children[sibling_idx].latch);
		// SAFETY: the sibling cell is pinned by our exclusive latch.
		unsafe { sibling_latch.as_ref() }.lock(Mode::Exclusive);

		let mut boundary = internal.keys[left_idx].clone();
		// SAFETY: parent, target and sibling are all exclusively latched.
		let merged = unsafe {
			internal.children[left_idx]
				.balance_with(&internal.children[left_idx + 1], &mut boundary)
		};

		// Only the left participant's latch stays tracked after balancing: a
		// merge destroys the right participant, whose latch must not outlive
		// it in the context.
		if target_is_right {
			// SAFETY: sibling latch locked above and now tracked instead of
			// the target's.
			cx.replace_latch(depth + 1, unsafe { sibling_latch.as_ref() }, Mode::Exclusive);
		} else {
			// SAFETY: locked above and never tracked; a merged-away sibling
			// is unreachable to others while we hold this node's latch.
			unsafe { sibling_latch.as_ref().unlock(Mode::Exclusive) };
		}

		if !merged {
			// Borrow: this node rewrites one separator and cannot underflow.
			// Ancestors first, then self and the retained chain below.
			cx.release_prefix(depth, Mode::Exclusive);
			internal.keys[left_idx] = boundary;
			cx.release_from_parent(depth, Mode::Exclusive);
			return (true, false);
		}

		// Merge: drop the separator between the halves and the consumed
		// right node. Its latch is already untracked and its contents were
		// drained into the survivor; only the husk is destroyed here.
		internal.keys.remove(left_idx);
		let husk = internal.children.remove(left_idx + 1);
		drop(husk);

		let underflow = internal.len() < underflow_bound(IC);
		if !underflow {
			cx.release_prefix(depth, Mode::Exclusive);
			cx.release_from_parent(depth, Mode::Exclusive);
		}
		(true, underflow)
	}

	/// Descends to the leaf that covers `key`, retaining that leaf's SHARED
	/// latch for handoff to an iterator. Returns the leaf and the position
	/// of the first entry `>= key`.
	pub(crate) fn locate_key(
		&self,
		key: &K,
		cx: &mut LatchContext,
	) -> (NonNull<NodeCell<K, V, IC, LC>>, usize) {
		let depth = cx.acquire(&self.latch, Mode::Shared);
		cx.release_prefix(depth, Mode::Shared);
		// SAFETY: shared latch held.
		let node = unsafe { &*self.node.get() };
		match node {
			Node::Leaf(leaf) => {
				let (pos, _) = leaf.search_key_index(key);
				(NonNull::from(self), pos)
			}
			Node::Internal(internal) => {
				let child = NonNull::from(internal.child(internal.search_child_index(key)));
				// SAFETY: as in search.
				unsafe { child.as_ref() }.locate_key(key, cx)
			}
		}
	}

	/// Repairs an underflow between `self` and its right sibling: borrows an
	/// entry across the boundary, or merges the sibling into `self` when
	/// neither side can spare one. Returns true on merge, leaving `right` a
	/// drained husk for the caller to detach and drop.
	///
	/// # Safety
	///
	/// The caller holds EXCLUSIVE latches on both cells and on their parent.
	/// This is a repair helper with external latching, not a thread-safe
	/// entry point.
	pub(crate) unsafe fn balance_with(
		&self,
		right: &NodeCell<K, V, IC, LC>,
		boundary: &mut K,
	) -> bool {
		let left = &mut *self.node.get();
		let right = &mut *right.node.get();
		match (left, right) {
			(Node::Leaf(l), Node::Leaf(r)) => l.balance(r, boundary),
			(Node::Internal(l), Node::Internal(r)) => l.balance(r, boundary),
			_ => unreachable!("balance participants must be siblings of the same kind"),
		}
	}
}

impl<K: fmt::Display, V: fmt::Display, const IC: usize, const LC: usize> fmt::Display
	for NodeCell<K, V, IC, LC>
{
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		// SAFETY: rendering requires external quiescence, like `clear`.
		match unsafe { &*self.node.get() } {
			Node::Leaf(leaf) => {
				write!(f, "[LEAF: ")?;
				for (idx, (key, value)) in leaf.keys.iter().zip(leaf.values.iter()).enumerate() {
					if idx > 0 {
						write!(f, " ")?;
					}
					write!(f, "({},{})", key, value)?;
				}
				write!(f, "]")
			}
			Node::Internal(internal) => {
				write!(f, "[INTERNAL: ")?;
				for (idx, child) in internal.children.iter().enumerate() {
					if idx > 0 {
						write!(f, " | {} | ", internal.keys[idx - 1])?;
					}
					write!(f, "{}", child)?;
				}
				write!(f, "]")
			}
		}
	}
}

impl<K, V, const IC: usize, const LC: usize> Node<K, V, IC, LC> {
	#[inline]
	pub(crate) fn as_internal(&self) -> &InternalNode<K, V, IC, LC> {
		match self {
			Node::Internal(internal) => internal,
			Node::Leaf(_) => panic!("expected internal node"),
		}
	}
}

impl<K, V, const IC: usize, const LC: usize> LeafNode<K, V, IC, LC> {
	pub(crate) fn new() -> Self {
		LeafNode {
			keys: SmallVec::new(),
			values: SmallVec::new(),
			right: None,
		}
	}

	#[inline]
	pub(crate) fn len(&self) -> usize {
		self.keys.len()
	}
}

impl<K: Ord + Clone, V, const IC: usize, const LC: usize> LeafNode<K, V, IC, LC> {
	/// Binary search: `(position, exact)` where position is the index of the
	/// first key `>= key`.
	#[inline]
	pub(crate) fn search_key_index(&self, key: &K) -> (usize, bool) {
		match self.keys.binary_search(key) {
			Ok(pos) => (pos, true),
			Err(pos) => (pos, false),
		}
	}

	fn balance(&mut self, right: &mut LeafNode<K, V, IC, LC>, boundary: &mut K) -> bool {
		let bound = underflow_bound(LC);
		if self.len() < bound && right.len() > bound {
			// Borrow the right sibling's first entry; the moved key is the
			// new boundary.
			let key = right.keys.remove(0);
			*boundary = key.clone();
			self.keys.push(key);
			self.values.push(right.values.remove(0));
			false
		} else if self.len() > bound && right.len() < bound {
			// Donate our last entry to the right sibling's front.
			right.keys.insert(0, self.keys.pop().expect("donor leaf cannot be empty"));
			right.values.insert(0, self.values.pop().expect("donor leaf cannot be empty"));
			*boundary = self.keys.last().expect("donor keeps entries").clone();
			false
		} else {
			// Neither side can spare an entry: merge the right sibling into
			// this node and inherit its chain link.
			self.keys.extend(right.keys.drain(..));
			self.values.extend(right.values.drain(..));
			self.right = right.right.take();
			*boundary = self.keys.last().expect("merge keeps the survivors").clone();
			true
		}
	}
}

impl<K, V, const IC: usize, const LC: usize> InternalNode<K, V, IC, LC> {
	pub(crate) fn new() -> Self {
		InternalNode {
			keys: SmallVec::new(),
			children: SmallVec::new(),
		}
	}

	/// Number of children; separators are always one fewer.
	#[inline]
	pub(crate) fn len(&self) -> usize {
		self.children.len()
	}

	#[inline]
	pub(crate) fn child(&self, idx: usize) -> &NodeCell<K, V, IC, LC> {
		&self.children[idx]
	}
}

impl<K: Ord + Clone, V, const IC: usize, const LC: usize> InternalNode<K, V, IC, LC> {
	/// Routing: the smallest child index whose separator is `>= key`, or the
	/// last child when every separator is smaller.
	#[inline]
	pub(crate) fn search_child_index(&self, key: &K) -> usize {
		self.keys.partition_point(|separator| separator < key)
	}

	fn balance(&mut self, right: &mut InternalNode<K, V, IC, LC>, boundary: &mut K) -> bool {
		let bound = underflow_bound(IC);
		if self.len() < bound && right.len() > bound {
			// Rotate left through the parent separator: the old boundary
			// bounds the adopted child, the sibling's first separator is
			// promoted.
			let promoted = right.keys.remove(0);
			self.keys.push(std::mem::replace(boundary, promoted));
			self.children.push(right.children.remove(0));
			false
		} else if self.len() > bound && right.len() < bound {
			// Rotate right through the parent separator.
			let demoted = self.keys.pop().expect("donor node keeps separators");
			right.keys.insert(0, std::mem::replace(boundary, demoted));
			right.children.insert(0, self.children.pop().expect("donor node cannot be empty"));
			false
		} else {
			// Merge: the parent separator lands between the two halves; the
			// caller removes it (and the husk) from the parent.
			self.keys.push(boundary.clone());
			self.keys.extend(right.keys.drain(..));
			self.children.extend(right.children.drain(..));
			true
		}
	}
}

impl<K: Ord + Clone, V, const IC: usize, const LC: usize> NodeCell<K, V, IC, LC> {
	/// Invariant walk; see [`GenericTree::check_invariants`].
	fn check(
		&mut self,
		is_root: bool,
		lower: Option<&K>,
		upper: Option<&K>,
		depth: usize,
		leaves: &mut Vec<LeafLink<K, V, IC, LC>>,
		keys_out: &mut Vec<K>,
		leaf_depths: &mut Vec<usize>,
	) where
		K: fmt::Debug,
	{
		let this = self as *const NodeCell<K, V, IC, LC>;
		match self.node.get_mut() {
			Node::Leaf(leaf) => {
				if !is_root {
					assert!(
						leaf.len() >= LC / 2 && leaf.len() <= LC,
						"leaf fill {} outside [{}, {}]",
						leaf.len(),
						LC / 2,
						LC
					);
				}
				for key in &leaf.keys {
					assert!(lower.map_or(true, |l| key > l), "leaf key {:?} below bound", key);
					assert!(upper.map_or(true, |u| key <= u), "leaf key {:?} above bound", key);
					keys_out.push(key.clone());
				}
				leaves.push((this, leaf.right.map(|p| p.as_ptr() as *const _)));
				leaf_depths.push(depth);
			}
			Node::Internal(internal) => {
				let min = if is_root { 2 } else { underflow_bound(IC) };
				assert!(
					internal.len() >= min && internal.len() <= IC,
					"internal fill {} outside [{}, {}]",
					internal.len(),
					min,
					IC
				);
				assert_eq!(
					internal.keys.len() + 1,
					internal.children.len(),
					"separator count must be one less than child count"
				);
				for separator in &internal.keys {
					assert!(lower.map_or(true, |l| separator > l), "separator below bound");
					assert!(upper.map_or(true, |u| separator <= u), "separator above bound");
				}
				let separators: Vec<K> = internal.keys.iter().cloned().collect();
				let count = internal.children.len();
				for (idx, child) in internal.children.iter_mut().enumerate() {
					let child_lower = if idx == 0 { lower } else { Some(&separators[idx - 1]) };
					let child_upper = if idx == count - 1 { upper } else { Some(&separators[idx]) };
					child.check(
						false,
						child_lower,
						child_upper,
						depth + 1,
						leaves,
						keys_out,
						leaf_depths,
					);
				}
			}
		}
	}
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
	use super::*;

	type LeafCell<const LC: usize> = NodeCell<i32, i32, 4, LC>;

	fn leaf_cell<const LC: usize>() -> LeafCell<LC> {
		NodeCell::new(Node::Leaf(LeafNode::new()))
	}

	/// Release whatever a finished operation left latched, then reset.
	fn settle(cx: &mut LatchContext, mode: Mode) {
		if cx.smallest_unlocked < cx.latches.len() {
			cx.release_from_parent(cx.smallest_unlocked, mode);
		}
		cx.clear();
	}

	fn internal_over(
		left: Box<NodeCell<i32, i32, 3, 2>>,
		right: Box<NodeCell<i32, i32, 3, 2>>,
		boundary: i32,
	) -> NodeCell<i32, i32, 3, 2> {
		let mut internal = InternalNode::new();
		internal.keys.push(boundary);
		internal.children.push(left);
		internal.children.push(right);
		NodeCell::new(Node::Internal(internal))
	}

	// -----------------------------------------------------------------------
	// Leaf nodes
	// -----------------------------------------------------------------------

	#[test]
	fn leaf_insert_keeps_entries_sorted() {
		let leaf = leaf_cell::<5>();
		let mut cx = LatchContext::new();

		for (k, v) in [(1, 1), (3, 2), (2, 5), (-1, 5), (6, 2)] {
			assert!(leaf.insert(k, v, &mut cx).is_none());
		}
		assert_eq!(cx.smallest_unlocked, cx.latches.len());
		cx.clear();

		assert_eq!(leaf.to_string(), "[LEAF: (-1,5) (1,1) (2,5) (3,2) (6,2)]");
	}

	#[test]
	fn leaf_insert_overwrites_existing_key() {
		let leaf = leaf_cell::<5>();
		let mut cx = LatchContext::new();

		assert!(leaf.insert(1, 2, &mut cx).is_none());
		assert!(leaf.insert(1, 3, &mut cx).is_none());
		cx.clear();

		assert_eq!(leaf.to_string(), "[LEAF: (1,3)]");
	}

	#[test]
	fn leaf_search_and_update() {
		let leaf = leaf_cell::<10>();
		let mut cx = LatchContext::new();

		for (k, v) in [(1, 5), (5, 8), (-1, 222)] {
			leaf.insert(k, v, &mut cx);
		}
		cx.clear();

		assert_eq!(leaf.search(&1, &mut cx), Some(5));
		assert_eq!(leaf.search(&5, &mut cx), Some(8));
		assert_eq!(leaf.search(&-1, &mut cx), Some(222));
		assert_eq!(leaf.search(&2, &mut cx), None);
		cx.clear();

		assert!(leaf.update(&5, 100, &mut cx));
		assert!(!leaf.update(&7, 7, &mut cx));
		cx.clear();
		assert_eq!(leaf.search(&5, &mut cx), Some(100));
		cx.clear();
	}

	#[test]
	fn leaf_delete_tracks_underflow() {
		let leaf = leaf_cell::<5>();
		let mut cx = LatchContext::new();

		for (k, v) in [(5, 5), (6, 6), (7, 7), (3, 3)] {
			leaf.insert(k, v, &mut cx);
		}
		cx.clear();

		// Four entries, bound is three: the first removal is safe.
		assert_eq!(leaf.delete(&6, &mut cx), (true, false));
		cx.clear();
		assert_eq!(leaf.to_string(), "[LEAF: (3,3) (5,5) (7,7)]");

		assert_eq!(leaf.delete(&6, &mut cx), (false, false));
		cx.clear();

		// The next removal underflows; the latch stays held for a parent.
		assert_eq!(leaf.delete(&3, &mut cx), (true, true));
		assert_eq!(cx.smallest_unlocked, 0);
		assert_eq!(cx.latches.len(), 1);
		settle(&mut cx, Mode::Exclusive);
		assert_eq!(leaf.to_string(), "[LEAF: (5,5) (7,7)]");
	}

	#[test]
	fn leaf_split_insert_lands_left() {
		let leaf = leaf_cell::<4>();
		let mut cx = LatchContext::new();

		for (k, v) in [(3, 3), (4, 4), (6, 6), (5, 5)] {
			assert!(leaf.insert(k, v, &mut cx).is_none());
		}
		cx.clear();

		let split = leaf.insert(1, 1, &mut cx).expect("full leaf must split");
		// The splitting leaf's latch is retained for its (absent) ancestors.
		assert_eq!(cx.smallest_unlocked, 0);
		assert_eq!(cx.latches.len(), 1);
		settle(&mut cx, Mode::Exclusive);

		assert_eq!(split.boundary, 4);
		assert_eq!(leaf.to_string(), "[LEAF: (1,1) (3,3) (4,4)]");
		assert_eq!(split.right.to_string(), "[LEAF: (5,5) (6,6)]");
	}

	#[test]
	fn leaf_split_insert_lands_right() {
		let leaf = leaf_cell::<4>();
		let mut cx = LatchContext::new();

		for (k, v) in [(3, 3), (4, 4), (7, 7), (5, 5)] {
			assert!(leaf.insert(k, v, &mut cx).is_none());
		}
		cx.clear();

		let split = leaf.insert(6, 6, &mut cx).expect("full leaf must split");
		settle(&mut cx, Mode::Exclusive);

		assert_eq!(split.boundary, 4);
		assert_eq!(leaf.to_string(), "[LEAF: (3,3) (4,4)]");
		assert_eq!(split.right.to_string(), "[LEAF: (5,5) (6,6) (7,7)]");
	}

	#[test]
	fn leaf_balance_borrows_from_right_sibling() {
		let leaf = leaf_cell::<3>();
		let mut cx = LatchContext::new();

		for (k, v) in [(3, 2), (2, 1), (-1, 5)] {
			leaf.insert(k, v, &mut cx);
		}
		cx.clear();

		let split = leaf.insert(6, 6, &mut cx).expect("full leaf must split");
		settle(&mut cx, Mode::Exclusive);
		assert_eq!(split.boundary, 2);
		assert_eq!(leaf.to_string(), "[LEAF: (-1,5) (2,1)]");
		assert_eq!(split.right.to_string(), "[LEAF: (3,2) (6,6)]");

		assert_eq!(leaf.delete(&2, &mut cx), (true, true));
		settle(&mut cx, Mode::Exclusive);
		assert_eq!(leaf.to_string(), "[LEAF: (-1,5)]");

		let right = split.right;
		assert!(right.insert(1, 7, &mut cx).is_none());
		cx.clear();
		assert_eq!(right.to_string(), "[LEAF: (1,7) (3,2) (6,6)]");

		// Balance requires caller-held latches on both participants.
		cx.acquire(&leaf.latch, Mode::Exclusive);
		cx.acquire(&right.latch, Mode::Exclusive);
		let mut boundary = 2;
		let merged = unsafe { leaf.balance_with(&right, &mut boundary) };
		settle(&mut cx, Mode::Exclusive);

		assert!(!merged);
		assert_eq!(boundary, 1);
		assert_eq!(leaf.to_string(), "[LEAF: (-1,5) (1,7)]");
		assert_eq!(right.to_string(), "[LEAF: (3,2) (6,6)]");
	}

	#[test]
	fn leaf_balance_merges_when_neither_side_can_spare() {
		let leaf = leaf_cell::<3>();
		let mut cx = LatchContext::new();

		for (k, v) in [(3, 2), (2, 1), (-1, 5)] {
			leaf.insert(k, v, &mut cx);
		}
		assert_eq!(cx.smallest_unlocked, 3);
		assert_eq!(cx.latches.len(), 3);
		cx.clear();

		let split = leaf.insert(6, 6, &mut cx).expect("full leaf must split");
		assert_eq!(split.boundary, 2);
		settle(&mut cx, Mode::Exclusive);

		assert_eq!(leaf.delete(&2, &mut cx), (true, true));
		settle(&mut cx, Mode::Exclusive);
		assert_eq!(leaf.to_string(), "[LEAF: (-1,5)]");

		let right = split.right;
		cx.acquire(&leaf.latch, Mode::Exclusive);
		cx.acquire(&right.latch, Mode::Exclusive);
		let mut boundary = 2;
		let merged = unsafe { leaf.balance_with(&right, &mut boundary) };
		settle(&mut cx, Mode::Exclusive);

		assert!(merged);
		assert_eq!(boundary, 6);
		assert_eq!(leaf.to_string(), "[LEAF: (-1,5) (3,2) (6,6)]");
	}

	// -----------------------------------------------------------------------
	// Internal nodes
	// -----------------------------------------------------------------------

	fn small_leaf(entries: &[(i32, i32)]) -> Box<NodeCell<i32, i32, 3, 2>> {
		let cell = Box::new(NodeCell::new(Node::Leaf(LeafNode::new())));
		let mut cx = LatchContext::new();
		for (k, v) in entries {
			assert!(cell.insert(*k, *v, &mut cx).is_none());
		}
		cx.clear();
		cell
	}

	#[test]
	fn internal_insert_routes_to_children() {
		let internal = internal_over(small_leaf(&[(1, 1)]), small_leaf(&[(3, 3)]), 2);
		let mut cx = LatchContext::new();

		assert_eq!(internal.to_string(), "[INTERNAL: [LEAF: (1,1)] | 2 | [LEAF: (3,3)]]");

		assert!(internal.insert(2, 2, &mut cx).is_none());
		assert_eq!(internal.to_string(), "[INTERNAL: [LEAF: (1,1) (2,2)] | 2 | [LEAF: (3,3)]]");

		assert!(internal.insert(4, 4, &mut cx).is_none());
		assert_eq!(
			internal.to_string(),
			"[INTERNAL: [LEAF: (1,1) (2,2)] | 2 | [LEAF: (3,3) (4,4)]]"
		);
		cx.clear();
	}

	#[test]
	fn internal_absorbs_child_split_then_splits_itself() {
		let leaf = Box::new(NodeCell::<i32, i32, 3, 2>::new(Node::Leaf(LeafNode::new())));
		let mut cx = LatchContext::new();

		assert!(leaf.insert(3, 3, &mut cx).is_none());
		assert!(leaf.insert(5, 5, &mut cx).is_none());
		cx.clear();
		let split = leaf.insert(6, 6, &mut cx).expect("full leaf must split");
		settle(&mut cx, Mode::Exclusive);

		let internal = internal_over(leaf, split.right, split.boundary);
		assert_eq!(internal.to_string(), "[INTERNAL: [LEAF: (3,3)] | 3 | [LEAF: (5,5) (6,6)]]");

		// A child split absorbed by this node releases the whole chain.
		assert!(internal.insert(4, 4, &mut cx).is_none());
		assert_eq!(cx.smallest_unlocked, 2);
		assert_eq!(cx.latches.len(), 2);
		cx.clear();
		assert_eq!(
			internal.to_string(),
			"[INTERNAL: [LEAF: (3,3)] | 3 | [LEAF: (4,4) (5,5)] | 5 | [LEAF: (6,6)]]"
		);

		assert!(internal.insert(2, 2, &mut cx).is_none());
		cx.clear();
		assert_eq!(
			internal.to_string(),
			"[INTERNAL: [LEAF: (2,2) (3,3)] | 3 | [LEAF: (4,4) (5,5)] | 5 | [LEAF: (6,6)]]"
		);

		// One more split overflows this node; it splits in turn, keeping its
		// latch for the (absent) ancestors.
		let split = internal.insert(1, 1, &mut cx).expect("overflowed node must split");
		assert_eq!(cx.smallest_unlocked, 0);
		assert_eq!(cx.latches.len(), 2);
		settle(&mut cx, Mode::Exclusive);

		assert_eq!(split.boundary, 3);
		assert_eq!(internal.to_string(), "[INTERNAL: [LEAF: (1,1) (2,2)] | 2 | [LEAF: (3,3)]]");
		assert_eq!(
			split.right.to_string(),
			"[INTERNAL: [LEAF: (4,4) (5,5)] | 5 | [LEAF: (6,6)]]"
		);
	}

	#[test]
	fn internal_delete_rebalances_children() {
		// Build [INTERNAL: [I: L(1,2) |2| L(3)] |3| [I: L(4,5) |5| L(6) |6| L(7,8)]]
		// through the same insert sequence the split tests use.
		let leaf = Box::new(NodeCell::<i32, i32, 3, 2>::new(Node::Leaf(LeafNode::new())));
		let mut cx = LatchContext::new();
		leaf.insert(3, 3, &mut cx);
		leaf.insert(5, 5, &mut cx);
		cx.clear();
		let split = leaf.insert(6, 6, &mut cx).expect("split");
		settle(&mut cx, Mode::Exclusive);
		let internal = internal_over(leaf, split.right, split.boundary);
		for (k, v) in [(4, 4), (2, 2)] {
			assert!(internal.insert(k, v, &mut cx).is_none());
			cx.clear();
		}
		let split = internal.insert(1, 1, &mut cx).expect("split");
		settle(&mut cx, Mode::Exclusive);
		let root = internal_over(Box::new(internal), split.right, split.boundary);
		for (k, v) in [(7, 7), (8, 8)] {
			assert!(root.insert(k, v, &mut cx).is_none());
			cx.clear();
		}
		assert_eq!(
			root.to_string(),
			"[INTERNAL: [INTERNAL: [LEAF: (1,1) (2,2)] | 2 | [LEAF: (3,3)]] | 3 | \
			 [INTERNAL: [LEAF: (4,4) (5,5)] | 5 | [LEAF: (6,6)] | 6 | [LEAF: (7,7) (8,8)]]]"
		);

		// Deleting 3 underflows its leaf; the left sibling donates and the
		// subtree separator is rewritten.
		assert_eq!(root.delete(&3, &mut cx), (true, false));
		assert_eq!(cx.smallest_unlocked, cx.latches.len());
		cx.clear();
		assert_eq!(
			root.to_string(),
			"[INTERNAL: [INTERNAL: [LEAF: (1,1)] | 1 | [LEAF: (2,2)]] | 3 | \
			 [INTERNAL: [LEAF: (4,4) (5,5)] | 5 | [LEAF: (6,6)] | 6 | [LEAF: (7,7) (8,8)]]]"
		);

		// Deleting 2 merges two leaves, underflowing the left subtree, which
		// then borrows a child from its right sibling through the root.
		assert_eq!(root.delete(&2, &mut cx), (true, false));
		cx.clear();
		assert_eq!(
			root.to_string(),
			"[INTERNAL: [INTERNAL: [LEAF: (1,1)] | 3 | [LEAF: (4,4) (5,5)]] | 5 | \
			 [INTERNAL: [LEAF: (6,6)] | 6 | [LEAF: (7,7) (8,8)]]]"
		);
	}

	#[test]
	fn internal_delete_reports_root_underflow() {
		let root = internal_over(small_leaf(&[(1, 1)]), small_leaf(&[(3, 3)]), 2);
		let mut cx = LatchContext::new();

		// Merging the two leaves leaves the root with a single child; it
		// keeps the spine latched and reports the underflow upward.
		assert_eq!(root.delete(&3, &mut cx), (true, true));
		assert_eq!(cx.smallest_unlocked, 0);
		settle(&mut cx, Mode::Exclusive);
		assert_eq!(root.to_string(), "[INTERNAL: [LEAF: (1,1)]]");
	}

	#[test]
	fn locate_key_retains_only_the_leaf_latch() {
		let internal = internal_over(small_leaf(&[(1, 1)]), small_leaf(&[(3, 3), (4, 4)]), 2);
		let mut cx = LatchContext::new();

		let (leaf, pos) = internal.locate_key(&3, &mut cx);
		assert_eq!(pos, 0);
		assert_eq!(cx.smallest_unlocked, cx.latches.len() - 1);
		// SAFETY: the located leaf is still latched SHARED.
		assert_eq!(unsafe { &*leaf.as_ref().node.get() }.as_leaf().keys[pos], 3);
		settle(&mut cx, Mode::Shared);

		// A missing key still lands on (and latches) the covering leaf.
		let (_, pos) = internal.locate_key(&9, &mut cx);
		assert_eq!(pos, 2);
		settle(&mut cx, Mode::Shared);
	}

	// -----------------------------------------------------------------------
	// Fixture-built trees
	// -----------------------------------------------------------------------

	#[test]
	fn fixture_tree_borrows_across_subtrees() {
		let mut tree = util::sample_tree(
			r#"{
				"root": {
					"separators": [4],
					"children": [
						{ "entries": [[1, 1], [2, 2], [3, 3]] },
						{ "entries": [[5, 5], [6, 6], [7, 7], [8, 8]] }
					]
				}
			}"#,
		);
		tree.check_invariants();
		assert_eq!(
			tree.to_string(),
			"[INTERNAL: [LEAF: (1,1) (2,2) (3,3)] | 4 | [LEAF: (5,5) (6,6) (7,7) (8,8)]]"
		);

		// Underflowing the left leaf pulls the right sibling's first entry
		// across and rewrites the separator.
		assert!(tree.remove(&2));
		assert!(tree.remove(&3));
		tree.check_invariants();
		assert_eq!(
			tree.to_string(),
			"[INTERNAL: [LEAF: (1,1) (5,5)] | 5 | [LEAF: (6,6) (7,7) (8,8)]]"
		);
	}

	#[test]
	fn fixture_tree_collapses_root_after_merge() {
		let mut tree = util::sample_tree(
			r#"{
				"root": {
					"separators": [2],
					"children": [
						{ "entries": [[1, 1], [2, 2]] },
						{ "entries": [[3, 3], [4, 4]] }
					]
				}
			}"#,
		);
		tree.check_invariants();

		assert!(tree.remove(&1));
		tree.check_invariants();
		assert_eq!(tree.to_string(), "[LEAF: (2,2) (3,3) (4,4)]");
	}
}
