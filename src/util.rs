//! Test fixtures: build a tree with an exact shape from a JSON description.
//!
//! Driving a tree into a particular shape through inserts alone is
//! order-sensitive and brittle; a fixture states the shape directly:
//!
//! ```json
//! {
//!   "root": {
//!     "separators": [4],
//!     "children": [
//!       { "entries": [[1, 1], [2, 2], [3, 3]] },
//!       { "entries": [[5, 5], [6, 6], [7, 7], [8, 8]] }
//!     ]
//!   }
//! }
//! ```
//!
//! Internal nodes carry `separators` and `children`; leaves carry `entries`
//! as `[key, value]` pairs in ascending key order. The loader wires the leaf
//! sibling chain left to right. Fixtures use `i64` keys and values and the
//! capacity-4 tree; the loader does not validate fill bounds, so a fixture
//! can also state deliberately illegal shapes if a test needs one.

use serde::Deserialize;
use std::cell::UnsafeCell;
use std::ptr::NonNull;

use crate::latch::NodeLatch;
use crate::{GenericTree, InternalNode, LeafNode, Node, NodeCell};

type FixtureTree = GenericTree<i64, i64, 4, 4>;
type FixtureCell = NodeCell<i64, i64, 4, 4>;

#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum TreeNode {
	Internal {
		separators: Vec<i64>,
		children: Vec<TreeNode>,
	},
	Leaf {
		entries: Vec<(i64, i64)>,
	},
}

#[derive(Deserialize, Debug)]
struct SampleTree {
	root: TreeNode,
}

fn translate(node: TreeNode) -> Box<FixtureCell> {
	match node {
		TreeNode::Internal {
			separators,
			children,
		} => {
			assert_eq!(
				separators.len() + 1,
				children.len(),
				"fixture internal node needs one more child than separators"
			);
			let mut internal = InternalNode::new();
			internal.keys.extend(separators);
			internal.children.extend(children.into_iter().map(translate));
			Box::new(NodeCell::new(Node::Internal(internal)))
		}
		TreeNode::Leaf {
			entries,
		} => {
			let mut leaf = LeafNode::new();
			for (key, value) in entries {
				leaf.keys.push(key);
				leaf.values.push(value);
			}
			Box::new(NodeCell::new(Node::Leaf(leaf)))
		}
	}
}

fn collect_leaves(cell: &mut FixtureCell, out: &mut Vec<NonNull<FixtureCell>>) {
	let this = NonNull::from(&*cell);
	match cell.node_mut() {
		Node::Leaf(_) => out.push(this),
		Node::Internal(internal) => {
			for child in internal.children.iter_mut() {
				collect_leaves(child, out);
			}
		}
	}
}

/// Parses a JSON fixture into a live tree with a wired leaf chain.
pub(crate) fn sample_tree(json: &str) -> FixtureTree {
	let parsed: SampleTree = serde_json::from_str(json).expect("fixture must parse");
	let mut root = translate(parsed.root);

	let mut leaves = Vec::new();
	collect_leaves(&mut root, &mut leaves);
	for idx in 0..leaves.len() {
		let next = leaves.get(idx + 1).copied();
		let mut cell = leaves[idx];
		// SAFETY: construction is single threaded and no other reference is
		// live; each leaf pointer is visited exactly once.
		unsafe { cell.as_mut() }.node_mut().as_leaf_mut().right = next;
	}

	GenericTree {
		latch: NodeLatch::new(),
		root: UnsafeCell::new(root),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fixture_round_trips_through_rendering() {
		let tree = sample_tree(
			r#"{
				"root": {
					"separators": [2, 4],
					"children": [
						{ "entries": [[1, 10], [2, 20]] },
						{ "entries": [[3, 30], [4, 40]] },
						{ "entries": [[5, 50], [6, 60]] }
					]
				}
			}"#,
		);
		assert_eq!(
			tree.to_string(),
			"[INTERNAL: [LEAF: (1,10) (2,20)] | 2 | [LEAF: (3,30) (4,40)] | 4 | \
			 [LEAF: (5,50) (6,60)]]"
		);
		assert_eq!(tree.search(&5), Some(50));

		// The wired chain feeds a full scan across all three leaves.
		let mut scan = tree.tree_scan();
		let mut seen = Vec::new();
		while let Ok(Some((key, _))) = scan.next() {
			seen.push(key);
		}
		assert_eq!(seen, vec![1, 2, 3, 4, 5, 6]);
	}
}
