//! Diagnostic invariant checks, used by stress tests and debugging tools.

use crate::config::MAX_TREE_HEIGHT;
use crate::error::{Error, Result};
use crate::node::NodeId;
use crate::store::Store;
use crate::tree::SubTree;

impl Store {
    /// Walks one subtree checking the AVL invariants: sibling heights differ
    /// by at most one and every stored balance factor matches the actual
    /// height difference. Returns `Corrupt` on the first violation.
    pub fn verify_tree(&self, parent: NodeId, tree: SubTree) -> Result<()> {
        self.read_op(|| {
            let root = self.resolve_tree_root(parent, tree)?;
            check_subtree(self, root, 0)?;
            Ok(())
        })
    }
}

fn check_subtree(db: &Store, off: u32, depth: usize) -> Result<i32> {
    if off == 0 {
        return Ok(0);
    }
    if depth >= MAX_TREE_HEIGHT {
        return Err(Error::Corrupt("tree deeper than the height bound"));
    }
    let node = db.pin_node(off, None)?;
    let left = node.left()?;
    let right = node.right()?;
    let bf = node.bf()?;
    drop(node);

    let left_height = check_subtree(db, left, depth + 1)?;
    let right_height = check_subtree(db, right, depth + 1)?;
    if (left_height - right_height).abs() > 1 {
        return Err(Error::Corrupt("AVL height invariant violated"));
    }
    if bf != right_height - left_height {
        return Err(Error::Corrupt("stored balance factor is wrong"));
    }
    Ok(left_height.max(right_height) + 1)
}
