//! # In-Order Cursor
//!
//! Streams the nodes of one subtree in name order using an explicit stack of
//! node offsets. The cursor holds no page pins between calls: `first` and
//! `next` each take the shared database lock, pin pages only while stepping,
//! and return bare node ids. Offsets stay valid across eviction, so a page
//! leaving the cache between calls is harmless.
//!
//! A writer running between two calls may restructure the tree; iteration
//! may then skip or repeat nodes, but it cannot corrupt the store. Callers
//! that need a stable view serialize against writers or snapshot the names
//! first.
//!
//! ## Seek
//!
//! `first` with a key positions the cursor with a seek-and-push: descend
//! comparing against the key, pushing every node that lies on the result
//! side, and stop on equality or a missing child. If the key is absent the
//! stack top is the smallest greater node (ascending) or the largest smaller
//! one (descending).

use std::cmp::Ordering;

use arrayvec::ArrayVec;

use crate::config::MAX_TREE_HEIGHT;
use crate::error::{Error, Result};
use crate::node::{Key, NodeId, NodePin};
use crate::store::Store;
use crate::tree::SubTree;

/// Traversal direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

/// An in-order cursor over one subtree.
pub struct Cursor<'s> {
    store: &'s Store,
    stack: ArrayVec<u32, MAX_TREE_HEIGHT>,
    tree: SubTree,
    order: Order,
}

impl<'s> Cursor<'s> {
    pub(crate) fn new(store: &'s Store, tree: SubTree, order: Order) -> Self {
        Self {
            store,
            stack: ArrayVec::new(),
            tree,
            order,
        }
    }

    fn descending(&self) -> bool {
        self.order == Order::Descending
    }

    fn push(&mut self, off: u32) -> Result<()> {
        self.stack
            .try_push(off)
            .map_err(|_| Error::Corrupt("backtrace stack overflow"))
    }

    /// Positions the cursor at the first node of the subtree under `parent`:
    /// the extreme node in traversal order, or, when `key` is given, the node
    /// equal to it if present and its in-order neighbor otherwise. Returns
    /// `NotFound` on an empty subtree or when the seek runs off the end.
    pub fn first(&mut self, parent: NodeId, key: Option<&Key<'_>>) -> Result<NodeId> {
        if let Some(key) = key {
            key.validate()?;
        }
        self.stack.clear();
        let _guard = self.store.shared_lock();
        let root = self.store.resolve_tree_root(parent, self.tree)?;
        match key {
            Some(key) => self.seek(key, root),
            None => self.descend_push(root),
        }
    }

    /// Advances to the next node in traversal order. Returns `NotFound` when
    /// the subtree is exhausted.
    pub fn next(&mut self) -> Result<NodeId> {
        if self.stack.is_empty() {
            return Err(Error::NotFound);
        }
        let _guard = self.store.shared_lock();
        let top = self.stack.pop().expect("stack checked non-empty");
        let node = self.store.pin_node(top, None)?;
        let child = if self.descending() {
            node.left()?
        } else {
            node.right()?
        };
        drop(node);
        self.descend_push(child)
    }

    /// Pushes the path from `off` to the traversal-order extreme of its
    /// subtree and returns the new stack top without popping it.
    fn descend_push(&mut self, mut off: u32) -> Result<NodeId> {
        let descending = self.descending();
        let mut near: Option<NodePin> = None;
        while off != 0 {
            self.push(off)?;
            let node = self.store.pin_node(off, near.as_ref().map(|n| n.guard()))?;
            off = if descending {
                node.right()?
            } else {
                node.left()?
            };
            near = Some(node);
        }
        match self.stack.last() {
            Some(&top) => Ok(NodeId(top)),
            None => Err(Error::NotFound),
        }
    }

    /// Seek-and-push: walks toward `key`, keeping on the stack every node on
    /// the result side of the walk.
    fn seek(&mut self, key: &Key<'_>, mut off: u32) -> Result<NodeId> {
        if off == 0 {
            return Err(Error::NotFound);
        }
        let descending = self.descending();
        let mut near: Option<NodePin> = None;
        loop {
            let node = self.store.pin_node(off, near.as_ref().map(|n| n.guard()))?;
            let ord = node.compare_key(key)?;
            let toward = match ord {
                Ordering::Less => -1,
                Ordering::Equal => 0,
                Ordering::Greater => 1,
            };
            let result_side = if descending { -toward } else { toward };
            if result_side <= 0 {
                self.push(off)?;
            }
            if toward == 0 {
                return Ok(NodeId(off));
            }
            let child = if toward < 0 { node.left()? } else { node.right()? };
            if child == 0 {
                break;
            }
            near = Some(node);
            off = child;
        }
        match self.stack.last() {
            Some(&top) => Ok(NodeId(top)),
            None => Err(Error::NotFound),
        }
    }
}
