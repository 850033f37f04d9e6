//! # AVL Tree Operator
//!
//! Search, insert and delete over AVL trees whose nodes live inside data
//! pages. Child links are file offsets, the balance factor sits in the node
//! header, and every node access pins the containing page through the cache.
//!
//! ## Back-Trace Stack
//!
//! There is no recursion and no parent pointer. Descending records
//! `{node offset, direction}` frames on an explicit stack bounded by the
//! maximum tree height of 64. After an insert or delete the stack is
//! unwound to maintain balance factors and rotate where a subtree got two
//! levels out of balance. A well-formed tree never exceeds the bound, so an
//! overflow is reported as an internal error.
//!
//! ## Pinning
//!
//! Descent is hand-over-hand: the child's page is pinned before the parent's
//! pin is released, so the reference being followed can never be evicted
//! mid-hop. When parent and child share a page the pin count is simply
//! raised. Rotations pin at most three nodes at a time.
//!
//! ## Roots
//!
//! A tree is named by where its root reference lives: the header's top-level
//! key tree, the header's back-link tree, or one of the two root fields in a
//! key node. `RootRef` carries that place so rebalancing can rewrite the
//! root reference when a rotation changes the tree's top.

use std::cmp::Ordering;

use arrayvec::ArrayVec;

use crate::config::MAX_TREE_HEIGHT;
use crate::error::{Error, Result};
use crate::node::{Key, NodePin};
use crate::storage::cache::PageGuard;
use crate::storage::page;
use crate::store::Store;

pub mod cursor;

/// Selects one of the two trees a key owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubTree {
    /// The child keys of a key.
    Keys,
    /// The typed values of a key.
    Values,
}

/// Names the place a tree's root reference is stored.
#[derive(Debug, Clone)]
pub(crate) enum RootRef {
    /// The top-level key tree in the header page.
    HeaderChildren,
    /// The back-link tree in the header page.
    HeaderLinks,
    /// One of the root fields of a key node.
    Node { key: u32, tree: SubTree },
}

/// One level of the descent: the ancestor and which side was taken.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BtFrame {
    pub node: u32,
    pub dir: i8,
}

pub(crate) type BtStack = ArrayVec<BtFrame, MAX_TREE_HEIGHT>;

fn push(stack: &mut BtStack, frame: BtFrame) -> Result<()> {
    stack
        .try_push(frame)
        .map_err(|_| Error::Internal("backtrace stack overflow"))
}

fn sign(ord: Ordering) -> i8 {
    match ord {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }
}

pub(crate) fn root_get(db: &Store, root: &RootRef) -> Result<u32> {
    match root {
        RootRef::HeaderChildren => Ok(db.with_header(|p| page::header_fields(p).children_root())),
        RootRef::HeaderLinks => Ok(db.with_header(|p| page::header_fields(p).links_root())),
        RootRef::Node { key, tree } => {
            let node = db.pin_node(*key, None)?;
            match tree {
                SubTree::Keys => node.children_root(),
                SubTree::Values => node.values_root(),
            }
        }
    }
}

pub(crate) fn root_set(db: &Store, root: &RootRef, value: u32) -> Result<()> {
    match root {
        RootRef::HeaderChildren => {
            db.with_header_mut(|p| page::header_fields_mut(p).set_children_root(value));
            Ok(())
        }
        RootRef::HeaderLinks => {
            db.with_header_mut(|p| page::header_fields_mut(p).set_links_root(value));
            Ok(())
        }
        RootRef::Node { key, tree } => {
            let node = db.pin_node(*key, None)?;
            match tree {
                SubTree::Keys => node.set_children_root(value),
                SubTree::Values => node.set_values_root(value),
            }
        }
    }
}

/// What a back-traced search produced: the node itself when the key exists,
/// the descent stack, and (on a miss) a pin on the page holding the last
/// examined node, used as an allocation hint so neighbors cluster.
pub(crate) struct SearchOutcome {
    pub found: Option<NodePin>,
    pub stack: BtStack,
    pub hint: Option<PageGuard>,
}

/// Descends from `root` recording the back trace. On a hit the stack holds
/// the path of strict ancestors; on a miss its top names the insertion point.
pub(crate) fn search(db: &Store, key: &Key<'_>, root: &RootRef) -> Result<SearchOutcome> {
    let mut stack = BtStack::new();
    let mut cur_ref = root_get(db, root)?;
    if cur_ref == 0 {
        return Ok(SearchOutcome {
            found: None,
            stack,
            hint: None,
        });
    }

    let mut cur = db.pin_node(cur_ref, None)?;
    loop {
        let ord = cur.compare_key(key)?;
        if ord == Ordering::Equal {
            return Ok(SearchOutcome {
                found: Some(cur),
                stack,
                hint: None,
            });
        }
        let dir = sign(ord);
        push(&mut stack, BtFrame { node: cur_ref, dir })?;
        let child = if dir < 0 { cur.left()? } else { cur.right()? };
        if child == 0 {
            let hint = Some(cur.guard().clone_pin());
            return Ok(SearchOutcome {
                found: None,
                stack,
                hint,
            });
        }
        let next = db.pin_node(child, Some(cur.guard()))?;
        cur = next;
        cur_ref = child;
    }
}

/// Plain lookup without a back trace.
pub(crate) fn find(db: &Store, key: &Key<'_>, root: &RootRef) -> Result<Option<NodePin>> {
    let mut cur_ref = root_get(db, root)?;
    let mut near: Option<NodePin> = None;
    while cur_ref != 0 {
        let cur = db.pin_node(cur_ref, near.as_ref().map(|n| n.guard()))?;
        let ord = cur.compare_key(key)?;
        if ord == Ordering::Equal {
            return Ok(Some(cur));
        }
        cur_ref = if ord == Ordering::Less {
            cur.left()?
        } else {
            cur.right()?
        };
        near = Some(cur);
    }
    Ok(None)
}

/// Attaches a freshly created node at the search stack's insertion point and
/// restores balance along the recorded path.
pub(crate) fn insert(db: &Store, node: &NodePin, stack: &mut BtStack, root: &RootRef) -> Result<()> {
    node.set_bf(0)?;
    let top = match stack.last() {
        Some(frame) => *frame,
        None => return root_set(db, root, node.off()),
    };

    let parent = db.pin_node(top.node, Some(node.guard()))?;
    if top.dir < 0 {
        debug_assert_eq!(parent.left()?, 0);
        parent.set_left(node.off())?;
    } else {
        debug_assert_eq!(parent.right()?, 0);
        parent.set_right(node.off())?;
    }
    drop(parent);
    rebalance_after_insert(db, stack, root)
}

/// Walks the back trace after an insert. Each ancestor saw its subtree grow
/// on the recorded side: a balanced ancestor leans and the walk continues; a
/// lean on the other side cancels out and the walk stops; a lean on the same
/// side means the node is two out of balance and one rotation finishes the
/// whole insert.
fn rebalance_after_insert(db: &Store, stack: &mut BtStack, root: &RootRef) -> Result<()> {
    while let Some(frame) = stack.pop() {
        let cur = db.pin_node(frame.node, None)?;
        let dir = frame.dir as i32;
        let bf = cur.bf()?;
        if bf == 0 {
            cur.set_bf(dir)?;
            continue;
        }
        if bf + dir != 0 {
            let new_root = if bf > 0 {
                let z = db.pin_node(cur.right()?, Some(cur.guard()))?;
                if z.bf()? > 0 {
                    rotate_left(&cur, &z)?;
                    z
                } else {
                    rotate_right_left(db, &cur, z)?
                }
            } else {
                let z = db.pin_node(cur.left()?, Some(cur.guard()))?;
                if z.bf()? < 0 {
                    rotate_right(&cur, &z)?;
                    z
                } else {
                    rotate_left_right(db, &cur, z)?
                }
            };
            set_parent_ref(db, stack.last(), cur.off(), new_root.off(), root)?;
            break;
        }
        cur.set_bf(0)?;
        break;
    }
    Ok(())
}

/// Unlinks `node` from its tree and restores balance. The caller frees the
/// node's storage afterwards.
pub(crate) fn remove(db: &Store, node: &NodePin, stack: &mut BtStack, root: &RootRef) -> Result<()> {
    let left = node.left()?;
    let right = node.right()?;

    if left == 0 && right == 0 {
        replace_child(db, stack, root, 0)?;
    } else if left == 0 || right == 0 {
        let child = if left != 0 { left } else { right };
        replace_child(db, stack, root, child)?;
    } else {
        splice_successor(db, node, stack, root)?;
    }

    rebalance_after_delete(db, stack, root)?;
    node.set_left(0)?;
    node.set_right(0)?;
    Ok(())
}

/// Removes a node from its tree and releases its page storage.
pub(crate) fn delete_node(
    db: &Store,
    node: &NodePin,
    stack: &mut BtStack,
    root: &RootRef,
) -> Result<()> {
    remove(db, node, stack, root)?;
    node.guard().with_mut(|p| page::free_node(p, node.slot()))
}

/// Rewrites the reference that points at the node being removed: the child
/// slot named by the stack top, or the tree's root reference.
fn replace_child(db: &Store, stack: &BtStack, root: &RootRef, new_child: u32) -> Result<()> {
    match stack.last() {
        Some(frame) => {
            let parent = db.pin_node(frame.node, None)?;
            if frame.dir < 0 {
                parent.set_left(new_child)
            } else {
                parent.set_right(new_child)
            }
        }
        None => root_set(db, root, new_child),
    }
}

/// Two-children removal: the in-order successor (leftmost node of the right
/// subtree) is spliced into the removed node's place, inheriting its balance
/// factor, and the stack is rewritten so the balance walk sees the successor
/// at the removed node's position.
fn splice_successor(db: &Store, node: &NodePin, stack: &mut BtStack, root: &RootRef) -> Result<()> {
    push(stack, BtFrame { node: node.off(), dir: 1 })?;
    let delpos = stack.len() - 1;

    let mut succ_is_right_child = true;
    let mut parent = node.clone_pin();
    let mut succ = db.pin_node(node.right()?, Some(node.guard()))?;
    loop {
        let left = succ.left()?;
        if left == 0 {
            break;
        }
        push(stack, BtFrame { node: succ.off(), dir: -1 })?;
        let next = db.pin_node(left, Some(succ.guard()))?;
        parent = succ;
        succ_is_right_child = false;
        succ = next;
    }

    succ.set_left(node.left()?)?;
    if !succ_is_right_child {
        parent.set_left(succ.right()?)?;
        succ.set_right(node.right()?)?;
    }

    let above = if delpos == 0 {
        None
    } else {
        stack.get(delpos - 1)
    };
    set_parent_ref(db, above, node.off(), succ.off(), root)?;

    stack[delpos] = BtFrame {
        node: succ.off(),
        dir: 1,
    };
    succ.set_bf(node.bf()?)?;
    Ok(())
}

/// Walks the back trace after a delete. The recorded side of each ancestor
/// lost height: its balance moves toward the other side, rotating when it
/// would reach two. A rotation around a balanced child keeps the subtree
/// height, which ends the walk.
fn rebalance_after_delete(db: &Store, stack: &mut BtStack, root: &RootRef) -> Result<()> {
    while let Some(frame) = stack.pop() {
        let cur = db.pin_node(frame.node, None)?;
        let bf = cur.bf()?;
        if frame.dir < 0 {
            if bf > 0 {
                let z = db.pin_node(cur.right()?, Some(cur.guard()))?;
                let zb = z.bf()?;
                let new_root = if zb < 0 {
                    rotate_right_left(db, &cur, z)?
                } else {
                    rotate_left(&cur, &z)?;
                    z
                };
                set_parent_ref(db, stack.last(), cur.off(), new_root.off(), root)?;
                if zb == 0 {
                    break;
                }
            } else if bf == 0 {
                cur.set_bf(1)?;
                break;
            } else {
                cur.set_bf(0)?;
            }
        } else if bf < 0 {
            let z = db.pin_node(cur.left()?, Some(cur.guard()))?;
            let zb = z.bf()?;
            let new_root = if zb > 0 {
                rotate_left_right(db, &cur, z)?
            } else {
                rotate_right(&cur, &z)?;
                z
            };
            set_parent_ref(db, stack.last(), cur.off(), new_root.off(), root)?;
            if zb == 0 {
                break;
            }
        } else if bf == 0 {
            cur.set_bf(-1)?;
            break;
        } else {
            cur.set_bf(0)?;
        }
    }
    Ok(())
}

/// Points the child reference above `old_child` (or the root reference when
/// the frame is absent) at `new_child` after a rotation or splice.
fn set_parent_ref(
    db: &Store,
    frame: Option<&BtFrame>,
    old_child: u32,
    new_child: u32,
    root: &RootRef,
) -> Result<()> {
    match frame {
        Some(frame) => {
            let parent = db.pin_node(frame.node, None)?;
            if parent.left()? == old_child {
                parent.set_left(new_child)
            } else if parent.right()? == old_child {
                parent.set_right(new_child)
            } else {
                Err(Error::Internal("rotated subtree is detached from its parent"))
            }
        }
        None => root_set(db, root, new_child),
    }
}

fn rotate_left(x: &NodePin, z: &NodePin) -> Result<()> {
    let t23 = z.left()?;
    x.set_right(t23)?;
    z.set_left(x.off())?;
    if z.bf()? == 0 {
        x.set_bf(1)?;
        z.set_bf(-1)?;
    } else {
        x.set_bf(0)?;
        z.set_bf(0)?;
    }
    Ok(())
}

fn rotate_right(x: &NodePin, z: &NodePin) -> Result<()> {
    let t23 = z.right()?;
    x.set_left(t23)?;
    z.set_right(x.off())?;
    if z.bf()? == 0 {
        x.set_bf(-1)?;
        z.set_bf(1)?;
    } else {
        x.set_bf(0)?;
        z.set_bf(0)?;
    }
    Ok(())
}

fn rotate_right_left(db: &Store, x: &NodePin, z: NodePin) -> Result<NodePin> {
    let y = db.pin_node(z.left()?, Some(z.guard()))?;
    let yb = y.bf()?;
    let t3 = y.right()?;
    z.set_left(t3)?;
    y.set_right(z.off())?;
    let t2 = y.left()?;
    x.set_right(t2)?;
    y.set_left(x.off())?;
    if yb == 0 {
        x.set_bf(0)?;
        z.set_bf(0)?;
    } else if yb > 0 {
        x.set_bf(-1)?;
        z.set_bf(0)?;
    } else {
        x.set_bf(0)?;
        z.set_bf(1)?;
    }
    y.set_bf(0)?;
    Ok(y)
}

fn rotate_left_right(db: &Store, x: &NodePin, z: NodePin) -> Result<NodePin> {
    let y = db.pin_node(z.right()?, Some(z.guard()))?;
    let yb = y.bf()?;
    let t3 = y.left()?;
    z.set_right(t3)?;
    y.set_left(z.off())?;
    let t2 = y.right()?;
    x.set_left(t2)?;
    y.set_right(x.off())?;
    if yb == 0 {
        x.set_bf(0)?;
        z.set_bf(0)?;
    } else if yb < 0 {
        x.set_bf(1)?;
        z.set_bf(0)?;
    } else {
        x.set_bf(0)?;
        z.set_bf(-1)?;
    }
    y.set_bf(0)?;
    Ok(y)
}
