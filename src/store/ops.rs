//! # Public Operations
//!
//! The create/find/get/update/delete surface. Each operation takes the
//! database lock in the mode its side matters: getters and `find` shared,
//! creators and updaters exclusive, `delete` upgradable with a late upgrade.
//! Write paths run inside `write_op`, which rolls the store back to the last
//! committed state on any failure.
//!
//! ## Links and Back-Links
//!
//! Creating a link inserts the forward node into the parent's values tree
//! and a back-link entry into the header's back-link tree: a key node named
//! by the target's offset whose values tree holds one entry per link. That
//! index answers "does anything link here?" in logarithmic time, which is
//! what blocks deletion of link targets. Deleting a link removes its entry
//! and, when the entry tree becomes empty, the back-link key itself.

use parking_lot::RwLockUpgradableReadGuard;

use crate::config::{MAX_BINARY_LEN, MAX_STRING_LEN};
use crate::error::{Error, Result};
use crate::node::{self, Key, NodeId, NodePin, NodeType, Value};
use crate::store::Store;
use crate::tree::{self, BtStack, RootRef, SubTree};

impl Store {
    // ---- creation ----

    /// Creates a child key under `parent` (or under the hierarchy root).
    pub fn create_key(&self, parent: NodeId, key: &Key<'_>) -> Result<NodeId> {
        key.validate()?;
        self.ensure_writable()?;
        self.write_op(|| {
            let (root, level) = self.key_parent(parent)?;
            let mut out = tree::search(self, key, &root)?;
            if out.found.is_some() {
                return Err(Error::Exists);
            }
            let node = self.create_node(out.hint.as_ref(), key, 0, NodeType::Key, level)?;
            node.init_key(level as u16)?;
            tree::insert(self, &node, &mut out.stack, &root)?;
            Ok(NodeId(node.off()))
        })
    }

    pub fn create_int32(&self, parent: NodeId, key: &Key<'_>, value: i32) -> Result<NodeId> {
        self.create_value(parent, key, NodeType::Int32, 0, |n| n.write_i32(value))
    }

    pub fn create_int64(&self, parent: NodeId, key: &Key<'_>, value: i64) -> Result<NodeId> {
        self.create_value(parent, key, NodeType::Int64, 0, |n| n.write_i64(value))
    }

    pub fn create_double(&self, parent: NodeId, key: &Key<'_>, value: f64) -> Result<NodeId> {
        let bits = value.to_bits() as i64;
        self.create_value(parent, key, NodeType::Double, 0, |n| n.write_i64(bits))
    }

    /// Creates a string value. The payload is stored with a trailing NUL
    /// that is not part of the reported value.
    pub fn create_string(&self, parent: NodeId, key: &Key<'_>, value: &str) -> Result<NodeId> {
        let stored = string_payload(value)?;
        self.create_value(parent, key, NodeType::String, stored.len(), |n| {
            n.write_var(&stored)
        })
    }

    pub fn create_binary(&self, parent: NodeId, key: &Key<'_>, value: &[u8]) -> Result<NodeId> {
        if value.len() > MAX_BINARY_LEN {
            return Err(Error::Param("binary value too long"));
        }
        self.create_value(parent, key, NodeType::Binary, value.len(), |n| {
            n.write_var(value)
        })
    }

    /// Creates a link value referring to `target`, and the back-link entry
    /// that protects the target from deletion.
    pub fn create_link(&self, parent: NodeId, key: &Key<'_>, target: NodeId) -> Result<NodeId> {
        key.validate()?;
        self.ensure_writable()?;
        if target.is_root() {
            return Err(Error::Param("link target cannot be the hierarchy root"));
        }
        self.write_op(|| {
            let (root, level) = self.value_parent(parent)?;
            let mut out = tree::search(self, key, &root)?;
            if out.found.is_some() {
                return Err(Error::Exists);
            }
            let node = self.create_node(out.hint.as_ref(), key, 0, NodeType::Link, level)?;
            node.set_link_target(target.0)?;
            tree::insert(self, &node, &mut out.stack, &root)?;
            let link_off = node.off();
            drop(node);
            drop(out);
            self.create_backlink(link_off, target.0)?;
            Ok(NodeId(link_off))
        })
    }

    fn create_value(
        &self,
        parent: NodeId,
        key: &Key<'_>,
        ty: NodeType,
        var_len: usize,
        init: impl FnOnce(&NodePin) -> Result<()>,
    ) -> Result<NodeId> {
        key.validate()?;
        self.ensure_writable()?;
        self.write_op(|| {
            let (root, level) = self.value_parent(parent)?;
            let mut out = tree::search(self, key, &root)?;
            if out.found.is_some() {
                return Err(Error::Exists);
            }
            let node = self.create_node(out.hint.as_ref(), key, var_len, ty, level)?;
            init(&node)?;
            tree::insert(self, &node, &mut out.stack, &root)?;
            Ok(NodeId(node.off()))
        })
    }

    /// Root reference and depth level for a new child key.
    fn key_parent(&self, parent: NodeId) -> Result<(RootRef, u32)> {
        if parent.is_root() {
            // Level 0 is reserved for the back-link index.
            return Ok((RootRef::HeaderChildren, 1));
        }
        let node = self.pin_node(parent.0, None)?;
        node.require_type(NodeType::Key)?;
        let level = node.key_level()? as u32 + 1;
        Ok((
            RootRef::Node {
                key: parent.0,
                tree: SubTree::Keys,
            },
            level,
        ))
    }

    /// Root reference and depth level for a new value. Values always hang
    /// off a real key, never the hierarchy root.
    fn value_parent(&self, parent: NodeId) -> Result<(RootRef, u32)> {
        if parent.is_root() {
            return Err(Error::Param("values cannot be created at the hierarchy root"));
        }
        let node = self.pin_node(parent.0, None)?;
        node.require_type(NodeType::Key)?;
        let level = node.key_level()? as u32;
        Ok((
            RootRef::Node {
                key: parent.0,
                tree: SubTree::Values,
            },
            level,
        ))
    }

    fn create_backlink(&self, link: u32, target: u32) -> Result<()> {
        let target_name = target.to_le_bytes();
        let target_key = Key::with_comparator(&target_name, node::offset_order);
        let mut out = tree::search(self, &target_key, &RootRef::HeaderLinks)?;
        let entry = match out.found.take() {
            Some(entry) => entry,
            None => {
                let entry =
                    self.create_node(out.hint.as_ref(), &target_key, 0, NodeType::Key, 0)?;
                entry.init_key(0)?;
                tree::insert(self, &entry, &mut out.stack, &RootRef::HeaderLinks)?;
                entry
            }
        };

        let link_name = link.to_le_bytes();
        let link_key = Key::with_comparator(&link_name, node::offset_order);
        let values = RootRef::Node {
            key: entry.off(),
            tree: SubTree::Values,
        };
        let mut out = tree::search(self, &link_key, &values)?;
        if out.found.is_some() {
            return Err(Error::Internal("back link reference already exists"));
        }
        let entry_link = self.create_node(out.hint.as_ref(), &link_key, 0, NodeType::Link, 0)?;
        entry_link.set_link_target(link)?;
        tree::insert(self, &entry_link, &mut out.stack, &values)
    }

    // ---- lookup and getters ----

    /// Finds a child key (`SubTree::Keys`) or value (`SubTree::Values`) by
    /// name under `parent`.
    pub fn find(&self, parent: NodeId, key: &Key<'_>, tree: SubTree) -> Result<NodeId> {
        key.validate()?;
        self.read_op(|| {
            let root = self.tree_root_ref(parent, tree)?;
            match tree::find(self, key, &root)? {
                Some(node) => Ok(NodeId(node.off())),
                None => Err(Error::NotFound),
            }
        })
    }

    /// The node's name bytes.
    pub fn get_name(&self, node: NodeId) -> Result<Vec<u8>> {
        self.read_op(|| self.pin_existing(node)?.name())
    }

    pub fn get_type(&self, node: NodeId) -> Result<NodeType> {
        self.read_op(|| self.pin_existing(node)?.node_type())
    }

    pub fn get_int32(&self, value: NodeId) -> Result<i32> {
        self.read_op(|| {
            let node = self.pin_existing(value)?;
            node.require_type(NodeType::Int32)?;
            node.read_i32()
        })
    }

    pub fn get_int64(&self, value: NodeId) -> Result<i64> {
        self.read_op(|| {
            let node = self.pin_existing(value)?;
            node.require_type(NodeType::Int64)?;
            node.read_i64()
        })
    }

    pub fn get_double(&self, value: NodeId) -> Result<f64> {
        self.read_op(|| {
            let node = self.pin_existing(value)?;
            node.require_type(NodeType::Double)?;
            Ok(f64::from_bits(node.read_i64()? as u64))
        })
    }

    pub fn get_string(&self, value: NodeId) -> Result<String> {
        self.read_op(|| {
            let node = self.pin_existing(value)?;
            node.require_type(NodeType::String)?;
            string_from_stored(node.read_var()?)
        })
    }

    pub fn get_binary(&self, value: NodeId) -> Result<Vec<u8>> {
        self.read_op(|| {
            let node = self.pin_existing(value)?;
            node.require_type(NodeType::Binary)?;
            node.read_var()
        })
    }

    /// The node a link refers to.
    pub fn get_link(&self, value: NodeId) -> Result<NodeId> {
        self.read_op(|| {
            let node = self.pin_existing(value)?;
            node.require_type(NodeType::Link)?;
            Ok(NodeId(node.link_target()?))
        })
    }

    /// Reads any value node as a tagged `Value`. Key nodes and the
    /// unsupported long variants report a type mismatch.
    pub fn get_value(&self, value: NodeId) -> Result<Value> {
        self.read_op(|| {
            let node = self.pin_existing(value)?;
            match node.node_type()? {
                NodeType::Key | NodeType::LongString | NodeType::LongBinary => Err(Error::Mismatch),
                NodeType::Int32 => Ok(Value::Int32(node.read_i32()?)),
                NodeType::Int64 => Ok(Value::Int64(node.read_i64()?)),
                NodeType::Double => Ok(Value::Double(f64::from_bits(node.read_i64()? as u64))),
                NodeType::String => Ok(Value::String(string_from_stored(node.read_var()?)?)),
                NodeType::Binary => Ok(Value::Binary(node.read_var()?)),
                NodeType::Link => Ok(Value::Link(NodeId(node.link_target()?))),
            }
        })
    }

    // ---- updates ----

    pub fn update_int32(&self, value: NodeId, new_value: i32) -> Result<()> {
        self.ensure_writable()?;
        self.write_op(|| {
            let node = self.pin_existing(value)?;
            node.require_type(NodeType::Int32)?;
            node.write_i32(new_value)
        })
    }

    pub fn update_int64(&self, value: NodeId, new_value: i64) -> Result<()> {
        self.ensure_writable()?;
        self.write_op(|| {
            let node = self.pin_existing(value)?;
            node.require_type(NodeType::Int64)?;
            node.write_i64(new_value)
        })
    }

    pub fn update_double(&self, value: NodeId, new_value: f64) -> Result<()> {
        self.ensure_writable()?;
        self.write_op(|| {
            let node = self.pin_existing(value)?;
            node.require_type(NodeType::Double)?;
            node.write_i64(new_value.to_bits() as i64)
        })
    }

    pub fn update_string(&self, value: NodeId, new_value: &str) -> Result<()> {
        let stored = string_payload(new_value)?;
        self.update_var(value, &stored, NodeType::String)
    }

    pub fn update_binary(&self, value: NodeId, new_value: &[u8]) -> Result<()> {
        if new_value.len() > MAX_BINARY_LEN {
            return Err(Error::Param("binary value too long"));
        }
        self.update_var(value, new_value, NodeType::Binary)
    }

    /// Rewrites a variable-length payload, resizing the node in place when
    /// the length changes. The node may move within its page; its id stays
    /// stable because ids name slots.
    fn update_var(&self, value: NodeId, payload: &[u8], ty: NodeType) -> Result<()> {
        self.ensure_writable()?;
        self.write_op(|| {
            let node = self.pin_existing(value)?;
            node.require_type(ty)?;
            if node.var_len()? != payload.len() {
                let new_size = node::total_size(node.name_len()?, ty, payload.len());
                node.guard()
                    .with_mut(|p| crate::storage::page::resize_node(p, node.slot(), new_size))?;
            }
            node.write_var(payload)
        })
    }

    // ---- deletion ----

    /// Deletes the named child key or value under `parent`.
    ///
    /// A key still holding children or values, and any node that is the
    /// target of a link, refuse deletion. Deleting a link also removes its
    /// back-link entry. The lookup and validation run under an upgradable
    /// read so concurrent readers proceed; only the destructive part takes
    /// the lock exclusively.
    pub fn delete(&self, parent: NodeId, tree: SubTree, key: &Key<'_>) -> Result<()> {
        key.validate()?;
        self.ensure_writable()?;
        let guard = self.lock.upgradable_read();
        match self.delete_lookup(parent, tree, key) {
            Err(e) => {
                let _write = RwLockUpgradableReadGuard::upgrade(guard);
                self.rollback();
                Err(e)
            }
            Ok(None) => Err(Error::NotFound),
            Ok(Some((node, mut stack, root))) => {
                let _write = RwLockUpgradableReadGuard::upgrade(guard);
                let result = (|| {
                    if node.node_type()? == NodeType::Link {
                        self.delete_backlink(&node)?;
                    }
                    tree::delete_node(self, &node, &mut stack, &root)
                })();
                drop(node);
                if let Err(e) = result {
                    self.rollback();
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    /// Finds the victim and checks the deletion is allowed. `Ok(None)` means
    /// the name does not exist (no rollback needed for that).
    #[allow(clippy::type_complexity)]
    fn delete_lookup(
        &self,
        parent: NodeId,
        tree: SubTree,
        key: &Key<'_>,
    ) -> Result<Option<(NodePin, BtStack, RootRef)>> {
        let root = self.tree_root_ref(parent, tree)?;
        let out = tree::search(self, key, &root)?;
        let node = match out.found {
            Some(node) => node,
            None => return Ok(None),
        };
        if node.node_type()? == NodeType::Key
            && (node.children_root()? != 0 || node.values_root()? != 0)
        {
            return Err(Error::InvOper("key has subkeys or values, unable to delete"));
        }
        if self.has_link_to(node.off())? {
            return Err(Error::InvOper(
                "node is the target of a link reference, unable to delete",
            ));
        }
        Ok(Some((node, out.stack, root)))
    }

    fn has_link_to(&self, target: u32) -> Result<bool> {
        let name = target.to_le_bytes();
        let key = Key::with_comparator(&name, node::offset_order);
        Ok(tree::find(self, &key, &RootRef::HeaderLinks)?.is_some())
    }

    /// Removes the back-link entry of `link_node`, and the back-link key
    /// itself once its last entry is gone.
    fn delete_backlink(&self, link_node: &NodePin) -> Result<()> {
        let target_name = link_node.link_target()?.to_le_bytes();
        let target_key = Key::with_comparator(&target_name, node::offset_order);
        let mut out = tree::search(self, &target_key, &RootRef::HeaderLinks)?;
        let entry = match out.found.take() {
            Some(entry) => entry,
            None => return Ok(()),
        };

        let values = RootRef::Node {
            key: entry.off(),
            tree: SubTree::Values,
        };
        let link_name = link_node.off().to_le_bytes();
        let link_key = Key::with_comparator(&link_name, node::offset_order);
        let mut entry_out = tree::search(self, &link_key, &values)?;
        if let Some(entry_link) = entry_out.found.take() {
            tree::delete_node(self, &entry_link, &mut entry_out.stack, &values)?;
        }

        if entry.values_root()? == 0 {
            tree::delete_node(self, &entry, &mut out.stack, &RootRef::HeaderLinks)?;
        }
        Ok(())
    }
}

/// Validates a string value and returns its stored form (payload plus NUL).
fn string_payload(value: &str) -> Result<Vec<u8>> {
    if value.len() + 1 > MAX_STRING_LEN {
        return Err(Error::Param("string value too long"));
    }
    if value.as_bytes().contains(&0) {
        return Err(Error::Param("string value contains an interior NUL"));
    }
    let mut stored = Vec::with_capacity(value.len() + 1);
    stored.extend_from_slice(value.as_bytes());
    stored.push(0);
    Ok(stored)
}

fn string_from_stored(mut raw: Vec<u8>) -> Result<String> {
    match raw.pop() {
        Some(0) => {}
        _ => return Err(Error::Corrupt("string payload is missing its terminator")),
    }
    String::from_utf8(raw).map_err(|_| Error::Corrupt("string payload is not valid UTF-8"))
}
