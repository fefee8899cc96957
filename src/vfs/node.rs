//! The name-cache tree: an in-memory mirror of the directory hierarchy the VFS has resolved so
//! far, used to avoid re-walking a filesystem driver's `find` on every path lookup and to give
//! mountpoints somewhere to splice a foreign root in.

use crate::fs::Vnode;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

/// One node of the name-cache tree. Every `TreeNode` wraps exactly one [`Vnode`] (the file or
/// directory it currently names) plus the parent/children links needed to walk the tree without
/// consulting the underlying filesystem again.
pub struct TreeNode {
    pub name: Vec<u8>,
    parent: RefCell<Option<Weak<TreeNode>>>,
    /// The vnode currently visible at this tree position. For a mountpoint, this is the mounted
    /// filesystem's root; otherwise it is this node's own vnode.
    vnode: RefCell<Rc<Vnode>>,
    /// The vnode that was visible here before a filesystem got mounted on top of it, so `umount`
    /// can restore it. `None` when this position is not a mountpoint.
    real_vnode: RefCell<Option<Rc<Vnode>>>,
    children: RefCell<Vec<Rc<TreeNode>>>,
    ismount: Cell<bool>,
}

impl TreeNode {
    /// Creates a new, parentless tree node (used for a filesystem's root).
    pub fn new_root(vnode: Rc<Vnode>) -> Rc<Self> {
        Rc::new(Self {
            name: Vec::new(),
            parent: RefCell::new(None),
            vnode: RefCell::new(vnode),
            real_vnode: RefCell::new(None),
            children: RefCell::new(Vec::new()),
            ismount: Cell::new(false),
        })
    }

    /// Creates a new child node named `name` under `parent`, wrapping `vnode`.
    pub fn new_child(parent: &Rc<TreeNode>, name: Vec<u8>, vnode: Rc<Vnode>) -> Rc<Self> {
        let child = Rc::new(Self {
            name,
            parent: RefCell::new(Some(Rc::downgrade(parent))),
            vnode: RefCell::new(vnode),
            real_vnode: RefCell::new(None),
            children: RefCell::new(Vec::new()),
            ismount: Cell::new(false),
        });
        parent.children.borrow_mut().push(child.clone());
        child
    }

    /// The vnode currently visible at this position (the mounted root, if this is a mountpoint).
    pub fn vnode(&self) -> Rc<Vnode> {
        self.vnode.borrow().clone()
    }

    /// This node's parent, or `None` at a filesystem root that isn't itself mounted under
    /// anything else (the global VFS root behaves this way: `..` at the root resolves to itself,
    /// handled by the caller rather than by an `Rc` self-cycle here).
    pub fn parent(self: &Rc<Self>) -> Option<Rc<TreeNode>> {
        self.parent.borrow().as_ref().and_then(Weak::upgrade)
    }

    pub fn is_mountpoint(&self) -> bool {
        self.ismount.get()
    }

    /// Whether this node has any cached children, used to refuse mounting over a directory
    /// whose contents have already been resolved and to refuse unmounting while any of them
    /// are still in use.
    pub fn has_children(&self) -> bool {
        !self.children.borrow().is_empty()
    }

    /// Looks up an already-cached child by name, without consulting the filesystem driver.
    pub fn cached_child(&self, name: &[u8]) -> Option<Rc<TreeNode>> {
        self.children
            .borrow()
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    /// Inserts `child` into the cache, returning the now-canonical node: if a child by that name
    /// was already cached (inserted concurrently by an earlier lookup down a different path),
    /// that existing node is returned instead so the tree never holds two entries for one name.
    pub fn cache_child(self: &Rc<Self>, name: Vec<u8>, vnode: Rc<Vnode>) -> Rc<TreeNode> {
        if let Some(existing) = self.cached_child(&name) {
            return existing;
        }
        TreeNode::new_child(self, name, vnode)
    }

    /// Drops a cached child by name (used after `unlink` removes the underlying file).
    pub fn evict_child(&self, name: &[u8]) {
        self.children.borrow_mut().retain(|c| c.name != name);
    }

    /// Splices `new_root`'s vnode in as this node's visible vnode, stashing the previous one so
    /// `unmount` can restore it. Also drops any cached children, since they named entries of the
    /// filesystem that used to be here.
    pub fn mount(&self, new_root: Rc<Vnode>) {
        let previous = self.vnode.replace(new_root);
        self.real_vnode.replace(Some(previous));
        self.children.borrow_mut().clear();
        self.ismount.set(true);
    }

    /// Reverses [`TreeNode::mount`], restoring the vnode that was overlaid.
    ///
    /// Returns the overlaying (mounted) vnode, so the caller can check its reference count before
    /// deciding whether the unmount may proceed.
    pub fn unmount(&self) -> Option<Rc<Vnode>> {
        let restored = self.real_vnode.borrow_mut().take()?;
        let mounted = self.vnode.replace(restored);
        self.children.borrow_mut().clear();
        self.ismount.set(false);
        Some(mounted)
    }
}
