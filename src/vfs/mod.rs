//! The virtual filesystem layer: path resolution, mountpoints and the POSIX-shaped operation
//! surface (`open`, `read`, `write`, `mkdir`, ...) that dispatches down to whichever
//! [`FilesystemOps`]/[`NodeOps`] implementation backs a given path.

pub mod node;

use crate::errno::{err, EResult};
use crate::fs::{DirEntry, FileType, FilesystemOps, NodeOps, OFlags, Stat, Statfs, Vnode};
use crate::path::{self, Component};
use crate::perm::{Access, AccessProfile, Gid, Mode, Uid};
use node::TreeNode;
use std::rc::Rc;

/// Maximum number of symlinks followed while resolving one path, guarding against cycles the way
/// every POSIX resolver does.
const MAX_SYMLINK_DEPTH: usize = 8;

/// The per-caller identity and working directory a path is resolved relative to.
pub struct IoContext {
    pub profile: AccessProfile,
    pub cwd: Rc<TreeNode>,
}

impl IoContext {
    pub fn new(profile: AccessProfile, cwd: Rc<TreeNode>) -> Self {
        Self { profile, cwd }
    }
}

/// An open file: a resolved vnode plus the flags it was opened under and a private seek offset.
pub struct OpenFile {
    vnode: Rc<Vnode>,
    flags: OFlags,
    pos: u64,
}

impl OpenFile {
    pub fn stat(&self) -> EResult<Stat> {
        self.vnode.stat()
    }

    pub fn read(&mut self, buf: &mut [u8]) -> EResult<usize> {
        if self.flags.access_mask() == Access::WRITE {
            return err!(InvalidArgument);
        }
        let n = self.vnode.read(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    pub fn write(&mut self, buf: &[u8]) -> EResult<usize> {
        if self.flags.access_mask() == Access::READ {
            return err!(InvalidArgument);
        }
        let n = self.vnode.write(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Repositions the file offset. Directories cannot be seeked past their own listing in this
    /// driver: `readdir` tracks position separately via the `pos` parameter it is handed.
    pub fn seek(&mut self, pos: u64) -> EResult<u64> {
        if self.vnode.file_type == FileType::Directory {
            return err!(InvalidSeek);
        }
        self.pos = pos;
        Ok(self.pos)
    }

    pub fn readdir(&mut self) -> EResult<Option<DirEntry>> {
        if self.vnode.file_type != FileType::Directory {
            return err!(NotADirectory);
        }
        let entry = self.vnode.readdir(&mut self.pos)?;
        Ok(entry)
    }
}

/// The virtual filesystem: a name-cache tree rooted at whatever filesystem was mounted first.
pub struct Vfs {
    root: Rc<TreeNode>,
}

impl Vfs {
    /// Builds a new VFS, mounting `root_fs` at `/`.
    pub fn new(root_fs: Rc<dyn FilesystemOps>) -> EResult<Self> {
        let root_vnode = root_fs.root()?;
        Ok(Self {
            root: TreeNode::new_root(root_vnode),
        })
    }

    pub fn root(&self) -> Rc<TreeNode> {
        self.root.clone()
    }

    /// Mounts `fs` at `mountpoint`, which must be a directory and not already a mountpoint.
    /// Root-only, and the mountpoint must have no cached children: mounting over a directory
    /// whose entries have already been resolved would leave those entries reachable alongside
    /// the newly mounted root.
    pub fn mount(&self, ctx: &IoContext, mountpoint: &Rc<TreeNode>, fs: Rc<dyn FilesystemOps>) -> EResult<()> {
        if !ctx.profile.is_privileged() {
            return err!(PermissionDenied);
        }
        if mountpoint.vnode().file_type != FileType::Directory {
            return err!(NotADirectory);
        }
        if mountpoint.is_mountpoint() || mountpoint.has_children() {
            return err!(Busy);
        }
        let new_root = fs.root()?;
        log::info!("mounting filesystem at {:?}", String::from_utf8_lossy(&mountpoint.name));
        mountpoint.mount(new_root);
        Ok(())
    }

    /// Unmounts the filesystem overlaid at `mountpoint`. Root-only, and fails with `EBUSY` if
    /// anything besides the tree itself still references the mounted root (two baseline
    /// references are always held while this call is in progress: the tree node's own slot, and
    /// the local clone taken to inspect the count) or if any of the mounted tree's entries have
    /// been cached, which would outlive the filesystem they were resolved against.
    pub fn umount(&self, ctx: &IoContext, mountpoint: &Rc<TreeNode>) -> EResult<()> {
        if !ctx.profile.is_privileged() {
            return err!(PermissionDenied);
        }
        if !mountpoint.is_mountpoint() {
            return err!(InvalidArgument);
        }
        let mounted = mountpoint.vnode();
        if mounted.strong_count() > 2 || mountpoint.has_children() {
            return err!(Busy);
        }
        mountpoint.unmount();
        log::info!("unmounted filesystem at {:?}", String::from_utf8_lossy(&mountpoint.name));
        Ok(())
    }

    fn check_access(&self, ctx: &IoContext, vnode: &Rc<Vnode>, access: Access) -> EResult<()> {
        let (uid, gid, mode) = vnode.access()?;
        if ctx.profile.check(access, mode, uid, gid) {
            Ok(())
        } else {
            err!(PermissionDenied)
        }
    }

    fn lookup_child(
        &self,
        ctx: &IoContext,
        dir: &Rc<TreeNode>,
        name: &[u8],
    ) -> EResult<Rc<TreeNode>> {
        let dir_vnode = dir.vnode();
        if dir_vnode.file_type != FileType::Directory {
            return err!(NotADirectory);
        }
        self.check_access(ctx, &dir_vnode, Access::EXEC)?;
        if let Some(cached) = dir.cached_child(name) {
            return Ok(cached);
        }
        let vnode = dir_vnode.find(name)?;
        Ok(dir.cache_child(name.to_vec(), vnode))
    }

    fn follow_symlink(
        &self,
        ctx: &IoContext,
        dir: &Rc<TreeNode>,
        link: &Rc<TreeNode>,
        depth: usize,
    ) -> EResult<Rc<TreeNode>> {
        if depth >= MAX_SYMLINK_DEPTH {
            return err!(InvalidArgument);
        }
        let target = link.vnode().readlink()?;
        let base = dir.parent().unwrap_or_else(|| self.root.clone());
        self.resolve_from(ctx, base, &target, true, depth + 1)
    }

    /// Resolves `path` relative to `start`, following a trailing symlink only if
    /// `follow_trailing_symlink` is set.
    fn resolve_from(
        &self,
        ctx: &IoContext,
        start: Rc<TreeNode>,
        path: &[u8],
        follow_trailing_symlink: bool,
        depth: usize,
    ) -> EResult<Rc<TreeNode>> {
        let mut cur = if path::is_absolute(path) {
            self.root.clone()
        } else {
            start
        };
        let comps: Vec<_> = path::components(path).collect();
        let last = comps.len().saturating_sub(1);
        for (i, comp) in comps.into_iter().enumerate() {
            let is_last = i == last;
            cur = match comp {
                Component::CurDir => cur,
                Component::ParentDir => cur.parent().unwrap_or(cur),
                Component::Normal(name) => {
                    let child = self.lookup_child(ctx, &cur, name)?;
                    if child.vnode().file_type == FileType::Symlink
                        && (!is_last || follow_trailing_symlink)
                    {
                        self.follow_symlink(ctx, &cur, &child, depth)?
                    } else {
                        child
                    }
                }
            };
        }
        Ok(cur)
    }

    /// Resolves an absolute-or-relative path to the tree node it names, following a trailing
    /// symlink.
    pub fn resolve(&self, ctx: &IoContext, path: &[u8]) -> EResult<Rc<TreeNode>> {
        self.resolve_from(ctx, ctx.cwd.clone(), path, true, 0)
    }

    /// As [`Vfs::resolve`], but a trailing symlink is returned unfollowed (used by `unlink` and
    /// `readlink`).
    pub fn resolve_no_follow(&self, ctx: &IoContext, path: &[u8]) -> EResult<Rc<TreeNode>> {
        self.resolve_from(ctx, ctx.cwd.clone(), path, false, 0)
    }

    /// Resolves the parent directory of `path`, returning it alongside the final component's
    /// name. Used by `creat`, `mkdir`, `symlink` and `unlink`.
    fn resolve_parent<'p>(
        &self,
        ctx: &IoContext,
        path: &'p [u8],
    ) -> EResult<(Rc<TreeNode>, &'p [u8])> {
        let name = path::basename(path);
        if name.is_empty() || name == b"." || name == b".." {
            return err!(InvalidArgument);
        }
        let parent = path::parent(path);
        let dir = if parent.is_empty() {
            ctx.cwd.clone()
        } else {
            self.resolve(ctx, parent)?
        };
        if dir.vnode().file_type != FileType::Directory {
            return err!(NotADirectory);
        }
        Ok((dir, name))
    }

    /// Opens the file at `path`, applying `flags`.
    pub fn open(&self, ctx: &IoContext, path: &[u8], flags: OFlags) -> EResult<OpenFile> {
        let follow = !flags.contains(OFlags::NOFOLLOW);
        let resolved = if follow {
            self.resolve(ctx, path)
        } else {
            self.resolve_no_follow(ctx, path)
        };
        let node = match resolved {
            Ok(node) => node,
            Err(e) if flags.contains(OFlags::CREAT) && matches!(e, crate::errno::Errno::NotFound) => {
                return self.creat(ctx, path, 0o644, ctx.profile.uid, ctx.profile.gid);
            }
            Err(e) => return Err(e),
        };
        self.open_vnode(ctx, node.vnode(), flags)
    }

    fn open_vnode(&self, ctx: &IoContext, vnode: Rc<Vnode>, flags: OFlags) -> EResult<OpenFile> {
        if flags.contains(OFlags::APPEND) {
            // Not yet implemented, per the source this driver is modeled on.
            return err!(InvalidArgument);
        }
        if flags.contains(OFlags::DIRECTORY) && flags.intersects(OFlags::TRUNC | OFlags::CREAT) {
            return err!(InvalidArgument);
        }
        if flags.contains(OFlags::DIRECTORY) && vnode.file_type != FileType::Directory {
            return err!(NotADirectory);
        }
        if vnode.file_type == FileType::Directory && !flags.contains(OFlags::DIRECTORY) {
            return err!(IsADirectory);
        }
        if vnode.file_type == FileType::Directory && flags.access_mask().contains(Access::WRITE) {
            return err!(IsADirectory);
        }
        self.check_access(ctx, &vnode, flags.access_mask())?;
        if flags.contains(OFlags::TRUNC) && flags.access_mask().contains(Access::WRITE) {
            vnode.truncate(0)?;
        }
        Ok(OpenFile {
            vnode,
            flags,
            pos: 0,
        })
    }

    /// Creates and opens a new regular file.
    pub fn creat(
        &self,
        ctx: &IoContext,
        path: &[u8],
        mode: Mode,
        uid: Uid,
        gid: Gid,
    ) -> EResult<OpenFile> {
        let (dir, name) = self.resolve_parent(ctx, path)?;
        let dir_vnode = dir.vnode();
        self.check_access(ctx, &dir_vnode, Access::WRITE)?;
        if dir.cached_child(name).is_some() {
            return err!(AlreadyExists);
        }
        let vnode = dir_vnode.creat(name, mode, uid, gid)?;
        dir.cache_child(name.to_vec(), vnode.clone());
        Ok(OpenFile {
            vnode,
            flags: OFlags::RDWR,
            pos: 0,
        })
    }

    pub fn mkdir(&self, ctx: &IoContext, path: &[u8], mode: Mode, uid: Uid, gid: Gid) -> EResult<()> {
        let (dir, name) = self.resolve_parent(ctx, path)?;
        let dir_vnode = dir.vnode();
        self.check_access(ctx, &dir_vnode, Access::WRITE)?;
        if dir.cached_child(name).is_some() {
            return err!(AlreadyExists);
        }
        let vnode = dir_vnode.mkdir(name, mode, uid, gid)?;
        dir.cache_child(name.to_vec(), vnode);
        Ok(())
    }

    pub fn symlink(&self, ctx: &IoContext, path: &[u8], target: &[u8]) -> EResult<()> {
        let (dir, name) = self.resolve_parent(ctx, path)?;
        let dir_vnode = dir.vnode();
        self.check_access(ctx, &dir_vnode, Access::WRITE)?;
        if dir.cached_child(name).is_some() {
            return err!(AlreadyExists);
        }
        let vnode = dir_vnode.symlink(name, target, ctx.profile.uid, ctx.profile.gid)?;
        dir.cache_child(name.to_vec(), vnode);
        Ok(())
    }

    pub fn readlink(&self, ctx: &IoContext, path: &[u8]) -> EResult<Vec<u8>> {
        let node = self.resolve_no_follow(ctx, path)?;
        node.vnode().readlink()
    }

    pub fn unlink(&self, ctx: &IoContext, path: &[u8]) -> EResult<()> {
        if path::is_absolute(path) && path::components(path).next().is_none() {
            // `path` is "/" itself: there is no parent to remove it from.
            return err!(PermissionDenied);
        }
        let (dir, name) = self.resolve_parent(ctx, path)?;
        let dir_vnode = dir.vnode();
        self.check_access(ctx, &dir_vnode, Access::WRITE)?;
        let child = match dir.cached_child(name) {
            Some(child) => child,
            None => TreeNode::new_child(&dir, name.to_vec(), dir_vnode.find(name)?),
        };
        if child.is_mountpoint() {
            return err!(Busy);
        }
        if Rc::ptr_eq(&child, &ctx.cwd) {
            return err!(PermissionDenied);
        }
        dir_vnode.unlink(&child.vnode(), name)?;
        dir.evict_child(name);
        Ok(())
    }

    pub fn truncate(&self, ctx: &IoContext, path: &[u8], length: u64) -> EResult<()> {
        let node = self.resolve(ctx, path)?;
        let vnode = node.vnode();
        if vnode.file_type != FileType::Regular {
            return err!(IsADirectory);
        }
        self.check_access(ctx, &vnode, Access::WRITE)?;
        vnode.truncate(length)
    }

    pub fn stat(&self, ctx: &IoContext, path: &[u8]) -> EResult<Stat> {
        self.resolve(ctx, path)?.vnode().stat()
    }

    pub fn chmod(&self, ctx: &IoContext, path: &[u8], mode: Mode) -> EResult<()> {
        let vnode = self.resolve(ctx, path)?.vnode();
        let (uid, _, _) = vnode.access()?;
        if !ctx.profile.is_privileged() && ctx.profile.uid != uid {
            return err!(PermissionDenied);
        }
        vnode.chmod(mode)
    }

    pub fn chown(&self, ctx: &IoContext, path: &[u8], uid: Uid, gid: Gid) -> EResult<()> {
        let vnode = self.resolve(ctx, path)?.vnode();
        if !ctx.profile.is_privileged() {
            return err!(PermissionDenied);
        }
        vnode.chown(uid, gid)
    }

    pub fn access(&self, ctx: &IoContext, path: &[u8], access: Access) -> EResult<()> {
        let vnode = self.resolve(ctx, path)?.vnode();
        self.check_access(ctx, &vnode, access)
    }

    pub fn statvfs(&self, fs: &Rc<dyn FilesystemOps>) -> EResult<Statfs> {
        fs.statvfs()
    }

    /// Resolves `path` to a directory, for use as a new current working directory.
    pub fn chdir(&self, ctx: &IoContext, path: &[u8]) -> EResult<Rc<TreeNode>> {
        let node = self.resolve(ctx, path)?;
        if node.vnode().file_type != FileType::Directory {
            return err!(NotADirectory);
        }
        self.check_access(ctx, &node.vnode(), Access::EXEC)?;
        Ok(node)
    }
}
