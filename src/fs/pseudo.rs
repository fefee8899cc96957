//! `pseudofs`: a small, entirely in-memory filesystem used to exercise the VFS layer (path
//! resolution, mount overlays, permission checks) without needing a real ext2 image. It supports
//! the same operation surface as the ext2 driver, just backed by a `Vec`-based tree instead of a
//! block device.

use crate::errno::{err, EResult};
use crate::fs::{DirEntry, FileType, FilesystemOps, NodeOps, Stat, Statfs, Vnode};
use crate::perm::{Gid, Mode, Uid};
use std::cell::RefCell;
use std::rc::Rc;

enum Content {
    Dir(Vec<(Vec<u8>, Rc<RefCell<Inode>>)>),
    File(Vec<u8>),
    Symlink(Vec<u8>),
}

struct Inode {
    ino: u32,
    uid: Uid,
    gid: Gid,
    mode: Mode,
    content: Content,
}

impl Inode {
    fn file_type(&self) -> FileType {
        match &self.content {
            Content::Dir(_) => FileType::Directory,
            Content::File(_) => FileType::Regular,
            Content::Symlink(_) => FileType::Symlink,
        }
    }
}

/// A shared counter handing out unique inode numbers within one `PseudoFs` instance.
#[derive(Default)]
struct InoCounter(u32);

impl InoCounter {
    fn next(&mut self) -> u32 {
        self.0 += 1;
        self.0
    }
}

/// A handle onto one pseudofs node.
pub struct PseudoNode {
    inode: Rc<RefCell<Inode>>,
    counter: Rc<RefCell<InoCounter>>,
}

impl PseudoNode {
    fn wrap(inode: Rc<RefCell<Inode>>, counter: Rc<RefCell<InoCounter>>) -> Rc<Vnode> {
        let file_type = inode.borrow().file_type();
        Vnode::new(file_type, Rc::new(Self { inode, counter }))
    }
}

impl NodeOps for PseudoNode {
    fn find(&self, name: &[u8]) -> EResult<Rc<Vnode>> {
        let inode = self.inode.borrow();
        match &inode.content {
            Content::Dir(entries) => entries
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, child)| PseudoNode::wrap(child.clone(), self.counter.clone()))
                .ok_or(crate::errno::Errno::NotFound),
            _ => err!(NotADirectory),
        }
    }

    fn creat(&self, name: &[u8], mode: Mode, uid: Uid, gid: Gid) -> EResult<Rc<Vnode>> {
        self.insert(name, Content::File(Vec::new()), mode, uid, gid)
    }

    fn mkdir(&self, name: &[u8], mode: Mode, uid: Uid, gid: Gid) -> EResult<Rc<Vnode>> {
        self.insert(name, Content::Dir(Vec::new()), mode, uid, gid)
    }

    fn symlink(&self, name: &[u8], target: &[u8], uid: Uid, gid: Gid) -> EResult<Rc<Vnode>> {
        self.insert(name, Content::Symlink(target.to_vec()), 0o777, uid, gid)
    }

    fn unlink(&self, _child: &Rc<Vnode>, name: &[u8]) -> EResult<()> {
        let mut inode = self.inode.borrow_mut();
        match &mut inode.content {
            Content::Dir(entries) => {
                let before = entries.len();
                entries.retain(|(n, _)| n != name);
                if entries.len() == before {
                    return err!(NotFound);
                }
                Ok(())
            }
            _ => err!(NotADirectory),
        }
    }

    fn read(&self, pos: u64, buf: &mut [u8]) -> EResult<usize> {
        let inode = self.inode.borrow();
        match &inode.content {
            Content::File(data) => {
                let pos = pos as usize;
                if pos >= data.len() {
                    return Ok(0);
                }
                let n = buf.len().min(data.len() - pos);
                buf[..n].copy_from_slice(&data[pos..pos + n]);
                Ok(n)
            }
            Content::Dir(_) => err!(IsADirectory),
            Content::Symlink(_) => err!(InvalidArgument),
        }
    }

    fn write(&self, pos: u64, buf: &[u8]) -> EResult<usize> {
        let mut inode = self.inode.borrow_mut();
        match &mut inode.content {
            Content::File(data) => {
                let pos = pos as usize;
                let end = pos + buf.len();
                if data.len() < end {
                    data.resize(end, 0);
                }
                data[pos..end].copy_from_slice(buf);
                Ok(buf.len())
            }
            Content::Dir(_) => err!(IsADirectory),
            Content::Symlink(_) => err!(InvalidArgument),
        }
    }

    fn truncate(&self, length: u64) -> EResult<()> {
        let mut inode = self.inode.borrow_mut();
        match &mut inode.content {
            Content::File(data) => {
                if length as usize > data.len() {
                    return err!(InvalidArgument);
                }
                data.truncate(length as usize);
                Ok(())
            }
            Content::Dir(_) => err!(IsADirectory),
            Content::Symlink(_) => err!(InvalidArgument),
        }
    }

    fn readdir(&self, pos: &mut u64) -> EResult<Option<DirEntry>> {
        let inode = self.inode.borrow();
        match &inode.content {
            Content::Dir(entries) => {
                let idx = *pos as usize;
                if idx >= entries.len() {
                    return Ok(None);
                }
                let (name, child) = &entries[idx];
                *pos += 1;
                let child_ino = child.borrow().ino;
                let d_type = child.borrow().file_type().to_dirent_indicator();
                Ok(Some(DirEntry {
                    ino: child_ino,
                    name: name.clone(),
                    d_type,
                    reclen: 0,
                }))
            }
            _ => err!(NotADirectory),
        }
    }

    fn readlink(&self) -> EResult<Vec<u8>> {
        match &self.inode.borrow().content {
            Content::Symlink(target) => Ok(target.clone()),
            _ => err!(InvalidArgument),
        }
    }

    fn stat(&self) -> EResult<Stat> {
        let inode = self.inode.borrow();
        let size = match &inode.content {
            Content::File(data) => data.len() as u64,
            Content::Symlink(target) => target.len() as u64,
            Content::Dir(entries) => entries.len() as u64,
        };
        Ok(Stat {
            ino: inode.ino,
            file_type: inode.file_type(),
            mode: inode.mode,
            uid: inode.uid,
            gid: inode.gid,
            size,
            atime: 0,
            mtime: 0,
            ctime: 0,
            nlink: 0,
            blksize: 512,
            blocks: size.div_ceil(512),
        })
    }

    fn chmod(&self, mode: Mode) -> EResult<()> {
        self.inode.borrow_mut().mode = mode & 0o7777;
        Ok(())
    }

    fn chown(&self, uid: Uid, gid: Gid) -> EResult<()> {
        let mut inode = self.inode.borrow_mut();
        inode.uid = uid;
        inode.gid = gid;
        Ok(())
    }

    fn access(&self) -> EResult<(Uid, Gid, Mode)> {
        let inode = self.inode.borrow();
        Ok((inode.uid, inode.gid, inode.mode))
    }
}

impl PseudoNode {
    fn insert(
        &self,
        name: &[u8],
        content: Content,
        mode: Mode,
        uid: Uid,
        gid: Gid,
    ) -> EResult<Rc<Vnode>> {
        let mut inode = self.inode.borrow_mut();
        match &mut inode.content {
            Content::Dir(entries) => {
                if entries.iter().any(|(n, _)| n == name) {
                    return err!(AlreadyExists);
                }
                let ino = self.counter.borrow_mut().next();
                let child = Rc::new(RefCell::new(Inode {
                    ino,
                    uid,
                    gid,
                    mode: mode & 0o7777,
                    content,
                }));
                entries.push((name.to_vec(), child.clone()));
                Ok(PseudoNode::wrap(child, self.counter.clone()))
            }
            _ => err!(NotADirectory),
        }
    }
}

/// An entirely in-memory filesystem instance, rooted at an empty directory.
pub struct PseudoFs {
    root: Rc<RefCell<Inode>>,
    counter: Rc<RefCell<InoCounter>>,
}

impl Default for PseudoFs {
    fn default() -> Self {
        Self::new()
    }
}

impl PseudoFs {
    pub fn new() -> Self {
        let mut counter = InoCounter::default();
        let root_ino = counter.next();
        Self {
            root: Rc::new(RefCell::new(Inode {
                ino: root_ino,
                uid: 0,
                gid: 0,
                mode: 0o755,
                content: Content::Dir(Vec::new()),
            })),
            counter: Rc::new(RefCell::new(counter)),
        }
    }
}

impl FilesystemOps for PseudoFs {
    fn root(&self) -> EResult<Rc<Vnode>> {
        Ok(PseudoNode::wrap(self.root.clone(), self.counter.clone()))
    }

    fn statvfs(&self) -> EResult<Statfs> {
        Ok(Statfs {
            f_bsize: 512,
            f_frsize: 512,
            f_blocks: 0,
            f_bfree: 0,
            f_bavail: 0,
            f_files: 0,
            f_ffree: 0,
            f_favail: 0,
            f_namemax: 255,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_and_finds_a_file() {
        let fs = PseudoFs::new();
        let root = fs.root().unwrap();
        let file = root.creat(b"hello", 0o644, 0, 0).unwrap();
        file.write(0, b"hi").unwrap();
        let found = root.find(b"hello").unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(found.read(0, &mut buf).unwrap(), 2);
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn unlink_removes_entry() {
        let fs = PseudoFs::new();
        let root = fs.root().unwrap();
        let file = root.creat(b"bye", 0o644, 0, 0).unwrap();
        root.unlink(&file, b"bye").unwrap();
        assert!(root.find(b"bye").is_err());
    }
}
