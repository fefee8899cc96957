//! UNIX permissions are detailed in the POSIX specification.
//!
//! This module implements the 3-class (owner/group/other) permission check used by every VFS
//! entry point that touches a file.

use bitflags::bitflags;

/// Type representing a user ID.
pub type Uid = u32;
/// Type representing a group ID.
pub type Gid = u32;
/// Type representing a permission+type mode word, as stored in an inode's `type_perm` field.
pub type Mode = u16;

/// The root user ID.
pub const ROOT_UID: Uid = 0;
/// The root group ID.
pub const ROOT_GID: Gid = 0;

/// User: Read, Write and Execute.
pub const S_IRWXU: Mode = 0o0700;
/// Group: Read, Write and Execute.
pub const S_IRWXG: Mode = 0o0070;
/// Other: Read, Write and Execute.
pub const S_IRWXO: Mode = 0o0007;
/// Setuid.
pub const S_ISUID: Mode = 0o4000;
/// Setgid.
pub const S_ISGID: Mode = 0o2000;
/// Sticky bit.
pub const S_ISVTX: Mode = 0o1000;
/// Mask of the permission bits proper (owner/group/other rwx plus set-id/sticky).
pub const PERM_MASK: Mode = 0o7777;

bitflags! {
    /// The access mask requested by a caller: some subset of read/write/execute.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct Access: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXEC = 0b100;
    }
}

/// The I/O context identity used to evaluate permission checks: a simplified
/// `AccessProfile` carrying only what this single-threaded, non-setuid-aware driver needs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AccessProfile {
    pub uid: Uid,
    pub gid: Gid,
}

impl AccessProfile {
    /// The profile used for operations performed on behalf of the system itself (root).
    pub const ROOT: Self = Self {
        uid: ROOT_UID,
        gid: ROOT_GID,
    };

    pub fn new(uid: Uid, gid: Gid) -> Self {
        Self { uid, gid }
    }

    /// Tells whether this profile is privileged (root).
    pub fn is_privileged(&self) -> bool {
        self.uid == ROOT_UID
    }

    /// Checks whether this profile may access a node with the given `mode`/`uid`/`gid` under the
    /// requested `access` mask.
    ///
    /// Root bypasses the owner/group/other bit check entirely, except that execute access is
    /// still denied unless *some* class carries an execute bit — mirroring Linux's root-exec
    /// policy instead of granting root blanket execute rights on data files.
    pub fn check(&self, access: Access, mode: Mode, file_uid: Uid, file_gid: Gid) -> bool {
        if self.is_privileged() {
            if access.contains(Access::EXEC) {
                let any_exec = (mode & 0o111) != 0;
                return any_exec;
            }
            return true;
        }
        let class_bits = if self.uid == file_uid {
            (mode & S_IRWXU) >> 6
        } else if self.gid == file_gid {
            (mode & S_IRWXG) >> 3
        } else {
            mode & S_IRWXO
        };
        let class = Access::from_bits_truncate(class_bits as u8);
        class.contains(access)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_passes_read_write() {
        let root = AccessProfile::ROOT;
        assert!(root.check(Access::READ | Access::WRITE, 0o000, 1, 1));
    }

    #[test]
    fn root_exec_requires_some_exec_bit() {
        let root = AccessProfile::ROOT;
        assert!(!root.check(Access::EXEC, 0o666, 1, 1));
        assert!(root.check(Access::EXEC, 0o766, 1, 1));
    }

    #[test]
    fn owner_bits_used_exclusively_for_matching_uid() {
        // Owner has no read, but group/other do: the owner must still be denied.
        let profile = AccessProfile::new(1, 1);
        assert!(!profile.check(Access::READ, 0o077, 1, 2));
    }

    #[test]
    fn group_bits_used_for_matching_gid() {
        let profile = AccessProfile::new(2, 1);
        assert!(profile.check(Access::READ, 0o047, 1, 1));
    }

    #[test]
    fn other_bits_used_otherwise() {
        let profile = AccessProfile::new(3, 3);
        assert!(profile.check(Access::READ, 0o004, 1, 1));
        assert!(!profile.check(Access::WRITE, 0o004, 1, 1));
    }
}
