//! Merged inode management
//!
//! Maps branch objects to the inode numbers the union hands out.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::branch::BranchDentry;
use crate::error::Result;

/// File type of a merged inode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl From<std::fs::FileType> for EntryKind {
    fn from(ft: std::fs::FileType) -> Self {
        use std::os::unix::fs::FileTypeExt;

        if ft.is_dir() {
            EntryKind::Directory
        } else if ft.is_symlink() {
            EntryKind::Symlink
        } else if ft.is_block_device() {
            EntryKind::BlockDevice
        } else if ft.is_char_device() {
            EntryKind::CharDevice
        } else if ft.is_fifo() {
            EntryKind::Fifo
        } else if ft.is_socket() {
            EntryKind::Socket
        } else {
            EntryKind::RegularFile
        }
    }
}

impl EntryKind {
    pub fn to_fuser_type(self) -> fuser::FileType {
        match self {
            EntryKind::RegularFile => fuser::FileType::RegularFile,
            EntryKind::Directory => fuser::FileType::Directory,
            EntryKind::Symlink => fuser::FileType::Symlink,
            EntryKind::BlockDevice => fuser::FileType::BlockDevice,
            EntryKind::CharDevice => fuser::FileType::CharDevice,
            EntryKind::Fifo => fuser::FileType::NamedPipe,
            EntryKind::Socket => fuser::FileType::Socket,
        }
    }
}

/// Attributes of a merged inode, copied from its branch object
#[derive(Debug, Clone)]
pub struct InodeAttributes {
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

fn unix_time(secs: i64, nsecs: i64) -> SystemTime {
    let nsecs = nsecs.clamp(0, 999_999_999) as u32;
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::new(secs as u64, nsecs)
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
            + Duration::from_nanos(nsecs as u64)
    }
}

impl InodeAttributes {
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            size: meta.len(),
            blocks: meta.blocks(),
            atime: unix_time(meta.atime(), meta.atime_nsec()),
            mtime: unix_time(meta.mtime(), meta.mtime_nsec()),
            ctime: unix_time(meta.ctime(), meta.ctime_nsec()),
            crtime: meta.created().unwrap_or(SystemTime::UNIX_EPOCH),
            perm: (meta.mode() & 0o7777) as u16,
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
            blksize: meta.blksize() as u32,
        }
    }
}

/// Inode of the merged view
#[derive(Debug)]
pub struct MergedInode {
    /// Inode number handed to the kernel
    ino: u64,
    /// Branch object identity (dev, ino)
    lower: (u64, u64),
    kind: EntryKind,
    attrs: RwLock<InodeAttributes>,
}

impl MergedInode {
    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn attrs(&self) -> InodeAttributes {
        self.attrs.read().clone()
    }

    /// Refresh cached attributes from the branch object
    pub fn refresh(&self, meta: &std::fs::Metadata) {
        *self.attrs.write() = InodeAttributes::from_metadata(meta);
    }

    /// Convert to fuser FileAttr
    pub fn to_fuser_attr(&self) -> fuser::FileAttr {
        let attrs = self.attrs.read();
        fuser::FileAttr {
            ino: self.ino,
            size: attrs.size,
            blocks: attrs.blocks,
            atime: attrs.atime,
            mtime: attrs.mtime,
            ctime: attrs.ctime,
            crtime: attrs.crtime,
            kind: self.kind.to_fuser_type(),
            perm: attrs.perm,
            nlink: attrs.nlink,
            uid: attrs.uid,
            gid: attrs.gid,
            rdev: attrs.rdev,
            blksize: attrs.blksize,
            flags: 0,
        }
    }
}

/// Allocates merged inodes and reuses them for the same branch object
pub struct InodeTable {
    /// Next merged inode number
    next_ino: AtomicU64,
    /// Merged ino -> inode
    inodes: RwLock<HashMap<u64, Arc<MergedInode>>>,
    /// Branch (dev, ino) -> merged ino
    by_lower: RwLock<HashMap<(u64, u64), u64>>,
}

impl InodeTable {
    pub fn new() -> Self {
        Self {
            next_ino: AtomicU64::new(fuser::FUSE_ROOT_ID + 1),
            inodes: RwLock::new(HashMap::new()),
            by_lower: RwLock::new(HashMap::new()),
        }
    }

    /// Inode for the union root, always `FUSE_ROOT_ID`
    pub fn iget_root(&self, dentry: &BranchDentry) -> Result<Arc<MergedInode>> {
        let meta = dentry.metadata()?;
        Ok(self.insert(fuser::FUSE_ROOT_ID, dentry, &meta))
    }

    /// Get or allocate the inode for a branch object
    pub fn iget(&self, dentry: &BranchDentry) -> Result<Arc<MergedInode>> {
        let meta = dentry.metadata()?;
        let key = (dentry.dev(), dentry.ino());

        if let Some(inode) = self.lookup_lower(key) {
            inode.refresh(&meta);
            return Ok(inode);
        }

        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        Ok(self.insert(ino, dentry, &meta))
    }

    fn insert(&self, ino: u64, dentry: &BranchDentry, meta: &std::fs::Metadata) -> Arc<MergedInode> {
        let key = (dentry.dev(), dentry.ino());
        let inode = Arc::new(MergedInode {
            ino,
            lower: key,
            kind: EntryKind::from(meta.file_type()),
            attrs: RwLock::new(InodeAttributes::from_metadata(meta)),
        });

        self.inodes.write().insert(ino, Arc::clone(&inode));
        self.by_lower.write().insert(key, ino);
        inode
    }

    fn lookup_lower(&self, key: (u64, u64)) -> Option<Arc<MergedInode>> {
        let ino = self.by_lower.read().get(&key).copied()?;
        self.get(ino)
    }

    /// Merged ino already handed out for a branch object, if any
    pub fn ino_for(&self, dev: u64, ino: u64) -> Option<u64> {
        self.by_lower.read().get(&(dev, ino)).copied()
    }

    /// Get inode by merged ino
    pub fn get(&self, ino: u64) -> Option<Arc<MergedInode>> {
        self.inodes.read().get(&ino).cloned()
    }

    /// Drop an inode once no entry refers to it
    pub fn evict(&self, ino: u64) -> Option<Arc<MergedInode>> {
        let inode = self.inodes.write().remove(&ino)?;
        let mut by_lower = self.by_lower.write();
        if by_lower.get(&inode.lower) == Some(&ino) {
            by_lower.remove(&inode.lower);
        }
        Some(inode)
    }

    pub fn len(&self) -> usize {
        self.inodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inodes.read().is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::test_support::mount_dir;
    use crate::branch::BranchRole;
    use std::path::Path;
    use tempfile::tempdir;

    #[test]
    fn test_root_and_reuse() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"abc").unwrap();
        let mnt = mount_dir(BranchRole::ReadOnly, dir.path(), None);
        let table = InodeTable::new();

        let root = table
            .iget_root(mnt.lookup(Path::new("")).unwrap().dentry())
            .unwrap();
        assert_eq!(root.ino(), fuser::FUSE_ROOT_ID);
        assert!(root.is_dir());

        let a1 = table.iget(mnt.lookup(Path::new("a")).unwrap().dentry()).unwrap();
        let a2 = table.iget(mnt.lookup(Path::new("a")).unwrap().dentry()).unwrap();
        assert_eq!(a1.ino(), a2.ino());
        assert_ne!(a1.ino(), root.ino());
        assert_eq!(a1.attrs().size, 3);
        assert_eq!(a1.to_fuser_attr().kind, fuser::FileType::RegularFile);
        assert_eq!(table.len(), 2);
        let key = mnt.lookup(Path::new("a")).unwrap();
        let key = key.dentry();
        assert_eq!(table.ino_for(key.dev(), key.ino()), Some(a1.ino()));

        table.evict(a1.ino());
        assert_eq!(table.ino_for(key.dev(), key.ino()), None);
        assert!(table.get(a1.ino()).is_none());
        let a3 = table.iget(mnt.lookup(Path::new("a")).unwrap().dentry()).unwrap();
        assert_ne!(a3.ino(), a1.ino());
    }

    #[test]
    fn test_refresh_attributes() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("grow");
        std::fs::write(&file, b"1").unwrap();
        let mnt = mount_dir(BranchRole::ReadWrite, dir.path(), None);
        let table = InodeTable::new();

        let inode = table.iget(mnt.lookup(Path::new("grow")).unwrap().dentry()).unwrap();
        assert_eq!(inode.attrs().size, 1);

        std::fs::write(&file, b"12345").unwrap();
        inode.refresh(&std::fs::symlink_metadata(&file).unwrap());
        assert_eq!(inode.attrs().size, 5);
    }
}
