//! Branch superblocks
//!
//! Every host filesystem a branch lives on is represented once per process
//! by a [`BranchSuperblock`], keyed by device id. A mount keeps the read-only
//! branch's superblock busy through an [`ActiveRef`] for as long as it lives.

use nix::sys::statfs::statfs;
use nix::unistd::{pathconf, PathconfVar};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::lower::EntryOperations;

/// Largest file offset representable on 64-bit hosts
pub const MAX_LFS_FILESIZE: u64 = i64::MAX as u64;

/// Host filesystem backing one or more branches
pub struct BranchSuperblock {
    /// Device id (`st_dev`)
    dev: u64,
    /// `f_type` reported by statfs
    fs_magic: i64,
    /// Largest file size the filesystem supports
    max_object_size: u64,
    /// Active users (mounts stacked on this filesystem)
    active: AtomicUsize,
    /// Revalidation capability for dentries of this filesystem
    entry_ops: Option<Arc<dyn EntryOperations>>,
}

impl BranchSuperblock {
    /// Describe the filesystem holding `path`
    pub fn probe(
        dev: u64,
        path: &Path,
        entry_ops: Option<Arc<dyn EntryOperations>>,
    ) -> std::io::Result<Self> {
        let fs_magic = statfs(path)?.filesystem_type().0 as i64;

        let max_object_size = match pathconf(path, PathconfVar::FILESIZEBITS)? {
            Some(bits) if bits > 0 && bits < 64 => (1u64 << (bits - 1)) - 1,
            _ => MAX_LFS_FILESIZE,
        };

        Ok(Self {
            dev,
            fs_magic,
            max_object_size,
            active: AtomicUsize::new(0),
            entry_ops,
        })
    }

    /// Build a superblock from known values
    pub fn new(dev: u64, max_object_size: u64, entry_ops: Option<Arc<dyn EntryOperations>>) -> Self {
        Self {
            dev,
            fs_magic: 0,
            max_object_size,
            active: AtomicUsize::new(0),
            entry_ops,
        }
    }

    pub fn dev(&self) -> u64 {
        self.dev
    }

    pub fn max_object_size(&self) -> u64 {
        self.max_object_size
    }

    pub fn entry_ops(&self) -> Option<&Arc<dyn EntryOperations>> {
        self.entry_ops.as_ref()
    }

    /// Current number of active references
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Take an active reference, released when the guard drops
    pub fn grab_active(self: &Arc<Self>) -> ActiveRef {
        let count = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(dev = self.dev, active = count, "branch superblock grabbed");
        ActiveRef {
            sb: Arc::clone(self),
        }
    }

    /// Human readable filesystem type
    pub fn fs_name(&self) -> String {
        let name = match self.fs_magic {
            0xEF53 => "ext4",
            0x0102_1994 => "tmpfs",
            0x5846_5342 => "xfs",
            0x9123_683E => "btrfs",
            0x794C_7630 => "overlay",
            0x6969 => "nfs",
            0x6573_5546 => "fuse",
            0x2FC1_2FC1 => "zfs",
            0x9FA0 => "proc",
            _ => return format!("0x{:x}", self.fs_magic),
        };
        name.to_string()
    }
}

impl fmt::Debug for BranchSuperblock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BranchSuperblock")
            .field("dev", &self.dev)
            .field("fs", &self.fs_name())
            .field("max_object_size", &self.max_object_size)
            .field("active", &self.active_count())
            .field("revalidates", &self.entry_ops.is_some())
            .finish()
    }
}

/// Active reference on a branch superblock.
///
/// Incremented once on creation and decremented once on drop; it cannot be
/// cloned.
#[derive(Debug)]
pub struct ActiveRef {
    sb: Arc<BranchSuperblock>,
}

impl ActiveRef {
    pub fn superblock(&self) -> &Arc<BranchSuperblock> {
        &self.sb
    }
}

impl Deref for ActiveRef {
    type Target = BranchSuperblock;

    fn deref(&self) -> &Self::Target {
        &self.sb
    }
}

impl Drop for ActiveRef {
    fn drop(&mut self) {
        let count = self.sb.active.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!(dev = self.sb.dev, active = count, "branch superblock released");
    }
}

/// Process-wide table of branch superblocks
#[derive(Debug, Default)]
pub struct SuperblockTable {
    by_dev: RwLock<HashMap<u64, Arc<BranchSuperblock>>>,
}

impl SuperblockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the superblock for `dev`, probing `path` the first time.
    ///
    /// `entry_ops` is only used by that first probe: later mounts on the same
    /// device share the revalidation chosen by the first one, for as long as
    /// the table holds the superblock.
    pub fn get_or_probe(
        &self,
        dev: u64,
        path: &Path,
        entry_ops: Option<Arc<dyn EntryOperations>>,
    ) -> std::io::Result<Arc<BranchSuperblock>> {
        if let Some(sb) = self.by_dev.read().get(&dev) {
            return Ok(Arc::clone(sb));
        }

        let probed = Arc::new(BranchSuperblock::probe(dev, path, entry_ops)?);
        let mut by_dev = self.by_dev.write();
        // Another resolver may have probed the same device meanwhile
        let sb = by_dev.entry(dev).or_insert(probed);
        debug!("branch superblock {:?}", sb);
        Ok(Arc::clone(sb))
    }

    pub fn get(&self, dev: u64) -> Option<Arc<BranchSuperblock>> {
        self.by_dev.read().get(&dev).cloned()
    }

    pub fn len(&self) -> usize {
        self.by_dev.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_dev.read().is_empty()
    }

    /// Forget superblocks nobody references any more
    pub fn prune(&self) -> usize {
        let mut by_dev = self.by_dev.write();
        let before = by_dev.len();
        by_dev.retain(|_, sb| Arc::strong_count(sb) > 1 || sb.active_count() > 0);
        before - by_dev.len()
    }
}
