//! Mount bootstrap
//!
//! Builds the merged superblock: parse the branches, bind both roots, pin
//! the read-only filesystem, and publish a root entry backed by the
//! read-only root. Every acquisition is a guard, so an early return unwinds
//! in reverse order.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::entry::{EntryAllocator, MergedEntry};
use super::inode::InodeTable;
use crate::branch::{
    resolve, same_directory, ActiveRef, BoundLocation, BranchSuperblock, EntryOperations,
    MountDescriptor, SuperblockTable,
};
use crate::error::{Error, Result};

/// Timestamp granularity of the union; branches may be as fine as this
pub const TIME_GRANULARITY: Duration = Duration::from_nanos(1);

/// Collaborators a mount needs
#[derive(Clone)]
pub struct MountContext {
    pub superblocks: Arc<SuperblockTable>,
    pub allocator: Arc<dyn EntryAllocator>,
    /// Revalidation attached to newly seen branch filesystems
    pub entry_ops: Option<Arc<dyn EntryOperations>>,
}

impl MountContext {
    pub fn new(superblocks: Arc<SuperblockTable>, allocator: Arc<dyn EntryAllocator>) -> Self {
        Self {
            superblocks,
            allocator,
            entry_ops: None,
        }
    }

    pub fn with_entry_ops(mut self, ops: Arc<dyn EntryOperations>) -> Self {
        self.entry_ops = Some(ops);
        self
    }
}

/// Branch roots kept for copy-up
#[derive(Debug)]
pub struct UnionInfo {
    pub rw_root: BoundLocation,
    pub ro_root: BoundLocation,
}

/// State of one union mount
pub struct MergedSuperblock {
    descriptor: MountDescriptor,
    info: UnionInfo,
    max_object_size: u64,
    time_granularity: Duration,
    inodes: InodeTable,
    root: Arc<MergedEntry>,
    allocator: Arc<dyn EntryAllocator>,
    /// Dropped last
    lower_sb: ActiveRef,
}

impl MergedSuperblock {
    pub fn descriptor(&self) -> &MountDescriptor {
        &self.descriptor
    }

    pub fn info(&self) -> &UnionInfo {
        &self.info
    }

    pub fn rw_root(&self) -> &BoundLocation {
        &self.info.rw_root
    }

    pub fn ro_root(&self) -> &BoundLocation {
        &self.info.ro_root
    }

    pub fn max_object_size(&self) -> u64 {
        self.max_object_size
    }

    pub fn time_granularity(&self) -> Duration {
        self.time_granularity
    }

    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    pub fn root(&self) -> &Arc<MergedEntry> {
        &self.root
    }

    pub fn allocator(&self) -> &dyn EntryAllocator {
        self.allocator.as_ref()
    }

    /// The pinned read-only branch filesystem
    pub fn lower_superblock(&self) -> &Arc<BranchSuperblock> {
        self.lower_sb.superblock()
    }
}

impl fmt::Debug for MergedSuperblock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergedSuperblock")
            .field("descriptor", &self.descriptor)
            .field("max_object_size", &self.max_object_size)
            .field("root", &self.root.ino())
            .field("inodes", &self.inodes.len())
            .field("lower_sb", self.lower_sb.superblock())
            .finish()
    }
}

impl Drop for MergedSuperblock {
    fn drop(&mut self) {
        debug!("shutting down union over {}", self.descriptor);
        self.root.release(self.allocator.as_ref());
    }
}

/// Releases the root entry unless the mount completed
struct RootGuard<'a> {
    entry: Arc<MergedEntry>,
    alloc: &'a dyn EntryAllocator,
    armed: bool,
}

impl<'a> RootGuard<'a> {
    fn new(entry: Arc<MergedEntry>, alloc: &'a dyn EntryAllocator) -> Self {
        Self {
            entry,
            alloc,
            armed: true,
        }
    }

    fn disarm(mut self) -> Arc<MergedEntry> {
        self.armed = false;
        Arc::clone(&self.entry)
    }
}

impl Deref for RootGuard<'_> {
    type Target = MergedEntry;

    fn deref(&self) -> &Self::Target {
        &self.entry
    }
}

impl Drop for RootGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.entry.release(self.alloc);
        }
    }
}

/// Build a union mount from its raw mount argument.
///
/// On error no reference taken here survives: the root entry is released
/// before the read-only superblock's active reference is dropped, and both
/// branch roots are closed.
pub fn read_super(
    data: Option<&str>,
    ctx: &MountContext,
    silent: bool,
) -> Result<MergedSuperblock> {
    let Some(raw) = data else {
        error!("read_super: missing mount argument");
        return Err(Error::MissingArgument);
    };
    debug!("get_branches: {}", raw);

    let descriptor = MountDescriptor::parse(raw).map_err(|e| {
        error!("invalid branches '{}': {}", raw, e);
        Error::from(e)
    })?;
    info!(
        "read-write: {}, read-only: {}",
        descriptor.rw.path.display(),
        descriptor.ro.path.display()
    );

    let ro_root = resolve(&descriptor.ro, &ctx.superblocks, ctx.entry_ops.clone())?;
    let rw_root = resolve(&descriptor.rw, &ctx.superblocks, ctx.entry_ops.clone())?;
    if same_directory(&ro_root, &rw_root) {
        warn!(
            "read-write and read-only branches are the same directory: {}",
            ro_root.mount().root().display()
        );
    }

    let lower_sb = ro_root.superblock().grab_active();
    let max_object_size = lower_sb.max_object_size();

    let inodes = InodeTable::new();
    let inode = inodes.iget_root(ro_root.lower_path().dentry())?;
    let root = RootGuard::new(ctx.allocator.alloc_root(inode)?, ctx.allocator.as_ref());
    root.attach_private(ctx.allocator.as_ref())?;
    root.set_lower_path(ro_root.lower_path().clone())?;
    root.rehash();
    let root = root.disarm();

    if !silent {
        info!(
            "hepunion: mounted on top of {} type {}",
            ro_root.mount().root().display(),
            lower_sb.fs_name()
        );
    }

    Ok(MergedSuperblock {
        descriptor,
        info: UnionInfo { rw_root, ro_root },
        max_object_size,
        time_granularity: TIME_GRANULARITY,
        inodes,
        root,
        allocator: Arc::clone(&ctx.allocator),
        lower_sb,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::{BranchRole, HostRevalidate, LookupFlags, Validity};
    use crate::fs::entry::{EntryCache, EntryPrivate};
    use crate::fs::inode::MergedInode;
    use std::ffi::OsStr;
    use std::os::unix::fs::MetadataExt;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    struct Branches {
        ro: TempDir,
        rw: TempDir,
    }

    impl Branches {
        fn new() -> Self {
            let ro = tempdir().unwrap();
            let rw = tempdir().unwrap();
            std::fs::write(ro.path().join("readme"), b"lower").unwrap();
            Self { ro, rw }
        }

        fn arg(&self) -> String {
            format!("{}:{}", self.ro.path().display(), self.rw.path().display())
        }

        fn ro_dev(&self) -> u64 {
            std::fs::metadata(self.ro.path()).unwrap().dev()
        }
    }

    fn context(cache: Arc<EntryCache>) -> MountContext {
        MountContext::new(Arc::new(SuperblockTable::new()), cache)
    }

    /// Allocator failing at a chosen step
    struct FailingAllocator {
        inner: EntryCache,
        fail_root: bool,
        fail_private: bool,
    }

    impl EntryAllocator for FailingAllocator {
        fn alloc_root(&self, inode: Arc<MergedInode>) -> Result<Arc<MergedEntry>> {
            if self.fail_root {
                return Err(Error::OutOfMemory("root entry"));
            }
            self.inner.alloc_root(inode)
        }

        fn alloc_entry(
            &self,
            parent: u64,
            name: &OsStr,
            inode: Arc<MergedInode>,
        ) -> Result<Arc<MergedEntry>> {
            self.inner.alloc_entry(parent, name, inode)
        }

        fn alloc_private(&self) -> Result<EntryPrivate> {
            if self.fail_private {
                return Err(Error::OutOfMemory("entry private data"));
            }
            self.inner.alloc_private()
        }

        fn free_private(&self, data: EntryPrivate) {
            self.inner.free_private(data)
        }
    }

    #[test]
    fn test_mount_binds_root_to_ro() {
        let branches = Branches::new();
        let cache = Arc::new(EntryCache::new("test"));
        let ctx = context(cache.clone());

        let sb = read_super(Some(&branches.arg()), &ctx, true).unwrap();
        let root = sb.root();
        assert!(root.is_hashed());
        assert_eq!(root.ino(), fuser::FUSE_ROOT_ID);

        let lower = root.lower_path().unwrap();
        assert_eq!(lower.role(), BranchRole::ReadOnly);
        assert_eq!(lower.dentry().path(), branches.ro.path().canonicalize().unwrap());
        assert_eq!(sb.rw_root().role(), BranchRole::ReadWrite);
        assert_eq!(sb.time_granularity(), Duration::from_nanos(1));
        assert_eq!(sb.max_object_size(), sb.lower_superblock().max_object_size());
        assert_eq!(sb.lower_superblock().active_count(), 1);
        assert_eq!(cache.live_objects(), 1);
        assert!(format!("{:?}", sb).contains("max_object_size"));
        drop(lower);

        drop(sb);
        let ro_sb = ctx.superblocks.get(branches.ro_dev()).unwrap();
        assert_eq!(ro_sb.active_count(), 0);
        assert_eq!(cache.live_objects(), 0);
    }

    #[test]
    fn test_missing_argument() {
        let ctx = context(Arc::new(EntryCache::new("test")));
        assert!(matches!(
            read_super(None, &ctx, true),
            Err(Error::MissingArgument)
        ));
    }

    #[test]
    fn test_parse_error_touches_nothing() {
        let ctx = context(Arc::new(EntryCache::new("test")));
        let err = read_super(Some("relative:/b"), &ctx, true).unwrap_err();
        assert!(matches!(err, Error::Branch(_)));
        assert!(ctx.superblocks.is_empty());
    }

    #[test]
    fn test_unreachable_rw_branch() {
        let branches = Branches::new();
        let ctx = context(Arc::new(EntryCache::new("test")));
        let missing = branches.rw.path().join("missing");
        let arg = format!("{}:{}", branches.ro.path().display(), missing.display());

        let err = read_super(Some(&arg), &ctx, true).unwrap_err();
        assert!(matches!(
            err,
            Error::BranchInaccessible {
                role: BranchRole::ReadWrite,
                ..
            }
        ));
        let ro_sb = ctx.superblocks.get(branches.ro_dev()).unwrap();
        assert_eq!(ro_sb.active_count(), 0);
    }

    #[test]
    fn test_root_allocation_failure_unwinds() {
        let branches = Branches::new();
        let superblocks = Arc::new(SuperblockTable::new());
        let good = MountContext::new(superblocks.clone(), Arc::new(EntryCache::new("good")));
        let existing = read_super(Some(&branches.arg()), &good, true).unwrap();
        let ro_sb = existing.lower_superblock().clone();
        assert_eq!(ro_sb.active_count(), 1);

        let failing = Arc::new(FailingAllocator {
            inner: EntryCache::new("failing"),
            fail_root: true,
            fail_private: false,
        });
        let ctx = MountContext::new(superblocks, failing.clone());
        let err = read_super(Some(&branches.arg()), &ctx, true).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory(_)));
        assert_eq!(ro_sb.active_count(), 1);
        assert_eq!(failing.inner.live_objects(), 0);

        drop(existing);
        assert_eq!(ro_sb.active_count(), 0);
    }

    #[test]
    fn test_private_allocation_failure_unwinds() {
        let branches = Branches::new();
        let failing = Arc::new(FailingAllocator {
            inner: EntryCache::new("failing"),
            fail_root: false,
            fail_private: true,
        });
        let ctx = MountContext::new(Arc::new(SuperblockTable::new()), failing.clone());

        let err = read_super(Some(&branches.arg()), &ctx, true).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory(_)));
        let ro_sb = ctx.superblocks.get(branches.ro_dev()).unwrap();
        assert_eq!(ro_sb.active_count(), 0);
        assert_eq!(failing.inner.live_objects(), 0);
    }

    #[test]
    fn test_mounts_share_active_counter() {
        let branches = Branches::new();
        let ctx = context(Arc::new(EntryCache::new("test")));

        let first = read_super(Some(&branches.arg()), &ctx, true).unwrap();
        let second = read_super(Some(&branches.arg()), &ctx, false).unwrap();
        let ro_sb = first.lower_superblock().clone();
        assert!(Arc::ptr_eq(&ro_sb, second.lower_superblock()));
        assert_eq!(ro_sb.active_count(), 2);

        drop(first);
        assert_eq!(ro_sb.active_count(), 1);
        drop(second);
        assert_eq!(ro_sb.active_count(), 0);
    }

    #[test]
    fn test_root_revalidates_through_ro_branch() {
        let branches = Branches::new();
        let ctx = context(Arc::new(EntryCache::new("test")))
            .with_entry_ops(Arc::new(HostRevalidate));

        let sb = read_super(Some(&branches.arg()), &ctx, true).unwrap();
        assert_eq!(
            sb.root().revalidate(LookupFlags::empty()).unwrap(),
            Validity::Valid
        );
        assert!(sb
            .ro_root()
            .mount()
            .lookup(Path::new("readme"))
            .is_ok());
    }
}
