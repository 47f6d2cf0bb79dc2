//! Merged entries and their lower bindings
//!
//! Every entry of the merged view carries private data holding a
//! [`LowerBinding`]: the single branch object currently backing it.
//! Revalidation is forwarded through that binding, and releasing the entry
//! gives the branch object back.

use parking_lot::{Mutex, MutexGuard};
use std::ffi::{OsStr, OsString};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::inode::MergedInode;
use crate::branch::{LookupFlags, LowerPath, Validity};
use crate::error::{Error, Result};

/// The branch object backing one merged entry.
///
/// At most one lower path is bound at a time. Binding over an occupied slot
/// is refused instead of leaking the previous reference.
#[derive(Debug, Default)]
pub struct LowerBinding {
    lower: Option<LowerPath>,
}

impl LowerBinding {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `path`, consuming the caller's reference
    pub fn bind(&mut self, path: LowerPath) -> Result<()> {
        if self.lower.is_some() {
            return Err(Error::BindingOccupied);
        }
        self.lower = Some(path);
        Ok(())
    }

    /// Take an extra reference on the bound path
    pub fn get(&self) -> Option<LowerPath> {
        self.lower.clone()
    }

    /// Unbind and hand back the owned reference
    pub fn reset(&mut self) -> Option<LowerPath> {
        self.lower.take()
    }

    pub fn is_bound(&self) -> bool {
        self.lower.is_some()
    }
}

/// Private data attached to a merged entry
#[derive(Debug, Default)]
pub struct EntryPrivate {
    binding: Mutex<LowerBinding>,
}

impl EntryPrivate {
    pub fn binding(&self) -> MutexGuard<'_, LowerBinding> {
        self.binding.lock()
    }
}

/// Entry of the merged view (the union's dentry)
#[derive(Debug)]
pub struct MergedEntry {
    name: OsString,
    /// Merged ino of the parent; the root is its own parent
    parent: u64,
    inode: Arc<MergedInode>,
    private: Mutex<Option<EntryPrivate>>,
    /// Reachable through lookups
    hashed: AtomicBool,
}

impl MergedEntry {
    pub fn new(parent: u64, name: &OsStr, inode: Arc<MergedInode>) -> Self {
        Self {
            name: name.to_os_string(),
            parent,
            inode,
            private: Mutex::new(None),
            hashed: AtomicBool::new(false),
        }
    }

    /// Root entry, its own parent
    pub fn new_root(inode: Arc<MergedInode>) -> Self {
        let ino = inode.ino();
        Self::new(ino, OsStr::new("/"), inode)
    }

    pub fn name(&self) -> &OsStr {
        &self.name
    }

    pub fn parent(&self) -> u64 {
        self.parent
    }

    pub fn inode(&self) -> &Arc<MergedInode> {
        &self.inode
    }

    pub fn ino(&self) -> u64 {
        self.inode.ino()
    }

    /// Attach private data; an entry carries at most one. Refused data is
    /// handed back to the caller.
    pub fn set_private(&self, data: EntryPrivate) -> std::result::Result<(), EntryPrivate> {
        let mut private = self.private.lock();
        if private.is_some() {
            return Err(data);
        }
        *private = Some(data);
        Ok(())
    }

    /// Allocate private data from `alloc` and attach it
    pub fn attach_private(&self, alloc: &dyn EntryAllocator) -> Result<()> {
        self.set_private(alloc.alloc_private()?).map_err(|data| {
            alloc.free_private(data);
            Error::Internal(format!("entry {:?} already has private data", self.name))
        })
    }

    pub fn has_private(&self) -> bool {
        self.private.lock().is_some()
    }

    /// Bind the branch object backing this entry
    pub fn set_lower_path(&self, path: LowerPath) -> Result<()> {
        match self.private.lock().as_ref() {
            Some(data) => data.binding().bind(path),
            None => Err(Error::Internal(format!(
                "entry {:?} has no private data",
                self.name
            ))),
        }
    }

    /// Reference to the bound branch object, released when dropped
    pub fn lower_path(&self) -> Option<LowerPath> {
        self.private.lock().as_ref().and_then(|data| data.binding().get())
    }

    pub fn is_bound(&self) -> bool {
        self.private
            .lock()
            .as_ref()
            .map(|data| data.binding().is_bound())
            .unwrap_or(false)
    }

    /// Make the entry reachable
    pub fn rehash(&self) {
        self.hashed.store(true, Ordering::SeqCst);
    }

    pub fn unhash(&self) {
        self.hashed.store(false, Ordering::SeqCst);
    }

    pub fn is_hashed(&self) -> bool {
        self.hashed.load(Ordering::SeqCst)
    }

    /// Check the cached entry against the branch object backing it.
    ///
    /// In RCU walk mode this fails with [`Error::RetryWithoutRcu`] without
    /// touching the binding. Otherwise the branch's own revalidation decides;
    /// a branch without one is always valid.
    pub fn revalidate(&self, flags: LookupFlags) -> Result<Validity> {
        if flags.contains(LookupFlags::RCU) {
            return Err(Error::RetryWithoutRcu);
        }

        let Some(lower) = self.lower_path() else {
            debug!("revalidate {:?}: no lower path", self.name);
            return Ok(Validity::Stale);
        };

        let dentry = lower.dentry();
        match dentry.ops() {
            None => Ok(Validity::Valid),
            Some(ops) => ops.revalidate(dentry, flags),
        }
    }

    /// Release the lower path and free the private data. Safe to call twice.
    pub fn release(&self, alloc: &dyn EntryAllocator) {
        self.unhash();
        let Some(data) = self.private.lock().take() else {
            return;
        };

        if let Some(lower) = data.binding().reset() {
            debug!(
                "release {:?}: dropping {}",
                self.name,
                lower.dentry().path().display()
            );
        }
        alloc.free_private(data);
    }
}

impl Drop for MergedEntry {
    fn drop(&mut self) {
        if self.private.get_mut().is_some() {
            warn!("entry {:?} dropped without release", self.name);
        }
    }
}

/// Allocation of merged entries and their private data
pub trait EntryAllocator: Send + Sync {
    /// Root entry for a new mount
    fn alloc_root(&self, inode: Arc<MergedInode>) -> Result<Arc<MergedEntry>>;

    /// Child entry `name` of `parent`
    fn alloc_entry(
        &self,
        parent: u64,
        name: &OsStr,
        inode: Arc<MergedInode>,
    ) -> Result<Arc<MergedEntry>>;

    fn alloc_private(&self) -> Result<EntryPrivate>;

    fn free_private(&self, data: EntryPrivate);
}

/// Cache of entry private data, with optional capacity
#[derive(Debug)]
pub struct EntryCache {
    name: &'static str,
    live: AtomicUsize,
    limit: Option<usize>,
}

impl EntryCache {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            live: AtomicUsize::new(0),
            limit: None,
        }
    }

    /// Cache refusing allocations past `limit` live objects
    pub fn with_limit(name: &'static str, limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::new(name)
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Private data currently handed out
    pub fn live_objects(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl EntryAllocator for EntryCache {
    fn alloc_root(&self, inode: Arc<MergedInode>) -> Result<Arc<MergedEntry>> {
        Ok(Arc::new(MergedEntry::new_root(inode)))
    }

    fn alloc_entry(
        &self,
        parent: u64,
        name: &OsStr,
        inode: Arc<MergedInode>,
    ) -> Result<Arc<MergedEntry>> {
        Ok(Arc::new(MergedEntry::new(parent, name, inode)))
    }

    fn alloc_private(&self) -> Result<EntryPrivate> {
        let reserved = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        if self.limit.is_some_and(|limit| reserved > limit) {
            self.live.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::OutOfMemory("entry private data"));
        }
        Ok(EntryPrivate::default())
    }

    fn free_private(&self, data: EntryPrivate) {
        drop(data);
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Build a fully bound, hashed child entry.
///
/// On failure nothing allocated here stays reachable and `lower` is
/// released.
pub fn instantiate(
    alloc: &dyn EntryAllocator,
    parent: u64,
    name: &OsStr,
    inode: Arc<MergedInode>,
    lower: LowerPath,
) -> Result<Arc<MergedEntry>> {
    let entry = alloc.alloc_entry(parent, name, inode)?;

    let bound = entry
        .attach_private(alloc)
        .and_then(|()| entry.set_lower_path(lower));
    if let Err(e) = bound {
        entry.release(alloc);
        return Err(e);
    }

    entry.rehash();
    Ok(entry)
}
