//! Filesystem type registry
//!
//! Holds the filesystem types this process can mount and the entry cache
//! they allocate from. `init` registers hepunion, `shutdown` tears it down.

use bitflags::bitflags;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

use super::entry::EntryCache;
use super::super_block::{read_super, MergedSuperblock, MountContext};
use crate::branch::{EntryOperations, SuperblockTable};
use crate::error::{Error, Result};

/// Name hepunion registers under
pub const HEPUNION_NAME: &str = "hepunion";

/// Name of the entry private-data cache
pub const ENTRY_CACHE_NAME: &str = "hepunion_dentry";

bitflags! {
    /// Filesystem type flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FsFlags: u32 {
        const REQUIRES_DEV = 1;
        /// Revalidate "." and ".." on path walks
        const REVAL_DOT = 16384;
    }
}

/// Mount entry point of a filesystem type
pub type MountFn = fn(Option<&str>, &MountContext, bool) -> Result<MergedSuperblock>;

/// A mountable filesystem type
pub struct FileSystemType {
    pub name: &'static str,
    pub flags: FsFlags,
    mount: MountFn,
}

impl FileSystemType {
    pub const fn new(name: &'static str, flags: FsFlags, mount: MountFn) -> Self {
        Self { name, flags, mount }
    }

    /// Mount without a backing device
    pub fn mount(
        &self,
        data: Option<&str>,
        ctx: &MountContext,
        silent: bool,
    ) -> Result<MergedSuperblock> {
        (self.mount)(data, ctx, silent)
    }
}

impl fmt::Debug for FileSystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSystemType")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// The hepunion filesystem type
pub static HEPUNION_FS_TYPE: FileSystemType =
    FileSystemType::new(HEPUNION_NAME, FsFlags::REVAL_DOT, read_super);

/// Registered filesystem types and shared mount state
#[derive(Debug, Default)]
pub struct Registry {
    types: RwLock<HashMap<&'static str, &'static FileSystemType>>,
    entry_cache: RwLock<Option<Arc<EntryCache>>>,
    superblocks: Arc<SuperblockTable>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(Registry::new)
    }

    pub fn register(&self, fs_type: &'static FileSystemType) -> Result<()> {
        let mut types = self.types.write();
        if types.contains_key(fs_type.name) {
            return Err(Error::AlreadyRegistered(fs_type.name.to_string()));
        }
        types.insert(fs_type.name, fs_type);
        debug!("registered filesystem type {}", fs_type.name);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        match self.types.write().remove(name) {
            Some(_) => {
                debug!("unregistered filesystem type {}", name);
                Ok(())
            }
            None => Err(Error::UnknownFilesystem(name.to_string())),
        }
    }

    pub fn get(&self, name: &str) -> Option<&'static FileSystemType> {
        self.types.read().get(name).copied()
    }

    pub fn init_entry_cache(&self) -> Result<()> {
        let mut cache = self.entry_cache.write();
        if cache.is_some() {
            return Err(Error::AlreadyRegistered(ENTRY_CACHE_NAME.to_string()));
        }
        *cache = Some(Arc::new(EntryCache::new(ENTRY_CACHE_NAME)));
        Ok(())
    }

    pub fn destroy_entry_cache(&self) {
        if let Some(cache) = self.entry_cache.write().take() {
            let live = cache.live_objects();
            if live > 0 {
                warn!("{}: destroyed with {} live objects", cache.name(), live);
            }
        }
    }

    pub fn entry_cache(&self) -> Option<Arc<EntryCache>> {
        self.entry_cache.read().clone()
    }

    pub fn superblocks(&self) -> &Arc<SuperblockTable> {
        &self.superblocks
    }

    /// Mount a registered filesystem type
    pub fn mount(
        &self,
        name: &str,
        data: Option<&str>,
        silent: bool,
        entry_ops: Option<Arc<dyn EntryOperations>>,
    ) -> Result<MergedSuperblock> {
        let fs_type = self
            .get(name)
            .ok_or_else(|| Error::UnknownFilesystem(name.to_string()))?;
        let cache = self
            .entry_cache()
            .ok_or_else(|| Error::Internal("entry cache not initialised".to_string()))?;

        let mut ctx = MountContext::new(Arc::clone(&self.superblocks), cache);
        ctx.entry_ops = entry_ops;
        fs_type.mount(data, &ctx, silent)
    }

    /// Create the entry cache and register hepunion
    pub fn init(&self) -> Result<()> {
        let result = self
            .init_entry_cache()
            .and_then(|()| self.register(&HEPUNION_FS_TYPE));
        if let Err(e) = result {
            self.destroy_entry_cache();
            return Err(e);
        }
        info!("{} registered", HEPUNION_NAME);
        Ok(())
    }

    /// Destroy the entry cache and unregister hepunion, whatever `init` did
    pub fn shutdown(&self) {
        self.destroy_entry_cache();
        if let Err(e) = self.unregister(HEPUNION_NAME) {
            debug!("shutdown: {}", e);
        }
        self.superblocks.prune();
    }
}

/// Initialise the process-wide registry
pub fn init() -> Result<()> {
    Registry::global().init()
}

/// Shut down the process-wide registry
pub fn shutdown() {
    Registry::global().shutdown()
}
