//! Union FUSE filesystem
//!
//! Exposes a mounted [`MergedSuperblock`] through FUSE. Lookups prefer the
//! read-write branch and fall back to the read-only one; cached entries are
//! revalidated through their lower binding before reuse and released when
//! the kernel forgets them.

use fuser::{
    Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen,
    ReplyStatfs, ReplyWrite, Request,
};
use nix::sys::statvfs::statvfs;
use std::collections::{HashMap, HashSet};
use std::ffi::{OsStr, OsString};
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::entry::{instantiate, MergedEntry};
use super::handle::HandleTable;
use super::inode::EntryKind;
use super::super_block::MergedSuperblock;
use crate::branch::{BranchRole, LookupFlags, LowerPath, Validity};
use crate::error::{Error, Result};

/// Default attribute and entry TTL
pub const DEFAULT_TTL: Duration = Duration::from_secs(1);

/// Directory entry ino for children the union has not numbered yet
pub const UNKNOWN_INO: u64 = 0xffff_ffff;

/// Open flags passed through to the branch file
const PASSTHROUGH_FLAGS: i32 = libc::O_APPEND | libc::O_NONBLOCK | libc::O_SYNC | libc::O_DSYNC;

/// A merged entry known to the kernel
struct CachedEntry {
    entry: Arc<MergedEntry>,
    /// Union path relative to the root
    path: PathBuf,
    /// Outstanding kernel lookups
    nlookup: u64,
}

/// Union FUSE filesystem
pub struct UnionFs {
    sb: MergedSuperblock,
    /// Merged ino -> entry
    entries: HashMap<u64, CachedEntry>,
    /// (parent ino, name) -> merged ino
    children: HashMap<(u64, OsString), u64>,
    handles: HandleTable,
    ttl: Duration,
}

impl UnionFs {
    /// Serve a mounted superblock
    pub fn new(sb: MergedSuperblock, ttl: Duration) -> Self {
        let root = Arc::clone(sb.root());
        let mut entries = HashMap::new();
        entries.insert(
            root.ino(),
            CachedEntry {
                entry: root,
                path: PathBuf::new(),
                nlookup: 1,
            },
        );

        Self {
            sb,
            entries,
            children: HashMap::new(),
            handles: HandleTable::new(),
            ttl,
        }
    }

    pub fn superblock(&self) -> &MergedSuperblock {
        &self.sb
    }

    /// Entries currently known to the kernel, root included
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    fn entry(&self, ino: u64) -> Result<&CachedEntry> {
        self.entries
            .get(&ino)
            .ok_or_else(|| Error::NotFound(format!("inode {}", ino)))
    }

    fn lower_of(&self, ino: u64) -> Result<LowerPath> {
        self.entry(ino)?
            .entry
            .lower_path()
            .ok_or_else(|| Error::NotFound(format!("inode {} has no lower path", ino)))
    }

    /// Find the branch object currently backing `path`.
    ///
    /// The read-write branch wins over the read-only one.
    fn resolve_path(&self, path: &Path) -> Result<Option<LowerPath>> {
        for bound in [self.sb.rw_root(), self.sb.ro_root()] {
            match bound.mount().lookup(path) {
                Ok(lower) => return Ok(Some(lower)),
                Err(e) if matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::ENOTDIR)) => {
                    continue
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Whether a cached read-only entry is now hidden by a read-write object
    fn shadowed(&self, cached: &CachedEntry) -> Result<bool> {
        let Some(lower) = cached.entry.lower_path() else {
            return Ok(false);
        };
        if lower.role() != BranchRole::ReadOnly {
            return Ok(false);
        }
        match self.sb.rw_root().mount().lookup(&cached.path) {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::ENOTDIR)) => {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Look up `name` in `parent`, taking one kernel reference on success
    pub fn lookup_entry(&mut self, parent: u64, name: &OsStr) -> Result<Arc<MergedEntry>> {
        let parent_path = self.entry(parent)?.path.clone();
        let key = (parent, name.to_os_string());

        if let Some(&ino) = self.children.get(&key) {
            match self.entries.get(&ino) {
                Some(cached) => {
                    let usable = cached.entry.revalidate(LookupFlags::empty())? == Validity::Valid
                        && !self.shadowed(cached)?;
                    if usable {
                        if let Some(cached) = self.entries.get_mut(&ino) {
                            cached.nlookup += 1;
                            return Ok(Arc::clone(&cached.entry));
                        }
                    }
                    debug!("lookup: {:?} is stale", name);
                    self.drop_entry(ino);
                }
                None => {
                    self.children.remove(&key);
                }
            }
        }

        let path = parent_path.join(name);
        let lower = self
            .resolve_path(&path)?
            .ok_or_else(|| Error::NotFound(path.display().to_string()))?;
        let inode = self.sb.inodes().iget(lower.dentry())?;
        let ino = inode.ino();

        // Another name for an object we already expose
        if let Some(cached) = self.entries.get_mut(&ino) {
            cached.nlookup += 1;
            let entry = Arc::clone(&cached.entry);
            self.children.insert(key, ino);
            return Ok(entry);
        }

        let entry = instantiate(self.sb.allocator(), parent, name, inode, lower)?;
        self.entries.insert(
            ino,
            CachedEntry {
                entry: Arc::clone(&entry),
                path,
                nlookup: 1,
            },
        );
        self.children.insert(key, ino);
        Ok(entry)
    }

    /// Drop `nlookup` kernel references; the entry is released at zero
    pub fn forget_entry(&mut self, ino: u64, nlookup: u64) {
        if ino == fuser::FUSE_ROOT_ID {
            return;
        }
        let remaining = match self.entries.get_mut(&ino) {
            Some(cached) => {
                cached.nlookup = cached.nlookup.saturating_sub(nlookup);
                cached.nlookup
            }
            None => return,
        };
        if remaining == 0 {
            self.drop_entry(ino);
        }
    }

    fn drop_entry(&mut self, ino: u64) {
        if let Some(cached) = self.entries.remove(&ino) {
            cached.entry.release(self.sb.allocator());
            self.children.retain(|_, child| *child != ino);
            self.sb.inodes().evict(ino);
            debug!("released {:?} (ino {})", cached.path, ino);
        }
    }

    /// Current attributes of `ino`, refreshed from its branch object
    pub fn attr(&self, ino: u64) -> Result<fuser::FileAttr> {
        let cached = self.entry(ino)?;
        let lower = self.lower_of(ino)?;
        let inode = cached.entry.inode();
        inode.refresh(&lower.dentry().metadata()?);
        Ok(inode.to_fuser_attr())
    }

    /// Merged directory listing: read-write entries first, then read-only
    /// entries not shadowed by them.
    pub fn read_merged_dir(&self, ino: u64) -> Result<Vec<(OsString, EntryKind, u64)>> {
        let cached = self.entry(ino)?;
        if !cached.entry.inode().is_dir() {
            return Err(Error::Io(std::io::Error::from_raw_os_error(libc::ENOTDIR)));
        }

        let mut entries = Vec::new();
        let mut seen = HashSet::new();
        let mut listed = false;

        for bound in [self.sb.rw_root(), self.sb.ro_root()] {
            let mnt = bound.mount();
            let dev = mnt.superblock().dev();
            if !mnt.resolve(&cached.path).is_dir() {
                continue;
            }
            listed = true;
            for entry in mnt.readdir(&cached.path)? {
                if !seen.insert(entry.name.clone()) {
                    continue;
                }
                let child_ino = self
                    .children
                    .get(&(ino, entry.name.clone()))
                    .copied()
                    .or_else(|| self.sb.inodes().ino_for(dev, entry.ino))
                    .unwrap_or(UNKNOWN_INO);
                entries.push((entry.name, EntryKind::from(entry.file_type), child_ino));
            }
        }

        if !listed {
            return Err(Error::NotFound(cached.path.display().to_string()));
        }
        Ok(entries)
    }

    /// Open `ino`, refusing writes to the read-only branch
    pub fn open_entry(&self, ino: u64, flags: i32) -> Result<u64> {
        let lower = self.lower_of(ino)?;
        let accmode = flags & libc::O_ACCMODE;
        let wants_write = accmode == libc::O_WRONLY || accmode == libc::O_RDWR;

        if wants_write && lower.role() == BranchRole::ReadOnly {
            return Err(Error::ReadOnlyBranch);
        }

        let file = OpenOptions::new()
            .read(accmode != libc::O_WRONLY)
            .write(wants_write)
            .truncate(wants_write && flags & libc::O_TRUNC != 0)
            .custom_flags(flags & PASSTHROUGH_FLAGS)
            .open(lower.dentry().path())?;

        Ok(self.handles.open(ino, lower.role(), flags, file))
    }

    fn release_all(&mut self) {
        let inos: Vec<u64> = self
            .entries
            .keys()
            .copied()
            .filter(|&ino| ino != fuser::FUSE_ROOT_ID)
            .collect();
        for ino in inos {
            self.drop_entry(ino);
        }
    }
}

impl Drop for UnionFs {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl Filesystem for UnionFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);

        match self.lookup_entry(parent, name) {
            Ok(entry) => match self.attr(entry.ino()) {
                Ok(attr) => reply.entry(&self.ttl, &attr, 0),
                Err(e) => {
                    self.forget_entry(entry.ino(), 1);
                    reply.error(e.errno());
                }
            },
            Err(e) => reply.error(e.errno()),
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        debug!("forget(ino={}, nlookup={})", ino, nlookup);
        self.forget_entry(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);

        match self.attr(ino) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);

        match self.lower_of(ino).and_then(|lower| lower.readlink()) {
            Ok(target) => reply.data(target.as_os_str().as_encoded_bytes()),
            Err(e) => {
                error!("Failed to read symlink: {}", e);
                reply.error(e.errno());
            }
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={:#x})", ino, flags);

        match self.open_entry(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);

        let Some(handle) = self.handles.get(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        match handle.read_at(offset.max(0) as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                error!("Failed to read from {} branch: {}", handle.role, e);
                reply.error(e.errno());
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());

        let Some(handle) = self.handles.get(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        match handle.write_at(offset.max(0) as u64, data) {
            Ok(written) => reply.written(written as u32),
            Err(e) => {
                warn!("write to ino {} refused: {}", ino, e);
                reply.error(e.errno());
            }
        }
    }

    fn fsync(&mut self, _req: &Request, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        debug!("fsync(ino={}, fh={}, datasync={})", ino, fh, datasync);

        match self.handles.get(fh) {
            Some(handle) => match handle.sync(datasync) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            },
            None => reply.error(libc::EBADF),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={}, fh={})", ino, fh);
        self.handles.close(fh);
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);

        let parent = match self.entry(ino) {
            Ok(cached) => cached.entry.parent(),
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        let mut entries: Vec<(OsString, EntryKind, u64)> = vec![
            (OsString::from("."), EntryKind::Directory, ino),
            (OsString::from(".."), EntryKind::Directory, parent),
        ];
        match self.read_merged_dir(ino) {
            Ok(merged) => entries.extend(merged),
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        }

        for (i, (name, kind, child_ino)) in entries.iter().enumerate().skip(offset as usize) {
            let buffer_full = reply.add(*child_ino, (i + 1) as i64, kind.to_fuser_type(), name);
            if buffer_full {
                break;
            }
        }

        reply.ok();
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access(ino={}, mask={})", ino, mask);

        let lower = match self.lower_of(ino) {
            Ok(lower) => lower,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        if mask & libc::W_OK != 0 && lower.role() == BranchRole::ReadOnly {
            reply.error(libc::EROFS);
        } else {
            reply.ok();
        }
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        // Report the read-write branch: that is where space gets used
        let bound = self.sb.rw_root();
        match statvfs(bound.mount().root()) {
            Ok(st) => reply.statfs(
                st.blocks() as u64,
                st.blocks_free() as u64,
                st.blocks_available() as u64,
                st.files() as u64,
                st.files_free() as u64,
                st.block_size() as u32,
                st.name_max() as u32,
                st.fragment_size() as u32,
            ),
            Err(e) => reply.error(e as i32),
        }
    }

    fn destroy(&mut self) {
        debug!("destroy()");
        self.release_all();
    }
}
