//! Branch objects seen from the union
//!
//! A [`BranchMount`] is a bound branch root, a [`BranchDentry`] is one object
//! inside it and a [`LowerPath`] pairs the two. Cloning a `LowerPath` takes a
//! reference on both, dropping it gives them back.

use bitflags::bitflags;
use std::ffi::OsString;
use std::fs::{self, File, Metadata};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::superblock::BranchSuperblock;
use super::BranchRole;
use crate::error::Result;

bitflags! {
    /// Lookup mode passed down to revalidation
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LookupFlags: u32 {
        const FOLLOW = 0x0001;
        const DIRECTORY = 0x0002;
        const REVAL = 0x0020;
        /// Non-blocking path walk; revalidation must not sleep
        const RCU = 0x0040;
    }
}

/// Outcome of a revalidation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    /// Cached entry is still usable
    Valid,
    /// Cached entry must be discarded and looked up again
    Stale,
}

/// Optional per-filesystem dentry operations
pub trait EntryOperations: Send + Sync {
    fn revalidate(&self, dentry: &BranchDentry, flags: LookupFlags) -> Result<Validity>;
}

/// Revalidation for host directories: a dentry stays valid while its path
/// still names the same object.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostRevalidate;

impl EntryOperations for HostRevalidate {
    fn revalidate(&self, dentry: &BranchDentry, _flags: LookupFlags) -> Result<Validity> {
        match fs::symlink_metadata(&dentry.path) {
            Ok(meta) if meta.dev() == dentry.dev && meta.ino() == dentry.ino => {
                Ok(Validity::Valid)
            }
            Ok(_) => Ok(Validity::Stale),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Validity::Stale),
            Err(e) => Err(e.into()),
        }
    }
}

/// One object inside a branch
#[derive(Debug)]
pub struct BranchDentry {
    /// Absolute host path
    path: PathBuf,
    dev: u64,
    ino: u64,
    is_dir: bool,
    sb: Arc<BranchSuperblock>,
}

impl BranchDentry {
    pub fn new(path: PathBuf, meta: &Metadata, sb: Arc<BranchSuperblock>) -> Self {
        Self {
            path,
            dev: meta.dev(),
            ino: meta.ino(),
            is_dir: meta.is_dir(),
            sb,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dev(&self) -> u64 {
        self.dev
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn superblock(&self) -> &Arc<BranchSuperblock> {
        &self.sb
    }

    /// Revalidation capability, if the filesystem has one
    pub fn ops(&self) -> Option<&Arc<dyn EntryOperations>> {
        self.sb.entry_ops()
    }

    /// Fresh metadata of the object, without following symlinks
    pub fn metadata(&self) -> Result<Metadata> {
        Ok(fs::symlink_metadata(&self.path)?)
    }
}

/// Directory entry from a branch
#[derive(Debug, Clone)]
pub struct LowerDirEntry {
    pub name: OsString,
    pub file_type: fs::FileType,
    pub ino: u64,
}

/// A bound branch root.
///
/// Holds the branch directory open, which keeps the host filesystem busy
/// while the union is mounted.
#[derive(Debug)]
pub struct BranchMount {
    role: BranchRole,
    /// Canonical root path of the branch
    root: PathBuf,
    _pin: File,
    sb: Arc<BranchSuperblock>,
}

impl BranchMount {
    pub fn new(role: BranchRole, root: PathBuf, pin: File, sb: Arc<BranchSuperblock>) -> Self {
        Self {
            role,
            root,
            _pin: pin,
            sb,
        }
    }

    pub fn role(&self) -> BranchRole {
        self.role
    }

    /// Get the root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn superblock(&self) -> &Arc<BranchSuperblock> {
        &self.sb
    }

    /// Resolve a union path to the host path inside this branch
    pub fn resolve(&self, path: &Path) -> PathBuf {
        let relative = path.strip_prefix("/").unwrap_or(path);
        if relative.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }

    /// Look up a union path in this branch
    pub fn lookup(self: &Arc<Self>, path: &Path) -> std::io::Result<LowerPath> {
        let resolved = self.resolve(path);
        let meta = fs::symlink_metadata(&resolved)?;
        let dentry = BranchDentry::new(resolved, &meta, Arc::clone(&self.sb));
        Ok(LowerPath::new(Arc::clone(self), Arc::new(dentry)))
    }

    /// Read directory entries
    pub fn readdir(&self, path: &Path) -> Result<Vec<LowerDirEntry>> {
        let resolved = self.resolve(path);
        let mut entries = Vec::new();

        for entry in fs::read_dir(&resolved)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let ino = {
                use std::os::unix::fs::DirEntryExt;
                entry.ino()
            };

            entries.push(LowerDirEntry {
                name: entry.file_name(),
                file_type,
                ino,
            });
        }

        Ok(entries)
    }
}

/// Counted reference to a branch object and the branch it lives in
#[derive(Debug, Clone)]
pub struct LowerPath {
    mnt: Arc<BranchMount>,
    dentry: Arc<BranchDentry>,
}

impl LowerPath {
    pub fn new(mnt: Arc<BranchMount>, dentry: Arc<BranchDentry>) -> Self {
        Self { mnt, dentry }
    }

    pub fn mnt(&self) -> &Arc<BranchMount> {
        &self.mnt
    }

    pub fn dentry(&self) -> &Arc<BranchDentry> {
        &self.dentry
    }

    pub fn role(&self) -> BranchRole {
        self.mnt.role()
    }

    /// Read symlink target
    pub fn readlink(&self) -> Result<PathBuf> {
        Ok(fs::read_link(self.dentry.path())?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::branch::SuperblockTable;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    /// Bind `dir` as a branch without going through the resolver
    pub(crate) fn mount_dir(
        role: BranchRole,
        dir: &Path,
        ops: Option<Arc<dyn EntryOperations>>,
    ) -> Arc<BranchMount> {
        let root = dir.canonicalize().unwrap();
        let meta = fs::metadata(&root).unwrap();
        let sb = SuperblockTable::new()
            .get_or_probe(meta.dev(), &root, ops)
            .unwrap();
        let pin = File::open(&root).unwrap();
        Arc::new(BranchMount::new(role, root, pin, sb))
    }

    /// Entry operations returning a fixed answer and counting calls
    pub(crate) struct FixedOps {
        pub answer: Validity,
        pub calls: Mutex<Vec<LookupFlags>>,
    }

    impl FixedOps {
        pub(crate) fn new(answer: Validity) -> Arc<Self> {
            Arc::new(Self {
                answer,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    impl EntryOperations for FixedOps {
        fn revalidate(&self, _dentry: &BranchDentry, flags: LookupFlags) -> Result<Validity> {
            self.calls.lock().push(flags);
            Ok(self.answer)
        }
    }

    #[test]
    fn test_lookup() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("test.txt"), b"hello world").unwrap();
        let mnt = mount_dir(BranchRole::ReadOnly, dir.path(), None);

        let lower = mnt.lookup(Path::new("test.txt")).unwrap();
        assert_eq!(lower.role(), BranchRole::ReadOnly);
        assert_eq!(lower.dentry().metadata().unwrap().len(), 11);
        assert!(!lower.dentry().is_dir());

        let err = mnt.lookup(Path::new("nonexistent.txt")).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn test_resolve_root() {
        let dir = tempdir().unwrap();
        let mnt = mount_dir(BranchRole::ReadWrite, dir.path(), None);

        assert_eq!(mnt.resolve(Path::new("")), mnt.root());
        assert_eq!(mnt.resolve(Path::new("/")), mnt.root());
        let host = mnt.resolve(Path::new("/a/b"));
        assert_eq!(host, mnt.root().join("a/b"));
    }

    #[test]
    fn test_readdir() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("file1.txt"), b"1").unwrap();
        fs::write(dir.path().join("file2.txt"), b"2").unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();
        let mnt = mount_dir(BranchRole::ReadOnly, dir.path(), None);

        let entries = mnt.readdir(Path::new("")).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries
            .iter()
            .any(|e| e.name == "subdir" && e.file_type.is_dir()));
    }

    #[test]
    fn test_host_revalidate() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("victim");
        fs::write(&file, b"v1").unwrap();
        let mnt = mount_dir(BranchRole::ReadOnly, dir.path(), None);
        let lower = mnt.lookup(Path::new("victim")).unwrap();

        let ops = HostRevalidate;
        assert_eq!(
            ops.revalidate(lower.dentry(), LookupFlags::empty()).unwrap(),
            Validity::Valid
        );

        fs::remove_file(&file).unwrap();
        assert_eq!(
            ops.revalidate(lower.dentry(), LookupFlags::empty()).unwrap(),
            Validity::Stale
        );
    }

    #[test]
    fn test_lower_path_clone_counts() {
        let dir = tempdir().unwrap();
        let mnt = mount_dir(BranchRole::ReadOnly, dir.path(), None);
        let lower = mnt.lookup(Path::new("")).unwrap();
        assert_eq!(Arc::strong_count(lower.dentry()), 1);

        let got = lower.clone();
        assert_eq!(Arc::strong_count(lower.dentry()), 2);
        drop(got);
        assert_eq!(Arc::strong_count(lower.dentry()), 1);
    }
}
