//! Branch path resolution

use std::fs::{self, OpenOptions};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error};

use super::lower::{BranchDentry, BranchMount, EntryOperations, LowerPath};
use super::superblock::{BranchSuperblock, SuperblockTable};
use super::{BranchRole, BranchSpec};
use crate::error::{Error, Result};

/// A branch root walked to and held open
#[derive(Debug, Clone)]
pub struct BoundLocation {
    spec: BranchSpec,
    path: LowerPath,
}

impl BoundLocation {
    pub fn spec(&self) -> &BranchSpec {
        &self.spec
    }

    pub fn role(&self) -> BranchRole {
        self.spec.role
    }

    pub fn lower_path(&self) -> &LowerPath {
        &self.path
    }

    pub fn mount(&self) -> &Arc<BranchMount> {
        self.path.mnt()
    }

    pub fn superblock(&self) -> &Arc<BranchSuperblock> {
        self.path.mnt().superblock()
    }

    pub fn into_lower_path(self) -> LowerPath {
        self.path
    }
}

/// Walk a branch path, following symlinks, to a directory.
///
/// `entry_ops` is attached to the branch superblock the first time its
/// device is seen.
pub fn resolve(
    spec: &BranchSpec,
    superblocks: &SuperblockTable,
    entry_ops: Option<Arc<dyn EntryOperations>>,
) -> Result<BoundLocation> {
    let inaccessible = |source: std::io::Error| {
        error!(
            "error accessing {} directory '{}': {}",
            spec.role,
            spec.path.display(),
            source
        );
        Error::BranchInaccessible {
            role: spec.role,
            path: spec.path.clone(),
            source,
        }
    };

    let root = fs::canonicalize(&spec.path).map_err(inaccessible)?;
    let pin = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY | libc::O_CLOEXEC)
        .open(&root)
        .map_err(inaccessible)?;
    let meta = pin.metadata().map_err(inaccessible)?;

    let sb = superblocks
        .get_or_probe(meta.dev(), &root, entry_ops)
        .map_err(inaccessible)?;

    debug!(
        "bound {} branch {} -> {} (dev {})",
        spec.role,
        spec.path.display(),
        root.display(),
        meta.dev()
    );

    let dentry = BranchDentry::new(root.clone(), &meta, Arc::clone(&sb));
    let mnt = BranchMount::new(spec.role, root, pin, sb);

    Ok(BoundLocation {
        spec: spec.clone(),
        path: LowerPath::new(Arc::new(mnt), Arc::new(dentry)),
    })
}

/// Whether two bound locations name the same host directory
pub fn same_directory(a: &BoundLocation, b: &BoundLocation) -> bool {
    let (a, b) = (a.lower_path().dentry(), b.lower_path().dentry());
    a.dev() == b.dev() && a.ino() == b.ino()
}

/// Check a path names an accessible directory, without binding it
pub fn check_directory(path: &Path) -> std::io::Result<()> {
    let meta = fs::metadata(path)?;
    if meta.is_dir() {
        Ok(())
    } else {
        Err(std::io::Error::from_raw_os_error(libc::ENOTDIR))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_resolve_directory() {
        let dir = tempdir().unwrap();
        let table = SuperblockTable::new();
        let spec = BranchSpec::new(BranchRole::ReadOnly, dir.path());

        let bound = resolve(&spec, &table, None).unwrap();
        assert_eq!(bound.role(), BranchRole::ReadOnly);
        assert_eq!(bound.mount().root(), dir.path().canonicalize().unwrap());
        assert!(bound.lower_path().dentry().is_dir());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_resolve_follows_symlink() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("target");
        fs::create_dir(&target).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let table = SuperblockTable::new();
        let bound = resolve(&BranchSpec::new(BranchRole::ReadWrite, &link), &table, None).unwrap();
        assert_eq!(bound.mount().root(), target.canonicalize().unwrap());
    }

    #[test]
    fn test_resolve_missing_path() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing");
        let table = SuperblockTable::new();

        let err = resolve(&BranchSpec::new(BranchRole::ReadOnly, &missing), &table, None)
            .unwrap_err();
        match err {
            Error::BranchInaccessible { role, path, source } => {
                assert_eq!(role, BranchRole::ReadOnly);
                assert_eq!(path, missing);
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(table.is_empty());
    }

    #[test]
    fn test_resolve_regular_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, b"x").unwrap();
        let table = SuperblockTable::new();

        let err = resolve(&BranchSpec::new(BranchRole::ReadWrite, &file), &table, None)
            .unwrap_err();
        assert_eq!(err.errno(), libc::ENOTDIR);
        assert!(check_directory(&file).is_err());
        assert!(check_directory(dir.path()).is_ok());
    }

    #[test]
    fn test_same_directory() {
        let dir = tempdir().unwrap();
        let other = tempdir().unwrap();
        let table = SuperblockTable::new();

        let a = resolve(&BranchSpec::new(BranchRole::ReadOnly, dir.path()), &table, None).unwrap();
        let b = resolve(&BranchSpec::new(BranchRole::ReadWrite, dir.path()), &table, None).unwrap();
        let c = resolve(&BranchSpec::new(BranchRole::ReadWrite, other.path()), &table, None).unwrap();
        assert!(same_directory(&a, &b));
        assert!(!same_directory(&a, &c));
    }
}
