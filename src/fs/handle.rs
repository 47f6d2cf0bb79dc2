//! Open file tracking

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::branch::BranchRole;
use crate::error::{Error, Result};

/// A branch file opened through the union
#[derive(Debug)]
pub struct OpenFile {
    /// Handle handed to the kernel
    pub fh: u64,
    /// Merged inode
    pub ino: u64,
    /// Branch the file was opened in
    pub role: BranchRole,
    /// Open flags
    pub flags: i32,
    file: File,
}

impl OpenFile {
    /// Check if opened for writing
    pub fn is_writable(&self) -> bool {
        let accmode = self.flags & libc::O_ACCMODE;
        accmode == libc::O_WRONLY || accmode == libc::O_RDWR
    }

    /// Read up to `size` bytes at `offset`
    pub fn read_at(&self, offset: u64, size: u32) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buffer.len() {
            let n = self.file.read_at(&mut buffer[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);
        Ok(buffer)
    }

    /// Write `data` at `offset`; only read-write branch files accept writes
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        if self.role == BranchRole::ReadOnly {
            return Err(Error::ReadOnlyBranch);
        }
        if !self.is_writable() {
            return Err(Error::Io(std::io::Error::from_raw_os_error(libc::EBADF)));
        }
        self.file.write_all_at(data, offset)?;
        Ok(data.len())
    }

    pub fn sync(&self, datasync: bool) -> Result<()> {
        if datasync {
            self.file.sync_data()?;
        } else {
            self.file.sync_all()?;
        }
        Ok(())
    }
}

/// Manages open file handles
pub struct HandleTable {
    next_fh: AtomicU64,
    handles: RwLock<HashMap<u64, Arc<OpenFile>>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Register an opened file and return its handle
    pub fn open(&self, ino: u64, role: BranchRole, flags: i32, file: File) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        let handle = OpenFile {
            fh,
            ino,
            role,
            flags,
            file,
        };
        self.handles.write().insert(fh, Arc::new(handle));
        fh
    }

    /// Get handle by ID
    pub fn get(&self, fh: u64) -> Option<Arc<OpenFile>> {
        self.handles.read().get(&fh).cloned()
    }

    /// Close handle and return it
    pub fn close(&self, fh: u64) -> Option<Arc<OpenFile>> {
        self.handles.write().remove(&fh)
    }

    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.read().is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    #[test]
    fn test_handle_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello world").unwrap();
        let table = HandleTable::new();

        let fh1 = table.open(5, BranchRole::ReadOnly, libc::O_RDONLY, File::open(&path).unwrap());
        let fh2 = table.open(5, BranchRole::ReadOnly, libc::O_RDONLY, File::open(&path).unwrap());
        assert_ne!(fh1, fh2);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(fh2).unwrap().ino, 5);

        let handle = table.get(fh1).unwrap();
        assert_eq!(handle.read_at(6, 64).unwrap(), b"world");
        assert!(!handle.is_writable());

        table.close(fh1);
        assert!(table.get(fh1).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_write_only_on_rw_branch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"abc").unwrap();
        let table = HandleTable::new();

        let open_rw = || OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let ro = table.open(1, BranchRole::ReadOnly, libc::O_RDWR, open_rw());
        let rw = table.open(1, BranchRole::ReadWrite, libc::O_RDWR, open_rw());

        assert!(matches!(
            table.get(ro).unwrap().write_at(0, b"x"),
            Err(Error::ReadOnlyBranch)
        ));

        let handle = table.get(rw).unwrap();
        assert_eq!(handle.write_at(1, b"Z").unwrap(), 1);
        handle.sync(true).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"aZc");
    }
}
