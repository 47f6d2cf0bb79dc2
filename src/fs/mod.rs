//! Union filesystem
//!
//! The merged view over two branches: mount bootstrap, merged entries and
//! their lower bindings, the filesystem type registry, and the FUSE
//! adapter serving it all.

mod entry;
mod filesystem;
mod handle;
mod inode;
pub mod registry;
mod super_block;

pub use entry::{instantiate, EntryAllocator, EntryCache, EntryPrivate, LowerBinding, MergedEntry};
pub use filesystem::{UnionFs, DEFAULT_TTL, UNKNOWN_INO};
pub use handle::{HandleTable, OpenFile};
pub use inode::{EntryKind, InodeAttributes, InodeTable, MergedInode};
pub use registry::{FileSystemType, FsFlags, Registry, HEPUNION_FS_TYPE, HEPUNION_NAME};
pub use super_block::{read_super, MergedSuperblock, MountContext, UnionInfo, TIME_GRANULARITY};
