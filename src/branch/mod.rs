//! Branch handling
//!
//! Everything below the union: parsing the mount argument into two typed
//! branches, binding each branch root, and the host filesystem objects the
//! merged view forwards to.

mod lower;
mod resolve;
mod spec;
mod superblock;

pub use lower::{
    BranchDentry, BranchMount, EntryOperations, HostRevalidate, LookupFlags, LowerDirEntry,
    LowerPath, Validity,
};
pub use resolve::{check_directory, resolve, same_directory, BoundLocation};
pub use spec::{BranchError, BranchRole, BranchSpec, Clause, MountDescriptor};
pub use superblock::{ActiveRef, BranchSuperblock, SuperblockTable, MAX_LFS_FILESIZE};

#[cfg(test)]
pub(crate) use lower::tests as test_support;
