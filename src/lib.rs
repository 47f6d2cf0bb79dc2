//! hepunion - two-branch union filesystem
//!
//! Merges a read-write branch over a read-only branch and serves the result
//! through FUSE. The read-only branch is pinned for the lifetime of the
//! mount; lookups prefer the read-write branch.

pub mod branch;
pub mod config;
pub mod error;
pub mod fs;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::branch::{BranchRole, MountDescriptor};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::fs::{MergedSuperblock, UnionFs};
}
