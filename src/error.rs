//! Error types for hepunion

use crate::branch::{BranchError, BranchRole};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for hepunion
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Missing mount argument (expected branch[=RW|RO]:branch[=RW|RO])")]
    MissingArgument,

    #[error("Invalid branch specification: {0}")]
    Branch(#[from] BranchError),

    #[error("Error accessing {role} branch '{path}': {source}")]
    BranchInaccessible {
        role: BranchRole,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Out of memory allocating {0}")]
    OutOfMemory(&'static str),

    #[error("Lower path already bound")]
    BindingOccupied,

    #[error("Lookup must be retried in ref-walk mode")]
    RetryWithoutRcu,

    #[error("Branch is read-only")]
    ReadOnlyBranch,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Filesystem type already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Unknown filesystem type: {0}")]
    UnknownFilesystem(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errno reported to the FUSE layer
    pub fn errno(&self) -> i32 {
        match self {
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::BranchInaccessible { source, .. } => {
                source.raw_os_error().unwrap_or(libc::EINVAL)
            }
            Error::MissingArgument
            | Error::Branch(_)
            | Error::Config(_)
            | Error::InvalidConfig(_) => libc::EINVAL,
            Error::OutOfMemory(_) => libc::ENOMEM,
            Error::BindingOccupied | Error::AlreadyRegistered(_) => libc::EBUSY,
            Error::RetryWithoutRcu => libc::ECHILD,
            Error::ReadOnlyBranch => libc::EROFS,
            Error::NotFound(_) => libc::ENOENT,
            Error::UnknownFilesystem(_) => libc::ENODEV,
            Error::Internal(_) => libc::EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::MissingArgument.errno(), libc::EINVAL);
        assert_eq!(
            Error::Branch(BranchError::MissingSecondBranch).errno(),
            libc::EINVAL
        );
        assert_eq!(Error::RetryWithoutRcu.errno(), libc::ECHILD);
        assert_eq!(Error::OutOfMemory("root entry").errno(), libc::ENOMEM);

        let io = std::io::Error::from_raw_os_error(libc::ENOTDIR);
        let err = Error::BranchInaccessible {
            role: BranchRole::ReadOnly,
            path: PathBuf::from("/nope"),
            source: io,
        };
        assert_eq!(err.errno(), libc::ENOTDIR);
        assert!(err.to_string().contains("/nope"));
    }
}
