//! Error kinds surfaced by the filesystem (§6.4, §7).
//!
//! Grounded in the `thiserror`-based `SFSError` pattern used by the closest
//! from-scratch filesystem crate in the retrieval pack
//! (`other_examples/.../simplefs/src/fs.rs`), rather than the teacher's
//! kernel-only `errno!` macro, whose defining crate ships no source in this
//! pack.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    NotFound,
    Regular,
    Directory,
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileType::NotFound => write!(f, "not found"),
            FileType::Regular => write!(f, "regular file"),
            FileType::Directory => write!(f, "directory"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("operation requires write access to the storage")]
    OperationRequiresWriteAccess,

    #[error("file name exceeds the {0}-byte limit")]
    FileNameExceedsLimit(usize),

    #[error("file is locked by another open handle")]
    FileLocked,

    #[error("a {0} with the same name already exists in the directory")]
    FileExists(FileType),

    #[error("path not found")]
    PathNotFound,

    #[error("can't remove the root directory")]
    CantRemoveRootDirectory,

    #[error("iterator accessed out of its valid range")]
    IncorrectIteratorAccess,

    #[error("operation requires an opened file handle")]
    OperationRequiresOpenedFile,

    #[error("storage limit reached")]
    StorageLimitReached,

    #[error("invalid storage format: {0}")]
    InvalidStorageFormat(String),

    #[error("internal expectation failed: {0}")]
    InternalExpectationFail(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn format_assert(cond: bool, what: &str) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(Error::InvalidStorageFormat(what.to_string()))
    }
}

pub(crate) fn internal_assert(cond: bool, what: &str) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(Error::InternalExpectationFail(what.to_string()))
    }
}
