//! Public handles returned by [`crate::Filesystem`]: opened files and live
//! directory iterators (§4.4, §6.2).

use crate::directory::DirEntry;

/// The access mode a file was opened with. A `ReadWrite` handle is
/// exclusive; any number of `Read` handles may coexist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    ReadWrite,
}

/// A handle to an open regular file. Move-only: actual state lives in the
/// owning [`crate::Filesystem`]'s open-file registry, keyed by
/// `inode_address`, and [`crate::Filesystem::close_file`] consumes the
/// handle so it can't be used again afterward. Use
/// [`crate::Filesystem::clone_file_handle`] to get an independent
/// reference-counted view over the same open file.
#[derive(Debug, PartialEq, Eq)]
pub struct FileHandle {
    pub(crate) inode_address: u64,
    pub(crate) mode: OpenMode,
}

impl FileHandle {
    pub fn mode(&self) -> OpenMode {
        self.mode
    }
}

/// A snapshot-at-creation-time iterator over a directory's entries.
///
/// The snapshot is paired with the directory's generation counter at the
/// time of creation (§4.4): any insert or remove against that directory
/// bumps the counter, and a subsequent [`crate::Filesystem::iterator_next`]
/// call against a stale iterator returns
/// [`crate::Error::IncorrectIteratorAccess`] instead of silently serving
/// entries that may no longer reflect storage.
pub struct DirectoryIterator {
    pub(crate) directory_address: u64,
    pub(crate) generation: u64,
    pub(crate) entries: Vec<DirEntry>,
    pub(crate) position: usize,
}
