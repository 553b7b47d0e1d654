//! `nestfs` — a self-contained hierarchical filesystem embedded inside a
//! single byte-addressable [`Storage`].
//!
//! A [`Filesystem`] is built from four layered subsystems: a hierarchical
//! bitmap [`alloc::BlockAllocator`] that owns free/used block bookkeeping, a
//! [`file_blocks`] B+ tree mapping each file's logical blocks onto physical
//! ones, a [`directory`] B+ tree keyed by name hash for directory entries,
//! and the [`fs::Filesystem`] coordinator that resolves paths and wires the
//! three together.
//!
//! ```
//! use nestfs::{Filesystem, MemStorage, OpenMode};
//!
//! let mut fs = Filesystem::format(MemStorage::new()).unwrap();
//! fs.create_file("/hello.txt").unwrap();
//! let handle = fs.open_file("/hello.txt", OpenMode::ReadWrite).unwrap();
//! fs.write_file(&handle, 0, b"hi").unwrap();
//! fs.close_file(handle).unwrap();
//! ```

mod alloc;
mod bitrange;
mod config;
mod directory;
mod error;
mod file_blocks;
mod fnv;
mod fs;
mod handle;
mod layout;
mod storage;

pub use config::Config;
pub use directory::DirEntry;
pub use error::{Error, FileType, Result};
pub use fs::Filesystem;
pub use handle::{DirectoryIterator, FileHandle, OpenMode};
pub use storage::{FileStorage, MemStorage, Storage};
