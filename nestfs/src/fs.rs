//! Filesystem Coordinator (§4.4): path resolution, directory/file
//! lifecycle, the open-file registry, and directory iterators. Ties
//! together [`crate::alloc`], [`crate::file_blocks`] and
//! [`crate::directory`] into the public surface in [`crate::lib`].
//!
//! Grounded in `original_source/src/FileSystem.cpp` and
//! `original_source/src/FileSystemImpl.hpp` (open-file refcounting,
//! deferred delete, iterator generation counters).

use std::collections::HashMap;

use crate::alloc::{BlockAddress, BlockAllocator};
use crate::config::Config;
use crate::directory::{self, DirEntry};
use crate::error::{Error, FileType, Result};
use crate::file_blocks;
use crate::handle::{DirectoryIterator, FileHandle, OpenMode};
use crate::layout::{
    DirectoryInode, FileInode, InodeHeader, BLOCK_SIZE, MAX_FILENAME_BYTES,
};
use crate::storage::{read_pod, write_pod, Storage};

/// Block address of the root directory. Format always allocates it first
/// (the allocator hands out block 0 on an otherwise-empty storage), so this
/// is a fixed constant rather than something read from the header.
pub const ROOT_ADDRESS: u64 = 0;

struct DescriptorRecord {
    mode: OpenMode,
    ref_count: u32,
    marked_for_delete: bool,
    /// Set when the file's containing directory was itself removed out
    /// from under this open handle (recursive `remove_directory`): the
    /// directory entry for this file no longer exists, so `close_file`
    /// must free the file's content without also touching `parent_address`,
    /// which may since have been reallocated to something else entirely.
    orphaned: bool,
    parent_address: u64,
    name: Vec<u8>,
}

/// A self-contained hierarchical filesystem embedded inside a single
/// byte-addressable [`Storage`].
pub struct Filesystem<S: Storage> {
    storage: S,
    allocator: BlockAllocator,
    open_files: HashMap<u64, DescriptorRecord>,
    directory_generations: HashMap<u64, u64>,
}

impl<S: Storage> Filesystem<S> {
    /// Formats `storage` from scratch: truncates it to a bare header, then
    /// creates the root directory. Equivalent to
    /// `format_with_config(storage, Config::default())`.
    pub fn format(storage: S) -> Result<Self> {
        Self::format_with_config(storage, Config::default())
    }

    /// Formats `storage` from scratch, honoring `config`'s validation hooks.
    pub fn format_with_config(mut storage: S, config: Config) -> Result<Self> {
        config.validate_block_size()?;
        let mut allocator = BlockAllocator::format(&mut storage)?;
        let root_block = allocator.allocate_one(&mut storage)?;
        if root_block.index() != ROOT_ADDRESS {
            return Err(Error::InternalExpectationFail(
                "root directory did not land at the fixed root address".into(),
            ));
        }
        let root = new_directory_inode(root_block.index());
        write_pod(&mut storage, root_block.absolute_address(), &root)?;

        Ok(Self {
            storage,
            allocator,
            open_files: HashMap::new(),
            directory_generations: HashMap::new(),
        })
    }

    /// Reopens an existing filesystem image. Equivalent to
    /// `open_with_config(storage, Config::default())`.
    pub fn open(storage: S) -> Result<Self> {
        Self::open_with_config(storage, Config::default())
    }

    /// Reopens an existing filesystem image, honoring `config`'s validation
    /// hooks: when `config.strict_format_validation` is set, the whole
    /// occupancy hierarchy is walked via
    /// [`crate::alloc::BlockAllocator::check`] before the image is trusted.
    pub fn open_with_config(mut storage: S, config: Config) -> Result<Self> {
        config.validate_block_size()?;
        let allocator = BlockAllocator::open(&mut storage)?;
        if config.strict_format_validation {
            allocator.check(&mut storage)?;
        }
        Ok(Self {
            storage,
            allocator,
            open_files: HashMap::new(),
            directory_generations: HashMap::new(),
        })
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    // ---- path resolution -------------------------------------------------

    fn split_path(path: &str) -> Vec<&str> {
        path.split('/').filter(|c| !c.is_empty()).collect()
    }

    fn read_dir(&mut self, addr: u64) -> Result<DirectoryInode> {
        read_pod(&mut self.storage, BlockAddress::from_index(addr).absolute_address())
            .map_err(Error::from)
    }

    fn write_dir(&mut self, addr: u64, dir: &DirectoryInode) -> Result<()> {
        write_pod(&mut self.storage, BlockAddress::from_index(addr).absolute_address(), dir)
            .map_err(Error::from)
    }

    fn read_file_inode(&mut self, addr: u64) -> Result<FileInode> {
        read_pod(&mut self.storage, BlockAddress::from_index(addr).absolute_address())
            .map_err(Error::from)
    }

    fn write_file_inode(&mut self, addr: u64, inode: &FileInode) -> Result<()> {
        write_pod(&mut self.storage, BlockAddress::from_index(addr).absolute_address(), inode)
            .map_err(Error::from)
    }

    /// Resolves an absolute path down to the address of its target (file or
    /// directory). `.` and `..` are handled; `..` at the root stays at the
    /// root.
    fn resolve(&mut self, path: &str) -> Result<(u64, bool)> {
        let mut current = ROOT_ADDRESS;
        let mut is_dir = true;
        for component in Self::split_path(path) {
            if component == "." {
                continue;
            }
            if !is_dir {
                return Err(Error::PathNotFound);
            }
            if component == ".." {
                let dir = self.read_dir(current)?;
                current = dir.parent_directory_inode;
                continue;
            }
            let dir = self.read_dir(current)?;
            let entry = directory::lookup(&mut self.storage, &dir, component.as_bytes())?
                .ok_or(Error::PathNotFound)?;
            current = entry.inode;
            is_dir = entry.is_directory;
        }
        Ok((current, is_dir))
    }

    /// Resolves the parent directory and final component name of `path`,
    /// for create/remove operations. Fails with `FileNameExceedsLimit` if
    /// the final component is too long.
    fn resolve_parent(&mut self, path: &str) -> Result<(u64, Vec<u8>)> {
        let components = Self::split_path(path);
        let (name, parent_components) = components
            .split_last()
            .ok_or(Error::PathNotFound)?;
        if name.len() > MAX_FILENAME_BYTES {
            return Err(Error::FileNameExceedsLimit(MAX_FILENAME_BYTES));
        }
        let parent_path = parent_components.join("/");
        let (parent_addr, parent_is_dir) = self.resolve(&format!("/{parent_path}"))?;
        if !parent_is_dir {
            return Err(Error::PathNotFound);
        }
        Ok((parent_addr, name.as_bytes().to_vec()))
    }

    fn bump_generation(&mut self, dir_addr: u64) {
        *self.directory_generations.entry(dir_addr).or_insert(0) += 1;
    }

    fn generation_of(&mut self, dir_addr: u64) -> u64 {
        *self.directory_generations.entry(dir_addr).or_insert(0)
    }

    // ---- queries -----------------------------------------------------

    pub fn file_type(&mut self, path: &str) -> Result<FileType> {
        match self.resolve(path) {
            Ok((_, true)) => Ok(FileType::Directory),
            Ok((_, false)) => Ok(FileType::Regular),
            Err(Error::PathNotFound) => Ok(FileType::NotFound),
            Err(e) => Err(e),
        }
    }

    pub fn exists(&mut self, path: &str) -> Result<bool> {
        Ok(!matches!(self.file_type(path)?, FileType::NotFound))
    }

    pub fn list_directory(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        let (addr, is_dir) = self.resolve(path)?;
        if !is_dir {
            return Err(Error::PathNotFound);
        }
        let dir = self.read_dir(addr)?;
        let mut out = Vec::new();
        directory::iterate(&mut self.storage, &dir, |e| {
            out.push(e.clone());
            Ok(())
        })?;
        Ok(out)
    }

    /// A live iterator over `path`'s entries, snapshotted at call time.
    pub fn iter_directory(&mut self, path: &str) -> Result<DirectoryIterator> {
        let (addr, is_dir) = self.resolve(path)?;
        if !is_dir {
            return Err(Error::PathNotFound);
        }
        let entries = self.list_directory(path)?;
        Ok(DirectoryIterator {
            directory_address: addr,
            generation: self.generation_of(addr),
            entries,
            position: 0,
        })
    }

    pub fn iterator_next(&mut self, it: &mut DirectoryIterator) -> Result<Option<DirEntry>> {
        if self.generation_of(it.directory_address) != it.generation {
            return Err(Error::IncorrectIteratorAccess);
        }
        if it.position >= it.entries.len() {
            return Ok(None);
        }
        let entry = it.entries[it.position].clone();
        it.position += 1;
        Ok(Some(entry))
    }

    // ---- creation / removal -------------------------------------------

    pub fn create_file(&mut self, path: &str) -> Result<()> {
        let (parent_addr, name) = self.resolve_parent(path)?;
        let mut parent = self.read_dir(parent_addr)?;
        if directory::lookup(&mut self.storage, &parent, &name)?.is_some() {
            return Err(Error::FileExists(FileType::Regular));
        }
        let inode_block = self.allocator.allocate_one(&mut self.storage)?;
        let inode = new_file_inode();
        self.write_file_inode(inode_block.index(), &inode)?;
        directory::insert(
            &mut self.storage,
            &mut self.allocator,
            &mut parent,
            DirEntry { inode: inode_block.index(), is_directory: false, name },
        )?;
        self.write_dir(parent_addr, &parent)?;
        self.bump_generation(parent_addr);
        Ok(())
    }

    pub fn create_directory(&mut self, path: &str) -> Result<()> {
        let (parent_addr, name) = self.resolve_parent(path)?;
        let mut parent = self.read_dir(parent_addr)?;
        if directory::lookup(&mut self.storage, &parent, &name)?.is_some() {
            return Err(Error::FileExists(FileType::Directory));
        }
        let inode_block = self.allocator.allocate_one(&mut self.storage)?;
        let inode = new_directory_inode(parent_addr);
        self.write_dir(inode_block.index(), &inode)?;
        directory::insert(
            &mut self.storage,
            &mut self.allocator,
            &mut parent,
            DirEntry { inode: inode_block.index(), is_directory: true, name },
        )?;
        self.write_dir(parent_addr, &parent)?;
        self.bump_generation(parent_addr);
        Ok(())
    }

    /// `mkdir -p`: creates every missing directory along `path`, leaving
    /// already-existing directories untouched. Supplemented from
    /// `original_source` (the distilled spec only described single-level
    /// `create_directory`).
    pub fn create_directories(&mut self, path: &str) -> Result<()> {
        let mut built = String::new();
        for component in Self::split_path(path) {
            built.push('/');
            built.push_str(component);
            match self.file_type(&built)? {
                FileType::Directory => continue,
                FileType::NotFound => self.create_directory(&built)?,
                FileType::Regular => return Err(Error::FileExists(FileType::Regular)),
            }
        }
        Ok(())
    }

    pub fn remove_file(&mut self, path: &str) -> Result<()> {
        let (addr, is_dir) = self.resolve(path)?;
        if is_dir {
            return Err(Error::PathNotFound);
        }
        let (parent_addr, name) = self.resolve_parent(path)?;

        if let Some(record) = self.open_files.get_mut(&addr) {
            log::debug!("deferring removal of open file at block {addr}");
            record.marked_for_delete = true;
            return Ok(());
        }

        self.free_file_contents(addr)?;
        let mut parent = self.read_dir(parent_addr)?;
        directory::remove(&mut self.storage, &mut self.allocator, &mut parent, &name)?;
        self.write_dir(parent_addr, &parent)?;
        self.bump_generation(parent_addr);
        Ok(())
    }

    /// Removes `path` and, if it names a directory, everything beneath it
    /// (files and subdirectories alike) — a recursive delete, not a
    /// POSIX-`rmdir`-style empty-only removal.
    pub fn remove_directory(&mut self, path: &str) -> Result<()> {
        let (addr, is_dir) = self.resolve(path)?;
        if !is_dir {
            return Err(Error::PathNotFound);
        }
        if addr == ROOT_ADDRESS {
            return Err(Error::CantRemoveRootDirectory);
        }
        let (parent_addr, name) = self.resolve_parent(path)?;
        self.remove_directory_tree(addr)?;
        let mut parent = self.read_dir(parent_addr)?;
        directory::remove(&mut self.storage, &mut self.allocator, &mut parent, &name)?;
        self.write_dir(parent_addr, &parent)?;
        self.bump_generation(parent_addr);
        Ok(())
    }

    /// Recursively empties `addr`'s subtree and releases its own block.
    /// Files still open elsewhere are orphaned (marked for delete, freed
    /// on their last `close_file`) rather than freed out from under the
    /// caller holding them.
    fn remove_directory_tree(&mut self, addr: u64) -> Result<()> {
        let dir = self.read_dir(addr)?;
        let mut children = Vec::new();
        directory::iterate(&mut self.storage, &dir, |e| {
            children.push(e.clone());
            Ok(())
        })?;
        for child in children {
            if child.is_directory {
                self.remove_directory_tree(child.inode)?;
            } else if let Some(record) = self.open_files.get_mut(&child.inode) {
                log::debug!("orphaning open file at block {} under a removed directory", child.inode);
                record.marked_for_delete = true;
                record.orphaned = true;
            } else {
                self.free_file_contents(child.inode)?;
            }
        }
        self.bump_generation(addr);
        self.allocator.release_blocks(&mut self.storage, BlockAddress::from_index(addr), 1)?;
        Ok(())
    }

    fn free_file_contents(&mut self, addr: u64) -> Result<()> {
        let mut inode = self.read_file_inode(addr)?;
        while inode.header.blocks_count > 0 {
            file_blocks::truncate_one(&mut self.storage, &mut self.allocator, &mut inode)?;
        }
        self.allocator.release_blocks(&mut self.storage, BlockAddress::from_index(addr), 1)?;
        Ok(())
    }

    // ---- open files -----------------------------------------------------

    pub fn open_file(&mut self, path: &str, mode: OpenMode) -> Result<FileHandle> {
        let (addr, is_dir) = self.resolve(path)?;
        if is_dir {
            return Err(Error::PathNotFound);
        }
        if let Some(record) = self.open_files.get_mut(&addr) {
            if mode == OpenMode::ReadWrite || record.mode == OpenMode::ReadWrite {
                return Err(Error::FileLocked);
            }
            record.ref_count += 1;
            return Ok(FileHandle { inode_address: addr, mode });
        }
        let (parent_address, name) = self.resolve_parent(path)?;
        self.open_files.insert(
            addr,
            DescriptorRecord {
                mode,
                ref_count: 1,
                marked_for_delete: false,
                orphaned: false,
                parent_address,
                name,
            },
        );
        log::trace!("opened file at block {addr}, registry now holds 1 reference");
        Ok(FileHandle { inode_address: addr, mode })
    }

    /// Returns an independent handle to the same open file, bumping the
    /// registry's reference count. Mirrors the `FileHandle` copy this
    /// crate used to hand out for free, but with the registry kept honest:
    /// the file stays open until every clone (and the original) is closed.
    pub fn clone_file_handle(&mut self, handle: &FileHandle) -> Result<FileHandle> {
        let record = self
            .open_files
            .get_mut(&handle.inode_address)
            .ok_or(Error::OperationRequiresOpenedFile)?;
        record.ref_count += 1;
        Ok(FileHandle { inode_address: handle.inode_address, mode: handle.mode })
    }

    pub fn close_file(&mut self, handle: FileHandle) -> Result<()> {
        let addr = handle.inode_address;
        let record = self
            .open_files
            .get_mut(&addr)
            .ok_or(Error::OperationRequiresOpenedFile)?;
        record.ref_count -= 1;
        if record.ref_count > 0 {
            return Ok(());
        }
        let record = self.open_files.remove(&addr).unwrap();
        log::trace!("closed last reference to file at block {addr}");
        if record.marked_for_delete {
            log::debug!("freeing deferred-delete file at block {addr}");
            self.free_file_contents(addr)?;
            if !record.orphaned {
                let mut parent = self.read_dir(record.parent_address)?;
                directory::remove(&mut self.storage, &mut self.allocator, &mut parent, &record.name)?;
                self.write_dir(record.parent_address, &parent)?;
                self.bump_generation(record.parent_address);
            }
        }
        Ok(())
    }

    fn require_open(&self, handle: &FileHandle) -> Result<()> {
        if self.open_files.contains_key(&handle.inode_address) {
            Ok(())
        } else {
            Err(Error::OperationRequiresOpenedFile)
        }
    }

    pub fn file_size(&mut self, handle: &FileHandle) -> Result<u64> {
        self.require_open(handle)?;
        Ok(self.read_file_inode(handle.inode_address)?.header.file_size)
    }

    pub fn read_file(&mut self, handle: &FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.require_open(handle)?;
        let inode = self.read_file_inode(handle.inode_address)?;
        if offset >= inode.header.file_size {
            return Ok(0);
        }
        let available = (inode.header.file_size - offset) as usize;
        let to_read = buf.len().min(available);
        let mut done = 0usize;
        while done < to_read {
            let pos = offset + done as u64;
            let block_index = pos / BLOCK_SIZE as u64;
            let block_start_offset = (pos % BLOCK_SIZE as u64) as usize;
            let chunk = (BLOCK_SIZE - block_start_offset).min(to_read - done);
            let block = file_blocks::lookup(&mut self.storage, &inode, block_index)?
                .ok_or_else(|| Error::InternalExpectationFail("missing data block within file_size".into()))?;
            self.storage.read(
                block.absolute_address() + block_start_offset as u64,
                &mut buf[done..done + chunk],
            )?;
            done += chunk;
        }
        Ok(done)
    }

    pub fn write_file(&mut self, handle: &FileHandle, offset: u64, buf: &[u8]) -> Result<usize> {
        self.require_open(handle)?;
        if handle.mode != OpenMode::ReadWrite {
            return Err(Error::OperationRequiresWriteAccess);
        }
        let mut inode = self.read_file_inode(handle.inode_address)?;
        let end = offset + buf.len() as u64;
        let needed_blocks = end.div_ceil(BLOCK_SIZE as u64);
        while inode.header.blocks_count < needed_blocks {
            let block = self.allocator.allocate_one(&mut self.storage)?;
            file_blocks::append(&mut self.storage, &mut self.allocator, &mut inode, block)?;
        }

        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let block_index = pos / BLOCK_SIZE as u64;
            let block_start_offset = (pos % BLOCK_SIZE as u64) as usize;
            let chunk = (BLOCK_SIZE - block_start_offset).min(buf.len() - done);
            let block = file_blocks::lookup(&mut self.storage, &inode, block_index)?
                .ok_or_else(|| Error::InternalExpectationFail("missing data block after append".into()))?;
            self.storage.write(
                block.absolute_address() + block_start_offset as u64,
                &buf[done..done + chunk],
            )?;
            done += chunk;
        }

        if end > inode.header.file_size {
            inode.header.file_size = end;
        }
        self.write_file_inode(handle.inode_address, &inode)?;
        Ok(done)
    }

    pub fn truncate_file(&mut self, handle: &FileHandle, new_len: u64) -> Result<()> {
        self.require_open(handle)?;
        if handle.mode != OpenMode::ReadWrite {
            return Err(Error::OperationRequiresWriteAccess);
        }
        let mut inode = self.read_file_inode(handle.inode_address)?;
        let needed_blocks = new_len.div_ceil(BLOCK_SIZE as u64);
        while inode.header.blocks_count > needed_blocks {
            file_blocks::truncate_one(&mut self.storage, &mut self.allocator, &mut inode)?;
        }
        inode.header.file_size = new_len;
        self.write_file_inode(handle.inode_address, &inode)?;
        Ok(())
    }

    // ---- consistency -----------------------------------------------------

    /// Walks the whole tree, validating the allocator's bookkeeping and
    /// every reachable directory/file. Supplemented from `original_source`
    /// (`FileSystemImpl::check`), which the distilled spec only described
    /// per-subsystem.
    pub fn check(&mut self) -> Result<()> {
        self.allocator.check(&mut self.storage)?;
        self.check_directory(ROOT_ADDRESS)
    }

    fn check_directory(&mut self, addr: u64) -> Result<()> {
        self.allocator.check_allocated_block(&mut self.storage, BlockAddress::from_index(addr))?;
        let dir = self.read_dir(addr)?;
        let mut children = Vec::new();
        directory::iterate(&mut self.storage, &dir, |e| {
            children.push(e.clone());
            Ok(())
        })?;
        for child in children {
            self.allocator
                .check_allocated_block(&mut self.storage, BlockAddress::from_index(child.inode))?;
            if child.is_directory {
                self.check_directory(child.inode)?;
            }
        }
        Ok(())
    }
}

fn new_directory_inode(parent: u64) -> DirectoryInode {
    let mut dir: DirectoryInode = bytemuck::Zeroable::zeroed();
    dir.header = InodeHeader {
        flags: 0,
        file_size: 0,
        blocks_count: 0,
        reserved_for_metadata: [0; 32],
    };
    dir.parent_directory_inode = parent;
    dir
}

fn new_file_inode() -> FileInode {
    let mut inode: FileInode = bytemuck::Zeroable::zeroed();
    inode.header = InodeHeader {
        flags: 0,
        file_size: 0,
        blocks_count: 0,
        reserved_for_metadata: [0; 32],
    };
    inode
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;

    fn new_fs() -> Filesystem<MemStorage> {
        Filesystem::format(MemStorage::new()).unwrap()
    }

    #[test]
    fn format_creates_root_directory() {
        let mut fs = new_fs();
        assert_eq!(fs.file_type("/").unwrap(), FileType::Directory);
        assert_eq!(fs.list_directory("/").unwrap().len(), 0);
    }

    #[test]
    fn create_and_write_and_read_a_file() {
        let mut fs = new_fs();
        fs.create_file("/hello.txt").unwrap();
        let handle = fs.open_file("/hello.txt", OpenMode::ReadWrite).unwrap();
        let written = fs.write_file(&handle, 0, b"hello, world").unwrap();
        assert_eq!(written, 12);
        let mut buf = [0u8; 12];
        fs.read_file(&handle, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello, world");
        fs.close_file(handle).unwrap();
    }

    #[test]
    fn create_directories_builds_intermediate_dirs() {
        let mut fs = new_fs();
        fs.create_directories("/a/b/c").unwrap();
        assert_eq!(fs.file_type("/a").unwrap(), FileType::Directory);
        assert_eq!(fs.file_type("/a/b").unwrap(), FileType::Directory);
        assert_eq!(fs.file_type("/a/b/c").unwrap(), FileType::Directory);
    }

    #[test]
    fn cannot_remove_root() {
        let mut fs = new_fs();
        let err = fs.remove_directory("/").unwrap_err();
        assert!(matches!(err, Error::CantRemoveRootDirectory));
    }

    #[test]
    fn remove_file_is_deferred_while_open() {
        let mut fs = new_fs();
        fs.create_file("/a.txt").unwrap();
        let handle = fs.open_file("/a.txt", OpenMode::Read).unwrap();
        fs.remove_file("/a.txt").unwrap();
        assert!(fs.exists("/a.txt").unwrap());
        fs.close_file(handle).unwrap();
        assert!(!fs.exists("/a.txt").unwrap());
    }

    #[test]
    fn dotdot_reaches_parent() {
        let mut fs = new_fs();
        fs.create_directories("/a/b").unwrap();
        fs.create_file("/a/b/file").unwrap();
        assert!(fs.exists("/a/b/../b/file").unwrap());
    }

    #[test]
    fn stale_iterator_is_rejected_after_mutation() {
        let mut fs = new_fs();
        fs.create_file("/x").unwrap();
        let mut it = fs.iter_directory("/").unwrap();
        fs.create_file("/y").unwrap();
        let err = fs.iterator_next(&mut it).unwrap_err();
        assert!(matches!(err, Error::IncorrectIteratorAccess));
    }

    #[test]
    fn check_passes_on_nontrivial_tree() {
        let mut fs = new_fs();
        fs.create_directories("/a/b").unwrap();
        fs.create_file("/a/f1").unwrap();
        fs.create_file("/a/b/f2").unwrap();
        let h = fs.open_file("/a/b/f2", OpenMode::ReadWrite).unwrap();
        fs.write_file(&h, 0, &vec![7u8; BLOCK_SIZE * 3]).unwrap();
        fs.close_file(h).unwrap();
        fs.check().unwrap();
    }
}
