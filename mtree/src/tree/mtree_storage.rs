//! Page stores backing the metric tree.
//!
//! A page file maps page ids to fixed-size node pages. Two implementations
//! are provided: a file-backed store whose block 0 is a header and whose
//! remaining blocks are node pages, and a memory-backed store for transient
//! trees. Both count physical page accesses; the cache in front of them
//! never touches the counter on a hit, which makes the counter the
//! observability primitive for benchmarks.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::RwLock;

use super::mtree_constants::NO_PAGE;
use super::mtree_types::{FileHeader, MTreeError, MTreeResult, Node, PageId};

/// A keyed store of node pages. `write_page` assigns an id on first write if
/// the node has none.
pub trait PageFile: Send + Sync {
    fn read_page(&self, page_id: PageId) -> MTreeResult<Node>;
    fn write_page(&self, node: &mut Node) -> MTreeResult<()>;
    fn allocate_page(&self) -> MTreeResult<PageId>;
    fn close(&self) -> MTreeResult<()>;
    fn io_access_count(&self) -> u64;
    fn reset_io_access_count(&self);
}

// ============================================================================
// Memory-Backed Page File
// ============================================================================

/// A page file held entirely in RAM. Accesses are counted only when this
/// store is actually called, so with a cache in front the counter reflects
/// cache misses.
pub struct MemoryPageFile {
    pages: RwLock<HashMap<PageId, Node>>,
    next_page_id: AtomicU32,
    io_accesses: AtomicU64,
}

impl MemoryPageFile {
    pub fn new() -> Self {
        Self {
            pages: RwLock::new(HashMap::new()),
            next_page_id: AtomicU32::new(0),
            io_accesses: AtomicU64::new(0),
        }
    }
}

impl Default for MemoryPageFile {
    fn default() -> Self {
        Self::new()
    }
}

impl PageFile for MemoryPageFile {
    fn read_page(&self, page_id: PageId) -> MTreeResult<Node> {
        self.io_accesses.fetch_add(1, Ordering::Relaxed);
        self.pages.read().get(&page_id).cloned().ok_or_else(|| {
            MTreeError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("page {} is not allocated", page_id),
            ))
        })
    }

    fn write_page(&self, node: &mut Node) -> MTreeResult<()> {
        if node.node_id == NO_PAGE {
            node.node_id = self.allocate_page()?;
        }
        self.io_accesses.fetch_add(1, Ordering::Relaxed);
        self.pages.write().insert(node.node_id, node.clone());
        Ok(())
    }

    fn allocate_page(&self) -> MTreeResult<PageId> {
        Ok(self.next_page_id.fetch_add(1, Ordering::Relaxed))
    }

    fn close(&self) -> MTreeResult<()> {
        Ok(())
    }

    fn io_access_count(&self) -> u64 {
        self.io_accesses.load(Ordering::Relaxed)
    }

    fn reset_io_access_count(&self) {
        self.io_accesses.store(0, Ordering::Relaxed);
    }
}

// ============================================================================
// File-Backed Page File
// ============================================================================

/// A page file persisted to disk. Block 0 holds the [`FileHeader`]; node id
/// `n` lives at byte offset `(n + 1) * page_size`. Freed pages form a singly
/// linked list threaded through their first four bytes, headed by the
/// header's `free_list_head`.
pub struct FilePageFile {
    file: RwLock<File>,
    path: PathBuf,
    header: RwLock<FileHeader>,
    page_size: usize,
    next_page_id: AtomicU32,
    io_accesses: AtomicU64,
}

impl FilePageFile {
    /// Creates a new page file, truncating anything already at `path`.
    pub fn create(
        path: &Path,
        page_size: usize,
        dir_capacity: u32,
        leaf_capacity: u32,
    ) -> MTreeResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let header = FileHeader::new(page_size as u32, dir_capacity, leaf_capacity);

        let page_file = Self {
            file: RwLock::new(file),
            path: path.to_path_buf(),
            header: RwLock::new(header),
            page_size,
            next_page_id: AtomicU32::new(0),
            io_accesses: AtomicU64::new(0),
        };
        page_file.write_header()?;
        log::debug!("created page file {:?} (page size {})", page_file.path, page_size);
        Ok(page_file)
    }

    /// Opens an existing page file. Only the header is read; node pages stay
    /// on disk until accessed.
    pub fn open(path: &Path) -> MTreeResult<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut buffer = [0u8; 24];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buffer)?;
        let (header, _): (FileHeader, usize) =
            bincode::serde::decode_from_slice(&buffer, bincode::config::legacy())
                .map_err(|e| MTreeError::Serialization(e.to_string()))?;
        header.validate()?;

        let page_size = header.page_size as usize;
        let file_len = file.metadata()?.len();
        let allocated = (file_len / page_size as u64).saturating_sub(1) as u32;

        log::debug!(
            "opened page file {:?} ({} pages, page size {})",
            path,
            allocated,
            page_size
        );
        Ok(Self {
            file: RwLock::new(file),
            path: path.to_path_buf(),
            header: RwLock::new(header),
            page_size,
            next_page_id: AtomicU32::new(allocated),
            io_accesses: AtomicU64::new(0),
        })
    }

    /// The header as read from disk or maintained since creation.
    pub fn header(&self) -> FileHeader {
        self.header.read().clone()
    }

    /// Returns a freed page to the free list for reuse by `allocate_page`.
    pub fn free_page(&self, page_id: PageId) -> MTreeResult<()> {
        let mut header = self.header.write();
        let next = bincode::serde::encode_to_vec(&header.free_list_head, bincode::config::legacy())
            .map_err(|e| MTreeError::Serialization(e.to_string()))?;

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(self.page_offset(page_id)))?;
        file.write_all(&next)?;
        self.io_accesses.fetch_add(1, Ordering::Relaxed);

        header.free_list_head = page_id;
        Ok(())
    }

    fn page_offset(&self, page_id: PageId) -> u64 {
        (page_id as u64 + 1) * self.page_size as u64
    }

    fn write_header(&self) -> MTreeResult<()> {
        let header = self.header.read();
        let mut bytes = bincode::serde::encode_to_vec(&*header, bincode::config::legacy())
            .map_err(|e| MTreeError::Serialization(e.to_string()))?;
        bytes.resize(self.page_size, 0);

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&bytes)?;
        Ok(())
    }
}

impl PageFile for FilePageFile {
    fn read_page(&self, page_id: PageId) -> MTreeResult<Node> {
        if page_id == NO_PAGE || page_id >= self.next_page_id.load(Ordering::Relaxed) {
            return Err(MTreeError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("page {} is not allocated", page_id),
            )));
        }

        let mut buffer = vec![0u8; self.page_size];
        {
            let mut file = self.file.write();
            file.seek(SeekFrom::Start(self.page_offset(page_id)))?;
            file.read_exact(&mut buffer)?;
        }
        self.io_accesses.fetch_add(1, Ordering::Relaxed);
        Node::from_page_bytes(&buffer)
    }

    fn write_page(&self, node: &mut Node) -> MTreeResult<()> {
        if node.node_id == NO_PAGE {
            node.node_id = self.allocate_page()?;
        }
        let bytes = node.to_page_bytes(self.page_size)?;

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(self.page_offset(node.node_id)))?;
        file.write_all(&bytes)?;
        self.io_accesses.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn allocate_page(&self) -> MTreeResult<PageId> {
        let mut header = self.header.write();
        if header.free_list_head != NO_PAGE {
            let page_id = header.free_list_head;

            // The first four bytes of a free page chain to the next one.
            let mut buffer = [0u8; 4];
            let mut file = self.file.write();
            file.seek(SeekFrom::Start(self.page_offset(page_id)))?;
            file.read_exact(&mut buffer)?;
            self.io_accesses.fetch_add(1, Ordering::Relaxed);

            let (next, _): (PageId, usize) =
                bincode::serde::decode_from_slice(&buffer, bincode::config::legacy())
                    .map_err(|e| MTreeError::Serialization(e.to_string()))?;
            header.free_list_head = next;
            return Ok(page_id);
        }
        Ok(self.next_page_id.fetch_add(1, Ordering::Relaxed))
    }

    fn close(&self) -> MTreeResult<()> {
        self.write_header()?;
        self.file.write().sync_all()?;
        log::debug!("closed page file {:?}", self.path);
        Ok(())
    }

    fn io_access_count(&self) -> u64 {
        self.io_accesses.load(Ordering::Relaxed)
    }

    fn reset_io_access_count(&self) {
        self.io_accesses.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::mtree_types::LeafEntry;
    use tempfile::tempdir;

    fn sample_leaf(object_id: u32) -> Node {
        let mut node = Node::new_leaf(NO_PAGE);
        node.add_leaf_entry(LeafEntry {
            object_id,
            parent_distance: Some(1.0),
        })
        .unwrap();
        node
    }

    #[test]
    fn memory_write_assigns_sequential_ids() {
        let store = MemoryPageFile::new();
        let mut a = sample_leaf(1);
        let mut b = sample_leaf(2);
        store.write_page(&mut a).unwrap();
        store.write_page(&mut b).unwrap();
        assert_eq!(a.node_id, 0);
        assert_eq!(b.node_id, 1);
        assert_eq!(store.read_page(0).unwrap(), a);
    }

    #[test]
    fn memory_read_of_missing_page_fails() {
        let store = MemoryPageFile::new();
        assert!(matches!(store.read_page(9), Err(MTreeError::Io(_))));
    }

    #[test]
    fn memory_counts_accesses() {
        let store = MemoryPageFile::new();
        let mut node = sample_leaf(1);
        store.write_page(&mut node).unwrap();
        let _ = store.read_page(node.node_id).unwrap();
        assert_eq!(store.io_access_count(), 2);
        store.reset_io_access_count();
        assert_eq!(store.io_access_count(), 0);
    }

    #[test]
    fn file_page_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tree.mtree");
        let store = FilePageFile::create(&path, 256, 11, 21).unwrap();

        // Page 0 belongs to the root, whose parent distances are unset; use a
        // plain entry there and a fully populated one on the second page.
        let mut root = Node::new_leaf(NO_PAGE);
        root.add_leaf_entry(LeafEntry {
            object_id: 1,
            parent_distance: None,
        })
        .unwrap();
        store.write_page(&mut root).unwrap();
        assert_eq!(root.node_id, 0);

        let mut node = sample_leaf(7);
        store.write_page(&mut node).unwrap();
        assert_eq!(node.node_id, 1);

        assert_eq!(store.read_page(0).unwrap(), root);
        assert_eq!(store.read_page(1).unwrap(), node);
    }

    #[test]
    fn header_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tree.mtree");
        {
            let store = FilePageFile::create(&path, 256, 11, 21).unwrap();
            let mut node = sample_leaf(7);
            store.write_page(&mut node).unwrap();
            store.close().unwrap();
        }

        let store = FilePageFile::open(&path).unwrap();
        let header = store.header();
        assert_eq!(header.page_size, 256);
        assert_eq!(header.dir_capacity, 11);
        assert_eq!(header.leaf_capacity, 21);
        assert_eq!(store.read_page(0).unwrap().entry_objects(), vec![7]);
    }

    #[test]
    fn open_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.mtree");
        std::fs::write(&path, vec![0xABu8; 512]).unwrap();
        assert!(FilePageFile::open(&path).is_err());
    }

    #[test]
    fn freed_pages_are_reused_in_lifo_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tree.mtree");
        let store = FilePageFile::create(&path, 256, 11, 21).unwrap();

        for i in 0..3 {
            let mut node = sample_leaf(i);
            store.write_page(&mut node).unwrap();
        }

        store.free_page(1).unwrap();
        store.free_page(2).unwrap();
        assert_eq!(store.allocate_page().unwrap(), 2);
        assert_eq!(store.allocate_page().unwrap(), 1);
        // The chain is exhausted; allocation falls back to file growth.
        assert_eq!(store.allocate_page().unwrap(), 3);
    }

    #[test]
    fn read_of_unallocated_page_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tree.mtree");
        let store = FilePageFile::create(&path, 256, 11, 21).unwrap();
        assert!(matches!(store.read_page(0), Err(MTreeError::Io(_))));
        assert!(matches!(store.read_page(NO_PAGE), Err(MTreeError::Io(_))));
    }

    #[test]
    fn file_counts_physical_accesses() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tree.mtree");
        let store = FilePageFile::create(&path, 256, 11, 21).unwrap();

        let mut node = sample_leaf(1);
        store.write_page(&mut node).unwrap();
        let _ = store.read_page(node.node_id).unwrap();
        assert_eq!(store.io_access_count(), 2);
        store.reset_io_access_count();
        assert_eq!(store.io_access_count(), 0);
    }
}
