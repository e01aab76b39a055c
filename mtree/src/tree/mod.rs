//! Disk-or-memory-backed metric tree for similarity search.
//!
//! This module implements a paginated tree over an arbitrary metric space:
//! - Page-based node storage behind a pluggable page file
//! - Bounded LRU cache with dirty write-back and an I/O-access counter
//! - Triangle-inequality pruning driven by stored parent distances
//! - Range, kNN, and batched kNN queries
//!
//! The tree only ever calls the distance function; it makes no assumptions
//! about coordinates, so any metric space works.

pub mod mtree_cache;
pub mod mtree_constants;
pub mod mtree_storage;
pub mod mtree_types;
pub mod query_tools;
mod mtree_impl;

pub use mtree_cache::PageCache;
pub use mtree_constants::{DEFAULT_CACHE_PAGES, DEFAULT_PAGE_SIZE, NO_PAGE, ROOT_ID};
pub use mtree_impl::MTree;
pub use mtree_storage::{FilePageFile, MemoryPageFile, PageFile};
pub use mtree_types::{
    DirectoryEntry, FileHeader, LeafEntry, MTreeError, MTreeResult, Node, NodeEntries, ObjectId,
    PageId,
};
pub use query_tools::{KnnList, PendingSubtree};
