//! Constants for the paginated metric tree.

use super::mtree_types::PageId;

/// Magic bytes identifying a metric tree page file.
pub const MAGIC: [u8; 4] = *b"MTRE";

/// Page file format version.
pub const VERSION: u32 = 1;

/// Default page size in bytes (4KB).
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default cache size in number of pages (4MB with 4KB pages).
pub const DEFAULT_CACHE_PAGES: usize = 1024;

/// Fixed per-page overhead: page index (4) + entry count (4) + node id (4) + leaf flag (1).
pub const PAGE_OVERHEAD: usize = 13;

/// Node id of the root page. The root keeps this id across splits.
pub const ROOT_ID: PageId = 0;

/// Sentinel for "no page": unassigned node ids and the free-list terminator.
pub const NO_PAGE: PageId = u32::MAX;

/// Capacities below this are legal but degenerate; a warning is logged.
pub const MIN_RECOMMENDED_CAPACITY: usize = 10;
