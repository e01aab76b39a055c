//! Core types for the paginated metric tree.
//!
//! This module defines the fundamental types used throughout the tree:
//! - Error and result types
//! - Entry types (leaf and directory) and the node container
//! - The page file header
//! - The fixed-width page serialization format

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

use super::mtree_constants::{MAGIC, MIN_RECOMMENDED_CAPACITY, NO_PAGE, PAGE_OVERHEAD, ROOT_ID, VERSION};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur in metric tree operations
#[derive(Debug, Error)]
pub enum MTreeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Invalid argument: {0}")]
    Argument(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Structural invariant violated: {0}")]
    Invariant(String),

    #[error("Tree is closed")]
    Closed,
}

/// Result type for metric tree operations
pub type MTreeResult<T> = Result<T, MTreeError>;

/// Identifier of a data object, assigned by the caller. The tree stores ids
/// only; object payloads live behind the distance function.
pub type ObjectId = u32;

/// Page id - unique identifier for a node/page in the page file
pub type PageId = u32;

// ============================================================================
// Entry Types
// ============================================================================

/// An entry in a leaf node: a stored object and its pre-computed distance to
/// the routing object of the leaf's parent entry (`None` when the leaf is the
/// root).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeafEntry {
    pub object_id: ObjectId,
    pub parent_distance: Option<f64>,
}

/// An entry in a directory node: a routing object, the subtree it covers, and
/// an upper bound on the distance from the routing object to every object
/// reachable through `child_node_id`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectoryEntry {
    pub routing_object_id: ObjectId,
    pub parent_distance: Option<f64>,
    pub child_node_id: PageId,
    pub covering_radius: f64,
}

/// The entries of a node, all of one variant.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEntries {
    Leaf(Vec<LeafEntry>),
    Directory(Vec<DirectoryEntry>),
}

// ============================================================================
// Node
// ============================================================================

/// A page-sized container of entries. `node_id` equals the page the node is
/// stored in; `NO_PAGE` until the node is first written.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub node_id: PageId,
    pub entries: NodeEntries,
}

impl Node {
    /// A fresh empty leaf node.
    pub fn new_leaf(node_id: PageId) -> Self {
        Self {
            node_id,
            entries: NodeEntries::Leaf(Vec::new()),
        }
    }

    /// A fresh empty directory node.
    pub fn new_directory(node_id: PageId) -> Self {
        Self {
            node_id,
            entries: NodeEntries::Directory(Vec::new()),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.entries, NodeEntries::Leaf(_))
    }

    pub fn num_entries(&self) -> usize {
        match &self.entries {
            NodeEntries::Leaf(entries) => entries.len(),
            NodeEntries::Directory(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.num_entries() == 0
    }

    /// Appends a leaf entry. The caller is responsible for splitting the node
    /// when it reaches capacity.
    pub fn add_leaf_entry(&mut self, entry: LeafEntry) -> MTreeResult<()> {
        match &mut self.entries {
            NodeEntries::Leaf(entries) => {
                entries.push(entry);
                Ok(())
            }
            NodeEntries::Directory(_) => Err(MTreeError::Invariant(format!(
                "node {} is a directory node, cannot add a leaf entry",
                self.node_id
            ))),
        }
    }

    /// Appends a directory entry. The caller is responsible for splitting the
    /// node when it reaches capacity.
    pub fn add_directory_entry(&mut self, entry: DirectoryEntry) -> MTreeResult<()> {
        match &mut self.entries {
            NodeEntries::Directory(entries) => {
                entries.push(entry);
                Ok(())
            }
            NodeEntries::Leaf(_) => Err(MTreeError::Invariant(format!(
                "node {} is a leaf node, cannot add a directory entry",
                self.node_id
            ))),
        }
    }

    /// The object carried by each entry: stored objects for leaves, routing
    /// objects for directories.
    pub fn entry_objects(&self) -> Vec<ObjectId> {
        match &self.entries {
            NodeEntries::Leaf(entries) => entries.iter().map(|e| e.object_id).collect(),
            NodeEntries::Directory(entries) => {
                entries.iter().map(|e| e.routing_object_id).collect()
            }
        }
    }

    /// Rewrites this node to hold `first` and returns a fresh sibling of the
    /// same variant holding `second`. The sibling has no page assigned yet.
    pub fn split_entries(&mut self, first: NodeEntries, second: NodeEntries) -> MTreeResult<Node> {
        let same_variant = matches!(
            (&self.entries, &first, &second),
            (NodeEntries::Leaf(_), NodeEntries::Leaf(_), NodeEntries::Leaf(_))
                | (
                    NodeEntries::Directory(_),
                    NodeEntries::Directory(_),
                    NodeEntries::Directory(_)
                )
        );
        if !same_variant {
            return Err(MTreeError::Invariant(format!(
                "split of node {} with mismatched entry variants",
                self.node_id
            )));
        }
        self.entries = first;
        Ok(Node {
            node_id: NO_PAGE,
            entries: second,
        })
    }
}

// ============================================================================
// Page Serialization
// ============================================================================

// On-page records. These are `Option`-free so bincode's legacy config lays
// them out with fixed-width little-endian fields and nothing else. An unset
// parent distance is written as 0.0; decoding restores it to `None` for
// entries of the root, the only node that has no parent.

#[derive(Serialize, Deserialize)]
struct PageHeaderRecord {
    index: u32,
    num_entries: u32,
    node_id: u32,
    is_leaf: bool,
}

#[derive(Serialize, Deserialize)]
struct LeafEntryRecord {
    object_id: u32,
    parent_distance: f64,
}

#[derive(Serialize, Deserialize)]
struct DirectoryEntryRecord {
    routing_object_id: u32,
    parent_distance: f64,
    child_node_id: u32,
    covering_radius: f64,
}

impl Node {
    /// Serializes the node into a zero-padded page of exactly `page_size`
    /// bytes. The first four bytes hold the page's own index; on a freed page
    /// the same four bytes hold the next free page id instead.
    pub fn to_page_bytes(&self, page_size: usize) -> MTreeResult<Vec<u8>> {
        let config = bincode::config::legacy();
        let header = PageHeaderRecord {
            index: self.node_id,
            num_entries: self.num_entries() as u32,
            node_id: self.node_id,
            is_leaf: self.is_leaf(),
        };
        let mut bytes = bincode::serde::encode_to_vec(&header, config)
            .map_err(|e| MTreeError::Serialization(e.to_string()))?;

        match &self.entries {
            NodeEntries::Leaf(entries) => {
                for entry in entries {
                    let record = LeafEntryRecord {
                        object_id: entry.object_id,
                        parent_distance: entry.parent_distance.unwrap_or(0.0),
                    };
                    let encoded = bincode::serde::encode_to_vec(&record, config)
                        .map_err(|e| MTreeError::Serialization(e.to_string()))?;
                    bytes.extend_from_slice(&encoded);
                }
            }
            NodeEntries::Directory(entries) => {
                for entry in entries {
                    let record = DirectoryEntryRecord {
                        routing_object_id: entry.routing_object_id,
                        parent_distance: entry.parent_distance.unwrap_or(0.0),
                        child_node_id: entry.child_node_id,
                        covering_radius: entry.covering_radius,
                    };
                    let encoded = bincode::serde::encode_to_vec(&record, config)
                        .map_err(|e| MTreeError::Serialization(e.to_string()))?;
                    bytes.extend_from_slice(&encoded);
                }
            }
        }

        if bytes.len() > page_size {
            return Err(MTreeError::Serialization(format!(
                "node {} too large: {} bytes (page size {})",
                self.node_id,
                bytes.len(),
                page_size
            )));
        }
        bytes.resize(page_size, 0);
        Ok(bytes)
    }

    /// Deserializes a node from a page image.
    pub fn from_page_bytes(bytes: &[u8]) -> MTreeResult<Node> {
        let config = bincode::config::legacy();
        let (header, mut offset): (PageHeaderRecord, usize) =
            bincode::serde::decode_from_slice(bytes, config)
                .map_err(|e| MTreeError::Serialization(e.to_string()))?;
        if header.index != header.node_id {
            return Err(MTreeError::Serialization(format!(
                "page index {} does not match node id {} (corrupt or freed page)",
                header.index, header.node_id
            )));
        }

        let is_root = header.node_id == ROOT_ID;
        let restore = |distance: f64| if is_root { None } else { Some(distance) };

        let entries = if header.is_leaf {
            let mut entries = Vec::with_capacity(header.num_entries as usize);
            for _ in 0..header.num_entries {
                let (record, used): (LeafEntryRecord, usize) =
                    bincode::serde::decode_from_slice(&bytes[offset..], config)
                        .map_err(|e| MTreeError::Serialization(e.to_string()))?;
                offset += used;
                entries.push(LeafEntry {
                    object_id: record.object_id,
                    parent_distance: restore(record.parent_distance),
                });
            }
            NodeEntries::Leaf(entries)
        } else {
            let mut entries = Vec::with_capacity(header.num_entries as usize);
            for _ in 0..header.num_entries {
                let (record, used): (DirectoryEntryRecord, usize) =
                    bincode::serde::decode_from_slice(&bytes[offset..], config)
                        .map_err(|e| MTreeError::Serialization(e.to_string()))?;
                offset += used;
                entries.push(DirectoryEntry {
                    routing_object_id: record.routing_object_id,
                    parent_distance: restore(record.parent_distance),
                    child_node_id: record.child_node_id,
                    covering_radius: record.covering_radius,
                });
            }
            NodeEntries::Directory(entries)
        };

        Ok(Node {
            node_id: header.node_id,
            entries,
        })
    }
}

// ============================================================================
// File Header
// ============================================================================

/// Header stored in block 0 of a page file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub page_size: u32,
    pub dir_capacity: u32,
    pub leaf_capacity: u32,
    pub free_list_head: PageId,
}

impl FileHeader {
    pub fn new(page_size: u32, dir_capacity: u32, leaf_capacity: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            page_size,
            dir_capacity,
            leaf_capacity,
            free_list_head: NO_PAGE,
        }
    }

    pub fn validate(&self) -> MTreeResult<()> {
        if self.magic != MAGIC {
            return Err(MTreeError::Configuration(
                "invalid page file (bad magic)".into(),
            ));
        }
        if self.version != VERSION {
            return Err(MTreeError::Configuration(format!(
                "unsupported page file version {}",
                self.version
            )));
        }
        if (self.page_size as usize) <= PAGE_OVERHEAD {
            return Err(MTreeError::Configuration(format!(
                "page size {} smaller than the page overhead",
                self.page_size
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Capacities
// ============================================================================

/// Derives the directory and leaf capacities from a page size and the
/// serialized width of one distance value. A node splits when it reaches
/// capacity, so pages at rest hold at most `capacity - 1` entries and always
/// fit in a page.
pub fn capacities_for(page_size: usize, distance_bytes: usize) -> MTreeResult<(usize, usize)> {
    if page_size <= PAGE_OVERHEAD {
        return Err(MTreeError::Configuration(format!(
            "page size {} must exceed the page overhead of {} bytes",
            page_size, PAGE_OVERHEAD
        )));
    }
    let payload = page_size - PAGE_OVERHEAD;
    let dir_capacity = payload / (4 + 4 + 2 * distance_bytes) + 1;
    let leaf_capacity = payload / (4 + distance_bytes) + 1;
    check_capacities(dir_capacity, leaf_capacity)?;
    Ok((dir_capacity, leaf_capacity))
}

/// Rejects unusable capacities and warns about degenerate ones.
pub fn check_capacities(dir_capacity: usize, leaf_capacity: usize) -> MTreeResult<()> {
    if dir_capacity <= 1 || leaf_capacity <= 1 {
        return Err(MTreeError::Configuration(format!(
            "capacities too small (directory {}, leaf {}); increase the page size",
            dir_capacity, leaf_capacity
        )));
    }
    if dir_capacity < MIN_RECOMMENDED_CAPACITY || leaf_capacity < MIN_RECOMMENDED_CAPACITY {
        log::warn!(
            "degenerate node capacities (directory {}, leaf {}); the tree will work but degrade",
            dir_capacity,
            leaf_capacity
        );
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
