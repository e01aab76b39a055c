//! The metric tree façade.
//!
//! A balanced, paginated tree over an arbitrary metric space. Directory
//! entries carry a routing object and a covering radius bounding the distance
//! to every object in their subtree; leaf entries carry stored objects. Both
//! keep a pre-computed distance to the parent's routing object, which lets
//! range and kNN queries prune subtrees by the triangle inequality before
//! computing a single new distance.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::path::Path;

use parking_lot::RwLock;

use crate::distance::DistanceFunction;

use super::mtree_cache::PageCache;
use super::mtree_constants::{NO_PAGE, ROOT_ID};
use super::mtree_storage::{FilePageFile, MemoryPageFile, PageFile};
use super::mtree_types::{
    capacities_for, check_capacities, DirectoryEntry, LeafEntry, MTreeError, MTreeResult, Node,
    NodeEntries, ObjectId, PageId,
};
use super::query_tools::{KnnList, PendingSubtree};

/// A paginated metric tree answering range and k-nearest-neighbor queries.
///
/// The tree stores object ids only; distances are computed on demand through
/// the configured [`DistanceFunction`]. Node pages live in a [`PageFile`]
/// behind a bounded LRU cache, so trees larger than memory stay usable.
pub struct MTree {
    page_file: Box<dyn PageFile>,
    cache: RwLock<PageCache>,
    distance: Box<dyn DistanceFunction>,
    dir_capacity: usize,
    leaf_capacity: usize,
    closed: RwLock<bool>,
}

/// Result of partitioning an overflowing node between two promoted objects.
struct Partition {
    first: NodeEntries,
    second: NodeEntries,
    first_radius: f64,
    second_radius: f64,
}

impl MTree {
    // ========================================================================
    // Construction
    // ========================================================================

    /// Creates a new file-backed tree, truncating anything already at `path`.
    /// Node capacities are derived from the page size and the distance
    /// function's serialized width.
    pub fn create(
        path: impl AsRef<Path>,
        page_size: usize,
        cache_pages: usize,
        distance: Box<dyn DistanceFunction>,
    ) -> MTreeResult<Self> {
        let (dir_capacity, leaf_capacity) = capacities_for(page_size, distance.serialized_size())?;
        let page_file = FilePageFile::create(
            path.as_ref(),
            page_size,
            dir_capacity as u32,
            leaf_capacity as u32,
        )?;
        let tree = Self::assemble(
            Box::new(page_file),
            cache_pages,
            distance,
            dir_capacity,
            leaf_capacity,
        )?;
        tree.init_root()?;
        Ok(tree)
    }

    /// Opens an existing file-backed tree. Only the header is read here; node
    /// pages load on demand.
    pub fn open(
        path: impl AsRef<Path>,
        cache_pages: usize,
        distance: Box<dyn DistanceFunction>,
    ) -> MTreeResult<Self> {
        let page_file = FilePageFile::open(path.as_ref())?;
        let header = page_file.header();
        Self::assemble(
            Box::new(page_file),
            cache_pages,
            distance,
            header.dir_capacity as usize,
            header.leaf_capacity as usize,
        )
    }

    /// Creates a transient memory-backed tree.
    pub fn in_memory(
        page_size: usize,
        cache_pages: usize,
        distance: Box<dyn DistanceFunction>,
    ) -> MTreeResult<Self> {
        let (dir_capacity, leaf_capacity) = capacities_for(page_size, distance.serialized_size())?;
        let tree = Self::assemble(
            Box::new(MemoryPageFile::new()),
            cache_pages,
            distance,
            dir_capacity,
            leaf_capacity,
        )?;
        tree.init_root()?;
        Ok(tree)
    }

    /// Creates a transient memory-backed tree with explicit node capacities,
    /// bypassing the page-size derivation. Useful for forcing deep trees out
    /// of few objects.
    pub fn in_memory_with_capacities(
        dir_capacity: usize,
        leaf_capacity: usize,
        cache_pages: usize,
        distance: Box<dyn DistanceFunction>,
    ) -> MTreeResult<Self> {
        check_capacities(dir_capacity, leaf_capacity)?;
        let tree = Self::assemble(
            Box::new(MemoryPageFile::new()),
            cache_pages,
            distance,
            dir_capacity,
            leaf_capacity,
        )?;
        tree.init_root()?;
        Ok(tree)
    }

    fn assemble(
        page_file: Box<dyn PageFile>,
        cache_pages: usize,
        distance: Box<dyn DistanceFunction>,
        dir_capacity: usize,
        leaf_capacity: usize,
    ) -> MTreeResult<Self> {
        if cache_pages == 0 {
            return Err(MTreeError::Configuration(
                "cache must hold at least one page".into(),
            ));
        }
        Ok(Self {
            page_file,
            cache: RwLock::new(PageCache::new(cache_pages)),
            distance,
            dir_capacity,
            leaf_capacity,
            closed: RwLock::new(false),
        })
    }

    fn init_root(&self) -> MTreeResult<()> {
        let mut root = Node::new_leaf(NO_PAGE);
        self.write_node(&mut root)?;
        if root.node_id != ROOT_ID {
            return Err(MTreeError::Invariant(format!(
                "fresh root was allocated page {}",
                root.node_id
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Insertion
    // ========================================================================

    /// Inserts an object. The descent picks, at every directory level, the
    /// child whose routing object is closest among those already covering the
    /// object; when none covers it, the entry needing the least
    /// covering-radius enlargement wins and the enlargement is applied on the
    /// spot. A full leaf triggers the split cascade.
    pub fn insert(&self, object_id: ObjectId) -> MTreeResult<()> {
        self.check_closed()?;

        let mut path: Vec<(PageId, usize)> = Vec::new();
        let mut parent_distance: Option<f64> = None;
        let mut current = ROOT_ID;
        loop {
            let mut node = self.read_node(current)?;
            let child = match &mut node.entries {
                NodeEntries::Leaf(_) => break,
                NodeEntries::Directory(entries) => {
                    let (index, d, enlarged) = self.choose_subtree(entries, object_id)?;
                    let child = entries[index].child_node_id;
                    if enlarged {
                        self.write_node(&mut node)?;
                    }
                    path.push((current, index));
                    parent_distance = Some(d);
                    child
                }
            };
            current = child;
        }

        let mut leaf = self.read_node(current)?;
        leaf.add_leaf_entry(LeafEntry {
            object_id,
            parent_distance,
        })?;
        if leaf.num_entries() < self.leaf_capacity {
            self.write_node(&mut leaf)?;
            return Ok(());
        }

        // Each split may push its parent to capacity in turn; a node at
        // capacity is only ever written back after it has been split.
        let mut overflowing = Some(leaf);
        while let Some(node) = overflowing {
            overflowing = self.split(node, &mut path)?;
        }
        Ok(())
    }

    /// Inserts a batch of objects one by one.
    pub fn insert_many(&self, object_ids: &[ObjectId]) -> MTreeResult<()> {
        for &object_id in object_ids {
            self.insert(object_id)?;
        }
        Ok(())
    }

    fn choose_subtree(
        &self,
        entries: &mut [DirectoryEntry],
        object_id: ObjectId,
    ) -> MTreeResult<(usize, f64, bool)> {
        let mut best_covering: Option<(usize, f64)> = None;
        let mut best_growing: Option<(usize, f64, f64)> = None;
        for (index, entry) in entries.iter().enumerate() {
            let d = self.dist(object_id, entry.routing_object_id);
            if d <= entry.covering_radius {
                if best_covering.map_or(true, |(_, best)| d < best) {
                    best_covering = Some((index, d));
                }
            } else {
                let growth = d - entry.covering_radius;
                if best_growing.map_or(true, |(_, _, best)| growth < best) {
                    best_growing = Some((index, d, growth));
                }
            }
        }

        if let Some((index, d)) = best_covering {
            return Ok((index, d, false));
        }
        match best_growing {
            Some((index, d, _)) => {
                entries[index].covering_radius = d;
                Ok((index, d, true))
            }
            None => Err(MTreeError::Invariant(
                "directory node with no entries".into(),
            )),
        }
    }

    // ========================================================================
    // Splitting
    // ========================================================================

    /// Splits an overflowing node. The routing object already stored in the
    /// parent entry is reused as the first promotion (its assignments keep a
    /// known parent distance); the entry object farthest from it becomes the
    /// second. Returns the parent when the promotion pushed it to capacity,
    /// so the caller can split it next.
    fn split(&self, mut node: Node, path: &mut Vec<(PageId, usize)>) -> MTreeResult<Option<Node>> {
        let Some((parent_id, entry_index)) = path.pop() else {
            self.split_root(node)?;
            return Ok(None);
        };
        log::debug!(
            "splitting node {} ({} entries) under node {}",
            node.node_id,
            node.num_entries(),
            parent_id
        );

        let mut parent = self.read_node(parent_id)?;
        let first_promoted = match &parent.entries {
            NodeEntries::Directory(entries) => entries[entry_index].routing_object_id,
            NodeEntries::Leaf(_) => {
                return Err(MTreeError::Invariant(format!(
                    "parent node {} of node {} is a leaf",
                    parent_id, node.node_id
                )))
            }
        };
        let second_promoted = self.farthest_entry_object(first_promoted, &node)?;

        let partition = self.partition(&node, first_promoted, second_promoted)?;
        let mut sibling = node.split_entries(partition.first, partition.second)?;
        self.write_node(&mut node)?;
        self.write_node(&mut sibling)?;

        // Parent distances of the two promoted entries are measured from the
        // grandparent's routing object; entries of the root have none.
        let grandparent_routing = match path.last() {
            Some(&(ancestor_id, ancestor_index)) => {
                let ancestor = self.read_node(ancestor_id)?;
                match &ancestor.entries {
                    NodeEntries::Directory(entries) => {
                        Some(entries[ancestor_index].routing_object_id)
                    }
                    NodeEntries::Leaf(_) => {
                        return Err(MTreeError::Invariant(format!(
                            "ancestor node {} is a leaf",
                            ancestor_id
                        )))
                    }
                }
            }
            None => None,
        };

        if let NodeEntries::Directory(entries) = &mut parent.entries {
            entries[entry_index] = DirectoryEntry {
                routing_object_id: first_promoted,
                parent_distance: grandparent_routing.map(|g| self.dist(first_promoted, g)),
                child_node_id: node.node_id,
                covering_radius: partition.first_radius,
            };
            entries.push(DirectoryEntry {
                routing_object_id: second_promoted,
                parent_distance: grandparent_routing.map(|g| self.dist(second_promoted, g)),
                child_node_id: sibling.node_id,
                covering_radius: partition.second_radius,
            });
        }

        if parent.num_entries() < self.dir_capacity {
            self.write_node(&mut parent)?;
            Ok(None)
        } else {
            Ok(Some(parent))
        }
    }

    /// Splits the root. With no parent entry to reuse, the mutually farthest
    /// pair of entry objects is promoted; the old root's halves move to fresh
    /// pages and a new two-entry directory root takes over the root id.
    fn split_root(&self, mut root: Node) -> MTreeResult<()> {
        let objects = root.entry_objects();
        if objects.len() < 2 {
            return Err(MTreeError::Invariant(
                "root split with fewer than two entries".into(),
            ));
        }
        let (mut first, mut second, mut best) = (objects[0], objects[1], f64::NEG_INFINITY);
        for i in 0..objects.len() {
            for j in (i + 1)..objects.len() {
                let d = self.dist(objects[i], objects[j]);
                if d > best {
                    best = d;
                    first = objects[i];
                    second = objects[j];
                }
            }
        }

        let partition = self.partition(&root, first, second)?;
        let mut sibling = root.split_entries(partition.first, partition.second)?;
        root.node_id = NO_PAGE;
        self.write_node(&mut root)?;
        self.write_node(&mut sibling)?;

        let mut new_root = Node::new_directory(ROOT_ID);
        new_root.add_directory_entry(DirectoryEntry {
            routing_object_id: first,
            parent_distance: None,
            child_node_id: root.node_id,
            covering_radius: partition.first_radius,
        })?;
        new_root.add_directory_entry(DirectoryEntry {
            routing_object_id: second,
            parent_distance: None,
            child_node_id: sibling.node_id,
            covering_radius: partition.second_radius,
        })?;
        self.write_node(&mut new_root)?;
        log::debug!(
            "root split: objects {} and {} promoted over nodes {} and {}",
            first,
            second,
            root.node_id,
            sibling.node_id
        );
        Ok(())
    }

    fn farthest_entry_object(&self, from: ObjectId, node: &Node) -> MTreeResult<ObjectId> {
        let mut farthest: Option<(ObjectId, f64)> = None;
        for object in node.entry_objects() {
            let d = self.dist(from, object);
            if farthest.map_or(true, |(_, best)| d > best) {
                farthest = Some((object, d));
            }
        }
        farthest.map(|(object, _)| object).ok_or_else(|| {
            MTreeError::Invariant(format!("split of empty node {}", node.node_id))
        })
    }

    /// Assigns every entry to the closer promoted object (ties to the first)
    /// and computes both covering radii. For directory entries the radius
    /// accounts for the entry's own covering radius, so the bound holds for
    /// every transitively reachable object. Either side being left empty -
    /// possible when objects coincide or when the reused routing object lies
    /// far outside the node - is repaired by moving one entry across.
    fn partition(
        &self,
        node: &Node,
        first_promoted: ObjectId,
        second_promoted: ObjectId,
    ) -> MTreeResult<Partition> {
        match &node.entries {
            NodeEntries::Leaf(entries) => {
                let distances: Vec<(f64, f64)> = entries
                    .iter()
                    .map(|e| {
                        (
                            self.dist(e.object_id, first_promoted),
                            self.dist(e.object_id, second_promoted),
                        )
                    })
                    .collect();
                let (to_first, to_second) =
                    Self::assign(&distances, |i| entries[i].object_id == second_promoted);

                let build = |indices: &[usize], promoted_side: usize| -> (Vec<LeafEntry>, f64) {
                    let mut side = Vec::with_capacity(indices.len());
                    let mut radius = 0.0f64;
                    for &i in indices {
                        let d = if promoted_side == 0 { distances[i].0 } else { distances[i].1 };
                        radius = radius.max(d);
                        side.push(LeafEntry {
                            object_id: entries[i].object_id,
                            parent_distance: Some(d),
                        });
                    }
                    (side, radius)
                };
                let (first, first_radius) = build(&to_first, 0);
                let (second, second_radius) = build(&to_second, 1);
                Ok(Partition {
                    first: NodeEntries::Leaf(first),
                    second: NodeEntries::Leaf(second),
                    first_radius,
                    second_radius,
                })
            }
            NodeEntries::Directory(entries) => {
                let distances: Vec<(f64, f64)> = entries
                    .iter()
                    .map(|e| {
                        (
                            self.dist(e.routing_object_id, first_promoted),
                            self.dist(e.routing_object_id, second_promoted),
                        )
                    })
                    .collect();
                let (to_first, to_second) =
                    Self::assign(&distances, |i| entries[i].routing_object_id == second_promoted);

                let build =
                    |indices: &[usize], promoted_side: usize| -> (Vec<DirectoryEntry>, f64) {
                        let mut side = Vec::with_capacity(indices.len());
                        let mut radius = 0.0f64;
                        for &i in indices {
                            let d = if promoted_side == 0 { distances[i].0 } else { distances[i].1 };
                            radius = radius.max(d + entries[i].covering_radius);
                            side.push(DirectoryEntry {
                                routing_object_id: entries[i].routing_object_id,
                                parent_distance: Some(d),
                                child_node_id: entries[i].child_node_id,
                                covering_radius: entries[i].covering_radius,
                            });
                        }
                        (side, radius)
                    };
                let (first, first_radius) = build(&to_first, 0);
                let (second, second_radius) = build(&to_second, 1);
                Ok(Partition {
                    first: NodeEntries::Directory(first),
                    second: NodeEntries::Directory(second),
                    first_radius,
                    second_radius,
                })
            }
        }
    }

    /// Closer-of-two assignment over entry indexes, with repairs keeping both
    /// sides non-empty.
    fn assign(
        distances: &[(f64, f64)],
        is_second_promoted: impl Fn(usize) -> bool,
    ) -> (Vec<usize>, Vec<usize>) {
        let mut to_first = Vec::new();
        let mut to_second = Vec::new();
        for (i, &(d1, d2)) in distances.iter().enumerate() {
            if d1 <= d2 {
                to_first.push(i);
            } else {
                to_second.push(i);
            }
        }

        if to_second.is_empty() {
            // Every object coincides with the first promotion; hand the
            // second promotion's own entry over.
            if let Some(pos) = to_first.iter().position(|&i| is_second_promoted(i)) {
                to_second.push(to_first.remove(pos));
            }
        } else if to_first.is_empty() {
            // The reused routing object is farther from every entry than the
            // second promotion; keep its node alive with the closest entry.
            let mut closest = 0usize;
            for (pos, &i) in to_second.iter().enumerate() {
                if distances[i].0 < distances[to_second[closest]].0 {
                    closest = pos;
                }
            }
            to_first.push(to_second.remove(closest));
        }
        (to_first, to_second)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// All objects within `radius` of the query object, ascending by
    /// distance, ties in discovery order.
    pub fn range_query(&self, query: ObjectId, radius: f64) -> MTreeResult<Vec<(ObjectId, f64)>> {
        self.check_closed()?;
        if radius < 0.0 {
            return Err(MTreeError::Argument(format!(
                "range radius must be non-negative, got {}",
                radius
            )));
        }
        let mut results = Vec::new();
        self.range_search(
            ROOT_ID,
            query,
            radius,
            self.distance.null_distance(),
            &mut results,
        )?;
        results.sort_by(|a, b| a.1.total_cmp(&b.1));
        Ok(results)
    }

    /// [`range_query`](Self::range_query) with the radius parsed by the
    /// distance function.
    pub fn range_query_str(&self, query: ObjectId, radius: &str) -> MTreeResult<Vec<(ObjectId, f64)>> {
        let radius = self.distance.parse_distance(radius)?;
        self.range_query(query, radius)
    }

    /// `routing_distance` is the known distance from this node's routing
    /// object to the query. Together with each entry's stored parent
    /// distance it yields `|d1 - d2|`, a lower bound on the entry's distance
    /// to the query that costs no distance computation.
    fn range_search(
        &self,
        node_id: PageId,
        query: ObjectId,
        radius: f64,
        routing_distance: f64,
        results: &mut Vec<(ObjectId, f64)>,
    ) -> MTreeResult<()> {
        let node = self.read_node(node_id)?;
        match &node.entries {
            NodeEntries::Directory(entries) => {
                for entry in entries {
                    let stored = entry.parent_distance.unwrap_or(0.0);
                    let diff = (routing_distance - stored).abs();
                    if diff <= radius + entry.covering_radius {
                        let d = self.dist(entry.routing_object_id, query);
                        if d <= radius + entry.covering_radius {
                            self.range_search(entry.child_node_id, query, radius, d, results)?;
                        }
                    }
                }
            }
            NodeEntries::Leaf(entries) => {
                for entry in entries {
                    let stored = entry.parent_distance.unwrap_or(0.0);
                    let diff = (routing_distance - stored).abs();
                    if diff <= radius {
                        let d = self.dist(entry.object_id, query);
                        if d <= radius {
                            results.push((entry.object_id, d));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// The k objects closest to the query, ascending by distance. Uses a
    /// best-first descent over subtree lower bounds; the search stops as soon
    /// as no pending subtree can undercut the kth-best distance found.
    pub fn knn_query(&self, query: ObjectId, k: usize) -> MTreeResult<Vec<(ObjectId, f64)>> {
        self.check_closed()?;
        if k < 1 {
            return Err(MTreeError::Argument("k must be at least 1".into()));
        }

        let mut knn = KnnList::new(k);
        let mut pending = BinaryHeap::new();
        pending.push(Reverse(PendingSubtree {
            lower_bound: self.distance.null_distance(),
            node_id: ROOT_ID,
            routing_distance: self.distance.null_distance(),
        }));

        while let Some(Reverse(subtree)) = pending.pop() {
            if subtree.lower_bound > knn.kth_distance() {
                break;
            }
            let node = self.read_node(subtree.node_id)?;
            match &node.entries {
                NodeEntries::Directory(entries) => {
                    for entry in entries {
                        let stored = entry.parent_distance.unwrap_or(0.0);
                        let diff = (subtree.routing_distance - stored).abs();
                        if diff <= knn.kth_distance() + entry.covering_radius {
                            let d = self.dist(entry.routing_object_id, query);
                            let lower_bound = (d - entry.covering_radius).max(0.0);
                            if lower_bound <= knn.kth_distance() {
                                pending.push(Reverse(PendingSubtree {
                                    lower_bound,
                                    node_id: entry.child_node_id,
                                    routing_distance: d,
                                }));
                            }
                        }
                    }
                }
                NodeEntries::Leaf(entries) => {
                    for entry in entries {
                        let stored = entry.parent_distance.unwrap_or(0.0);
                        let diff = (subtree.routing_distance - stored).abs();
                        if diff <= knn.kth_distance() {
                            let d = self.dist(entry.object_id, query);
                            if d <= knn.kth_distance() {
                                knn.admit(entry.object_id, d);
                            }
                        }
                    }
                }
            }
        }
        Ok(knn.into_sorted_vec())
    }

    /// Answers kNN for a whole set of queries in one descent, sharing node
    /// reads. Children are visited ascending by the smallest lower bound any
    /// query gives them, and only while at least one query could still
    /// improve.
    pub fn batch_knn(
        &self,
        queries: &[ObjectId],
        k: usize,
    ) -> MTreeResult<HashMap<ObjectId, Vec<(ObjectId, f64)>>> {
        self.check_closed()?;
        if k < 1 {
            return Err(MTreeError::Argument("k must be at least 1".into()));
        }
        if queries.is_empty() {
            return Ok(HashMap::new());
        }

        let mut accumulators: Vec<KnnList> = queries.iter().map(|_| KnnList::new(k)).collect();
        self.batch_search(ROOT_ID, queries, &mut accumulators)?;
        Ok(queries
            .iter()
            .zip(accumulators)
            .map(|(&query, knn)| (query, knn.into_sorted_vec()))
            .collect())
    }

    fn batch_search(
        &self,
        node_id: PageId,
        queries: &[ObjectId],
        accumulators: &mut [KnnList],
    ) -> MTreeResult<()> {
        let node = self.read_node(node_id)?;
        match &node.entries {
            NodeEntries::Directory(entries) => {
                let mut candidates: Vec<(f64, PageId)> = entries
                    .iter()
                    .map(|entry| {
                        let bound = queries
                            .iter()
                            .map(|&query| {
                                (self.dist(entry.routing_object_id, query)
                                    - entry.covering_radius)
                                    .max(0.0)
                            })
                            .fold(f64::INFINITY, f64::min);
                        (bound, entry.child_node_id)
                    })
                    .collect();
                candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

                for (bound, child) in candidates {
                    let widest = accumulators
                        .iter()
                        .map(|knn| knn.kth_distance())
                        .fold(f64::NEG_INFINITY, f64::max);
                    if bound <= widest {
                        self.batch_search(child, queries, accumulators)?;
                    }
                }
            }
            NodeEntries::Leaf(entries) => {
                for entry in entries {
                    for (slot, &query) in queries.iter().enumerate() {
                        let d = self.dist(entry.object_id, query);
                        if d <= accumulators[slot].kth_distance() {
                            accumulators[slot].admit(entry.object_id, d);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Rejected Operations
    // ========================================================================

    /// Deletion is not supported.
    pub fn delete(&self, _object_id: ObjectId) -> MTreeResult<()> {
        Err(MTreeError::Unsupported("delete is not supported".into()))
    }

    /// Reverse kNN is not supported.
    pub fn reverse_knn_query(
        &self,
        _query: ObjectId,
        _k: usize,
    ) -> MTreeResult<Vec<(ObjectId, f64)>> {
        Err(MTreeError::Unsupported(
            "reverse-kNN queries are not supported".into(),
        ))
    }

    // ========================================================================
    // Observability
    // ========================================================================

    /// Physical page accesses since creation or the last reset. Cache hits
    /// do not count.
    pub fn io_access_count(&self) -> u64 {
        self.page_file.io_access_count()
    }

    pub fn reset_io_access_count(&self) {
        self.page_file.reset_io_access_count();
    }

    /// Edges from the root down to the leaf level; 0 while the root is a
    /// leaf. All leaves sit at the same depth.
    pub fn height(&self) -> MTreeResult<u32> {
        self.check_closed()?;
        let mut height = 0;
        let mut current = ROOT_ID;
        loop {
            let node = self.read_node(current)?;
            match &node.entries {
                NodeEntries::Leaf(_) => return Ok(height),
                NodeEntries::Directory(entries) => {
                    let entry = entries.first().ok_or_else(|| {
                        MTreeError::Invariant("directory node with no entries".into())
                    })?;
                    current = entry.child_node_id;
                    height += 1;
                }
            }
        }
    }

    /// Walks the whole tree verifying its structural invariants: uniform
    /// leaf depth, covering radii bounding every reachable object, parent
    /// distances matching recomputation, and non-root occupancy. Diagnostic
    /// only; public operations never raise these.
    pub fn check_invariants(&self) -> MTreeResult<()> {
        self.check_closed()?;
        let mut leaf_depths = Vec::new();
        self.check_node(ROOT_ID, None, 0, &mut leaf_depths)?;
        if let Some((&first, rest)) = leaf_depths.split_first() {
            if rest.iter().any(|&depth| depth != first) {
                return Err(MTreeError::Invariant("leaves at differing depths".into()));
            }
        }
        Ok(())
    }

    fn check_node(
        &self,
        node_id: PageId,
        parent_routing: Option<ObjectId>,
        depth: u32,
        leaf_depths: &mut Vec<u32>,
    ) -> MTreeResult<Vec<ObjectId>> {
        const TOLERANCE: f64 = 1e-9;
        let node = self.read_node(node_id)?;
        if node_id != ROOT_ID && node.is_empty() {
            return Err(MTreeError::Invariant(format!("node {} is empty", node_id)));
        }
        match &node.entries {
            NodeEntries::Leaf(entries) => {
                leaf_depths.push(depth);
                let mut objects = Vec::with_capacity(entries.len());
                for entry in entries {
                    self.check_parent_distance(
                        entry.object_id,
                        entry.parent_distance,
                        parent_routing,
                        TOLERANCE,
                    )?;
                    objects.push(entry.object_id);
                }
                Ok(objects)
            }
            NodeEntries::Directory(entries) => {
                let mut objects = Vec::new();
                for entry in entries {
                    self.check_parent_distance(
                        entry.routing_object_id,
                        entry.parent_distance,
                        parent_routing,
                        TOLERANCE,
                    )?;
                    let reachable = self.check_node(
                        entry.child_node_id,
                        Some(entry.routing_object_id),
                        depth + 1,
                        leaf_depths,
                    )?;
                    for &object in &reachable {
                        let d = self.dist(entry.routing_object_id, object);
                        if d > entry.covering_radius + TOLERANCE {
                            return Err(MTreeError::Invariant(format!(
                                "object {} at distance {} escapes covering radius {} of routing object {}",
                                object, d, entry.covering_radius, entry.routing_object_id
                            )));
                        }
                    }
                    objects.extend(reachable);
                }
                Ok(objects)
            }
        }
    }

    fn check_parent_distance(
        &self,
        object: ObjectId,
        stored: Option<f64>,
        parent_routing: Option<ObjectId>,
        tolerance: f64,
    ) -> MTreeResult<()> {
        match (parent_routing, stored) {
            (None, None) => Ok(()),
            (None, Some(_)) => Err(MTreeError::Invariant(format!(
                "root entry for object {} carries a parent distance",
                object
            ))),
            (Some(_), None) => Err(MTreeError::Invariant(format!(
                "non-root entry for object {} lacks a parent distance",
                object
            ))),
            (Some(routing), Some(stored)) => {
                let actual = self.dist(object, routing);
                if (actual - stored).abs() > tolerance {
                    Err(MTreeError::Invariant(format!(
                        "entry for object {} stores parent distance {} but distance to {} is {}",
                        object, stored, routing, actual
                    )))
                } else {
                    Ok(())
                }
            }
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Flushes dirty pages through the page file and closes it. Every later
    /// operation fails with [`MTreeError::Closed`].
    pub fn close(&self) -> MTreeResult<()> {
        let mut closed = self.closed.write();
        if *closed {
            return Ok(());
        }
        self.flush()?;
        self.page_file.close()?;
        *closed = true;
        Ok(())
    }

    fn check_closed(&self) -> MTreeResult<()> {
        if *self.closed.read() {
            Err(MTreeError::Closed)
        } else {
            Ok(())
        }
    }

    fn flush(&self) -> MTreeResult<()> {
        let dirty = self.cache.write().take_dirty();
        for (_, mut node) in dirty {
            self.page_file.write_page(&mut node)?;
        }
        Ok(())
    }

    // ========================================================================
    // Page Access
    // ========================================================================

    fn read_node(&self, page_id: PageId) -> MTreeResult<Node> {
        if let Some(node) = self.cache.write().lookup(page_id) {
            return Ok(node.clone());
        }
        let node = self.page_file.read_page(page_id)?;
        self.install(page_id, node.clone(), false)?;
        Ok(node)
    }

    fn write_node(&self, node: &mut Node) -> MTreeResult<()> {
        if node.node_id == NO_PAGE {
            node.node_id = self.page_file.allocate_page()?;
        }
        self.install(node.node_id, node.clone(), true)
    }

    fn install(&self, page_id: PageId, node: Node, dirty: bool) -> MTreeResult<()> {
        let evicted = self.cache.write().install(page_id, node, dirty);
        if let Some((_, mut victim)) = evicted {
            self.page_file.write_page(&mut victim)?;
        }
        Ok(())
    }

    fn dist(&self, a: ObjectId, b: ObjectId) -> f64 {
        self.distance.distance(a, b)
    }
}

impl Drop for MTree {
    fn drop(&mut self) {
        // Best effort flush on drop
        if !*self.closed.read() {
            let _ = self.flush();
            let _ = self.page_file.close();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::{EuclideanDistance, ManhattanDistance};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::tempdir;

    /// Routes `log` output (split and page-file debug lines, capacity
    /// warnings) through the test harness. Safe to call from every test.
    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn line_points(n: usize) -> Vec<Vec<f64>> {
        (0..n).map(|i| vec![i as f64]).collect()
    }

    fn random_points(rng: &mut StdRng, n: usize) -> Vec<Vec<f64>> {
        (0..n)
            .map(|_| vec![rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0)])
            .collect()
    }

    fn euclid(a: &[f64], b: &[f64]) -> f64 {
        a.iter()
            .zip(b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f64>()
            .sqrt()
    }

    /// Ten integers on a line with tiny capacities: forces three split
    /// cascades including two root splits.
    fn small_line_tree() -> MTree {
        init_logging();
        let metric = ManhattanDistance::new(line_points(10));
        let tree = MTree::in_memory_with_capacities(3, 3, 64, Box::new(metric)).unwrap();
        tree.insert_many(&(0..10).collect::<Vec<_>>()).unwrap();
        tree
    }

    fn all_entry_counts(tree: &MTree) -> Vec<usize> {
        fn walk(tree: &MTree, node_id: PageId, counts: &mut Vec<usize>) {
            let node = tree.read_node(node_id).unwrap();
            counts.push(node.num_entries());
            if let NodeEntries::Directory(entries) = &node.entries {
                for entry in entries {
                    walk(tree, entry.child_node_id, counts);
                }
            }
        }
        let mut counts = Vec::new();
        walk(tree, ROOT_ID, &mut counts);
        counts
    }

    #[test]
    fn ten_line_points_build_a_three_level_tree() {
        let tree = small_line_tree();
        assert_eq!(tree.height().unwrap(), 3);
        tree.check_invariants().unwrap();
        for count in all_entry_counts(&tree) {
            assert!((1..=2).contains(&count));
        }
    }

    #[test]
    fn knn_on_the_line() {
        let tree = small_line_tree();
        let result = tree.knn_query(5, 3).unwrap();
        assert_eq!(result, vec![(5, 0.0), (4, 1.0), (6, 1.0)]);
    }

    #[test]
    fn range_query_on_the_line() {
        let tree = small_line_tree();
        let result = tree.range_query(5, 2.0).unwrap();
        assert_eq!(
            result,
            vec![(5, 0.0), (4, 1.0), (6, 1.0), (3, 2.0), (7, 2.0)]
        );
    }

    #[test]
    fn range_query_str_parses_the_radius() {
        let tree = small_line_tree();
        assert_eq!(
            tree.range_query_str(5, "2.0").unwrap(),
            tree.range_query(5, 2.0).unwrap()
        );
        assert!(matches!(
            tree.range_query_str(5, "wide"),
            Err(MTreeError::Argument(_))
        ));
    }

    #[test]
    fn invariants_hold_after_random_inserts() {
        init_logging();
        let mut rng = StdRng::seed_from_u64(7);
        let points = random_points(&mut rng, 200);
        let metric = EuclideanDistance::new(points);
        let tree = MTree::in_memory_with_capacities(4, 4, 128, Box::new(metric)).unwrap();
        for id in 0..200 {
            tree.insert(id).unwrap();
        }
        tree.check_invariants().unwrap();
        assert!(tree.height().unwrap() >= 2);
    }

    #[test]
    fn knn_matches_exhaustive_scan() {
        let mut rng = StdRng::seed_from_u64(42);
        let points = random_points(&mut rng, 150);
        let metric = EuclideanDistance::new(points.clone());
        let tree = MTree::in_memory_with_capacities(6, 8, 256, Box::new(metric)).unwrap();
        for id in 0..100 {
            tree.insert(id).unwrap();
        }

        for query in 100u32..150 {
            let result = tree.knn_query(query, 10).unwrap();

            let mut brute: Vec<(ObjectId, f64)> = (0u32..100)
                .map(|id| (id, euclid(&points[id as usize], &points[query as usize])))
                .collect();
            brute.sort_by(|a, b| a.1.total_cmp(&b.1));
            brute.truncate(10);

            assert_eq!(result, brute);
        }
    }

    #[test]
    fn range_matches_exhaustive_scan() {
        let mut rng = StdRng::seed_from_u64(97);
        let points = random_points(&mut rng, 120);
        let metric = EuclideanDistance::new(points.clone());
        let tree = MTree::in_memory_with_capacities(5, 6, 256, Box::new(metric)).unwrap();
        for id in 0..100 {
            tree.insert(id).unwrap();
        }

        for query in 100u32..120 {
            let radius = rng.gen_range(0.1..0.5);
            let result = tree.range_query(query, radius).unwrap();

            let mut expected: Vec<ObjectId> = (0u32..100)
                .filter(|&id| euclid(&points[id as usize], &points[query as usize]) <= radius)
                .collect();
            let mut found: Vec<ObjectId> = result.iter().map(|&(id, _)| id).collect();
            expected.sort_unstable();
            found.sort_unstable();
            assert_eq!(found, expected);

            // Ascending by distance, and each pair reports the true distance.
            for window in result.windows(2) {
                assert!(window[0].1 <= window[1].1);
            }
            for &(id, d) in &result {
                assert_eq!(d, euclid(&points[id as usize], &points[query as usize]));
            }
        }
    }

    #[test]
    fn knn_is_contained_in_range_at_the_kth_distance() {
        let mut rng = StdRng::seed_from_u64(3);
        let points = random_points(&mut rng, 80);
        let metric = EuclideanDistance::new(points);
        let tree = MTree::in_memory_with_capacities(4, 5, 128, Box::new(metric)).unwrap();
        for id in 0..60 {
            tree.insert(id).unwrap();
        }

        for query in 60u32..80 {
            let knn = tree.knn_query(query, 5).unwrap();
            let kth = knn.last().map(|&(_, d)| d).unwrap();
            let range: Vec<ObjectId> = tree
                .range_query(query, kth)
                .unwrap()
                .iter()
                .map(|&(id, _)| id)
                .collect();
            for &(id, _) in &knn {
                assert!(range.contains(&id));
            }
        }
    }

    #[test]
    fn batch_knn_matches_individual_queries() {
        let mut rng = StdRng::seed_from_u64(11);
        let points = random_points(&mut rng, 120);
        let metric = EuclideanDistance::new(points);
        let tree = MTree::in_memory_with_capacities(5, 6, 256, Box::new(metric)).unwrap();
        for id in 0..100 {
            tree.insert(id).unwrap();
        }

        let queries: Vec<ObjectId> = (100..120).collect();
        let batched = tree.batch_knn(&queries, 7).unwrap();
        assert_eq!(batched.len(), queries.len());
        for &query in &queries {
            assert_eq!(batched[&query], tree.knn_query(query, 7).unwrap());
        }
    }

    #[test]
    fn warm_cache_queries_cost_no_page_accesses() {
        let tree = small_line_tree();
        tree.knn_query(5, 3).unwrap();
        tree.range_query(5, 2.0).unwrap();

        tree.reset_io_access_count();
        tree.knn_query(5, 3).unwrap();
        tree.range_query(5, 2.0).unwrap();
        assert_eq!(tree.io_access_count(), 0);
    }

    #[test]
    fn tiny_cache_forces_page_accesses() {
        let metric = ManhattanDistance::new(line_points(10));
        let tree = MTree::in_memory_with_capacities(3, 3, 2, Box::new(metric)).unwrap();
        tree.insert_many(&(0..10).collect::<Vec<_>>()).unwrap();

        tree.reset_io_access_count();
        tree.range_query(5, 9.0).unwrap();
        assert!(tree.io_access_count() > 0);
    }

    #[test]
    fn persisted_tree_answers_the_same_queries_after_reopen() {
        init_logging();
        let dir = tempdir().unwrap();
        let path = dir.path().join("points.mtree");
        let mut rng = StdRng::seed_from_u64(2024);
        let points = random_points(&mut rng, 1000);
        let queries: Vec<ObjectId> = (0..1000).step_by(100).collect();

        let expected: Vec<Vec<(ObjectId, f64)>>;
        {
            let metric = EuclideanDistance::new(points.clone());
            let tree = MTree::create(&path, 1024, 64, Box::new(metric)).unwrap();
            for id in 0..1000 {
                tree.insert(id).unwrap();
            }
            expected = queries
                .iter()
                .map(|&q| tree.range_query(q, 0.2).unwrap())
                .collect();
            tree.close().unwrap();
        }

        let metric = EuclideanDistance::new(points);
        let tree = MTree::open(&path, 64, Box::new(metric)).unwrap();
        for (&query, expect) in queries.iter().zip(&expected) {
            assert_eq!(&tree.range_query(query, 0.2).unwrap(), expect);
        }
        tree.check_invariants().unwrap();
        tree.close().unwrap();
    }

    #[test]
    fn knn_with_more_neighbors_than_objects_returns_everything() {
        let metric = ManhattanDistance::new(line_points(3));
        let tree = MTree::in_memory_with_capacities(3, 3, 16, Box::new(metric)).unwrap();
        tree.insert_many(&[0, 1, 2]).unwrap();
        let result = tree.knn_query(0, 10).unwrap();
        assert_eq!(result, vec![(0, 0.0), (1, 1.0), (2, 2.0)]);
    }

    #[test]
    fn queries_on_an_empty_tree_return_nothing() {
        let metric = ManhattanDistance::new(line_points(1));
        let tree = MTree::in_memory(1024, 16, Box::new(metric)).unwrap();
        assert!(tree.range_query(0, 5.0).unwrap().is_empty());
        assert!(tree.knn_query(0, 3).unwrap().is_empty());
        assert_eq!(tree.height().unwrap(), 0);
    }

    #[test]
    fn zero_k_is_rejected() {
        let tree = small_line_tree();
        assert!(matches!(
            tree.knn_query(5, 0),
            Err(MTreeError::Argument(_))
        ));
        assert!(matches!(
            tree.batch_knn(&[5], 0),
            Err(MTreeError::Argument(_))
        ));
    }

    #[test]
    fn negative_radius_is_rejected() {
        let tree = small_line_tree();
        assert!(matches!(
            tree.range_query(5, -1.0),
            Err(MTreeError::Argument(_))
        ));
    }

    #[test]
    fn delete_and_reverse_knn_are_unsupported() {
        let tree = small_line_tree();
        assert!(matches!(tree.delete(5), Err(MTreeError::Unsupported(_))));
        assert!(matches!(
            tree.reverse_knn_query(5, 3),
            Err(MTreeError::Unsupported(_))
        ));
    }

    #[test]
    fn operations_fail_after_close() {
        let tree = small_line_tree();
        tree.close().unwrap();
        assert!(matches!(tree.insert(99), Err(MTreeError::Closed)));
        assert!(matches!(tree.knn_query(5, 3), Err(MTreeError::Closed)));
        assert!(matches!(tree.range_query(5, 1.0), Err(MTreeError::Closed)));
        // Closing twice is fine.
        tree.close().unwrap();
    }

    #[test]
    fn open_rejects_foreign_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("not-a-tree");
        std::fs::write(&path, vec![0x5Au8; 4096]).unwrap();
        let metric = ManhattanDistance::new(line_points(1));
        assert!(MTree::open(&path, 16, Box::new(metric)).is_err());
    }

    #[test]
    fn degenerate_configurations_are_rejected() {
        init_logging();
        let metric = || Box::new(ManhattanDistance::new(line_points(1)));
        assert!(matches!(
            MTree::in_memory_with_capacities(1, 3, 16, metric()),
            Err(MTreeError::Configuration(_))
        ));
        assert!(matches!(
            MTree::in_memory(16, 16, metric()),
            Err(MTreeError::Configuration(_))
        ));
        assert!(matches!(
            MTree::in_memory_with_capacities(3, 3, 0, metric()),
            Err(MTreeError::Configuration(_))
        ));
    }

    #[test]
    fn duplicate_objects_split_without_losing_entries() {
        init_logging();
        // Twenty copies of the same point exercise the coincident-split repair.
        let metric = ManhattanDistance::new(vec![vec![1.0]; 20]);
        let tree = MTree::in_memory_with_capacities(3, 3, 64, Box::new(metric)).unwrap();
        for id in 0..20 {
            tree.insert(id).unwrap();
        }
        tree.check_invariants().unwrap();
        let result = tree.range_query(0, 0.0).unwrap();
        assert_eq!(result.len(), 20);
    }
}
