//! Priority structures driving the nearest-neighbor searches.
//!
//! The kNN descent keeps two heaps: a min-heap of subtrees still to visit,
//! ordered by the smallest distance any of their objects could have to the
//! query, and a bounded max-heap holding the k closest objects seen so far.
//! The head of the second heap is the pruning bound: once the best pending
//! subtree cannot beat it, the search stops.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::mtree_types::{ObjectId, PageId};

// ============================================================================
// Pending Subtrees
// ============================================================================

/// A subtree awaiting a visit during a kNN descent. Ordered by lower bound;
/// wrap in [`std::cmp::Reverse`] for a min-heap.
#[derive(Debug, Clone, Copy)]
pub struct PendingSubtree {
    /// Smallest possible distance from the query to any object in the subtree.
    pub lower_bound: f64,
    pub node_id: PageId,
    /// Distance from the subtree's routing object to the query; the null
    /// distance at the root.
    pub routing_distance: f64,
}

impl PartialEq for PendingSubtree {
    fn eq(&self, other: &Self) -> bool {
        self.lower_bound == other.lower_bound && self.node_id == other.node_id
    }
}

impl Eq for PendingSubtree {}

impl Ord for PendingSubtree {
    fn cmp(&self, other: &Self) -> Ordering {
        self.lower_bound
            .total_cmp(&other.lower_bound)
            .then_with(|| self.node_id.cmp(&other.node_id))
    }
}

impl PartialOrd for PendingSubtree {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ============================================================================
// k-Smallest Accumulator
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct KnnCandidate {
    distance: f64,
    /// Discovery sequence; later discoveries at equal distance are evicted
    /// first so result order stays stable.
    seq: u64,
    object_id: ObjectId,
}

impl PartialEq for KnnCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance && self.seq == other.seq
    }
}

impl Eq for KnnCandidate {}

impl Ord for KnnCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for KnnCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Keeps the k smallest `(object, distance)` pairs admitted so far. Backed by
/// a max-heap capped at k: admission is O(log k) and the kth distance - the
/// pruning bound - is an O(1) peek. The bound is infinite until k objects
/// have been admitted.
#[derive(Debug)]
pub struct KnnList {
    heap: BinaryHeap<KnnCandidate>,
    k: usize,
    seq: u64,
}

impl KnnList {
    pub fn new(k: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(k + 1),
            k,
            seq: 0,
        }
    }

    /// The distance of the kth-closest object admitted so far, or the
    /// infinite distance while fewer than k objects are known.
    pub fn kth_distance(&self) -> f64 {
        if self.heap.len() < self.k {
            f64::INFINITY
        } else {
            self.heap.peek().map_or(f64::INFINITY, |c| c.distance)
        }
    }

    /// Admits an object; if that pushes the list past k entries, the farthest
    /// one falls out.
    pub fn admit(&mut self, object_id: ObjectId, distance: f64) {
        self.heap.push(KnnCandidate {
            distance,
            seq: self.seq,
            object_id,
        });
        self.seq += 1;
        while self.heap.len() > self.k {
            self.heap.pop();
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Unpacks the accumulator into pairs ascending by distance, ties in
    /// discovery order.
    pub fn into_sorted_vec(self) -> Vec<(ObjectId, f64)> {
        let mut candidates = self.heap.into_vec();
        candidates.sort_unstable();
        candidates
            .into_iter()
            .map(|c| (c.object_id, c.distance))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Reverse;

    #[test]
    fn unpacking_has_ascending_order() {
        let mut knn = KnnList::new(4);
        for (object_id, distance) in [(2, 0.2), (4, 0.4), (1, 0.1), (3, 0.3)] {
            knn.admit(object_id, distance);
        }
        let result = knn.into_sorted_vec();
        let ids: Vec<ObjectId> = result.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn kth_distance_is_infinite_until_full() {
        let mut knn = KnnList::new(3);
        assert_eq!(knn.kth_distance(), f64::INFINITY);
        knn.admit(1, 1.0);
        knn.admit(2, 2.0);
        assert_eq!(knn.kth_distance(), f64::INFINITY);
        knn.admit(3, 3.0);
        assert_eq!(knn.kth_distance(), 3.0);
    }

    #[test]
    fn admission_beyond_k_drops_the_farthest() {
        let mut knn = KnnList::new(2);
        knn.admit(1, 5.0);
        knn.admit(2, 1.0);
        knn.admit(3, 3.0);
        assert_eq!(knn.kth_distance(), 3.0);
        assert_eq!(knn.into_sorted_vec(), vec![(2, 1.0), (3, 3.0)]);
    }

    #[test]
    fn equal_distances_keep_discovery_order() {
        let mut knn = KnnList::new(2);
        knn.admit(10, 1.0);
        knn.admit(11, 1.0);
        knn.admit(12, 1.0);
        // The latest equal-distance discovery is the one that falls out.
        assert_eq!(knn.into_sorted_vec(), vec![(10, 1.0), (11, 1.0)]);
    }

    #[test]
    fn pending_subtrees_pop_smallest_bound_first() {
        let mut pending = BinaryHeap::new();
        for (lower_bound, node_id) in [(2.0, 1), (0.5, 2), (1.0, 3)] {
            pending.push(Reverse(PendingSubtree {
                lower_bound,
                node_id,
                routing_distance: 0.0,
            }));
        }
        let order: Vec<PageId> = std::iter::from_fn(|| pending.pop().map(|Reverse(s)| s.node_id))
            .collect();
        assert_eq!(order, vec![2, 3, 1]);
    }
}
