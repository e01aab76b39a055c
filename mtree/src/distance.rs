//! Distance functions over object ids.
//!
//! The tree consumes the metric space exclusively through the
//! [`DistanceFunction`] trait: it never sees object payloads, only ids.
//! Implementations must be symmetric, non-negative, and satisfy the triangle
//! inequality - every pruning decision in the tree depends on it.

use crate::tree::{MTreeError, MTreeResult, ObjectId};

/// The metric consumed by the tree. Distance values are `f64`: zero is the
/// null distance, `f64::INFINITY` the top element, and lower bounds clamp
/// subtraction at zero.
pub trait DistanceFunction: Send + Sync {
    /// The distance between two objects. Must be symmetric, non-negative,
    /// and obey the triangle inequality.
    fn distance(&self, a: ObjectId, b: ObjectId) -> f64;

    /// The additive identity of the metric.
    fn null_distance(&self) -> f64 {
        0.0
    }

    /// The top element of the metric: farther than every real distance.
    fn infinite_distance(&self) -> f64 {
        f64::INFINITY
    }

    /// Parses a distance value from text, for query radii given as strings.
    fn parse_distance(&self, text: &str) -> MTreeResult<f64> {
        text.trim()
            .parse::<f64>()
            .map_err(|e| MTreeError::Argument(format!("invalid distance '{}': {}", text, e)))
    }

    /// Bytes one distance value occupies on a page.
    fn serialized_size(&self) -> usize {
        8
    }
}

/// L1 distance between points held in a table indexed by object id. Ids
/// outside the table are infinitely far from everything.
pub struct ManhattanDistance {
    points: Vec<Vec<f64>>,
}

impl ManhattanDistance {
    pub fn new(points: Vec<Vec<f64>>) -> Self {
        Self { points }
    }
}

impl DistanceFunction for ManhattanDistance {
    fn distance(&self, a: ObjectId, b: ObjectId) -> f64 {
        match (self.points.get(a as usize), self.points.get(b as usize)) {
            (Some(pa), Some(pb)) => pa.iter().zip(pb).map(|(x, y)| (x - y).abs()).sum(),
            _ => self.infinite_distance(),
        }
    }
}

/// L2 distance between points held in a table indexed by object id.
pub struct EuclideanDistance {
    points: Vec<Vec<f64>>,
}

impl EuclideanDistance {
    pub fn new(points: Vec<Vec<f64>>) -> Self {
        Self { points }
    }
}

impl DistanceFunction for EuclideanDistance {
    fn distance(&self, a: ObjectId, b: ObjectId) -> f64 {
        match (self.points.get(a as usize), self.points.get(b as usize)) {
            (Some(pa), Some(pb)) => pa
                .iter()
                .zip(pb)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f64>()
                .sqrt(),
            _ => self.infinite_distance(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manhattan_distance_values() {
        let metric = ManhattanDistance::new(vec![vec![0.0, 0.0], vec![3.0, 4.0]]);
        assert_eq!(metric.distance(0, 1), 7.0);
        assert_eq!(metric.distance(1, 0), 7.0);
        assert_eq!(metric.distance(0, 0), 0.0);
    }

    #[test]
    fn euclidean_distance_values() {
        let metric = EuclideanDistance::new(vec![vec![0.0, 0.0], vec![3.0, 4.0]]);
        assert_eq!(metric.distance(0, 1), 5.0);
        assert_eq!(metric.distance(1, 1), 0.0);
    }

    #[test]
    fn unknown_ids_are_infinitely_far() {
        let metric = EuclideanDistance::new(vec![vec![0.0]]);
        assert_eq!(metric.distance(0, 99), f64::INFINITY);
    }

    #[test]
    fn parse_distance_accepts_numbers_and_rejects_garbage() {
        let metric = ManhattanDistance::new(Vec::new());
        assert_eq!(metric.parse_distance(" 2.5 ").unwrap(), 2.5);
        assert!(matches!(
            metric.parse_distance("two"),
            Err(MTreeError::Argument(_))
        ));
    }
}
