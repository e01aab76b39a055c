//! # mtree - Paginated Metric Tree Index
//!
//! This crate provides a balanced, dynamic index over arbitrary metric
//! spaces, answering range and k-nearest-neighbor queries with
//! triangle-inequality pruning.
//!
//! ## Features
//!
//! - **Metric-Space Generic**: only a distance function is required; no
//!   vector coordinates are assumed
//! - **Disk-Based Storage**: fixed-size node pages, loaded on demand
//! - **LRU Cache**: frequently accessed pages kept in memory, dirty pages
//!   written back on eviction
//! - **Persistent**: file-backed trees survive process restarts
//! - **Observable**: a physical I/O-access counter for benchmarking
//! - **Batched Queries**: one descent answers kNN for many queries at once
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mtree::{EuclideanDistance, MTree};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let points = vec![vec![0.0, 0.0], vec![1.0, 1.0], vec![5.0, 5.0]];
//! let metric = EuclideanDistance::new(points);
//!
//! let tree = MTree::in_memory(4096, 256, Box::new(metric))?;
//! tree.insert_many(&[0, 1, 2])?;
//!
//! // The three nearest objects to object 0.
//! let nearest = tree.knn_query(0, 3)?;
//!
//! // Everything within distance 2 of object 1.
//! let close_by = tree.range_query(1, 2.0)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Persistence
//!
//! ```rust,no_run
//! use mtree::{EuclideanDistance, MTree};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let points = vec![vec![0.0]];
//! let tree = MTree::create("points.mtree", 4096, 256,
//!     Box::new(EuclideanDistance::new(points.clone())))?;
//! tree.insert(0)?;
//! tree.close()?;
//!
//! let tree = MTree::open("points.mtree", 256,
//!     Box::new(EuclideanDistance::new(points)))?;
//! # Ok(())
//! # }
//! ```

pub mod distance;
pub mod tree;

pub use distance::{DistanceFunction, EuclideanDistance, ManhattanDistance};
pub use tree::{MTree, MTreeError, MTreeResult, ObjectId};
