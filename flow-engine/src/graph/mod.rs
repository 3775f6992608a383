// Task graph
// Concrete node instantiation, strategy expansion, dataflow edges

pub mod builder;
pub mod matrix;
pub mod node;
pub mod patterns;

pub use builder::GraphBuilder;
pub use matrix::{combination_suffix, expand_matrix};
pub use node::{NodeId, NodeKind, NodeStatus, TaskGraph, TaskNode};
pub use patterns::{accepts_shape, consumes_match, pattern_matches};
