//! In-memory approximate nearest-neighbour index over record embeddings.
//!
//! Entries are partitioned into shards by id hash. Inside a shard, entries
//! live in inverted lists keyed by the nearest k-means centroid (IVF). Every
//! list tracks the largest angle between its centroid and any member, which
//! gives an upper bound on the cosine score a query can reach in that list.
//! Search visits lists in descending bound order and stops as soon as no
//! unvisited list can beat the current top-k.
//!
//! Readers always see one immutable [`Generation`]. Writers build modified
//! shards copy-on-write, validate them and publish a new generation with a
//! single pointer swap.

pub mod filter;
pub mod kmeans;
pub mod vector_index;

pub use filter::{FieldFilter, FilterCondition, SearchFilter};
pub use vector_index::{Generation, IndexEntry, IndexOp, SearchHit, VectorIndex};

pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Unit-length copy of `vector`, or `None` for a zero vector.
pub(crate) fn normalized(vector: &[f32]) -> Option<Vec<f32>> {
    let norm = dot(vector, vector).sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return None;
    }
    Some(vector.iter().map(|x| x / norm).collect())
}

/// Angle in radians between two unit vectors.
pub(crate) fn angle(a: &[f32], b: &[f32]) -> f32 {
    dot(a, b).clamp(-1.0, 1.0).acos()
}
