//! Opal Vector Module
//!
//! The vector value type and its distance arithmetic:
//! - [`Vector`]: variable-length float32 vector with text and binary wire
//!   forms, element-wise arithmetic and validated construction
//! - [`DistanceKind`] and the scalar kernels it dispatches to
//! - [`HalfVector`]: f16 input type with checked widening/narrowing
//! - [`VectorAggregate`]: running `sum` / `avg` accumulator
//!
//! Kernels operate on contiguous `&[f32]` slices with branch-free inner
//! loops so the auto-vectorizer can emit fused multiply-adds.

pub mod aggregate;
pub mod distance;
pub mod halfvec;
pub mod vector;

pub use aggregate::VectorAggregate;
pub use distance::{
    DistanceKind, OrderedDistance, cosine_distance, inner_product, l1_distance, l2_distance,
    l2_norm, l2_squared_distance,
};
pub use halfvec::HalfVector;
pub use vector::Vector;
