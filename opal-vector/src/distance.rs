//! Distance kernels and their dispatch.
//!
//! The slice kernels assume equal-length operands (validated where vectors
//! enter the system) and keep their inner loops branch-free over
//! contiguous storage, so the auto-vectorizer can emit fused
//! multiply-adds. Index hot paths dispatch through [`DistanceKind`] by
//! `match`, keeping the loops monomorphic.

use opal_core::Result;
use serde::{Deserialize, Serialize};

use crate::vector::Vector;

/// Distance orderings the access methods support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceKind {
    /// Euclidean distance. Index-internal comparisons use the squared
    /// form, which is monotone and skips the square root in the hot path.
    L2,
    /// Negative inner product, so ascending order is most-similar-first.
    InnerProduct,
    /// `1 - cos(a, b)`; NaN when either operand has zero norm.
    Cosine,
}

impl DistanceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceKind::L2 => "l2",
            DistanceKind::InnerProduct => "ip",
            DistanceKind::Cosine => "cosine",
        }
    }

    /// The value the operator reports to the host.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceKind::L2 => l2_squared(a, b).sqrt(),
            DistanceKind::InnerProduct => -dot(a, b),
            DistanceKind::Cosine => cosine(a, b),
        }
    }

    /// Monotone-equivalent form used for index-internal comparisons.
    pub fn comparison_distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceKind::L2 => l2_squared(a, b),
            DistanceKind::InnerProduct => -dot(a, b),
            DistanceKind::Cosine => cosine(a, b),
        }
    }

    /// Maps a comparison distance back to the reported distance.
    pub fn from_comparison(&self, d: f32) -> f32 {
        match self {
            DistanceKind::L2 => d.sqrt(),
            DistanceKind::InnerProduct | DistanceKind::Cosine => d,
        }
    }
}

/// `sqrt(sum((a_i - b_i)^2))`.
pub fn l2_distance(a: &Vector, b: &Vector) -> Result<f32> {
    a.check_dims(b)?;
    Ok(l2_squared(a.as_slice(), b.as_slice()).sqrt())
}

/// Squared Euclidean distance; monotone-equivalent to [`l2_distance`].
pub fn l2_squared_distance(a: &Vector, b: &Vector) -> Result<f32> {
    a.check_dims(b)?;
    Ok(l2_squared(a.as_slice(), b.as_slice()))
}

/// `sum(a_i * b_i)`.
pub fn inner_product(a: &Vector, b: &Vector) -> Result<f32> {
    a.check_dims(b)?;
    Ok(dot(a.as_slice(), b.as_slice()))
}

/// `1 - cos(a, b)`; NaN when either operand has zero norm.
pub fn cosine_distance(a: &Vector, b: &Vector) -> Result<f32> {
    a.check_dims(b)?;
    Ok(cosine(a.as_slice(), b.as_slice()))
}

/// `sum(|a_i - b_i|)`. No index support; function form only.
pub fn l1_distance(a: &Vector, b: &Vector) -> Result<f32> {
    a.check_dims(b)?;
    Ok(l1(a.as_slice(), b.as_slice()))
}

/// L2 norm of a slice.
#[inline]
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

#[inline]
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Single-pass fused accumulation of `dot`, `|a|^2` and `|b|^2`.
#[inline]
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let (d, na, nb) = a.iter().zip(b.iter()).fold(
        (0.0f32, 0.0f32, 0.0f32),
        |(d, na, nb), (x, y)| (d + x * y, na + x * x, nb + y * y),
    );
    // 0/0 yields the NaN the zero-vector contract calls for; the clamp
    // absorbs float32 rounding past +/-1 and passes NaN through.
    let sim = (d / (na.sqrt() * nb.sqrt())).clamp(-1.0, 1.0);
    1.0 - sim
}

#[inline]
pub fn l1(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum()
}

/// Total-ordered distance for priority queues: NaN sorts after every
/// finite distance, so zero-norm cosine rows fall to the tail.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderedDistance(pub f32);

impl Eq for OrderedDistance {}

impl PartialOrd for OrderedDistance {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedDistance {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (self.0.is_nan(), other.0.is_nan()) {
            (true, true) => std::cmp::Ordering::Equal,
            (true, false) => std::cmp::Ordering::Greater,
            (false, true) => std::cmp::Ordering::Less,
            (false, false) => self
                .0
                .partial_cmp(&other.0)
                .unwrap_or(std::cmp::Ordering::Equal),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f32 = 1e-6;

    fn approx_eq(a: f32, b: f32) -> bool {
        (a - b).abs() < EPSILON
    }

    fn vec3(x: f32, y: f32, z: f32) -> Vector {
        Vector::new(vec![x, y, z]).unwrap()
    }

    #[test]
    fn l2_three_four_five() {
        let a = vec3(0.0, 0.0, 0.0);
        let b = vec3(3.0, 4.0, 0.0);
        assert!(approx_eq(l2_distance(&a, &b).unwrap(), 5.0));
        assert!(approx_eq(l2_squared_distance(&a, &b).unwrap(), 25.0));
    }

    #[test]
    fn dot_product() {
        let a = vec3(1.0, 2.0, 3.0);
        let b = vec3(4.0, 5.0, 6.0);
        assert!(approx_eq(inner_product(&a, &b).unwrap(), 32.0));
    }

    #[test]
    fn cosine_orthogonal_and_identical() {
        let x = vec3(1.0, 0.0, 0.0);
        let y = vec3(0.0, 1.0, 0.0);
        assert!(approx_eq(cosine_distance(&x, &y).unwrap(), 1.0));
        assert!(approx_eq(cosine_distance(&x, &x).unwrap(), 0.0));

        let opposite = vec3(-1.0, 0.0, 0.0);
        assert!(approx_eq(cosine_distance(&x, &opposite).unwrap(), 2.0));
    }

    #[test]
    fn cosine_zero_vector_is_nan() {
        let zero = vec3(0.0, 0.0, 0.0);
        let v = vec3(1.0, 2.0, 3.0);
        assert!(cosine_distance(&zero, &v).unwrap().is_nan());
        assert!(cosine_distance(&zero, &zero).unwrap().is_nan());
    }

    #[test]
    fn l1_sum_of_abs() {
        let a = vec3(1.0, -2.0, 3.0);
        let b = vec3(-1.0, 2.0, 3.0);
        assert!(approx_eq(l1_distance(&a, &b).unwrap(), 6.0));
    }

    #[test]
    fn mismatched_dims_rejected() {
        let a = Vector::new(vec![1.0, 2.0]).unwrap();
        let b = Vector::new(vec![1.0]).unwrap();
        assert!(l2_distance(&a, &b).is_err());
        assert!(inner_product(&a, &b).is_err());
        assert!(cosine_distance(&a, &b).is_err());
        assert!(l1_distance(&a, &b).is_err());
    }

    #[test]
    fn inner_product_ordering_is_negated() {
        let q = [1.0, 1.0];
        let close = [2.0, 2.0];
        let far = [0.1, 0.0];
        let d_close = DistanceKind::InnerProduct.distance(&q, &close);
        let d_far = DistanceKind::InnerProduct.distance(&q, &far);
        assert!(d_close < d_far);
    }

    #[test]
    fn comparison_distance_is_monotone() {
        let q = [0.0, 0.0];
        let near = [1.0, 1.0];
        let far = [3.0, 4.0];
        let kind = DistanceKind::L2;
        assert!(kind.comparison_distance(&q, &near) < kind.comparison_distance(&q, &far));
        assert!(approx_eq(
            kind.from_comparison(kind.comparison_distance(&q, &far)),
            5.0
        ));
    }

    #[test]
    fn nan_sorts_last() {
        let mut distances = vec![
            OrderedDistance(f32::NAN),
            OrderedDistance(2.0),
            OrderedDistance(0.5),
        ];
        distances.sort();
        assert_eq!(distances[0].0, 0.5);
        assert_eq!(distances[1].0, 2.0);
        assert!(distances[2].0.is_nan());
    }
}
