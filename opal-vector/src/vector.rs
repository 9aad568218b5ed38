//! The float32 vector value type.

use std::fmt;
use std::str::FromStr;

use opal_core::types::MAX_DIM;
use opal_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// A finite float32 vector of dimension `1..=16000`.
///
/// Construction validates dimension bounds and rejects NaN and infinities;
/// every value reachable through the public API is finite. Elements are
/// stored contiguously so the distance kernels see one cache-friendly
/// slice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vector {
    data: Vec<f32>,
}

impl Vector {
    pub fn new(data: Vec<f32>) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::BadInput(
                "vector must have at least 1 dimension".into(),
            ));
        }
        if data.len() > MAX_DIM {
            return Err(Error::BadInput(format!(
                "vector cannot have more than {MAX_DIM} dimensions"
            )));
        }
        if data.iter().any(|x| !x.is_finite()) {
            return Err(Error::BadInput(
                "NaN and infinity not allowed in vector".into(),
            ));
        }
        Ok(Self { data })
    }

    pub fn dims(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn check_dims(&self, other: &Vector) -> Result<()> {
        if self.dims() != other.dims() {
            return Err(Error::DimensionMismatch {
                expected: self.dims(),
                actual: other.dims(),
            });
        }
        Ok(())
    }

    /// L2 norm.
    pub fn norm(&self) -> f32 {
        crate::distance::l2_norm(&self.data)
    }

    /// Unit-norm copy for cosine indexing; `None` when the norm is zero.
    pub fn cosine_normalized(&self) -> Option<Vector> {
        let norm = self.norm();
        if norm == 0.0 {
            return None;
        }
        let data = self.data.iter().map(|x| x / norm).collect();
        // Elements stay finite: |x| <= norm, so each quotient is in [-1, 1].
        Some(Vector { data })
    }

    pub fn add(&self, other: &Vector) -> Result<Vector> {
        self.zip_with(other, |x, y| x + y)
    }

    pub fn sub(&self, other: &Vector) -> Result<Vector> {
        self.zip_with(other, |x, y| x - y)
    }

    pub fn mul(&self, other: &Vector) -> Result<Vector> {
        self.zip_with(other, |x, y| x * y)
    }

    fn zip_with(&self, other: &Vector, op: impl Fn(f32, f32) -> f32) -> Result<Vector> {
        self.check_dims(other)?;
        let data: Vec<f32> = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(x, y)| op(*x, *y))
            .collect();
        if data.iter().any(|x| x.is_infinite()) {
            return Err(Error::Overflow("value out of range: overflow".into()));
        }
        Ok(Vector { data })
    }

    /// Binary wire form: `u16` dimension, `u16` reserved (zero), then the
    /// elements as little-endian float32.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.data.len() * 4);
        bytes.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        for x in &self.data {
            bytes.extend_from_slice(&x.to_le_bytes());
        }
        bytes
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(Error::BadInput("truncated vector data".into()));
        }
        let dim = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        let reserved = u16::from_le_bytes([bytes[2], bytes[3]]);
        if reserved != 0 {
            return Err(Error::BadInput("expected reserved vector bytes to be 0".into()));
        }
        if bytes.len() != 4 + dim * 4 {
            return Err(Error::BadInput(format!(
                "vector data length {} does not match dimension {dim}",
                bytes.len()
            )));
        }
        let data = bytes[4..]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Vector::new(data)
    }
}

/// Equality is bitwise over elements; `0.0` and `-0.0` are distinct.
impl PartialEq for Vector {
    fn eq(&self, other: &Self) -> bool {
        self.data.len() == other.data.len()
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(x, y)| x.to_bits() == y.to_bits())
    }
}

impl Eq for Vector {}

impl TryFrom<Vec<f32>> for Vector {
    type Error = Error;

    fn try_from(data: Vec<f32>) -> Result<Self> {
        Vector::new(data)
    }
}

impl AsRef<[f32]> for Vector {
    fn as_ref(&self) -> &[f32] {
        &self.data
    }
}

impl fmt::Display for Vector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, x) in self.data.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{x}")?;
        }
        write!(f, "]")
    }
}

impl FromStr for Vector {
    type Err = Error;

    /// Parses the text literal `[x1,x2,...,xd]`: ASCII decimal floats,
    /// comma-separated, optional whitespace, brackets mandatory.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let inner = trimmed
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(|| Error::BadInput(format!("malformed vector literal: {s:?}")))?;
        if inner.trim().is_empty() {
            return Err(Error::BadInput(
                "vector must have at least 1 dimension".into(),
            ));
        }
        let data = inner
            .split(',')
            .map(|token| {
                token
                    .trim()
                    .parse::<f32>()
                    .map_err(|_| Error::BadInput(format!("invalid vector element: {token:?}")))
            })
            .collect::<Result<Vec<f32>>>()?;
        Vector::new(data)
    }
}
