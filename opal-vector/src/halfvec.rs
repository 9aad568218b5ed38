//! Half-precision input vectors.
//!
//! `HalfVector` halves the storage of embedding inputs at the cost of
//! precision. The indexes operate on float32 [`Vector`]s; this type is a
//! boundary convenience with checked narrowing.

use std::fmt;
use std::str::FromStr;

use half::f16;
use opal_core::types::MAX_DIM;
use opal_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::vector::Vector;

/// A finite f16 vector of dimension `1..=16000`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HalfVector {
    data: Vec<f16>,
}

impl HalfVector {
    pub fn new(data: Vec<f16>) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::BadInput(
                "halfvec must have at least 1 dimension".into(),
            ));
        }
        if data.len() > MAX_DIM {
            return Err(Error::BadInput(format!(
                "halfvec cannot have more than {MAX_DIM} dimensions"
            )));
        }
        if data.iter().any(|x| !x.is_finite()) {
            return Err(Error::BadInput(
                "NaN and infinity not allowed in halfvec".into(),
            ));
        }
        Ok(Self { data })
    }

    /// Narrowing conversion; finite f32 values past the f16 range
    /// overflow to infinity and are rejected.
    pub fn from_f32_slice(values: &[f32]) -> Result<Self> {
        let mut data = Vec::with_capacity(values.len());
        for &x in values {
            let h = f16::from_f32(x);
            if x.is_finite() && !h.is_finite() {
                return Err(Error::Overflow(format!(
                    "value out of range for halfvec: {x}"
                )));
            }
            data.push(h);
        }
        Self::new(data)
    }

    pub fn dims(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[f16] {
        &self.data
    }

    /// Widening conversion; always exact.
    pub fn to_vector(&self) -> Result<Vector> {
        Vector::new(self.data.iter().map(|x| x.to_f32()).collect())
    }
}

impl TryFrom<&Vector> for HalfVector {
    type Error = Error;

    fn try_from(v: &Vector) -> Result<Self> {
        Self::from_f32_slice(v.as_slice())
    }
}

impl fmt::Display for HalfVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, x) in self.data.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", x.to_f32())?;
        }
        write!(f, "]")
    }
}

impl FromStr for HalfVector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wide: Vector = s.parse()?;
        Self::from_f32_slice(wide.as_slice())
    }
}
