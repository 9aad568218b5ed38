//! Running `sum` / `avg` aggregate state.

use opal_core::{Error, Result};

use crate::vector::Vector;

/// Transition state for the `sum(vector)` and `avg(vector)` aggregates:
/// one float32 accumulator per element plus an integer count.
#[derive(Debug, Clone, Default)]
pub struct VectorAggregate {
    count: u64,
    sums: Vec<f32>,
}

impl VectorAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn accumulate(&mut self, v: &Vector) -> Result<()> {
        if self.count == 0 {
            self.sums = v.as_slice().to_vec();
            self.count = 1;
            return Ok(());
        }
        if self.sums.len() != v.dims() {
            return Err(Error::DimensionMismatch {
                expected: self.sums.len(),
                actual: v.dims(),
            });
        }
        for (acc, x) in self.sums.iter_mut().zip(v.as_slice()) {
            *acc += x;
        }
        self.count += 1;
        Ok(())
    }

    fn checked_sums(&self) -> Result<&[f32]> {
        if self.sums.iter().any(|x| !x.is_finite()) {
            return Err(Error::Overflow("value out of range: overflow".into()));
        }
        Ok(&self.sums)
    }

    /// Final `sum`; `None` over an empty input.
    pub fn sum(&self) -> Result<Option<Vector>> {
        if self.count == 0 {
            return Ok(None);
        }
        Ok(Some(Vector::new(self.checked_sums()?.to_vec())?))
    }

    /// Final `avg`; `None` over an empty input.
    pub fn avg(&self) -> Result<Option<Vector>> {
        if self.count == 0 {
            return Ok(None);
        }
        let n = self.count as f32;
        let avg = self.checked_sums()?.iter().map(|x| x / n).collect();
        Ok(Some(Vector::new(avg)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avg_and_sum() {
        let mut agg = VectorAggregate::new();
        agg.accumulate(&Vector::new(vec![1.0, 2.0]).unwrap()).unwrap();
        agg.accumulate(&Vector::new(vec![3.0, 6.0]).unwrap()).unwrap();

        assert_eq!(agg.sum().unwrap().unwrap().as_slice(), &[4.0, 8.0]);
        assert_eq!(agg.avg().unwrap().unwrap().as_slice(), &[2.0, 4.0]);
    }

    #[test]
    fn empty_input_yields_none() {
        let agg = VectorAggregate::new();
        assert!(agg.sum().unwrap().is_none());
        assert!(agg.avg().unwrap().is_none());
    }

    #[test]
    fn dimension_mismatch_rejected() {
        let mut agg = VectorAggregate::new();
        agg.accumulate(&Vector::new(vec![1.0, 2.0]).unwrap()).unwrap();
        let narrow = Vector::new(vec![1.0]).unwrap();
        assert!(matches!(
            agg.accumulate(&narrow),
            Err(Error::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn accumulator_overflow_detected() {
        let mut agg = VectorAggregate::new();
        let big = Vector::new(vec![f32::MAX]).unwrap();
        agg.accumulate(&big).unwrap();
        agg.accumulate(&big).unwrap();
        assert!(matches!(agg.avg(), Err(Error::Overflow(_))));
        assert!(matches!(agg.sum(), Err(Error::Overflow(_))));
    }
}
