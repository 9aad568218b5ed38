use std::cmp::Ordering;

use crate::{Error, Result};

/// Identifier of a heap tuple, assigned and interpreted by the host.
/// The index stores tuple ids verbatim and never dereferences them.
pub type TupleId = u64;

/// Maximum dimension of a vector value.
pub const MAX_DIM: usize = 16_000;

/// Maximum dimension accepted by the index access methods.
pub const MAX_INDEXED_DIM: usize = 2_000;

/// Dimension check applied when an index is created.
pub fn check_indexed_dim(dim: usize) -> Result<()> {
    if dim == 0 {
        return Err(Error::BadInput(
            "vector must have at least 1 dimension".into(),
        ));
    }
    if dim > MAX_INDEXED_DIM {
        return Err(Error::Unsupported(format!(
            "cannot index vectors with more than {MAX_INDEXED_DIM} dimensions"
        )));
    }
    Ok(())
}

/// One result of an index scan. The distance is the operator's reported
/// value; tuple visibility is re-checked by the host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub tuple: TupleId,
    pub distance: f32,
}

impl SearchHit {
    /// Ascending distance, NaN after every finite value so zero-norm
    /// cosine rows land in the unordered tail.
    pub fn cmp_by_distance(a: &SearchHit, b: &SearchHit) -> Ordering {
        match (a.distance.is_nan(), b.distance.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => a
                .distance
                .partial_cmp(&b.distance)
                .unwrap_or(Ordering::Equal),
        }
    }
}

/// Distance-ordered stream of scan results.
#[derive(Debug)]
pub struct OrderedHits {
    inner: std::vec::IntoIter<SearchHit>,
}

impl OrderedHits {
    pub fn from_unsorted(mut hits: Vec<SearchHit>) -> Self {
        hits.sort_unstable_by(SearchHit::cmp_by_distance);
        Self {
            inner: hits.into_iter(),
        }
    }

    pub fn empty() -> Self {
        Self {
            inner: Vec::new().into_iter(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }
}

impl Iterator for OrderedHits {
    type Item = SearchHit;

    fn next(&mut self) -> Option<SearchHit> {
        self.inner.next()
    }
}
