//! Boundary contracts with the host database.
//!
//! The host owns tuple storage, visibility and transactions. The index
//! crates see tuples only through [`TupleScan`], honor cancellation through
//! [`Interrupt`], and account build-time allocations against a
//! [`MemoryBudget`] supplied by the host.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::types::TupleId;
use crate::{Error, Result};

/// A restartable scan over the table being indexed.
///
/// `scan` may be called more than once per build (sampling pass plus
/// assignment pass); the host guarantees both passes observe the same
/// snapshot. Elements are raw `(tuple id, components)` pairs; the index
/// validates dimensions and finiteness at intake.
pub trait TupleScan: Sync {
    fn scan(&self) -> Box<dyn Iterator<Item = (TupleId, Vec<f32>)> + Send + '_>;

    /// Host estimate of the tuple count, used for progress totals.
    fn estimated_tuples(&self) -> Option<u64> {
        None
    }
}

/// In-memory scan source, used by tests and demos in place of a heap.
pub struct VecScan {
    tuples: Vec<(TupleId, Vec<f32>)>,
}

impl VecScan {
    pub fn new(tuples: Vec<(TupleId, Vec<f32>)>) -> Self {
        Self { tuples }
    }
}

impl TupleScan for VecScan {
    fn scan(&self) -> Box<dyn Iterator<Item = (TupleId, Vec<f32>)> + Send + '_> {
        Box::new(self.tuples.iter().cloned())
    }

    fn estimated_tuples(&self) -> Option<u64> {
        Some(self.tuples.len() as u64)
    }
}

/// Everything a bulk build borrows from the host: cancellation, progress
/// reporting, the maintenance-memory budget and the worker count.
pub struct BuildContext<'a> {
    pub interrupt: Interrupt,
    pub progress: &'a dyn crate::progress::ProgressSink,
    pub budget: &'a MemoryBudget,
    pub workers: usize,
}

impl<'a> BuildContext<'a> {
    pub fn new(
        interrupt: Interrupt,
        progress: &'a dyn crate::progress::ProgressSink,
        budget: &'a MemoryBudget,
        workers: usize,
    ) -> Self {
        Self {
            interrupt,
            progress,
            budget,
            workers: workers.max(1),
        }
    }
}

/// Cooperative cancellation flag, checked at safe points inside every
/// bounded loop. Cloning shares the underlying flag.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Loops unwind with [`Error::Interrupted`] at
    /// their next safe point, releasing pinned pages on the way out.
    pub fn set(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_set() {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Byte-accounted build memory budget ("maintenance memory").
///
/// Reservations are advisory bookkeeping: a refused reservation tells the
/// caller to fall back to its slower on-page path, never to fail the build.
#[derive(Debug)]
pub struct MemoryBudget {
    limit_bytes: usize,
    reserved: AtomicUsize,
}

impl MemoryBudget {
    pub fn new(limit_bytes: usize) -> Self {
        Self {
            limit_bytes,
            reserved: AtomicUsize::new(0),
        }
    }

    /// A budget that never refuses.
    pub fn unlimited() -> Self {
        Self::new(usize::MAX)
    }

    /// Try to reserve `bytes` more. Returns false when the reservation
    /// would exceed the limit, leaving the accounted total unchanged.
    pub fn try_reserve(&self, bytes: usize) -> bool {
        let mut current = self.reserved.load(Ordering::Relaxed);
        loop {
            let Some(next) = current.checked_add(bytes) else {
                return false;
            };
            if next > self.limit_bytes {
                return false;
            }
            match self.reserved.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> usize {
        self.limit_bytes
    }
}
