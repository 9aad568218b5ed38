//! Bulk graph construction.
//!
//! The leader hands the scan out in batches; workers run the ordinary
//! single-element insert path, coordinating through the per-neighbor-list
//! latches and the entry latch. A barrier gates finalization: only after
//! every worker has drained does the arena flush to pages and the
//! metadata get written.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};

use opal_core::host::{BuildContext, TupleScan};
use opal_core::progress::BuildPhase;
use opal_core::types::TupleId;
use opal_core::{Error, Result};
use opal_pages::PageStore;
use opal_vector::DistanceKind;
use parking_lot::Mutex;

use crate::{HnswIndex, HnswOptions};

/// Tuples pulled from the shared scan per worker round.
const LOAD_BATCH: usize = 32;

/// Outcome of a bulk build, for host-side logging.
#[derive(Debug, Clone)]
pub struct HnswBuildSummary {
    pub tuples: u64,
    pub pages: u32,
    /// Element count at the arena-to-disk transition, when the
    /// maintenance budget ran out mid-build.
    pub spilled_at: Option<u64>,
}

impl HnswIndex {
    /// Builds a new index over `scan`.
    pub fn build(
        pages: Arc<dyn PageStore>,
        scan: &dyn TupleScan,
        dim: usize,
        distance: DistanceKind,
        options: &HnswOptions,
        ctx: &BuildContext<'_>,
    ) -> Result<(Self, HnswBuildSummary)> {
        ctx.progress.phase(BuildPhase::Initializing);
        if pages.page_count() != 0 {
            return Err(Error::Page("index block file is not empty".into()));
        }
        let meta_page = pages.allocate()?;
        debug_assert_eq!(meta_page, super::META_PAGE);
        let index = Self::empty(Arc::clone(&pages), dim, distance, options)?;

        ctx.progress.phase(BuildPhase::LoadingTuples);
        let total = scan.estimated_tuples();
        let done = AtomicU64::new(0);
        let shared = Mutex::new(scan.scan());
        let failure: Mutex<Option<Error>> = Mutex::new(None);
        let barrier = Barrier::new(ctx.workers);

        std::thread::scope(|scope| {
            for _ in 0..ctx.workers {
                scope.spawn(|| {
                    loop {
                        if ctx.interrupt.is_set() || failure.lock().is_some() {
                            break;
                        }
                        let batch: Vec<(TupleId, Vec<f32>)> = {
                            let mut iter = shared.lock();
                            iter.by_ref().take(LOAD_BATCH).collect()
                        };
                        if batch.is_empty() {
                            break;
                        }
                        let n = batch.len() as u64;
                        for (tuple, data) in batch {
                            if let Err(error) = index.insert_element(
                                tuple,
                                &data,
                                Some(ctx.budget),
                                &ctx.interrupt,
                            ) {
                                *failure.lock() = Some(error);
                                break;
                            }
                        }
                        let loaded = done.fetch_add(n, Ordering::Relaxed) + n;
                        ctx.progress.update(loaded, total);
                    }
                    // Finalization is gated on every worker reaching here.
                    barrier.wait();
                });
            }
        });

        if let Some(error) = failure.into_inner() {
            return Err(error);
        }
        ctx.interrupt.check()?;

        index.finalize()?;
        let summary = HnswBuildSummary {
            tuples: done.into_inner(),
            pages: pages.page_count(),
            spilled_at: index.spill_count(),
        };
        tracing::debug!(
            tuples = summary.tuples,
            pages = summary.pages,
            spilled = summary.spilled_at.is_some(),
            "hnsw build complete"
        );
        Ok((index, summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_core::host::{Interrupt, MemoryBudget, VecScan};
    use opal_core::progress::NoProgress;
    use opal_pages::MemoryPageStore;
    use opal_vector::Vector;

    fn points(n: u64, dim: usize) -> Vec<(TupleId, Vec<f32>)> {
        (0..n)
            .map(|i| {
                (
                    i,
                    (0..dim)
                        .map(|j| (((i * 31 + j as u64 * 17) % 97) as f32) / 9.7)
                        .collect(),
                )
            })
            .collect()
    }

    #[test]
    fn parallel_build_produces_valid_graph() {
        let tuples = points(300, 8);
        let scan = VecScan::new(tuples);
        let budget = MemoryBudget::unlimited();
        let progress = NoProgress;
        let ctx = BuildContext::new(Interrupt::new(), &progress, &budget, 4);
        let pages = Arc::new(MemoryPageStore::new());
        let (index, summary) = HnswIndex::build(
            pages,
            &scan,
            8,
            DistanceKind::L2,
            &HnswOptions {
                m: 8,
                ef_construction: 32,
                seed: Some(3),
            },
            &ctx,
        )
        .unwrap();

        assert_eq!(summary.tuples, 300);
        assert_eq!(index.len(), 300);
        let report = index.check_graph().unwrap();
        assert!(report.is_valid(), "violations: {:?}", report.violations);
    }

    #[test]
    fn tiny_budget_spills_to_disk_and_stays_correct() {
        let tuples = points(120, 4);
        let scan = VecScan::new(tuples.clone());
        let budget = MemoryBudget::new(4096);
        let progress = NoProgress;
        let ctx = BuildContext::new(Interrupt::new(), &progress, &budget, 2);
        let pages = Arc::new(MemoryPageStore::new());
        let (index, summary) = HnswIndex::build(
            pages,
            &scan,
            4,
            DistanceKind::L2,
            &HnswOptions {
                m: 4,
                ef_construction: 16,
                seed: Some(8),
            },
            &ctx,
        )
        .unwrap();

        let spilled_at = summary.spilled_at.expect("tiny budget must spill");
        assert!(spilled_at < 120);
        assert_eq!(index.len(), 120);
        assert!(index.check_graph().unwrap().is_valid());

        // Exact self-queries still resolve across the arena/disk split.
        for probe in [0u64, 60, 119] {
            let query = Vector::new(tuples[probe as usize].1.clone()).unwrap();
            let hits: Vec<TupleId> = index
                .search(&query, 3, 64, &Interrupt::new())
                .unwrap()
                .map(|h| h.tuple)
                .collect();
            assert!(hits.contains(&probe), "tuple {probe} not found: {hits:?}");
        }
    }

    #[test]
    fn interrupted_build_releases_pins() {
        let tuples = points(400, 6);
        let scan = VecScan::new(tuples);
        let budget = MemoryBudget::unlimited();
        let progress = NoProgress;
        let interrupt = Interrupt::new();
        interrupt.set();
        let ctx = BuildContext::new(interrupt, &progress, &budget, 2);
        let pages = Arc::new(MemoryPageStore::new());
        let result = HnswIndex::build(
            Arc::clone(&pages) as Arc<dyn PageStore>,
            &scan,
            6,
            DistanceKind::L2,
            &HnswOptions::default(),
            &ctx,
        );
        assert!(matches!(result, Err(Error::Interrupted)));
        assert_eq!(pages.live_pins(), 0);
    }

    #[test]
    fn build_on_used_store_is_rejected() {
        let pages = Arc::new(MemoryPageStore::new());
        pages.allocate().unwrap();
        let scan = VecScan::new(Vec::new());
        let budget = MemoryBudget::unlimited();
        let progress = NoProgress;
        let ctx = BuildContext::new(Interrupt::new(), &progress, &budget, 1);
        let result = HnswIndex::build(
            pages,
            &scan,
            3,
            DistanceKind::L2,
            &HnswOptions::default(),
            &ctx,
        );
        assert!(matches!(result, Err(Error::Page(_))));
    }
}
