//! Opal IVFFlat Module
//!
//! Inverted-file index with flat (uncompressed) storage: k-means++
//! partitions the vector space into `lists` clusters, every tuple lands in
//! the inverted list of its nearest centroid, and queries scan only the
//! `probes` closest lists. Centroids are frozen after build; rebuilding is
//! the remedy for heavy skew.
//!
//! Recall rises monotonically with `probes`; `probes = lists` degenerates
//! to an exhaustive scan with the same answer set as a sequential scan.

mod kmeans;
mod pages;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use opal_core::host::{BuildContext, Interrupt, TupleScan};
use opal_core::progress::BuildPhase;
use opal_core::types::{OrderedHits, SearchHit, TupleId, check_indexed_dim};
use opal_core::{Error, FORMAT_VERSION, Result};
use opal_pages::{NO_PAGE, Page, PageId, PageStore};
use opal_vector::distance::OrderedDistance;
use opal_vector::{DistanceKind, Vector};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::pages::{IvfMeta, ListInfo};

/// Upper bound on `lists`.
pub const MAX_LISTS: usize = 32_768;

/// Sample this many tuples per list when training.
const SAMPLES_PER_LIST: usize = 50;

/// Tuples pulled from the shared scan per worker round.
const LOAD_BATCH: usize = 64;

/// Index options supplied at build time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IvfflatOptions {
    /// Number of inverted lists, `1..=32768`.
    pub lists: usize,
    /// Deterministic training seed, for reproducible builds in tests.
    pub seed: Option<u64>,
}

impl Default for IvfflatOptions {
    fn default() -> Self {
        Self {
            lists: 100,
            seed: None,
        }
    }
}

impl IvfflatOptions {
    pub fn with_lists(lists: usize) -> Self {
        Self {
            lists,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.lists < 1 || self.lists > MAX_LISTS {
            return Err(Error::BadInput(format!(
                "lists must be between 1 and {MAX_LISTS}"
            )));
        }
        Ok(())
    }
}

/// Outcome of a bulk build, for host-side logging.
#[derive(Debug, Clone)]
pub struct IvfflatBuildSummary {
    pub tuples: u64,
    pub sampled: usize,
    pub kmeans_iterations: usize,
    pub empty_lists: usize,
    pub pages: u32,
}

/// An IVFFlat index over one page store.
pub struct IvfflatIndex {
    store: Arc<dyn PageStore>,
    dim: usize,
    lists: usize,
    distance: DistanceKind,
    /// Frozen after build; row-major `lists x dim`.
    centroids: Vec<f32>,
    /// Tail latches: appends to one list serialize here, appends to
    /// different lists proceed in parallel.
    directory: Vec<Mutex<ListInfo>>,
    directory_head: PageId,
    /// Serializes directory persistence; acquired only while holding no
    /// list latch.
    directory_lock: Mutex<()>,
}

impl IvfflatIndex {
    /// Builds a new index over `scan`, training centroids on a reservoir
    /// sample and then loading every tuple into its nearest list.
    pub fn build(
        store: Arc<dyn PageStore>,
        scan: &dyn TupleScan,
        dim: usize,
        distance: DistanceKind,
        options: &IvfflatOptions,
        ctx: &BuildContext<'_>,
    ) -> Result<(Self, IvfflatBuildSummary)> {
        ctx.progress.phase(BuildPhase::Initializing);
        options.validate()?;
        check_indexed_dim(dim)?;
        if store.page_count() != 0 {
            return Err(Error::Page("index block file is not empty".into()));
        }

        let lists = options.lists;
        let target = SAMPLES_PER_LIST * lists;

        // The sample and the Elkan bound structures are mandatory; refusals
        // here fail the build rather than degrade it.
        let training_bytes = (target * dim + target * lists + lists * lists) * 4;
        if !ctx.budget.try_reserve(training_bytes) {
            return Err(Error::Resource(format!(
                "k-means training needs {training_bytes} bytes"
            )));
        }

        let mut rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let normalize = distance == DistanceKind::Cosine;

        let meta_page = store.allocate()?;
        debug_assert_eq!(meta_page, pages::META_PAGE);

        let sample =
            kmeans::reservoir_sample(scan, dim, target, normalize, &mut rng, &ctx.interrupt)?;
        let sampled = sample.len();

        ctx.progress.phase(BuildPhase::PerformingKmeans);
        let trained = kmeans::train(&sample, lists, normalize, &mut rng, &ctx.interrupt)?;
        drop(sample);
        if trained.empty_lists > 0 {
            tracing::warn!(
                empty = trained.empty_lists,
                lists,
                "k-means left inverted lists empty; consider fewer lists or more data"
            );
        }

        let centroid_pages = pages::write_centroids(&*store, &trained.centroids, dim)?;
        let directory = vec![ListInfo::empty(); lists];
        let directory_head = pages::write_directory(&*store, None, &directory)?;
        pages::write_meta(
            &*store,
            &IvfMeta {
                version: FORMAT_VERSION,
                dim: dim as u32,
                lists: lists as u32,
                distance,
                centroid_pages,
                directory_head,
            },
        )?;

        let index = Self {
            store,
            dim,
            lists,
            distance,
            centroids: trained.centroids,
            directory: directory.into_iter().map(Mutex::new).collect(),
            directory_head,
            directory_lock: Mutex::new(()),
        };

        ctx.progress.phase(BuildPhase::AssigningTuples);
        ctx.progress.phase(BuildPhase::LoadingTuples);
        let tuples = index.load_tuples(scan, ctx)?;

        let summary = IvfflatBuildSummary {
            tuples,
            sampled,
            kmeans_iterations: trained.iterations,
            empty_lists: trained.empty_lists,
            pages: index.store.page_count(),
        };
        tracing::debug!(
            tuples = summary.tuples,
            iterations = summary.kmeans_iterations,
            pages = summary.pages,
            "ivfflat build complete"
        );
        Ok((index, summary))
    }

    /// Opens an index previously built on `store`.
    pub fn open(store: Arc<dyn PageStore>) -> Result<Self> {
        let meta = pages::read_meta(&*store)?;
        if meta.version != FORMAT_VERSION {
            return Err(Error::Page(format!(
                "unsupported index format version {}",
                meta.version
            )));
        }
        let dim = meta.dim as usize;
        let lists = meta.lists as usize;
        let centroids = pages::read_centroids(&*store, lists, dim)?;
        let directory = pages::read_directory(&*store, meta.directory_head, lists)?;
        Ok(Self {
            store,
            dim,
            lists,
            distance: meta.distance,
            centroids,
            directory: directory.into_iter().map(Mutex::new).collect(),
            directory_head: meta.directory_head,
            directory_lock: Mutex::new(()),
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn lists(&self) -> usize {
        self.lists
    }

    pub fn distance(&self) -> DistanceKind {
        self.distance
    }

    fn centroid(&self, c: usize) -> &[f32] {
        &self.centroids[c * self.dim..(c + 1) * self.dim]
    }

    /// Appends one tuple to the list of its nearest centroid. ACID per
    /// page write: the store logs each modified page.
    pub fn insert(&self, tuple: TupleId, data: &[f32]) -> Result<()> {
        kmeans::validate_tuple(self.dim, data)?;
        let list = self.nearest_list(data);
        self.append(list, tuple, data)
    }

    fn nearest_list(&self, data: &[f32]) -> usize {
        let mut best = 0usize;
        let mut best_d = OrderedDistance(f32::INFINITY);
        for c in 0..self.lists {
            let d = OrderedDistance(self.distance.comparison_distance(data, self.centroid(c)));
            if d < best_d {
                best_d = d;
                best = c;
            }
        }
        best
    }

    fn append(&self, list: usize, tuple: TupleId, data: &[f32]) -> Result<()> {
        let mut info = self.directory[list].lock();
        if info.tail == NO_PAGE {
            let id = self.store.allocate()?;
            let mut page = Page::new();
            pages::init_list_page(&mut page);
            pages::push_list_entry(&mut page, self.dim, tuple, data);
            self.store.write(id, &page)?;
            info.head = id;
            info.tail = id;
            drop(info);
            return self.persist_directory();
        }

        let tail = info.tail;
        let mut page = {
            let pinned = self.store.read(tail)?;
            (*pinned).clone()
        };
        if pages::list_count(&page) < pages::entries_per_page(self.dim) {
            pages::push_list_entry(&mut page, self.dim, tuple, data);
            self.store.write(tail, &page)?;
            return Ok(());
        }

        // Tail is full: chain a fresh page.
        let id = self.store.allocate()?;
        let mut fresh = Page::new();
        pages::init_list_page(&mut fresh);
        pages::push_list_entry(&mut fresh, self.dim, tuple, data);
        self.store.write(id, &fresh)?;
        pages::set_list_next(&mut page, id);
        self.store.write(tail, &page)?;
        info.tail = id;
        drop(info);
        self.persist_directory()
    }

    fn persist_directory(&self) -> Result<()> {
        let _guard = self.directory_lock.lock();
        let snapshot: Vec<ListInfo> = self.directory.iter().map(|m| *m.lock()).collect();
        pages::write_directory(&*self.store, Some(self.directory_head), &snapshot)?;
        Ok(())
    }

    fn load_tuples(&self, scan: &dyn TupleScan, ctx: &BuildContext<'_>) -> Result<u64> {
        let total = scan.estimated_tuples();
        let done = AtomicU64::new(0);
        let shared = Mutex::new(scan.scan());
        let failure: Mutex<Option<Error>> = Mutex::new(None);

        std::thread::scope(|scope| {
            for _ in 0..ctx.workers {
                scope.spawn(|| {
                    loop {
                        if ctx.interrupt.is_set() || failure.lock().is_some() {
                            return;
                        }
                        let batch: Vec<(TupleId, Vec<f32>)> = {
                            let mut iter = shared.lock();
                            iter.by_ref().take(LOAD_BATCH).collect()
                        };
                        if batch.is_empty() {
                            return;
                        }
                        let n = batch.len() as u64;
                        for (tuple, data) in batch {
                            if let Err(error) = self.insert(tuple, &data) {
                                *failure.lock() = Some(error);
                                return;
                            }
                        }
                        let loaded = done.fetch_add(n, Ordering::Relaxed) + n;
                        ctx.progress.update(loaded, total);
                    }
                });
            }
        });

        if let Some(error) = failure.into_inner() {
            return Err(error);
        }
        ctx.interrupt.check()?;
        Ok(done.into_inner())
    }

    /// Scans the `probes` lists whose centroids are nearest `query` and
    /// yields every entry found, ordered by ascending distance.
    pub fn search(
        &self,
        query: &Vector,
        probes: usize,
        interrupt: &Interrupt,
    ) -> Result<OrderedHits> {
        if query.dims() != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                actual: query.dims(),
            });
        }
        let probes = probes.clamp(1, self.lists);

        let mut ranked: Vec<(OrderedDistance, usize)> = (0..self.lists)
            .map(|c| {
                (
                    OrderedDistance(
                        self.distance
                            .comparison_distance(query.as_slice(), self.centroid(c)),
                    ),
                    c,
                )
            })
            .collect();
        ranked.sort_unstable();

        let mut hits = Vec::new();
        let mut buf = vec![0f32; self.dim];
        for (_, list) in ranked.into_iter().take(probes) {
            let mut page_id = {
                let info = self.directory[list].lock();
                info.head
            };
            while page_id != NO_PAGE {
                interrupt.check()?;
                let pinned = self.store.read(page_id)?;
                for slot in 0..pages::list_count(&pinned) {
                    let tuple = pages::read_list_entry(&pinned, self.dim, slot, &mut buf);
                    let comparison = self.distance.comparison_distance(query.as_slice(), &buf);
                    hits.push(SearchHit {
                        tuple,
                        distance: self.distance.from_comparison(comparison),
                    });
                }
                page_id = pages::list_next(&pinned);
            }
        }
        Ok(OrderedHits::from_unsorted(hits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_core::host::{MemoryBudget, VecScan};
    use opal_core::progress::NoProgress;
    use opal_core::types::MAX_INDEXED_DIM;
    use opal_pages::MemoryPageStore;

    fn build_ctx<'a>(budget: &'a MemoryBudget, progress: &'a NoProgress) -> BuildContext<'a> {
        BuildContext::new(Interrupt::new(), progress, budget, 2)
    }

    fn gaussian_like(id: u64, dim: usize) -> Vec<f32> {
        // Deterministic pseudo-random points, spread over two clumps.
        (0..dim)
            .map(|j| {
                let x = ((id * 31 + j as u64 * 17) % 97) as f32 / 97.0;
                if id % 2 == 0 { x } else { x + 4.0 }
            })
            .collect()
    }

    fn build_small(
        distance: DistanceKind,
        lists: usize,
        rows: usize,
        dim: usize,
    ) -> (IvfflatIndex, IvfflatBuildSummary, Vec<(u64, Vec<f32>)>) {
        let tuples: Vec<(u64, Vec<f32>)> =
            (0..rows as u64).map(|i| (i, gaussian_like(i, dim))).collect();
        let scan = VecScan::new(tuples.clone());
        let budget = MemoryBudget::unlimited();
        let progress = NoProgress;
        let ctx = build_ctx(&budget, &progress);
        let options = IvfflatOptions {
            lists,
            seed: Some(42),
        };
        let store = Arc::new(MemoryPageStore::new());
        let (index, summary) =
            IvfflatIndex::build(store, &scan, dim, distance, &options, &ctx).unwrap();
        (index, summary, tuples)
    }

    #[test]
    fn build_and_exhaustive_search_matches_all_rows() {
        let (index, summary, tuples) = build_small(DistanceKind::L2, 4, 200, 8);
        assert_eq!(summary.tuples, 200);

        let query = Vector::new(tuples[3].1.clone()).unwrap();
        let hits: Vec<SearchHit> = index
            .search(&query, index.lists(), &Interrupt::new())
            .unwrap()
            .collect();
        assert_eq!(hits.len(), 200);
        assert_eq!(hits[0].tuple, 3);
        assert!(hits[0].distance.abs() < 1e-6);
        for pair in hits.windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
        }
    }

    #[test]
    fn insert_after_build_is_searchable() {
        let (index, _, _) = build_small(DistanceKind::L2, 2, 50, 4);
        index.insert(999, &[100.0, 100.0, 100.0, 100.0]).unwrap();

        let query = Vector::new(vec![100.0, 100.0, 100.0, 100.0]).unwrap();
        let first = index
            .search(&query, index.lists(), &Interrupt::new())
            .unwrap()
            .next()
            .unwrap();
        assert_eq!(first.tuple, 999);
    }

    #[test]
    fn empty_table_build_then_inserts() {
        let scan = VecScan::new(Vec::new());
        let budget = MemoryBudget::unlimited();
        let progress = NoProgress;
        let ctx = build_ctx(&budget, &progress);
        let options = IvfflatOptions {
            lists: 4,
            seed: Some(1),
        };
        let store = Arc::new(MemoryPageStore::new());
        let (index, summary) =
            IvfflatIndex::build(store, &scan, 3, DistanceKind::L2, &options, &ctx).unwrap();
        assert_eq!(summary.tuples, 0);
        assert_eq!(summary.empty_lists, 4);

        index.insert(7, &[1.0, 2.0, 3.0]).unwrap();
        let query = Vector::new(vec![1.0, 2.0, 3.0]).unwrap();
        let hits: Vec<SearchHit> = index.search(&query, 4, &Interrupt::new()).unwrap().collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tuple, 7);
    }

    #[test]
    fn single_list_degenerates_to_sequential() {
        let (index, _, tuples) = build_small(DistanceKind::L2, 1, 64, 4);
        let query = Vector::new(vec![0.0; 4]).unwrap();
        let hits: Vec<SearchHit> = index.search(&query, 1, &Interrupt::new()).unwrap().collect();
        assert_eq!(hits.len(), tuples.len());
    }

    #[test]
    fn reopen_preserves_index() {
        let tuples: Vec<(u64, Vec<f32>)> =
            (0..100u64).map(|i| (i, gaussian_like(i, 6))).collect();
        let scan = VecScan::new(tuples.clone());
        let budget = MemoryBudget::unlimited();
        let progress = NoProgress;
        let ctx = build_ctx(&budget, &progress);
        let options = IvfflatOptions {
            lists: 3,
            seed: Some(9),
        };
        let store = Arc::new(MemoryPageStore::new());
        let (index, _) = IvfflatIndex::build(
            Arc::clone(&store) as Arc<dyn PageStore>,
            &scan,
            6,
            DistanceKind::Cosine,
            &options,
            &ctx,
        )
        .unwrap();

        let query = Vector::new(tuples[10].1.clone()).unwrap();
        let before: Vec<TupleId> = index
            .search(&query, 3, &Interrupt::new())
            .unwrap()
            .map(|h| h.tuple)
            .collect();

        drop(index);
        let reopened = IvfflatIndex::open(store).unwrap();
        assert_eq!(reopened.distance(), DistanceKind::Cosine);
        let after: Vec<TupleId> = reopened
            .search(&query, 3, &Interrupt::new())
            .unwrap()
            .map(|h| h.tuple)
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn dimension_mismatch_rejected_everywhere() {
        let (index, _, _) = build_small(DistanceKind::L2, 2, 30, 4);
        assert!(matches!(
            index.insert(1000, &[1.0, 2.0]),
            Err(Error::DimensionMismatch { .. })
        ));
        let narrow = Vector::new(vec![1.0, 2.0]).unwrap();
        assert!(matches!(
            index.search(&narrow, 1, &Interrupt::new()),
            Err(Error::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn wide_vectors_unsupported_for_indexing() {
        let scan = VecScan::new(Vec::new());
        let budget = MemoryBudget::unlimited();
        let progress = NoProgress;
        let ctx = build_ctx(&budget, &progress);
        let store = Arc::new(MemoryPageStore::new());
        let result = IvfflatIndex::build(
            store,
            &scan,
            MAX_INDEXED_DIM + 1,
            DistanceKind::L2,
            &IvfflatOptions::with_lists(1),
            &ctx,
        );
        assert!(matches!(result, Err(Error::Unsupported(_))));
    }

    #[test]
    fn options_bounds_enforced() {
        assert!(IvfflatOptions::with_lists(0).validate().is_err());
        assert!(IvfflatOptions::with_lists(MAX_LISTS + 1).validate().is_err());
        assert!(IvfflatOptions::with_lists(MAX_LISTS).validate().is_ok());
    }

    #[test]
    fn insufficient_budget_is_a_resource_error() {
        let scan = VecScan::new(vec![(0, vec![0.0, 0.0])]);
        let budget = MemoryBudget::new(64);
        let progress = NoProgress;
        let ctx = build_ctx(&budget, &progress);
        let store = Arc::new(MemoryPageStore::new());
        let result = IvfflatIndex::build(
            store,
            &scan,
            2,
            DistanceKind::L2,
            &IvfflatOptions::with_lists(8),
            &ctx,
        );
        assert!(matches!(result, Err(Error::Resource(_))));
    }

    #[test]
    fn interrupted_build_releases_pins() {
        let tuples: Vec<(u64, Vec<f32>)> =
            (0..500u64).map(|i| (i, gaussian_like(i, 8))).collect();
        let scan = VecScan::new(tuples);
        let budget = MemoryBudget::unlimited();
        let progress = NoProgress;
        let interrupt = Interrupt::new();
        interrupt.set();
        let ctx = BuildContext::new(interrupt, &progress, &budget, 2);
        let store = Arc::new(MemoryPageStore::new());
        let result = IvfflatIndex::build(
            Arc::clone(&store) as Arc<dyn PageStore>,
            &scan,
            8,
            DistanceKind::L2,
            &IvfflatOptions {
                lists: 4,
                seed: Some(5),
            },
            &ctx,
        );
        assert!(matches!(result, Err(Error::Interrupted)));
        assert_eq!(store.live_pins(), 0);
    }

    #[test]
    fn zero_vector_with_cosine_sorts_last() {
        let tuples = vec![
            (1u64, vec![0.0f32, 0.0, 0.0]),
            (2u64, vec![1.0f32, 2.0, 3.0]),
        ];
        let scan = VecScan::new(tuples);
        let budget = MemoryBudget::unlimited();
        let progress = NoProgress;
        let ctx = build_ctx(&budget, &progress);
        let store = Arc::new(MemoryPageStore::new());
        let (index, _) = IvfflatIndex::build(
            store,
            &scan,
            3,
            DistanceKind::Cosine,
            &IvfflatOptions {
                lists: 1,
                seed: Some(2),
            },
            &ctx,
        )
        .unwrap();

        let query = Vector::new(vec![1.0, 2.0, 3.0]).unwrap();
        let hits: Vec<SearchHit> = index.search(&query, 1, &Interrupt::new()).unwrap().collect();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].tuple, 2);
        assert!(hits[0].distance.abs() < 1e-6);
        assert_eq!(hits[1].tuple, 1);
        assert!(hits[1].distance.is_nan());
    }
}
