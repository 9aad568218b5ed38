//! Opal HNSW Module
//!
//! Hierarchical navigable small world graph index: every element joins a
//! multi-layer proximity graph at a geometrically distributed level,
//! searches descend greedily from the entry point and widen into a beam
//! at the lower layers, and neighbor selection favors diverse edges so
//! dense regions cannot collapse into hubs.
//!
//! Deleted tuples are never unlinked here; the host filters them by
//! visibility, and a rebuild is the remedy once recall decays.

mod build;
mod graph;

pub use build::HnswBuildSummary;

use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use opal_core::host::{Interrupt, MemoryBudget};
use opal_core::types::{OrderedHits, SearchHit, TupleId, check_indexed_dim};
use opal_core::{Error, FORMAT_VERSION, Result};
use opal_pages::{PageId, PageStore, read_meta_page, read_record, write_meta_page, write_record};
use opal_vector::distance::OrderedDistance;
use opal_vector::{DistanceKind, Vector};
use parking_lot::Mutex;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::graph::{ElementId, ElementLoc, GraphStore, layer_cap, max_level_for};

pub const MIN_M: usize = 2;
pub const MAX_M: usize = 100;
pub const MIN_EF_CONSTRUCTION: usize = 4;
pub const MAX_EF_CONSTRUCTION: usize = 1_000;

/// Default beam width for searches; per-query settings override it.
pub const DEFAULT_EF_SEARCH: usize = 40;

/// Index options supplied at build time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HnswOptions {
    /// Target neighbors per element per layer, `2..=100`. Layer 0 allows
    /// twice as many.
    pub m: usize,
    /// Beam width while inserting, `4..=1000` and at least `2 * m`.
    pub ef_construction: usize,
    /// Deterministic level-assignment seed, for reproducible builds.
    pub seed: Option<u64>,
}

impl Default for HnswOptions {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 64,
            seed: None,
        }
    }
}

impl HnswOptions {
    pub fn validate(&self) -> Result<()> {
        if self.m < MIN_M || self.m > MAX_M {
            return Err(Error::BadInput(format!(
                "m must be between {MIN_M} and {MAX_M}"
            )));
        }
        if self.ef_construction < MIN_EF_CONSTRUCTION
            || self.ef_construction > MAX_EF_CONSTRUCTION
        {
            return Err(Error::BadInput(format!(
                "ef_construction must be between {MIN_EF_CONSTRUCTION} and {MAX_EF_CONSTRUCTION}"
            )));
        }
        if self.ef_construction < 2 * self.m {
            return Err(Error::BadInput(
                "ef_construction must be at least twice m".into(),
            ));
        }
        Ok(())
    }
}

/// Metadata record on page 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HnswMeta {
    version: u32,
    dim: u32,
    m: u32,
    ef_construction: u32,
    distance: DistanceKind,
    entry: Option<(ElementId, u8)>,
    directory_head: Option<PageId>,
}

const META_PAGE: PageId = 0;

/// Graph validity report from [`HnswIndex::check_graph`].
#[derive(Debug, Default)]
pub struct GraphReport {
    pub elements: u64,
    pub entry_level: Option<u8>,
    pub max_observed_level: u8,
    pub violations: Vec<String>,
}

impl GraphReport {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }
}

/// An HNSW index over one page store.
pub struct HnswIndex {
    pages: Arc<dyn PageStore>,
    store: GraphStore,
    dim: usize,
    m: usize,
    ef_construction: usize,
    distance: DistanceKind,
    ml: f64,
    max_level: u8,
    seed: Option<u64>,
    level_rng: Mutex<StdRng>,
    /// Entry latch. Replacement only succeeds when the proposed level
    /// strictly exceeds the recorded one.
    entry: Mutex<Option<(ElementId, u8)>>,
    meta_lock: Mutex<()>,
    directory_head: Mutex<Option<PageId>>,
}

impl HnswIndex {
    fn empty(
        pages: Arc<dyn PageStore>,
        dim: usize,
        distance: DistanceKind,
        options: &HnswOptions,
    ) -> Result<Self> {
        options.validate()?;
        check_indexed_dim(dim)?;
        let level_rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self {
            store: GraphStore::new(Arc::clone(&pages), dim, options.m),
            pages,
            dim,
            m: options.m,
            ef_construction: options.ef_construction,
            distance,
            ml: 1.0 / (options.m as f64).ln(),
            max_level: max_level_for(options.m),
            seed: options.seed,
            level_rng: Mutex::new(level_rng),
            entry: Mutex::new(None),
            meta_lock: Mutex::new(()),
            directory_head: Mutex::new(None),
        })
    }

    /// Opens an index previously built on `pages`.
    pub fn open(pages: Arc<dyn PageStore>) -> Result<Self> {
        let meta: HnswMeta = read_meta_page(&*pages, META_PAGE)?;
        if meta.version != FORMAT_VERSION {
            return Err(Error::Page(format!(
                "unsupported index format version {}",
                meta.version
            )));
        }
        let options = HnswOptions {
            m: meta.m as usize,
            ef_construction: meta.ef_construction as usize,
            seed: None,
        };
        options.validate()?;
        let dim = meta.dim as usize;
        let directory: Vec<ElementLoc> = match meta.directory_head {
            Some(head) => read_record(&*pages, head)?,
            None => Vec::new(),
        };
        let store = GraphStore::load(Arc::clone(&pages), dim, options.m, directory)?;
        Ok(Self {
            store,
            dim,
            m: options.m,
            ef_construction: options.ef_construction,
            distance: meta.distance,
            ml: 1.0 / (options.m as f64).ln(),
            max_level: max_level_for(options.m),
            seed: None,
            level_rng: Mutex::new(StdRng::from_os_rng()),
            entry: Mutex::new(meta.entry),
            meta_lock: Mutex::new(()),
            directory_head: Mutex::new(meta.directory_head),
            pages,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn m(&self) -> usize {
        self.m
    }

    pub fn distance(&self) -> DistanceKind {
        self.distance
    }

    pub fn len(&self) -> u64 {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts one tuple. The element joins the graph at a geometrically
    /// distributed level and becomes the entry point only if its level
    /// strictly exceeds the current entry level.
    pub fn insert(&self, tuple: TupleId, data: &[f32]) -> Result<()> {
        self.insert_element(tuple, data, None, &Interrupt::new())?;
        self.persist_state()
    }

    pub(crate) fn insert_element(
        &self,
        tuple: TupleId,
        data: &[f32],
        budget: Option<&MemoryBudget>,
        interrupt: &Interrupt,
    ) -> Result<ElementId> {
        check_vector(self.dim, data)?;
        let level = self.assign_level(tuple);

        // Empty-index fast path, under the entry latch so exactly one
        // first element wins.
        {
            let mut entry = self.entry.lock();
            if entry.is_none() {
                let id = self.store.push(tuple, level, data.to_vec(), budget)?;
                *entry = Some((id, level));
                return Ok(id);
            }
        }

        let (entry_id, entry_level) = {
            let entry = self.entry.lock();
            entry.ok_or_else(|| Error::Page("entry pointer lost".into()))?
        };
        let id = self.store.push(tuple, level, data.to_vec(), budget)?;

        // Greedy descent with a beam of one above the element's level.
        let mut current = entry_id;
        let mut layer = entry_level;
        while layer > level {
            let found = self.search_layer(data, &[current], 1, layer, interrupt)?;
            if let Some((_, nearest)) = found.first() {
                current = *nearest;
            }
            layer -= 1;
        }

        // Wide beam plus heuristic wiring from min(entry, level) down.
        let mut entry_set = vec![current];
        let top = level.min(entry_level);
        for layer in (0..=top).rev() {
            let found =
                self.search_layer(data, &entry_set, self.ef_construction, layer, interrupt)?;
            let candidates: Vec<(OrderedDistance, ElementId)> = found
                .iter()
                .copied()
                .filter(|(_, other)| *other != id)
                .collect();
            let cap = layer_cap(self.m, layer);
            let selected = self.select_neighbors(&candidates, cap)?;
            self.store.set_neighbors(id, layer, selected.clone())?;
            for neighbor in selected {
                self.link(neighbor, id, layer)?;
            }
            entry_set = found.into_iter().map(|(_, other)| other).collect();
        }

        if level > entry_level {
            let mut entry = self.entry.lock();
            match *entry {
                Some((_, current_level)) if level > current_level => {
                    *entry = Some((id, level));
                }
                None => *entry = Some((id, level)),
                _ => {}
            }
        }
        Ok(id)
    }

    /// Beam search within one layer: a min-queue of candidates to expand
    /// against a bounded max-queue of current best results.
    fn search_layer(
        &self,
        query: &[f32],
        entries: &[ElementId],
        ef: usize,
        layer: u8,
        interrupt: &Interrupt,
    ) -> Result<Vec<(OrderedDistance, ElementId)>> {
        let ef = ef.max(1);
        let mut visited: HashSet<ElementId> = HashSet::new();
        let mut candidates: BinaryHeap<std::cmp::Reverse<(OrderedDistance, ElementId)>> =
            BinaryHeap::new();
        let mut results: BinaryHeap<(OrderedDistance, ElementId)> = BinaryHeap::new();

        for &ep in entries {
            if visited.insert(ep) {
                let d = OrderedDistance(
                    self.distance
                        .comparison_distance(query, self.store.get(ep)?.vector()),
                );
                candidates.push(std::cmp::Reverse((d, ep)));
                results.push((d, ep));
            }
        }
        while results.len() > ef {
            results.pop();
        }

        while let Some(std::cmp::Reverse((dist, node))) = candidates.pop() {
            interrupt.check()?;
            let farthest = results
                .peek()
                .map_or(OrderedDistance(f32::INFINITY), |(d, _)| *d);
            if dist > farthest && results.len() >= ef {
                break;
            }
            for neighbor in self.store.neighbors(node, layer)? {
                if !visited.insert(neighbor) {
                    continue;
                }
                let d = OrderedDistance(
                    self.distance
                        .comparison_distance(query, self.store.get(neighbor)?.vector()),
                );
                let farthest = results
                    .peek()
                    .map_or(OrderedDistance(f32::INFINITY), |(d, _)| *d);
                if results.len() < ef || d < farthest {
                    candidates.push(std::cmp::Reverse((d, neighbor)));
                    results.push((d, neighbor));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<(OrderedDistance, ElementId)> = results.into_iter().collect();
        out.sort_unstable();
        Ok(out)
    }

    /// Diversity heuristic over candidates sorted by ascending distance
    /// to the base element: keep a candidate only while it is closer to
    /// the base than to every neighbor already kept, then backfill the
    /// remaining slots with the nearest pruned candidates.
    fn select_neighbors(
        &self,
        candidates: &[(OrderedDistance, ElementId)],
        cap: usize,
    ) -> Result<Vec<ElementId>> {
        if candidates.len() <= cap {
            return Ok(candidates.iter().map(|(_, id)| *id).collect());
        }

        let mut kept: Vec<(ElementId, Vec<f32>)> = Vec::with_capacity(cap);
        let mut pruned: Vec<ElementId> = Vec::new();
        for (dist, candidate) in candidates {
            if kept.len() >= cap {
                break;
            }
            let candidate_vec = self.store.get(*candidate)?.vector().to_vec();
            let diverse = kept.iter().all(|(_, kept_vec)| {
                OrderedDistance(self.distance.comparison_distance(&candidate_vec, kept_vec))
                    > *dist
            });
            if diverse {
                kept.push((*candidate, candidate_vec));
            } else {
                pruned.push(*candidate);
            }
        }

        let mut out: Vec<ElementId> = kept.into_iter().map(|(id, _)| id).collect();
        for candidate in pruned {
            if out.len() >= cap {
                break;
            }
            out.push(candidate);
        }
        Ok(out)
    }

    /// Adds a backlink `neighbor -> new_id`, re-running the heuristic when
    /// the list overflows its layer capacity.
    fn link(&self, neighbor: ElementId, new_id: ElementId, layer: u8) -> Result<()> {
        if neighbor == new_id {
            return Ok(());
        }
        let cap = layer_cap(self.m, layer);
        self.store.update_neighbors(neighbor, layer, |list| {
            if list.contains(&new_id) {
                return Ok(());
            }
            list.push(new_id);
            if list.len() > cap {
                let base = self.store.get(neighbor)?.vector().to_vec();
                let mut ranked: Vec<(OrderedDistance, ElementId)> =
                    Vec::with_capacity(list.len());
                for &other in list.iter() {
                    let d = OrderedDistance(
                        self.distance
                            .comparison_distance(&base, self.store.get(other)?.vector()),
                    );
                    ranked.push((d, other));
                }
                ranked.sort_unstable();
                *list = self.select_neighbors(&ranked, cap)?;
            }
            Ok(())
        })
    }

    /// `floor(-ln(u) * mL)`, capped so the neighbor record always fits a
    /// page. Seeded builds derive the draw from the tuple id.
    fn assign_level(&self, tuple: TupleId) -> u8 {
        let u: f64 = match self.seed {
            Some(seed) => {
                let mut rng =
                    StdRng::seed_from_u64(seed ^ tuple.wrapping_mul(0x9E37_79B9_7F4A_7C15));
                rng.random()
            }
            None => self.level_rng.lock().random(),
        };
        let u = if u > 0.0 { u } else { f64::MIN_POSITIVE };
        let level = (-u.ln() * self.ml) as u64;
        level.min(u64::from(self.max_level)) as u8
    }

    /// Nearest `k` elements by the index distance, ascending. An empty
    /// index yields an empty stream.
    pub fn search(
        &self,
        query: &Vector,
        k: usize,
        ef_search: usize,
        interrupt: &Interrupt,
    ) -> Result<OrderedHits> {
        if query.dims() != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                actual: query.dims(),
            });
        }
        let Some((entry_id, entry_level)) = *self.entry.lock() else {
            return Ok(OrderedHits::empty());
        };

        let q = query.as_slice();
        let mut current = entry_id;
        for layer in (1..=entry_level).rev() {
            let found = self.search_layer(q, &[current], 1, layer, interrupt)?;
            if let Some((_, nearest)) = found.first() {
                current = *nearest;
            }
        }

        let ef = ef_search.max(k);
        let found = self.search_layer(q, &[current], ef, 0, interrupt)?;
        let mut hits = Vec::with_capacity(k.min(found.len()));
        for (dist, id) in found.into_iter().take(k) {
            hits.push(SearchHit {
                tuple: self.store.get(id)?.tuple(),
                distance: self.distance.from_comparison(dist.0),
            });
        }
        Ok(OrderedHits::from_unsorted(hits))
    }

    /// Structural validity sweep over the whole graph.
    pub fn check_graph(&self) -> Result<GraphReport> {
        let len = self.store.len();
        let mut report = GraphReport {
            elements: len,
            entry_level: self.entry.lock().map(|(_, level)| level),
            ..GraphReport::default()
        };

        for id in 0..len {
            let level = self.store.get(id)?.level();
            report.max_observed_level = report.max_observed_level.max(level);
            for layer in 0..=level {
                let list = self.store.neighbors(id, layer)?;
                if list.len() > layer_cap(self.m, layer) {
                    report.violations.push(format!(
                        "element {id} layer {layer} holds {} neighbors",
                        list.len()
                    ));
                }
                let mut seen = HashSet::new();
                for target in list {
                    if target == id {
                        report.violations.push(format!("self-loop on element {id}"));
                    }
                    if !seen.insert(target) {
                        report
                            .violations
                            .push(format!("duplicate neighbor {target} on element {id}"));
                    }
                    if target >= len {
                        report
                            .violations
                            .push(format!("dangling neighbor {target} on element {id}"));
                    } else if self.store.get(target)?.level() < layer {
                        report.violations.push(format!(
                            "element {id} links to {target} above its level"
                        ));
                    }
                }
            }
        }

        match report.entry_level {
            Some(entry_level) if len > 0 => {
                if entry_level < report.max_observed_level {
                    report.violations.push(format!(
                        "entry level {entry_level} below observed maximum {}",
                        report.max_observed_level
                    ));
                }
            }
            None if len > 0 => report.violations.push("entry pointer missing".into()),
            _ => {}
        }
        Ok(report)
    }

    /// Flushes the arena to pages and writes directory plus metadata.
    pub(crate) fn finalize(&self) -> Result<()> {
        self.store.finalize()?;
        self.persist_state()
    }

    /// Spill point of the last build, if the arena overflowed.
    pub fn spill_count(&self) -> Option<u64> {
        self.store.spill_count()
    }

    fn persist_state(&self) -> Result<()> {
        if !self.store.is_write_through() {
            return Ok(());
        }
        let _guard = self.meta_lock.lock();
        let directory = self.store.directory()?;
        let mut head = self.directory_head.lock();
        let new_head = write_record(&*self.pages, *head, &directory)?;
        *head = Some(new_head);
        write_meta_page(
            &*self.pages,
            META_PAGE,
            &HnswMeta {
                version: FORMAT_VERSION,
                dim: self.dim as u32,
                m: self.m as u32,
                ef_construction: self.ef_construction as u32,
                distance: self.distance,
                entry: *self.entry.lock(),
                directory_head: *head,
            },
        )
    }
}

fn check_vector(dim: usize, data: &[f32]) -> Result<()> {
    if data.len() != dim {
        return Err(Error::DimensionMismatch {
            expected: dim,
            actual: data.len(),
        });
    }
    if data.iter().any(|x| !x.is_finite()) {
        return Err(Error::BadInput(
            "NaN and infinity not allowed in vector".into(),
        ));
    }
    Ok(())
}
