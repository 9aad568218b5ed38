//! Element storage for the graph: build-time arena with on-page fallback.
//!
//! Elements live in a memory arena while the maintenance budget lasts;
//! once a reservation is refused the store switches to allocating new
//! elements straight against the page store (slower, same semantics) and
//! says so once. Neighbor references are element ids, never pointers, so
//! the cyclic graph needs no ownership gymnastics; on-page, ids resolve
//! through a `(page, offset)` directory.
//!
//! Each element is two page records: a data record (tuple id, level,
//! vector) and a neighbor record holding fixed-capacity inline arrays for
//! every layer, so a neighbor-list rewrite patches bytes in place.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use opal_core::host::MemoryBudget;
use opal_core::types::TupleId;
use opal_core::{Error, Result};
use opal_pages::{NO_PAGE, PAGE_PAYLOAD, PageId, PageStore};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Monotonic element id within one index.
pub type ElementId = u64;

/// Hard ceiling on layer numbers; the geometric level draw virtually
/// never reaches it, and the per-`m` page bound below usually caps lower.
pub const LEVEL_CEILING: u8 = 16;

/// Neighbor capacity of a layer.
pub fn layer_cap(m: usize, layer: u8) -> usize {
    if layer == 0 { 2 * m } else { m }
}

/// Highest level whose neighbor record still fits one page for this `m`.
pub fn max_level_for(m: usize) -> u8 {
    let mut level = 0u8;
    while level < LEVEL_CEILING
        && neighbor_record_size(m, level + 1) <= PAGE_PAYLOAD
    {
        level += 1;
    }
    level
}

fn data_record_size(dim: usize) -> usize {
    8 + 1 + 1 + dim * 4
}

fn neighbor_record_size(m: usize, level: u8) -> usize {
    let slots = 2 * m + level as usize * m;
    (level as usize + 1) * 2 + slots * 8
}

/// Slot offset of `layer` within a neighbor record, in slots.
fn layer_slot_base(m: usize, layer: u8) -> usize {
    if layer == 0 {
        0
    } else {
        2 * m + (layer as usize - 1) * m
    }
}

/// Where one element's two records live on-page.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct ElementLoc {
    pub data_page: PageId,
    pub data_off: u16,
    pub nbr_page: PageId,
    pub nbr_off: u16,
}

/// Arena-resident element; neighbor lists carry their own latches so
/// concurrent inserts touching different lists proceed in parallel.
pub(crate) struct ArenaElement {
    pub tuple: TupleId,
    pub level: u8,
    pub vector: Vec<f32>,
    pub layers: Vec<RwLock<Vec<ElementId>>>,
}

struct ElementSlot {
    level: u8,
    data: Option<Arc<ArenaElement>>,
    loc: Option<ElementLoc>,
}

/// Read handle over either representation.
pub(crate) enum ElementRef {
    Mem(Arc<ArenaElement>),
    Disk {
        tuple: TupleId,
        level: u8,
        vector: Vec<f32>,
    },
}

impl ElementRef {
    pub fn tuple(&self) -> TupleId {
        match self {
            ElementRef::Mem(el) => el.tuple,
            ElementRef::Disk { tuple, .. } => *tuple,
        }
    }

    pub fn level(&self) -> u8 {
        match self {
            ElementRef::Mem(el) => el.level,
            ElementRef::Disk { level, .. } => *level,
        }
    }

    pub fn vector(&self) -> &[f32] {
        match self {
            ElementRef::Mem(el) => &el.vector,
            ElementRef::Disk { vector, .. } => vector,
        }
    }
}

struct AppendState {
    page: PageId,
    used: usize,
}

pub(crate) struct GraphStore {
    pages: Arc<dyn PageStore>,
    dim: usize,
    m: usize,
    elements: RwLock<Vec<ElementSlot>>,
    append: Mutex<AppendState>,
    /// Serializes read-modify-write of on-page neighbor records.
    page_rmw: Mutex<()>,
    /// Set on the first refused arena reservation; never cleared.
    spilled: AtomicBool,
    spill_at: AtomicU64,
    /// After finalize/open, every graph mutation also lands on pages.
    write_through: AtomicBool,
}

impl GraphStore {
    pub fn new(pages: Arc<dyn PageStore>, dim: usize, m: usize) -> Self {
        Self {
            pages,
            dim,
            m,
            elements: RwLock::new(Vec::new()),
            append: Mutex::new(AppendState {
                page: NO_PAGE,
                used: 0,
            }),
            page_rmw: Mutex::new(()),
            spilled: AtomicBool::new(false),
            spill_at: AtomicU64::new(0),
            write_through: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> u64 {
        self.elements.read().len() as u64
    }

    pub fn is_write_through(&self) -> bool {
        self.write_through.load(Ordering::Acquire)
    }

    /// Element count at the arena-to-disk transition, if it happened.
    pub fn spill_count(&self) -> Option<u64> {
        if self.spilled.load(Ordering::Acquire) {
            Some(self.spill_at.load(Ordering::Acquire))
        } else {
            None
        }
    }

    fn slot_info(&self, id: ElementId) -> Result<(u8, Option<Arc<ArenaElement>>, Option<ElementLoc>)> {
        let elements = self.elements.read();
        let slot = elements
            .get(id as usize)
            .ok_or_else(|| Error::Page(format!("unknown graph element {id}")))?;
        Ok((slot.level, slot.data.clone(), slot.loc))
    }

    /// Places a new element, preferring the arena while the budget lasts.
    /// Once write-through, the element is also appended to pages.
    pub fn push(
        &self,
        tuple: TupleId,
        level: u8,
        vector: Vec<f32>,
        budget: Option<&MemoryBudget>,
    ) -> Result<ElementId> {
        let arena_ok = match budget {
            None => true,
            Some(budget) => {
                if self.spilled.load(Ordering::Acquire) {
                    false
                } else {
                    let bytes = self.dim * 4
                        + (2 * self.m + level as usize * self.m) * 8
                        + (level as usize + 2) * 64;
                    let ok = budget.try_reserve(bytes);
                    if !ok && !self.spilled.swap(true, Ordering::AcqRel) {
                        let built = self.len();
                        self.spill_at.store(built, Ordering::Release);
                        tracing::warn!(
                            tuples = built,
                            "graph no longer fits in maintenance memory; \
                             continuing build directly against the page store"
                        );
                    }
                    ok
                }
            }
        };

        let data = if arena_ok {
            Some(Arc::new(ArenaElement {
                tuple,
                level,
                vector: vector.clone(),
                layers: (0..=level).map(|_| RwLock::new(Vec::new())).collect(),
            }))
        } else {
            None
        };

        let loc = if !arena_ok || self.is_write_through() {
            Some(self.append_element(tuple, level, &vector, None)?)
        } else {
            None
        };

        let mut elements = self.elements.write();
        let id = elements.len() as ElementId;
        elements.push(ElementSlot { level, data, loc });
        Ok(id)
    }

    pub fn get(&self, id: ElementId) -> Result<ElementRef> {
        let (level, data, loc) = self.slot_info(id)?;
        if let Some(el) = data {
            return Ok(ElementRef::Mem(el));
        }
        let loc = loc.ok_or_else(|| Error::Page(format!("element {id} has no storage")))?;
        let pinned = self.pages.read(loc.data_page)?;
        let (tuple, stored_level, vector) =
            decode_data_record(pinned.payload(), loc.data_off as usize, self.dim)?;
        if stored_level != level {
            return Err(Error::Page(format!("level mismatch on element {id}")));
        }
        Ok(ElementRef::Disk {
            tuple,
            level,
            vector,
        })
    }

    /// Current neighbor list; empty when the element does not reach
    /// `layer`.
    pub fn neighbors(&self, id: ElementId, layer: u8) -> Result<Vec<ElementId>> {
        let (level, data, loc) = self.slot_info(id)?;
        if layer > level {
            return Ok(Vec::new());
        }
        if let Some(el) = data {
            return Ok(el.layers[layer as usize].read().clone());
        }
        let loc = loc.ok_or_else(|| Error::Page(format!("element {id} has no storage")))?;
        let pinned = self.pages.read(loc.nbr_page)?;
        decode_neighbor_layer(
            pinned.payload(),
            loc.nbr_off as usize,
            self.m,
            level,
            layer,
        )
    }

    /// Atomic read-modify-write of one neighbor list. The closure must
    /// leave the list within the layer's capacity.
    pub fn update_neighbors(
        &self,
        id: ElementId,
        layer: u8,
        mutate: impl FnOnce(&mut Vec<ElementId>) -> Result<()>,
    ) -> Result<()> {
        let (level, data, loc) = self.slot_info(id)?;
        if layer > level {
            return Err(Error::Page(format!(
                "element {id} has no layer {layer}"
            )));
        }

        if let Some(el) = data {
            let mut list = el.layers[layer as usize].write();
            mutate(&mut list)?;
            if list.len() > layer_cap(self.m, layer) {
                return Err(Error::Page(format!(
                    "neighbor list of element {id} exceeds layer capacity"
                )));
            }
            if self.is_write_through()
                && let Some(loc) = loc
            {
                let _guard = self.page_rmw.lock();
                self.patch_layer(&loc, level, layer, &list)?;
            }
            return Ok(());
        }

        let loc = loc.ok_or_else(|| Error::Page(format!("element {id} has no storage")))?;
        let _guard = self.page_rmw.lock();
        let mut list = {
            let pinned = self.pages.read(loc.nbr_page)?;
            decode_neighbor_layer(
                pinned.payload(),
                loc.nbr_off as usize,
                self.m,
                level,
                layer,
            )?
        };
        mutate(&mut list)?;
        if list.len() > layer_cap(self.m, layer) {
            return Err(Error::Page(format!(
                "neighbor list of element {id} exceeds layer capacity"
            )));
        }
        self.patch_layer(&loc, level, layer, &list)
    }

    /// Overwrites one neighbor list (initial wiring of a new element).
    pub fn set_neighbors(&self, id: ElementId, layer: u8, list: Vec<ElementId>) -> Result<()> {
        self.update_neighbors(id, layer, |current| {
            *current = list;
            Ok(())
        })
    }

    fn patch_layer(
        &self,
        loc: &ElementLoc,
        level: u8,
        layer: u8,
        list: &[ElementId],
    ) -> Result<()> {
        let mut page = {
            let pinned = self.pages.read(loc.nbr_page)?;
            (*pinned).clone()
        };
        encode_neighbor_layer(
            page.payload_mut(),
            loc.nbr_off as usize,
            self.m,
            level,
            layer,
            list,
        );
        self.pages.write(loc.nbr_page, &page)
    }

    fn append_bytes(&self, bytes: &[u8]) -> Result<(PageId, u16)> {
        let mut state = self.append.lock();
        if state.page == NO_PAGE || state.used + bytes.len() > PAGE_PAYLOAD {
            state.page = self.pages.allocate()?;
            state.used = 0;
        }
        let page_id = state.page;
        let offset = state.used;
        {
            // Neighbor patches may target earlier records on this page.
            let _guard = self.page_rmw.lock();
            let mut page = {
                let pinned = self.pages.read(page_id)?;
                (*pinned).clone()
            };
            page.payload_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
            self.pages.write(page_id, &page)?;
        }
        state.used += bytes.len();
        Ok((page_id, offset as u16))
    }

    /// Appends both records of an element; `layers` carries the current
    /// neighbor lists (`None` for a fresh, unwired element).
    fn append_element(
        &self,
        tuple: TupleId,
        level: u8,
        vector: &[f32],
        layers: Option<&[Vec<ElementId>]>,
    ) -> Result<ElementLoc> {
        let mut data = vec![0u8; data_record_size(self.dim)];
        encode_data_record(&mut data, tuple, level, vector);
        let (data_page, data_off) = self.append_bytes(&data)?;

        let mut nbrs = vec![0u8; neighbor_record_size(self.m, level)];
        if let Some(layers) = layers {
            for (layer, list) in layers.iter().enumerate() {
                encode_neighbor_layer(&mut nbrs, 0, self.m, level, layer as u8, list);
            }
        }
        let (nbr_page, nbr_off) = self.append_bytes(&nbrs)?;

        Ok(ElementLoc {
            data_page,
            data_off,
            nbr_page,
            nbr_off,
        })
    }

    /// Writes every arena-only element to pages and switches the store to
    /// write-through. Idempotent for already-located elements.
    pub fn finalize(&self) -> Result<()> {
        let pending: Vec<(ElementId, Arc<ArenaElement>)> = {
            let elements = self.elements.read();
            elements
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.loc.is_none())
                .filter_map(|(i, slot)| {
                    slot.data.clone().map(|el| (i as ElementId, el))
                })
                .collect()
        };

        for (id, el) in pending {
            let layers: Vec<Vec<ElementId>> =
                el.layers.iter().map(|l| l.read().clone()).collect();
            let loc = self.append_element(el.tuple, el.level, &el.vector, Some(&layers))?;
            let mut elements = self.elements.write();
            elements[id as usize].loc = Some(loc);
        }

        self.write_through.store(true, Ordering::Release);
        Ok(())
    }

    /// `(page, offset)` locations of every element, for the metadata
    /// directory. Valid only after [`finalize`](Self::finalize).
    pub fn directory(&self) -> Result<Vec<ElementLoc>> {
        let elements = self.elements.read();
        elements
            .iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.loc
                    .ok_or_else(|| Error::Page(format!("element {i} not yet on pages")))
            })
            .collect()
    }

    /// Rebuilds the in-memory graph from the on-page records.
    pub fn load(
        pages: Arc<dyn PageStore>,
        dim: usize,
        m: usize,
        directory: Vec<ElementLoc>,
    ) -> Result<Self> {
        let store = Self::new(pages, dim, m);
        {
            let mut elements = store.elements.write();
            for loc in directory {
                let (tuple, level, vector) = {
                    let pinned = store.pages.read(loc.data_page)?;
                    decode_data_record(pinned.payload(), loc.data_off as usize, dim)?
                };
                let layers = {
                    let pinned = store.pages.read(loc.nbr_page)?;
                    (0..=level)
                        .map(|layer| {
                            decode_neighbor_layer(
                                pinned.payload(),
                                loc.nbr_off as usize,
                                m,
                                level,
                                layer,
                            )
                            .map(RwLock::new)
                        })
                        .collect::<Result<Vec<_>>>()?
                };
                elements.push(ElementSlot {
                    level,
                    data: Some(Arc::new(ArenaElement {
                        tuple,
                        level,
                        vector,
                        layers,
                    })),
                    loc: Some(loc),
                });
            }
        }
        store.write_through.store(true, Ordering::Release);
        Ok(store)
    }
}

fn encode_data_record(buf: &mut [u8], tuple: TupleId, level: u8, vector: &[f32]) {
    buf[0..8].copy_from_slice(&tuple.to_le_bytes());
    buf[8] = level;
    buf[9] = 0;
    let mut offset = 10;
    for x in vector {
        buf[offset..offset + 4].copy_from_slice(&x.to_le_bytes());
        offset += 4;
    }
}

fn decode_data_record(
    payload: &[u8],
    offset: usize,
    dim: usize,
) -> Result<(TupleId, u8, Vec<f32>)> {
    let end = offset + data_record_size(dim);
    if end > payload.len() {
        return Err(Error::Page("element data record out of page bounds".into()));
    }
    let mut id_bytes = [0u8; 8];
    id_bytes.copy_from_slice(&payload[offset..offset + 8]);
    let tuple = TupleId::from_le_bytes(id_bytes);
    let level = payload[offset + 8];
    let vector = payload[offset + 10..end]
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok((tuple, level, vector))
}

fn encode_neighbor_layer(
    buf: &mut [u8],
    record_off: usize,
    m: usize,
    level: u8,
    layer: u8,
    list: &[ElementId],
) {
    let count_off = record_off + layer as usize * 2;
    buf[count_off..count_off + 2].copy_from_slice(&(list.len() as u16).to_le_bytes());
    let slots_base = record_off + (level as usize + 1) * 2 + layer_slot_base(m, layer) * 8;
    for (i, id) in list.iter().enumerate() {
        let off = slots_base + i * 8;
        buf[off..off + 8].copy_from_slice(&id.to_le_bytes());
    }
}

fn decode_neighbor_layer(
    payload: &[u8],
    record_off: usize,
    m: usize,
    level: u8,
    layer: u8,
) -> Result<Vec<ElementId>> {
    let end = record_off + neighbor_record_size(m, level);
    if end > payload.len() {
        return Err(Error::Page(
            "element neighbor record out of page bounds".into(),
        ));
    }
    let count_off = record_off + layer as usize * 2;
    let count = u16::from_le_bytes([payload[count_off], payload[count_off + 1]]) as usize;
    if count > layer_cap(m, layer) {
        return Err(Error::Page("corrupt neighbor count".into()));
    }
    let slots_base = record_off + (level as usize + 1) * 2 + layer_slot_base(m, layer) * 8;
    let mut list = Vec::with_capacity(count);
    for i in 0..count {
        let off = slots_base + i * 8;
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&payload[off..off + 8]);
        list.push(ElementId::from_le_bytes(id_bytes));
    }
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_pages::MemoryPageStore;

    fn fresh_store(dim: usize, m: usize) -> GraphStore {
        GraphStore::new(Arc::new(MemoryPageStore::new()), dim, m)
    }

    #[test]
    fn arena_push_and_get() {
        let store = fresh_store(3, 4);
        let id = store.push(42, 1, vec![1.0, 2.0, 3.0], None).unwrap();
        let el = store.get(id).unwrap();
        assert_eq!(el.tuple(), 42);
        assert_eq!(el.level(), 1);
        assert_eq!(el.vector(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn spill_after_budget_refusal() {
        let store = fresh_store(2, 4);
        let budget = MemoryBudget::new(600);
        let mut spilled_at = None;
        for i in 0..16u64 {
            store.push(i, 0, vec![i as f32, 0.0], Some(&budget)).unwrap();
            if spilled_at.is_none() {
                spilled_at = store.spill_count();
            }
        }
        let spilled_at = spilled_at.expect("tiny budget must spill");
        assert!(spilled_at < 16);

        // Spilled elements read back from pages like arena ones.
        let el = store.get(15).unwrap();
        assert_eq!(el.tuple(), 15);
        assert_eq!(el.vector(), &[15.0, 0.0]);

        // Neighbor updates work on both representations.
        store.set_neighbors(15, 0, vec![0, 1]).unwrap();
        assert_eq!(store.neighbors(15, 0).unwrap(), vec![0, 1]);
        store.set_neighbors(0, 0, vec![15]).unwrap();
        assert_eq!(store.neighbors(0, 0).unwrap(), vec![15]);
    }

    #[test]
    fn finalize_then_reload() {
        let pages = Arc::new(MemoryPageStore::new());
        let store = GraphStore::new(Arc::clone(&pages) as Arc<dyn PageStore>, 2, 4);
        for i in 0..8u64 {
            store.push(i, (i % 2) as u8, vec![i as f32, -(i as f32)], None).unwrap();
        }
        store.set_neighbors(0, 0, vec![1, 2, 3]).unwrap();
        store.set_neighbors(1, 1, vec![3]).unwrap();
        store.finalize().unwrap();
        let directory = store.directory().unwrap();

        let reloaded = GraphStore::load(pages, 2, 4, directory).unwrap();
        assert_eq!(reloaded.len(), 8);
        assert_eq!(reloaded.neighbors(0, 0).unwrap(), vec![1, 2, 3]);
        assert_eq!(reloaded.neighbors(1, 1).unwrap(), vec![3]);
        let el = reloaded.get(5).unwrap();
        assert_eq!(el.tuple(), 5);
        assert_eq!(el.vector(), &[5.0, -5.0]);
    }

    #[test]
    fn write_through_updates_survive_reload() {
        let pages = Arc::new(MemoryPageStore::new());
        let store = GraphStore::new(Arc::clone(&pages) as Arc<dyn PageStore>, 2, 4);
        for i in 0..4u64 {
            store.push(i, 0, vec![i as f32, 0.0], None).unwrap();
        }
        store.finalize().unwrap();

        // Mutations after finalize are written through to pages.
        store.set_neighbors(2, 0, vec![0, 3]).unwrap();
        let id = store.push(99, 0, vec![9.0, 9.0], None).unwrap();
        store.set_neighbors(id, 0, vec![2]).unwrap();

        let directory = store.directory().unwrap();
        let reloaded = GraphStore::load(pages, 2, 4, directory).unwrap();
        assert_eq!(reloaded.neighbors(2, 0).unwrap(), vec![0, 3]);
        assert_eq!(reloaded.neighbors(4, 0).unwrap(), vec![2]);
        assert_eq!(reloaded.get(4).unwrap().tuple(), 99);
    }

    #[test]
    fn capacity_violation_rejected() {
        let store = fresh_store(2, 2);
        store.push(0, 0, vec![0.0, 0.0], None).unwrap();
        // Layer 0 cap is 2m = 4.
        assert!(store.set_neighbors(0, 0, vec![1, 2, 3, 4]).is_ok());
        assert!(store.set_neighbors(0, 0, vec![1, 2, 3, 4, 5]).is_err());
    }

    #[test]
    fn level_cap_shrinks_with_m() {
        assert_eq!(max_level_for(16), LEVEL_CEILING);
        let big_m_cap = max_level_for(100);
        assert!(big_m_cap < LEVEL_CEILING);
        assert!(neighbor_record_size(100, big_m_cap) <= PAGE_PAYLOAD);
    }
}
