//! On-page layout of an IVFFlat index.
//!
//! Page 0 holds the metadata record. The centroid table follows as packed
//! float32 rows starting at page 1. The list directory (head/tail page of
//! every inverted list) lives in a chained blob; list pages carry
//! fixed-size `(tuple id, vector)` entries plus a chain link.

use opal_core::types::TupleId;
use opal_core::{Error, Result};
use opal_pages::{
    NO_PAGE, PAGE_PAYLOAD, Page, PageId, PageStore, read_blob, read_meta_page, write_blob,
    write_meta_page,
};
use opal_vector::DistanceKind;
use serde::{Deserialize, Serialize};

/// Metadata record on page 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct IvfMeta {
    pub version: u32,
    pub dim: u32,
    pub lists: u32,
    pub distance: DistanceKind,
    /// Number of pages holding the packed centroid table (pages
    /// `1..=centroid_pages`).
    pub centroid_pages: u32,
    /// Head of the list-directory blob chain.
    pub directory_head: PageId,
}

pub(crate) const META_PAGE: PageId = 0;

pub(crate) fn write_meta(store: &dyn PageStore, meta: &IvfMeta) -> Result<()> {
    write_meta_page(store, META_PAGE, meta)
}

pub(crate) fn read_meta(store: &dyn PageStore) -> Result<IvfMeta> {
    read_meta_page(store, META_PAGE)
}

/// Per-list chain endpoints, serialized into the directory blob.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct ListInfo {
    pub head: PageId,
    pub tail: PageId,
}

impl ListInfo {
    pub fn empty() -> Self {
        Self {
            head: NO_PAGE,
            tail: NO_PAGE,
        }
    }
}

pub(crate) fn write_directory(
    store: &dyn PageStore,
    head: Option<PageId>,
    lists: &[ListInfo],
) -> Result<PageId> {
    let mut bytes = Vec::with_capacity(lists.len() * 8);
    for info in lists {
        bytes.extend_from_slice(&info.head.to_le_bytes());
        bytes.extend_from_slice(&info.tail.to_le_bytes());
    }
    write_blob(store, head, &bytes)
}

pub(crate) fn read_directory(
    store: &dyn PageStore,
    head: PageId,
    lists: usize,
) -> Result<Vec<ListInfo>> {
    let bytes = read_blob(store, head)?;
    if bytes.len() != lists * 8 {
        return Err(Error::Page(format!(
            "list directory holds {} bytes, expected {}",
            bytes.len(),
            lists * 8
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|c| ListInfo {
            head: PageId::from_le_bytes([c[0], c[1], c[2], c[3]]),
            tail: PageId::from_le_bytes([c[4], c[5], c[6], c[7]]),
        })
        .collect())
}

// Centroid table: packed rows, no per-page header; the row count and
// dimension in the metadata make the layout deterministic.

pub(crate) fn centroids_per_page(dim: usize) -> usize {
    PAGE_PAYLOAD / (dim * 4)
}

/// Writes the packed centroid table beginning at page 1. Pages must be
/// allocated in order by the caller (fresh build writes pages 1..=n).
pub(crate) fn write_centroids(
    store: &dyn PageStore,
    centroids: &[f32],
    dim: usize,
) -> Result<u32> {
    let per_page = centroids_per_page(dim);
    let rows: Vec<&[f32]> = centroids.chunks_exact(dim).collect();
    let mut pages = 0u32;
    for chunk in rows.chunks(per_page) {
        let id = store.allocate()?;
        let mut page = Page::new();
        let mut offset = 0;
        for row in chunk {
            for x in *row {
                page.payload_mut()[offset..offset + 4].copy_from_slice(&x.to_le_bytes());
                offset += 4;
            }
        }
        store.write(id, &page)?;
        pages += 1;
    }
    Ok(pages)
}

pub(crate) fn read_centroids(store: &dyn PageStore, lists: usize, dim: usize) -> Result<Vec<f32>> {
    let per_page = centroids_per_page(dim);
    let mut centroids = Vec::with_capacity(lists * dim);
    let mut remaining = lists;
    let mut page_id: PageId = 1;
    while remaining > 0 {
        let pinned = store.read(page_id)?;
        let rows = remaining.min(per_page);
        for slot in 0..rows {
            let base = slot * dim * 4;
            for c in pinned.payload()[base..base + dim * 4].chunks_exact(4) {
                centroids.push(f32::from_le_bytes([c[0], c[1], c[2], c[3]]));
            }
        }
        remaining -= rows;
        page_id += 1;
    }
    Ok(centroids)
}

// List pages: `next` link, entry count, then packed entries.

const LIST_HEADER: usize = 8; // next u32, count u16, reserved u16

pub(crate) fn entry_size(dim: usize) -> usize {
    8 + dim * 4
}

pub(crate) fn entries_per_page(dim: usize) -> usize {
    (PAGE_PAYLOAD - LIST_HEADER) / entry_size(dim)
}

pub(crate) fn list_next(page: &Page) -> PageId {
    PageId::from_le_bytes([
        page.payload()[0],
        page.payload()[1],
        page.payload()[2],
        page.payload()[3],
    ])
}

pub(crate) fn list_count(page: &Page) -> usize {
    u16::from_le_bytes([page.payload()[4], page.payload()[5]]) as usize
}

pub(crate) fn init_list_page(page: &mut Page) {
    page.payload_mut()[..4].copy_from_slice(&NO_PAGE.to_le_bytes());
    page.payload_mut()[4..6].copy_from_slice(&0u16.to_le_bytes());
}

pub(crate) fn set_list_next(page: &mut Page, next: PageId) {
    page.payload_mut()[..4].copy_from_slice(&next.to_le_bytes());
}

pub(crate) fn push_list_entry(page: &mut Page, dim: usize, tuple: TupleId, data: &[f32]) {
    let slot = list_count(page);
    debug_assert!(slot < entries_per_page(dim));
    let base = LIST_HEADER + slot * entry_size(dim);
    page.payload_mut()[base..base + 8].copy_from_slice(&tuple.to_le_bytes());
    let mut offset = base + 8;
    for x in data {
        page.payload_mut()[offset..offset + 4].copy_from_slice(&x.to_le_bytes());
        offset += 4;
    }
    page.payload_mut()[4..6].copy_from_slice(&((slot + 1) as u16).to_le_bytes());
}

/// Decodes the entry in `slot` into `buf`, returning the tuple id.
pub(crate) fn read_list_entry(page: &Page, dim: usize, slot: usize, buf: &mut [f32]) -> TupleId {
    let base = LIST_HEADER + slot * entry_size(dim);
    let mut id_bytes = [0u8; 8];
    id_bytes.copy_from_slice(&page.payload()[base..base + 8]);
    let tuple = TupleId::from_le_bytes(id_bytes);
    for (i, c) in page.payload()[base + 8..base + 8 + dim * 4]
        .chunks_exact(4)
        .enumerate()
    {
        buf[i] = f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
    }
    tuple
}
