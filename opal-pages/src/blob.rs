//! Variable-length records spanning chained pages.
//!
//! Each page in a chain carries a link to the next page, the byte count
//! used on this page and the raw chunk. Serde records are carried as
//! bincode blobs. Rewrites reuse the existing chain in place and extend it
//! when the record grew; a shrunk record simply terminates the chain early.

use opal_core::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::page::{NO_PAGE, PAGE_PAYLOAD, Page, PageId};
use crate::store::PageStore;

const LINK_BYTES: usize = 4;
const LEN_BYTES: usize = 2;
const CHUNK_BYTES: usize = PAGE_PAYLOAD - LINK_BYTES - LEN_BYTES;

fn chain_next(page: &Page) -> PageId {
    let mut link = [0u8; 4];
    link.copy_from_slice(&page.payload()[..LINK_BYTES]);
    PageId::from_le_bytes(link)
}

fn chunk_of(page: &Page) -> Result<&[u8]> {
    let mut len = [0u8; 2];
    len.copy_from_slice(&page.payload()[LINK_BYTES..LINK_BYTES + LEN_BYTES]);
    let len = u16::from_le_bytes(len) as usize;
    if len > CHUNK_BYTES {
        return Err(Error::Page(format!("corrupt chain chunk length {len}")));
    }
    Ok(&page.payload()[LINK_BYTES + LEN_BYTES..LINK_BYTES + LEN_BYTES + len])
}

/// Write `bytes` into a page chain. When `head` names an existing chain
/// its pages are reused in place; otherwise a fresh chain is allocated.
/// Returns the head page id.
pub fn write_blob(store: &dyn PageStore, head: Option<PageId>, bytes: &[u8]) -> Result<PageId> {
    // Collect reusable page ids from the old chain.
    let mut reusable = Vec::new();
    if let Some(head) = head {
        let mut current = head;
        while current != NO_PAGE {
            reusable.push(current);
            let pinned = store.read(current)?;
            current = chain_next(&pinned);
        }
    }

    let chunks: Vec<&[u8]> = if bytes.is_empty() {
        vec![&[][..]]
    } else {
        bytes.chunks(CHUNK_BYTES).collect()
    };

    let mut ids = Vec::with_capacity(chunks.len());
    for slot in 0..chunks.len() {
        match reusable.get(slot) {
            Some(&id) => ids.push(id),
            None => ids.push(store.allocate()?),
        }
    }

    for (slot, chunk) in chunks.iter().enumerate() {
        let next = ids.get(slot + 1).copied().unwrap_or(NO_PAGE);
        let mut page = Page::new();
        page.payload_mut()[..LINK_BYTES].copy_from_slice(&next.to_le_bytes());
        page.payload_mut()[LINK_BYTES..LINK_BYTES + LEN_BYTES]
            .copy_from_slice(&(chunk.len() as u16).to_le_bytes());
        page.payload_mut()[LINK_BYTES + LEN_BYTES..LINK_BYTES + LEN_BYTES + chunk.len()]
            .copy_from_slice(chunk);
        store.write(ids[slot], &page)?;
    }

    Ok(ids[0])
}

/// Read a full chain back into a byte vector.
pub fn read_blob(store: &dyn PageStore, head: PageId) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    let mut current = head;
    while current != NO_PAGE {
        let pinned = store.read(current)?;
        bytes.extend_from_slice(chunk_of(&pinned)?);
        current = chain_next(&pinned);
    }
    Ok(bytes)
}

/// Serialize a record into a single page (page 0 metadata convention):
/// `u16` length prefix, then the bincode payload.
pub fn write_meta_page<T: Serialize>(store: &dyn PageStore, id: PageId, record: &T) -> Result<()> {
    let bytes = bincode::serialize(record).map_err(|e| Error::Serialization(e.to_string()))?;
    if bytes.len() + 2 > PAGE_PAYLOAD {
        return Err(Error::Page("metadata record exceeds one page".into()));
    }
    let mut page = Page::new();
    page.payload_mut()[..2].copy_from_slice(&(bytes.len() as u16).to_le_bytes());
    page.payload_mut()[2..2 + bytes.len()].copy_from_slice(&bytes);
    store.write(id, &page)
}

/// Counterpart of [`write_meta_page`].
pub fn read_meta_page<T: DeserializeOwned>(store: &dyn PageStore, id: PageId) -> Result<T> {
    let pinned = store.read(id)?;
    let len = u16::from_le_bytes([pinned.payload()[0], pinned.payload()[1]]) as usize;
    if len + 2 > PAGE_PAYLOAD {
        return Err(Error::Page("corrupt metadata length".into()));
    }
    bincode::deserialize(&pinned.payload()[2..2 + len])
        .map_err(|e| Error::Serialization(e.to_string()))
}

/// Serialize a record into a (possibly reused) page chain.
pub fn write_record<T: Serialize>(
    store: &dyn PageStore,
    head: Option<PageId>,
    record: &T,
) -> Result<PageId> {
    let bytes = bincode::serialize(record).map_err(|e| Error::Serialization(e.to_string()))?;
    write_blob(store, head, &bytes)
}

/// Deserialize a record from a page chain.
pub fn read_record<T: DeserializeOwned>(store: &dyn PageStore, head: PageId) -> Result<T> {
    let bytes = read_blob(store, head)?;
    bincode::deserialize(&bytes).map_err(|e| Error::Serialization(e.to_string()))
}
