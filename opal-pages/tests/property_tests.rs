//! Property-based tests for the page model
//!
//! Uses proptest to verify page and blob invariants with random inputs

use opal_pages::{MemoryPageStore, Page, PageStore, read_blob, write_blob};
use proptest::prelude::*;

proptest! {
    /// Any payload written through the store reads back unchanged.
    #[test]
    fn page_write_read_roundtrip(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let store = MemoryPageStore::new();
        let id = store.allocate().unwrap();

        let mut page = Page::new();
        page.payload_mut()[..bytes.len()].copy_from_slice(&bytes);
        store.write(id, &page).unwrap();

        let pinned = store.read(id).unwrap();
        prop_assert_eq!(&pinned.payload()[..bytes.len()], &bytes[..]);
    }

    /// Blobs of any size survive the chain codec bit-exactly.
    #[test]
    fn blob_roundtrip(blob in prop::collection::vec(any::<u8>(), 0..30_000)) {
        let store = MemoryPageStore::new();
        let head = write_blob(&store, None, &blob).unwrap();
        prop_assert_eq!(read_blob(&store, head).unwrap(), blob);
    }

    /// Rewriting a chain with new content never loses bytes, regardless of
    /// whether the record grew or shrank.
    #[test]
    fn blob_rewrite_roundtrip(
        first in prop::collection::vec(any::<u8>(), 0..20_000),
        second in prop::collection::vec(any::<u8>(), 0..20_000)
    ) {
        let store = MemoryPageStore::new();
        let head = write_blob(&store, None, &first).unwrap();
        let head = write_blob(&store, Some(head), &second).unwrap();
        prop_assert_eq!(read_blob(&store, head).unwrap(), second);
    }

    /// Every pin taken during a scan is released when the guards drop.
    #[test]
    fn pins_balance(page_ids in prop::collection::vec(0u32..8, 1..64)) {
        let store = MemoryPageStore::new();
        for _ in 0..8 {
            store.allocate().unwrap();
        }

        {
            let mut guards = Vec::new();
            for id in &page_ids {
                guards.push(store.read(*id).unwrap());
            }
            prop_assert_eq!(store.live_pins(), page_ids.len());
        }
        prop_assert_eq!(store.live_pins(), 0);
    }
}
