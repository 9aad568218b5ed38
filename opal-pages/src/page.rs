//! Fixed-size page images.

/// Identifier of a page within one index's block file.
pub type PageId = u32;

/// Sentinel for "no page" in chain links.
pub const NO_PAGE: PageId = u32::MAX;

/// Page size in bytes, matching the host block size.
pub const PAGE_SIZE: usize = 8192;

/// Usable payload bytes per page; the final four bytes hold a CRC32
/// trailer over the payload.
pub const PAGE_PAYLOAD: usize = PAGE_SIZE - 4;

/// One page image. Payload mutation happens on a private copy; the store
/// seals the trailer when the image is logged and written back.
#[derive(Debug, Clone)]
pub struct Page {
    bytes: Box<[u8; PAGE_SIZE]>,
}

impl Page {
    pub fn new() -> Self {
        Self {
            bytes: Box::new([0u8; PAGE_SIZE]),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[..PAGE_PAYLOAD]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[..PAGE_PAYLOAD]
    }

    /// Recompute and store the CRC trailer.
    pub fn seal(&mut self) {
        let crc = crc32fast::hash(&self.bytes[..PAGE_PAYLOAD]);
        self.bytes[PAGE_PAYLOAD..].copy_from_slice(&crc.to_le_bytes());
    }

    /// True when the trailer matches the payload.
    pub fn verify(&self) -> bool {
        let mut stored = [0u8; 4];
        stored.copy_from_slice(&self.bytes[PAGE_PAYLOAD..]);
        crc32fast::hash(&self.bytes[..PAGE_PAYLOAD]) == u32::from_le_bytes(stored)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}
