//! Opal Core Module
//!
//! Shared foundation for the Opal vector search crates:
//! - Error taxonomy and result alias
//! - Tuple identifiers and dimension limits
//! - Host boundary contracts (tuple scans, interrupts, memory budget)
//! - Build progress reporting

pub mod error;
pub mod host;
pub mod progress;
pub mod types;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Version of the Opal on-page format.
pub const FORMAT_VERSION: u32 = 1;
