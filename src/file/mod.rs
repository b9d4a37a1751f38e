//! File-handle access to blobs.
//!
//! - `handle`: [`OpenFile`] lifecycle and the close sequence
//! - `lease`: exclusive write leases
//! - `read`: chunked sequential reads
//! - `write`: buffered block-list writes

pub mod handle;
pub mod lease;
pub mod read;
pub mod write;

pub use handle::{FileOptions, HandleState, Mode, OpenFile};
pub use lease::Lease;
pub use read::BufferedReader;
pub use write::BufferedWriter;
