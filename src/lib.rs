//! Raw GPT partition table editor.
//!
//! The core validates, prints, constructs and mutates GUID partition tables
//! byte-exactly: both headers, the partition entry array and the protective
//! MBR. No sanity prompts, no filesystem awareness; the caller gets precisely
//! the writes it asked for, with checksums recomputed and the backup side
//! written before the primary.

pub mod bytestream;
pub mod crc32;
pub mod device;
pub mod error;
pub mod freespace;
pub mod gpt;
pub mod guid;
pub mod mbr;
pub mod platform;
pub mod report;
pub mod writer;

pub use error::{Error, Result};
