//! GUID storage and text forms.
//!
//! GPT stores GUIDs in a mixed-endian 16-byte layout: the first three
//! dash-separated groups of the text form are little-endian on disk, the last
//! two big-endian. `Uuid::from_bytes_le` / `to_bytes_le` are exactly that
//! transformation, so conversion stays a one-liner on both sides.

use uuid::Uuid;

use crate::error::{Error, Result};

/// Length of the canonical `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx` form.
pub const TEXT_LEN: usize = 36;

pub fn is_zero(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == 0)
}

/// Lowercase hyphenated text form of a stored GUID.
pub fn to_text(bytes: &[u8; 16]) -> String {
    Uuid::from_bytes_le(*bytes).hyphenated().to_string()
}

/// Parse a textual UUID into the stored byte order.
pub fn from_text(text: &str) -> Result<[u8; 16]> {
    Uuid::try_parse(text)
        .map(|uuid| uuid.to_bytes_le())
        .map_err(|_| Error::BadUuid(text.to_string()))
}

/// Generate an RFC 4122 version 4 GUID in stored byte order.
pub fn generate() -> [u8; 16] {
    Uuid::new_v4().to_bytes_le()
}
