//! Content-addressed layer tars
//!
//! A layer is an uncompressed tar on disk together with its diffID, the
//! SHA-256 of those exact bytes.

mod store;

pub use store::{diff_id_of_bytes, diff_id_of_file, HashingWriter, Layer, LayerStore};

/// Prefix used for every diffID string
pub const DIGEST_PREFIX: &str = "sha256:";

/// Replace path separators so an identifier can name a single file
pub fn escape_identifier(id: &str) -> String {
    id.replace('/', "_")
}

/// Hex part of a diffID, without the algorithm prefix
pub fn digest_hex(diff_id: &str) -> &str {
    diff_id.strip_prefix(DIGEST_PREFIX).unwrap_or(diff_id)
}
