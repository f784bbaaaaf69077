//! Content hashing used by deduplication.

use md5::{Digest, Md5};

/// Returns the lowercase hex MD5 digest of `content`.
#[must_use]
pub fn content_hash(content: &[u8]) -> String {
    hex::encode(Md5::digest(content))
}
