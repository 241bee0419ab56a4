use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use sha2::{Digest, Sha256};

/// Length of an encoded SHA-256 digest without padding.
const ENCODED_LEN: usize = 43;

/// Content address of one resized artifact.
///
/// Derived from the source URL together with the target dimensions, so the
/// same image requested at two sizes gets two keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn derive(url: &str, width: u32, height: u32) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hasher.update(format!("\n{}x{}", width, height).as_bytes());
        Self(URL_SAFE_NO_PAD.encode(hasher.finalize()))
    }

    /// Parse a key handed back by a client. Anything that could not have been
    /// produced by [`CacheKey::derive`] is rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        let well_formed = raw.len() == ENCODED_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');

        well_formed.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
