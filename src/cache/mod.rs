mod artifact;
mod key;

pub use artifact::ArtifactCache;
pub use key::CacheKey;
