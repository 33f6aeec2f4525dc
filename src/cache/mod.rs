// =============================================================================
// Layered cache tier — L1 in-process, L2 shared key-value, L3 durable
// =============================================================================

pub mod layered;
pub mod models;
pub mod warmup;

pub use layered::{CachedArtifact, LayeredCache, SharedKv};
pub use models::ModelCache;
pub use warmup::WarmupPool;
