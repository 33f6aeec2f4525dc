// =============================================================================
// Precompute tier — features, indicators, and model pretraining on a schedule
// =============================================================================

pub mod features;
pub mod model;
pub mod scheduler;

pub use features::{FeatureSet, FeatureSupervisor};
pub use model::{ModelType, TrainedModel};
pub use scheduler::PrecomputeScheduler;
