// =============================================================================
// Change-gated snapshot pipeline — detector + save controller
// =============================================================================

pub mod change_detector;
pub mod save_controller;

pub use change_detector::ChangeDetector;
pub use save_controller::SaveController;
