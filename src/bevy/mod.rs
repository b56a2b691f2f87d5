//! Bevy integration for gpustage.
//!
//! Provides a plugin that owns a [`ResourceCoordinator`](crate::ResourceCoordinator)
//! as a resource and uploads pending GpuBuffer data at the end of each frame.

mod plugin;
mod resource;
mod systems;

pub use plugin::GpuStagePlugin;
pub use resource::GpuResources;
pub use systems::end_frame_system;
