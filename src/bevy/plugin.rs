//! Bevy plugin for gpustage.

use std::sync::Arc;

use bevy_app::{App, Last, Plugin};

use crate::api::config::ResourceConfig;
use crate::bevy::resource::GpuResources;
use crate::bevy::systems::end_frame_system;
use crate::coordinator::ResourceCoordinator;
use crate::gpu::{DeviceBackend, QueueBackend};

/// Bevy plugin that inserts [`GpuResources`] and flushes staged uploads in
/// `Last`.
///
/// # Example
///
/// ```rust,ignore
/// use bevy::prelude::*;
/// use gpustage::bevy::GpuStagePlugin;
///
/// App::new()
///     .add_plugins(DefaultPlugins)
///     .add_plugins(GpuStagePlugin::new(device, ResourceConfig::default()))
///     .run();
/// ```
pub struct GpuStagePlugin {
    device: Arc<dyn DeviceBackend>,
    queues: Arc<dyn QueueBackend>,
    config: ResourceConfig,
}

impl GpuStagePlugin {
    /// Create a plugin over a device implementing both backend traits.
    pub fn new<D>(device: Arc<D>, config: ResourceConfig) -> Self
    where
        D: DeviceBackend + QueueBackend + 'static,
    {
        let queues: Arc<dyn QueueBackend> = device.clone();
        Self {
            device,
            queues,
            config,
        }
    }

    /// Use the high-throughput preset.
    pub fn high_throughput<D>(device: Arc<D>) -> Self
    where
        D: DeviceBackend + QueueBackend + 'static,
    {
        Self::new(device, ResourceConfig::high_throughput())
    }
}

impl Plugin for GpuStagePlugin {
    fn build(&self, app: &mut App) {
        // `build` cannot fail, so a device that cannot host the staging ring
        // leaves the app without the resource.
        match ResourceCoordinator::with_backends(self.device.clone(), self.queues.clone(), self.config.clone()) {
            Ok(coordinator) => {
                app.insert_resource(GpuResources::new(coordinator))
                    .add_systems(Last, end_frame_system);
            }
            Err(err) => log::error!("gpustage plugin disabled: {}", err),
        }
    }
}
