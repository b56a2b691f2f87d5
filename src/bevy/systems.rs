//! Bevy systems for frame lifecycle management.

use bevy_ecs::system::Res;

use crate::bevy::resource::GpuResources;

/// System that runs at the end of each frame.
///
/// Uploads pending GpuBuffer data and releases dropped transfers.
pub fn end_frame_system(gpu: Res<GpuResources>) {
    if let Err(err) = gpu.lock().end_frame() {
        log::warn!("end of frame upload failed: {}", err);
    }
}
