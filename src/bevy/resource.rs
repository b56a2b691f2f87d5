//! Bevy resource wrapper for the coordinator.

use bevy_ecs::system::Resource;

use crate::api::stats::BufferStats;
use crate::coordinator::ResourceCoordinator;
use crate::sync::mutex::{Mutex, MutexGuard};

/// Bevy resource that wraps the resource coordinator.
///
/// Systems reach the coordinator via `Res<GpuResources>`.
///
/// # Example
///
/// ```rust,ignore
/// fn upload_system(gpu: Res<GpuResources>, mesh: Res<MeshBuffer>) {
///     gpu.lock().add_data(mesh.id, &mesh.vertices, 16).ok();
/// }
/// ```
#[derive(Resource)]
pub struct GpuResources(Mutex<ResourceCoordinator>);

impl GpuResources {
    pub fn new(coordinator: ResourceCoordinator) -> Self {
        Self(Mutex::new(coordinator))
    }

    /// Lock the coordinator. A system that panicked mid-frame does not
    /// poison it.
    pub fn lock(&self) -> MutexGuard<'_, ResourceCoordinator> {
        self.0.lock()
    }

    /// Current statistics.
    pub fn stats(&self) -> BufferStats {
        self.lock().stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::config::ResourceConfig;
    use crate::gpu::DummyDevice;
    use std::sync::Arc;

    #[test]
    fn test_lock_survives_panicking_system() {
        let coordinator = ResourceCoordinator::new(Arc::new(DummyDevice::new()), ResourceConfig::minimal()).unwrap();
        let gpu = GpuResources::new(coordinator);

        let panicked = std::thread::scope(|s| {
            s.spawn(|| {
                let _guard = gpu.lock();
                panic!("system failed mid-frame");
            })
            .join()
            .is_err()
        });
        assert!(panicked);
        assert_eq!(gpu.stats().registered_buffers, 0);
    }
}
