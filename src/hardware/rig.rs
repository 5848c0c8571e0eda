//! Exclusive ownership of the stage and camera.
//!
//! A scan must be the only caller driving the devices for its whole duration.
//! The `Rig` keeps both handles behind an async mutex; whoever holds a
//! [`RigLease`] is the sole mutator. Long operations (scans) take the lease
//! by awaiting it, short manual ones (homing, navigate-to-flake) use
//! [`Rig::try_lease`] and fail fast with [`DeviceError::Busy`].

use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::capabilities::{CameraController, StageController};
use crate::error::DeviceError;

/// The pair of device handles a scan drives.
pub struct Devices {
    pub stage: Arc<dyn StageController>,
    pub camera: Arc<dyn CameraController>,
}

/// Shared, lockable access point to the devices.
#[derive(Clone)]
pub struct Rig {
    inner: Arc<Mutex<Devices>>,
}

/// Exclusive access to the devices; released on drop.
pub type RigLease = OwnedMutexGuard<Devices>;

impl Rig {
    pub fn new(stage: Arc<dyn StageController>, camera: Arc<dyn CameraController>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Devices { stage, camera })),
        }
    }

    /// Wait until the devices are free and take them.
    pub async fn lease(&self) -> RigLease {
        self.inner.clone().lock_owned().await
    }

    /// Take the devices if nobody else holds them.
    pub fn try_lease(&self) -> Result<RigLease, DeviceError> {
        self.inner
            .clone()
            .try_lock_owned()
            .map_err(|_| DeviceError::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockCamera, MockStage};

    fn rig() -> Rig {
        Rig::new(Arc::new(MockStage::new()), Arc::new(MockCamera::new(4, 4)))
    }

    #[tokio::test]
    async fn test_try_lease_fails_while_leased() {
        let rig = rig();
        let lease = rig.lease().await;
        assert!(matches!(rig.try_lease(), Err(DeviceError::Busy)));
        drop(lease);
        assert!(rig.try_lease().is_ok());
    }
}
