//! Stage homing.
//!
//! Both axes are first driven back to step 0 at the configured velocity, then
//! both reference searches are started and awaited. Homing is a manual
//! operation: it refuses to run while a scan holds the rig.

use tracing::info;

use super::events::EventBus;
use crate::config::StageConfig;
use crate::error::ScanResult;
use crate::hardware::motion::{bounded, move_to_xy, set_velocity_both};
use crate::hardware::{Axis, Rig, StageController, VelocityProfile};

/// Home both axes of `stage`.
pub async fn home_stage(
    stage: &dyn StageController,
    config: &StageConfig,
    events: &EventBus,
) -> ScanResult<()> {
    events.status("Homing stage...");
    set_velocity_both(
        stage,
        VelocityProfile {
            acceleration: config.acceleration,
            max_velocity: config.max_velocity,
        },
    )
    .await?;
    move_to_xy(stage, 0, 0, config.motion_timeout()).await?;

    for axis in Axis::BOTH {
        stage.home(axis).await?;
    }
    for axis in Axis::BOTH {
        bounded(
            &format!("wait_until_homed({axis})"),
            config.home_timeout(),
            stage.wait_until_homed(axis),
        )
        .await?;
    }

    info!("Stage homed");
    events.status("Stage homed");
    Ok(())
}

/// Lease the rig and home it. Fails with `DeviceError::Busy` during a scan.
pub async fn home(rig: &Rig, config: &StageConfig, events: &EventBus) -> ScanResult<()> {
    let devices = rig.try_lease()?;
    home_stage(devices.stage.as_ref(), config, events).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DeviceError, ScanError};
    use crate::hardware::{MockCamera, MockStage};
    use crate::scan::events::ScanEvent;
    use std::sync::Arc;
    use tracing_test::traced_test;

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_home_stage_sequence() {
        let stage = MockStage::new();
        stage.move_to(Axis::X, 4_000).await.unwrap();
        stage.wait_until_stopped(Axis::X).await.unwrap();

        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        home_stage(&stage, &StageConfig::default(), &bus).await.unwrap();

        assert!(stage.is_homed(Axis::X) && stage.is_homed(Axis::Y));
        assert_eq!(stage.current_position(Axis::X).await.unwrap(), 0);
        assert_eq!(stage.velocity().await.unwrap().max_velocity, 50_000.0);
        assert_eq!(rx.recv().await.unwrap(), ScanEvent::Status("Homing stage...".into()));
        assert_eq!(rx.recv().await.unwrap(), ScanEvent::Status("Stage homed".into()));
        assert!(logs_contain("Stage homed"));
    }

    #[tokio::test]
    async fn test_home_refused_while_leased() {
        let stage = Arc::new(MockStage::new());
        let rig = Rig::new(stage.clone(), Arc::new(MockCamera::new(4, 4)));
        let _scan = rig.lease().await;

        let err = home(&rig, &StageConfig::default(), &EventBus::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Device(DeviceError::Busy)));
        assert!(stage.moves().await.is_empty());
    }
}
