//! Bounded stage motions.
//!
//! Controllers block until the motor physically stops, which on a stalled
//! motor is forever. Every call here is wrapped in `tokio::time::timeout`; an
//! expired deadline becomes [`DeviceError::Timeout`].

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use super::capabilities::{Axis, StageController, VelocityProfile};
use crate::error::DeviceError;

/// Run a device future with an upper bound on its duration.
pub async fn bounded<T, F>(operation: &str, limit: Duration, fut: F) -> Result<T, DeviceError>
where
    F: Future<Output = Result<T, DeviceError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(DeviceError::Timeout {
            operation: operation.to_string(),
            after: limit,
        }),
    }
}

/// Move one axis and wait for it to stop.
pub async fn move_axis(
    stage: &dyn StageController,
    axis: Axis,
    step: i64,
    limit: Duration,
) -> Result<(), DeviceError> {
    debug!(%axis, step, "Moving axis");
    stage.move_to(axis, step).await?;
    bounded(&format!("wait_until_stopped({axis})"), limit, stage.wait_until_stopped(axis)).await
}

/// Move to `(x, y)`: X first, then Y, each waited on before the next.
pub async fn move_to_xy(
    stage: &dyn StageController,
    x: i64,
    y: i64,
    limit: Duration,
) -> Result<(), DeviceError> {
    move_axis(stage, Axis::X, x, limit).await?;
    move_axis(stage, Axis::Y, y, limit).await
}

/// Apply the same velocity profile to both axes.
pub async fn set_velocity_both(
    stage: &dyn StageController,
    profile: VelocityProfile,
) -> Result<(), DeviceError> {
    for axis in Axis::BOTH {
        stage.set_velocity(axis, profile).await?;
    }
    Ok(())
}

/// Home one axis and wait for the reference search to finish.
pub async fn home_axis(
    stage: &dyn StageController,
    axis: Axis,
    limit: Duration,
) -> Result<(), DeviceError> {
    stage.home(axis).await?;
    bounded(&format!("wait_until_homed({axis})"), limit, stage.wait_until_homed(axis)).await
}
