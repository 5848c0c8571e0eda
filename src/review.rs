//! Post-hoc review of a session and navigation back to flakes.
//!
//! A review reads the session ledger, which may still be growing while a scan
//! runs; [`SessionReview::refresh`] picks up newly completed rows. Navigation
//! converts a capture's peak pixel into the stage target that puts the flake
//! in the middle of the 10× field of view, optionally shifted for the 50×
//! objective.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{ReviewConfig, ScanConfig};
use crate::error::{ScanError, ScanResult, StorageError};
use crate::hardware::motion::move_to_xy;
use crate::hardware::Rig;
use crate::scan::plan::Position;
use crate::scan::record::{RecordEntry, ScanRecord};
use crate::session::Session;

/// Which objective the stage target is computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Objective {
    #[default]
    X10,
    X50,
}

/// Loaded rows of one session.
#[derive(Debug, Clone)]
pub struct SessionReview {
    session: Session,
    entries: Vec<RecordEntry>,
}

impl SessionReview {
    pub fn load(session: Session) -> Result<Self, StorageError> {
        let entries = ScanRecord::load(session.record_path())?;
        Ok(Self { session, entries })
    }

    /// Re-read the ledger. Returns how many new rows appeared.
    pub fn refresh(&mut self) -> Result<usize, StorageError> {
        let entries = ScanRecord::load(self.session.record_path())?;
        let added = entries.len().saturating_sub(self.entries.len());
        self.entries = entries;
        Ok(added)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn entries(&self) -> &[RecordEntry] {
        &self.entries
    }

    pub fn entry(&self, index: u64) -> Option<&RecordEntry> {
        // Indices are dense from 0
        self.entries.get(usize::try_from(index).ok()?)
    }

    /// Flake-positive indices in scan order.
    pub fn flake_indices(&self) -> Vec<u64> {
        self.entries
            .iter()
            .filter(|e| e.flake_flag)
            .map(|e| e.index)
            .collect()
    }

    /// Flake-positive rows, highest score first (ties keep scan order).
    pub fn ranked_flakes(&self) -> Vec<RecordEntry> {
        let mut flakes: Vec<RecordEntry> =
            self.entries.iter().filter(|e| e.flake_flag).copied().collect();
        flakes.sort_by(|a, b| b.score.cmp(&a.score));
        flakes
    }
}

/// Stage target that centres `entry`'s peak pixel in the field of view.
pub fn stage_target_for(
    entry: &RecordEntry,
    review: &ReviewConfig,
    steps_per_um: f64,
    objective: Objective,
) -> Position {
    let steps_per_px = steps_per_um / review.px_per_um;
    let x = entry.x_pos as f64 - f64::from(entry.peak_x) * steps_per_px
        + review.center_offset_x as f64;
    let y = entry.y_pos as f64 + f64::from(entry.peak_y) * steps_per_px
        - review.center_offset_y as f64;
    let target = Position::new(x.round() as i64, y.round() as i64);

    match objective {
        Objective::X10 => target,
        Objective::X50 => {
            let (dx, dy) = review.objective_50x_shift;
            Position::new(target.x + dx, target.y + dy)
        }
    }
}

/// Drive the stage to capture `index` of a reviewed session.
///
/// Refuses with `DeviceError::Busy` while a scan holds the rig.
pub async fn goto_flake(
    rig: &Rig,
    review: &SessionReview,
    index: u64,
    config: &ScanConfig,
    objective: Objective,
) -> ScanResult<Position> {
    let entry = review.entry(index).ok_or(ScanError::UnknownCapture(index))?;
    let target = stage_target_for(entry, &config.review, config.grid.steps_per_um, objective);

    let devices = rig.try_lease()?;
    move_to_xy(
        devices.stage.as_ref(),
        target.x,
        target.y,
        config.stage.motion_timeout(),
    )
    .await?;
    info!(index, x = target.x, y = target.y, ?objective, "Moved stage to flake");
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceError;
    use crate::hardware::{Axis, MockCamera, MockStage, StageController};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn row(index: u64, flake: bool, score: u64) -> RecordEntry {
        RecordEntry {
            index,
            x_pos: 18_800 * index as i64,
            y_pos: 17_278,
            flake_flag: flake,
            score,
            peak_x: 640,
            peak_y: 512,
        }
    }

    fn review_with(rows: &[RecordEntry]) -> (tempfile::TempDir, SessionReview) {
        let root = tempdir().unwrap();
        let session = Session::create_named(root.path(), "review").unwrap();
        let mut record = ScanRecord::create(session.record_path()).unwrap();
        for r in rows {
            record.append(r).unwrap();
        }
        let review = SessionReview::load(Session::open(session.dir()).unwrap()).unwrap();
        (root, review)
    }

    #[test]
    fn test_flake_listing_and_ranking() {
        let (_root, review) = review_with(&[
            row(0, false, 3),
            row(1, true, 150),
            row(2, true, 900),
            row(3, false, 40),
            row(4, true, 150),
        ]);
        assert_eq!(review.flake_indices(), vec![1, 2, 4]);
        let ranked: Vec<u64> = review.ranked_flakes().iter().map(|e| e.index).collect();
        assert_eq!(ranked, vec![2, 1, 4]);
    }

    #[test]
    fn test_refresh_sees_new_rows() {
        let (_root, mut review) = review_with(&[row(0, false, 0)]);
        let mut record = ScanRecord::open(review.session().record_path()).unwrap();
        record.append(&row(1, true, 500)).unwrap();
        assert_eq!(review.refresh().unwrap(), 1);
        assert_eq!(review.flake_indices(), vec![1]);
    }

    #[test]
    fn test_stage_target_geometry() {
        let review = ReviewConfig {
            px_per_um: 2.0,
            center_offset_x: 1_000,
            center_offset_y: 500,
            objective_50x_shift: (-10, 20),
        };
        let entry = RecordEntry {
            index: 0,
            x_pos: 50_000,
            y_pos: 20_000,
            flake_flag: true,
            score: 0,
            peak_x: 100,
            peak_y: 40,
        };
        // 10 steps/um at 2 px/um: 5 steps per pixel
        let target = stage_target_for(&entry, &review, 10.0, Objective::X10);
        assert_eq!(target, Position::new(50_000 - 500 + 1_000, 20_000 + 200 - 500));
        let shifted = stage_target_for(&entry, &review, 10.0, Objective::X50);
        assert_eq!(shifted, Position::new(target.x - 10, target.y + 20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_goto_flake_moves_stage() {
        let (_root, review) = review_with(&[row(0, false, 0), row(1, true, 300)]);
        let stage = Arc::new(MockStage::new());
        let rig = Rig::new(stage.clone(), Arc::new(MockCamera::new(4, 4)));
        let config = ScanConfig::default();

        let target = goto_flake(&rig, &review, 1, &config, Objective::X10).await.unwrap();
        assert_eq!(stage.current_position(Axis::X).await.unwrap(), target.x);
        assert_eq!(stage.current_position(Axis::Y).await.unwrap(), target.y);
    }

    #[tokio::test]
    async fn test_goto_flake_errors() {
        let (_root, review) = review_with(&[row(0, true, 300)]);
        let rig = Rig::new(Arc::new(MockStage::new()), Arc::new(MockCamera::new(4, 4)));
        let config = ScanConfig::default();

        let err = goto_flake(&rig, &review, 9, &config, Objective::X10).await.unwrap_err();
        assert!(matches!(err, ScanError::UnknownCapture(9)));

        let _scan = rig.lease().await;
        let err = goto_flake(&rig, &review, 0, &config, Objective::X10).await.unwrap_err();
        assert!(matches!(err, ScanError::Device(DeviceError::Busy)));
    }
}
