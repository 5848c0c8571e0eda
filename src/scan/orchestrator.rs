//! Grid scan state machine.
//!
//! ```text
//! Idle → Initializing → AtOrigin → Calibrating → Scanning → Completed
//!            └────────────┴────────────┴────────────┴──→ Aborted | Cancelled
//! ```
//!
//! One spawned task runs the whole scan and is the only user of the stage and
//! camera while it holds the [`RigLease`]. Each position goes through
//! move → wait → settle → capture → classify → store images → append row →
//! notify. Any device, calibration or storage failure ends the scan in
//! `Aborted`; rows appended before the failure stay on disk. Cancellation is
//! only observed before a position is started, never mid-move.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::{spawn_blocking, JoinHandle};
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};

use super::events::{EventBus, ScanEvent, ScanState};
use super::plan::GridPlan;
use super::record::{CaptureResult, RecordEntry, ScanRecord};
use crate::config::ScanConfig;
use crate::detection::render::render_flake;
use crate::detection::{FrameClassifier, ThresholdCalibrator, ThresholdModel};
use crate::error::{ScanError, ScanResult, StorageError};
use crate::hardware::motion::{move_to_xy, set_velocity_both};
use crate::hardware::{CameraSettings, Devices, Rig, RigLease, VelocityProfile};
use crate::session::{GridSummary, ImageSink, Session, SessionMetadata};

/// What a finished scan produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanSummary {
    pub session_id: String,
    pub captured: u64,
    /// Indices of flake-positive captures, in scan order
    pub flakes: Vec<u64>,
    pub threshold: ThresholdModel,
}

#[derive(Debug, Default)]
struct Tally {
    captured: u64,
    flakes: Vec<u64>,
    threshold: Option<ThresholdModel>,
}

/// Runs one grid scan into one session.
pub struct ScanOrchestrator {
    config: ScanConfig,
    plan: GridPlan,
    session: Session,
    sink: Arc<dyn ImageSink>,
    classifier: FrameClassifier,
    calibrator: ThresholdCalibrator,
    events: EventBus,
}

impl ScanOrchestrator {
    /// Prepare a scan of the configured grid.
    pub fn new(config: ScanConfig, session: Session, sink: Arc<dyn ImageSink>) -> ScanResult<Self> {
        let plan = GridPlan::from_config(&config.grid)?;
        Ok(Self {
            classifier: FrameClassifier::from_config(&config.detection),
            calibrator: ThresholdCalibrator::from_config(&config),
            config,
            plan,
            session,
            sink,
            events: EventBus::default(),
        })
    }

    /// Scan `plan` instead of the configured grid.
    pub fn with_plan(mut self, plan: GridPlan) -> Self {
        self.plan = plan;
        self
    }

    pub fn plan(&self) -> &GridPlan {
        &self.plan
    }

    /// Subscribe before spawning to see every event from `Started` on.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    /// Wait for the rig, then run the scan on its own task.
    ///
    /// A second task awaits the scan and holds the only other publisher, so a
    /// panic inside the scan still ends in `Aborted` and closes the channels.
    pub async fn spawn(self, rig: &Rig) -> ScanHandle {
        let lease = rig.lease().await;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let events = self.events.subscribe();
        let state = self.events.watch_state();
        let supervisor = Supervisor {
            events: self.events.clone(),
            session: self.session.clone(),
            grid: self.grid_summary(),
            config: self.config.clone(),
        };
        let scan = tokio::spawn(self.run(lease, cancel_rx));
        let task = tokio::spawn(supervisor.supervise(scan));
        ScanHandle {
            events,
            state,
            cancel: cancel_tx,
            task,
        }
    }

    fn grid_summary(&self) -> GridSummary {
        let (columns, rows) = self.plan.dimensions();
        GridSummary {
            columns,
            rows,
            total: self.plan.len(),
        }
    }

    /// Run the scan to a terminal state on the current task.
    ///
    /// The lease is dropped on return, handing the devices back to the rig.
    #[instrument(skip_all, fields(session = %self.session.id()))]
    pub async fn run(
        self,
        lease: RigLease,
        cancel: watch::Receiver<bool>,
    ) -> ScanResult<ScanSummary> {
        let total = self.plan.len();
        self.events.emit(ScanEvent::Started {
            session_id: self.session.id().to_string(),
            total,
        });

        let mut metadata =
            SessionMetadata::new(self.session.id(), self.grid_summary(), &self.config);
        let mut tally = Tally::default();
        let outcome = self.execute(&lease, &cancel, &mut metadata, &mut tally).await;
        drop(lease);

        let (state, message) = match &outcome {
            Ok(()) => (
                ScanState::Completed,
                format!(
                    "Scan complete: {} images, {} flakes",
                    tally.captured,
                    tally.flakes.len()
                ),
            ),
            Err(ScanError::Cancelled) => (
                ScanState::Cancelled,
                format!("Scan cancelled after {} of {total} images", tally.captured),
            ),
            Err(err) => {
                error!(%err, captured = tally.captured, "Scan aborted");
                if err.is_device_failure() {
                    warn!("Stage position is unknown; home before the next scan");
                }
                (
                    ScanState::Aborted,
                    format!("Scan aborted after {} of {total} images: {err}", tally.captured),
                )
            }
        };

        metadata.captured = tally.captured;
        metadata.flakes = tally.flakes.len() as u64;
        finish(&self.events, &self.session, &mut metadata, state, message);

        outcome?;
        let threshold = tally
            .threshold
            .ok_or_else(|| ScanError::Calibration("scan finished without a threshold".into()))?;
        Ok(ScanSummary {
            session_id: self.session.id().to_string(),
            captured: tally.captured,
            flakes: tally.flakes,
            threshold,
        })
    }

    async fn execute(
        &self,
        devices: &Devices,
        cancel: &watch::Receiver<bool>,
        metadata: &mut SessionMetadata,
        tally: &mut Tally,
    ) -> ScanResult<()> {
        let stage = devices.stage.as_ref();
        let camera = devices.camera.as_ref();
        let motion_timeout = self.config.stage.motion_timeout();
        let settle = Duration::from_millis(self.config.camera.settle_ms);
        let total = self.plan.len();

        self.events.transition(ScanState::Initializing);
        let (columns, rows) = self.plan.dimensions();
        self.events
            .status(format!("Grid scan dimensions: ({columns}x{rows})"));
        if self.plan.is_empty() {
            return Err(ScanError::InvalidPlan("plan has no positions".into()));
        }
        set_velocity_both(
            stage,
            VelocityProfile {
                acceleration: self.config.stage.acceleration,
                max_velocity: self.config.stage.max_velocity,
            },
        )
        .await?;
        camera
            .configure(&CameraSettings {
                exposure_ms: self.config.camera.exposure_ms,
                gain: self.config.camera.gain,
                pixel_rate_hz: self.config.camera.pixel_rate_hz,
            })
            .await?;
        self.session.save_metadata(metadata)?;
        let path = self.session.record_path();
        let record = spawn_blocking(move || ScanRecord::create(path))
            .await
            .map_err(|e| ScanError::Join(e.to_string()))??;
        let record = Arc::new(Mutex::new(record));

        self.events.transition(ScanState::AtOrigin);
        if let Some(origin) = self.plan.origin() {
            move_to_xy(stage, origin.x, origin.y, motion_timeout).await?;
        }

        self.events.transition(ScanState::Calibrating);
        self.events.status("Calibrating threshold...");
        let model = self
            .calibrator
            .calibrate(stage, camera, self.plan.positions())
            .await?;
        tally.threshold = Some(model);
        metadata.threshold = Some(model);
        self.session.save_metadata(metadata)?;
        self.events.status(format!(
            "Threshold {:.1}, about {:.1} s per image",
            model.threshold,
            model.expected_dwell.as_secs_f64()
        ));

        self.events.transition(ScanState::Scanning);
        for (i, position) in self.plan.iter().enumerate() {
            if *cancel.borrow() {
                return Err(ScanError::Cancelled);
            }
            let index = i as u64;

            move_to_xy(stage, position.x, position.y, motion_timeout).await?;
            sleep(settle).await;
            let frame = camera.capture_frame().await?;
            let classification = self.classifier.classify(&frame, model.threshold);
            let capture = CaptureResult {
                index,
                frame,
                position: *position,
                classification,
            };

            self.sink.store_raw(index, &capture.frame).await?;
            if classification.is_flake {
                let views = render_flake(
                    &capture.frame,
                    &classification,
                    model.threshold,
                    &self.config.detection,
                );
                self.sink.store_flake(index, &views).await?;
            }
            tally.captured = append_row(&record, capture.entry()).await?;

            if classification.is_flake {
                info!(
                    index,
                    score = classification.score,
                    peak = ?classification.peak,
                    "Flake recorded"
                );
                tally.flakes.push(index);
                self.events.emit(ScanEvent::FlakeRecorded {
                    index,
                    score: classification.score,
                });
            }

            let completed = i + 1;
            self.events.emit(ScanEvent::Progress {
                completed,
                total,
                percent: completed as f64 * 100.0 / total as f64,
            });
            self.events.emit(ScanEvent::RemainingTime(
                model.expected_dwell * (total - completed) as u32,
            ));
        }

        Ok(())
    }
}

/// Durably append `entry` on the blocking pool. Returns the new row count.
async fn append_row(record: &Arc<Mutex<ScanRecord>>, entry: RecordEntry) -> ScanResult<u64> {
    let record = record.clone();
    let rows = spawn_blocking(move || -> Result<u64, StorageError> {
        let mut record = record.blocking_lock();
        record.append(&entry)?;
        Ok(record.len())
    })
    .await
    .map_err(|e| ScanError::Join(e.to_string()))??;
    Ok(rows)
}

/// Record the terminal state in `session.json`, then announce it.
fn finish(
    events: &EventBus,
    session: &Session,
    metadata: &mut SessionMetadata,
    state: ScanState,
    message: String,
) {
    metadata.final_state = Some(state);
    if let Err(err) = session.save_metadata(metadata) {
        warn!(%err, "Failed to update session metadata");
    }

    events.transition(state);
    events.status(message.clone());
    events.emit(ScanEvent::Finished {
        state,
        captured: metadata.captured,
        flakes: metadata.flakes,
        message,
    });
}

/// Owns the publishing side of a spawned scan until it has finished.
struct Supervisor {
    events: EventBus,
    session: Session,
    grid: GridSummary,
    config: ScanConfig,
}

impl Supervisor {
    async fn supervise(self, scan: JoinHandle<ScanResult<ScanSummary>>) -> ScanResult<ScanSummary> {
        let err = match scan.await {
            Ok(outcome) => return outcome,
            Err(err) => ScanError::Join(err.to_string()),
        };
        error!(%err, "Scan task failed");

        // The rows on disk are all that is known about the lost task
        let entries = ScanRecord::load(self.session.record_path()).unwrap_or_default();
        let mut metadata = match self.session.load_metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(%err, "Session metadata unreadable; writing a fresh copy");
                SessionMetadata::new(self.session.id(), self.grid, &self.config)
            }
        };
        metadata.captured = entries.len() as u64;
        metadata.flakes = entries.iter().filter(|e| e.flake_flag).count() as u64;

        let message = format!(
            "Scan aborted after {} of {} images: {err}",
            metadata.captured, self.grid.total
        );
        finish(
            &self.events,
            &self.session,
            &mut metadata,
            ScanState::Aborted,
            message,
        );
        Err(err)
    }
}

/// Control and observation of a spawned scan.
///
/// Holds receivers only; both channels close once the scan has published its
/// terminal state.
pub struct ScanHandle {
    events: broadcast::Receiver<ScanEvent>,
    state: watch::Receiver<ScanState>,
    cancel: watch::Sender<bool>,
    task: JoinHandle<ScanResult<ScanSummary>>,
}

impl ScanHandle {
    /// Events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.resubscribe()
    }

    /// Latest state; `changed().await` wakes on every transition.
    pub fn state(&self) -> watch::Receiver<ScanState> {
        self.state.clone()
    }

    /// Ask the scan to stop before its next position.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the scan and return its outcome.
    pub async fn join(self) -> ScanResult<ScanSummary> {
        self.task
            .await
            .map_err(|e| ScanError::Join(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{Frame, MockCamera, MockStage};
    use crate::scan::plan::plan;
    use crate::session::MemoryImageSink;
    use tempfile::tempdir;

    #[tokio::test(start_paused = true)]
    async fn test_state_sequence_on_success() {
        let root = tempdir().unwrap();
        let session = Session::create_named(root.path(), "states").unwrap();
        let rig = Rig::new(
            Arc::new(MockStage::new()),
            Arc::new(MockCamera::scripted(vec![Frame::filled(16, 16, 40)])),
        );
        let orchestrator = ScanOrchestrator::new(
            ScanConfig::default(),
            session.clone(),
            Arc::new(MemoryImageSink::new()),
        )
        .unwrap()
        .with_plan(plan(10, 10, 10, 0).unwrap());
        let mut rx = orchestrator.subscribe();

        let summary = orchestrator.spawn(&rig).await.join().await.unwrap();
        assert_eq!(summary.captured, 4);
        assert!(summary.flakes.is_empty());

        let mut states = Vec::new();
        let mut statuses = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                ScanEvent::StateChanged(s) => states.push(s),
                ScanEvent::Status(s) => statuses.push(s),
                _ => {}
            }
        }
        assert_eq!(
            states,
            vec![
                ScanState::Initializing,
                ScanState::AtOrigin,
                ScanState::Calibrating,
                ScanState::Scanning,
                ScanState::Completed,
            ]
        );
        assert!(statuses.contains(&"Grid scan dimensions: (2x2)".to_string()));

        let metadata = session.load_metadata().unwrap();
        assert_eq!(metadata.final_state, Some(ScanState::Completed));
        assert_eq!(metadata.captured, 4);
        assert_eq!(metadata.threshold.unwrap().threshold, 45.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_returned_after_scan() {
        let root = tempdir().unwrap();
        let session = Session::create_named(root.path(), "lease").unwrap();
        let rig = Rig::new(Arc::new(MockStage::new()), Arc::new(MockCamera::new(8, 8)));
        let orchestrator =
            ScanOrchestrator::new(ScanConfig::default(), session, Arc::new(MemoryImageSink::new()))
                .unwrap()
                .with_plan(plan(0, 10, 10, 0).unwrap());

        let handle = orchestrator.spawn(&rig).await;
        assert!(rig.try_lease().is_err());
        handle.join().await.unwrap();
        assert!(rig.try_lease().is_ok());
    }
}
