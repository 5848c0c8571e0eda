//! Mock Hardware Implementations
//!
//! Provides simulated devices for testing and for running the binary without
//! physical hardware. All mock devices use async-safe operations
//! (`tokio::time::sleep`, not `std::thread::sleep`) so tests can run on a
//! paused clock.
//!
//! # Available Mocks
//!
//! - `MockStage` - two-axis stage with travel time proportional to distance
//! - `MockCamera` - camera producing constant, scripted, or scene-rendered frames
//! - `SimulatedSample` - substrate with bright flakes, rendered relative to the
//!   stage position
//!
//! Both devices support fault injection (fail the n-th move / capture, stall
//! an axis) to exercise the abort paths of the scan.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Duration};
use tracing::{debug, trace};

use super::capabilities::{
    Axis, CameraController, CameraSettings, Frame, StageController, VelocityProfile,
};
use super::rig::Rig;
use crate::config::{ScanConfig, SimulatedFlake, SimulationConfig};
use crate::error::DeviceError;

const STAGE: &str = "mock stage";
const CAMERA: &str = "mock camera";

fn axis_index(axis: Axis) -> usize {
    match axis {
        Axis::X => 0,
        Axis::Y => 1,
    }
}

// =============================================================================
// MockStage - Simulated Two-Axis Stage
// =============================================================================

/// Mock two-axis stage with distance-proportional travel time.
///
/// `move_to` only latches the target; the position is committed when
/// `wait_until_stopped` has slept for the travel time, as on the real
/// controllers where the move runs in the background.
pub struct MockStage {
    position: Arc<RwLock<[i64; 2]>>,
    target: Arc<RwLock<[i64; 2]>>,
    steps_per_second: f64,
    velocity: Arc<RwLock<Option<VelocityProfile>>>,
    moves: Arc<Mutex<Vec<(Axis, i64)>>>,
    move_count: AtomicUsize,
    fail_on_move: AtomicUsize,
    stalled: [AtomicBool; 2],
    homed: [AtomicBool; 2],
    released: AtomicBool,
}

impl MockStage {
    /// Create new mock stage at the origin, 1e6 steps/sec.
    pub fn new() -> Self {
        Self::with_speed(1_000_000.0)
    }

    /// Create mock stage with custom speed
    ///
    /// # Arguments
    /// * `steps_per_second` - Travel speed of each axis
    pub fn with_speed(steps_per_second: f64) -> Self {
        Self {
            position: Arc::new(RwLock::new([0, 0])),
            target: Arc::new(RwLock::new([0, 0])),
            steps_per_second,
            velocity: Arc::new(RwLock::new(None)),
            moves: Arc::new(Mutex::new(Vec::new())),
            move_count: AtomicUsize::new(0),
            fail_on_move: AtomicUsize::new(0),
            stalled: [AtomicBool::new(false), AtomicBool::new(false)],
            homed: [AtomicBool::new(false), AtomicBool::new(false)],
            released: AtomicBool::new(false),
        }
    }

    /// Make the `n`-th `move_to` call (1-based) fail with a fault.
    pub fn fail_on_move(&self, n: usize) {
        self.fail_on_move.store(n, Ordering::SeqCst);
    }

    /// Make `axis` never report that it stopped.
    pub fn stall(&self, axis: Axis) {
        self.stalled[axis_index(axis)].store(true, Ordering::SeqCst);
    }

    /// Every commanded move so far, in order.
    pub async fn moves(&self) -> Vec<(Axis, i64)> {
        self.moves.lock().await.clone()
    }

    /// Last velocity profile applied.
    pub async fn velocity(&self) -> Option<VelocityProfile> {
        *self.velocity.read().await
    }

    pub fn is_homed(&self, axis: Axis) -> bool {
        self.homed[axis_index(axis)].load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), DeviceError> {
        if self.is_released() {
            Err(DeviceError::Closed(STAGE.to_string()))
        } else {
            Ok(())
        }
    }

    async fn travel(&self, axis: Axis) -> Result<(), DeviceError> {
        let i = axis_index(axis);
        if self.stalled[i].load(Ordering::SeqCst) {
            debug!(%axis, "MockStage: axis stalled");
            std::future::pending::<()>().await;
        }

        let current = self.position.read().await[i];
        let target = self.target.read().await[i];
        let distance = (target - current).abs() as f64;
        let delay_ms = (distance / self.steps_per_second * 1000.0) as u64;

        // CRITICAL: Use tokio::time::sleep, NOT std::thread::sleep
        sleep(Duration::from_millis(delay_ms)).await;

        self.position.write().await[i] = target;
        trace!(%axis, target, delay_ms, "MockStage: reached target");
        Ok(())
    }
}

impl Default for MockStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StageController for MockStage {
    async fn move_to(&self, axis: Axis, step: i64) -> Result<(), DeviceError> {
        self.ensure_open()?;
        let n = self.move_count.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_on_move.load(Ordering::SeqCst) {
            return Err(DeviceError::fault(STAGE, format!("injected fault on move #{n}")));
        }

        self.target.write().await[axis_index(axis)] = step;
        self.moves.lock().await.push((axis, step));
        Ok(())
    }

    async fn wait_until_stopped(&self, axis: Axis) -> Result<(), DeviceError> {
        self.ensure_open()?;
        self.travel(axis).await
    }

    async fn home(&self, axis: Axis) -> Result<(), DeviceError> {
        self.ensure_open()?;
        self.target.write().await[axis_index(axis)] = 0;
        self.homed[axis_index(axis)].store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_until_homed(&self, axis: Axis) -> Result<(), DeviceError> {
        self.ensure_open()?;
        self.travel(axis).await?;
        // Reference search overhead
        sleep(Duration::from_millis(500)).await;
        self.homed[axis_index(axis)].store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn set_velocity(&self, _axis: Axis, profile: VelocityProfile) -> Result<(), DeviceError> {
        self.ensure_open()?;
        *self.velocity.write().await = Some(profile);
        Ok(())
    }

    async fn current_position(&self, axis: Axis) -> Result<i64, DeviceError> {
        self.ensure_open()?;
        Ok(self.position.read().await[axis_index(axis)])
    }

    async fn release(&self) -> Result<(), DeviceError> {
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// SimulatedSample - Substrate With Flakes
// =============================================================================

/// A substrate rendered through a camera fixed above the stage.
///
/// Pixel `(px, py)` of a frame taken with the stage at `(sx, sy)` images the
/// substrate point `(sx - k·(px - w/2), sy + k·(py - h/2))`, `k` being
/// `steps_per_px`. Background noise is seeded from the stage position so a
/// revisited position yields the same frame.
#[derive(Debug, Clone)]
pub struct SimulatedSample {
    pub width: u32,
    pub height: u32,
    pub background: u8,
    pub noise: u8,
    pub seed: u64,
    pub steps_per_px: f64,
    pub flakes: Vec<SimulatedFlake>,
    /// Single-pixel 255 artefacts per frame
    pub hot_pixels: usize,
}

impl SimulatedSample {
    pub fn from_config(config: &SimulationConfig, steps_per_px: f64) -> Self {
        Self {
            width: config.width,
            height: config.height,
            background: config.background,
            noise: config.noise,
            seed: config.seed,
            steps_per_px,
            flakes: config.flakes.clone(),
            hot_pixels: 3,
        }
    }

    /// Render the field of view with the stage at `(sx, sy)`.
    pub fn render(&self, sx: i64, sy: i64) -> Frame {
        let mut rng = StdRng::seed_from_u64(
            self.seed
                ^ (sx as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
                ^ (sy as u64).rotate_left(32),
        );
        let mut frame = Frame::filled(self.width, self.height, self.background);
        let half_w = f64::from(self.width) / 2.0;
        let half_h = f64::from(self.height) / 2.0;
        let noise = i16::from(self.noise);

        for py in 0..self.height {
            for px in 0..self.width {
                let ux = sx as f64 - self.steps_per_px * (f64::from(px) - half_w);
                let uy = sy as f64 + self.steps_per_px * (f64::from(py) - half_h);
                let base = self
                    .flakes
                    .iter()
                    .find(|f| {
                        let dx = ux - f.x as f64;
                        let dy = uy - f.y as f64;
                        dx * dx + dy * dy <= (f.radius * f.radius) as f64
                    })
                    .map_or(self.background, |f| f.brightness);
                let jitter = if noise > 0 { rng.gen_range(-noise..=noise) } else { 0 };
                frame.set(px, py, (i16::from(base) + jitter).clamp(0, 255) as u8);
            }
        }

        for _ in 0..self.hot_pixels {
            let px = rng.gen_range(0..self.width);
            let py = rng.gen_range(0..self.height);
            frame.set(px, py, 255);
        }
        frame
    }
}

// =============================================================================
// MockCamera - Simulated Camera
// =============================================================================

/// Where a mock camera's frames come from.
pub enum FrameSource {
    /// Every frame has the same intensity everywhere.
    Constant(u8),
    /// Frames are handed out in order; the last one repeats.
    Script(VecDeque<Frame>),
    /// Frames are rendered from a sample under the given stage.
    Scene {
        stage: Arc<MockStage>,
        sample: SimulatedSample,
    },
}

/// Mock camera with configurable frame source and exposure delay.
///
/// # Example
///
/// ```rust,ignore
/// let camera = MockCamera::new(640, 480);
/// camera.configure(&settings).await?;
/// let frame = camera.capture_frame().await?; // sleeps for the exposure
/// assert_eq!(camera.frame_count(), 1);
/// ```
pub struct MockCamera {
    resolution: (u32, u32),
    source: Mutex<FrameSource>,
    settings: RwLock<Option<CameraSettings>>,
    frame_count: AtomicUsize,
    fail_on_capture: AtomicUsize,
    released: AtomicBool,
}

impl MockCamera {
    /// Camera returning uniformly dark frames of the given size.
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_source(width, height, FrameSource::Constant(0))
    }

    /// Camera returning `frames` in order.
    pub fn scripted(frames: Vec<Frame>) -> Self {
        let resolution = frames.first().map_or((0, 0), |f| (f.width(), f.height()));
        Self::with_source(resolution.0, resolution.1, FrameSource::Script(frames.into()))
    }

    /// Camera looking at `sample` mounted on `stage`.
    pub fn over_sample(stage: Arc<MockStage>, sample: SimulatedSample) -> Self {
        let resolution = (sample.width, sample.height);
        Self::with_source(resolution.0, resolution.1, FrameSource::Scene { stage, sample })
    }

    fn with_source(width: u32, height: u32, source: FrameSource) -> Self {
        Self {
            resolution: (width, height),
            source: Mutex::new(source),
            settings: RwLock::new(None),
            frame_count: AtomicUsize::new(0),
            fail_on_capture: AtomicUsize::new(0),
            released: AtomicBool::new(false),
        }
    }

    /// Make the `n`-th capture (1-based, counting every capture) fail.
    pub fn fail_on_capture(&self, n: usize) {
        self.fail_on_capture.store(n, Ordering::SeqCst);
    }

    /// Get total number of capture attempts
    pub fn frame_count(&self) -> usize {
        self.frame_count.load(Ordering::SeqCst)
    }

    /// Settings from the last `configure` call.
    pub async fn settings(&self) -> Option<CameraSettings> {
        self.settings.read().await.clone()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CameraController for MockCamera {
    async fn configure(&self, settings: &CameraSettings) -> Result<(), DeviceError> {
        if self.is_released() {
            return Err(DeviceError::Closed(CAMERA.to_string()));
        }
        *self.settings.write().await = Some(settings.clone());
        Ok(())
    }

    async fn capture_frame(&self) -> Result<Frame, DeviceError> {
        if self.is_released() {
            return Err(DeviceError::Closed(CAMERA.to_string()));
        }
        let n = self.frame_count.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_on_capture.load(Ordering::SeqCst) {
            return Err(DeviceError::communication(
                CAMERA,
                format!("injected failure on capture #{n}"),
            ));
        }

        let exposure_ms = self
            .settings
            .read()
            .await
            .as_ref()
            .map_or(0.0, |s| s.exposure_ms);
        sleep(Duration::from_micros((exposure_ms * 1000.0) as u64)).await;

        let (width, height) = self.resolution;
        let mut source = self.source.lock().await;
        let frame = match &mut *source {
            FrameSource::Constant(value) => Frame::filled(width, height, *value),
            FrameSource::Script(frames) => {
                let frame = if frames.len() > 1 {
                    frames.pop_front()
                } else {
                    frames.front().cloned()
                };
                frame.ok_or_else(|| DeviceError::fault(CAMERA, "frame script is empty"))?
            }
            FrameSource::Scene { stage, sample } => {
                let sx = stage.current_position(Axis::X).await?;
                let sy = stage.current_position(Axis::Y).await?;
                sample.render(sx, sy)
            }
        };
        trace!(frame = n, "MockCamera: frame captured");
        Ok(frame)
    }

    async fn release(&self) -> Result<(), DeviceError> {
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Stage and camera looking at the configured simulated sample.
///
/// Handles are returned alongside the rig so callers can release them on exit.
pub fn simulated_rig(config: &ScanConfig) -> (Rig, Arc<MockStage>, Arc<MockCamera>) {
    let stage = Arc::new(MockStage::with_speed(config.simulation.steps_per_second));
    let steps_per_px = config.grid.steps_per_um / config.review.px_per_um;
    let sample = SimulatedSample::from_config(&config.simulation, steps_per_px);
    let camera = Arc::new(MockCamera::over_sample(stage.clone(), sample));
    let rig = Rig::new(stage.clone(), camera.clone());
    (rig, stage, camera)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_mock_stage_move_commits_on_wait() {
        let stage = MockStage::new();

        stage.move_to(Axis::X, 5_000).await.unwrap();
        assert_eq!(stage.current_position(Axis::X).await.unwrap(), 0);

        stage.wait_until_stopped(Axis::X).await.unwrap();
        assert_eq!(stage.current_position(Axis::X).await.unwrap(), 5_000);
        assert_eq!(stage.moves().await, vec![(Axis::X, 5_000)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_stage_travel_time() {
        let stage = MockStage::with_speed(1_000.0);
        let start = tokio::time::Instant::now();
        stage.move_to(Axis::Y, 2_000).await.unwrap();
        stage.wait_until_stopped(Axis::Y).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_stage_homing() {
        let stage = MockStage::new();
        stage.move_to(Axis::X, 300).await.unwrap();
        stage.wait_until_stopped(Axis::X).await.unwrap();

        stage.home(Axis::X).await.unwrap();
        assert!(!stage.is_homed(Axis::X));
        stage.wait_until_homed(Axis::X).await.unwrap();
        assert!(stage.is_homed(Axis::X));
        assert_eq!(stage.current_position(Axis::X).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mock_stage_injected_fault() {
        let stage = MockStage::new();
        stage.fail_on_move(2);
        assert!(stage.move_to(Axis::X, 1).await.is_ok());
        assert!(matches!(
            stage.move_to(Axis::X, 2).await,
            Err(DeviceError::Fault { .. })
        ));
        assert!(stage.move_to(Axis::X, 3).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_stage_release_closes() {
        let stage = MockStage::new();
        stage.release().await.unwrap();
        assert!(matches!(
            stage.current_position(Axis::X).await,
            Err(DeviceError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_mock_camera_script_repeats_last() {
        let camera = MockCamera::scripted(vec![Frame::filled(2, 2, 1), Frame::filled(2, 2, 2)]);
        assert_eq!(camera.capture_frame().await.unwrap().pixels()[0], 1);
        assert_eq!(camera.capture_frame().await.unwrap().pixels()[0], 2);
        assert_eq!(camera.capture_frame().await.unwrap().pixels()[0], 2);
        assert_eq!(camera.frame_count(), 3);
    }

    #[tokio::test]
    async fn test_mock_camera_injected_failure() {
        let camera = MockCamera::new(4, 4);
        camera.fail_on_capture(1);
        assert!(camera.capture_frame().await.is_err());
        assert!(camera.capture_frame().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scene_shows_flake_under_stage() {
        let stage = Arc::new(MockStage::new());
        let sample = SimulatedSample {
            width: 40,
            height: 30,
            background: 50,
            noise: 0,
            seed: 1,
            steps_per_px: 10.0,
            flakes: vec![SimulatedFlake {
                x: 1_000,
                y: 1_000,
                radius: 50,
                brightness: 200,
            }],
            hot_pixels: 0,
        };
        let camera = MockCamera::over_sample(stage.clone(), sample);

        let away = camera.capture_frame().await.unwrap();
        assert!(away.pixels().iter().all(|&p| p == 50));

        stage.move_to(Axis::X, 1_000).await.unwrap();
        stage.move_to(Axis::Y, 1_000).await.unwrap();
        stage.wait_until_stopped(Axis::X).await.unwrap();
        stage.wait_until_stopped(Axis::Y).await.unwrap();
        let over = camera.capture_frame().await.unwrap();
        assert_eq!(over.get(20, 15), 200);
        assert_eq!(over.get(0, 0), 50);
    }

    #[test]
    fn test_render_is_deterministic_per_position() {
        let sample = SimulatedSample::from_config(&SimulationConfig::default(), 14.0);
        assert_eq!(sample.render(100, 200), sample.render(100, 200));
    }
}
