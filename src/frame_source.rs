// src/frame_source.rs
//
// Capture side of the pipeline.
//
// A dedicated thread owns the device, reads it at the configured pace and
// pushes frames into a bounded queue. When the queue is full the frame is
// dropped and counted: camera readout is never blocked by a slow consumer.
// Sequence numbers and timestamps are assigned at readout, so a dropped frame
// leaves a gap in the sequence but never reorders it.

use crate::clock::{Clock, Micros};
use crate::config::{SourceConfig, SyntheticConfig};
use crate::error::{CrashGuardError, Result};
use crate::pipeline::metrics::PipelineMetrics;
use crate::types::{Frame, FrameImage, InertialSample};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// One readout from a device, before sequencing.
#[derive(Debug, Clone)]
pub struct RawCapture {
    pub image: FrameImage,
    pub inertial: Option<InertialSample>,
}

/// Anything that yields images (and optionally inertial samples).
///
/// `read` returns `Ok(None)` at the end of a finite stream and
/// `Err(SourceUnavailable)` when the device is lost.
pub trait CaptureDevice: Send {
    fn open(&mut self) -> Result<()>;

    fn read(&mut self) -> Result<Option<RawCapture>>;

    fn describe(&self) -> String;

    /// Live devices deliver at their own rate; recorded ones are paced.
    fn paced(&self) -> bool {
        true
    }
}

// ============================================================================
// FRAME SOURCE
// ============================================================================

#[derive(Debug)]
enum CaptureItem {
    Frame(Frame),
    Lost(CrashGuardError),
    Ended,
}

/// Result of waiting on the capture queue for a bounded time.
#[derive(Debug)]
pub enum SourcePoll {
    Frame(Frame),
    /// Nothing arrived within the timeout.
    Idle,
    /// The device failed; no more frames will come.
    Lost(CrashGuardError),
    /// Finite stream reached its end.
    Ended,
}

pub struct FrameSource {
    rx: Receiver<CaptureItem>,
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    closed: bool,
    description: String,
}

impl FrameSource {
    /// Opens the device on the calling thread, then hands it to the capture
    /// thread. An open failure is returned as `SourceUnavailable`.
    pub fn start(
        mut device: Box<dyn CaptureDevice>,
        config: &SourceConfig,
        clock: Arc<dyn Clock>,
        metrics: PipelineMetrics,
    ) -> Result<Self> {
        let description = device.describe();
        device.open()?;
        info!("Frame source opened: {}", description);

        let pacing = if device.paced() && config.target_fps > 0 {
            Some(Duration::from_secs_f64(1.0 / config.target_fps as f64))
        } else {
            None
        };

        let (tx, rx) = mpsc::sync_channel(config.queue_capacity.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("crashguard-capture".to_string())
            .spawn(move || capture_loop(device, tx, clock, thread_stop, metrics, pacing))?;

        Ok(Self {
            rx,
            handle: Some(handle),
            stop,
            closed: false,
            description,
        })
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Waits up to `timeout` for the next item.
    pub fn poll(&mut self, timeout: Duration) -> SourcePoll {
        if self.closed {
            return SourcePoll::Ended;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(CaptureItem::Frame(frame)) => SourcePoll::Frame(frame),
            Ok(CaptureItem::Lost(e)) => {
                self.closed = true;
                SourcePoll::Lost(e)
            }
            Ok(CaptureItem::Ended) | Err(RecvTimeoutError::Disconnected) => {
                self.closed = true;
                SourcePoll::Ended
            }
            Err(RecvTimeoutError::Timeout) => SourcePoll::Idle,
        }
    }

    /// Raises the stop flag and joins the capture thread for at most
    /// `join_timeout`. Returns false if the thread had to be abandoned.
    pub fn shutdown(&mut self, join_timeout: Duration) -> bool {
        self.stop.store(true, Ordering::Release);
        self.closed = true;
        match self.handle.take() {
            Some(handle) => {
                let joined = join_with_timeout(handle, join_timeout);
                if !joined {
                    warn!(
                        "Capture thread for {} did not stop within {:?}, abandoning it (resource leak)",
                        self.description, join_timeout
                    );
                }
                joined
            }
            None => true,
        }
    }
}

/// Blocking iteration: yields frames until the stream ends, and the device
/// error once if the source is lost.
impl Iterator for FrameSource {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.closed {
            return None;
        }
        match self.rx.recv() {
            Ok(CaptureItem::Frame(frame)) => Some(Ok(frame)),
            Ok(CaptureItem::Lost(e)) => {
                self.closed = true;
                Some(Err(e))
            }
            Ok(CaptureItem::Ended) | Err(_) => {
                self.closed = true;
                None
            }
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// `JoinHandle::join` with a deadline. The thread is detached on timeout.
pub(crate) fn join_with_timeout<T>(handle: JoinHandle<T>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    handle.join().is_ok()
}

fn capture_loop(
    mut device: Box<dyn CaptureDevice>,
    tx: SyncSender<CaptureItem>,
    clock: Arc<dyn Clock>,
    stop: Arc<AtomicBool>,
    metrics: PipelineMetrics,
    pacing: Option<Duration>,
) {
    let mut sequence: u64 = 0;
    let mut last_timestamp: Micros = 0;
    let mut next_due = Instant::now();

    while !stop.load(Ordering::Acquire) {
        if let Some(interval) = pacing {
            let now = Instant::now();
            if next_due > now {
                thread::sleep(next_due - now);
            }
            next_due = next_due.max(now) + interval;
        }

        match device.read() {
            Ok(Some(raw)) => {
                sequence += 1;
                last_timestamp = clock.now_micros().max(last_timestamp);
                metrics.inc(&metrics.frames_captured);

                let frame = Frame {
                    sequence,
                    captured_at: last_timestamp,
                    image: raw.image,
                    inertial: raw.inertial,
                };
                match tx.try_send(CaptureItem::Frame(frame)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        metrics.inc(&metrics.frames_dropped);
                        debug!("Capture queue full, dropped frame {}", sequence);
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
            Ok(None) => {
                info!("{}: end of stream after {} frames", device.describe(), sequence);
                send_terminal(&tx, CaptureItem::Ended, &stop);
                break;
            }
            Err(e) => {
                error!("{}: {}", device.describe(), e);
                send_terminal(&tx, CaptureItem::Lost(e), &stop);
                break;
            }
        }
    }
    debug!("Capture thread exiting");
}

/// The terminal item must not be dropped, but must not block shutdown either.
fn send_terminal(tx: &SyncSender<CaptureItem>, item: CaptureItem, stop: &AtomicBool) {
    let mut item = item;
    loop {
        match tx.try_send(item) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => return,
            Err(TrySendError::Full(back)) => {
                if stop.load(Ordering::Acquire) {
                    return;
                }
                item = back;
                thread::sleep(Duration::from_millis(5));
            }
        }
    }
}

// ============================================================================
// SYNTHETIC DEVICE
// ============================================================================

/// Scripted drive: a near-static scene with a steady 1 g reading, and an
/// optional simulated collision (violent scene change plus ~5 g).
pub struct SyntheticDevice {
    config: SyntheticConfig,
    gravity: f32,
    produced: u64,
}

impl SyntheticDevice {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            gravity: 9.80665,
            produced: 0,
        }
    }

    fn in_crash(&self, index: u64) -> bool {
        match self.config.crash_at_frame {
            Some(start) => index >= start && index < start + self.config.crash_frames,
            None => false,
        }
    }
}

impl CaptureDevice for SyntheticDevice {
    fn open(&mut self) -> Result<()> {
        if self.config.width == 0 || self.config.height == 0 {
            return Err(CrashGuardError::SourceUnavailable(
                "synthetic device with zero resolution".to_string(),
            ));
        }
        self.produced = 0;
        Ok(())
    }

    fn read(&mut self) -> Result<Option<RawCapture>> {
        if let Some(limit) = self.config.frames {
            if self.produced >= limit {
                return Ok(None);
            }
        }
        let index = self.produced;
        self.produced += 1;
        let g = self.gravity;

        let (level, accel) = if self.in_crash(index) {
            let level = if index % 2 == 0 { 30 } else { 220 };
            (level, [-5.0 * g, 0.0, g])
        } else {
            // Sensor jitter well under any threshold.
            let wobble = ((index as f32) * 0.7).sin() * 0.05;
            (100 + (index % 4) as u8, [0.0, wobble, g + wobble])
        };

        Ok(Some(RawCapture {
            image: FrameImage::filled(self.config.width, self.config.height, level),
            inertial: Some(InertialSample::new(accel)),
        }))
    }

    fn describe(&self) -> String {
        format!(
            "synthetic {}x{}{}",
            self.config.width,
            self.config.height,
            match self.config.crash_at_frame {
                Some(f) => format!(" (crash at frame {})", f),
                None => String::new(),
            }
        )
    }
}

// ============================================================================
// REPLAY DEVICE
// ============================================================================

/// Replays a directory of still images in path order.
pub struct ReplayDevice {
    dir: PathBuf,
    files: Vec<PathBuf>,
    cursor: usize,
}

impl ReplayDevice {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: Vec::new(),
            cursor: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl CaptureDevice for ReplayDevice {
    fn open(&mut self) -> Result<()> {
        let image_extensions = ["png", "jpg", "jpeg", "PNG", "JPG", "JPEG"];

        if !self.dir.is_dir() {
            return Err(CrashGuardError::SourceUnavailable(format!(
                "replay directory {} not found",
                self.dir.display()
            )));
        }

        let mut files: Vec<PathBuf> = WalkDir::new(&self.dir)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|p| {
                p.extension()
                    .and_then(|ext| ext.to_str())
                    .map_or(false, |ext| image_extensions.contains(&ext))
            })
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(CrashGuardError::SourceUnavailable(format!(
                "no images under {}",
                self.dir.display()
            )));
        }

        info!("Found {} replay frames in {}", files.len(), self.dir.display());
        self.files = files;
        self.cursor = 0;
        Ok(())
    }

    fn read(&mut self) -> Result<Option<RawCapture>> {
        let Some(path) = self.files.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;

        // An unreadable file becomes an empty frame, which extraction flags
        // as low confidence.
        let image = match image::open(path) {
            Ok(img) => {
                let rgb = img.to_rgb8();
                let (w, h) = rgb.dimensions();
                FrameImage::new(w as usize, h as usize, rgb.into_raw())
            }
            Err(e) => {
                warn!("Failed to decode {}: {}", path.display(), e);
                FrameImage::new(0, 0, Vec::new())
            }
        };

        Ok(Some(RawCapture {
            image,
            inertial: None,
        }))
    }

    fn describe(&self) -> String {
        format!("replay {}", self.dir.display())
    }
}

// ============================================================================
// CAMERA DEVICE
// ============================================================================

#[cfg(feature = "camera")]
pub use camera::CameraDevice;

#[cfg(feature = "camera")]
mod camera {
    use super::{CaptureDevice, RawCapture};
    use crate::error::{CrashGuardError, Result};
    use crate::types::FrameImage;
    use opencv::{
        core::Mat,
        imgproc,
        prelude::*,
        videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
    };
    use tracing::info;

    fn unavailable(e: impl std::fmt::Display) -> CrashGuardError {
        CrashGuardError::SourceUnavailable(e.to_string())
    }

    /// OpenCV capture on a device index or a video file.
    pub struct CameraDevice {
        index: i32,
        video_path: Option<String>,
        cap: Option<VideoCapture>,
    }

    impl CameraDevice {
        pub fn new(index: i32, video_path: Option<String>) -> Self {
            Self {
                index,
                video_path,
                cap: None,
            }
        }
    }

    impl CaptureDevice for CameraDevice {
        fn open(&mut self) -> Result<()> {
            let cap = match &self.video_path {
                Some(path) => VideoCapture::from_file(path, videoio::CAP_ANY),
                None => VideoCapture::new(self.index, videoio::CAP_ANY),
            }
            .map_err(unavailable)?;

            if !cap.is_opened().map_err(unavailable)? {
                return Err(unavailable(format!("failed to open {}", self.describe())));
            }

            let fps = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FPS).unwrap_or(0.0);
            let width = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_WIDTH)
                .unwrap_or(0.0) as i32;
            let height = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_HEIGHT)
                .unwrap_or(0.0) as i32;
            info!("Capture properties: {}x{} @ {:.1} FPS", width, height, fps);

            self.cap = Some(cap);
            Ok(())
        }

        fn read(&mut self) -> Result<Option<RawCapture>> {
            let cap = self
                .cap
                .as_mut()
                .ok_or_else(|| unavailable("camera not opened"))?;

            let mut mat = Mat::default();
            if !VideoCaptureTrait::read(cap, &mut mat).map_err(unavailable)? || mat.empty() {
                return match self.video_path {
                    Some(_) => Ok(None),
                    None => Err(unavailable("camera stopped delivering frames")),
                };
            }

            let mut rgb_mat = Mat::default();
            imgproc::cvt_color(&mat, &mut rgb_mat, imgproc::COLOR_BGR2RGB, 0)
                .map_err(unavailable)?;
            let data = rgb_mat.data_bytes().map_err(unavailable)?.to_vec();

            Ok(Some(RawCapture {
                image: FrameImage::new(rgb_mat.cols() as usize, rgb_mat.rows() as usize, data),
                inertial: None,
            }))
        }

        fn describe(&self) -> String {
            match &self.video_path {
                Some(path) => format!("video {}", path),
                None => format!("camera #{}", self.index),
            }
        }

        fn paced(&self) -> bool {
            self.video_path.is_some()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, MonotonicClock};
    use crate::signal::SignalExtractor;
    use crate::config::ExtractionConfig;

    fn source_config(queue_capacity: usize) -> SourceConfig {
        SourceConfig {
            target_fps: 0,
            queue_capacity,
            ..SourceConfig::default()
        }
    }

    fn synthetic(frames: u64, crash_at_frame: Option<u64>) -> SyntheticDevice {
        SyntheticDevice::new(SyntheticConfig {
            width: 16,
            height: 12,
            frames: Some(frames),
            crash_at_frame,
            crash_frames: 4,
        })
    }

    /// Fails after a fixed number of good frames.
    struct FlakyDevice {
        good_frames: u64,
        open_fails: bool,
    }

    impl CaptureDevice for FlakyDevice {
        fn open(&mut self) -> Result<()> {
            if self.open_fails {
                Err(CrashGuardError::SourceUnavailable("no such camera".into()))
            } else {
                Ok(())
            }
        }

        fn read(&mut self) -> Result<Option<RawCapture>> {
            if self.good_frames == 0 {
                return Err(CrashGuardError::SourceUnavailable("cable pulled".into()));
            }
            self.good_frames -= 1;
            Ok(Some(RawCapture {
                image: FrameImage::filled(4, 4, 50),
                inertial: None,
            }))
        }

        fn describe(&self) -> String {
            "flaky".to_string()
        }
    }

    #[test]
    fn sequences_increase_and_timestamps_never_go_back() {
        let clock = Arc::new(ManualClock::new(5_000));
        let source = FrameSource::start(
            Box::new(synthetic(20, None)),
            &source_config(32),
            clock,
            PipelineMetrics::new(),
        )
        .unwrap();

        let frames: Vec<Frame> = source.map(|f| f.unwrap()).collect();
        assert_eq!(frames.len(), 20);
        for pair in frames.windows(2) {
            assert!(pair[1].sequence > pair[0].sequence);
            assert!(pair[1].captured_at >= pair[0].captured_at);
        }
        assert_eq!(frames[0].sequence, 1);
    }

    #[test]
    fn full_queue_drops_frames_instead_of_blocking() {
        let metrics = PipelineMetrics::new();
        let mut source = FrameSource::start(
            Box::new(synthetic(50, None)),
            &source_config(2),
            Arc::new(MonotonicClock::new()),
            metrics.clone(),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(300));
        let mut received = Vec::new();
        loop {
            match source.poll(Duration::from_secs(2)) {
                SourcePoll::Frame(f) => received.push(f.sequence),
                SourcePoll::Ended => break,
                other => panic!("unexpected {:?}", other),
            }
        }

        let summary = metrics.summary();
        assert_eq!(summary.frames_captured, 50);
        assert!(summary.frames_dropped > 0);
        assert_eq!(received.len() as u64 + summary.frames_dropped, 50);
        assert!(received.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn open_failure_is_source_unavailable() {
        let result = FrameSource::start(
            Box::new(FlakyDevice {
                good_frames: 0,
                open_fails: true,
            }),
            &source_config(4),
            Arc::new(MonotonicClock::new()),
            PipelineMetrics::new(),
        );
        assert!(matches!(result, Err(CrashGuardError::SourceUnavailable(_))));
    }

    #[test]
    fn device_loss_terminates_the_sequence() {
        let source = FrameSource::start(
            Box::new(FlakyDevice {
                good_frames: 3,
                open_fails: false,
            }),
            &source_config(8),
            Arc::new(MonotonicClock::new()),
            PipelineMetrics::new(),
        )
        .unwrap();

        let items: Vec<Result<Frame>> = source.collect();
        assert_eq!(items.len(), 4);
        assert!(items[..3].iter().all(|i| i.is_ok()));
        assert!(matches!(items[3], Err(CrashGuardError::SourceUnavailable(_))));
    }

    #[test]
    fn shutdown_joins_an_endless_source() {
        let mut source = FrameSource::start(
            Box::new(SyntheticDevice::new(SyntheticConfig::default())),
            &SourceConfig::default(),
            Arc::new(MonotonicClock::new()),
            PipelineMetrics::new(),
        )
        .unwrap();
        assert!(matches!(source.poll(Duration::from_secs(1)), SourcePoll::Frame(_)));
        assert!(source.shutdown(Duration::from_secs(2)));
        assert!(source.is_closed());
    }

    #[test]
    fn synthetic_crash_is_visible_to_extraction() {
        let mut device = synthetic(12, Some(6));
        device.open().unwrap();
        let extractor = SignalExtractor::new(ExtractionConfig::default());

        let mut previous: Option<Frame> = None;
        let mut impacts = Vec::new();
        for sequence in 1..=12 {
            let raw = device.read().unwrap().unwrap();
            let frame = Frame {
                sequence,
                captured_at: sequence * 33_333,
                image: raw.image,
                inertial: raw.inertial,
            };
            let fv = extractor.extract(&frame, previous.as_ref());
            impacts.push(fv.impact_magnitude.unwrap());
            previous = Some(frame);
        }
        assert!(device.read().unwrap().is_none());

        assert!(impacts[..6].iter().all(|&g| g < 0.1));
        assert!(impacts[6..10].iter().all(|&g| g > 3.5));
        assert!(impacts[10..].iter().all(|&g| g < 0.1));
    }

    #[test]
    fn replay_device_reads_images_in_path_order() {
        let dir = tempfile::tempdir().unwrap();
        for (name, level) in [("b.png", 200u8), ("a.png", 10u8)] {
            let img = image::RgbImage::from_pixel(8, 6, image::Rgb([level, level, level]));
            img.save(dir.path().join(name)).unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "not a frame").unwrap();

        let mut device = ReplayDevice::new(dir.path());
        device.open().unwrap();
        assert_eq!(device.len(), 2);

        let first = device.read().unwrap().unwrap();
        assert_eq!((first.image.width, first.image.height), (8, 6));
        assert_eq!(first.image.rgb[0], 10);
        let second = device.read().unwrap().unwrap();
        assert_eq!(second.image.rgb[0], 200);
        assert!(device.read().unwrap().is_none());
    }

    #[test]
    fn empty_replay_directory_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = ReplayDevice::new(dir.path());
        assert!(matches!(
            device.open(),
            Err(CrashGuardError::SourceUnavailable(_))
        ));
    }
}
