//! Capture engine.
//!
//! Owns a dedicated capture thread that blits the selected monitor through
//! the desktop scope, encodes frames to JPEG, and fans them out to
//! registered subscribers. Capture failures are counted rather than
//! surfaced; after five consecutive failures the engine flips to degraded
//! mode and publishes black fallback frames so subscribers keep making
//! progress.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::desktop_scope;
use crate::platform::{CaptureStrategy, CaptureSurface, Platform, PlatformError};
use crate::session_state::{DesktopMode, SessionMonitor};

pub mod channel;
pub mod monitors;
pub mod pool;

pub use channel::{FrameChannel, FRAME_CHANNEL_CAPACITY};
pub use monitors::MonitorInfo;
pub use pool::{estimate_capacity, BufferPool, PooledBytes};

/// JPEG quality for published frames.
const JPEG_QUALITY: u8 = 75;

/// Consecutive capture failures before the engine goes degraded.
const FAILURE_THRESHOLD: u32 = 5;

/// Time allowed for the capture thread to exit on stop.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Backoff after a capture-surface allocation failure.
const ALLOC_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Dimensions of the black frame published while degraded.
const FALLBACK_WIDTH: u32 = 640;
const FALLBACK_HEIGHT: u32 = 480;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("unknown monitor id: {0}")]
    UnknownMonitor(String),

    #[error("no monitors enumerated")]
    NoMonitors,

    #[error("jpeg encoding failed: {0}")]
    Encode(#[from] image::ImageError),

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

/// Payload encodings carried by a frame. Only JPEG is produced; the other
/// tag values are reserved and rejected on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Jpeg,
}

impl FrameFormat {
    pub fn tag(&self) -> i32 {
        match self {
            FrameFormat::Jpeg => 1,
        }
    }

    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            1 => Some(FrameFormat::Jpeg),
            _ => None,
        }
    }
}

/// One encoded frame. Read-only once published.
#[derive(Debug)]
pub struct RemoteFrame {
    /// Strictly monotonic per engine run.
    pub sequence: u64,
    /// Wall-clock capture time, milliseconds since the epoch.
    pub timestamp_ms: u64,
    pub width: u32,
    pub height: u32,
    pub format: FrameFormat,
    pub data: PooledBytes,
}

/// Engine status snapshot, read under a single lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureStatus {
    pub running: bool,
    pub last_frame_at: Option<u64>,
    /// Session desktop mode, suffixed with `_degraded` when applicable.
    pub mode: String,
    pub degraded: bool,
    /// Frames published this engine run, fallback frames included.
    pub frames_published: u64,
    pub subscribers: usize,
}

/// The monitor the engine (and the input dispatcher) currently target.
///
/// A single shared reference: `select_monitor` swaps it, the capture loop
/// and the dispatcher read it at the top of each iteration/dispatch.
#[derive(Default)]
pub struct MonitorSelection {
    selected: Mutex<Option<MonitorInfo>>,
}

impl MonitorSelection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self) -> Option<MonitorInfo> {
        self.selected.lock().unwrap().clone()
    }

    pub(crate) fn set(&self, monitor: MonitorInfo) {
        *self.selected.lock().unwrap() = Some(monitor);
    }
}

/// Fields mutated by the capture loop, all under one lock.
struct StatusFields {
    last_frame_at: Option<u64>,
    mode: DesktopMode,
    degraded: bool,
    failure_count: u32,
}

/// Cancellation signal with a pacing wait.
struct StopSignal {
    triggered: Mutex<bool>,
    condvar: Condvar,
}

impl StopSignal {
    fn new() -> Self {
        Self {
            triggered: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn trigger(&self) {
        *self.triggered.lock().unwrap() = true;
        self.condvar.notify_all();
    }

    fn reset(&self) {
        *self.triggered.lock().unwrap() = false;
    }

    fn is_triggered(&self) -> bool {
        *self.triggered.lock().unwrap()
    }

    /// Sleep up to `duration`; returns true when cancelled.
    fn wait(&self, duration: Duration) -> bool {
        let guard = self.triggered.lock().unwrap();
        if *guard {
            return true;
        }
        let (guard, _) = self.condvar.wait_timeout(guard, duration).unwrap();
        *guard
    }
}

struct EngineInner {
    platform: Arc<dyn Platform>,
    session: Arc<SessionMonitor>,
    selection: Arc<MonitorSelection>,
    status: Mutex<StatusFields>,
    running: AtomicBool,
    target_fps: AtomicU32,
    sequence: AtomicU64,
    frames_published: AtomicU64,
    monitors: Mutex<Vec<MonitorInfo>>,
    subscribers: Mutex<HashMap<u64, Arc<FrameChannel>>>,
    next_subscriber: AtomicU64,
    pool: Arc<BufferPool>,
    stop: StopSignal,
    handle: Mutex<Option<JoinHandle<()>>>,
    fallback_jpeg: Mutex<Option<Arc<Vec<u8>>>>,
}

pub struct CaptureEngine {
    inner: Arc<EngineInner>,
}

impl CaptureEngine {
    pub fn new(
        platform: Arc<dyn Platform>,
        session: Arc<SessionMonitor>,
        target_fps: u32,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                platform,
                session,
                selection: MonitorSelection::new(),
                status: Mutex::new(StatusFields {
                    last_frame_at: None,
                    mode: DesktopMode::Unknown,
                    degraded: false,
                    failure_count: 0,
                }),
                running: AtomicBool::new(false),
                target_fps: AtomicU32::new(target_fps.clamp(1, 60)),
                sequence: AtomicU64::new(0),
                frames_published: AtomicU64::new(0),
                monitors: Mutex::new(Vec::new()),
                subscribers: Mutex::new(HashMap::new()),
                next_subscriber: AtomicU64::new(1),
                pool: BufferPool::new(),
                stop: StopSignal::new(),
                handle: Mutex::new(None),
                fallback_jpeg: Mutex::new(None),
            }),
        }
    }

    /// Shared selection handle for the input dispatcher.
    pub fn selection(&self) -> Arc<MonitorSelection> {
        Arc::clone(&self.inner.selection)
    }

    pub fn set_target_fps(&self, fps: u32) {
        self.inner.target_fps.store(fps.clamp(1, 60), Ordering::SeqCst);
    }

    /// Spawn the capture loop. Idempotent while running.
    pub fn start(&self) {
        let mut handle = self.inner.handle.lock().unwrap();
        if handle.is_some() {
            return;
        }

        self.inner.stop.reset();
        self.inner.sequence.store(0, Ordering::SeqCst);
        self.inner.frames_published.store(0, Ordering::SeqCst);
        self.inner.running.store(true, Ordering::SeqCst);

        // Seed the enumeration and default the selection to the primary
        // monitor before the first frame.
        if let Err(e) = self.refresh_monitors() {
            warn!("initial monitor enumeration failed: {}", e);
        }

        let inner = Arc::clone(&self.inner);
        *handle = Some(std::thread::spawn(move || {
            run_loop(&inner);
            inner.running.store(false, Ordering::SeqCst);
        }));

        info!("capture engine started");
    }

    /// Signal cancellation and join the loop, waiting at most 5 s.
    pub fn stop(&self) {
        self.inner.stop.trigger();

        let handle = self.inner.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let deadline = Instant::now() + STOP_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(20));
            }
            if handle.is_finished() {
                let _ = handle.join();
                info!("capture engine stopped");
            } else {
                warn!("capture loop did not exit within {:?}", STOP_TIMEOUT);
            }
        }
        self.inner.running.store(false, Ordering::SeqCst);
    }

    pub fn status(&self) -> CaptureStatus {
        let status = self.inner.status.lock().unwrap();
        let mode = if status.degraded {
            format!("{}_degraded", status.mode.as_str())
        } else {
            status.mode.as_str().to_string()
        };
        CaptureStatus {
            running: self.inner.running.load(Ordering::SeqCst),
            last_frame_at: status.last_frame_at,
            mode,
            degraded: status.degraded,
            frames_published: self.inner.frames_published.load(Ordering::SeqCst),
            subscribers: self.inner.subscribers.lock().unwrap().len(),
        }
    }

    /// Enumerate monitors from both sources inside a desktop scope.
    pub fn list_monitors(&self) -> Result<Vec<MonitorInfo>, CaptureError> {
        self.refresh_monitors()
    }

    fn refresh_monitors(&self) -> Result<Vec<MonitorInfo>, CaptureError> {
        let inner = &self.inner;
        let snapshot = inner.session.current();

        let merged = desktop_scope::run_scoped(&*inner.platform, Some(snapshot), || {
            let devices = inner.platform.enumerate_display_devices()?;
            let monitors = inner.platform.enumerate_display_monitors()?;
            Ok::<_, PlatformError>(monitors::merge_sources(devices, monitors))
        })?;

        if merged.is_empty() {
            return Err(CaptureError::NoMonitors);
        }

        *inner.monitors.lock().unwrap() = merged.clone();

        // Default or repair the selection against the fresh list.
        let current = inner.selection.get();
        let still_valid = current
            .as_ref()
            .map(|selected| merged.iter().any(|m| m.id == selected.id))
            .unwrap_or(false);
        if !still_valid {
            if let Some(primary) = merged.iter().find(|m| m.primary).or(merged.first()) {
                inner.selection.set(primary.clone());
            }
        }

        Ok(merged)
    }

    /// Select a monitor by id and warp the cursor to its center.
    ///
    /// Unknown ids leave the selection untouched.
    pub fn select_monitor(&self, id: &str) -> Result<(), CaptureError> {
        let monitor = {
            let monitors = self.inner.monitors.lock().unwrap();
            monitors.iter().find(|m| m.id == id).cloned()
        };

        let Some(monitor) = monitor else {
            return Err(CaptureError::UnknownMonitor(id.to_string()));
        };

        self.inner.selection.set(monitor.clone());
        info!(monitor = %monitor.id, "monitor selected");

        let (cx, cy) = monitor.center();
        if let Err(e) = self.inner.platform.warp_cursor(cx, cy) {
            warn!("cursor warp after monitor select failed: {}", e);
        }
        Ok(())
    }

    pub fn subscribe(&self) -> (u64, Arc<FrameChannel>) {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        let channel = FrameChannel::new();
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&channel));
        debug!(subscriber = id, "frame subscriber registered");
        (id, channel)
    }

    pub fn unsubscribe(&self, id: u64) {
        if let Some(channel) = self.inner.subscribers.lock().unwrap().remove(&id) {
            channel.close();
            debug!(subscriber = id, "frame subscriber removed");
        }
    }

    #[cfg(test)]
    fn failure_count(&self) -> u32 {
        self.inner.status.lock().unwrap().failure_count
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Convert a BGRA buffer to RGB in a reusable scratch buffer.
fn bgra_to_rgb(bgra: &[u8], scratch: &mut Vec<u8>) {
    scratch.clear();
    scratch.reserve(bgra.len() / 4 * 3);
    for chunk in bgra.chunks_exact(4) {
        scratch.push(chunk[2]);
        scratch.push(chunk[1]);
        scratch.push(chunk[0]);
    }
}

fn encode_jpeg_into(
    pool: &Arc<BufferPool>,
    rgb: &[u8],
    width: u32,
    height: u32,
) -> Result<PooledBytes, CaptureError> {
    let mut out = pool.rent(estimate_capacity(width, height));
    let encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    encoder.write_image(rgb, width, height, ExtendedColorType::Rgb8)?;
    Ok(pool.attach(out))
}

impl EngineInner {
    fn frame_interval(&self) -> Duration {
        let fps = self.target_fps.load(Ordering::SeqCst).max(1);
        Duration::from_millis(1000 / fps as u64)
    }

    fn publish(&self, frame: RemoteFrame) {
        let frame = Arc::new(frame);
        let channels: Vec<Arc<FrameChannel>> = {
            let subscribers = self.subscribers.lock().unwrap();
            subscribers.values().cloned().collect()
        };
        for channel in channels {
            channel.offer(Arc::clone(&frame));
        }
        self.frames_published.fetch_add(1, Ordering::SeqCst);
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record_success(&self, mode: DesktopMode) {
        let mut status = self.status.lock().unwrap();
        status.last_frame_at = Some(now_ms());
        status.failure_count = 0;
        status.mode = mode;
        if status.degraded {
            info!("capture recovered from degraded mode");
            status.degraded = false;
        }
    }

    /// Count a failed iteration; returns whether the engine is degraded.
    fn record_failure(&self, mode: DesktopMode) -> bool {
        let mut status = self.status.lock().unwrap();
        status.mode = mode;
        status.failure_count += 1;
        if status.failure_count >= FAILURE_THRESHOLD {
            status.failure_count = 0;
            if !status.degraded {
                warn!(
                    threshold = FAILURE_THRESHOLD,
                    "capture failing repeatedly, entering degraded mode"
                );
                status.degraded = true;
            }
        }
        status.degraded
    }

    fn is_degraded(&self) -> bool {
        self.status.lock().unwrap().degraded
    }

    /// Cached black JPEG used while degraded.
    fn fallback_payload(&self) -> Result<PooledBytes, CaptureError> {
        let encoded = {
            let mut cached = self.fallback_jpeg.lock().unwrap();
            match cached.as_ref() {
                Some(encoded) => Arc::clone(encoded),
                None => {
                    let black =
                        vec![0u8; (FALLBACK_WIDTH * FALLBACK_HEIGHT * 3) as usize];
                    let mut out = Vec::new();
                    let encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
                    encoder.write_image(
                        &black,
                        FALLBACK_WIDTH,
                        FALLBACK_HEIGHT,
                        ExtendedColorType::Rgb8,
                    )?;
                    let encoded = Arc::new(out);
                    *cached = Some(Arc::clone(&encoded));
                    encoded
                }
            }
        };

        let mut out = self.pool.rent(encoded.len());
        out.extend_from_slice(&encoded);
        Ok(self.pool.attach(out))
    }

    fn publish_fallback(&self) {
        match self.fallback_payload() {
            Ok(data) => self.publish(RemoteFrame {
                sequence: self.next_sequence(),
                timestamp_ms: now_ms(),
                width: FALLBACK_WIDTH,
                height: FALLBACK_HEIGHT,
                format: FrameFormat::Jpeg,
                data,
            }),
            Err(e) => warn!("fallback frame encoding failed: {}", e),
        }
    }
}

/// The capture loop body, running on its own thread until cancelled.
fn run_loop(inner: &Arc<EngineInner>) {
    let mut surface: Option<Box<dyn CaptureSurface>> = None;
    let mut rgb_scratch: Vec<u8> = Vec::new();

    loop {
        if inner.stop.is_triggered() {
            break;
        }

        let interval = inner.frame_interval();
        let frame_start = Instant::now();
        let snapshot = inner.session.current();

        let Some(monitor) = inner.selection.get() else {
            if inner.stop.wait(interval) {
                break;
            }
            continue;
        };

        // The context must match the selected monitor's dimensions.
        let dims_match = surface
            .as_ref()
            .map(|s| s.width() == monitor.width && s.height() == monitor.height)
            .unwrap_or(false);
        if !dims_match {
            surface = None;
            match inner.platform.create_capture_surface(monitor.width, monitor.height) {
                Ok(created) => surface = Some(created),
                Err(e) => {
                    warn!("capture surface allocation failed: {}", e);
                    inner.record_failure(snapshot.mode);
                    if inner.is_degraded() {
                        inner.publish_fallback();
                    }
                    if inner.stop.wait(ALLOC_RETRY_DELAY) {
                        break;
                    }
                    continue;
                }
            }
        }

        let Some(target) = surface.as_mut() else {
            continue;
        };
        let captured = desktop_scope::run_scoped(&*inner.platform, Some(snapshot), || {
            let mut last_error = None;
            for strategy in CaptureStrategy::LADDER {
                match target.capture(strategy, monitor.x, monitor.y) {
                    Ok(pixels) => {
                        bgra_to_rgb(pixels, &mut rgb_scratch);
                        return Ok(());
                    }
                    Err(e) => {
                        debug!(?strategy, "capture strategy failed: {}", e);
                        last_error = Some(e);
                    }
                }
            }
            Err(last_error.unwrap_or(PlatformError::Unsupported))
        });

        match captured {
            Ok(()) => {
                match encode_jpeg_into(&inner.pool, &rgb_scratch, monitor.width, monitor.height)
                {
                    Ok(data) => {
                        inner.record_success(snapshot.mode);
                        inner.publish(RemoteFrame {
                            sequence: inner.next_sequence(),
                            timestamp_ms: now_ms(),
                            width: monitor.width,
                            height: monitor.height,
                            format: FrameFormat::Jpeg,
                            data,
                        });
                    }
                    Err(e) => {
                        warn!("frame encoding failed: {}", e);
                        if inner.record_failure(snapshot.mode) {
                            inner.publish_fallback();
                        }
                    }
                }
            }
            Err(e) => {
                debug!("all capture strategies failed: {}", e);
                if inner.record_failure(snapshot.mode) {
                    inner.publish_fallback();
                }
            }
        }

        if let Some(remaining) = interval.checked_sub(frame_start.elapsed()) {
            if inner.stop.wait(remaining) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::headless::HeadlessPlatform;
    use crate::platform::DisplayDevice;
    use tokio::time::timeout;

    fn display(name: &str, x: i32, primary: bool) -> DisplayDevice {
        DisplayDevice {
            device_name: name.to_string(),
            friendly_name: name.to_string(),
            x,
            y: 0,
            width: 1920,
            height: 1080,
            primary,
        }
    }

    fn engine_with(platform: Arc<HeadlessPlatform>) -> (CaptureEngine, Arc<SessionMonitor>) {
        let session = Arc::new(SessionMonitor::new(platform.clone()));
        let engine = CaptureEngine::new(platform, Arc::clone(&session), 30);
        (engine, session)
    }

    async fn recv_frame(channel: &Arc<FrameChannel>) -> Arc<RemoteFrame> {
        timeout(Duration::from_secs(5), channel.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn publishes_monotonic_jpeg_frames() {
        let platform = Arc::new(HeadlessPlatform::new());
        let (engine, _session) = engine_with(platform);
        let (_, channel) = engine.subscribe();

        engine.start();
        let first = recv_frame(&channel).await;
        let second = recv_frame(&channel).await;
        engine.stop();

        assert_eq!(first.format, FrameFormat::Jpeg);
        assert_eq!(first.width, 1280);
        assert_eq!(first.height, 800);
        assert!(!first.data.is_empty());
        assert!(second.sequence > first.sequence);
        assert!(engine.status().frames_published >= 2);
        assert_eq!(engine.status().subscribers, 1);
    }

    #[tokio::test]
    async fn degraded_mode_publishes_fallback_and_recovers() {
        let platform = Arc::new(HeadlessPlatform::new());
        let (engine, _session) = engine_with(Arc::clone(&platform));
        let (_, channel) = engine.subscribe();

        // Each failed iteration burns one attempt per ladder strategy;
        // ten failing iterations keep the engine degraded long enough to
        // observe the status without racing the recovery.
        platform.fail_next_captures(10 * CaptureStrategy::LADDER.len() as u32);
        engine.start();

        // First published frame is the black fallback at the fixed size.
        let fallback = recv_frame(&channel).await;
        assert_eq!((fallback.width, fallback.height), (FALLBACK_WIDTH, FALLBACK_HEIGHT));
        assert!(engine.status().degraded);
        assert!(engine.status().mode.ends_with("_degraded"));

        // Once captures succeed again the engine recovers and publishes
        // real frames at the monitor's size, with non-black content.
        let recovered = loop {
            let frame = recv_frame(&channel).await;
            if frame.width == 1280 {
                break frame;
            }
        };
        assert!(!engine.status().degraded);
        engine.stop();

        let decoded = image::load_from_memory(&recovered.data)
            .expect("recovered frame decodes as an image")
            .to_rgb8();
        assert!(decoded.pixels().any(|pixel| pixel.0 != [0, 0, 0]));
    }

    #[test]
    fn failures_below_threshold_do_not_degrade() {
        let platform = Arc::new(HeadlessPlatform::new());
        let (engine, _session) = engine_with(Arc::clone(&platform));
        let snapshot_mode = DesktopMode::Desktop;
        for _ in 0..FAILURE_THRESHOLD - 1 {
            engine.inner.record_failure(snapshot_mode);
        }
        assert!(!engine.status().degraded);
        assert_eq!(engine.failure_count(), FAILURE_THRESHOLD - 1);

        engine.inner.record_success(snapshot_mode);
        assert_eq!(engine.failure_count(), 0);
    }

    #[test]
    fn list_monitors_sorts_and_assigns_ids() {
        let platform = Arc::new(HeadlessPlatform::new());
        platform.set_displays(vec![
            display("right", 1920, false),
            display("main", 0, true),
        ]);
        let (engine, _session) = engine_with(platform);

        let monitors = engine.list_monitors().unwrap();
        assert_eq!(monitors.len(), 2);
        assert_eq!(monitors[0].id, "DISPLAY1");
        assert!(monitors[0].primary);
        assert_eq!(monitors[1].id, "DISPLAY2");
        assert_eq!(monitors[1].x, 1920);
    }

    #[test]
    fn select_monitor_warps_cursor_to_center() {
        let platform = Arc::new(HeadlessPlatform::new());
        platform.set_displays(vec![
            display("main", 0, true),
            display("right", 1920, false),
        ]);
        let (engine, _session) = engine_with(Arc::clone(&platform));
        engine.list_monitors().unwrap();

        engine.select_monitor("DISPLAY2").unwrap();
        assert_eq!(platform.cursor_pos(), (1920 + 960, 540));
        assert_eq!(engine.selection().get().unwrap().id, "DISPLAY2");
    }

    #[test]
    fn selecting_unknown_monitor_is_a_no_op() {
        let platform = Arc::new(HeadlessPlatform::new());
        let (engine, _session) = engine_with(platform);
        engine.list_monitors().unwrap();
        let before = engine.selection().get();

        let result = engine.select_monitor("DISPLAY9");
        assert!(matches!(result, Err(CaptureError::UnknownMonitor(_))));
        assert_eq!(engine.selection().get(), before);
    }

    #[tokio::test]
    async fn unsubscribe_closes_the_channel() {
        let platform = Arc::new(HeadlessPlatform::new());
        let (engine, _session) = engine_with(platform);
        let (id, channel) = engine.subscribe();
        engine.unsubscribe(id);
        assert!(channel.recv().await.is_none());
    }

    #[test]
    fn stop_joins_the_loop() {
        let platform = Arc::new(HeadlessPlatform::new());
        let (engine, _session) = engine_with(platform);
        engine.start();
        assert!(engine.status().running);
        engine.stop();
        assert!(!engine.status().running);
    }
}
