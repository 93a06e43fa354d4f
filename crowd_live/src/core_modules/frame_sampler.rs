// THEORY:
// The frame sampler decides when a camera frame is worth sending. The camera
// refreshes at its own rate and the session loop ticks at its own rate; the
// analyzer only wants a steady trickle (about eight frames a second). Each tick
// the sampler compares the time since its last accepted sample against the
// target interval and either grabs exactly one frame or does nothing.
//
// Key principles:
// 1.  **Drop, never queue**: an accepted sample is offered to the sink once. If
//     the sink is still busy with the previous frame, the new one is dropped.
//     Memory and staleness stay bounded no matter how slow the link is.
// 2.  **Scoped device ownership**: the capture device lives inside a
//     `CaptureGuard`, which releases it on drop. Every exit path (stop, error,
//     task cancellation) releases the device without extra bookkeeping.
// 3.  **Warm-up tolerance**: a device that is open but not yet producing frames
//     is skipped, not treated as an error.
// 4.  **Off the loop**: a grab can block on the device and a full-frame JPEG
//     encode takes real time, so both run on a blocking worker. At most one
//     capture is in flight; ticks that find it running are skipped.

use crate::core_modules::analytics::OutgoingFrame;
use crate::error::{LiveError, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder, Rgb, RgbImage};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(125);
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// A live video device the sampler can pull frames from.
pub trait VideoSource: Send {
    /// Opens the device. Called once, before the first `grab`.
    fn acquire(&mut self) -> Result<()>;

    /// The most recent frame, or `None` while the device is not producing yet.
    fn grab(&mut self) -> Result<Option<RgbImage>>;

    /// Releases the device. Must be safe to call more than once, and before
    /// `acquire`.
    fn release(&mut self);

    fn describe(&self) -> String {
        "video source".to_string()
    }
}

impl<S: VideoSource + ?Sized> VideoSource for Box<S> {
    fn acquire(&mut self) -> Result<()> {
        (**self).acquire()
    }

    fn grab(&mut self) -> Result<Option<RgbImage>> {
        (**self).grab()
    }

    fn release(&mut self) {
        (**self).release()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Receives accepted samples. Returns `false` when the frame was dropped.
pub trait FrameSink {
    fn offer(&mut self, frame: OutgoingFrame) -> bool;
}

/// Owns a `VideoSource` and releases it when dropped.
pub struct CaptureGuard {
    source: Box<dyn VideoSource>,
}

impl CaptureGuard {
    pub fn new(source: impl VideoSource + 'static) -> Self {
        Self {
            source: Box::new(source),
        }
    }

    fn acquire(&mut self) -> Result<()> {
        self.source.acquire().map_err(|err| match err {
            LiveError::SourceUnavailable(reason) => LiveError::SourceUnavailable(reason),
            other => LiveError::SourceUnavailable(other.to_string()),
        })
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        debug!(source = %self.source.describe(), "releasing capture device");
        self.source.release();
    }
}

/// What one scheduling tick, or one finished capture, did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    Inactive,
    NotDue,
    /// A sample was due but the previous capture is still running.
    Busy,
    /// A capture was handed to a blocking worker.
    Capturing,
    SourceNotReady,
    EncodeFailed,
    Sent,
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplerStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
}

enum Captured {
    NotReady,
    GrabFailed(LiveError),
    EncodeFailed(LiveError),
    Encoded(Vec<u8>),
}

/// The device travels into the worker and back with the result.
struct CaptureJob {
    capture: CaptureGuard,
    captured: Captured,
}

struct InFlight {
    requested_at: Instant,
    handle: JoinHandle<CaptureJob>,
}

/// Rate-limits a video source down to one sample per interval.
pub struct FrameSampler {
    interval: Duration,
    jpeg_quality: u8,
    capture: Option<CaptureGuard>,
    in_flight: Option<InFlight>,
    started_at: Instant,
    last_accepted: Option<Instant>,
    stats: SamplerStats,
}

impl FrameSampler {
    pub fn new(interval: Duration, jpeg_quality: u8) -> Self {
        Self {
            interval,
            jpeg_quality: jpeg_quality.clamp(1, 100),
            capture: None,
            in_flight: None,
            started_at: Instant::now(),
            last_accepted: None,
            stats: SamplerStats::default(),
        }
    }

    /// Acquires the device on a blocking worker and begins accepting ticks. On
    /// failure the guard is dropped (releasing whatever was partially opened)
    /// and nothing is scheduled.
    pub async fn start(&mut self, capture: CaptureGuard) -> Result<()> {
        self.stop();
        let (capture, acquired) = tokio::task::spawn_blocking(move || {
            let mut capture = capture;
            let acquired = capture.acquire();
            (capture, acquired)
        })
        .await
        .map_err(|e| LiveError::SourceUnavailable(format!("capture worker failed: {e}")))?;
        acquired?;

        info!(source = %capture.source.describe(), interval_ms = self.interval.as_millis() as u64, "frame sampler started");
        self.capture = Some(capture);
        self.started_at = Instant::now();
        self.last_accepted = None;
        self.stats = SamplerStats::default();
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.capture.is_some() || self.in_flight.is_some()
    }

    pub fn stats(&self) -> SamplerStats {
        self.stats
    }

    /// One scheduling tick. When a sample is due and no capture is running,
    /// hands the grab and encode to a blocking worker and returns at once.
    pub fn tick(&mut self, now: Instant) -> SampleOutcome {
        if !self.is_active() {
            return SampleOutcome::Inactive;
        }
        if let Some(last) = self.last_accepted {
            if now.saturating_duration_since(last) < self.interval {
                return SampleOutcome::NotDue;
            }
        }
        let Some(mut capture) = self.capture.take() else {
            return SampleOutcome::Busy;
        };

        let quality = self.jpeg_quality;
        let handle = tokio::task::spawn_blocking(move || {
            let captured = match capture.source.grab() {
                Ok(Some(image)) => match encode_jpeg(&image, quality) {
                    Ok(bytes) => Captured::Encoded(bytes),
                    Err(err) => Captured::EncodeFailed(err),
                },
                Ok(None) => Captured::NotReady,
                Err(err) => Captured::GrabFailed(err),
            };
            CaptureJob { capture, captured }
        });
        self.in_flight = Some(InFlight {
            requested_at: now,
            handle,
        });
        SampleOutcome::Capturing
    }

    /// Waits for the running capture and offers its frame to `sink`. Never
    /// resolves while nothing is running, so it can sit in a `select!`.
    /// Cancelling it leaves the capture running.
    pub async fn completed(&mut self, sink: &mut impl FrameSink) -> SampleOutcome {
        let Some(in_flight) = self.in_flight.as_mut() else {
            return std::future::pending().await;
        };
        let joined = (&mut in_flight.handle).await;
        let requested_at = in_flight.requested_at;
        self.in_flight = None;

        let job = match joined {
            Ok(job) => job,
            Err(err) => {
                warn!(error = %err, "capture worker failed, device released");
                return SampleOutcome::Inactive;
            }
        };
        self.capture = Some(job.capture);

        let image_bytes = match job.captured {
            Captured::Encoded(bytes) => bytes,
            Captured::NotReady => return SampleOutcome::SourceNotReady,
            Captured::GrabFailed(err) => {
                warn!(error = %err, "skipping sample, frame grab failed");
                return SampleOutcome::SourceNotReady;
            }
            Captured::EncodeFailed(err) => {
                self.last_accepted = Some(requested_at);
                warn!(error = %err, "skipping sample");
                return SampleOutcome::EncodeFailed;
            }
        };
        self.last_accepted = Some(requested_at);
        let frame = OutgoingFrame {
            image_bytes,
            captured_at_ms: requested_at.saturating_duration_since(self.started_at).as_millis() as u64,
        };

        if sink.offer(frame) {
            self.stats.frames_sent += 1;
            SampleOutcome::Sent
        } else {
            self.stats.frames_dropped += 1;
            debug!("analyzer link busy, sample dropped");
            SampleOutcome::Dropped
        }
    }

    /// Stops accepting ticks and releases the device. A capture still running
    /// is detached and releases the device as soon as its grab returns. Safe
    /// to call repeatedly.
    pub fn stop(&mut self) {
        let detached = self.in_flight.take().is_some();
        let capture = self.capture.take();
        if capture.is_some() || detached {
            info!(
                frames_sent = self.stats.frames_sent,
                frames_dropped = self.stats.frames_dropped,
                "frame sampler stopped"
            );
        }
        drop(capture);
    }

    /// Like `stop`, but first waits for a running capture so the device is
    /// released before this returns.
    pub async fn shutdown(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            if let Ok(job) = in_flight.handle.await {
                self.capture = Some(job.capture);
            }
        }
        self.stop();
    }
}

impl Drop for FrameSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Encodes an RGB frame as JPEG at `quality` (1-100).
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, quality)
        .write_image(image.as_raw(), image.width(), image.height(), ExtendedColorType::Rgb8)
        .map_err(|e| LiveError::Encode(e.to_string()))?;
    Ok(bytes)
}

/// A deterministic moving test pattern, for demos and tests.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    warmup_frames: u32,
    frame_index: u64,
    acquired: bool,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            warmup_frames: 0,
            frame_index: 0,
            acquired: false,
        }
    }

    /// The first `frames` grabs return nothing, like a camera warming up.
    pub fn with_warmup(mut self, frames: u32) -> Self {
        self.warmup_frames = frames;
        self
    }
}

impl VideoSource for SyntheticSource {
    fn acquire(&mut self) -> Result<()> {
        self.acquired = true;
        self.frame_index = 0;
        Ok(())
    }

    fn grab(&mut self) -> Result<Option<RgbImage>> {
        if !self.acquired {
            return Err(LiveError::SourceUnavailable("synthetic source not acquired".to_string()));
        }
        if self.warmup_frames > 0 {
            self.warmup_frames -= 1;
            return Ok(None);
        }
        let shift = (self.frame_index % 256) as u32;
        self.frame_index += 1;
        Ok(Some(RgbImage::from_fn(self.width, self.height, |x, y| {
            Rgb([((x + shift) % 256) as u8, ((y + shift) % 256) as u8, (shift % 256) as u8])
        })))
    }

    fn release(&mut self) {
        self.acquired = false;
    }

    fn describe(&self) -> String {
        format!("synthetic {}x{}", self.width, self.height)
    }
}
