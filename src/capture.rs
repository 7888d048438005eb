//! Acquisition loop: fetch, decode, publish, throttle.
//!
//! One thread drives everything. Camera and decode failures are logged and
//! the cycle is skipped; publish failures back off and retry unless the
//! error is fatal. Shutdown is observed between states, while sleeping and
//! while waiting for the named lock, never inside the critical section.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;

use crate::error::{RelayError, RelayResult};
use crate::ingest::{FrameDecoder, FrameSource};
use crate::preview::{Preview, PreviewAction};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(650);
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_RATE_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Destination of normalized frames.
///
/// Implementations take the named lock around the write; see
/// [`SharedResources`](crate::lifecycle::SharedResources).
pub trait FrameSink {
    fn publish(&mut self, frame: &[u8], sequence: u32) -> RelayResult<()>;
}

impl<T: FrameSink + ?Sized> FrameSink for &mut T {
    fn publish(&mut self, frame: &[u8], sequence: u32) -> RelayResult<()> {
        (**self).publish(frame, sequence)
    }
}

/// Cooperative termination flag shared with the signal handler.
#[derive(Clone, Debug, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` or until shutdown is requested.
    /// Returns true when woken by a shutdown request.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_requested() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CaptureSettings {
    /// Pause after every cycle.
    pub frame_interval: Duration,
    /// Extra pause after a failed publish.
    pub error_backoff: Duration,
    /// How often the observed publish rate is logged.
    pub rate_log_interval: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            frame_interval: DEFAULT_FRAME_INTERVAL,
            error_backoff: DEFAULT_ERROR_BACKOFF,
            rate_log_interval: DEFAULT_RATE_LOG_INTERVAL,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub published: u64,
    pub fetch_failures: u64,
    pub decode_failures: u64,
    pub publish_failures: u64,
    pub last_sequence: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureExit {
    /// Termination was requested through [`Shutdown`].
    Shutdown,
    /// The preview asked to quit.
    PreviewQuit,
}

/// Frames per second over a fixed wall-clock window.
#[derive(Debug)]
pub struct RateMeter {
    interval: Duration,
    frames: u64,
    since: Instant,
}

impl RateMeter {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            frames: 0,
            since: now,
        }
    }

    pub fn record(&mut self) {
        self.frames += 1;
    }

    /// Once the window has elapsed, return its rate and start a new one.
    pub fn poll(&mut self, now: Instant) -> Option<f64> {
        let elapsed = now.saturating_duration_since(self.since);
        if elapsed < self.interval || elapsed.is_zero() {
            return None;
        }
        let rate = self.frames as f64 / elapsed.as_secs_f64();
        self.frames = 0;
        self.since = now;
        Some(rate)
    }
}

enum Cycle {
    Published,
    Skipped,
    Quit,
}

pub struct CaptureLoop<S, D, K> {
    source: S,
    decoder: D,
    sink: K,
    preview: Option<Box<dyn Preview>>,
    settings: CaptureSettings,
    shutdown: Shutdown,
    next_sequence: u32,
    stats: CaptureStats,
    rate: RateMeter,
}

impl<S, D, K> CaptureLoop<S, D, K>
where
    S: FrameSource,
    D: FrameDecoder,
    K: FrameSink,
{
    pub fn new(
        source: S,
        decoder: D,
        sink: K,
        settings: CaptureSettings,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            source,
            decoder,
            sink,
            preview: None,
            settings,
            shutdown,
            next_sequence: 0,
            stats: CaptureStats::default(),
            rate: RateMeter::new(settings.rate_log_interval, Instant::now()),
        }
    }

    /// Sequence number carried by the first publish.
    pub fn starting_at(mut self, sequence: u32) -> Self {
        self.next_sequence = sequence;
        self
    }

    pub fn with_preview(mut self, preview: Box<dyn Preview>) -> Self {
        self.preview = Some(preview);
        self
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    pub fn next_sequence(&self) -> u32 {
        self.next_sequence
    }

    /// Run until shutdown, a preview quit, or a fatal publish error.
    pub fn run(&mut self) -> RelayResult<CaptureExit> {
        log::info!(
            "starting frame capture loop from {} (first sequence {})",
            self.source.describe(),
            self.next_sequence
        );
        self.rate = RateMeter::new(self.settings.rate_log_interval, Instant::now());

        loop {
            if self.shutdown.is_requested() {
                return Ok(CaptureExit::Shutdown);
            }

            let pause = match self.cycle() {
                Ok(Cycle::Quit) => {
                    log::info!("preview quit requested");
                    return Ok(CaptureExit::PreviewQuit);
                }
                Ok(Cycle::Published | Cycle::Skipped) => self.settings.frame_interval,
                Err(RelayError::Cancelled(lock)) => {
                    log::info!("stopped waiting for named lock {}", lock);
                    return Ok(CaptureExit::Shutdown);
                }
                Err(e) if e.is_fatal() => {
                    log::error!("frame publication cannot continue: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    self.stats.publish_failures += 1;
                    log::error!("frame capture error: {}", e);
                    self.settings.error_backoff + self.settings.frame_interval
                }
            };

            if let Some(fps) = self.rate.poll(Instant::now()) {
                log::info!("publishing at {:.2} fps", fps);
            }

            if self.shutdown.sleep(pause) {
                return Ok(CaptureExit::Shutdown);
            }
        }
    }

    fn cycle(&mut self) -> RelayResult<Cycle> {
        let frame = match self.acquire() {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("{}", e);
                return Ok(Cycle::Skipped);
            }
        };
        let sequence = self.next_sequence;
        if let Err(e) = self.sink.publish(&frame, sequence) {
            if !matches!(e, RelayError::Cancelled(_)) {
                log::error!("failed to write frame {}: {}", sequence, e);
            }
            return Err(e);
        }
        self.next_sequence = sequence.wrapping_add(1);
        self.stats.published += 1;
        self.stats.last_sequence = Some(sequence);
        self.rate.record();

        if let Some(preview) = self.preview.as_mut() {
            match preview.show(&frame) {
                Ok(PreviewAction::Quit) => return Ok(Cycle::Quit),
                Ok(PreviewAction::Continue) => {}
                Err(e) => log::warn!("preview failed: {:#}", e),
            }
        }
        Ok(Cycle::Published)
    }

    /// Fetch and decode one frame. Every failure here is transient.
    fn acquire(&mut self) -> RelayResult<Vec<u8>> {
        let encoded = match self.source.fetch() {
            Ok(Some(encoded)) => encoded,
            Ok(None) => {
                self.stats.fetch_failures += 1;
                return Err(RelayError::Transient(anyhow!(
                    "no frame received from camera"
                )));
            }
            Err(e) => {
                self.stats.fetch_failures += 1;
                return Err(RelayError::Transient(e.context("camera fetch")));
            }
        };
        self.decoder.decode(&encoded).map_err(|e| {
            self.stats.decode_failures += 1;
            RelayError::Transient(e.context("failed to decode frame"))
        })
    }
}
