//! Timed playback of captures into the bus manager
//!
//! Replays a loaded capture as if the frames arrived live: each record is
//! injected into the bus matching its recorded source. Cancellation is a
//! cooperative flag checked between frames and inside every sleep slice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::bus::BusInjector;
use crate::capture::{CaptureError, CaptureFile};
use crate::frame::Frame;

/// Longest single sleep before the cancel flag is re-checked.
const SLEEP_SLICE: Duration = Duration::from_millis(20);

/// Playback pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplaySpeed {
    /// Preserve the recorded inter-frame timing.
    #[default]
    Realtime,
    /// Fixed 10 ms between frames.
    Fast,
    /// No delay.
    Instant,
}

impl ReplaySpeed {
    fn delay(&self, recorded_delta: f64) -> Option<Duration> {
        match self {
            ReplaySpeed::Realtime => {
                (recorded_delta > 0.0).then(|| Duration::from_secs_f64(recorded_delta.min(10.0)))
            }
            ReplaySpeed::Fast => Some(Duration::from_millis(10)),
            ReplaySpeed::Instant => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayState {
    Idle,
    Running,
}

#[derive(Debug, Clone)]
pub struct ReplayStatus {
    pub state: ReplayState,
    pub source: Option<String>,
    /// 0-100.
    pub progress: u8,
}

/// Shared replay status plus the cancel flag.
#[derive(Clone)]
pub struct ReplayManager {
    status: Arc<RwLock<ReplayStatus>>,
    cancel: Arc<AtomicBool>,
}

impl Default for ReplayManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayManager {
    pub fn new() -> Self {
        Self {
            status: Arc::new(RwLock::new(ReplayStatus {
                state: ReplayState::Idle,
                source: None,
                progress: 0,
            })),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn status(&self) -> ReplayStatus {
        self.status.read().await.clone()
    }

    pub async fn start(&self, source: String) {
        let mut status = self.status.write().await;
        status.state = ReplayState::Running;
        status.source = Some(source);
        status.progress = 0;
        self.cancel.store(false, Ordering::SeqCst);
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    async fn update_progress(&self, progress: u8) {
        self.status.write().await.progress = progress.min(100);
    }

    async fn complete(&self) {
        let mut status = self.status.write().await;
        status.state = ReplayState::Idle;
        status.progress = 100;
    }

    /// Sleep in short slices so cancellation stays responsive.
    async fn sliced_sleep(&self, total: Duration) {
        let mut remaining = total;
        while !remaining.is_zero() {
            if self.is_canceled() {
                return;
            }
            let slice = remaining.min(SLEEP_SLICE);
            sleep(slice).await;
            remaining = remaining.saturating_sub(slice);
        }
    }

    /// Replay a capture into the given buses. Frames route to the injector
    /// named by their recorded source, falling back to the first injector.
    /// Returns how many frames were injected.
    pub async fn replay_capture(
        &self,
        capture: &CaptureFile,
        injectors: &[BusInjector],
        speed: ReplaySpeed,
    ) -> Result<usize, CaptureError> {
        let frames: Vec<Frame> = capture.frames()?;
        let total = frames.len();
        info!(frames = total, ?speed, "starting replay");
        self.start(format!("{} capture", capture.file_type.as_str())).await;

        let by_name: HashMap<&str, &BusInjector> =
            injectors.iter().map(|i| (i.name(), i)).collect();
        let fallback = injectors.first();

        let mut injected = 0usize;
        let mut previous_ts: Option<f64> = None;

        for (index, frame) in frames.into_iter().enumerate() {
            if self.is_canceled() {
                info!(at = index, total, "replay canceled");
                self.complete().await;
                return Ok(injected);
            }

            if let Some(prev) = previous_ts {
                if let Some(delay) = speed.delay(frame.timestamp() - prev) {
                    self.sliced_sleep(delay).await;
                }
            }
            previous_ts = Some(frame.timestamp());

            let target = by_name.get(frame.source()).copied().or(fallback);
            if let Some(injector) = target {
                if injector.inject(frame).await {
                    injected += 1;
                }
            }

            if index % 10 == 0 || index + 1 == total {
                let progress = ((index + 1) as f64 / total.max(1) as f64 * 100.0) as u8;
                self.update_progress(progress).await;
            }
        }

        debug!(injected, "replay complete");
        self.complete().await;
        Ok(injected)
    }
}
