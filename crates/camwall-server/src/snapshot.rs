//! Headless renderer: per-slot frame statistics and PNG snapshots
//!
//! Each slot's latest frame is written to `<dir>/slot-<id>.png` at most once
//! per snapshot interval. Files are written to a temporary name and renamed
//! into place, so readers never see a partial image.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use image::{ImageFormat, RgbImage};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use camwall_core::{PresentedFrame, Renderer, SlotId};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("PNG encoding failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("RGB buffer of {len} bytes does not hold a {width}x{height} image")]
    BufferSize { len: usize, width: u32, height: u32 },
}

/// Encode a packed RGB buffer as PNG at `path`.
pub fn write_png(path: &Path, rgb: Vec<u8>, width: u32, height: u32) -> Result<(), SnapshotError> {
    let len = rgb.len();
    let image = RgbImage::from_raw(width, height, rgb).ok_or(SnapshotError::BufferSize {
        len,
        width,
        height,
    })?;

    let tmp = path.with_extension("png.tmp");
    let result = image
        .save_with_format(&tmp, ImageFormat::Png)
        .map_err(SnapshotError::from)
        .and_then(|()| std::fs::rename(&tmp, path).map_err(SnapshotError::from));
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

/// Per-slot counters
#[derive(Debug, Clone, Default)]
pub struct SlotStats {
    /// Frames presented since the producer connected
    pub frames: u64,
    /// Frames since the last statistics report
    pub frames_since_report: u64,
    pub resolution: Option<(u32, u32)>,
    pub snapshots_written: u64,
    last_snapshot: Option<Instant>,
}

/// [`Renderer`] that logs statistics and optionally keeps PNG snapshots.
pub struct SnapshotRenderer {
    slots: Vec<SlotStats>,
    snapshot_dir: Option<PathBuf>,
    snapshot_interval: Duration,
    stats_interval: Option<Duration>,
    last_report: Instant,
    /// PNG writes still running on the blocking pool
    pending: Vec<JoinHandle<()>>,
}

impl SnapshotRenderer {
    pub fn new(
        slots: usize,
        snapshot_dir: Option<PathBuf>,
        snapshot_interval: Duration,
        stats_interval: Option<Duration>,
    ) -> Self {
        Self {
            slots: vec![SlotStats::default(); slots],
            snapshot_dir,
            snapshot_interval,
            stats_interval,
            last_report: Instant::now(),
            pending: Vec::new(),
        }
    }

    /// Wait for every PNG write still in flight. Returns how many were awaited.
    pub async fn flush(&mut self) -> usize {
        let pending = std::mem::take(&mut self.pending);
        let count = pending.len();
        for handle in pending {
            if let Err(e) = handle.await {
                warn!("snapshot task failed: {}", e);
            }
        }
        count
    }

    pub fn stats(&self, slot_id: SlotId) -> Option<&SlotStats> {
        self.slots.get(slot_id)
    }

    fn slot_mut(&mut self, slot_id: SlotId) -> &mut SlotStats {
        if slot_id >= self.slots.len() {
            self.slots.resize(slot_id + 1, SlotStats::default());
        }
        &mut self.slots[slot_id]
    }

    pub fn snapshot_path(&self, slot_id: SlotId) -> Option<PathBuf> {
        self.snapshot_dir
            .as_ref()
            .map(|dir| dir.join(format!("slot-{}.png", slot_id)))
    }

    fn maybe_snapshot(&mut self, frame: &PresentedFrame<'_>) {
        let Some(path) = self.snapshot_path(frame.slot_id) else {
            return;
        };
        let interval = self.snapshot_interval;
        let stats = self.slot_mut(frame.slot_id);
        let now = Instant::now();
        if stats
            .last_snapshot
            .is_some_and(|last| now.duration_since(last) < interval)
        {
            return;
        }
        stats.last_snapshot = Some(now);
        stats.snapshots_written += 1;

        let (slot, width, height) = (frame.slot_id, frame.width, frame.height);
        let rgb = frame.rgb.to_vec();
        let write = move || {
            match write_png(&path, rgb, width, height) {
                Ok(()) => debug!(slot, path = %path.display(), "snapshot written"),
                Err(e) => warn!(slot, path = %path.display(), "snapshot failed: {}", e),
            }
        };

        // Encoding is slow; keep it off the render loop when a runtime is available.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                self.pending.retain(|task| !task.is_finished());
                self.pending.push(handle.spawn_blocking(write));
            }
            Err(_) => write(),
        }
    }

    fn maybe_report(&mut self) {
        let Some(interval) = self.stats_interval else {
            return;
        };
        let elapsed = self.last_report.elapsed();
        if elapsed < interval {
            return;
        }

        for (slot, stats) in self.slots.iter_mut().enumerate() {
            if stats.frames == 0 {
                continue;
            }
            let fps = stats.frames_since_report as f64 / elapsed.as_secs_f64();
            let (width, height) = stats.resolution.unwrap_or_default();
            info!(
                slot,
                frames = stats.frames,
                fps = format!("{:.1}", fps),
                width,
                height,
                "slot statistics"
            );
            stats.frames_since_report = 0;
        }
        self.last_report = Instant::now();
    }
}

impl Renderer for SnapshotRenderer {
    fn present(&mut self, frame: PresentedFrame<'_>) {
        let stats = self.slot_mut(frame.slot_id);
        stats.frames += 1;
        stats.frames_since_report += 1;
        if stats.resolution != Some((frame.width, frame.height)) {
            stats.resolution = Some((frame.width, frame.height));
            info!(
                slot = frame.slot_id,
                width = frame.width,
                height = frame.height,
                "slot resolution set"
            );
        }

        self.maybe_snapshot(&frame);
        self.maybe_report();
    }

    fn vacate(&mut self, slot_id: SlotId) {
        let stats = std::mem::take(self.slot_mut(slot_id));
        info!(slot = slot_id, frames = stats.frames, "slot vacated");
    }
}
