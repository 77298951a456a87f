//! Frame and device types shared by every capture backend.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use bridge_convert::{ColorInfo, PixelFormat};

/// Describes one capture device independently of the backend.
///
/// The identifier outlives the descriptor so a stream can reconnect after
/// a device re-enumerates under a new name; when a serial number is
/// available it is preferred for matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Backend-native stable identifier (device path or friendly name).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Hardware serial number when the backend exposes one.
    pub serial: Option<String>,
    pub supports_capture: bool,
    pub supports_streaming: bool,
}

impl DeviceInfo {
    /// Whether `selector` identifies this device: exact id, serial match,
    /// or case-insensitive substring of the display name.
    #[must_use]
    pub fn matches(&self, selector: &str) -> bool {
        if self.id == selector {
            return true;
        }
        if let Some(serial) = &self.serial {
            if serial == selector {
                return true;
            }
        }
        self.name.to_lowercase().contains(&selector.to_lowercase())
    }
}

/// Negotiated video format of a running capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    /// Row pitch in bytes.
    pub stride: u32,
    pub pixel_format: PixelFormat,
    pub fps_num: u32,
    pub fps_den: u32,
    pub interlaced: bool,
    pub color: ColorInfo,
}

impl VideoFormat {
    #[must_use]
    pub fn new(width: u32, height: u32, stride: u32, pixel_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            stride,
            pixel_format,
            fps_num: 30,
            fps_den: 1,
            interlaced: false,
            color: ColorInfo::detect(width, height),
        }
    }

    /// Check the structural invariants: nonzero geometry, stride at least
    /// one packed row, even height for 4:2:0 formats.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if self.width == 0 || self.height == 0 || self.fps_den == 0 {
            return false;
        }
        let min_stride = self.width as usize * self.pixel_format.bytes_per_pixel();
        if (self.stride as usize) < min_stride {
            return false;
        }
        if matches!(self.pixel_format, PixelFormat::Nv12 | PixelFormat::Yuv420)
            && self.height % 2 != 0
        {
            return false;
        }
        true
    }

    /// Expected payload size in bytes for one frame of this format.
    #[must_use]
    pub fn frame_size(&self) -> usize {
        let stride = self.stride as usize;
        let height = self.height as usize;
        match self.pixel_format {
            PixelFormat::Nv12 | PixelFormat::Yuv420 => stride * height * 3 / 2,
            _ => stride * height,
        }
    }

    #[must_use]
    pub fn fps(&self) -> f32 {
        if self.fps_den == 0 {
            return 0.0;
        }
        self.fps_num as f32 / self.fps_den as f32
    }
}

/// A captured frame borrowed from the backend's buffer.
///
/// Valid only for the duration of the frame callback; backends requeue
/// their buffers to the kernel as soon as the callback returns.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub data: &'a [u8],
    /// Monotonic timestamp in nanoseconds. Kernel-provided when the driver
    /// supplies one, process-monotonic otherwise.
    pub timestamp_ns: i64,
    pub format: &'a VideoFormat,
}

/// Capture statistics, written by the capture thread and read atomically
/// by the supervisor. Reset on each capture start.
#[derive(Debug, Default)]
pub struct CaptureStats {
    captured: AtomicU64,
    dropped: AtomicU64,
    zero_copy: AtomicU64,
    total_latency_ns: AtomicU64,
    max_latency_ns: AtomicU64,
    min_latency_ns: AtomicI64,
}

impl CaptureStats {
    pub fn reset(&self) {
        self.captured.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.zero_copy.store(0, Ordering::Relaxed);
        self.total_latency_ns.store(0, Ordering::Relaxed);
        self.max_latency_ns.store(0, Ordering::Relaxed);
        self.min_latency_ns.store(i64::MAX, Ordering::Relaxed);
    }

    pub fn record_frame(&self, dequeued_at: Instant, zero_copy: bool) {
        let latency = dequeued_at.elapsed().as_nanos() as u64;
        self.captured.fetch_add(1, Ordering::Relaxed);
        if zero_copy {
            self.zero_copy.fetch_add(1, Ordering::Relaxed);
        }
        self.total_latency_ns.fetch_add(latency, Ordering::Relaxed);
        self.max_latency_ns.fetch_max(latency, Ordering::Relaxed);
        self.min_latency_ns.fetch_min(latency as i64, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn captured(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let min = self.min_latency_ns.load(Ordering::Relaxed);
        StatsSnapshot {
            captured: self.captured.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            zero_copy: self.zero_copy.load(Ordering::Relaxed),
            total_latency_ns: self.total_latency_ns.load(Ordering::Relaxed),
            max_latency_ns: self.max_latency_ns.load(Ordering::Relaxed),
            min_latency_ns: if min == i64::MAX { 0 } else { min as u64 },
        }
    }
}

/// Point-in-time copy of [`CaptureStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub captured: u64,
    pub dropped: u64,
    pub zero_copy: u64,
    pub total_latency_ns: u64,
    pub max_latency_ns: u64,
    pub min_latency_ns: u64,
}

impl StatsSnapshot {
    #[must_use]
    pub fn avg_latency_ms(&self) -> f64 {
        if self.captured == 0 {
            return 0.0;
        }
        self.total_latency_ns as f64 / self.captured as f64 / 1_000_000.0
    }
}

/// Nanoseconds on the process monotonic clock, the fallback timestamp
/// source when the driver does not stamp buffers.
#[must_use]
pub fn monotonic_ns() -> i64 {
    use std::sync::OnceLock;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_matching() {
        let dev = DeviceInfo {
            id: "/dev/video0".into(),
            name: "USB Capture HDMI (usb-0000:00:14.0-2)".into(),
            serial: Some("A1B2C3".into()),
            supports_capture: true,
            supports_streaming: true,
        };
        assert!(dev.matches("/dev/video0"));
        assert!(dev.matches("usb capture"));
        assert!(dev.matches("A1B2C3"));
        assert!(!dev.matches("decklink"));
    }

    #[test]
    fn format_invariants() {
        let mut fmt = VideoFormat::new(1920, 1080, 3840, PixelFormat::Yuyv);
        assert!(fmt.is_valid());
        assert_eq!(fmt.frame_size(), 3840 * 1080);

        fmt.stride = 100;
        assert!(!fmt.is_valid());

        let odd = VideoFormat::new(640, 481, 640, PixelFormat::Nv12);
        assert!(!odd.is_valid());
    }

    #[test]
    fn nv12_frame_size_is_three_halves() {
        let fmt = VideoFormat::new(640, 480, 640, PixelFormat::Nv12);
        assert_eq!(fmt.frame_size(), 640 * 480 * 3 / 2);
    }

    #[test]
    fn stats_track_min_max() {
        let stats = CaptureStats::default();
        stats.reset();
        stats.record_frame(Instant::now(), true);
        stats.record_frame(Instant::now(), false);
        let snap = stats.snapshot();
        assert_eq!(snap.captured, 2);
        assert_eq!(snap.zero_copy, 1);
        assert!(snap.max_latency_ns >= snap.min_latency_ns);
    }

    #[test]
    fn monotonic_never_decreases() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }
}
