//! Stream-to-display mapping lifecycle.
//!
//! Each mapping owns a receiver, the opened display and the audio sink.
//! Video frames are presented inline on the receive thread; audio goes
//! through the stereo ring into the PipeWire callback. Unmapping stops
//! the receive thread, clears the display and removes the status file.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bridge_convert::PixelFormat;
use bridge_ndi::{
    NdiAudioFrame, NdiFinder, NdiReceiver, NdiRuntime, NdiVideoFrame, ReceiveHandler,
    ReceiverStats,
};

use crate::audio::{AudioRing, PipeWireAudioOutput};
use crate::drm::DrmDisplay;
use crate::status::StatusReporter;
use crate::DisplayError;

const SOURCE_DISCOVERY_TIMEOUT_MS: u32 = 5000;
const STATUS_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

struct Mapping {
    source_name: String,
    receiver: NdiReceiver,
    /// Held for its ring and thread lifetime; None when audio failed.
    _audio: Option<PipeWireAudioOutput>,
}

/// Owns the `display_id -> stream` map.
pub struct StreamManager {
    runtime: NdiRuntime,
    mappings: Mutex<BTreeMap<usize, Mapping>>,
}

impl StreamManager {
    #[must_use]
    pub fn new(runtime: NdiRuntime) -> Self {
        Self {
            runtime,
            mappings: Mutex::new(BTreeMap::new()),
        }
    }

    /// Wire `source_name` to `display_id`: receiver, display, audio and
    /// the receive thread. An existing mapping on the display is torn
    /// down first.
    pub fn map(&self, source_name: &str, display_id: usize) -> Result<(), DisplayError> {
        self.unmap(display_id);

        let finder = NdiFinder::new(self.runtime.clone())?;
        let sources = finder.wait_for_sources(SOURCE_DISCOVERY_TIMEOUT_MS);
        tracing::debug!("found {} NDI sources", sources.len());

        let mut receiver =
            NdiReceiver::connect(self.runtime.clone(), &finder, source_name)?;

        let mut display = DrmDisplay::open_card()?;
        display.open_display(display_id)?;

        let (audio, ring) = match PipeWireAudioOutput::open() {
            Ok(output) => {
                let ring = output.ring();
                (Some(output), ring)
            }
            Err(e) => {
                tracing::warn!("audio output unavailable, video only: {e}");
                (None, Arc::new(AudioRing::default()))
            }
        };

        let handler = DisplayHandler::new(
            display,
            ring,
            StatusReporter::new(display_id),
            source_name.to_string(),
        );
        receiver.start(Box::new(handler));

        self.mappings.lock().unwrap().insert(
            display_id,
            Mapping {
                source_name: source_name.to_string(),
                receiver,
                _audio: audio,
            },
        );
        tracing::info!("mapped '{source_name}' to display {display_id}");
        Ok(())
    }

    /// Tear down the mapping on `display_id`. Returns whether one
    /// existed.
    pub fn unmap(&self, display_id: usize) -> bool {
        let mapping = self.mappings.lock().unwrap().remove(&display_id);
        match mapping {
            Some(mut mapping) => {
                mapping.receiver.stop();
                tracing::info!(
                    "unmapped '{}' from display {display_id}",
                    mapping.source_name
                );
                true
            }
            None => false,
        }
    }

    /// Pair the first three discovered sources with the first three
    /// connected displays. Returns how many mappings were made.
    pub fn auto_map(&self) -> Result<usize, DisplayError> {
        let finder = NdiFinder::new(self.runtime.clone())?;
        let sources = finder.wait_for_sources(SOURCE_DISCOVERY_TIMEOUT_MS);
        if sources.is_empty() {
            tracing::warn!("no NDI sources found for auto-mapping");
            return Ok(0);
        }

        let displays = DrmDisplay::open_card()?.displays();
        let connected: Vec<usize> = displays
            .iter()
            .filter(|d| d.connected)
            .map(|d| d.id)
            .take(3)
            .collect();

        let mut mapped = 0;
        for (source, display_id) in sources.iter().take(3).zip(connected) {
            match self.map(&source.name, display_id) {
                Ok(()) => {
                    tracing::info!("auto-mapped '{}' to display {display_id}", source.name);
                    mapped += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        "auto-map of '{}' to display {display_id} failed: {e}",
                        source.name
                    );
                }
            }
        }
        Ok(mapped)
    }

    /// Current `(display_id, source_name)` pairs.
    #[must_use]
    pub fn mappings(&self) -> Vec<(usize, String)> {
        self.mappings
            .lock()
            .unwrap()
            .iter()
            .map(|(id, m)| (*id, m.source_name.clone()))
            .collect()
    }

    /// Receiver statistics for one display.
    #[must_use]
    pub fn display_stats(&self, display_id: usize) -> Option<ReceiverStats> {
        self.mappings
            .lock()
            .unwrap()
            .get(&display_id)
            .map(|m| m.receiver.stats())
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        let ids: Vec<usize> = self.mappings.lock().unwrap().keys().copied().collect();
        for id in ids {
            self.unmap(id);
        }
    }
}

/// Receive-thread handler: presents video, feeds the audio ring, keeps
/// the status file fresh.
struct DisplayHandler {
    display: DrmDisplay,
    ring: Arc<AudioRing>,
    status: StatusReporter,
    source_name: String,
    audio_scratch: Vec<i16>,
    frames: u64,
    dropped: u64,
    window_bytes: u64,
    window_start: Instant,
    fps: f32,
    size: (u32, u32),
}

impl DisplayHandler {
    fn new(
        display: DrmDisplay,
        ring: Arc<AudioRing>,
        status: StatusReporter,
        source_name: String,
    ) -> Self {
        Self {
            display,
            ring,
            status,
            source_name,
            audio_scratch: Vec::new(),
            frames: 0,
            dropped: 0,
            window_bytes: 0,
            window_start: Instant::now(),
            fps: 0.0,
            size: (0, 0),
        }
    }
}

impl ReceiveHandler for DisplayHandler {
    fn on_video(&mut self, frame: &NdiVideoFrame<'_>) {
        // BGRX_BGRA was requested; treat anything four-byte as BGRA and
        // let UYVY through for senders that ignore the preference.
        let format = if frame.fourcc == u32::from_le_bytes(*b"UYVY") {
            PixelFormat::Uyvy
        } else {
            PixelFormat::Bgra
        };

        match self.display.display_frame(
            frame.data,
            frame.width,
            frame.height,
            frame.stride,
            format,
        ) {
            Ok(()) => {
                self.frames += 1;
                self.window_bytes += frame.data.len() as u64;
            }
            Err(e) => {
                self.dropped += 1;
                if self.dropped % 60 == 1 {
                    tracing::warn!("display error: {e}");
                }
            }
        }
        self.fps = frame.fps_num as f32 / frame.fps_den.max(1) as f32;
        self.size = (frame.width, frame.height);

        let elapsed = self.window_start.elapsed();
        if elapsed >= STATUS_INTERVAL {
            let bitrate_mbps =
                self.window_bytes as f32 * 8.0 / elapsed.as_secs_f32() / 1_000_000.0;
            self.status.update(
                &self.source_name,
                self.size.0,
                self.size.1,
                self.fps,
                bitrate_mbps,
                self.frames,
                self.dropped,
            );
            self.window_bytes = 0;
            self.window_start = Instant::now();
        }
    }

    fn on_audio(&mut self, frame: &NdiAudioFrame<'_>) {
        if frame.to_interleaved_s16(&mut self.audio_scratch) {
            self.ring
                .write_interleaved(&self.audio_scratch, frame.channels() as usize);
        }
    }
}

impl Drop for DisplayHandler {
    fn drop(&mut self) {
        self.display.clear();
        self.display.close_display();
        self.status.clear();
    }
}
