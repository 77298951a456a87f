//! Audio path: NDI audio frames into a stereo ring, drained by the
//! PipeWire realtime callback.
//!
//! The ring decouples the receive thread's variable-size bursts from the
//! fixed 256-frame quantum on the playback side. The writer advances the
//! read position on collision, so a stalled sink drops the oldest audio
//! instead of backing up the receive thread.

use std::sync::Mutex;

/// 100 ms of interleaved stereo S16 at 48 kHz.
const RING_SAMPLES: usize = 48_000 * 2 / 10;
pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: u32 = 2;
/// Frames per realtime process callback.
pub const QUANTUM: u32 = 256;

struct RingInner {
    buffer: Vec<i16>,
    write: usize,
    read: usize,
}

/// Mutex-guarded stereo sample ring with exactly two accessors: the NDI
/// receive thread writes, the realtime callback reads.
pub struct AudioRing {
    inner: Mutex<RingInner>,
}

impl Default for AudioRing {
    fn default() -> Self {
        Self {
            inner: Mutex::new(RingInner {
                buffer: vec![0; RING_SAMPLES],
                write: 0,
                read: 0,
            }),
        }
    }
}

impl AudioRing {
    /// Downmix `samples` (interleaved, `channels` wide) to stereo and
    /// append. Mono duplicates, anything above two channels keeps the
    /// first pair. Oldest audio is overwritten when the ring is full.
    pub fn write_interleaved(&self, samples: &[i16], channels: usize) {
        if channels == 0 {
            return;
        }
        let frames = samples.len() / channels;
        let mut inner = self.inner.lock().unwrap();
        for frame in 0..frames {
            let (left, right) = match channels {
                1 => (samples[frame], samples[frame]),
                _ => (samples[frame * channels], samples[frame * channels + 1]),
            };
            inner.push(left);
            inner.push(right);
        }
    }

    /// Drain exactly `out.len()` samples, zero-filling on under-run.
    pub fn read_exact(&self, out: &mut [i16]) {
        let mut inner = self.inner.lock().unwrap();
        let available = inner.available();
        let take = available.min(out.len());
        for slot in out.iter_mut().take(take) {
            let sample = inner.buffer[inner.read];
            inner.read = (inner.read + 1) % inner.buffer.len();
            *slot = sample;
        }
        out[take..].fill(0);
    }

    #[cfg(test)]
    fn available(&self) -> usize {
        self.inner.lock().unwrap().available()
    }
}

impl RingInner {
    fn push(&mut self, sample: i16) {
        let len = self.buffer.len();
        let write = self.write;
        self.buffer[write] = sample;
        self.write = (write + 1) % len;
        if self.write == self.read {
            // Collision: drop the oldest sample.
            self.read = (self.read + 1) % len;
        }
    }

    fn available(&self) -> usize {
        let len = self.buffer.len();
        (self.write + len - self.read) % len
    }
}

#[cfg(target_os = "linux")]
pub use pw_output::PipeWireAudioOutput;

#[cfg(target_os = "linux")]
mod pw_output {
    use super::{AudioRing, CHANNELS, QUANTUM, SAMPLE_RATE};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use pipewire as pw;
    use pw::properties::properties;
    use pw::stream::{Stream, StreamFlags};

    use crate::DisplayError;

    /// PipeWire playback stream feeding HDMI audio from an [`AudioRing`].
    ///
    /// The server routes the stream; with role Movie and autoconnect it
    /// lands on the default (HDMI) sink.
    pub struct PipeWireAudioOutput {
        ring: Arc<AudioRing>,
        running: Arc<AtomicBool>,
        thread: Option<std::thread::JoinHandle<()>>,
    }

    impl PipeWireAudioOutput {
        /// Open the playback stream on a dedicated PipeWire loop thread.
        pub fn open() -> Result<Self, DisplayError> {
            let ring = Arc::new(AudioRing::default());
            let running = Arc::new(AtomicBool::new(true));

            let thread_ring = Arc::clone(&ring);
            let thread_running = Arc::clone(&running);
            let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), String>>();
            let thread = std::thread::Builder::new()
                .name("pw-audio-out".into())
                .spawn(move || {
                    if let Err(e) = run_playback_loop(&thread_ring, &thread_running, &ready_tx) {
                        tracing::error!("PipeWire playback thread exited with error: {e}");
                    }
                })
                .map_err(|e| DisplayError::Audio(format!("spawn failed: {e}")))?;

            match ready_rx.recv() {
                Ok(Ok(())) => Ok(Self {
                    ring,
                    running,
                    thread: Some(thread),
                }),
                Ok(Err(message)) => {
                    let _ = thread.join();
                    Err(DisplayError::Audio(message))
                }
                Err(_) => {
                    let _ = thread.join();
                    Err(DisplayError::Audio("playback thread died during setup".into()))
                }
            }
        }

        /// The ring the NDI audio callback writes into.
        #[must_use]
        pub fn ring(&self) -> Arc<AudioRing> {
            Arc::clone(&self.ring)
        }

        pub fn close(&mut self) {
            self.running.store(false, Ordering::SeqCst);
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

    impl Drop for PipeWireAudioOutput {
        fn drop(&mut self) {
            self.close();
        }
    }

    fn run_playback_loop(
        ring: &Arc<AudioRing>,
        running: &Arc<AtomicBool>,
        ready: &std::sync::mpsc::Sender<Result<(), String>>,
    ) -> Result<(), pw::Error> {
        pw::init();

        let mainloop = match pw::main_loop::MainLoop::new(None) {
            Ok(l) => l,
            Err(e) => {
                let _ = ready.send(Err(format!("MainLoop: {e}")));
                return Err(e);
            }
        };
        let context = match pw::context::Context::new(&mainloop) {
            Ok(c) => c,
            Err(e) => {
                let _ = ready.send(Err(format!("Context: {e}")));
                return Err(e);
            }
        };
        let core = match context.connect(None) {
            Ok(c) => c,
            Err(e) => {
                let _ = ready.send(Err(format!("connect: {e}")));
                return Err(e);
            }
        };

        let stream = match Stream::new(
            &core,
            "ndi-display",
            properties! {
                *pw::keys::MEDIA_TYPE => "Audio",
                *pw::keys::MEDIA_CATEGORY => "Playback",
                *pw::keys::MEDIA_ROLE => "Movie",
                *pw::keys::NODE_NAME => "ndi-display",
                *pw::keys::NODE_LATENCY => "256/48000",
                *pw::keys::NODE_AUTOCONNECT => "true",
                *pw::keys::STREAM_DONT_REMIX => "true",
            },
        ) {
            Ok(s) => s,
            Err(e) => {
                let _ = ready.send(Err(format!("Stream: {e}")));
                return Err(e);
            }
        };

        let process_ring = Arc::clone(ring);
        let _listener = stream
            .add_local_listener_with_user_data(process_ring)
            .state_changed(|_stream, _ring, old, new| {
                tracing::debug!("PipeWire playback state: {old:?} -> {new:?}");
            })
            .process(|stream_ref, ring| process_quantum(stream_ref, ring))
            .register()?;

        let mut audio_info = pw::spa::param::audio::AudioInfoRaw::new();
        audio_info.set_format(pw::spa::param::audio::AudioFormat::S16LE);
        audio_info.set_rate(SAMPLE_RATE);
        audio_info.set_channels(CHANNELS);

        let values: Vec<u8> = pw::spa::pod::serialize::PodSerializer::serialize(
            std::io::Cursor::new(Vec::new()),
            &pw::spa::pod::Value::Object(pw::spa::pod::Object {
                type_: pw::spa::utils::SpaTypes::ObjectParamFormat.as_raw(),
                id: pw::spa::param::ParamType::EnumFormat.as_raw(),
                properties: audio_info.into(),
            }),
        )
        .map_err(|_| pw::Error::CreationFailed)?
        .0
        .into_inner();
        let mut params = [pw::spa::pod::Pod::from_bytes(&values).expect("valid pod")];

        if let Err(e) = stream.connect(
            pw::spa::utils::Direction::Output,
            None,
            StreamFlags::AUTOCONNECT | StreamFlags::MAP_BUFFERS | StreamFlags::RT_PROCESS,
            &mut params,
        ) {
            let _ = ready.send(Err(format!("stream connect: {e}")));
            return Err(e);
        }

        tracing::info!(
            "PipeWire playback connected ({SAMPLE_RATE} Hz, {CHANNELS}ch, quantum {QUANTUM})"
        );
        let _ = ready.send(Ok(()));

        while running.load(Ordering::SeqCst) {
            mainloop.loop_().iterate(std::time::Duration::from_millis(50));
        }

        tracing::info!("PipeWire playback loop exiting");
        Ok(())
    }

    /// Realtime process callback: drain one quantum from the ring.
    fn process_quantum(stream: &pw::stream::StreamRef, ring: &mut Arc<AudioRing>) {
        let Some(mut buffer) = stream.dequeue_buffer() else {
            return;
        };
        let requested = buffer.requested() as usize;

        let datas = buffer.datas_mut();
        if datas.is_empty() {
            return;
        }
        let data = &mut datas[0];
        let stride = CHANNELS as usize * std::mem::size_of::<i16>();

        let n_frames = {
            let Some(slice) = data.data() else { return };
            let max_frames = slice.len() / stride;
            let n_frames = if requested > 0 {
                requested.min(max_frames)
            } else {
                (QUANTUM as usize).min(max_frames)
            };

            let mut samples = vec![0i16; n_frames * CHANNELS as usize];
            ring.read_exact(&mut samples);
            for (dst, src) in slice
                .chunks_exact_mut(2)
                .zip(samples.iter())
            {
                dst.copy_from_slice(&src.to_le_bytes());
            }
            n_frames
        };

        let chunk = data.chunk_mut();
        *chunk.offset_mut() = 0;
        *chunk.stride_mut() = stride as i32;
        *chunk.size_mut() = (n_frames * stride) as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stereo_passthrough() {
        let ring = AudioRing::default();
        ring.write_interleaved(&[1, 2, 3, 4], 2);
        let mut out = [0i16; 4];
        ring.read_exact(&mut out);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn mono_duplicates() {
        let ring = AudioRing::default();
        ring.write_interleaved(&[7, 9], 1);
        let mut out = [0i16; 4];
        ring.read_exact(&mut out);
        assert_eq!(out, [7, 7, 9, 9]);
    }

    #[test]
    fn surround_keeps_front_pair() {
        let ring = AudioRing::default();
        // One 6-channel frame: FL FR C LFE RL RR.
        ring.write_interleaved(&[10, 20, 30, 40, 50, 60], 6);
        let mut out = [0i16; 2];
        ring.read_exact(&mut out);
        assert_eq!(out, [10, 20]);
    }

    #[test]
    fn underrun_zero_fills() {
        let ring = AudioRing::default();
        ring.write_interleaved(&[5, 6], 2);
        let mut out = [99i16; 6];
        ring.read_exact(&mut out);
        assert_eq!(out, [5, 6, 0, 0, 0, 0]);
    }

    #[test]
    fn overflow_drops_oldest() {
        let ring = AudioRing::default();
        let burst: Vec<i16> = (0..RING_SAMPLES as i16 + 10).collect();
        ring.write_interleaved(&burst, 1);
        // The ring can hold one less than its size; everything older fell out.
        assert_eq!(ring.available(), RING_SAMPLES - 1);
        let mut out = [0i16; 2];
        ring.read_exact(&mut out);
        // Mono duplication doubled every sample; the survivors are the
        // newest ones, still in order.
        assert_eq!(out[0], out[1]);
    }
}
