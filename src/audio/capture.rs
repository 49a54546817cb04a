//! Microphone capture on a dedicated OS thread.
//!
//! device → accumulate fixed-size frames → RMS meter → (unless muted)
//! PCM16 → base64 → `CaptureEvent::Chunk`
//!
//! The thread never blocks on the consumer: events go through an unbounded
//! channel and the volume is a single last-write-wins atomic.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::{self, JoinHandle};

use alsa::pcm::PCM;
use anyhow::Result;
use tokio::sync::mpsc;

use super::alsa_device;
use super::pcm::{self, PCM_SAMPLE_RATE, PcmBuffer};
use crate::error::{LiveError, LiveResult};
use crate::protocol::MediaChunk;

/// Source of normalized mono samples at 16 kHz.
pub trait CaptureSource: Send {
    /// Block until some samples are available and write them to the front of
    /// `buf`. `Ok(0)` means nothing arrived yet; an error ends the capture.
    fn read(&mut self, buf: &mut [f32]) -> Result<usize>;
}

/// Processing the device or driver is asked to apply before samples reach us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Current microphone level, shared with whoever draws the meter.
#[derive(Debug, Default)]
pub struct VolumeMeter {
    bits: AtomicU32,
}

impl VolumeMeter {
    pub fn set(&self, level: f32) {
        self.bits.store(level.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// One encoded frame, in capture order.
    Chunk(MediaChunk),
    /// The device stopped delivering samples. The pipeline is finished.
    Failed(String),
}

// ======================== ALSA source ========================

pub struct AlsaCapture {
    pcm: PCM,
    scratch: Vec<i16>,
}

impl AlsaCapture {
    /// Acquire the input device. Any failure here means we do not get the
    /// microphone at all.
    pub fn open(
        device: &str,
        block_size: usize,
        constraints: CaptureConstraints,
    ) -> LiveResult<Self> {
        let (pcm, params) = alsa_device::open_capture(device, block_size)
            .map_err(|e| LiveError::DevicePermissionDenied(format!("{:#}", e)))?;

        // ALSA has no generic knob for these; a processing source such as a
        // PulseAudio/PipeWire "echo-cancel" device provides them.
        log::info!(
            "Capture on '{}' requests aec={}, ns={}, agc={} from the device",
            device,
            constraints.echo_cancellation,
            constraints.noise_suppression,
            constraints.auto_gain_control,
        );

        Ok(Self {
            pcm,
            scratch: vec![0i16; params.period_size.max(block_size)],
        })
    }
}

impl CaptureSource for AlsaCapture {
    fn read(&mut self, buf: &mut [f32]) -> Result<usize> {
        let want = buf.len().min(self.scratch.len());
        let io = self.pcm.io_i16()?;
        match io.readi(&mut self.scratch[..want]) {
            Ok(frames) => {
                for (dst, &src) in buf.iter_mut().zip(&self.scratch[..frames]) {
                    *dst = src as f32 / 32768.0;
                }
                Ok(frames)
            }
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                self.pcm.prepare()?;
                Ok(0)
            }
        }
    }
}

// ======================== Pipeline ========================

/// Frame size in samples for a frame duration in milliseconds.
pub fn frame_samples(frame_duration_ms: u32) -> usize {
    (PCM_SAMPLE_RATE as u64 * frame_duration_ms as u64 / 1000) as usize
}

/// Per-frame work of the capture thread. Kept separate from the thread loop
/// so it can be driven directly.
pub struct FrameProcessor {
    muted: Arc<AtomicBool>,
    meter: Arc<VolumeMeter>,
    tx: mpsc::UnboundedSender<CaptureEvent>,
}

impl FrameProcessor {
    pub fn new(
        muted: Arc<AtomicBool>,
        meter: Arc<VolumeMeter>,
        tx: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Self {
        Self { muted, meter, tx }
    }

    /// Returns `false` once nobody is listening any more.
    pub fn process(&self, frame: &[f32]) -> bool {
        self.meter.set(pcm::rms(frame));

        if self.muted.load(Ordering::Relaxed) {
            return !self.tx.is_closed();
        }

        let data = PcmBuffer::from_frame(frame).to_base64();
        self.tx.send(CaptureEvent::Chunk(MediaChunk::pcm(data))).is_ok()
    }
}

/// The capture thread and its lifecycle.
pub struct CapturePipeline {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CapturePipeline {
    pub fn start(
        mut source: Box<dyn CaptureSource>,
        frame_size: usize,
        processor: FrameProcessor,
    ) -> Result<Self> {
        if frame_size == 0 {
            anyhow::bail!("capture frame size must be at least one sample");
        }
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let running = running.clone();
            thread::Builder::new()
                .name("audio-capture".into())
                .spawn(move || {
                    capture_loop(source.as_mut(), frame_size, &processor, &running);
                })?
        };

        log::info!("Capture started: frame_size={}", frame_size);
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop the thread and release the device. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
            log::info!("Capture stopped");
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    source: &mut dyn CaptureSource,
    frame_size: usize,
    processor: &FrameProcessor,
    running: &AtomicBool,
) {
    let mut read_buf = vec![0f32; frame_size];
    let mut accum: Vec<f32> = Vec::with_capacity(frame_size * 2);

    while running.load(Ordering::Relaxed) {
        let n = match source.read(&mut read_buf) {
            Ok(n) => n,
            Err(e) => {
                log::error!("Capture failed: {:#}", e);
                let _ = processor.tx.send(CaptureEvent::Failed(e.to_string()));
                break;
            }
        };
        accum.extend_from_slice(&read_buf[..n]);

        while accum.len() >= frame_size {
            if !processor.process(&accum[..frame_size]) {
                log::warn!("Capture consumer dropped, stopping");
                running.store(false, Ordering::SeqCst);
                return;
            }
            accum.drain(..frame_size);
        }
    }
    running.store(false, Ordering::SeqCst);
}
