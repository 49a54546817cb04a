//! Device factory used by the session: one capture source, one playback sink.

use tokio::sync::mpsc;

use super::capture::{AlsaCapture, CaptureConstraints, CaptureSource};
use super::scheduler::{NodeId, PlaybackSink};
use super::sink::AlsaSink;
use crate::config::AudioSettings;
use crate::error::{LiveError, LiveResult};

pub trait AudioBackend: Send {
    /// Acquire the input device. A failure here is `DevicePermissionDenied`.
    fn open_capture(&mut self, frame_size: usize) -> LiveResult<Box<dyn CaptureSource>>;

    /// Open the output. Finished node ids must be reported on `finished`.
    fn open_playback(
        &mut self,
        finished: mpsc::UnboundedSender<NodeId>,
    ) -> LiveResult<Box<dyn PlaybackSink>>;
}

/// ALSA devices named in the `[audio]` config section.
pub struct AlsaBackend {
    settings: AudioSettings,
}

impl AlsaBackend {
    pub fn new(settings: AudioSettings) -> Self {
        Self { settings }
    }
}

impl AudioBackend for AlsaBackend {
    fn open_capture(&mut self, frame_size: usize) -> LiveResult<Box<dyn CaptureSource>> {
        let constraints = CaptureConstraints {
            echo_cancellation: self.settings.echo_cancellation,
            noise_suppression: self.settings.noise_suppression,
            auto_gain_control: self.settings.auto_gain_control,
        };
        let source = AlsaCapture::open(&self.settings.capture_device, frame_size, constraints)?;
        Ok(Box::new(source))
    }

    fn open_playback(
        &mut self,
        finished: mpsc::UnboundedSender<NodeId>,
    ) -> LiveResult<Box<dyn PlaybackSink>> {
        let sink = AlsaSink::open(
            &self.settings.playback_device,
            self.settings.playback_period_size,
            finished,
        )
        .map_err(|e| LiveError::OutputUnavailable(format!("{:#}", e)))?;
        Ok(Box::new(sink))
    }
}
