//! audio - capture, sample conversion and scheduled playback
//!
//! Real-time device I/O runs on dedicated OS threads (ALSA), everything else
//! is plain data handed across channels.

mod alsa_device;
pub mod backend;
pub mod capture;
pub mod pcm;
pub mod scheduler;
pub mod sink;

pub use backend::{AlsaBackend, AudioBackend};
pub use capture::{CaptureEvent, CapturePipeline, CaptureSource, VolumeMeter};
pub use pcm::{PCM_MIME_TYPE, PCM_SAMPLE_RATE, PcmBuffer};
pub use scheduler::{NodeId, PlaybackNode, PlaybackScheduler, PlaybackSink, SchedulerConfig};
