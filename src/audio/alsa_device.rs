//! ALSA PCM device wrappers. Both directions run interleaved S16LE mono at
//! the wire rate; the hardware may negotiate a different period size.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result, bail};

use super::pcm::PCM_SAMPLE_RATE;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    pub sample_rate: u32,
    pub channels: u32,
    /// Period size in frames
    pub period_size: usize,
}

/// Open a mono 16 kHz capture device, asking for one period per block.
pub fn open_capture(device: &str, block_size: usize) -> Result<(PCM, AlsaParams)> {
    open_pcm(device, Direction::Capture, Some(block_size), "Capture")
}

/// Open a mono 16 kHz playback device.
pub fn open_playback(device: &str, period_size: Option<usize>) -> Result<(PCM, AlsaParams)> {
    open_pcm(device, Direction::Playback, period_size, "Playback")
}

fn open_pcm(
    device: &str,
    direction: Direction,
    period_size: Option<usize>,
    dir_name: &str,
) -> Result<(PCM, AlsaParams)> {
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open PCM device '{}' for {}", device, dir_name))?;

    {
        let hwp = HwParams::any(&pcm).with_context(|| "Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(1)?;
        hwp.set_rate_near(PCM_SAMPLE_RATE, ValueOr::Nearest)?;
        if let Some(ps) = period_size {
            hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
        }
        pcm.hw_params(&hwp)?;
    }

    let params = {
        let hwp = pcm.hw_params_current()?;
        AlsaParams {
            sample_rate: hwp.get_rate()?,
            channels: hwp.get_channels()?,
            period_size: hwp.get_period_size()? as usize,
        }
    };

    // No resampler in this path: anything but 16 kHz mono would play at the
    // wrong speed.
    if params.sample_rate != PCM_SAMPLE_RATE || params.channels != 1 {
        bail!(
            "Device '{}' negotiated {} Hz / {} ch, need {} Hz mono",
            device,
            params.sample_rate,
            params.channels,
            PCM_SAMPLE_RATE
        );
    }

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}",
        dir_name,
        device,
        params.sample_rate,
        params.channels,
        params.period_size,
    );

    Ok((pcm, params))
}
