//! ALSA implementation of [`PlaybackSink`].
//!
//! A playback thread renders a timeline: every period it mixes whatever
//! scheduled nodes overlap the period (silence otherwise), writes it to the
//! device and advances a frame counter. That counter is the output clock, so
//! "start at t" means "start at frame t * 16000".

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use alsa::pcm::PCM;
use anyhow::Result;
use tokio::sync::mpsc;

use super::alsa_device;
use super::pcm::{PCM_SAMPLE_RATE, to_pcm16};
use super::scheduler::{NodeId, PlaybackNode, PlaybackSink};

/// A node placed on the frame timeline.
struct TimelineNode {
    id: NodeId,
    start_frame: u64,
    samples: Arc<[f32]>,
}

impl TimelineNode {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// State shared between the scheduler side and the render thread.
#[derive(Default)]
pub struct Timeline {
    nodes: Mutex<Vec<TimelineNode>>,
    frames_rendered: AtomicU64,
}

impl Timeline {
    pub fn current_time(&self) -> f64 {
        self.frames_rendered.load(Ordering::Acquire) as f64 / PCM_SAMPLE_RATE as f64
    }

    fn insert(&self, node: PlaybackNode) {
        let requested = (node.start_at * PCM_SAMPLE_RATE as f64).round().max(0.0) as u64;
        if let Ok(mut nodes) = self.nodes.lock() {
            // Frames before the clock are already mixed; a node aimed there
            // would lose its head.
            let rendered = self.frames_rendered.load(Ordering::Acquire);
            if requested < rendered {
                log::debug!(
                    "Node {:?} arrived {} frames late, starting at the next period",
                    node.id,
                    rendered - requested
                );
            }
            nodes.push(TimelineNode {
                id: node.id,
                start_frame: requested.max(rendered),
                samples: node.samples,
            });
        }
    }

    fn remove(&self, id: NodeId) {
        if let Ok(mut nodes) = self.nodes.lock() {
            nodes.retain(|n| n.id != id);
        }
    }

    /// Mix one period starting at the current clock into `out` and advance
    /// the clock. Returns the nodes that finished inside this period.
    pub fn render(&self, out: &mut [f32]) -> Vec<NodeId> {
        out.fill(0.0);
        let period_start = self.frames_rendered.load(Ordering::Acquire);
        let period_end = period_start + out.len() as u64;
        let mut finished = Vec::new();

        let Ok(mut nodes) = self.nodes.lock() else {
            self.frames_rendered.store(period_end, Ordering::Release);
            return finished;
        };
        for node in nodes.iter() {
            let from = node.start_frame.max(period_start);
            let to = node.end_frame().min(period_end);
            if from >= to {
                continue;
            }
            let src = (from - node.start_frame) as usize;
            let dst = (from - period_start) as usize;
            let len = (to - from) as usize;
            for (o, s) in out[dst..dst + len]
                .iter_mut()
                .zip(&node.samples[src..src + len])
            {
                *o += *s;
            }
        }
        nodes.retain(|n| {
            if n.end_frame() <= period_end {
                finished.push(n.id);
                false
            } else {
                true
            }
        });

        // Advanced while still holding the lock so insert() never sees a
        // clock older than what has been mixed.
        self.frames_rendered.store(period_end, Ordering::Release);
        finished
    }
}

pub struct AlsaSink {
    timeline: Arc<Timeline>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AlsaSink {
    /// Open the output device and start the render thread. Finished node ids
    /// are reported on `finished`.
    pub fn open(
        device: &str,
        period_size: usize,
        finished: mpsc::UnboundedSender<NodeId>,
    ) -> Result<Self> {
        let period_opt = if period_size > 0 { Some(period_size) } else { None };
        let (pcm, params) = alsa_device::open_playback(device, period_opt)?;

        let timeline = Arc::new(Timeline::default());
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let timeline = timeline.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("audio-play".into())
                .spawn(move || {
                    if let Err(e) =
                        render_thread(pcm, params.period_size, &timeline, &finished, &running)
                    {
                        log::error!("Playback thread error: {}", e);
                    }
                })?
        };

        Ok(Self {
            timeline,
            running,
            handle: Some(handle),
        })
    }
}

impl PlaybackSink for AlsaSink {
    fn current_time(&self) -> f64 {
        self.timeline.current_time()
    }

    fn schedule(&mut self, node: PlaybackNode) -> Result<()> {
        if !self.running.load(Ordering::Relaxed) {
            anyhow::bail!("playback thread is not running");
        }
        self.timeline.insert(node);
        Ok(())
    }

    fn stop(&mut self, id: NodeId) {
        self.timeline.remove(id);
    }
}

impl Drop for AlsaSink {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn render_thread(
    pcm: PCM,
    period_size: usize,
    timeline: &Timeline,
    finished: &mpsc::UnboundedSender<NodeId>,
    running: &AtomicBool,
) -> Result<()> {
    let io = pcm.io_i16()?;
    let mut mix = vec![0f32; period_size];

    log::info!("Playback started: period={}", period_size);

    while running.load(Ordering::Relaxed) {
        for id in timeline.render(&mut mix) {
            let _ = finished.send(id);
        }
        // Summed nodes may exceed full scale; to_pcm16 clamps.
        let pcm_data = to_pcm16(&mix);

        let mut written = 0;
        let mut retry_count = 0u32;
        while written < pcm_data.len() {
            match io.writei(&pcm_data[written..]) {
                Ok(n) => {
                    written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    if let Err(e2) = pcm.prepare() {
                        log::error!("Failed to recover PCM playback: {}", e2);
                        break;
                    }
                    if retry_count >= 3 {
                        log::error!(
                            "Max recovery retries reached. Dropping {} unwritten frames",
                            pcm_data.len() - written
                        );
                        break;
                    }
                }
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    log::info!("Playback stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(seq: u64, start_at: f64, len: usize, value: f32) -> PlaybackNode {
        PlaybackNode {
            id: NodeId { generation: 0, seq },
            samples: vec![value; len].into(),
            start_at,
        }
    }

    #[test]
    fn clock_advances_one_period_per_render() {
        let timeline = Timeline::default();
        let mut out = vec![0f32; 160];
        timeline.render(&mut out);
        timeline.render(&mut out);
        assert!((timeline.current_time() - 0.02).abs() < 1e-9);
    }

    #[test]
    fn back_to_back_nodes_render_without_gap() {
        let timeline = Timeline::default();
        // 0.0..0.01 at 0.25, 0.01..0.02 at 0.5, in one 320-frame period.
        timeline.insert(node(0, 0.0, 160, 0.25));
        timeline.insert(node(1, 0.01, 160, 0.5));

        let mut out = vec![0f32; 320];
        let finished = timeline.render(&mut out);
        assert!(out[..160].iter().all(|&s| s == 0.25));
        assert!(out[160..].iter().all(|&s| s == 0.5));
        assert_eq!(finished.len(), 2);
    }

    #[test]
    fn node_spanning_periods_finishes_in_last_one() {
        let timeline = Timeline::default();
        timeline.insert(node(0, 0.005, 200, 0.1));

        let mut out = vec![0f32; 160];
        assert!(timeline.render(&mut out).is_empty());
        assert!(out[..80].iter().all(|&s| s == 0.0));
        assert!(out[80..].iter().all(|&s| s == 0.1));

        let finished = timeline.render(&mut out);
        assert_eq!(finished, vec![NodeId { generation: 0, seq: 0 }]);
        assert!(out[..120].iter().all(|&s| s == 0.1));
        assert!(out[120..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn late_node_is_moved_to_the_next_period_intact() {
        let timeline = Timeline::default();
        let mut out = vec![0f32; 160];
        timeline.render(&mut out);

        // Aimed at frame 0, which has already been mixed.
        timeline.insert(node(3, 0.0, 100, 0.3));
        let finished = timeline.render(&mut out);
        assert!(out[..100].iter().all(|&s| s == 0.3));
        assert!(out[100..].iter().all(|&s| s == 0.0));
        assert_eq!(finished, vec![NodeId { generation: 0, seq: 3 }]);
    }

    #[test]
    fn removed_node_is_silent_and_not_reported() {
        let timeline = Timeline::default();
        timeline.insert(node(7, 0.0, 100, 0.3));
        timeline.remove(NodeId { generation: 0, seq: 7 });

        let mut out = vec![0f32; 160];
        assert!(timeline.render(&mut out).is_empty());
        assert!(out.iter().all(|&s| s == 0.0));
    }
}
