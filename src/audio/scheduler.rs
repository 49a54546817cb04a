//! Gapless scheduling of inbound PCM chunks on the output clock.
//!
//! The scheduler keeps a "next start time" cursor. Every chunk starts exactly
//! where the previous one ends, so variable-size network chunks play back
//! without gaps or overlaps as long as they arrive before the cursor is
//! reached. A stop-all opens a new generation; completions from an older
//! generation are ignored.

use std::collections::HashSet;
use std::sync::Arc;

use super::pcm::{PCM_SAMPLE_RATE, PcmBuffer};

/// Identity of one scheduled node. The generation is part of the id so a
/// late completion can be recognised without any extra bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub generation: u64,
    pub seq: u64,
}

/// One buffer handed to the sink.
#[derive(Debug, Clone)]
pub struct PlaybackNode {
    pub id: NodeId,
    /// Normalized mono samples at 16 kHz.
    pub samples: Arc<[f32]>,
    /// Start time on the sink clock, in seconds.
    pub start_at: f64,
}

impl PlaybackNode {
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / PCM_SAMPLE_RATE as f64
    }

    pub fn end_at(&self) -> f64 {
        self.start_at + self.duration()
    }
}

/// A rendering sink that can play buffers at precise times.
///
/// Finished nodes are reported out of band (the sink is given a channel when
/// it is created); a stopped node may or may not be reported.
pub trait PlaybackSink: Send {
    /// Current position of the output clock, in seconds. Monotonic.
    fn current_time(&self) -> f64;
    fn schedule(&mut self, node: PlaybackNode) -> anyhow::Result<()>;
    fn stop(&mut self, id: NodeId);
}

impl<S: PlaybackSink + ?Sized> PlaybackSink for Box<S> {
    fn current_time(&self) -> f64 {
        (**self).current_time()
    }

    fn schedule(&mut self, node: PlaybackNode) -> anyhow::Result<()> {
        (**self).schedule(node)
    }

    fn stop(&mut self, id: NodeId) {
        (**self).stop(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    /// Headroom added when the cursor has fallen behind the clock.
    pub lookahead: f64,
    /// How far ahead the cursor may be and still count as "done speaking".
    pub speaking_tail: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lookahead: 0.05,
            speaking_tail: 0.1,
        }
    }
}

/// Where a chunk ended up on the clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scheduled {
    pub id: NodeId,
    pub start_at: f64,
    pub duration: f64,
}

pub struct PlaybackScheduler<S: PlaybackSink> {
    sink: S,
    config: SchedulerConfig,
    cursor: f64,
    generation: u64,
    next_seq: u64,
    active: HashSet<NodeId>,
    speaking: bool,
}

impl<S: PlaybackSink> PlaybackScheduler<S> {
    pub fn new(sink: S, config: SchedulerConfig) -> Self {
        let cursor = sink.current_time();
        Self {
            sink,
            config,
            cursor,
            generation: 0,
            next_seq: 0,
            active: HashSet::new(),
            speaking: false,
        }
    }

    /// Queue one decoded chunk right after the previous one.
    ///
    /// Returns `None` for an empty buffer or when the sink refused the node.
    pub fn enqueue(&mut self, pcm: &PcmBuffer) -> Option<Scheduled> {
        if pcm.is_empty() {
            log::debug!("Skipping empty PCM chunk");
            return None;
        }

        let now = self.sink.current_time();
        if self.cursor < now {
            self.cursor = now + self.config.lookahead;
        }

        let id = NodeId {
            generation: self.generation,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        let node = PlaybackNode {
            id,
            samples: pcm.to_f32().into(),
            start_at: self.cursor,
        };
        let duration = node.duration();
        let start_at = node.start_at;

        if let Err(e) = self.sink.schedule(node) {
            log::error!("Failed to schedule playback node: {}", e);
            return None;
        }

        self.cursor += duration;
        self.active.insert(id);
        self.speaking = true;

        Some(Scheduled {
            id,
            start_at,
            duration,
        })
    }

    /// Completion notification from the sink.
    pub fn node_finished(&mut self, id: NodeId) {
        if id.generation != self.generation {
            log::debug!("Ignoring stale completion {:?}", id);
            return;
        }
        self.active.remove(&id);

        let now = self.sink.current_time();
        if self.active.is_empty() && self.cursor <= now + self.config.speaking_tail {
            self.speaking = false;
        }
    }

    /// Flush everything immediately. Safe to call at any time.
    pub fn stop_all(&mut self) {
        for id in self.active.drain() {
            self.sink.stop(id);
        }
        self.cursor = self.sink.current_time();
        self.generation += 1;
        self.speaking = false;
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}
