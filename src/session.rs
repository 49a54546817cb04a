//! Session controller: wires capture, transport and playback together and
//! publishes a read-only status for the caller.
//!
//! Capture thread, socket task and playback thread each push events into
//! their own channel; a single controller task consumes them, so the
//! scheduler and the transport handle are only ever touched from one place.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::backend::AudioBackend;
use crate::audio::capture::{
    CaptureEvent, CapturePipeline, FrameProcessor, VolumeMeter, frame_samples,
};
use crate::audio::scheduler::{NodeId, PlaybackScheduler, PlaybackSink};
use crate::config::{Config, redact_endpoint};
use crate::error::LiveError;
use crate::net_link::{ConnectionState, NORMAL_CLOSURE, NetEvent, Transport};
use crate::protocol::{ClientMessage, SetupParams};

pub const LABEL_INITIALIZING: &str = "Initializing...";
pub const LABEL_WAITING_MIC: &str = "Waiting for microphone...";
pub const LABEL_MIC_DENIED: &str = "Microphone permission denied";
pub const LABEL_CONNECTING: &str = "Connecting...";
pub const LABEL_ONLINE: &str = "System online";
pub const LABEL_CONNECTION_ERROR: &str = "Connection error";
pub const LABEL_FINISHED: &str = "Finished";

/// Label for a closed socket: `Finished` on a clean close, `Error <code>`
/// otherwise.
pub fn close_label(code: u16) -> String {
    if code == NORMAL_CLOSURE {
        LABEL_FINISHED.to_string()
    } else {
        format!("Error {}", code)
    }
}

/// What the caller sees. Only the session writes it.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub is_speaking: bool,
    /// RMS of the latest captured frame, 0.0..=1.0
    pub volume: f32,
    pub is_muted: bool,
    pub is_connected: bool,
    pub connection_label: String,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            is_speaking: false,
            volume: 0.0,
            is_muted: false,
            is_connected: false,
            connection_label: LABEL_INITIALIZING.to_string(),
        }
    }
}

enum SessionCommand {
    Close(oneshot::Sender<()>),
}

/// Caller-side handle of one live session.
pub struct SessionHandle {
    id: Uuid,
    endpoint: String,
    status: Arc<watch::Sender<SessionStatus>>,
    meter: Arc<VolumeMeter>,
    muted: Arc<AtomicBool>,
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    task: Option<JoinHandle<()>>,
}

/// Start a session: microphone first (so metering works before the socket is
/// up), then the output device, then the socket. Never fails; anything that
/// does not come up is reflected in the status instead.
///
/// Must be called from within a tokio runtime.
pub fn open<B>(
    config: &Config,
    mut backend: B,
    system_instruction: &str,
    token: Option<&str>,
) -> SessionHandle
where
    B: AudioBackend + 'static,
{
    let id = Uuid::new_v4();
    let (status_tx, _) = watch::channel(SessionStatus::default());
    let status = Arc::new(status_tx);
    let meter = Arc::new(VolumeMeter::default());
    let muted = Arc::new(AtomicBool::new(false));

    let (cmd_tx, rx_cmd) = mpsc::unbounded_channel();
    let (capture_tx, rx_capture) = mpsc::unbounded_channel();
    let (played_tx, rx_played) = mpsc::unbounded_channel();
    let (net_tx, rx_net) = mpsc::unbounded_channel();

    log::info!("Session {} starting", id);

    // 1. Microphone
    status.send_modify(|s| s.connection_label = LABEL_WAITING_MIC.to_string());
    let frame_size = frame_samples(config.audio.frame_duration_ms);
    let processor = FrameProcessor::new(muted.clone(), meter.clone(), capture_tx);
    let capture = match backend.open_capture(frame_size) {
        Ok(source) => match CapturePipeline::start(source, frame_size, processor) {
            Ok(pipeline) => Some(pipeline),
            Err(e) => {
                log::error!("Failed to start capture thread: {:#}", e);
                None
            }
        },
        Err(e) => {
            log::warn!("{}", e);
            None
        }
    };
    let mic_available = capture.is_some();
    if !mic_available {
        status.send_modify(|s| s.connection_label = LABEL_MIC_DENIED.to_string());
    }

    // 2. Speaker
    let scheduler = match backend.open_playback(played_tx) {
        Ok(sink) => Some(PlaybackScheduler::new(sink, config.scheduler())),
        Err(e) => {
            log::error!("{}", e);
            None
        }
    };

    // 3. Socket
    let setup = SetupParams::new(
        &config.session.model,
        &config.session.voice_name,
        system_instruction,
    );
    let (transport, endpoint) = match config.endpoint(token) {
        Ok(endpoint) => {
            let transport = Transport::open(endpoint.clone(), setup, net_tx);
            (Some(transport), redact_endpoint(&endpoint))
        }
        Err(e) => {
            log::error!("{}", e);
            (None, String::new())
        }
    };

    let mut controller = SessionController {
        id,
        transport,
        scheduler,
        capture,
        status: status.clone(),
        muted: muted.clone(),
        mic_available,
        base_label: String::new(),
    };
    controller.set_label(if controller.transport.is_some() {
        LABEL_CONNECTING
    } else {
        LABEL_CONNECTION_ERROR
    });

    let task = tokio::spawn(controller.run(rx_cmd, rx_net, rx_capture, rx_played));

    SessionHandle {
        id,
        endpoint,
        status,
        meter,
        muted,
        cmd_tx,
        task: Some(task),
    }
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The dialed endpoint with the token hidden, for display.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Snapshot of the current status, including the latest volume.
    pub fn status(&self) -> SessionStatus {
        let mut snapshot = self.status.borrow().clone();
        snapshot.volume = self.meter.get();
        snapshot.is_muted = self.muted.load(Ordering::Relaxed);
        snapshot
    }

    /// Change notifications for everything but `volume`, which moves on every
    /// captured frame and is only available through [`status`](Self::status).
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Gate outbound audio. Capture and metering keep running.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
        self.status.send_modify(|s| s.is_muted = muted);
        log::info!("Microphone {}", if muted { "muted" } else { "unmuted" });
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Flush playback, close the socket, release the microphone. Idempotent.
    pub async fn close(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.cmd_tx.send(SessionCommand::Close(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        if let Err(e) = task.await {
            log::error!("Session task ended abnormally: {}", e);
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            // The controller tears everything down once the command channel
            // closes.
            log::debug!("Session {} dropped without close()", self.id);
        }
    }
}

// ======================== Controller task ========================

struct SessionController {
    id: Uuid,
    transport: Option<Transport>,
    scheduler: Option<PlaybackScheduler<Box<dyn PlaybackSink>>>,
    capture: Option<CapturePipeline>,
    status: Arc<watch::Sender<SessionStatus>>,
    muted: Arc<AtomicBool>,
    mic_available: bool,
    /// Connection part of the label, before any degradation note.
    base_label: String,
}

impl SessionController {
    async fn run(
        mut self,
        mut rx_cmd: mpsc::UnboundedReceiver<SessionCommand>,
        mut rx_net: mpsc::UnboundedReceiver<NetEvent>,
        mut rx_capture: mpsc::UnboundedReceiver<CaptureEvent>,
        mut rx_played: mpsc::UnboundedReceiver<NodeId>,
    ) {
        loop {
            tokio::select! {
                biased;

                cmd = rx_cmd.recv() => {
                    let ack = match cmd {
                        Some(SessionCommand::Close(ack)) => Some(ack),
                        None => None,
                    };
                    self.shutdown().await;
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    return;
                }
                Some(id) = rx_played.recv() => self.handle_node_finished(id),
                Some(event) = rx_net.recv() => self.handle_net_event(event),
                Some(event) = rx_capture.recv() => self.handle_capture_event(event),
            }
        }
    }

    fn handle_net_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Connected => {
                log::info!("Session {} online", self.id);
                self.status.send_modify(|s| s.is_connected = true);
                self.set_label(LABEL_ONLINE);
            }
            NetEvent::Audio(pcm) => {
                let Some(scheduler) = self.scheduler.as_mut() else {
                    log::debug!("No audio output, dropping {} samples", pcm.len());
                    return;
                };
                if let Some(s) = scheduler.enqueue(&pcm) {
                    log::debug!("Scheduled {:?} at {:.3}s for {:.3}s", s.id, s.start_at, s.duration);
                }
                self.publish_speaking();
            }
            NetEvent::Interrupted => {
                log::info!("Server interrupted playback");
                if let Some(scheduler) = self.scheduler.as_mut() {
                    scheduler.stop_all();
                }
                self.publish_speaking();
            }
            NetEvent::Failed(reason) => {
                log::warn!("Session {} connection failed: {}", self.id, reason);
                self.status.send_modify(|s| s.is_connected = false);
                self.set_label(LABEL_CONNECTION_ERROR);
            }
            NetEvent::Closed { code, reason } => {
                log::info!("Session {} closed: {} {}", self.id, code, reason);
                self.status.send_modify(|s| s.is_connected = false);
                self.set_label(&close_label(code));
            }
        }
    }

    fn handle_capture_event(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Chunk(chunk) => {
                // Frames already queued when mute was switched on.
                if self.muted.load(Ordering::Relaxed) {
                    return;
                }
                if let Some(transport) = &self.transport {
                    // No-op unless the socket is open.
                    transport.send(&ClientMessage::audio_chunk(chunk));
                }
            }
            CaptureEvent::Failed(reason) => {
                log::warn!("{}", LiveError::DevicePermissionDenied(reason));
                self.mic_available = false;
                if let Some(mut capture) = self.capture.take() {
                    // Joining the thread blocks.
                    tokio::task::spawn_blocking(move || capture.stop());
                }
                let base = self.base_label.clone();
                self.set_label(&base);
            }
        }
    }

    fn handle_node_finished(&mut self, id: NodeId) {
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.node_finished(id);
        }
        self.publish_speaking();
    }

    fn publish_speaking(&self) {
        let speaking = self
            .scheduler
            .as_ref()
            .map(|s| s.is_speaking())
            .unwrap_or(false);
        self.status.send_if_modified(|s| {
            let changed = s.is_speaking != speaking;
            s.is_speaking = speaking;
            changed
        });
    }

    fn set_label(&mut self, base: &str) {
        self.base_label = base.to_string();
        let label = if self.mic_available {
            base.to_string()
        } else if base == LABEL_CONNECTING || base == LABEL_ONLINE {
            format!("{} (microphone unavailable)", base)
        } else if base.is_empty() {
            LABEL_MIC_DENIED.to_string()
        } else {
            base.to_string()
        };
        self.status.send_modify(|s| s.connection_label = label);
    }

    /// Playback first (no drain), then the socket, then the microphone.
    async fn shutdown(&mut self) {
        log::info!("Session {} closing", self.id);

        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.stop_all();
        }
        self.publish_speaking();

        if let Some(transport) = self.transport.as_mut() {
            transport.close().await;
            if let ConnectionState::Closed { code, .. } = transport.state() {
                self.set_label(&close_label(code));
            }
        }
        self.status.send_modify(|s| s.is_connected = false);

        // Both joins block on device threads.
        let capture = self.capture.take();
        let scheduler = self.scheduler.take();
        let released = tokio::task::spawn_blocking(move || {
            if let Some(mut capture) = capture {
                capture.stop();
            }
            // Dropping the sink stops the output thread.
            drop(scheduler);
        });
        if let Err(e) = released.await {
            log::error!("Failed to release audio devices: {}", e);
        }

        log::info!("Session {} closed", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm::PcmBuffer;
    use crate::protocol::MediaChunk;
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::protocol::Message;

    #[test]
    fn close_codes_map_to_labels() {
        assert_eq!(close_label(1000), "Finished");
        assert_eq!(close_label(1006), "Error 1006");
        assert_eq!(close_label(4001), "Error 4001");
    }

    #[test]
    fn initial_status() {
        let status = SessionStatus::default();
        assert!(!status.is_connected && !status.is_speaking && !status.is_muted);
        assert_eq!(status.connection_label, LABEL_INITIALIZING);
    }

    #[tokio::test]
    async fn chunks_captured_before_mute_are_not_sent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/api/live", listener.local_addr().unwrap());
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio_tungstenite::accept_async(stream).await.unwrap()
        });

        let (net_tx, _net_rx) = mpsc::unbounded_channel();
        let transport = Transport::open(url, SetupParams::new("m", "v", "i"), net_tx);
        let mut server = accept.await.unwrap();
        let mut state = transport.subscribe();
        tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| s.is_open()))
            .await
            .unwrap()
            .unwrap();

        let (status_tx, _) = watch::channel(SessionStatus::default());
        let muted = Arc::new(AtomicBool::new(true));
        let mut controller = SessionController {
            id: Uuid::new_v4(),
            transport: Some(transport),
            scheduler: None,
            capture: None,
            status: Arc::new(status_tx),
            muted: muted.clone(),
            mic_available: true,
            base_label: String::new(),
        };

        let before = PcmBuffer::new(vec![1; 4]).to_base64();
        controller.handle_capture_event(CaptureEvent::Chunk(MediaChunk::pcm(before)));
        muted.store(false, Ordering::Relaxed);
        let after = PcmBuffer::new(vec![2; 4]).to_base64();
        controller.handle_capture_event(CaptureEvent::Chunk(MediaChunk::pcm(after.clone())));

        let mut texts = Vec::new();
        while texts.len() < 2 {
            let msg = tokio::time::timeout(Duration::from_secs(5), server.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                texts.push(serde_json::from_str::<serde_json::Value>(text.as_str()).unwrap());
            }
        }
        assert!(texts[0].get("setup").is_some());
        assert_eq!(texts[1]["realtime_input"]["media_chunks"][0]["data"], after.as_str());

        controller.shutdown().await;
        assert!(!controller.status.borrow().is_connected);
    }
}
