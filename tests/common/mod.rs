//! Fake audio devices and a local live-voice server for end-to-end tests.

#![allow(dead_code)]

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use live_voice_rs::audio::capture::CaptureSource;
use live_voice_rs::audio::pcm::{PCM_MIME_TYPE, PcmBuffer};
use live_voice_rs::audio::scheduler::{NodeId, PlaybackNode, PlaybackSink};
use live_voice_rs::{AudioBackend, Config, LiveError, LiveResult, SessionStatus};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Message;

pub const WAIT: Duration = Duration::from_secs(5);

// ======================== Capture ========================

/// Microphone fed by the test through a channel. Hanging up the sender ends
/// the capture with an error.
pub struct ChannelSource {
    rx: std_mpsc::Receiver<Vec<f32>>,
}

impl CaptureSource for ChannelSource {
    fn read(&mut self, buf: &mut [f32]) -> anyhow::Result<usize> {
        match self.rx.recv_timeout(Duration::from_millis(10)) {
            Ok(samples) => {
                let n = samples.len().min(buf.len());
                buf[..n].copy_from_slice(&samples[..n]);
                Ok(n)
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => Ok(0),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => anyhow::bail!("microphone unplugged"),
        }
    }
}

// ======================== Playback ========================

#[derive(Default)]
pub struct SinkState {
    pub now: f64,
    pub scheduled: Vec<PlaybackNode>,
    pub stopped: Vec<NodeId>,
    pub finished: Option<mpsc::UnboundedSender<NodeId>>,
}

/// Speaker whose clock only moves when the test says so.
#[derive(Clone, Default)]
pub struct FakeSink {
    pub state: Arc<Mutex<SinkState>>,
}

impl FakeSink {
    pub fn scheduled(&self) -> Vec<PlaybackNode> {
        self.state.lock().unwrap().scheduled.clone()
    }

    pub fn stopped(&self) -> Vec<NodeId> {
        self.state.lock().unwrap().stopped.clone()
    }

    pub fn set_time(&self, now: f64) {
        self.state.lock().unwrap().now = now;
    }

    /// Report `id` as played to the end.
    pub fn finish(&self, id: NodeId) {
        let state = self.state.lock().unwrap();
        if let Some(tx) = &state.finished {
            let _ = tx.send(id);
        }
    }

    pub async fn wait_scheduled(&self, count: usize) -> Vec<PlaybackNode> {
        tokio::time::timeout(WAIT, async {
            loop {
                let nodes = self.scheduled();
                if nodes.len() >= count {
                    return nodes;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("nodes were not scheduled in time")
    }
}

impl PlaybackSink for FakeSink {
    fn current_time(&self) -> f64 {
        self.state.lock().unwrap().now
    }

    fn schedule(&mut self, node: PlaybackNode) -> anyhow::Result<()> {
        self.state.lock().unwrap().scheduled.push(node);
        Ok(())
    }

    fn stop(&mut self, id: NodeId) {
        self.state.lock().unwrap().stopped.push(id);
    }
}

// ======================== Backend ========================

pub struct FakeBackend {
    mic: Option<std_mpsc::Receiver<Vec<f32>>>,
    pub sink: FakeSink,
}

impl FakeBackend {
    /// A backend with a working microphone, and the sender that feeds it.
    pub fn with_mic() -> (Self, std_mpsc::Sender<Vec<f32>>) {
        let (tx, rx) = std_mpsc::channel();
        let backend = Self {
            mic: Some(rx),
            sink: FakeSink::default(),
        };
        (backend, tx)
    }

    /// A backend whose microphone permission is refused.
    pub fn without_mic() -> Self {
        Self {
            mic: None,
            sink: FakeSink::default(),
        }
    }
}

impl AudioBackend for FakeBackend {
    fn open_capture(&mut self, _frame_size: usize) -> LiveResult<Box<dyn CaptureSource>> {
        match self.mic.take() {
            Some(rx) => Ok(Box::new(ChannelSource { rx })),
            None => Err(LiveError::DevicePermissionDenied("denied by test".to_string())),
        }
    }

    fn open_playback(
        &mut self,
        finished: mpsc::UnboundedSender<NodeId>,
    ) -> LiveResult<Box<dyn PlaybackSink>> {
        self.sink.state.lock().unwrap().finished = Some(finished);
        Ok(Box::new(self.sink.clone()))
    }
}

// ======================== Server ========================

pub type ServerSocket = WebSocketStream<TcpStream>;

/// Accept exactly one client on an ephemeral port.
pub async fn spawn_server() -> (String, JoinHandle<ServerSocket>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/api/live", listener.local_addr().unwrap());
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    });
    (url, handle)
}

/// An address nobody listens on.
pub async fn dead_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{}/api/live", addr)
}

pub fn config_for(url: &str) -> Config {
    let mut config = Config::default();
    config.network.ws_url = url.to_string();
    config
}

/// Next text frame from the client, parsed.
pub async fn next_json(ws: &mut ServerSocket) -> Value {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(text.as_str()).unwrap();
                }
                Some(Ok(_)) => continue,
                other => panic!("client went away: {:?}", other),
            }
        }
    })
    .await
    .expect("no frame from client")
}

/// Samples carried by an outbound `realtime_input` envelope.
pub fn chunk_samples(value: &Value) -> Vec<i16> {
    let chunk = &value["realtime_input"]["media_chunks"][0];
    assert_eq!(chunk["mime_type"], PCM_MIME_TYPE);
    let data = chunk["data"].as_str().expect("data is a string");
    PcmBuffer::from_base64(data).unwrap().samples().to_vec()
}

pub async fn send_audio(ws: &mut ServerSocket, samples: Vec<i16>) {
    let data = PcmBuffer::new(samples).to_base64();
    let frame = json!({"serverContent": {"modelTurn": {"parts": [
        {"inlineData": {"mimeType": PCM_MIME_TYPE, "data": data}}
    ]}}});
    send_text(ws, &frame.to_string()).await;
}

pub async fn send_text(ws: &mut ServerSocket, text: &str) {
    ws.send(Message::Text(text.to_string().into())).await.unwrap();
}

/// Block until the published status satisfies `f`.
pub async fn wait_status(
    rx: &mut watch::Receiver<SessionStatus>,
    what: &str,
    f: impl FnMut(&SessionStatus) -> bool,
) {
    let reached = matches!(tokio::time::timeout(WAIT, rx.wait_for(f)).await, Ok(Ok(_)));
    if !reached {
        panic!("status never became {}: {:?}", what, rx.borrow().clone());
    }
}
