//! WebSocket transport to the live voice service.
//!
//! One `Transport` owns one socket for its whole life. It never reconnects on
//! its own; after `Closed` the caller opens a new session.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::audio::pcm::PcmBuffer;
use crate::config::redact_endpoint;
use crate::protocol::{ClientMessage, ServerEvent, SetupParams, parse_server_message};

/// Close code of a clean shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Reported when the peer closed without a status code.
pub const NO_STATUS: u16 = 1005;
/// Reported when the socket died without a close handshake.
pub const ABNORMAL_CLOSURE: u16 = 1006;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed { code: u16, reason: String },
    Error(String),
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NetEvent {
    /// Handshake done and `Setup` written.
    Connected,
    Audio(PcmBuffer),
    Interrupted,
    /// Socket-level failure; a `Closed` follows.
    Failed(String),
    Closed { code: u16, reason: String },
}

/// Handle to the socket task.
pub struct Transport {
    state: Arc<watch::Sender<ConnectionState>>,
    out_tx: Option<mpsc::UnboundedSender<String>>,
    close_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Transport {
    /// Dial `endpoint` in the background. `setup` is the first envelope
    /// written once the socket is open.
    pub fn open(
        endpoint: String,
        setup: SetupParams,
        events: mpsc::UnboundedSender<NetEvent>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let state = Arc::new(state_tx);
        let (out_tx, rx_out) = mpsc::unbounded_channel();
        let (close_tx, rx_close) = oneshot::channel();

        state.send_replace(ConnectionState::Connecting);
        let link = NetLink {
            endpoint,
            setup,
            state: state.clone(),
            tx: events,
            rx_out,
            rx_close,
        };
        let task = tokio::spawn(link.run());

        Self {
            state,
            out_tx: Some(out_tx),
            close_tx: Some(close_tx),
            task: Some(task),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Queue an envelope. Outside `Open` this does nothing and returns
    /// `false`, so late sends from capture are simply absorbed.
    pub fn send(&self, msg: &ClientMessage) -> bool {
        if !self.state.borrow().is_open() {
            return false;
        }
        let Some(out_tx) = &self.out_tx else {
            return false;
        };
        match msg.to_json() {
            Ok(text) => out_tx.send(text).is_ok(),
            Err(e) => {
                log::error!("Failed to serialize outbound envelope: {}", e);
                false
            }
        }
    }

    /// Close the socket. Envelopes still queued are dropped, not written.
    /// Idempotent.
    pub async fn close(&mut self) {
        // Stop `send` from queueing before the task gets to run.
        self.state.send_if_modified(|s| {
            if matches!(s, ConnectionState::Closed { .. } | ConnectionState::Closing) {
                false
            } else {
                *s = ConnectionState::Closing;
                true
            }
        });
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(());
        }
        self.out_tx = None;

        let Some(mut task) = self.task.take() else {
            return;
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
            log::warn!("Socket did not close in {:?}, aborting", CLOSE_TIMEOUT);
            task.abort();
        }
        if !self.state.borrow().is_closed() {
            self.state.send_replace(ConnectionState::Closed {
                code: NORMAL_CLOSURE,
                reason: "closed by client".to_string(),
            });
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ======================== Socket task ========================

struct NetLink {
    endpoint: String,
    setup: SetupParams,
    state: Arc<watch::Sender<ConnectionState>>,
    tx: mpsc::UnboundedSender<NetEvent>,
    rx_out: mpsc::UnboundedReceiver<String>,
    /// Fires (or is dropped) when the owner wants the socket gone. Polled
    /// ahead of `rx_out` so queued envelopes never delay a close.
    rx_close: oneshot::Receiver<()>,
}

impl NetLink {
    async fn run(mut self) {
        match self.connect_and_loop().await {
            Ok((code, reason)) => {
                log::info!("Connection closed: code={}, reason={:?}", code, reason);
                self.finish(code, reason);
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                log::error!("Connection error: {}", reason);
                self.state.send_replace(ConnectionState::Error(reason.clone()));
                let _ = self.tx.send(NetEvent::Failed(reason.clone()));
                self.finish(ABNORMAL_CLOSURE, reason);
            }
        }
    }

    fn finish(&self, code: u16, reason: String) {
        self.state.send_replace(ConnectionState::Closed {
            code,
            reason: reason.clone(),
        });
        let _ = self.tx.send(NetEvent::Closed { code, reason });
    }

    /// `Ok` carries the close code of an orderly shutdown, `Err` any failure.
    async fn connect_and_loop(&mut self) -> anyhow::Result<(u16, String)> {
        log::info!("Connecting to {}...", redact_endpoint(&self.endpoint));

        let connect = connect_async(self.endpoint.as_str());
        tokio::pin!(connect);
        let ws_stream = tokio::select! {
            biased;
            _ = &mut self.rx_close => {
                self.rx_out.close();
                return Ok((NORMAL_CLOSURE, "closed before open".to_string()));
            }
            res = &mut connect => res?.0,
        };
        log::info!("Connected!");

        let (mut write, mut read) = ws_stream.split();

        // Setup goes out before any queued command can be processed.
        let setup_json = ClientMessage::Setup(self.setup.clone()).to_json()?;
        log::debug!("Sending Setup: {}", setup_json);
        write.send(Message::Text(setup_json.into())).await?;

        // A close() racing the handshake has already moved us to Closing.
        let opened = self.state.send_if_modified(|s| {
            if matches!(s, ConnectionState::Connecting) {
                *s = ConnectionState::Open;
                true
            } else {
                false
            }
        });
        if opened {
            let _ = self.tx.send(NetEvent::Connected);
        }

        loop {
            tokio::select! {
                biased;

                _ = &mut self.rx_close => {
                    self.rx_out.close();
                    let dropped = std::iter::from_fn(|| self.rx_out.try_recv().ok()).count();
                    if dropped > 0 {
                        log::debug!("Dropping {} queued envelopes on close", dropped);
                    }
                    self.state.send_replace(ConnectionState::Closing);
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: String::from("closed by client").into(),
                    };
                    let _ = write.send(Message::Close(Some(frame))).await;
                    return Ok((NORMAL_CLOSURE, "closed by client".to_string()));
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                        Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                            Ok(text) => self.handle_text(text),
                            Err(_) => log::warn!("Dropping non-UTF-8 binary frame ({} bytes)", data.len()),
                        },
                        Some(Ok(Message::Close(frame))) => {
                            self.state.send_replace(ConnectionState::Closing);
                            let _ = write.close().await;
                            return Ok(match frame {
                                Some(f) => (u16::from(f.code), f.reason.as_str().to_string()),
                                None => (NO_STATUS, String::new()),
                            });
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => anyhow::bail!("Connection closed without a close frame"),
                    }
                }
                Some(text) = self.rx_out.recv() => {
                    write.send(Message::Text(text.into())).await?;
                }
            }
        }
    }

    /// Parse failures stay local to the frame; the socket stays up.
    fn handle_text(&self, text: &str) {
        let events = match parse_server_message(text) {
            Ok(events) => events,
            Err(e) => {
                log::warn!("Dropping inbound frame: {}", e);
                return;
            }
        };
        for event in events {
            match event {
                ServerEvent::Audio(pcm) => {
                    let _ = self.tx.send(NetEvent::Audio(pcm));
                }
                ServerEvent::Interrupted => {
                    let _ = self.tx.send(NetEvent::Interrupted);
                }
                ServerEvent::SetupComplete => log::info!("Server acknowledged setup"),
                ServerEvent::TurnComplete => log::debug!("Model turn complete"),
                ServerEvent::Text(t) => log::info!("Model text: {}", t),
            }
        }
    }
}
