use serde::{Deserialize, Serialize};
use url::Url;

use crate::audio::scheduler::SchedulerConfig;
use crate::error::{LiveError, LiveResult};

/// Path appended to an API base URL to reach the live voice socket.
const LIVE_PATH: &str = "/api/live";

/// Accepted range for `audio.frame_duration_ms`.
pub const FRAME_DURATION_MS_RANGE: std::ops::RangeInclusive<u32> = 1..=1000;

/// Runtime configuration.
///
/// Sources, later ones win:
/// 1. built-in defaults
/// 2. `config.toml` (or the path given to [`Config::load`])
/// 3. environment, e.g. `LIVE_VOICE__NETWORK__TOKEN=...`
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub network: NetworkSettings,
    pub audio: AudioSettings,
    pub playback: PlaybackSettings,
    pub session: SessionSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct NetworkSettings {
    /// Fully resolved socket endpoint. Takes precedence over `api_url`.
    pub ws_url: String,
    /// HTTP(S) base of the backend; the socket lives at `/api/live` on the
    /// same host.
    pub api_url: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct AudioSettings {
    pub capture_device: String,
    pub playback_device: String,
    pub frame_duration_ms: u32,
    /// 0 lets ALSA decide
    pub playback_period_size: usize,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct PlaybackSettings {
    pub lookahead_ms: u32,
    pub speaking_tail_ms: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SessionSettings {
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:3000/api/live".to_string(),
            api_url: None,
            token: None,
        }
    }
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            capture_device: "default".to_string(),
            playback_device: "default".to_string(),
            frame_duration_ms: 20,
            playback_period_size: 320,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            lookahead_ms: 50,
            speaking_tail_ms: 100,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            model: "models/gemini-2.0-flash".to_string(),
            voice_name: "Aoede".to_string(),
            system_instruction: String::new(),
        }
    }
}

impl Config {
    /// Load `path` (optional, without extension allowed) and the environment.
    pub fn load(path: &str) -> LiveResult<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path).required(false))
            .add_source(
                ::config::Environment::with_prefix("LIVE_VOICE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the audio path cannot work with.
    pub fn validate(&self) -> LiveResult<()> {
        let ms = self.audio.frame_duration_ms;
        if !FRAME_DURATION_MS_RANGE.contains(&ms) {
            return Err(LiveError::Config(format!(
                "audio.frame_duration_ms must be in {}..={}, got {}",
                FRAME_DURATION_MS_RANGE.start(),
                FRAME_DURATION_MS_RANGE.end(),
                ms
            )));
        }
        Ok(())
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            lookahead: self.playback.lookahead_ms as f64 / 1000.0,
            speaking_tail: self.playback.speaking_tail_ms as f64 / 1000.0,
        }
    }

    /// The socket URL to dial, with `token` (argument first, then config)
    /// attached as a query parameter.
    pub fn endpoint(&self, token: Option<&str>) -> LiveResult<String> {
        let mut url = if !self.network.ws_url.is_empty() {
            Url::parse(&self.network.ws_url)
                .map_err(|e| LiveError::Config(format!("ws_url: {}", e)))?
        } else if let Some(api) = &self.network.api_url {
            derive_live_url(api)?
        } else {
            return Err(LiveError::Config(
                "neither network.ws_url nor network.api_url is set".to_string(),
            ));
        };

        let token = token.or(self.network.token.as_deref()).filter(|t| !t.is_empty());
        if let Some(token) = token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url.to_string())
    }
}

/// `https://host/anything` → `wss://host/api/live`, `http` → `ws`.
fn derive_live_url(api_url: &str) -> LiveResult<Url> {
    let api = Url::parse(api_url).map_err(|e| LiveError::Config(format!("api_url: {}", e)))?;
    let scheme = match api.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(LiveError::Config(format!(
                "api_url: unsupported scheme '{}'",
                other
            )));
        }
    };
    let host = api
        .host_str()
        .ok_or_else(|| LiveError::Config("api_url has no host".to_string()))?;
    let authority = match api.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    Url::parse(&format!("{}://{}{}", scheme, authority, LIVE_PATH))
        .map_err(|e| LiveError::Config(format!("api_url: {}", e)))
}

/// Hide the token when showing an endpoint to a user or a log.
pub fn redact_endpoint(endpoint: &str) -> String {
    match Url::parse(endpoint) {
        Ok(mut url) => {
            let pairs: Vec<(String, String)> = url
                .query_pairs()
                .map(|(k, v)| {
                    let v = if k == "token" { "***".to_string() } else { v.into_owned() };
                    (k.into_owned(), v)
                })
                .collect();
            if pairs.is_empty() {
                return url.to_string();
            }
            url.query_pairs_mut().clear().extend_pairs(pairs);
            url.to_string()
        }
        Err(_) => endpoint.to_string(),
    }
}
