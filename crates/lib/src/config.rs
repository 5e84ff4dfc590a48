//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (`~/.cadence/config.json` or `CADENCE_CONFIG_PATH`), then
//! environment overrides are applied. Blank environment values are ignored.

use crate::channels::{RetryPolicy, UazapiSettings};
use crate::llm::EngineSettings;
use crate::orchestrator::{TurnSettings, DEFAULT_HEADER};
use crate::store::DEFAULT_HISTORY_LIMIT;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// HTTP listener and webhook route.
    #[serde(default)]
    pub server: ServerConfig,

    /// Debounce window.
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Conversational engine credentials and models.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Run polling and reply behaviour.
    #[serde(default)]
    pub turn: TurnConfig,

    /// Messaging gateway endpoints and compatibility options.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// History and sender persistence.
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Bind address (default "0.0.0.0"; the gateway must reach the webhook).
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Port (default 8080). APP_ADDR (`[host]:port`) overrides bind and port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Route the gateway posts events to (default "/webhook").
    #[serde(default = "default_webhook_path")]
    pub webhook_path: String,

    /// Largest accepted webhook body (default 4 MiB).
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_webhook_path() -> String {
    "/webhook".to_string()
}

fn default_max_body_bytes() -> usize {
    4 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            webhook_path: default_webhook_path(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferConfig {
    /// Inactivity window in seconds before a sender's fragments are flushed (default 15).
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_window_secs() -> u64 {
    15
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// API base (default "https://api.openai.com/v1"). Overridden by OPENAI_BASE_URL.
    pub base_url: Option<String>,
    /// Overridden by OPENAI_API_KEY.
    pub api_key: Option<String>,
    /// Assistant the runs execute. Overridden by OPENAI_ASSISTANT_ID.
    pub assistant_id: Option<String>,
    /// Overridden by OPENAI_CHAT_MODEL.
    pub chat_model: String,
    /// Overridden by OPENAI_TRANSCRIBE_MODEL.
    pub transcribe_model: String,
    pub tts_model: String,
    /// Overridden by TTS_VOICE.
    pub tts_voice: String,
    /// Overridden by TTS_SPEED.
    pub tts_speed: f64,
    pub timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let settings = EngineSettings::default();
        Self {
            base_url: None,
            api_key: None,
            assistant_id: None,
            chat_model: settings.chat_model,
            transcribe_model: settings.transcribe_model,
            tts_model: settings.tts_model,
            tts_voice: settings.tts_voice,
            tts_speed: settings.tts_speed,
            timeout_secs: settings.timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TurnConfig {
    pub poll_interval_ms: u64,
    pub poll_attempts: u32,
    /// Line above the fragment list sent to the engine.
    pub header: String,
    /// Text sent to the sender when a turn fails. Absent means failures stay silent.
    pub failure_notice: Option<String>,
    /// Typing indicator before each reply; 0 disables it.
    pub typing_delay_ms: u64,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            poll_attempts: 10,
            header: DEFAULT_HEADER.to_string(),
            failure_notice: None,
            typing_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Overridden by UAZAPI_BASE_SEND.
    pub base_send: Option<String>,
    /// Overridden by UAZAPI_TOKEN_SEND.
    pub token_send: Option<String>,
    /// Defaults to `baseSend`. Overridden by UAZAPI_BASE_DOWNLOAD.
    pub base_download: Option<String>,
    /// Defaults to `tokenSend`. Overridden by UAZAPI_TOKEN_DOWNLOAD.
    pub token_download: Option<String>,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub timeout_secs: u64,
    /// Canonical field names only. Overridden by UAZAPI_MINIMAL_PAYLOAD.
    pub minimal_payload: bool,
    /// Candidate text routes; empty uses the built-in list.
    pub text_paths: Vec<String>,
    /// Candidate media routes; empty uses the built-in list.
    pub media_paths: Vec<String>,
    pub wait_pulse_ms: u64,
    /// Non-zero send delays are raised to at least this (default 1000).
    pub min_visible_ms: u64,
    /// Hold typing with `/wait` pulses before delayed sends. Overridden by UAZAPI_LEGACY_WAIT.
    pub legacy_wait: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            base_send: None,
            token_send: None,
            base_download: None,
            token_download: None,
            max_retries: retry.max_retries,
            backoff_ms: retry.backoff.as_millis() as u64,
            timeout_secs: 30,
            minimal_payload: true,
            text_paths: Vec::new(),
            media_paths: Vec::new(),
            wait_pulse_ms: 5500,
            min_visible_ms: 1000,
            legacy_wait: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreConfig {
    /// Data directory; relative paths resolve against the config file's parent. Default `data`.
    pub directory: Option<PathBuf>,
    /// Keep senders and history in memory only.
    pub in_memory: bool,
    /// History records held in memory per sender (default 200). The log file keeps everything.
    pub history_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            directory: None,
            in_memory: false,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// `":8080"` → `(None, 8080)`; `"127.0.0.1:9000"` → `(Some("127.0.0.1"), 9000)`.
fn parse_listen_addr(value: &str) -> Option<(Option<String>, u16)> {
    let (host, port) = value.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Some((Some(host.to_string()).filter(|h| !h.is_empty()), port))
}

impl Config {
    /// Apply environment overrides. `lookup` returns the raw value of a variable.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| non_blank(lookup(name).as_deref());

        if let Some(v) = get("OPENAI_API_KEY") {
            self.engine.api_key = Some(v);
        }
        if let Some(v) = get("OPENAI_ASSISTANT_ID") {
            self.engine.assistant_id = Some(v);
        }
        if let Some(v) = get("OPENAI_BASE_URL") {
            self.engine.base_url = Some(v);
        }
        if let Some(v) = get("OPENAI_CHAT_MODEL") {
            self.engine.chat_model = v;
        }
        if let Some(v) = get("OPENAI_TRANSCRIBE_MODEL") {
            self.engine.transcribe_model = v;
        }
        if let Some(v) = get("TTS_VOICE") {
            self.engine.tts_voice = v;
        }
        if let Some(v) = get("TTS_SPEED") {
            match v.parse::<f64>() {
                Ok(speed) => self.engine.tts_speed = speed,
                Err(_) => log::warn!("ignoring TTS_SPEED={:?}: not a number", v),
            }
        }
        if let Some(v) = get("BUFFER_TIMEOUT_SECONDS") {
            match v.parse::<u64>() {
                Ok(secs) => self.buffer.window_secs = secs,
                Err(_) => {
                    log::warn!("ignoring BUFFER_TIMEOUT_SECONDS={:?}: not a whole number", v)
                }
            }
        }
        if let Some(v) = get("APP_ADDR") {
            match parse_listen_addr(&v) {
                Some((bind, port)) => {
                    if let Some(bind) = bind {
                        self.server.bind = bind;
                    }
                    self.server.port = port;
                }
                None => log::warn!("ignoring APP_ADDR={:?}: expected [host]:port", v),
            }
        }
        if let Some(v) = get("UAZAPI_BASE_SEND") {
            self.gateway.base_send = Some(v);
        }
        if let Some(v) = get("UAZAPI_TOKEN_SEND") {
            self.gateway.token_send = Some(v);
        }
        if let Some(v) = get("UAZAPI_BASE_DOWNLOAD") {
            self.gateway.base_download = Some(v);
        }
        if let Some(v) = get("UAZAPI_TOKEN_DOWNLOAD") {
            self.gateway.token_download = Some(v);
        }
        if let Some(v) = get("UAZAPI_MINIMAL_PAYLOAD") {
            match parse_flag(&v) {
                Some(flag) => self.gateway.minimal_payload = flag,
                None => log::warn!("ignoring UAZAPI_MINIMAL_PAYLOAD={:?}: not a boolean", v),
            }
        }
        if let Some(v) = get("UAZAPI_LEGACY_WAIT") {
            match parse_flag(&v) {
                Some(flag) => self.gateway.legacy_wait = flag,
                None => log::warn!("ignoring UAZAPI_LEGACY_WAIT={:?}: not a boolean", v),
            }
        }
    }

    /// Check everything `serve` needs. Reports all missing values at once.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if non_blank(self.engine.api_key.as_deref()).is_none() {
            missing.push("engine.apiKey (OPENAI_API_KEY)");
        }
        if non_blank(self.engine.assistant_id.as_deref()).is_none() {
            missing.push("engine.assistantId (OPENAI_ASSISTANT_ID)");
        }
        if non_blank(self.gateway.base_send.as_deref()).is_none() {
            missing.push("gateway.baseSend (UAZAPI_BASE_SEND)");
        }
        if non_blank(self.gateway.token_send.as_deref()).is_none() {
            missing.push("gateway.tokenSend (UAZAPI_TOKEN_SEND)");
        }
        if !missing.is_empty() {
            anyhow::bail!("missing required configuration: {}", missing.join(", "));
        }
        if self.buffer.window_secs == 0 {
            anyhow::bail!("buffer.windowSecs must be greater than zero");
        }
        if self.turn.poll_attempts == 0 {
            anyhow::bail!("turn.pollAttempts must be greater than zero");
        }
        if !self.server.webhook_path.starts_with('/') {
            anyhow::bail!(
                "server.webhookPath must start with '/': {}",
                self.server.webhook_path
            );
        }
        Ok(())
    }

    pub fn buffer_window(&self) -> Duration {
        Duration::from_secs(self.buffer.window_secs)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        let e = &self.engine;
        EngineSettings {
            base_url: non_blank(e.base_url.as_deref()),
            api_key: non_blank(e.api_key.as_deref()).unwrap_or_default(),
            assistant_id: non_blank(e.assistant_id.as_deref()).unwrap_or_default(),
            chat_model: e.chat_model.clone(),
            transcribe_model: e.transcribe_model.clone(),
            tts_model: e.tts_model.clone(),
            tts_voice: e.tts_voice.clone(),
            tts_speed: e.tts_speed,
            timeout: Duration::from_secs(e.timeout_secs),
        }
    }

    /// Gateway client settings; download base and token fall back to the send ones.
    pub fn uazapi_settings(&self) -> UazapiSettings {
        let g = &self.gateway;
        let base_send = non_blank(g.base_send.as_deref()).unwrap_or_default();
        let token_send = non_blank(g.token_send.as_deref()).unwrap_or_default();
        let mut settings = UazapiSettings::new(base_send, token_send);
        if let Some(base) = non_blank(g.base_download.as_deref()) {
            settings.base_download = base;
        }
        if let Some(token) = non_blank(g.token_download.as_deref()) {
            settings.token_download = token;
        }
        settings.retry = RetryPolicy {
            max_retries: g.max_retries,
            backoff: Duration::from_millis(g.backoff_ms),
        };
        settings.timeout = Duration::from_secs(g.timeout_secs);
        settings.minimal_payload = g.minimal_payload;
        settings.text_paths = g.text_paths.clone();
        settings.media_paths = g.media_paths.clone();
        settings.wait_pulse = Duration::from_millis(g.wait_pulse_ms);
        settings.min_visible = Duration::from_millis(g.min_visible_ms);
        settings.legacy_wait = g.legacy_wait;
        settings
    }

    pub fn turn_settings(&self) -> TurnSettings {
        let t = &self.turn;
        TurnSettings {
            poll_interval: Duration::from_millis(t.poll_interval_ms),
            poll_attempts: t.poll_attempts,
            header: t.header.clone(),
            failure_notice: non_blank(t.failure_notice.as_deref()),
            typing_delay: Duration::from_millis(t.typing_delay_ms),
        }
    }
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("CADENCE_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".cadence").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, the default path, or CADENCE_CONFIG_PATH, then apply
/// environment overrides. Missing file => defaults. Returns the config and the path used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let mut config: Config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    config.apply_overrides(|name| std::env::var(name).ok());
    Ok((config, path))
}

fn config_parent(config_path: &Path) -> &Path {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Default data directory: `data` beside the config file.
pub fn data_dir(config_path: &Path) -> PathBuf {
    config_parent(config_path).join("data")
}

/// Store directory, or None for an in-memory store. Relative overrides resolve against the
/// config file's parent.
pub fn resolve_store_dir(config: &Config, config_path: &Path) -> Option<PathBuf> {
    if config.store.in_memory {
        return None;
    }
    Some(match &config.store.directory {
        Some(d) if !d.as_os_str().is_empty() => {
            if d.is_absolute() {
                d.clone()
            } else {
                config_parent(config_path).join(d)
            }
        }
        _ => data_dir(config_path),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn complete() -> Config {
        let mut config = Config::default();
        config.apply_overrides(env(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_ASSISTANT_ID", "asst_1"),
            ("UAZAPI_BASE_SEND", "https://gw.example/api/"),
            ("UAZAPI_TOKEN_SEND", "tok"),
        ]));
        config
    }

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.server.port, 8080);
        assert_eq!(c.server.bind, "0.0.0.0");
        assert_eq!(c.server.webhook_path, "/webhook");
        assert_eq!(c.buffer.window_secs, 15);
        assert_eq!(c.turn.poll_attempts, 10);
        assert_eq!(c.turn.poll_interval_ms, 2000);
        assert!(c.turn.failure_notice.is_none());
        assert_eq!(c.gateway.max_retries, 3);
        assert!(c.gateway.minimal_payload);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let c: Config = serde_json::from_str(
            r#"{"server":{"port":9000},"turn":{"failureNotice":"Sorry!"},"gateway":{"minimalPayload":false,"textPaths":["/custom"]}}"#,
        )
        .unwrap();
        assert_eq!(c.server.port, 9000);
        assert_eq!(c.server.webhook_path, "/webhook");
        assert_eq!(c.turn.failure_notice.as_deref(), Some("Sorry!"));
        assert_eq!(c.turn.poll_attempts, 10);
        assert!(!c.gateway.minimal_payload);
        assert_eq!(c.gateway.text_paths, vec!["/custom"]);
        assert_eq!(c.gateway.backoff_ms, 250);
    }

    #[test]
    fn env_overrides_win_and_blank_values_are_ignored() {
        let file = r#"{"engine":{"apiKey":"from-file","ttsVoice":"alloy"}}"#;
        let mut c: Config = serde_json::from_str(file).unwrap();
        c.apply_overrides(env(&[
            ("OPENAI_API_KEY", "  from-env "),
            ("TTS_VOICE", "   "),
            ("TTS_SPEED", "1.25"),
            ("BUFFER_TIMEOUT_SECONDS", "3"),
            ("UAZAPI_MINIMAL_PAYLOAD", "false"),
        ]));
        assert_eq!(c.engine.api_key.as_deref(), Some("from-env"));
        assert_eq!(c.engine.tts_voice, "alloy");
        assert_eq!(c.engine.tts_speed, 1.25);
        assert_eq!(c.buffer_window(), Duration::from_secs(3));
        assert!(!c.gateway.minimal_payload);
    }

    #[test]
    fn model_and_address_overrides() {
        let mut c = Config::default();
        c.apply_overrides(env(&[
            ("OPENAI_CHAT_MODEL", "gpt-4o"),
            ("OPENAI_TRANSCRIBE_MODEL", "whisper-large"),
            ("APP_ADDR", ":9090"),
        ]));
        assert_eq!(c.engine.chat_model, "gpt-4o");
        assert_eq!(c.engine.transcribe_model, "whisper-large");
        assert_eq!(c.server.bind, "0.0.0.0");
        assert_eq!(c.server.port, 9090);

        c.apply_overrides(env(&[("APP_ADDR", "127.0.0.1:7000")]));
        assert_eq!(c.server.bind, "127.0.0.1");
        assert_eq!(c.server.port, 7000);

        c.apply_overrides(env(&[("APP_ADDR", "no-port")]));
        assert_eq!(c.server.port, 7000);
    }

    #[test]
    fn typing_options_reach_gateway_settings() {
        let mut c = complete();
        c.gateway.min_visible_ms = 1500;
        c.apply_overrides(env(&[("UAZAPI_LEGACY_WAIT", "yes")]));
        let s = c.uazapi_settings();
        assert!(s.legacy_wait);
        assert_eq!(s.min_visible, Duration::from_millis(1500));
        assert_eq!(Config::default().store.history_limit, DEFAULT_HISTORY_LIMIT);
    }

    #[test]
    fn unparsable_overrides_are_ignored() {
        let mut c = Config::default();
        c.apply_overrides(env(&[
            ("BUFFER_TIMEOUT_SECONDS", "soon"),
            ("UAZAPI_MINIMAL_PAYLOAD", "maybe"),
        ]));
        assert_eq!(c.buffer.window_secs, 15);
        assert!(c.gateway.minimal_payload);
    }

    #[test]
    fn validate_lists_missing_credentials() {
        let err = Config::default().validate().unwrap_err().to_string();
        assert!(err.contains("engine.apiKey"));
        assert!(err.contains("gateway.tokenSend"));
        assert!(complete().validate().is_ok());

        let mut c = complete();
        c.buffer.window_secs = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn download_settings_fall_back_to_send() {
        let s = complete().uazapi_settings();
        assert_eq!(s.base_download, "https://gw.example/api/");
        assert_eq!(s.token_download, "tok");

        let mut c = complete();
        c.apply_overrides(env(&[
            ("UAZAPI_BASE_DOWNLOAD", "https://files.example"),
            ("UAZAPI_TOKEN_DOWNLOAD", "dl"),
        ]));
        let s = c.uazapi_settings();
        assert_eq!(s.base_download, "https://files.example");
        assert_eq!(s.token_download, "dl");
        assert_eq!(s.retry, RetryPolicy::default());
    }

    #[test]
    fn turn_settings_treat_blank_notice_as_silent() {
        let mut c = Config::default();
        c.turn.failure_notice = Some("  ".into());
        c.turn.typing_delay_ms = 1200;
        let t = c.turn_settings();
        assert!(t.failure_notice.is_none());
        assert_eq!(t.typing_delay, Duration::from_millis(1200));
        assert_eq!(t.poll_interval, Duration::from_secs(2));
    }

    #[test]
    fn resolve_store_dir_default_and_overrides() {
        let path = Path::new("/home/user/.cadence/config.json");
        let mut c = Config::default();
        assert_eq!(
            resolve_store_dir(&c, path),
            Some(PathBuf::from("/home/user/.cadence/data"))
        );
        c.store.directory = Some(PathBuf::from("state"));
        assert_eq!(
            resolve_store_dir(&c, path),
            Some(PathBuf::from("/home/user/.cadence/state"))
        );
        c.store.directory = Some(PathBuf::from("/var/lib/cadence"));
        assert_eq!(
            resolve_store_dir(&c, path),
            Some(PathBuf::from("/var/lib/cadence"))
        );
        c.store.in_memory = true;
        assert_eq!(resolve_store_dir(&c, path), None);
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let path = std::env::temp_dir()
            .join(format!("cadence-missing-{}", uuid::Uuid::new_v4()))
            .join("config.json");
        let (config, used) = load_config(Some(path.clone())).unwrap();
        assert_eq!(used, path);
        assert_eq!(config.server.port, 8080);
    }
}
