use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG: &str = r#"
[api]
base_url = "http://localhost:8096/api"
request_timeout_secs = 30

[watch]
poll_interval_ms = 3000
terminal_statuses = ["DONE", "ERROR"]
discovery_attempts = 10
discovery_delay_ms = 500
stream_timeout_secs = 300

[picker]
fzf_bin = "fzf"
back_key = "ctrl-p"
preview_window = "right:60%:wrap"
"#;

pub const BASE_URL_ENV: &str = "VKCLI_BASE_URL";
pub const WS_BASE_URL_ENV: &str = "VKCLI_WS_BASE_URL";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
	#[serde(default)]
	pub api: Api,
	#[serde(default)]
	pub watch: Watch,
	#[serde(default)]
	pub picker: Picker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Api {
	#[serde(default = "default_base_url")]
	pub base_url: String,
	/// Websocket root; derived from `base_url` when unset.
	#[serde(default)]
	pub ws_base_url: Option<String>,
	#[serde(default = "default_request_timeout_secs")]
	pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Watch {
	#[serde(default = "default_poll_interval_ms")]
	pub poll_interval_ms: u64,
	#[serde(default = "default_terminal_statuses")]
	pub terminal_statuses: Vec<String>,
	#[serde(default = "default_discovery_attempts")]
	pub discovery_attempts: u32,
	#[serde(default = "default_discovery_delay_ms")]
	pub discovery_delay_ms: u64,
	/// 0 disables the log stream timeout.
	#[serde(default = "default_stream_timeout_secs")]
	pub stream_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Picker {
	#[serde(default = "default_fzf_bin")]
	pub fzf_bin: String,
	#[serde(default = "default_back_key")]
	pub back_key: String,
	#[serde(default = "default_preview_window")]
	pub preview_window: String,
}

impl Default for Api {
	fn default() -> Self {
		Self {
			base_url: default_base_url(),
			ws_base_url: None,
			request_timeout_secs: default_request_timeout_secs(),
		}
	}
}

impl Default for Watch {
	fn default() -> Self {
		Self {
			poll_interval_ms: default_poll_interval_ms(),
			terminal_statuses: default_terminal_statuses(),
			discovery_attempts: default_discovery_attempts(),
			discovery_delay_ms: default_discovery_delay_ms(),
			stream_timeout_secs: default_stream_timeout_secs(),
		}
	}
}

impl Default for Picker {
	fn default() -> Self {
		Self {
			fzf_bin: default_fzf_bin(),
			back_key: default_back_key(),
			preview_window: default_preview_window(),
		}
	}
}

impl Api {
	/// Websocket root for streaming endpoints.
	pub fn ws_root(&self) -> String {
		if let Some(ws) = self.ws_base_url.as_deref().filter(|s| !s.trim().is_empty()) {
			return ws.trim_end_matches('/').to_string();
		}
		let base = self.base_url.trim_end_matches('/');
		if let Some(rest) = base.strip_prefix("https://") {
			format!("wss://{rest}")
		} else if let Some(rest) = base.strip_prefix("http://") {
			format!("ws://{rest}")
		} else {
			base.to_string()
		}
	}

	pub fn request_timeout(&self) -> Duration {
		Duration::from_secs(self.request_timeout_secs)
	}
}

impl Watch {
	pub fn poll_interval(&self) -> Duration {
		Duration::from_millis(self.poll_interval_ms)
	}

	pub fn discovery_delay(&self) -> Duration {
		Duration::from_millis(self.discovery_delay_ms)
	}

	pub fn stream_timeout(&self) -> Option<Duration> {
		match self.stream_timeout_secs {
			0 => None,
			secs => Some(Duration::from_secs(secs)),
		}
	}

	pub fn is_terminal(&self, status: &str) -> bool {
		self.terminal_statuses.iter().any(|s| s.eq_ignore_ascii_case(status))
	}
}

fn default_base_url() -> String {
	"http://localhost:8096/api".to_string()
}

fn default_request_timeout_secs() -> u64 {
	30
}

fn default_poll_interval_ms() -> u64 {
	3000
}

fn default_terminal_statuses() -> Vec<String> {
	vec!["DONE".to_string(), "ERROR".to_string()]
}

fn default_discovery_attempts() -> u32 {
	10
}

fn default_discovery_delay_ms() -> u64 {
	500
}

fn default_stream_timeout_secs() -> u64 {
	300
}

fn default_fzf_bin() -> String {
	"fzf".to_string()
}

fn default_back_key() -> String {
	"ctrl-p".to_string()
}

fn default_preview_window() -> String {
	"right:60%:wrap".to_string()
}

/// Load `~/.vkcli/config.toml`, writing the default file on first run.
pub fn load_or_init() -> Result<Config> {
	let base_dir = base_dir()?;
	if !base_dir.exists() {
		fs::create_dir_all(&base_dir)?;
	}

	let config_path = base_dir.join("config.toml");
	if !config_path.exists() {
		fs::write(&config_path, DEFAULT_CONFIG.trim_start())
			.with_context(|| format!("failed to write {}", config_path.display()))?;
	}
	load_from(&config_path)
}

/// Load an explicit config file; nothing is created.
pub fn load_from(path: &Path) -> Result<Config> {
	let content = fs::read_to_string(path)
		.with_context(|| format!("failed to read {}", path.display()))?;
	let mut cfg: Config =
		toml::from_str(&content).with_context(|| format!("invalid config {}", path.display()))?;
	apply_env(&mut cfg, |key| std::env::var(key).ok());
	Ok(cfg)
}

fn apply_env(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
	if let Some(url) = lookup(BASE_URL_ENV).filter(|v| !v.trim().is_empty()) {
		cfg.api.base_url = url.trim().to_string();
	}
	if let Some(url) = lookup(WS_BASE_URL_ENV).filter(|v| !v.trim().is_empty()) {
		cfg.api.ws_base_url = Some(url.trim().to_string());
	}
}

pub fn base_dir() -> Result<PathBuf> {
	dirs::home_dir()
		.map(|p| p.join(".vkcli"))
		.ok_or_else(|| anyhow::anyhow!("Failed to resolve home directory"))
}
