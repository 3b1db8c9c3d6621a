#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

pub const DEFAULT_QUIC_BIND: &str = "127.0.0.1:18203";

/// Default config path: `~/.helpdesk/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".helpdesk").join("config.toml"))
}

/// Load the server config from TOML and `HELPDESK_*` env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
	pub feed: FeedSettings,
	pub assignment: AssignmentSettings,
	pub backoffice: BackOfficeSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// QUIC listener (host:port).
	pub quic_bind: String,
	/// REST + health listener (host:port). REST is off when unset.
	pub rest_bind: Option<String>,
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// HMAC secret for session credentials.
	pub auth_hmac_secret: Option<SecretString>,
	/// `send_message` rate limiting: burst size (0 disables).
	pub send_rate_limit_burst: u32,
	/// `send_message` rate limiting: messages per minute (0 disables).
	pub send_rate_limit_per_minute: u32,
	/// Outbound events buffered per connection before dropping.
	pub mailbox_capacity: usize,
	pub auth_timeout: Duration,
	pub store_timeout: Duration,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			quic_bind: DEFAULT_QUIC_BIND.to_string(),
			rest_bind: None,
			tls_cert_path: None,
			tls_key_path: None,
			metrics_bind: None,
			auth_hmac_secret: None,
			send_rate_limit_burst: 20,
			send_rate_limit_per_minute: 120,
			mailbox_capacity: 1024,
			auth_timeout: Duration::from_secs(5),
			store_timeout: Duration::from_secs(5),
		}
	}
}

/// Database URLs (`sqlite:` or `postgres:`). In-memory stores when unset.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	pub rooms_database_url: Option<String>,
	pub messages_database_url: Option<String>,
}

/// Message change-feed tuning.
#[derive(Debug, Clone)]
pub struct FeedSettings {
	pub poll_interval: Duration,
	/// How many sequence numbers behind the cursor each poll rescans.
	pub lookback: i64,
	pub batch_size: usize,
	pub backoff_min: Duration,
	pub backoff_max: Duration,
	/// Delivered message ids remembered for de-duplication.
	pub dedupe_capacity: usize,
}

impl Default for FeedSettings {
	fn default() -> Self {
		Self {
			poll_interval: Duration::from_millis(1000),
			lookback: 64,
			batch_size: 256,
			backoff_min: Duration::from_millis(250),
			backoff_max: Duration::from_secs(30),
			dedupe_capacity: 8192,
		}
	}
}

#[derive(Debug, Clone)]
pub struct AssignmentSettings {
	pub enabled: bool,
}

impl Default for AssignmentSettings {
	fn default() -> Self {
		Self { enabled: true }
	}
}

/// External back-office (notifications, user directory, staff listing).
#[derive(Debug, Clone)]
pub struct BackOfficeSettings {
	/// Base URL; the in-process directory is used when unset.
	pub base_url: Option<String>,
	pub api_key: Option<SecretString>,
	pub timeout: Duration,
}

impl Default for BackOfficeSettings {
	fn default() -> Self {
		Self {
			base_url: None,
			api_key: None,
			timeout: Duration::from_secs(5),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	feed: FileFeedSettings,

	#[serde(default)]
	assignment: FileAssignmentSettings,

	#[serde(default)]
	backoffice: FileBackOfficeSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	quic_bind: Option<String>,
	rest_bind: Option<String>,
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	send_rate_limit_burst: Option<u32>,
	send_rate_limit_per_minute: Option<u32>,
	mailbox_capacity: Option<usize>,
	auth_timeout_ms: Option<u64>,
	store_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	rooms_database_url: Option<String>,
	messages_database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileFeedSettings {
	poll_interval_ms: Option<u64>,
	lookback: Option<i64>,
	batch_size: Option<usize>,
	backoff_min_ms: Option<u64>,
	backoff_max_ms: Option<u64>,
	dedupe_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAssignmentSettings {
	enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBackOfficeSettings {
	base_url: Option<String>,
	api_key: Option<String>,
	timeout_ms: Option<u64>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.filter(|s| !s.trim().is_empty())
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let server_defaults = ServerSettings::default();
		let feed_defaults = FeedSettings::default();
		let backoffice_defaults = BackOfficeSettings::default();

		let mut cfg = Self {
			server: ServerSettings {
				quic_bind: non_empty(file.server.quic_bind).unwrap_or(server_defaults.quic_bind),
				rest_bind: non_empty(file.server.rest_bind),
				tls_cert_path: non_empty(file.server.tls_cert_path).map(PathBuf::from),
				tls_key_path: non_empty(file.server.tls_key_path).map(PathBuf::from),
				metrics_bind: non_empty(file.server.metrics_bind),
				auth_hmac_secret: non_empty(file.server.auth_hmac_secret).map(SecretString::new),
				send_rate_limit_burst: file
					.server
					.send_rate_limit_burst
					.unwrap_or(server_defaults.send_rate_limit_burst),
				send_rate_limit_per_minute: file
					.server
					.send_rate_limit_per_minute
					.unwrap_or(server_defaults.send_rate_limit_per_minute),
				mailbox_capacity: file
					.server
					.mailbox_capacity
					.filter(|v| *v > 0)
					.unwrap_or(server_defaults.mailbox_capacity),
				auth_timeout: file
					.server
					.auth_timeout_ms
					.map(Duration::from_millis)
					.unwrap_or(server_defaults.auth_timeout),
				store_timeout: file
					.server
					.store_timeout_ms
					.map(Duration::from_millis)
					.unwrap_or(server_defaults.store_timeout),
			},
			persistence: PersistenceSettings {
				rooms_database_url: non_empty(file.persistence.rooms_database_url),
				messages_database_url: non_empty(file.persistence.messages_database_url),
			},
			feed: FeedSettings {
				poll_interval: file
					.feed
					.poll_interval_ms
					.filter(|v| *v > 0)
					.map(Duration::from_millis)
					.unwrap_or(feed_defaults.poll_interval),
				lookback: file.feed.lookback.filter(|v| *v >= 0).unwrap_or(feed_defaults.lookback),
				batch_size: file
					.feed
					.batch_size
					.filter(|v| *v > 0)
					.unwrap_or(feed_defaults.batch_size),
				backoff_min: file
					.feed
					.backoff_min_ms
					.map(Duration::from_millis)
					.unwrap_or(feed_defaults.backoff_min),
				backoff_max: file
					.feed
					.backoff_max_ms
					.map(Duration::from_millis)
					.unwrap_or(feed_defaults.backoff_max),
				dedupe_capacity: file
					.feed
					.dedupe_capacity
					.filter(|v| *v > 0)
					.unwrap_or(feed_defaults.dedupe_capacity),
			},
			assignment: AssignmentSettings {
				enabled: file.assignment.enabled.unwrap_or(true),
			},
			backoffice: BackOfficeSettings {
				base_url: non_empty(file.backoffice.base_url),
				api_key: non_empty(file.backoffice.api_key).map(SecretString::new),
				timeout: file
					.backoffice
					.timeout_ms
					.map(Duration::from_millis)
					.unwrap_or(backoffice_defaults.timeout),
			},
		};

		cfg.normalize();
		cfg
	}

	fn normalize(&mut self) {
		if self.feed.backoff_min > self.feed.backoff_max {
			warn!(
				min_ms = self.feed.backoff_min.as_millis(),
				max_ms = self.feed.backoff_max.as_millis(),
				"feed config: backoff_min > backoff_max; swapping"
			);
			std::mem::swap(&mut self.feed.backoff_min, &mut self.feed.backoff_max);
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	let string = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = string("HELPDESK_QUIC_BIND") {
		cfg.server.quic_bind = v;
		info!("server config: quic_bind overridden by env");
	}

	if let Some(v) = string("HELPDESK_REST_BIND") {
		cfg.server.rest_bind = Some(v);
		info!("server config: rest_bind overridden by env");
	}

	if let Some(v) = string("HELPDESK_TLS_CERT") {
		cfg.server.tls_cert_path = Some(PathBuf::from(v));
		info!("server config: tls_cert_path overridden by env");
	}

	if let Some(v) = string("HELPDESK_TLS_KEY") {
		cfg.server.tls_key_path = Some(PathBuf::from(v));
		info!("server config: tls_key_path overridden by env");
	}

	if let Some(v) = string("HELPDESK_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = string("HELPDESK_AUTH_HMAC_SECRET") {
		cfg.server.auth_hmac_secret = Some(SecretString::new(v));
		info!("server auth: auth_hmac_secret overridden by env");
	}

	if let Some(v) = string("HELPDESK_SEND_RATE_LIMIT_BURST")
		&& let Ok(burst) = v.parse::<u32>()
	{
		cfg.server.send_rate_limit_burst = burst;
		info!(burst, "server config: send_rate_limit_burst overridden by env");
	}

	if let Some(v) = string("HELPDESK_SEND_RATE_LIMIT_PER_MINUTE")
		&& let Ok(rate) = v.parse::<u32>()
	{
		cfg.server.send_rate_limit_per_minute = rate;
		info!(rate, "server config: send_rate_limit_per_minute overridden by env");
	}

	if let Some(v) = string("HELPDESK_MAILBOX_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
		&& capacity > 0
	{
		cfg.server.mailbox_capacity = capacity;
		info!(capacity, "server config: mailbox_capacity overridden by env");
	}

	if let Some(v) = string("HELPDESK_AUTH_TIMEOUT_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.server.auth_timeout = Duration::from_millis(ms);
		info!(ms, "server config: auth_timeout overridden by env");
	}

	if let Some(v) = string("HELPDESK_STORE_TIMEOUT_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.server.store_timeout = Duration::from_millis(ms);
		info!(ms, "server config: store_timeout overridden by env");
	}

	if let Some(v) = string("HELPDESK_ROOMS_DATABASE_URL") {
		cfg.persistence.rooms_database_url = Some(v);
		info!("persistence: rooms_database_url overridden by env");
	}

	if let Some(v) = string("HELPDESK_MESSAGES_DATABASE_URL") {
		cfg.persistence.messages_database_url = Some(v);
		info!("persistence: messages_database_url overridden by env");
	}

	if let Some(v) = string("HELPDESK_FEED_POLL_INTERVAL_MS")
		&& let Ok(ms) = v.parse::<u64>()
		&& ms > 0
	{
		cfg.feed.poll_interval = Duration::from_millis(ms);
		info!(ms, "feed config: poll_interval overridden by env");
	}

	if let Some(v) = string("HELPDESK_FEED_LOOKBACK")
		&& let Ok(lookback) = v.parse::<i64>()
		&& lookback >= 0
	{
		cfg.feed.lookback = lookback;
		info!(lookback, "feed config: lookback overridden by env");
	}

	if let Some(v) = string("HELPDESK_FEED_BACKOFF_MIN_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.feed.backoff_min = Duration::from_millis(ms);
		info!(ms, "feed config: backoff_min overridden by env");
	}

	if let Some(v) = string("HELPDESK_FEED_BACKOFF_MAX_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.feed.backoff_max = Duration::from_millis(ms);
		info!(ms, "feed config: backoff_max overridden by env");
	}

	if let Some(v) = string("HELPDESK_FEED_DEDUPE_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
		&& capacity > 0
	{
		cfg.feed.dedupe_capacity = capacity;
		info!(capacity, "feed config: dedupe_capacity overridden by env");
	}

	if let Some(v) = string("HELPDESK_ASSIGNMENT_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.assignment.enabled = enabled;
		info!(enabled, "assignment: enabled overridden by env");
	}

	if let Some(v) = string("HELPDESK_BACKOFFICE_URL") {
		cfg.backoffice.base_url = Some(v);
		info!("backoffice: base_url overridden by env");
	}

	if let Some(v) = string("HELPDESK_BACKOFFICE_API_KEY") {
		cfg.backoffice.api_key = Some(SecretString::new(v));
		info!("backoffice: api_key overridden by env");
	}

	if let Some(v) = string("HELPDESK_BACKOFFICE_TIMEOUT_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.backoffice.timeout = Duration::from_millis(ms);
		info!(ms, "backoffice: timeout overridden by env");
	}

	cfg.normalize();
}
