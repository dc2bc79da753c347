#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use pairlive_platform::SecretString;
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.pairlive/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".pairlive").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = match std::env::var("PAIRLIVE_CONFIG") {
		Ok(v) if !v.trim().is_empty() => PathBuf::from(v),
		_ => default_config_path()?,
	};
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg);
	Ok(cfg)
}

/// Server config (v1). Recognized options from spec.md §6 plus the ambient
/// bind/backend options of SPEC_FULL.md §6.
#[derive(Debug, Clone)]
pub struct ServerConfig {
	/// Signaling listener, `quic://host:port`.
	pub bind: String,
	/// Health/readiness HTTP listener.
	pub health_bind: String,
	/// Prometheus exporter listener.
	pub metrics_bind: String,
	/// Store (A) backend URL (`sqlite:`/`postgres:`/`mysql:` prefix dispatch).
	pub database_url: String,
	/// `tracing_subscriber::EnvFilter` directive string.
	pub log_filter: String,
	/// Optional OTLP collector endpoint.
	pub otlp_endpoint: Option<String>,

	/// HMAC secret backing the default `AuthResolver`.
	pub auth_hmac_secret: SecretString,

	/// Base URL of the out-of-band IM notification provider (spec.md §4.F).
	pub im_base_url: String,
	/// API key for the IM notification provider.
	pub im_api_key: SecretString,

	/// Base URL of the RTC room-token minting service.
	pub rtc_base_url: String,
	/// API key for the RTC room-token minting service.
	pub rtc_api_key: SecretString,

	/// PEM-encoded certificate/key paths for QUIC/TLS (dev self-signed cert if unset).
	pub tls_cert_path: Option<PathBuf>,
	pub tls_key_path: Option<PathBuf>,

	pub timeouts: Timeouts,

	/// Admission cap for G (spec.md §6, default 20).
	pub max_rooms: u32,

	pub rate_limit: RateLimitSettings,
}

/// Timeout/interval options, all from spec.md §6.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
	/// Grace before closing unauthenticated connections (default 5000ms).
	pub authorize_timeout: Duration,
	/// Heartbeat period (default 5s).
	pub ping_interval: Duration,
	/// Inactivity threshold (default 20s).
	pub pong_timeout: Duration,
	/// Offer expiry (default 10s).
	pub pk_request_timeout: Duration,
	/// TTL for minted RTC room tokens.
	pub rtc_room_token_ttl: Duration,
}

impl Default for Timeouts {
	fn default() -> Self {
		Self {
			authorize_timeout: Duration::from_millis(5000),
			ping_interval: Duration::from_secs(5),
			pong_timeout: Duration::from_secs(20),
			pk_request_timeout: Duration::from_secs(10),
			rtc_room_token_ttl: Duration::from_secs(3600),
		}
	}
}

/// Command rate limiting, grounded on the teacher's `TokenBucket`/`CommandRateLimiter`.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitSettings {
	pub per_connection_burst: u32,
	pub per_connection_per_minute: u32,
	pub per_pair_burst: u32,
	pub per_pair_per_minute: u32,
}

impl Default for RateLimitSettings {
	fn default() -> Self {
		Self {
			per_connection_burst: 20,
			per_connection_per_minute: 120,
			per_pair_burst: 5,
			per_pair_per_minute: 30,
		}
	}
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			bind: "quic://0.0.0.0:18203".to_string(),
			health_bind: "0.0.0.0:8080".to_string(),
			metrics_bind: "0.0.0.0:9090".to_string(),
			database_url: "sqlite::memory:".to_string(),
			log_filter: "info".to_string(),
			otlp_endpoint: None,
			auth_hmac_secret: SecretString::new("dev-only-change-me"),
			im_base_url: String::new(),
			im_api_key: SecretString::new(""),
			rtc_base_url: String::new(),
			rtc_api_key: SecretString::new(""),
			tls_cert_path: None,
			tls_key_path: None,
			timeouts: Timeouts::default(),
			max_rooms: 20,
			rate_limit: RateLimitSettings::default(),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	bind: Option<String>,
	health_bind: Option<String>,
	metrics_bind: Option<String>,
	database_url: Option<String>,
	log_filter: Option<String>,
	otlp_endpoint: Option<String>,
	auth_hmac_secret: Option<String>,
	im_base_url: Option<String>,
	im_api_key: Option<String>,
	rtc_base_url: Option<String>,
	rtc_api_key: Option<String>,
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,

	authorize_timeout_ms: Option<u64>,
	ping_interval_secs: Option<u64>,
	pong_timeout_secs: Option<u64>,
	pk_request_timeout_secs: Option<u64>,
	rtc_room_token_ttl_secs: Option<u64>,

	max_rooms: Option<u32>,

	rate_limit_per_connection_burst: Option<u32>,
	rate_limit_per_connection_per_minute: Option<u32>,
	rate_limit_per_pair_burst: Option<u32>,
	rate_limit_per_pair_per_minute: Option<u32>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = Self::default();
		let default_timeouts = Timeouts::default();
		let default_rates = RateLimitSettings::default();

		Self {
			bind: file.bind.filter(|s| !s.trim().is_empty()).unwrap_or(defaults.bind),
			health_bind: file.health_bind.filter(|s| !s.trim().is_empty()).unwrap_or(defaults.health_bind),
			metrics_bind: file.metrics_bind.filter(|s| !s.trim().is_empty()).unwrap_or(defaults.metrics_bind),
			database_url: file.database_url.filter(|s| !s.trim().is_empty()).unwrap_or(defaults.database_url),
			log_filter: file.log_filter.filter(|s| !s.trim().is_empty()).unwrap_or(defaults.log_filter),
			otlp_endpoint: file.otlp_endpoint.filter(|s| !s.trim().is_empty()),
			auth_hmac_secret: file
				.auth_hmac_secret
				.filter(|s| !s.trim().is_empty())
				.map(SecretString::new)
				.unwrap_or(defaults.auth_hmac_secret),
			im_base_url: file.im_base_url.filter(|s| !s.trim().is_empty()).unwrap_or(defaults.im_base_url),
			im_api_key: file.im_api_key.filter(|s| !s.trim().is_empty()).map(SecretString::new).unwrap_or(defaults.im_api_key),
			rtc_base_url: file.rtc_base_url.filter(|s| !s.trim().is_empty()).unwrap_or(defaults.rtc_base_url),
			rtc_api_key: file.rtc_api_key.filter(|s| !s.trim().is_empty()).map(SecretString::new).unwrap_or(defaults.rtc_api_key),
			tls_cert_path: file.tls_cert_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
			tls_key_path: file.tls_key_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
			timeouts: Timeouts {
				authorize_timeout: file
					.authorize_timeout_ms
					.map(Duration::from_millis)
					.unwrap_or(default_timeouts.authorize_timeout),
				ping_interval: file
					.ping_interval_secs
					.map(Duration::from_secs)
					.unwrap_or(default_timeouts.ping_interval),
				pong_timeout: file
					.pong_timeout_secs
					.map(Duration::from_secs)
					.unwrap_or(default_timeouts.pong_timeout),
				pk_request_timeout: file
					.pk_request_timeout_secs
					.map(Duration::from_secs)
					.unwrap_or(default_timeouts.pk_request_timeout),
				rtc_room_token_ttl: file
					.rtc_room_token_ttl_secs
					.map(Duration::from_secs)
					.unwrap_or(default_timeouts.rtc_room_token_ttl),
			},
			max_rooms: file.max_rooms.unwrap_or(defaults.max_rooms),
			rate_limit: RateLimitSettings {
				per_connection_burst: file
					.rate_limit_per_connection_burst
					.unwrap_or(default_rates.per_connection_burst),
				per_connection_per_minute: file
					.rate_limit_per_connection_per_minute
					.unwrap_or(default_rates.per_connection_per_minute),
				per_pair_burst: file.rate_limit_per_pair_burst.unwrap_or(default_rates.per_pair_burst),
				per_pair_per_minute: file
					.rate_limit_per_pair_per_minute
					.unwrap_or(default_rates.per_pair_per_minute),
			},
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match std::fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

macro_rules! env_override_string {
	($cfg_field:expr, $env_var:literal, $label:literal) => {
		if let Ok(v) = std::env::var($env_var) {
			let v = v.trim().to_string();
			if !v.is_empty() {
				$cfg_field = v;
				info!(concat!($label, " overridden by env"));
			}
		}
	};
}

macro_rules! env_override_parsed {
	($cfg_field:expr, $env_var:literal, $label:literal, $parse:ty) => {
		if let Ok(v) = std::env::var($env_var)
			&& let Ok(parsed) = v.trim().parse::<$parse>()
		{
			$cfg_field = parsed;
			info!(value = ?parsed, concat!($label, " overridden by env"));
		}
	};
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	env_override_string!(cfg.bind, "PAIRLIVE_BIND", "bind");
	env_override_string!(cfg.health_bind, "PAIRLIVE_HEALTH_BIND", "health_bind");
	env_override_string!(cfg.metrics_bind, "PAIRLIVE_METRICS_BIND", "metrics_bind");
	env_override_string!(cfg.database_url, "PAIRLIVE_DATABASE_URL", "database_url");
	env_override_string!(cfg.log_filter, "PAIRLIVE_LOG_FILTER", "log_filter");

	if let Ok(v) = std::env::var("PAIRLIVE_OTLP_ENDPOINT") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.otlp_endpoint = Some(v);
			info!("otlp_endpoint overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PAIRLIVE_AUTH_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.auth_hmac_secret = SecretString::new(v);
			info!("auth_hmac_secret overridden by env");
		}
	}

	env_override_string!(cfg.im_base_url, "PAIRLIVE_IM_BASE_URL", "im_base_url");
	env_override_string!(cfg.rtc_base_url, "PAIRLIVE_RTC_BASE_URL", "rtc_base_url");

	if let Ok(v) = std::env::var("PAIRLIVE_IM_API_KEY") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.im_api_key = SecretString::new(v);
			info!("im_api_key overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PAIRLIVE_RTC_API_KEY") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.rtc_api_key = SecretString::new(v);
			info!("rtc_api_key overridden by env");
		}
	}

	env_override_parsed!(
		cfg.max_rooms,
		"PAIRLIVE_MAX_ROOMS",
		"max_rooms",
		u32
	);

	if let Ok(v) = std::env::var("PAIRLIVE_AUTHORIZE_TIMEOUT_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.timeouts.authorize_timeout = Duration::from_millis(ms);
		info!(ms, "authorize_timeout_ms overridden by env");
	}

	if let Ok(v) = std::env::var("PAIRLIVE_PING_INTERVAL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.timeouts.ping_interval = Duration::from_secs(secs);
		info!(secs, "ping_interval_secs overridden by env");
	}

	if let Ok(v) = std::env::var("PAIRLIVE_PONG_TIMEOUT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.timeouts.pong_timeout = Duration::from_secs(secs);
		info!(secs, "pong_timeout_secs overridden by env");
	}

	if let Ok(v) = std::env::var("PAIRLIVE_PK_REQUEST_TIMEOUT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.timeouts.pk_request_timeout = Duration::from_secs(secs);
		info!(secs, "pk_request_timeout_secs overridden by env");
	}

	if let Ok(v) = std::env::var("PAIRLIVE_RTC_ROOM_TOKEN_TTL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.timeouts.rtc_room_token_ttl = Duration::from_secs(secs);
		info!(secs, "rtc_room_token_ttl_secs overridden by env");
	}
}
