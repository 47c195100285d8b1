#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use streambot_core::settings::{
	AudienceSettings, BotSettings, BroadcastSettings, CommandSettings, NotificationSettings, OverlaySettings,
};
use streambot_domain::ChannelName;
use streambot_platform::SecretString;
use tracing::{info, warn};

const DEFAULT_OVERLAY_BIND: &str = "127.0.0.1:17563";

/// Default config path: `~/.streambot/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	Ok(default_storage_dir()?.join("config.toml"))
}

fn default_storage_dir() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".streambot"))
}

/// Reads TOML (a missing file means defaults) and applies `STREAMBOT_*` env overrides.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<AppConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = AppConfig::from_file(file_cfg)?;
	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct AppConfig {
	pub twitch: TwitchSettings,
	pub bot: BotSettings,
	pub server: ServerSettings,
	pub storage: StorageSettings,
}

#[derive(Debug, Clone, Default)]
pub struct TwitchSettings {
	pub client_id: Option<String>,
	pub client_secret: Option<SecretString>,
	pub redirect_uri: Option<String>,
	/// Empty means the platform defaults.
	pub scopes: Vec<String>,
	pub eventsub_ws_url: Option<String>,
	pub helix_base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// OAuth callback, overlay feed and control endpoints (host:port).
	pub overlay_bind: String,
	/// Optional Prometheus exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Connect on startup instead of waiting for a control request.
	pub auto_connect: bool,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
	pub dir: PathBuf,
}

impl StorageSettings {
	pub fn token_path(&self) -> PathBuf {
		self.dir.join("token.json")
	}

	pub fn statistics_path(&self) -> PathBuf {
		self.dir.join("statistics.json")
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	twitch: FileTwitchSettings,

	#[serde(default)]
	broadcast: FileBroadcastSettings,

	#[serde(default)]
	notifications: FileNotificationSettings,

	#[serde(default)]
	audience: FileAudienceSettings,

	#[serde(default)]
	commands: FileCommandSettings,

	#[serde(default)]
	overlay: FileOverlaySettings,

	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	storage: FileStorageSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTwitchSettings {
	client_id: Option<String>,
	client_secret: Option<String>,
	redirect_uri: Option<String>,
	#[serde(default)]
	scopes: Vec<String>,
	bot_username: Option<String>,
	channel: Option<String>,
	eventsub_ws_url: Option<String>,
	helix_base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBroadcastSettings {
	interval_minutes: Option<u64>,
	template: Option<String>,
	auto_start: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileNotificationSettings {
	stream_started_enabled: Option<bool>,
	stream_started_text: Option<String>,
	stream_stopped_enabled: Option<bool>,
	stream_stopped_text: Option<String>,
	disconnect_message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAudienceSettings {
	welcome_enabled: Option<bool>,
	welcome_text: Option<String>,
	farewell_enabled: Option<bool>,
	farewell_text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileCommandSettings {
	prefix: Option<String>,
	cooldown_secs: Option<u64>,
	#[serde(default)]
	custom: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileOverlaySettings {
	history_max: Option<usize>,
	show_badges: Option<bool>,
	show_emotes: Option<bool>,
	bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	auto_connect: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileStorageSettings {
	dir: Option<String>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_channel(raw: &str) -> Option<ChannelName> {
	match ChannelName::new(raw) {
		Ok(c) => Some(c),
		Err(e) => {
			warn!(error = %e, channel = %raw, "ignoring invalid channel name");
			None
		}
	}
}

impl AppConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let broadcast_defaults = BroadcastSettings::default();
		let command_defaults = CommandSettings::default();
		let overlay_defaults = OverlaySettings::default();

		let bot = BotSettings {
			bot_username: non_empty(file.twitch.bot_username).unwrap_or_default(),
			channel: non_empty(file.twitch.channel).and_then(|c| parse_channel(&c)),
			client_id: non_empty(file.twitch.client_id.clone()).unwrap_or_default(),
			broadcast: BroadcastSettings {
				interval_minutes: file
					.broadcast
					.interval_minutes
					.unwrap_or(broadcast_defaults.interval_minutes),
				template: file.broadcast.template.unwrap_or_default(),
				auto_start: file.broadcast.auto_start.unwrap_or(false),
			},
			notifications: NotificationSettings {
				stream_started_enabled: file.notifications.stream_started_enabled.unwrap_or(false),
				stream_started_text: file.notifications.stream_started_text.unwrap_or_default(),
				stream_stopped_enabled: file.notifications.stream_stopped_enabled.unwrap_or(false),
				stream_stopped_text: file.notifications.stream_stopped_text.unwrap_or_default(),
				disconnect_message: file.notifications.disconnect_message.unwrap_or_default(),
			},
			audience: AudienceSettings {
				welcome_enabled: file.audience.welcome_enabled.unwrap_or(false),
				welcome_text: file.audience.welcome_text.unwrap_or_default(),
				farewell_enabled: file.audience.farewell_enabled.unwrap_or(false),
				farewell_text: file.audience.farewell_text.unwrap_or_default(),
			},
			commands: CommandSettings {
				prefix: non_empty(file.commands.prefix).unwrap_or(command_defaults.prefix),
				cooldown_secs: file.commands.cooldown_secs.unwrap_or(command_defaults.cooldown_secs),
				custom: file.commands.custom,
			},
			overlay: OverlaySettings {
				history_max: file
					.overlay
					.history_max
					.filter(|v| *v > 0)
					.unwrap_or(overlay_defaults.history_max),
				show_badges: file.overlay.show_badges.unwrap_or(overlay_defaults.show_badges),
				show_emotes: file.overlay.show_emotes.unwrap_or(overlay_defaults.show_emotes),
			},
		};

		let storage_dir = match non_empty(file.storage.dir) {
			Some(dir) => PathBuf::from(dir),
			None => default_storage_dir()?,
		};

		Ok(Self {
			twitch: TwitchSettings {
				client_id: non_empty(file.twitch.client_id),
				client_secret: non_empty(file.twitch.client_secret).map(SecretString::new),
				redirect_uri: non_empty(file.twitch.redirect_uri),
				scopes: file.twitch.scopes,
				eventsub_ws_url: non_empty(file.twitch.eventsub_ws_url),
				helix_base_url: non_empty(file.twitch.helix_base_url),
			},
			bot,
			server: ServerSettings {
				overlay_bind: non_empty(file.overlay.bind).unwrap_or_else(|| DEFAULT_OVERLAY_BIND.to_string()),
				metrics_bind: non_empty(file.server.metrics_bind),
				auto_connect: file.server.auto_connect.unwrap_or(false),
			},
			storage: StorageSettings { dir: storage_dir },
		})
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

fn apply_env_overrides(cfg: &mut AppConfig, env: impl Fn(&str) -> Option<String>) {
	let var = |key: &str| non_empty(env(key));

	if let Some(v) = var("STREAMBOT_TWITCH_CLIENT_ID") {
		cfg.bot.client_id = v.clone();
		cfg.twitch.client_id = Some(v);
		info!("twitch config: client_id overridden by env");
	}

	if let Some(v) = var("STREAMBOT_TWITCH_CLIENT_SECRET") {
		cfg.twitch.client_secret = Some(SecretString::new(v));
		info!("twitch config: client_secret overridden by env");
	}

	if let Some(v) = var("STREAMBOT_TWITCH_EVENTSUB_WS_URL") {
		cfg.twitch.eventsub_ws_url = Some(v);
		info!("twitch config: eventsub_ws_url overridden by env");
	}

	if let Some(v) = var("STREAMBOT_BOT_USERNAME") {
		cfg.bot.bot_username = v;
		info!("bot config: bot_username overridden by env");
	}

	if let Some(v) = var("STREAMBOT_CHANNEL")
		&& let Some(channel) = parse_channel(&v)
	{
		info!(%channel, "bot config: channel overridden by env");
		cfg.bot.channel = Some(channel);
	}

	if let Some(v) = var("STREAMBOT_BROADCAST_AUTO_START")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.bot.broadcast.auto_start = enabled;
		info!(enabled, "broadcast config: auto_start overridden by env");
	}

	if let Some(v) = var("STREAMBOT_OVERLAY_BIND") {
		cfg.server.overlay_bind = v;
		info!("server config: overlay_bind overridden by env");
	}

	if let Some(v) = var("STREAMBOT_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = var("STREAMBOT_AUTO_CONNECT")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.server.auto_connect = enabled;
		info!(enabled, "server config: auto_connect overridden by env");
	}

	if let Some(v) = var("STREAMBOT_STORAGE_DIR") {
		cfg.storage.dir = PathBuf::from(v);
		info!("storage config: dir overridden by env");
	}

	if cfg.twitch.client_id.is_none() {
		warn!("twitch config: no client_id configured; connecting will fail");
	}
	if cfg.bot.channel.is_none() {
		warn!("bot config: no channel configured");
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn parse(toml_src: &str) -> AppConfig {
		let file: FileConfig = toml::from_str(toml_src).expect("valid toml");
		AppConfig::from_file(file).expect("config")
	}

	#[test]
	fn empty_file_yields_defaults() {
		let cfg = parse("");
		assert_eq!(cfg.bot.broadcast.interval_minutes, 15);
		assert_eq!(cfg.bot.commands.prefix, "!");
		assert_eq!(cfg.bot.overlay.history_max, 200);
		assert_eq!(cfg.server.overlay_bind, DEFAULT_OVERLAY_BIND);
		assert!(cfg.bot.channel.is_none());
		assert!(!cfg.server.auto_connect);
	}

	#[test]
	fn sections_map_onto_bot_settings() {
		let cfg = parse(
			r##"
			[twitch]
			client_id = " abc "
			client_secret = "shh"
			channel = "#SomeStreamer"
			bot_username = "helperbot"

			[broadcast]
			interval_minutes = 20
			template = "Follow! #{counter}"
			auto_start = true

			[commands]
			prefix = "?"
			custom = { discord = "https://discord.example" }

			[overlay]
			history_max = 0
			bind = "0.0.0.0:8080"

			[storage]
			dir = "/tmp/streambot-test"
			"##,
		);

		assert_eq!(cfg.twitch.client_id.as_deref(), Some("abc"));
		assert_eq!(cfg.bot.client_id, "abc");
		assert_eq!(cfg.twitch.client_secret.as_ref().map(|s| s.expose()), Some("shh"));
		assert_eq!(cfg.bot.channel.as_ref().map(|c| c.as_str()), Some("somestreamer"));
		assert_eq!(cfg.bot.bot_username, "helperbot");
		assert_eq!(cfg.bot.broadcast.interval_minutes, 20);
		assert!(cfg.bot.broadcast.auto_start);
		assert_eq!(cfg.bot.commands.prefix, "?");
		assert_eq!(cfg.bot.commands.custom.get("discord").map(String::as_str), Some("https://discord.example"));
		assert_eq!(cfg.bot.overlay.history_max, 200, "zero falls back to the default");
		assert_eq!(cfg.server.overlay_bind, "0.0.0.0:8080");
		assert_eq!(cfg.storage.token_path(), PathBuf::from("/tmp/streambot-test/token.json"));
	}

	#[test]
	fn env_overrides_win_and_blank_values_are_ignored() {
		let mut cfg = parse("[twitch]\nclient_id = \"file\"\n");
		let env: HashMap<&str, &str> = HashMap::from([
			("STREAMBOT_TWITCH_CLIENT_ID", "env"),
			("STREAMBOT_CHANNEL", "OtherChannel"),
			("STREAMBOT_AUTO_CONNECT", "yes"),
			("STREAMBOT_METRICS_BIND", "   "),
			("STREAMBOT_BROADCAST_AUTO_START", "maybe"),
		]);

		apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

		assert_eq!(cfg.bot.client_id, "env");
		assert_eq!(cfg.twitch.client_id.as_deref(), Some("env"));
		assert_eq!(cfg.bot.channel.as_ref().map(|c| c.as_str()), Some("otherchannel"));
		assert!(cfg.server.auto_connect);
		assert!(cfg.server.metrics_bind.is_none());
		assert!(!cfg.bot.broadcast.auto_start);
	}

	#[test]
	fn env_bools_accept_common_spellings() {
		assert_eq!(parse_env_bool(" ON "), Some(true));
		assert_eq!(parse_env_bool("0"), Some(false));
		assert_eq!(parse_env_bool("nope"), None);
	}
}
