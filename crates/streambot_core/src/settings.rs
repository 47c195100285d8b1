#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use streambot_domain::ChannelName;

pub const MIN_BROADCAST_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastSettings {
	pub interval_minutes: u64,
	/// Supports `{counter}`, `{title}`, `{game}` and `{viewers}`.
	pub template: String,
	/// Start broadcasting when the stream goes online.
	pub auto_start: bool,
}

impl BroadcastSettings {
	pub fn interval(&self) -> Duration {
		Duration::from_secs(self.interval_minutes.saturating_mul(60)).max(MIN_BROADCAST_INTERVAL)
	}
}

impl Default for BroadcastSettings {
	fn default() -> Self {
		Self {
			interval_minutes: 15,
			template: String::new(),
			auto_start: false,
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NotificationSettings {
	pub stream_started_enabled: bool,
	pub stream_started_text: String,
	pub stream_stopped_enabled: bool,
	pub stream_stopped_text: String,
	/// Appended to the farewell when the bot disconnects.
	pub disconnect_message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AudienceSettings {
	pub welcome_enabled: bool,
	/// `{user}` is replaced with the chatter's display name.
	pub welcome_text: String,
	pub farewell_enabled: bool,
	/// `{users}` is replaced with everyone seen this session.
	pub farewell_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandSettings {
	pub prefix: String,
	pub cooldown_secs: u64,
	/// Trigger (without prefix) to response text.
	pub custom: BTreeMap<String, String>,
}

impl CommandSettings {
	pub fn cooldown(&self) -> Duration {
		Duration::from_secs(self.cooldown_secs)
	}
}

impl Default for CommandSettings {
	fn default() -> Self {
		Self {
			prefix: "!".to_string(),
			cooldown_secs: 5,
			custom: BTreeMap::new(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverlaySettings {
	pub history_max: usize,
	pub show_badges: bool,
	pub show_emotes: bool,
}

impl Default for OverlaySettings {
	fn default() -> Self {
		Self {
			history_max: 200,
			show_badges: true,
			show_emotes: true,
		}
	}
}

/// Runtime configuration consumed by the core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BotSettings {
	pub bot_username: String,
	pub channel: Option<ChannelName>,
	pub client_id: String,
	pub broadcast: BroadcastSettings,
	pub notifications: NotificationSettings,
	pub audience: AudienceSettings,
	pub commands: CommandSettings,
	pub overlay: OverlaySettings,
}

/// Process-wide settings handle.
#[derive(Debug, Clone, Default)]
pub struct SharedSettings(Arc<RwLock<BotSettings>>);

impl SharedSettings {
	pub fn new(settings: BotSettings) -> Self {
		Self(Arc::new(RwLock::new(settings)))
	}

	pub fn snapshot(&self) -> BotSettings {
		self.0.read().clone()
	}

	pub fn read<R>(&self, f: impl FnOnce(&BotSettings) -> R) -> R {
		f(&self.0.read())
	}

	/// Applies `f` and returns the resulting settings.
	pub fn update(&self, f: impl FnOnce(&mut BotSettings)) -> BotSettings {
		let mut guard = self.0.write();
		f(&mut guard);
		guard.clone()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn interval_is_clamped_to_one_minute() {
		let mut b = BroadcastSettings::default();
		b.interval_minutes = 0;
		assert_eq!(b.interval(), MIN_BROADCAST_INTERVAL);
		b.interval_minutes = 10;
		assert_eq!(b.interval(), Duration::from_secs(600));
	}

	#[test]
	fn update_returns_new_snapshot() {
		let shared = SharedSettings::default();
		let after = shared.update(|s| s.overlay.history_max = 5);
		assert_eq!(after.overlay.history_max, 5);
		assert_eq!(shared.read(|s| s.overlay.history_max), 5);
	}
}
