#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Twitch channel login, normalized to lowercase without a leading `#`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelName(String);

impl ChannelName {
	pub fn new(name: impl AsRef<str>) -> Result<Self, ParseIdError> {
		let name = name.as_ref().trim();
		let name = name.strip_prefix('#').unwrap_or(name).trim();
		if name.is_empty() {
			return Err(ParseIdError::Empty);
		}

		if let Some(bad) = name.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '_')) {
			return Err(ParseIdError::InvalidFormat(format!(
				"unexpected character {bad:?} in channel name"
			)));
		}

		Ok(Self(name.to_ascii_lowercase()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for ChannelName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelName {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelName::new(s)
	}
}

impl TryFrom<String> for ChannelName {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		ChannelName::new(value)
	}
}

impl From<ChannelName> for String {
	fn from(value: ChannelName) -> Self {
		value.0
	}
}

/// Platform user id of a channel owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BroadcasterId(String);

impl BroadcasterId {
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for BroadcasterId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Bot session connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
	#[default]
	Idle,
	Connecting,
	Connected,
	Disconnecting,
}

impl ConnectionState {
	pub const fn as_str(self) -> &'static str {
		match self {
			ConnectionState::Idle => "idle",
			ConnectionState::Connecting => "connecting",
			ConnectionState::Connected => "connected",
			ConnectionState::Disconnecting => "disconnecting",
		}
	}
}

impl fmt::Display for ConnectionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Live state of a channel as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
	#[default]
	Unknown,
	Online,
	Offline,
}

impl StreamStatus {
	pub const fn as_str(self) -> &'static str {
		match self {
			StreamStatus::Unknown => "unknown",
			StreamStatus::Online => "online",
			StreamStatus::Offline => "offline",
		}
	}
}

impl fmt::Display for StreamStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Metadata of a live stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
	pub title: String,
	pub game: Option<String>,
	pub viewers: Option<u64>,
	pub started_at: Option<SystemTime>,
}

/// Chat user reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserRef {
	pub id: String,
	pub login: String,
	pub display: Option<String>,
}

impl UserRef {
	/// Display name, falling back to the login.
	pub fn display_name(&self) -> &str {
		self.display.as_deref().filter(|d| !d.trim().is_empty()).unwrap_or(&self.login)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecorationKind {
	Badge,
	Emote,
}

/// Image attached to a chat message (badge or emote).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decoration {
	pub kind: DecorationKind,
	pub id: String,
	pub name: String,
	pub image_url: String,
}

/// Incoming chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
	pub id: String,
	pub channel: ChannelName,
	pub author: UserRef,
	pub text: String,

	/// Badge keys in `set_id:version` form.
	#[serde(default)]
	pub badges: Vec<String>,
	#[serde(default)]
	pub emotes: Vec<Decoration>,

	pub timestamp: SystemTime,
}

impl ChatMessage {
	pub fn has_badge_set(&self, set_id: &str) -> bool {
		self.badges
			.iter()
			.any(|b| b.split_once(':').map(|(set, _)| set).unwrap_or(b) == set_id)
	}

	pub fn is_broadcaster(&self) -> bool {
		self.has_badge_set("broadcaster") || self.author.login == self.channel.as_str()
	}

	pub fn is_moderator(&self) -> bool {
		self.has_badge_set("moderator")
	}
}
