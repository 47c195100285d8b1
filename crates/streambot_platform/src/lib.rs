#![forbid(unsafe_code)]

mod browser;
pub mod twitch;

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime};

use streambot_domain::{BroadcasterId, ChannelName, ChatMessage, Decoration, StreamInfo};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::DropGuard;
use url::Url;

pub use browser::SystemBrowser;

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.trim().is_empty()
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

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<<S as serde::Serializer>::Ok, <S as serde::Serializer>::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

/// User OAuth token pair.
#[derive(Debug, Clone)]
pub struct OAuthToken {
	pub access_token: SecretString,
	pub refresh_token: Option<SecretString>,
	pub expires_at: Option<SystemTime>,
	pub scopes: Vec<String>,
}

impl OAuthToken {
	pub fn new(access_token: SecretString) -> Self {
		Self {
			access_token,
			refresh_token: None,
			expires_at: None,
			scopes: Vec::new(),
		}
	}

	pub fn with_expires_in(mut self, expires_in: Duration) -> Self {
		self.expires_at = SystemTime::now().checked_add(expires_in);
		self
	}
}

/// Remote validation result for an access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenValidity {
	Valid {
		login: String,
		user_id: String,
		expires_in: Duration,
	},
	Invalid,
}

/// OAuth endpoints of the chat platform.
#[async_trait::async_trait]
pub trait OAuthClient: Send + Sync {
	/// Authorization page URL carrying the anti-CSRF `state`.
	fn authorize_url(&self, state: &str) -> anyhow::Result<Url>;

	async fn validate(&self, access_token: &SecretString) -> anyhow::Result<TokenValidity>;

	async fn refresh(&self, refresh_token: &SecretString) -> anyhow::Result<OAuthToken>;

	async fn exchange_code(&self, code: &str) -> anyhow::Result<OAuthToken>;
}

/// Durable token storage.
#[async_trait::async_trait]
pub trait TokenStore: Send + Sync {
	async fn load(&self) -> anyhow::Result<Option<OAuthToken>>;

	/// Persist access and refresh token in one write.
	async fn save(&self, token: &OAuthToken) -> anyhow::Result<()>;

	async fn clear(&self) -> anyhow::Result<()>;
}

/// Opens URLs in the user's browser.
pub trait BrowserLauncher: Send + Sync {
	fn open(&self, url: &Url) -> anyhow::Result<()>;
}

/// Outbound chat messages.
#[async_trait::async_trait]
pub trait Messenger: Send + Sync {
	async fn send(&self, channel: &ChannelName, text: &str) -> anyhow::Result<()>;

	/// Threaded reply to `parent_message_id`.
	async fn reply(&self, channel: &ChannelName, parent_message_id: &str, text: &str) -> anyhow::Result<()>;
}

/// Credentials handed to the chat transport after token acquisition.
#[derive(Debug, Clone)]
pub struct ChatCredentials {
	pub client_id: String,
	pub access_token: SecretString,
	pub bot_login: String,
}

/// Events emitted by a chat transport.
#[derive(Debug, Clone)]
pub enum ChatTransportEvent {
	Log(String),
	Connected,
	Joined(ChannelName),
	Message(Box<ChatMessage>),
	Disconnected { reason: String },
}

/// Persistent chat connection.
#[async_trait::async_trait]
pub trait ChatTransport: Send + Sync {
	fn set_credentials(&self, credentials: ChatCredentials);

	/// Starts connecting; confirmation is observed through `is_connected`.
	async fn connect(&self, channel: &ChannelName) -> anyhow::Result<()>;

	async fn disconnect(&self) -> anyhow::Result<()>;

	fn is_connected(&self) -> bool;

	fn subscribe(&self) -> broadcast::Receiver<ChatTransportEvent>;
}

/// Push notifications about a broadcaster's live state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
	Online { started_at: Option<SystemTime> },
	Offline,
	Dropped { reason: String },
}

/// Receiving end of a stream event subscription; dropping it closes the subscription.
pub struct StreamSubscription {
	rx: mpsc::Receiver<StreamEvent>,
	_guard: Option<DropGuard>,
}

impl StreamSubscription {
	pub fn new(rx: mpsc::Receiver<StreamEvent>, guard: Option<DropGuard>) -> Self {
		Self { rx, _guard: guard }
	}

	/// Next event; `None` once the underlying session is gone.
	pub async fn next(&mut self) -> Option<StreamEvent> {
		self.rx.recv().await
	}
}

impl fmt::Debug for StreamSubscription {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("StreamSubscription").finish_non_exhaustive()
	}
}

#[async_trait::async_trait]
pub trait StreamEventSource: Send + Sync {
	async fn subscribe(&self, broadcaster: &BroadcasterId) -> anyhow::Result<StreamSubscription>;
}

/// Authoritative stream queries.
#[async_trait::async_trait]
pub trait StreamApi: Send + Sync {
	async fn resolve_broadcaster(&self, channel: &ChannelName) -> anyhow::Result<Option<BroadcasterId>>;

	/// `None` when the broadcaster is offline.
	async fn fetch_stream(&self, broadcaster: &BroadcasterId) -> anyhow::Result<Option<StreamInfo>>;
}

/// Badge images keyed by `set_id:version`.
#[derive(Debug, Clone, Default)]
pub struct DecorationSet {
	pub badges: HashMap<String, Decoration>,
}

impl DecorationSet {
	pub fn resolve_badges<'a>(&'a self, keys: &'a [String]) -> impl Iterator<Item = &'a Decoration> + 'a {
		keys.iter().filter_map(|k| self.badges.get(k))
	}

	pub fn len(&self) -> usize {
		self.badges.len()
	}

	pub fn is_empty(&self) -> bool {
		self.badges.is_empty()
	}
}

#[async_trait::async_trait]
pub trait DecorationSource: Send + Sync {
	async fn load(&self, channel: &ChannelName) -> anyhow::Result<DecorationSet>;
}
