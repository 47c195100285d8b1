#![forbid(unsafe_code)]

mod badges;
mod chat;
mod eventsub;
mod helix;
mod messenger;
mod oauth;
mod stream;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::RwLock;
use url::Url;

use crate::SecretString;

pub use badges::TwitchDecorations;
pub use chat::TwitchChat;
pub use messenger::TwitchMessenger;
pub use oauth::TwitchOAuth;
pub use stream::{TwitchStreamApi, TwitchStreamEvents};

pub(crate) use helix::HelixClient;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type TwitchWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<TwitchWs>> + Send + Sync>;

/// Twitch integration configuration.
#[derive(Clone)]
pub struct TwitchConfig {
	pub client_id: String,
	pub client_secret: Option<SecretString>,
	pub redirect_uri: String,
	pub scopes: Vec<String>,
	pub eventsub_ws_url: String,
	pub helix_base_url: String,
	pub id_base_url: String,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
	/// Minimum spacing between outbound chat messages.
	pub send_spacing: Duration,
	pub ws_connector: Option<WsConnector>,
}

impl TwitchConfig {
	pub fn new(client_id: impl Into<String>) -> Self {
		Self {
			client_id: client_id.into(),
			client_secret: None,
			redirect_uri: "http://localhost:17563/oauth/callback".to_string(),
			scopes: vec![
				"user:read:chat".to_string(),
				"user:write:chat".to_string(),
				"user:bot".to_string(),
			],
			eventsub_ws_url: "wss://eventsub.wss.twitch.tv/ws".to_string(),
			helix_base_url: "https://api.twitch.tv".to_string(),
			id_base_url: "https://id.twitch.tv".to_string(),
			reconnect_min_delay: Duration::from_millis(500),
			reconnect_max_delay: Duration::from_secs(30),
			send_spacing: Duration::from_millis(1500),
			ws_connector: None,
		}
	}
}

/// Bearer credentials shared by every Twitch component.
#[derive(Debug, Clone)]
pub struct TwitchCredentials {
	pub client_id: String,
	pub access_token: SecretString,
}

/// Shared handle to the Twitch HTTP client, configuration and current credentials.
#[derive(Clone)]
pub struct TwitchContext {
	cfg: Arc<TwitchConfig>,
	http: reqwest::Client,
	credentials: Arc<RwLock<Option<TwitchCredentials>>>,
}

impl TwitchContext {
	pub fn new(cfg: TwitchConfig) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("streambot/0.x (helix)")
			.build()
			.context("build reqwest client")?;

		Ok(Self {
			cfg: Arc::new(cfg),
			http,
			credentials: Arc::new(RwLock::new(None)),
		})
	}

	pub fn config(&self) -> &TwitchConfig {
		&self.cfg
	}

	pub(crate) fn http(&self) -> &reqwest::Client {
		&self.http
	}

	pub fn set_credentials(&self, credentials: TwitchCredentials) {
		*self.credentials.write() = Some(credentials);
	}

	pub fn clear_credentials(&self) {
		*self.credentials.write() = None;
	}

	pub fn credentials(&self) -> Option<TwitchCredentials> {
		self.credentials.read().clone()
	}

	pub(crate) fn helix(&self) -> anyhow::Result<HelixClient> {
		let Some(creds) = self.credentials() else {
			anyhow::bail!("twitch credentials not set");
		};
		let base_url = Url::parse(&self.cfg.helix_base_url).context("parse helix_base_url")?;
		Ok(HelixClient::new(
			self.http.clone(),
			base_url,
			creds.client_id,
			creds.access_token,
		))
	}

	pub(crate) fn eventsub_url(&self) -> anyhow::Result<Url> {
		Url::parse(&self.cfg.eventsub_ws_url).context("parse eventsub ws url")
	}

	pub(crate) fn ws_connector(&self) -> WsConnector {
		if let Some(c) = &self.cfg.ws_connector {
			return c.clone();
		}

		Arc::new(|url: Url| Box::pin(async move { connect_eventsub_ws(url).await }) as BoxFuture<'static, anyhow::Result<TwitchWs>>)
	}

	pub fn oauth(&self) -> TwitchOAuth {
		TwitchOAuth::new(self.clone())
	}

	pub fn chat(&self) -> TwitchChat {
		TwitchChat::new(self.clone())
	}

	/// Spawns the rate-limited send queue; requires a tokio runtime.
	pub fn messenger(&self) -> TwitchMessenger {
		TwitchMessenger::spawn(self.clone())
	}

	pub fn stream_api(&self) -> TwitchStreamApi {
		TwitchStreamApi::new(self.clone())
	}

	pub fn stream_events(&self) -> TwitchStreamEvents {
		TwitchStreamEvents::new(self.clone())
	}

	pub fn decorations(&self) -> TwitchDecorations {
		TwitchDecorations::new(self.clone())
	}
}

async fn connect_eventsub_ws(url: Url) -> anyhow::Result<TwitchWs> {
	let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
		.await
		.context("connect_async to eventsub ws")?;
	Ok(ws)
}

pub(crate) fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
	let pow = attempt.min(16);
	let ms = min.as_millis().saturating_mul(1u128 << pow);
	let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
	d.min(max).max(min)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn backoff_grows_and_caps() {
		let min = Duration::from_millis(500);
		let max = Duration::from_secs(30);
		assert_eq!(backoff_delay(0, min, max), min);
		assert_eq!(backoff_delay(1, min, max), Duration::from_secs(1));
		assert_eq!(backoff_delay(3, min, max), Duration::from_secs(4));
		assert_eq!(backoff_delay(12, min, max), max);
	}

	#[test]
	fn helix_requires_credentials() {
		let ctx = TwitchContext::new(TwitchConfig::new("cid")).unwrap();
		assert!(ctx.helix().is_err());

		ctx.set_credentials(TwitchCredentials {
			client_id: "cid".to_string(),
			access_token: SecretString::new("tok"),
		});
		assert!(ctx.helix().is_ok());
	}
}
