#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::SecretString;

const EVENTSUB_SUBSCRIPTIONS_PATH: &str = "/helix/eventsub/subscriptions";
const CHAT_MESSAGES_PATH: &str = "/helix/chat/messages";
const USERS_PATH: &str = "/helix/users";
const STREAMS_PATH: &str = "/helix/streams";
const GLOBAL_BADGES_PATH: &str = "/helix/chat/badges/global";
const CHANNEL_BADGES_PATH: &str = "/helix/chat/badges";

const SERVER_ERROR_RETRY_DELAY: Duration = Duration::from_millis(250);

/// `Retry-After` seconds, else the `Ratelimit-Reset` epoch relative to now.
fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	let header = |name: &str| headers.get(name)?.to_str().ok()?.trim().parse::<u64>().ok();

	if let Some(secs) = header(RETRY_AFTER.as_str()) {
		return Some(Duration::from_secs(secs));
	}

	let reset_at = header("Ratelimit-Reset")?;
	let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
	(reset_at > now).then(|| Duration::from_secs(reset_at - now))
}

/// Sends once and retries a single time on 429 (honouring the reset
/// headers) or a 5xx. 401/403 become errors recognised by [`is_auth_error`].
async fn send_with_retry(req: reqwest::RequestBuilder, label: &'static str) -> anyhow::Result<reqwest::Response> {
	let retry = req.try_clone();
	let resp = req.send().await.with_context(|| format!("helix {label}: send"))?;
	let status = resp.status();

	if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
		let body = resp.text().await.unwrap_or_default();
		anyhow::bail!("helix auth failed on {label} (status={status}) body={body}");
	}

	let delay = if status == StatusCode::TOO_MANY_REQUESTS {
		retry_delay_from_headers(resp.headers())
	} else if status.is_server_error() {
		Some(SERVER_ERROR_RETRY_DELAY)
	} else {
		None
	};

	match (delay, retry) {
		(Some(delay), Some(retry)) => {
			tracing::debug!(%status, ?delay, label, "helix request retried");
			tokio::time::sleep(delay).await;
			retry.send().await.with_context(|| format!("helix {label}: retry send"))
		}
		_ => Ok(resp),
	}
}

/// Whether an error chain came from a rejected bearer token.
pub(crate) fn is_auth_error(err: &anyhow::Error) -> bool {
	format!("{err:#}").contains("helix auth failed")
}

/// Authenticated Helix REST calls for one bearer token.
#[derive(Clone, Debug)]
pub(crate) struct HelixClient {
	http: reqwest::Client,
	base_url: Url,
	client_id: String,
	bearer_token: SecretString,
}

#[derive(Debug, Serialize)]
struct BroadcasterCondition<'a> {
	broadcaster_user_id: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatCondition<'a> {
	broadcaster_user_id: &'a str,
	user_id: &'a str,
}

#[derive(Debug, Serialize)]
struct SendChatBody<'a> {
	broadcaster_id: &'a str,
	sender_id: &'a str,
	message: &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	reply_parent_message_id: Option<&'a str>,
}

impl HelixClient {
	pub(crate) fn new(http: reqwest::Client, base_url: Url, client_id: String, bearer_token: SecretString) -> Self {
		Self {
			http,
			base_url,
			client_id,
			bearer_token,
		}
	}

	fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		req.header("Client-Id", &self.client_id)
			.bearer_auth(self.bearer_token.expose())
	}

	fn url(&self, path_and_query: &str) -> anyhow::Result<Url> {
		self.base_url
			.join(path_and_query)
			.with_context(|| format!("join helix url {path_and_query}"))
	}

	async fn subscribe<C: Serialize>(
		&self,
		kind: &'static str,
		session_id: &str,
		condition: C,
	) -> anyhow::Result<HelixSubscription> {
		let body = SubscriptionRequest {
			kind,
			version: "1",
			condition,
			transport: WebsocketTransport {
				method: "websocket",
				session_id,
			},
		};
		let resp = send_with_retry(
			self.authed(self.http.post(self.url(EVENTSUB_SUBSCRIPTIONS_PATH)?)).json(&body),
			"create subscription",
		)
		.await?;

		let status = resp.status();
		let text = resp
			.text()
			.await
			.with_context(|| format!("helix create subscription {kind}: read body"))?;
		if !status.is_success() {
			anyhow::bail!("helix create subscription {kind} failed: status={status} body={text}");
		}

		let parsed: Data<HelixSubscription> =
			serde_json::from_str(&text).with_context(|| format!("helix create subscription {kind}: parse json"))?;
		parsed
			.data
			.into_iter()
			.next()
			.with_context(|| format!("helix create subscription {kind} returned no data"))
	}

	pub(crate) async fn create_chat_message_subscription(
		&self,
		session_id: &str,
		broadcaster_user_id: &str,
		user_id: &str,
	) -> anyhow::Result<HelixSubscription> {
		let condition = ChatCondition {
			broadcaster_user_id,
			user_id,
		};
		self.subscribe("channel.chat.message", session_id, condition).await
	}

	pub(crate) async fn create_stream_online_subscription(
		&self,
		session_id: &str,
		broadcaster_user_id: &str,
	) -> anyhow::Result<HelixSubscription> {
		self.subscribe("stream.online", session_id, BroadcasterCondition { broadcaster_user_id })
			.await
	}

	pub(crate) async fn create_stream_offline_subscription(
		&self,
		session_id: &str,
		broadcaster_user_id: &str,
	) -> anyhow::Result<HelixSubscription> {
		self.subscribe("stream.offline", session_id, BroadcasterCondition { broadcaster_user_id })
			.await
	}

	pub(crate) async fn delete_subscription(&self, subscription_id: &str) -> anyhow::Result<()> {
		let path = format!("{EVENTSUB_SUBSCRIPTIONS_PATH}?id={}", urlencoding::encode(subscription_id));
		let resp = send_with_retry(self.authed(self.http.delete(self.url(&path)?)), "DELETE subscription").await?;

		let status = resp.status();
		if status.is_success() {
			return Ok(());
		}
		let body = resp.text().await.unwrap_or_default();
		anyhow::bail!("helix delete subscription {subscription_id} failed: status={status} body={body}");
	}

	/// GETs `path` and decodes the `data` array of the response.
	async fn get_data<T: DeserializeOwned>(&self, path: &str, label: &'static str) -> anyhow::Result<Vec<T>> {
		let resp = send_with_retry(self.authed(self.http.get(self.url(path)?)), label).await?;

		let status = resp.status();
		let body = resp
			.text()
			.await
			.with_context(|| format!("helix {label}: read body"))?;
		if !status.is_success() {
			anyhow::bail!("helix {label} failed: status={status} body={body}");
		}

		let parsed: Data<T> = serde_json::from_str(&body).with_context(|| format!("helix {label}: parse json"))?;
		Ok(parsed.data)
	}

	pub(crate) async fn get_user_by_login(&self, login: &str) -> anyhow::Result<Option<HelixUser>> {
		let users = self
			.get_data::<HelixUser>(&format!("{USERS_PATH}?login={}", urlencoding::encode(login)), "users by login")
			.await?;
		Ok(users.into_iter().next())
	}

	/// The account the bearer token was issued to.
	pub(crate) async fn get_token_user(&self) -> anyhow::Result<HelixUser> {
		self.get_data::<HelixUser>(USERS_PATH, "token user")
			.await?
			.into_iter()
			.next()
			.context("helix token user lookup returned no user")
	}

	/// Current live stream of `user_id`, `None` when offline.
	pub(crate) async fn get_stream(&self, user_id: &str) -> anyhow::Result<Option<HelixStream>> {
		let streams = self
			.get_data::<HelixStream>(&format!("{STREAMS_PATH}?user_id={}", urlencoding::encode(user_id)), "streams")
			.await?;
		Ok(streams.into_iter().find(|s| s.kind == "live"))
	}

	pub(crate) async fn send_chat_message(
		&self,
		broadcaster_id: &str,
		sender_id: &str,
		message: &str,
		reply_to: Option<&str>,
	) -> anyhow::Result<()> {
		let body = SendChatBody {
			broadcaster_id,
			sender_id,
			message,
			reply_parent_message_id: reply_to,
		};
		let resp = send_with_retry(
			self.authed(self.http.post(self.url(CHAT_MESSAGES_PATH)?)).json(&body),
			"send chat",
		)
		.await?;

		let status = resp.status();
		let text = resp.text().await.unwrap_or_default();
		if !status.is_success() {
			anyhow::bail!("helix send chat failed: status={status} body={text}");
		}

		// Twitch answers 200 with `is_sent: false` when automod or a rate limit drops the message.
		if let Ok(parsed) = serde_json::from_str::<Data<SendChatResult>>(&text)
			&& let Some(result) = parsed.data.into_iter().next()
			&& !result.is_sent
		{
			let reason = result.drop_reason.map(|r| r.message).unwrap_or_default();
			anyhow::bail!("helix send chat dropped: {reason}");
		}

		Ok(())
	}

	pub(crate) async fn get_global_badges(&self) -> anyhow::Result<Vec<HelixBadgeSet>> {
		self.get_data(GLOBAL_BADGES_PATH, "global badges").await
	}

	pub(crate) async fn get_channel_badges(&self, broadcaster_id: &str) -> anyhow::Result<Vec<HelixBadgeSet>> {
		let path = format!("{CHANNEL_BADGES_PATH}?broadcaster_id={}", urlencoding::encode(broadcaster_id));
		self.get_data(&path, "channel badges").await
	}
}

/// Helix wraps every list in `{"data": [...]}`.
#[derive(Debug, Deserialize)]
struct Data<T> {
	data: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HelixUser {
	pub(crate) id: String,
	pub(crate) login: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HelixStream {
	#[serde(rename = "type", default)]
	pub(crate) kind: String,
	#[serde(default)]
	pub(crate) title: String,
	#[serde(default)]
	pub(crate) game_name: String,
	#[serde(default)]
	pub(crate) viewer_count: u64,
	#[serde(default)]
	pub(crate) started_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendChatResult {
	is_sent: bool,
	#[serde(default)]
	drop_reason: Option<DropReason>,
}

#[derive(Debug, Deserialize)]
struct DropReason {
	message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HelixBadgeSet {
	pub(crate) set_id: String,
	pub(crate) versions: Vec<HelixBadgeVersion>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HelixBadgeVersion {
	pub(crate) id: String,
	#[serde(default)]
	pub(crate) title: Option<String>,
	pub(crate) image_url_1x: String,
}

#[derive(Debug, Serialize)]
struct SubscriptionRequest<'a, C> {
	#[serde(rename = "type")]
	kind: &'static str,
	version: &'static str,
	condition: C,
	transport: WebsocketTransport<'a>,
}

#[derive(Debug, Serialize)]
struct WebsocketTransport<'a> {
	method: &'static str,
	session_id: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HelixSubscription {
	pub(crate) id: String,
	#[serde(rename = "type")]
	pub(crate) kind: String,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn live_stream_is_picked_from_the_data_envelope() {
		let raw = r#"{"data":[{"id":"1","user_id":"42","user_login":"test","type":"live","title":"Coding","game_name":"Software and Game Development","viewer_count":12,"started_at":"2024-01-01T10:00:00Z"}],"pagination":{}}"#;
		let parsed: Data<HelixStream> = serde_json::from_str(raw).expect("parse");
		let stream = parsed.data.into_iter().find(|s| s.kind == "live").expect("live stream");
		assert_eq!(stream.title, "Coding");
		assert_eq!(stream.viewer_count, 12);
		assert_eq!(stream.started_at.as_deref(), Some("2024-01-01T10:00:00Z"));
	}

	#[test]
	fn subscription_request_shape() {
		let body = SubscriptionRequest {
			kind: "stream.online",
			version: "1",
			condition: BroadcasterCondition {
				broadcaster_user_id: "42",
			},
			transport: WebsocketTransport {
				method: "websocket",
				session_id: "s1",
			},
		};
		assert_eq!(
			serde_json::to_value(&body).expect("json"),
			serde_json::json!({
				"type": "stream.online",
				"version": "1",
				"condition": { "broadcaster_user_id": "42" },
				"transport": { "method": "websocket", "session_id": "s1" },
			})
		);
	}

	#[test]
	fn retry_after_header_is_honored() {
		let mut headers = HeaderMap::new();
		headers.insert(RETRY_AFTER, "3".parse().expect("header"));
		assert_eq!(retry_delay_from_headers(&headers), Some(Duration::from_secs(3)));
		assert_eq!(retry_delay_from_headers(&HeaderMap::new()), None);

		let mut past = HeaderMap::new();
		past.insert("Ratelimit-Reset", "1".parse().expect("header"));
		assert_eq!(retry_delay_from_headers(&past), None);
	}

	#[test]
	fn detects_auth_errors() {
		let err = anyhow::anyhow!("helix auth failed on token user (status=401) body=").context("validate");
		assert!(is_auth_error(&err));
		assert!(!is_auth_error(&anyhow::anyhow!("boom")));
	}
}
