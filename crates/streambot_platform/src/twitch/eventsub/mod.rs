#![forbid(unsafe_code)]

mod session;

use std::collections::HashSet;
use std::time::SystemTime;

use anyhow::Context;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use streambot_domain::{ChannelName, ChatMessage, Decoration, DecorationKind, UserRef};

pub(crate) use session::{SessionEnd, SessionHandler, run_session};

/// `metadata` object carried by every EventSub WebSocket frame.
#[derive(Debug, Deserialize)]
pub(crate) struct Metadata {
	pub(crate) message_type: String,
	#[serde(default)]
	pub(crate) message_timestamp: Option<String>,
	#[serde(default)]
	pub(crate) subscription_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MetadataOnly {
	metadata: Metadata,
}

#[derive(Debug, Deserialize)]
struct Frame<P> {
	metadata: Metadata,
	payload: P,
}

#[derive(Debug, Deserialize)]
struct SessionPayload {
	session: EventSubSession,
}

#[derive(Debug, Deserialize)]
struct EventPayload<E> {
	event: E,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubSession {
	pub(crate) id: String,
	#[serde(default)]
	pub(crate) keepalive_timeout_seconds: Option<u64>,
	#[serde(default)]
	pub(crate) reconnect_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessageEvent {
	broadcaster_user_login: String,
	chatter_user_id: String,
	chatter_user_login: String,
	chatter_user_name: String,
	message_id: String,
	message: ChatMessageBody,
	#[serde(default)]
	badges: Vec<ChatBadge>,
}

#[derive(Debug, Deserialize)]
struct ChatBadge {
	set_id: String,
	id: String,
}

#[derive(Debug, Deserialize)]
struct ChatMessageBody {
	text: String,
	#[serde(default)]
	fragments: Vec<Fragment>,
}

#[derive(Debug, Deserialize)]
struct Fragment {
	#[serde(rename = "type")]
	kind: String,
	text: String,
	#[serde(default)]
	emote: Option<FragmentEmote>,
}

#[derive(Debug, Deserialize)]
struct FragmentEmote {
	id: String,
}

/// `stream.online` event body. `kind` is `live` for real broadcasts.
#[derive(Debug, Deserialize)]
pub(crate) struct StreamOnline {
	#[serde(rename = "type", default)]
	pub(crate) kind: String,
	#[serde(default)]
	pub(crate) started_at: Option<String>,
}

/// `stream.offline` carries nothing the bot needs beyond its arrival.
#[derive(Debug, Deserialize)]
pub(crate) struct StreamOffline {}

pub(crate) fn peek(raw_json: &str) -> anyhow::Result<Metadata> {
	let frame: MetadataOnly = serde_json::from_str(raw_json).context("parse eventsub metadata")?;
	Ok(frame.metadata)
}

/// Session object of a `session_welcome` or `session_reconnect` frame.
pub(crate) fn parse_session(raw_json: &str) -> anyhow::Result<EventSubSession> {
	let frame: Frame<SessionPayload> = serde_json::from_str(raw_json).context("parse eventsub session frame")?;
	Ok(frame.payload.session)
}

fn parse_event<E: DeserializeOwned>(raw_json: &str, kind: &'static str) -> anyhow::Result<(Metadata, E)> {
	let frame: Frame<EventPayload<E>> =
		serde_json::from_str(raw_json).with_context(|| format!("parse {kind} notification"))?;
	Ok((frame.metadata, frame.payload.event))
}

pub(crate) fn parse_stream_online(raw_json: &str) -> anyhow::Result<StreamOnline> {
	parse_event(raw_json, "stream.online").map(|(_, ev)| ev)
}

pub(crate) fn parse_stream_offline(raw_json: &str) -> anyhow::Result<StreamOffline> {
	parse_event(raw_json, "stream.offline").map(|(_, ev)| ev)
}

/// Convert an EventSub RFC3339 timestamp into `SystemTime`.
pub(crate) fn parse_timestamp(ts: &str) -> anyhow::Result<SystemTime> {
	let dt = chrono::DateTime::parse_from_rfc3339(ts).context("parse EventSub RFC3339 timestamp")?;
	Ok(SystemTime::from(dt.with_timezone(&chrono::Utc)))
}

/// Normalize a `channel.chat.message` notification into a `ChatMessage`.
pub(crate) fn normalize_chat_message(raw_json: &str) -> anyhow::Result<ChatMessage> {
	let (metadata, event) = parse_event::<ChatMessageEvent>(raw_json, "channel.chat.message")?;

	let timestamp = match metadata.message_timestamp.as_deref() {
		Some(ts) => parse_timestamp(ts)?,
		None => SystemTime::now(),
	};
	let channel = ChannelName::new(&event.broadcaster_user_login).context("channel from broadcaster_user_login")?;
	let emotes = emotes_from_fragments(&event.message.fragments);

	Ok(ChatMessage {
		id: event.message_id,
		channel,
		author: UserRef {
			id: event.chatter_user_id,
			login: event.chatter_user_login,
			display: Some(event.chatter_user_name).filter(|s| !s.trim().is_empty()),
		},
		text: event.message.text,
		badges: event
			.badges
			.into_iter()
			.map(|badge| format!("{}:{}", badge.set_id, badge.id))
			.collect(),
		emotes,
		timestamp,
	})
}

/// One decoration per distinct emote id, in order of first use.
fn emotes_from_fragments(fragments: &[Fragment]) -> Vec<Decoration> {
	let mut seen = HashSet::new();
	fragments
		.iter()
		.filter(|f| f.kind == "emote")
		.filter_map(|f| f.emote.as_ref().map(|e| (f, e)))
		.filter(|(_, e)| seen.insert(e.id.as_str()))
		.map(|(f, e)| Decoration {
			kind: DecorationKind::Emote,
			id: e.id.clone(),
			name: f.text.clone(),
			image_url: format!("https://static-cdn.jtvnw.net/emoticons/v2/{}/default/dark/1.0", e.id),
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	const CHAT: &str = r#"{
		"metadata": {
			"message_id": "ws-1",
			"message_type": "notification",
			"message_timestamp": "2024-05-01T12:00:00.123456789Z",
			"subscription_type": "channel.chat.message",
			"subscription_version": "1"
		},
		"payload": {
			"subscription": {"id": "sub-1", "status": "enabled", "type": "channel.chat.message", "version": "1", "condition": {}, "created_at": "2024-05-01T11:00:00Z"},
			"event": {
				"broadcaster_user_id": "42",
				"broadcaster_user_login": "test",
				"broadcaster_user_name": "Test",
				"chatter_user_id": "7",
				"chatter_user_login": "viewer",
				"chatter_user_name": "Viewer",
				"message_id": "msg-1",
				"message": {
					"text": "hello Kappa Kappa",
					"fragments": [
						{"type": "text", "text": "hello "},
						{"type": "emote", "text": "Kappa", "emote": {"id": "25"}},
						{"type": "emote", "text": "Kappa", "emote": {"id": "25"}}
					]
				},
				"badges": [{"set_id": "moderator", "id": "1", "info": ""}]
			}
		}
	}"#;

	#[test]
	fn normalizes_chat_notification() {
		let meta = peek(CHAT).unwrap();
		assert_eq!(meta.message_type, "notification");
		assert_eq!(meta.subscription_type.as_deref(), Some("channel.chat.message"));

		let msg = normalize_chat_message(CHAT).unwrap();
		assert_eq!(msg.id, "msg-1");
		assert_eq!(msg.channel.as_str(), "test");
		assert_eq!(msg.author.display_name(), "Viewer");
		assert_eq!(msg.badges, vec!["moderator:1".to_string()]);
		assert!(msg.is_moderator());
		assert_eq!(msg.emotes.len(), 1, "duplicate emotes collapse");
		assert_eq!(msg.emotes[0].name, "Kappa");
	}

	#[test]
	fn parses_welcome_session() {
		let raw = r#"{"metadata":{"message_id":"1","message_type":"session_welcome","message_timestamp":"2024-05-01T12:00:00Z"},"payload":{"session":{"id":"sess-1","status":"connected","connected_at":"2024-05-01T12:00:00Z","keepalive_timeout_seconds":10,"reconnect_url":null}}}"#;
		let session = parse_session(raw).unwrap();
		assert_eq!(session.id, "sess-1");
		assert_eq!(session.keepalive_timeout_seconds, Some(10));
		assert!(session.reconnect_url.is_none());
	}

	#[test]
	fn parses_stream_online() {
		let raw = r#"{"metadata":{"message_id":"2","message_type":"notification","message_timestamp":"2024-05-01T12:00:00Z","subscription_type":"stream.online"},"payload":{"subscription":{"id":"s"},"event":{"id":"9","broadcaster_user_id":"42","broadcaster_user_login":"test","broadcaster_user_name":"Test","type":"live","started_at":"2024-05-01T11:59:58Z"}}}"#;
		let online = parse_stream_online(raw).unwrap();
		assert_eq!(online.kind, "live");
		let started = parse_timestamp(online.started_at.as_deref().unwrap()).unwrap();
		assert!(started < parse_timestamp("2024-05-01T12:00:00Z").unwrap());
	}
}
