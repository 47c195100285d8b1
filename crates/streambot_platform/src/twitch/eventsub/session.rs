#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::time::{Instant, sleep};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::{EventSubSession, parse_session, peek};
use crate::twitch::{TwitchWs, WsConnector};

const DEFAULT_KEEPALIVE_SECS: u64 = 10;
const KEEPALIVE_GRACE: Duration = Duration::from_secs(5);

/// How a single EventSub session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionEnd {
	Cancelled,
	Closed(String),
}

/// Callbacks driven by `run_session`.
#[async_trait::async_trait]
pub(crate) trait SessionHandler: Send {
	/// Called once per session, before any notification; subscriptions are created here.
	async fn on_welcome(&mut self, session_id: &str) -> anyhow::Result<()>;

	async fn on_notification(&mut self, subscription_type: &str, raw_json: &str);
}

fn keepalive_timeout(secs: Option<u64>) -> Duration {
	Duration::from_secs(secs.unwrap_or(DEFAULT_KEEPALIVE_SECS)) + KEEPALIVE_GRACE
}

async fn read_until_welcome(ws: &mut TwitchWs) -> anyhow::Result<EventSubSession> {
	loop {
		let Some(msg) = ws.next().await else {
			return Err(anyhow::anyhow!("ws closed before welcome"));
		};
		let msg = msg.context("ws read")?;

		match msg {
			Message::Text(t) => {
				let meta = peek(&t)?;
				if meta.message_type == "session_welcome" {
					return parse_session(&t);
				}
			}
			Message::Ping(p) => {
				let _ = ws.send(Message::Pong(p)).await;
			}
			Message::Close(c) => {
				anyhow::bail!("ws closed before welcome: close={c:?}");
			}
			_ => {}
		}
	}
}

async fn migrate(
	connector: &WsConnector,
	reconnect_url: &str,
	cancel: &CancellationToken,
) -> anyhow::Result<Option<(TwitchWs, EventSubSession)>> {
	let url = Url::parse(reconnect_url).context("parse reconnect_url")?;
	tokio::select! {
		_ = cancel.cancelled() => Ok(None),
		res = async {
			let mut ws = connector(url).await?;
			let welcome = read_until_welcome(&mut ws).await?;
			anyhow::Ok((ws, welcome))
		} => res.map(Some),
	}
}

/// Runs one EventSub WebSocket session until it closes, fails or is cancelled.
///
/// `session_reconnect` is followed transparently: existing subscriptions carry
/// over, so `on_welcome` is not called again for the migrated socket.
pub(crate) async fn run_session<H: SessionHandler>(
	connector: &WsConnector,
	url: Url,
	handler: &mut H,
	cancel: &CancellationToken,
) -> anyhow::Result<SessionEnd> {
	let mut ws = tokio::select! {
		_ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
		ws = connector(url) => ws?,
	};

	let welcome = tokio::select! {
		_ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
		w = read_until_welcome(&mut ws) => w?,
	};

	let mut session_id = welcome.id;
	let mut keepalive = keepalive_timeout(welcome.keepalive_timeout_seconds);
	info!(%session_id, keepalive_secs = keepalive.as_secs(), "eventsub session welcomed");

	handler.on_welcome(&session_id).await.context("eventsub session setup")?;

	let mut last_activity = Instant::now();

	loop {
		tokio::select! {
			_ = cancel.cancelled() => {
				let _ = ws.close(None).await;
				return Ok(SessionEnd::Cancelled);
			}

			msg = ws.next() => {
				let Some(msg) = msg else {
					return Ok(SessionEnd::Closed("eventsub ws ended".to_string()));
				};

				let msg = match msg {
					Ok(m) => m,
					Err(e) => return Ok(SessionEnd::Closed(format!("eventsub ws read error: {e}"))),
				};

				last_activity = Instant::now();

				match msg {
					Message::Text(t) => {
						let meta = match peek(&t) {
							Ok(m) => m,
							Err(e) => {
								warn!(error = ?e, "unparseable eventsub message");
								continue;
							}
						};

						match meta.message_type.as_str() {
							"session_keepalive" => {
								debug!(%session_id, "eventsub keepalive");
							}
							"notification" => {
								if let Some(kind) = meta.subscription_type.as_deref() {
									handler.on_notification(kind, &t).await;
								}
							}
							"session_reconnect" => {
								let reconnect_url = match parse_session(&t) {
									Ok(EventSubSession { reconnect_url: Some(url), .. }) => url,
									Ok(_) => return Ok(SessionEnd::Closed("session_reconnect without reconnect_url".to_string())),
									Err(e) => return Ok(SessionEnd::Closed(format!("bad session_reconnect: {e:#}"))),
								};

								info!(%session_id, "received session_reconnect; migrating");
								match migrate(connector, &reconnect_url, cancel).await {
									Ok(Some((new_ws, welcome))) => {
										let _ = ws.close(None).await;
										ws = new_ws;
										session_id = welcome.id;
										keepalive = keepalive_timeout(welcome.keepalive_timeout_seconds);
										last_activity = Instant::now();
										info!(%session_id, "eventsub migration complete");
									}
									Ok(None) => return Ok(SessionEnd::Cancelled),
									Err(e) => return Ok(SessionEnd::Closed(format!("eventsub migration failed: {e:#}"))),
								}
							}
							"revocation" => {
								warn!(%session_id, subscription_type = ?meta.subscription_type, "eventsub subscription revoked");
								return Ok(SessionEnd::Closed("subscription revoked".to_string()));
							}
							other => {
								debug!(message_type = other, "ignoring eventsub message");
							}
						}
					}

					Message::Ping(p) => {
						let _ = ws.send(Message::Pong(p)).await;
					}

					Message::Close(frame) => {
						return Ok(SessionEnd::Closed(format!("eventsub ws closed: {frame:?}")));
					}

					_ => {}
				}
			}

			_ = sleep(keepalive) => {
				if last_activity.elapsed() > keepalive {
					return Ok(SessionEnd::Closed("keepalive watchdog triggered".to_string()));
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use tokio::net::TcpListener;

	use super::*;
	use crate::twitch::BoxFuture;

	#[derive(Default)]
	struct Recorder {
		welcomed: Vec<String>,
		notifications: Vec<(String, String)>,
	}

	#[async_trait::async_trait]
	impl SessionHandler for Recorder {
		async fn on_welcome(&mut self, session_id: &str) -> anyhow::Result<()> {
			self.welcomed.push(session_id.to_string());
			Ok(())
		}

		async fn on_notification(&mut self, subscription_type: &str, raw_json: &str) {
			self.notifications
				.push((subscription_type.to_string(), raw_json.to_string()));
		}
	}

	fn connector() -> WsConnector {
		Arc::new(|url: Url| {
			Box::pin(async move {
				let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
				Ok(ws)
			}) as BoxFuture<'static, anyhow::Result<TwitchWs>>
		})
	}

	fn welcome(id: &str) -> String {
		format!(
			r#"{{"metadata":{{"message_id":"w-{id}","message_type":"session_welcome","message_timestamp":"2024-05-01T12:00:00Z"}},"payload":{{"session":{{"id":"{id}","status":"connected","connected_at":"2024-05-01T12:00:00Z","keepalive_timeout_seconds":10,"reconnect_url":null}}}}}}"#
		)
	}

	fn notification(kind: &str) -> String {
		format!(
			r#"{{"metadata":{{"message_id":"n1","message_type":"notification","message_timestamp":"2024-05-01T12:00:01Z","subscription_type":"{kind}"}},"payload":{{"subscription":{{"id":"s"}},"event":{{"broadcaster_user_id":"42"}}}}}}"#
		)
	}

	fn reconnect(url: &Url) -> String {
		format!(
			r#"{{"metadata":{{"message_id":"r1","message_type":"session_reconnect","message_timestamp":"2024-05-01T12:00:02Z"}},"payload":{{"session":{{"id":"s1","status":"reconnecting","connected_at":"2024-05-01T12:00:00Z","keepalive_timeout_seconds":null,"reconnect_url":"{url}"}}}}}}"#
		)
	}

	/// Serves one connection: sends `messages`, then closes or waits for the peer.
	async fn serve_once(messages: Vec<String>, close_after: bool) -> Url {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			let (stream, _) = listener.accept().await.unwrap();
			let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
			for m in messages {
				ws.send(Message::text(m)).await.unwrap();
			}
			if close_after {
				let _ = ws.close(None).await;
			}
			while let Some(Ok(_)) = ws.next().await {}
		});
		Url::parse(&format!("ws://{addr}/ws")).unwrap()
	}

	#[tokio::test]
	async fn delivers_notifications_after_welcome() {
		let url = serve_once(vec![welcome("s1"), notification("stream.online")], true).await;
		let mut handler = Recorder::default();
		let cancel = CancellationToken::new();

		let end = run_session(&connector(), url, &mut handler, &cancel).await.unwrap();

		assert!(matches!(end, SessionEnd::Closed(_)), "unexpected end: {end:?}");
		assert_eq!(handler.welcomed, vec!["s1".to_string()]);
		assert_eq!(handler.notifications.len(), 1);
		assert_eq!(handler.notifications[0].0, "stream.online");
	}

	#[tokio::test]
	async fn follows_session_reconnect_without_resubscribing() {
		let second = serve_once(vec![welcome("s2"), notification("stream.offline")], true).await;
		let first = serve_once(vec![welcome("s1"), reconnect(&second)], false).await;

		let mut handler = Recorder::default();
		let cancel = CancellationToken::new();
		let end = tokio::time::timeout(
			Duration::from_secs(5),
			run_session(&connector(), first, &mut handler, &cancel),
		)
		.await
		.expect("session should end")
		.unwrap();

		assert!(matches!(end, SessionEnd::Closed(_)));
		assert_eq!(handler.welcomed, vec!["s1".to_string()]);
		assert_eq!(handler.notifications.len(), 1);
		assert_eq!(handler.notifications[0].0, "stream.offline");
	}

	#[tokio::test]
	async fn cancellation_ends_session() {
		let url = serve_once(vec![welcome("s1")], false).await;
		let mut handler = Recorder::default();
		let cancel = CancellationToken::new();

		let trigger = cancel.clone();
		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(50)).await;
			trigger.cancel();
		});

		let end = run_session(&connector(), url, &mut handler, &cancel).await.unwrap();
		assert_eq!(end, SessionEnd::Cancelled);
	}
}
