#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context;
use streambot_domain::{BroadcasterId, ChannelName, StreamInfo};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::eventsub::{self, SessionEnd, SessionHandler, run_session};
use super::{HelixClient, TwitchContext};
use crate::{StreamApi, StreamEvent, StreamEventSource, StreamSubscription};

const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(15);
const STREAM_EVENT_QUEUE: usize = 32;

/// Helix-backed stream queries.
#[derive(Clone)]
pub struct TwitchStreamApi {
	ctx: TwitchContext,
}

impl TwitchStreamApi {
	pub fn new(ctx: TwitchContext) -> Self {
		Self { ctx }
	}
}

#[async_trait::async_trait]
impl StreamApi for TwitchStreamApi {
	async fn resolve_broadcaster(&self, channel: &ChannelName) -> anyhow::Result<Option<BroadcasterId>> {
		let helix = self.ctx.helix()?;
		let user = helix.get_user_by_login(channel.as_str()).await?;
		user.map(|u| BroadcasterId::new(u.id).context("broadcaster id from helix user"))
			.transpose()
	}

	async fn fetch_stream(&self, broadcaster: &BroadcasterId) -> anyhow::Result<Option<StreamInfo>> {
		let helix = self.ctx.helix()?;
		let Some(stream) = helix.get_stream(broadcaster.as_str()).await? else {
			return Ok(None);
		};

		let started_at = match stream.started_at.as_deref() {
			Some(ts) => match eventsub::parse_timestamp(ts) {
				Ok(t) => Some(t),
				Err(e) => {
					warn!(error = ?e, %broadcaster, "unparseable stream started_at");
					None
				}
			},
			None => None,
		};

		Ok(Some(StreamInfo {
			title: stream.title,
			game: Some(stream.game_name).filter(|g| !g.trim().is_empty()),
			viewers: Some(stream.viewer_count),
			started_at,
		}))
	}
}

/// `stream.online` / `stream.offline` over a dedicated EventSub session.
#[derive(Clone)]
pub struct TwitchStreamEvents {
	ctx: TwitchContext,
}

impl TwitchStreamEvents {
	pub fn new(ctx: TwitchContext) -> Self {
		Self { ctx }
	}
}

struct StreamHandler {
	helix: HelixClient,
	broadcaster: BroadcasterId,
	tx: mpsc::Sender<StreamEvent>,
	ready: Option<oneshot::Sender<anyhow::Result<()>>>,
	subscription_ids: Vec<String>,
}

#[async_trait::async_trait]
impl SessionHandler for StreamHandler {
	async fn on_welcome(&mut self, session_id: &str) -> anyhow::Result<()> {
		let broadcaster = self.broadcaster.as_str();
		let online = self
			.helix
			.create_stream_online_subscription(session_id, broadcaster)
			.await?;
		let offline = self
			.helix
			.create_stream_offline_subscription(session_id, broadcaster)
			.await?;

		for sub in [&online, &offline] {
			debug!(subscription_id = %sub.id, kind = %sub.kind, %broadcaster, "eventsub subscription created");
		}
		self.subscription_ids = vec![online.id, offline.id];

		if let Some(ready) = self.ready.take() {
			let _ = ready.send(Ok(()));
		}
		Ok(())
	}

	async fn on_notification(&mut self, subscription_type: &str, raw_json: &str) {
		let event = match subscription_type {
			"stream.online" => match eventsub::parse_stream_online(raw_json) {
				Ok(online) => {
					if online.kind != "live" {
						debug!(kind = %online.kind, "ignoring non-live stream.online");
						return;
					}
					let started_at = online
						.started_at
						.as_deref()
						.and_then(|ts| eventsub::parse_timestamp(ts).ok());
					StreamEvent::Online { started_at }
				}
				Err(e) => {
					warn!(error = ?e, "failed to parse stream.online");
					return;
				}
			},
			"stream.offline" => match eventsub::parse_stream_offline(raw_json) {
				Ok(_) => StreamEvent::Offline,
				Err(e) => {
					warn!(error = ?e, "failed to parse stream.offline");
					return;
				}
			},
			other => {
				debug!(subscription_type = other, "unexpected notification on stream session");
				return;
			}
		};

		if self.tx.send(event).await.is_err() {
			debug!("stream subscription receiver dropped");
		}
	}
}

#[async_trait::async_trait]
impl StreamEventSource for TwitchStreamEvents {
	async fn subscribe(&self, broadcaster: &BroadcasterId) -> anyhow::Result<StreamSubscription> {
		let helix = self.ctx.helix()?;
		let url = self.ctx.eventsub_url()?;
		let connector = self.ctx.ws_connector();

		let (tx, rx) = mpsc::channel(STREAM_EVENT_QUEUE);
		let (ready_tx, ready_rx) = oneshot::channel();
		let cancel = CancellationToken::new();

		let mut handler = StreamHandler {
			helix,
			broadcaster: broadcaster.clone(),
			tx: tx.clone(),
			ready: Some(ready_tx),
			subscription_ids: Vec::new(),
		};

		let task_cancel = cancel.clone();
		tokio::spawn(async move {
			let end = run_session(&connector, url, &mut handler, &task_cancel).await;

			let reason = match end {
				Ok(SessionEnd::Cancelled) => {
					for id in handler.subscription_ids.drain(..) {
						if let Err(e) = handler.helix.delete_subscription(&id).await {
							debug!(error = ?e, subscription_id = %id, "failed to delete stream subscription");
						}
					}
					return;
				}
				Ok(SessionEnd::Closed(reason)) => reason,
				Err(e) => format!("{e:#}"),
			};

			if let Some(ready) = handler.ready.take() {
				let _ = ready.send(Err(anyhow::anyhow!(reason)));
				return;
			}

			info!(broadcaster = %handler.broadcaster, %reason, "stream event session dropped");
			let _ = tx.send(StreamEvent::Dropped { reason }).await;
		});

		match tokio::time::timeout(SUBSCRIBE_TIMEOUT, ready_rx).await {
			Ok(Ok(Ok(()))) => Ok(StreamSubscription::new(rx, Some(cancel.drop_guard()))),
			Ok(Ok(Err(e))) => Err(e.context("subscribe to stream events")),
			Ok(Err(_)) => anyhow::bail!("stream event session ended before subscribing"),
			Err(_) => {
				cancel.cancel();
				anyhow::bail!("timed out subscribing to stream events");
			}
		}
	}
}
