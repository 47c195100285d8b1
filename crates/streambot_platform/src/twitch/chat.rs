#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use streambot_domain::ChannelName;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::eventsub::{self, SessionEnd, SessionHandler, run_session};
use super::helix::is_auth_error;
use super::{HelixClient, TwitchContext, TwitchCredentials, backoff_delay};
use crate::{ChatCredentials, ChatTransport, ChatTransportEvent};

const CHAT_EVENT_CAPACITY: usize = 1024;

/// EventSub-backed chat connection for one channel.
pub struct TwitchChat {
	ctx: TwitchContext,
	events: broadcast::Sender<ChatTransportEvent>,
	connected: Arc<AtomicBool>,
	run: Mutex<Option<ChatRun>>,
}

struct ChatRun {
	cancel: CancellationToken,
	task: JoinHandle<()>,
}

impl TwitchChat {
	pub fn new(ctx: TwitchContext) -> Self {
		let (events, _) = broadcast::channel(CHAT_EVENT_CAPACITY);
		Self {
			ctx,
			events,
			connected: Arc::new(AtomicBool::new(false)),
			run: Mutex::new(None),
		}
	}
}

struct ChatHandler {
	helix: HelixClient,
	channel: ChannelName,
	broadcaster_id: String,
	bot_user_id: String,
	events: broadcast::Sender<ChatTransportEvent>,
	connected: Arc<AtomicBool>,
	welcomed: bool,
}

impl ChatHandler {
	fn log(&self, line: impl Into<String>) {
		let _ = self.events.send(ChatTransportEvent::Log(line.into()));
	}
}

#[async_trait::async_trait]
impl SessionHandler for ChatHandler {
	async fn on_welcome(&mut self, session_id: &str) -> anyhow::Result<()> {
		let sub = self
			.helix
			.create_chat_message_subscription(session_id, &self.broadcaster_id, &self.bot_user_id)
			.await?;
		debug!(subscription_id = %sub.id, channel = %self.channel, "chat subscription created");

		self.welcomed = true;
		self.connected.store(true, Ordering::SeqCst);
		let _ = self.events.send(ChatTransportEvent::Connected);
		let _ = self.events.send(ChatTransportEvent::Joined(self.channel.clone()));
		self.log(format!("joined #{}", self.channel));
		Ok(())
	}

	async fn on_notification(&mut self, subscription_type: &str, raw_json: &str) {
		if subscription_type != "channel.chat.message" {
			return;
		}

		match eventsub::normalize_chat_message(raw_json) {
			Ok(msg) => {
				metrics::counter!("streambot_chat_messages_received_total").increment(1);
				let _ = self.events.send(ChatTransportEvent::Message(Box::new(msg)));
			}
			Err(e) => {
				warn!(error = ?e, "failed to normalize chat message");
			}
		}
	}
}

async fn resolve_ids(ctx: &TwitchContext, channel: &ChannelName) -> anyhow::Result<(HelixClient, String, String)> {
	let helix = ctx.helix()?;
	let broadcaster = helix
		.get_user_by_login(channel.as_str())
		.await?
		.ok_or_else(|| anyhow::anyhow!("channel not found: {channel}"))?;
	let bot = helix.get_token_user().await?;
	debug!(channel = %channel, bot_login = %bot.login, "resolved chat identities");
	Ok((helix, broadcaster.id, bot.id))
}

async fn run_chat(
	ctx: TwitchContext,
	channel: ChannelName,
	events: broadcast::Sender<ChatTransportEvent>,
	connected: Arc<AtomicBool>,
	cancel: CancellationToken,
) {
	let cfg = ctx.config().clone();
	let connector = ctx.ws_connector();
	let mut attempt: u32 = 0;

	loop {
		if attempt > 0 {
			let delay = backoff_delay(attempt, cfg.reconnect_min_delay, cfg.reconnect_max_delay);
			let _ = events.send(ChatTransportEvent::Log(format!(
				"reconnecting chat in {delay:?} (attempt={attempt})"
			)));
			tokio::select! {
				_ = cancel.cancelled() => break,
				_ = sleep(delay) => {}
			}
		}

		let (helix, broadcaster_id, bot_user_id) = match resolve_ids(&ctx, &channel).await {
			Ok(ids) => ids,
			Err(e) => {
				if is_auth_error(&e) {
					warn!(error = ?e, "chat credentials rejected");
				}
				let _ = events.send(ChatTransportEvent::Log(format!("chat setup failed: {e:#}")));
				attempt = attempt.saturating_add(1);
				continue;
			}
		};

		let url = match ctx.eventsub_url() {
			Ok(u) => u,
			Err(e) => {
				warn!(error = ?e, "invalid eventsub url; chat stopped");
				break;
			}
		};

		let mut handler = ChatHandler {
			helix,
			channel: channel.clone(),
			broadcaster_id,
			bot_user_id,
			events: events.clone(),
			connected: connected.clone(),
			welcomed: false,
		};

		let end = run_session(&connector, url, &mut handler, &cancel).await;
		connected.store(false, Ordering::SeqCst);

		let reason = match end {
			Ok(SessionEnd::Cancelled) => break,
			Ok(SessionEnd::Closed(reason)) => reason,
			Err(e) => format!("{e:#}"),
		};

		info!(channel = %channel, %reason, "chat session ended");
		let _ = events.send(ChatTransportEvent::Disconnected { reason });

		attempt = if handler.welcomed { 1 } else { attempt.saturating_add(1) };
	}

	connected.store(false, Ordering::SeqCst);
}

#[async_trait::async_trait]
impl ChatTransport for TwitchChat {
	fn set_credentials(&self, credentials: ChatCredentials) {
		debug!(bot_login = %credentials.bot_login, "chat credentials updated");
		self.ctx.set_credentials(TwitchCredentials {
			client_id: credentials.client_id,
			access_token: credentials.access_token,
		});
	}

	async fn connect(&self, channel: &ChannelName) -> anyhow::Result<()> {
		self.disconnect().await?;

		if self.ctx.credentials().is_none() {
			anyhow::bail!("chat credentials not set");
		}

		let cancel = CancellationToken::new();
		let task = tokio::spawn(run_chat(
			self.ctx.clone(),
			channel.clone(),
			self.events.clone(),
			self.connected.clone(),
			cancel.clone(),
		));

		*self.run.lock() = Some(ChatRun { cancel, task });
		let _ = self
			.events
			.send(ChatTransportEvent::Log(format!("connecting to #{channel}")));
		Ok(())
	}

	async fn disconnect(&self) -> anyhow::Result<()> {
		let run = self.run.lock().take();
		if let Some(run) = run {
			run.cancel.cancel();
			if let Err(e) = run.task.await {
				warn!(error = %e, "chat task ended abnormally");
			}
			let _ = self.events.send(ChatTransportEvent::Disconnected {
				reason: "disconnect requested".to_string(),
			});
		}
		self.connected.store(false, Ordering::SeqCst);
		Ok(())
	}

	fn is_connected(&self) -> bool {
		self.connected.load(Ordering::SeqCst)
	}

	fn subscribe(&self) -> broadcast::Receiver<ChatTransportEvent> {
		self.events.subscribe()
	}
}
