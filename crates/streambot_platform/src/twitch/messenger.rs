#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::Context;
use streambot_domain::ChannelName;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

use super::{HelixClient, TwitchContext};
use crate::Messenger;

const OUTGOING_QUEUE: usize = 64;
const MAX_MESSAGE_CHARS: usize = 500;

struct Outgoing {
	channel: ChannelName,
	text: String,
	reply_to: Option<String>,
	done: oneshot::Sender<anyhow::Result<()>>,
}

/// Serialized, rate-limited sender over Helix `POST /chat/messages`.
#[derive(Clone)]
pub struct TwitchMessenger {
	tx: mpsc::Sender<Outgoing>,
}

impl TwitchMessenger {
	pub fn spawn(ctx: TwitchContext) -> Self {
		let (tx, rx) = mpsc::channel(OUTGOING_QUEUE);
		tokio::spawn(run_queue(ctx, rx));
		Self { tx }
	}

	async fn enqueue(&self, channel: &ChannelName, text: &str, reply_to: Option<&str>) -> anyhow::Result<()> {
		let (done, wait) = oneshot::channel();
		self.tx
			.send(Outgoing {
				channel: channel.clone(),
				text: truncate_chars(text, MAX_MESSAGE_CHARS),
				reply_to: reply_to.map(str::to_string),
				done,
			})
			.await
			.map_err(|_| anyhow::anyhow!("chat send queue closed"))?;
		wait.await.context("chat send queue dropped request")?
	}
}

fn truncate_chars(text: &str, max: usize) -> String {
	match text.char_indices().nth(max) {
		Some((idx, _)) => text[..idx].to_string(),
		None => text.to_string(),
	}
}

#[derive(Default)]
struct IdCache {
	sender: Option<String>,
	broadcasters: HashMap<ChannelName, String>,
}

impl IdCache {
	async fn resolve(&mut self, helix: &HelixClient, channel: &ChannelName) -> anyhow::Result<(String, String)> {
		let sender = match &self.sender {
			Some(id) => id.clone(),
			None => {
				let user = helix.get_token_user().await?;
				self.sender = Some(user.id.clone());
				user.id
			}
		};

		let broadcaster = match self.broadcasters.get(channel) {
			Some(id) => id.clone(),
			None => {
				let user = helix
					.get_user_by_login(channel.as_str())
					.await?
					.with_context(|| format!("channel not found: {channel}"))?;
				self.broadcasters.insert(channel.clone(), user.id.clone());
				user.id
			}
		};

		Ok((broadcaster, sender))
	}
}

async fn deliver(ctx: &TwitchContext, ids: &mut IdCache, out: &Outgoing) -> anyhow::Result<()> {
	let helix = ctx.helix()?;
	let (broadcaster, sender) = ids.resolve(&helix, &out.channel).await?;
	let res = helix
		.send_chat_message(&broadcaster, &sender, &out.text, out.reply_to.as_deref())
		.await;
	if res.is_err() {
		// Token or channel may have changed underneath us.
		*ids = IdCache::default();
	}
	res
}

async fn run_queue(ctx: TwitchContext, mut rx: mpsc::Receiver<Outgoing>) {
	let spacing = ctx.config().send_spacing;
	let mut ids = IdCache::default();
	let mut next_allowed = Instant::now();

	while let Some(out) = rx.recv().await {
		sleep_until(next_allowed).await;

		let res = deliver(&ctx, &mut ids, &out).await;
		next_allowed = Instant::now() + spacing;

		match &res {
			Ok(()) => {
				metrics::counter!("streambot_chat_messages_sent_total").increment(1);
				debug!(channel = %out.channel, reply = out.reply_to.is_some(), "chat message sent");
			}
			Err(e) => {
				metrics::counter!("streambot_chat_send_failures_total").increment(1);
				warn!(error = ?e, channel = %out.channel, "chat message send failed");
			}
		}

		let _ = out.done.send(res);
	}
	debug!("chat send queue closed");
}

#[async_trait::async_trait]
impl Messenger for TwitchMessenger {
	async fn send(&self, channel: &ChannelName, text: &str) -> anyhow::Result<()> {
		self.enqueue(channel, text, None).await
	}

	async fn reply(&self, channel: &ChannelName, parent_message_id: &str, text: &str) -> anyhow::Result<()> {
		self.enqueue(channel, text, Some(parent_message_id)).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::twitch::TwitchConfig;

	#[test]
	fn truncates_on_char_boundary() {
		assert_eq!(truncate_chars("héllo", 2), "hé");
		assert_eq!(truncate_chars("short", 500), "short");
		let long = "a".repeat(600);
		assert_eq!(truncate_chars(&long, MAX_MESSAGE_CHARS).len(), MAX_MESSAGE_CHARS);
	}

	#[tokio::test]
	async fn send_without_credentials_fails() {
		let ctx = TwitchContext::new(TwitchConfig::new("cid")).unwrap();
		let messenger = TwitchMessenger::spawn(ctx);
		let channel = ChannelName::new("test").unwrap();

		let err = messenger.send(&channel, "hi").await.unwrap_err();
		assert!(format!("{err:#}").contains("credentials not set"));
	}
}
