#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use parking_lot::Mutex;
use serde::Serialize;
use streambot_domain::{ChatMessage, Decoration};
use streambot_platform::DecorationSet;
use tokio::sync::mpsc;
use tracing::debug;

use crate::settings::OverlaySettings;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusFlags {
	pub broadcaster: bool,
	pub moderator: bool,
	pub vip: bool,
	pub subscriber: bool,
}

/// A chat line as shown by the overlay and the in-app list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessageRecord {
	pub id: String,
	pub timestamp_ms: u64,
	pub author: String,
	pub author_login: String,
	pub text: String,
	pub badges: Vec<Decoration>,
	pub emotes: Vec<Decoration>,
	pub flags: StatusFlags,
	pub is_first_time: bool,
}

impl ChatMessageRecord {
	pub fn from_message(msg: &ChatMessage, decorations: &DecorationSet, is_first_time: bool) -> Self {
		let timestamp_ms = msg
			.timestamp
			.duration_since(UNIX_EPOCH)
			.unwrap_or_default()
			.as_millis() as u64;

		Self {
			id: msg.id.clone(),
			timestamp_ms,
			author: msg.author.display_name().to_string(),
			author_login: msg.author.login.clone(),
			text: msg.text.clone(),
			badges: decorations.resolve_badges(&msg.badges).cloned().collect(),
			emotes: msg.emotes.clone(),
			flags: StatusFlags {
				broadcaster: msg.is_broadcaster(),
				moderator: msg.is_moderator(),
				vip: msg.has_badge_set("vip"),
				subscriber: msg.has_badge_set("subscriber"),
			},
			is_first_time,
		}
	}
}

/// Events pushed to overlay clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
	Chat { message: ChatMessageRecord },
	Clear,
	SettingsChanged { overlay: OverlaySettings },
}

impl PushEvent {
	/// SSE `event:` name.
	pub fn name(&self) -> &'static str {
		match self {
			PushEvent::Chat { .. } => "chat",
			PushEvent::Clear => "clear",
			PushEvent::SettingsChanged { .. } => "settings",
		}
	}
}

#[derive(Debug, Clone)]
pub enum PushItem {
	Event(Arc<PushEvent>),

	/// Items were dropped because this subscriber fell behind.
	Lagged { dropped: u64 },
}

#[derive(Debug, Clone)]
pub struct PushHubConfig {
	pub subscriber_queue_capacity: usize,
}

impl Default for PushHubConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 256,
		}
	}
}

struct Subscriber {
	tx: mpsc::Sender<PushItem>,
	pending_lag: u64,
}

/// Fan-out of push events to overlay subscribers. Closed receivers are
/// pruned on every publish.
#[derive(Clone)]
pub struct PushHub {
	subscribers: Arc<Mutex<Vec<Subscriber>>>,
	cfg: PushHubConfig,
}

impl PushHub {
	pub fn new(cfg: PushHubConfig) -> Self {
		Self {
			subscribers: Arc::new(Mutex::new(Vec::new())),
			cfg,
		}
	}

	pub fn subscribe(&self) -> mpsc::Receiver<PushItem> {
		let (tx, rx) = mpsc::channel(self.cfg.subscriber_queue_capacity.max(1));
		let mut subs = self.subscribers.lock();
		subs.retain(|s| !s.tx.is_closed());
		subs.push(Subscriber { tx, pending_lag: 0 });
		debug!(subscribers = subs.len(), "push hub: subscribed");
		rx
	}

	pub fn publish(&self, event: PushEvent) {
		let item = PushItem::Event(Arc::new(event));
		let mut subs = self.subscribers.lock();
		let mut dropped_total: u64 = 0;

		for sub in subs.iter_mut() {
			match sub.tx.try_send(item.clone()) {
				Ok(()) => {
					if sub.pending_lag > 0
						&& sub
							.tx
							.try_send(PushItem::Lagged {
								dropped: sub.pending_lag,
							})
							.is_ok()
					{
						sub.pending_lag = 0;
					}
				}
				Err(mpsc::error::TrySendError::Full(_)) => {
					dropped_total += 1;
					sub.pending_lag = sub.pending_lag.saturating_add(1);
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}

		subs.retain(|s| !s.tx.is_closed());
		if dropped_total > 0 {
			debug!(dropped = dropped_total, "push hub: dropped due to full subscriber queues");
		}
	}

	pub fn subscriber_count(&self) -> usize {
		self.subscribers.lock().iter().filter(|s| !s.tx.is_closed()).count()
	}
}

/// Bounded ring of recent chat lines; changes are pushed through the hub.
pub struct ChatHistory {
	records: Mutex<VecDeque<ChatMessageRecord>>,
	max: Mutex<usize>,
	hub: PushHub,
}

impl ChatHistory {
	pub fn new(max: usize, hub: PushHub) -> Self {
		Self {
			records: Mutex::new(VecDeque::with_capacity(max.min(1024))),
			max: Mutex::new(max.max(1)),
			hub,
		}
	}

	pub fn hub(&self) -> &PushHub {
		&self.hub
	}

	pub fn append(&self, record: ChatMessageRecord) {
		{
			let max = *self.max.lock();
			let mut records = self.records.lock();
			records.push_back(record.clone());
			while records.len() > max {
				records.pop_front();
			}
		}
		self.hub.publish(PushEvent::Chat { message: record });
	}

	pub fn clear(&self) {
		self.records.lock().clear();
		self.hub.publish(PushEvent::Clear);
	}

	/// Oldest first.
	pub fn snapshot(&self) -> Vec<ChatMessageRecord> {
		self.records.lock().iter().cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.records.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn set_max(&self, max: usize) {
		let max = max.max(1);
		*self.max.lock() = max;
		let mut records = self.records.lock();
		while records.len() > max {
			records.pop_front();
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use tokio::time::timeout;

	use super::*;
	use crate::testing::chat_message;

	fn record(id: &str) -> ChatMessageRecord {
		ChatMessageRecord::from_message(&chat_message(id, "alice", id), &DecorationSet::default(), false)
	}

	#[test]
	fn ring_evicts_oldest() {
		let history = ChatHistory::new(2, PushHub::new(PushHubConfig::default()));
		history.append(record("1"));
		history.append(record("2"));
		history.append(record("3"));

		let ids: Vec<_> = history.snapshot().into_iter().map(|r| r.id).collect();
		assert_eq!(ids, vec!["2", "3"]);

		history.set_max(1);
		assert_eq!(history.len(), 1);
	}

	#[test]
	fn push_events_are_tagged_by_type() {
		let chat = serde_json::to_value(PushEvent::Chat { message: record("m1") }).expect("json");
		assert_eq!(chat["type"], "chat");
		assert_eq!(chat["message"]["id"], "m1");
		assert_eq!(chat["message"]["author_login"], "alice");
		assert_eq!(chat["message"]["flags"]["moderator"], false);

		assert_eq!(
			serde_json::to_value(PushEvent::Clear).expect("json"),
			serde_json::json!({ "type": "clear" })
		);
	}

	#[tokio::test]
	async fn subscribers_receive_chat_and_clear() {
		let hub = PushHub::new(PushHubConfig::default());
		let history = ChatHistory::new(10, hub.clone());
		let mut rx = hub.subscribe();

		history.append(record("1"));
		history.clear();

		let first = timeout(Duration::from_millis(250), rx.recv()).await.unwrap().unwrap();
		assert!(matches!(first, PushItem::Event(ref e) if e.name() == "chat"));
		let second = timeout(Duration::from_millis(250), rx.recv()).await.unwrap().unwrap();
		assert!(matches!(second, PushItem::Event(ref e) if **e == PushEvent::Clear));
		assert!(history.is_empty());
	}

	#[tokio::test]
	async fn dropped_receivers_are_pruned() {
		let hub = PushHub::new(PushHubConfig::default());
		let rx = hub.subscribe();
		let _keep = hub.subscribe();
		drop(rx);

		hub.publish(PushEvent::Clear);
		assert_eq!(hub.subscriber_count(), 1);
	}

	#[tokio::test]
	async fn slow_subscriber_gets_lag_marker() {
		let hub = PushHub::new(PushHubConfig {
			subscriber_queue_capacity: 2,
		});
		let mut rx = hub.subscribe();

		for _ in 0..3 {
			hub.publish(PushEvent::Clear);
		}
		assert!(matches!(rx.recv().await, Some(PushItem::Event(_))));
		assert!(matches!(rx.recv().await, Some(PushItem::Event(_))));

		hub.publish(PushEvent::Clear);
		assert!(matches!(rx.recv().await, Some(PushItem::Event(_))));
		assert!(matches!(rx.recv().await, Some(PushItem::Lagged { dropped: 1 })));
	}
}
