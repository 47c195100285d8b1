#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::Serialize;
use streambot_domain::ChatMessage;
use tracing::{debug, info};

/// Accumulated chat statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
	pub total_messages: u64,
	/// Message count per chatter login.
	pub per_user: BTreeMap<String, u64>,
	pub sessions: u64,
	#[serde(skip)]
	pub session_started_at: Option<SystemTime>,
}

impl StatsSnapshot {
	pub fn unique_chatters(&self) -> usize {
		self.per_user.len()
	}
}

#[async_trait::async_trait]
pub trait StatisticsStore: Send + Sync {
	async fn load(&self) -> anyhow::Result<Option<StatsSnapshot>>;

	async fn save(&self, snapshot: &StatsSnapshot) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
pub trait StatisticsCollector: Send + Sync {
	async fn start(&self) -> anyhow::Result<()>;

	fn reset_start_time(&self);

	fn track(&self, message: &ChatMessage);

	/// Stops tracking and flushes to the store.
	async fn stop(&self) -> anyhow::Result<()>;

	fn is_running(&self) -> bool;

	fn snapshot(&self) -> StatsSnapshot;
}

#[derive(Default)]
struct StatsState {
	running: bool,
	loaded: bool,
	snapshot: StatsSnapshot,
}

/// Counts messages per session and persists totals across runs.
pub struct SessionStatistics {
	store: Arc<dyn StatisticsStore>,
	state: Mutex<StatsState>,
}

impl SessionStatistics {
	pub fn new(store: Arc<dyn StatisticsStore>) -> Self {
		Self {
			store,
			state: Mutex::new(StatsState::default()),
		}
	}
}

#[async_trait::async_trait]
impl StatisticsCollector for SessionStatistics {
	async fn start(&self) -> anyhow::Result<()> {
		let needs_load = !self.state.lock().loaded;
		let previous = if needs_load { self.store.load().await? } else { None };

		let mut state = self.state.lock();
		if needs_load {
			state.loaded = true;
			if let Some(prev) = previous {
				state.snapshot = prev;
			}
		}
		state.running = true;
		state.snapshot.sessions += 1;
		state.snapshot.session_started_at = Some(SystemTime::now());
		info!(
			total_messages = state.snapshot.total_messages,
			sessions = state.snapshot.sessions,
			"statistics started"
		);
		Ok(())
	}

	fn reset_start_time(&self) {
		self.state.lock().snapshot.session_started_at = Some(SystemTime::now());
	}

	fn track(&self, message: &ChatMessage) {
		let mut state = self.state.lock();
		if !state.running {
			return;
		}
		state.snapshot.total_messages += 1;
		*state
			.snapshot
			.per_user
			.entry(message.author.login.clone())
			.or_insert(0) += 1;
		metrics::counter!("streambot_messages_received_total").increment(1);
	}

	async fn stop(&self) -> anyhow::Result<()> {
		let snapshot = {
			let mut state = self.state.lock();
			if !state.running {
				return Ok(());
			}
			state.running = false;
			state.snapshot.clone()
		};
		self.store.save(&snapshot).await?;
		debug!(total_messages = snapshot.total_messages, "statistics flushed");
		Ok(())
	}

	fn is_running(&self) -> bool {
		self.state.lock().running
	}

	fn snapshot(&self) -> StatsSnapshot {
		self.state.lock().snapshot.clone()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{MemoryStatsStore, chat_message};

	#[tokio::test]
	async fn tracks_only_while_running_and_flushes_on_stop() {
		let store = Arc::new(MemoryStatsStore::default());
		let stats = SessionStatistics::new(store.clone());

		stats.track(&chat_message("1", "alice", "ignored"));
		stats.start().await.unwrap();
		stats.track(&chat_message("2", "alice", "hi"));
		stats.track(&chat_message("3", "bob", "yo"));
		stats.track(&chat_message("4", "alice", "again"));
		stats.stop().await.unwrap();

		let saved = store.saved.lock().last().cloned().unwrap();
		assert_eq!(saved.total_messages, 3);
		assert_eq!(saved.unique_chatters(), 2);
		assert_eq!(saved.per_user.get("alice"), Some(&2));
		assert!(!stats.is_running());
	}

	#[tokio::test]
	async fn previous_totals_are_carried_over() {
		let store = Arc::new(MemoryStatsStore::default());
		store.saved.lock().push(StatsSnapshot {
			total_messages: 10,
			sessions: 2,
			..StatsSnapshot::default()
		});
		let stats = SessionStatistics::new(store);
		stats.start().await.unwrap();
		stats.track(&chat_message("1", "carol", "hello"));

		let snap = stats.snapshot();
		assert_eq!(snap.total_messages, 11);
		assert_eq!(snap.sessions, 3);
	}
}
