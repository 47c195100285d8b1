#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use streambot_domain::{ChannelName, StreamInfo};
use streambot_platform::Messenger;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::settings::SharedSettings;
use crate::stream_monitor::StreamInfoSource;

/// Snapshot of an active broadcast run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastRun {
	pub channel: ChannelName,
	pub interval: Duration,
	pub sent_count: u64,
	pub next_fire_at: Option<Instant>,
}

#[derive(Default)]
struct RunState {
	generation: u64,
	channel: Option<ChannelName>,
	interval: Duration,
	sent_count: u64,
	next_fire_at: Option<Instant>,
	cancel: Option<CancellationToken>,
	/// Loop of the latest run; kept after `stop` so the next `start` can wait for it.
	task: Option<JoinHandle<()>>,
}

struct Inner {
	settings: SharedSettings,
	messenger: Arc<dyn Messenger>,
	stream: Arc<dyn StreamInfoSource>,
	run: Mutex<RunState>,
	send_gate: tokio::sync::Mutex<()>,
}

/// Sends the configured broadcast message every interval while active.
#[derive(Clone)]
pub struct BroadcastScheduler {
	inner: Arc<Inner>,
}

/// Substitutes `{counter}`, `{title}`, `{game}` and `{viewers}`; unknown values render blank.
pub fn render_template(template: &str, counter: u64, info: Option<&StreamInfo>) -> String {
	let title = info.map(|i| i.title.as_str()).unwrap_or_default();
	let game = info.and_then(|i| i.game.as_deref()).unwrap_or_default();
	let viewers = info
		.and_then(|i| i.viewers)
		.map(|v| v.to_string())
		.unwrap_or_default();

	template
		.replace("{counter}", &counter.to_string())
		.replace("{title}", title)
		.replace("{game}", game)
		.replace("{viewers}", &viewers)
		.trim()
		.to_string()
}

impl BroadcastScheduler {
	pub fn new(settings: SharedSettings, messenger: Arc<dyn Messenger>, stream: Arc<dyn StreamInfoSource>) -> Self {
		Self {
			inner: Arc::new(Inner {
				settings,
				messenger,
				stream,
				run: Mutex::new(RunState::default()),
				send_gate: tokio::sync::Mutex::new(()),
			}),
		}
	}

	/// Starts a fresh run; a still-unwinding previous loop finishes first.
	pub fn start(&self, channel: &ChannelName) {
		let interval = self.inner.settings.read(|s| s.broadcast.interval());

		let mut run = self.inner.run.lock();
		if let Some(cancel) = run.cancel.take() {
			cancel.cancel();
		}
		let previous = run.task.take();

		run.generation += 1;
		run.channel = Some(channel.clone());
		run.interval = interval;
		run.sent_count = 0;
		run.next_fire_at = Some(Instant::now() + interval);

		let cancel = CancellationToken::new();
		run.cancel = Some(cancel.clone());
		run.task = Some(tokio::spawn(run_loop(
			self.inner.clone(),
			run.generation,
			previous,
			cancel,
		)));
		info!(%channel, interval_secs = interval.as_secs(), "broadcast scheduler started");
	}

	/// Observable state is cleared before the loop has unwound.
	pub fn stop(&self) {
		let mut run = self.inner.run.lock();
		let was_active = run.channel.is_some();
		if let Some(cancel) = run.cancel.take() {
			cancel.cancel();
		}
		run.generation += 1;
		run.channel = None;
		run.sent_count = 0;
		run.next_fire_at = None;
		if was_active {
			info!("broadcast scheduler stopped");
		}
	}

	/// Restarts the active run with the current interval; `false` when idle.
	pub fn restart(&self) -> bool {
		let channel = self.inner.run.lock().channel.clone();
		match channel {
			Some(channel) => {
				self.start(&channel);
				true
			}
			None => false,
		}
	}

	/// Stops and waits for the loop to exit.
	pub async fn shutdown(&self) {
		self.stop();
		let task = self.inner.run.lock().task.take();
		if let Some(task) = task {
			let _ = task.await;
		}
	}

	pub fn is_active(&self) -> bool {
		self.inner.run.lock().channel.is_some()
	}

	pub fn sent_count(&self) -> u64 {
		self.inner.run.lock().sent_count
	}

	pub fn run(&self) -> Option<BroadcastRun> {
		let run = self.inner.run.lock();
		run.channel.as_ref().map(|channel| BroadcastRun {
			channel: channel.clone(),
			interval: run.interval,
			sent_count: run.sent_count,
			next_fire_at: run.next_fire_at,
		})
	}

	/// One out-of-band message; the timer is left alone. Returns the new
	/// counter, or `None` when idle or the template renders empty.
	pub async fn manual_send(&self) -> anyhow::Result<Option<u64>> {
		let _gate = self.inner.send_gate.lock().await;
		let Some((channel, counter, text)) = self.inner.claim(None, false) else {
			return Ok(None);
		};
		self.inner.messenger.send(&channel, &text).await?;
		metrics::counter!("streambot_broadcasts_sent_total", "trigger" => "manual").increment(1);
		debug!(%channel, counter, "manual broadcast sent");
		Ok(Some(counter))
	}
}

impl Inner {
	/// Renders the next message and bumps the counter under the run lock.
	/// `generation` pins a tick to the run that scheduled it.
	fn claim(&self, generation: Option<u64>, reschedule: bool) -> Option<(ChannelName, u64, String)> {
		let template = self.settings.read(|s| s.broadcast.template.clone());
		let info = self.stream.current_stream();

		let mut run = self.run.lock();
		if generation.is_some_and(|g| g != run.generation) {
			return None;
		}
		let channel = run.channel.clone()?;
		if reschedule {
			run.next_fire_at = Some(Instant::now() + run.interval);
		}

		let counter = run.sent_count + 1;
		let text = render_template(&template, counter, info.as_ref());
		if text.is_empty() {
			debug!(%channel, "broadcast template rendered empty; skipping");
			return None;
		}
		run.sent_count = counter;
		Some((channel, counter, text))
	}

	async fn tick(&self, generation: u64) {
		let _gate = self.send_gate.lock().await;
		let Some((channel, counter, text)) = self.claim(Some(generation), true) else {
			return;
		};

		match self.messenger.send(&channel, &text).await {
			Ok(()) => {
				metrics::counter!("streambot_broadcasts_sent_total", "trigger" => "timer").increment(1);
				debug!(%channel, counter, "scheduled broadcast sent");
			}
			Err(e) => warn!(%channel, counter, error = ?e, "scheduled broadcast failed"),
		}
	}
}

async fn run_loop(inner: Arc<Inner>, generation: u64, previous: Option<JoinHandle<()>>, cancel: CancellationToken) {
	if let Some(previous) = previous {
		let _ = previous.await;
	}

	loop {
		let next = {
			let run = inner.run.lock();
			if run.generation != generation {
				break;
			}
			run.next_fire_at
		};
		let Some(next) = next else {
			break;
		};

		tokio::select! {
			_ = cancel.cancelled() => break,
			_ = sleep_until(next) => {}
		}

		inner.tick(generation).await;
	}
	debug!(generation, "broadcast loop exited");
}
