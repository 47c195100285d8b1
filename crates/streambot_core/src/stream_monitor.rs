#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use streambot_domain::{BroadcasterId, ChannelName, StreamInfo, StreamStatus};
use streambot_platform::{StreamApi, StreamEvent, StreamEventSource, StreamSubscription};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::MonitorError;

const MONITOR_EVENT_CAPACITY: usize = 64;
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct StreamMonitorConfig {
	/// Reconciliation poll while subscribed.
	pub poll_interval: Duration,
	pub reconnect_base: Duration,
	pub max_reconnect_attempts: u32,
	/// Metadata polls after a push "online".
	pub online_retry_attempts: u32,
	pub online_retry_step: Duration,
	pub online_retry_max: Duration,
}

impl Default for StreamMonitorConfig {
	fn default() -> Self {
		Self {
			poll_interval: Duration::from_secs(5 * 60),
			reconnect_base: Duration::from_secs(1),
			max_reconnect_attempts: 5,
			online_retry_attempts: 6,
			online_retry_step: Duration::from_secs(5),
			online_retry_max: Duration::from_secs(30),
		}
	}
}

impl StreamMonitorConfig {
	fn reconnect_delay(&self, attempt: u32) -> Duration {
		self.reconnect_base
			.saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
	}

	fn online_retry_delay(&self, attempt: u32) -> Duration {
		self.online_retry_step.saturating_mul(attempt).min(self.online_retry_max)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSource {
	Poll,
	Push,
	/// Monitoring stopped or gave up.
	Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
	Requested,
	ReconnectExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
	StatusChanged {
		previous: StreamStatus,
		current: StreamStatus,
		info: Option<StreamInfo>,
		source: StatusSource,
	},
	/// Metadata changed without a status transition.
	InfoUpdated(StreamInfo),
	Error(MonitorError),
	Stopped {
		reason: StopReason,
	},
}

/// `info` is only ever set while `status` is Online.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamState {
	pub status: StreamStatus,
	pub info: Option<StreamInfo>,
}

/// Read access to the live stream metadata.
pub trait StreamInfoSource: Send + Sync {
	/// `None` unless the stream is online.
	fn current_stream(&self) -> Option<StreamInfo>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Phase {
	#[default]
	Idle,
	Starting,
	Running,
}

#[derive(Default)]
struct RunSlot {
	phase: Phase,
	generation: u64,
	channel: Option<ChannelName>,
	broadcaster: Option<BroadcasterId>,
	cancel: Option<CancellationToken>,
	task: Option<JoinHandle<()>>,
}

struct Inner {
	api: Arc<dyn StreamApi>,
	source: Arc<dyn StreamEventSource>,
	cfg: StreamMonitorConfig,
	state: RwLock<StreamState>,
	run: Mutex<RunSlot>,
	online_retry_active: AtomicBool,
	events: broadcast::Sender<MonitorEvent>,
}

/// Live/offline state machine for one channel, driven by a push
/// subscription and reconciled with authoritative polls.
#[derive(Clone)]
pub struct StreamMonitor {
	inner: Arc<Inner>,
}

enum Reconnect {
	Resubscribed(StreamSubscription),
	Cancelled,
	Exhausted(u32),
}

impl StreamMonitor {
	pub fn new(api: Arc<dyn StreamApi>, source: Arc<dyn StreamEventSource>, cfg: StreamMonitorConfig) -> Self {
		let (events, _) = broadcast::channel(MONITOR_EVENT_CAPACITY);
		Self {
			inner: Arc::new(Inner {
				api,
				source,
				cfg,
				state: RwLock::new(StreamState::default()),
				run: Mutex::new(RunSlot::default()),
				online_retry_active: AtomicBool::new(false),
				events,
			}),
		}
	}

	pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
		self.inner.events.subscribe()
	}

	pub fn status(&self) -> StreamStatus {
		self.inner.state.read().status
	}

	pub fn state(&self) -> StreamState {
		self.inner.state.read().clone()
	}

	pub fn is_monitoring(&self) -> bool {
		self.inner.run.lock().phase != Phase::Idle
	}

	pub fn channel(&self) -> Option<ChannelName> {
		self.inner.run.lock().channel.clone()
	}

	pub async fn start_monitoring(&self, channel: &ChannelName) -> Result<(), MonitorError> {
		let generation = {
			let mut run = self.inner.run.lock();
			if run.phase != Phase::Idle {
				let current = run.channel.as_ref().unwrap_or(channel);
				return Err(MonitorError::AlreadyMonitoring(current.to_string()));
			}
			run.generation += 1;
			run.phase = Phase::Starting;
			run.channel = Some(channel.clone());
			run.generation
		};

		match self.open(generation, channel).await {
			Ok((broadcaster, subscription)) => {
				let mut run = self.inner.run.lock();
				if run.generation != generation {
					debug!(%channel, "monitoring stopped while starting");
					return Err(MonitorError::SubscriptionFailure("stopped while starting".to_string()));
				}

				let cancel = CancellationToken::new();
				let task = tokio::spawn(pump(
					self.inner.clone(),
					generation,
					broadcaster.clone(),
					subscription,
					cancel.clone(),
				));
				run.phase = Phase::Running;
				run.broadcaster = Some(broadcaster);
				run.cancel = Some(cancel);
				run.task = Some(task);
				info!(%channel, "stream monitoring started");
				Ok(())
			}
			Err(e) => {
				let mut run = self.inner.run.lock();
				if run.generation == generation {
					*run = RunSlot {
						generation,
						..RunSlot::default()
					};
				}
				warn!(%channel, error = %e, "stream monitoring failed to start");
				Err(e)
			}
		}
	}

	async fn open(
		&self,
		generation: u64,
		channel: &ChannelName,
	) -> Result<(BroadcasterId, StreamSubscription), MonitorError> {
		let broadcaster = self
			.inner
			.api
			.resolve_broadcaster(channel)
			.await
			.map_err(|e| MonitorError::Poll(format!("{e:#}")))?
			.ok_or_else(|| MonitorError::ChannelNotFound(channel.to_string()))?;

		// Poll errors are reported as events; the subscription still opens.
		let _ = self.inner.poll(generation, &broadcaster).await;
		if !self.inner.is_current(generation) {
			return Err(MonitorError::SubscriptionFailure("stopped while starting".to_string()));
		}

		let subscription = self
			.inner
			.source
			.subscribe(&broadcaster)
			.await
			.map_err(|e| MonitorError::SubscriptionFailure(format!("{e:#}")))?;
		Ok((broadcaster, subscription))
	}

	/// Closes the subscription and resets status to Unknown. Idempotent.
	pub async fn stop_monitoring(&self) {
		let (was_active, cancel, task) = {
			let mut run = self.inner.run.lock();
			let was_active = run.phase != Phase::Idle;
			let generation = run.generation + 1;
			let old = std::mem::replace(
				&mut *run,
				RunSlot {
					generation,
					..RunSlot::default()
				},
			);
			(was_active, old.cancel, old.task)
		};

		if let Some(cancel) = cancel {
			cancel.cancel();
		}
		if let Some(mut task) = task
			&& timeout(STOP_GRACE, &mut task).await.is_err()
		{
			warn!("stream monitor task did not stop in time; aborting");
			task.abort();
		}

		self.inner.apply(StreamStatus::Unknown, None, StatusSource::Reset);
		if was_active {
			info!("stream monitoring stopped");
			self.inner.emit(MonitorEvent::Stopped {
				reason: StopReason::Requested,
			});
		}
	}

	/// Authoritative poll of the monitored broadcaster.
	pub async fn refresh_current_status(&self) -> Result<StreamStatus, MonitorError> {
		let (generation, broadcaster) = {
			let run = self.inner.run.lock();
			match run.broadcaster.clone() {
				Some(broadcaster) => (run.generation, broadcaster),
				None => return Err(MonitorError::NotMonitoring),
			}
		};
		self.inner.poll(generation, &broadcaster).await
	}
}

impl StreamInfoSource for StreamMonitor {
	fn current_stream(&self) -> Option<StreamInfo> {
		let state = self.inner.state.read();
		match state.status {
			StreamStatus::Online => state.info.clone(),
			_ => None,
		}
	}
}

impl Inner {
	fn emit(&self, event: MonitorEvent) {
		let _ = self.events.send(event);
	}

	fn is_current(&self, generation: u64) -> bool {
		self.run.lock().generation == generation
	}

	/// Moves to `status`; `StatusChanged` fires only on a real transition.
	fn apply(&self, status: StreamStatus, info: Option<StreamInfo>, source: StatusSource) {
		self.apply_locked(&mut self.state.write(), status, info, source);
	}

	/// Like `apply`, but drops results of a run that has since been stopped.
	/// Holding the state lock across the check orders it against the reset.
	fn apply_for(&self, generation: u64, status: StreamStatus, info: Option<StreamInfo>, source: StatusSource) -> bool {
		let mut state = self.state.write();
		if !self.is_current(generation) {
			debug!(generation, %status, "dropping status from a stopped run");
			return false;
		}
		self.apply_locked(&mut state, status, info, source);
		true
	}

	fn apply_locked(
		&self,
		state: &mut StreamState,
		status: StreamStatus,
		info: Option<StreamInfo>,
		source: StatusSource,
	) {
		let previous = state.status;

		if previous == status {
			if status == StreamStatus::Online
				&& let Some(info) = info
				&& state.info.as_ref() != Some(&info)
			{
				state.info = Some(info.clone());
				self.emit(MonitorEvent::InfoUpdated(info));
			}
			return;
		}

		state.status = status;
		state.info = if status == StreamStatus::Online { info } else { None };
		metrics::gauge!("streambot_stream_online").set(if status == StreamStatus::Online { 1.0 } else { 0.0 });
		info!(%previous, current = %status, ?source, "stream status changed");
		self.emit(MonitorEvent::StatusChanged {
			previous,
			current: status,
			info: state.info.clone(),
			source,
		});
	}

	async fn poll(&self, generation: u64, broadcaster: &BroadcasterId) -> Result<StreamStatus, MonitorError> {
		match self.api.fetch_stream(broadcaster).await {
			Ok(Some(info)) => {
				self.apply_for(generation, StreamStatus::Online, Some(info), StatusSource::Poll);
				Ok(StreamStatus::Online)
			}
			Ok(None) => {
				if self.online_retry_active.load(Ordering::SeqCst) && self.state.read().status == StreamStatus::Online {
					warn!(%broadcaster, "poll reports offline right after an online notification; keeping online");
					return Ok(StreamStatus::Online);
				}
				self.apply_for(generation, StreamStatus::Offline, None, StatusSource::Poll);
				Ok(StreamStatus::Offline)
			}
			Err(e) => {
				let err = MonitorError::Poll(format!("{e:#}"));
				warn!(%broadcaster, error = %err, "stream status poll failed");
				if self.is_current(generation) {
					self.emit(MonitorEvent::Error(err.clone()));
				}
				Err(err)
			}
		}
	}

	async fn reconnect(&self, broadcaster: &BroadcasterId, cancel: &CancellationToken) -> Reconnect {
		let max = self.cfg.max_reconnect_attempts;
		for attempt in 1..=max {
			let delay = self.cfg.reconnect_delay(attempt);
			debug!(attempt, ?delay, "stream subscription reconnect scheduled");
			tokio::select! {
				_ = cancel.cancelled() => return Reconnect::Cancelled,
				_ = sleep(delay) => {}
			}

			let res = tokio::select! {
				_ = cancel.cancelled() => return Reconnect::Cancelled,
				res = self.source.subscribe(broadcaster) => res,
			};
			match res {
				Ok(sub) => {
					info!(attempt, "stream subscription re-established");
					return Reconnect::Resubscribed(sub);
				}
				Err(e) => {
					warn!(attempt, max, error = ?e, "stream subscription reconnect failed");
					self.emit(MonitorError::SubscriptionFailure(format!("{e:#}")).into());
				}
			}
		}
		Reconnect::Exhausted(max)
	}

	fn give_up(&self, generation: u64, attempts: u32) {
		{
			let mut run = self.run.lock();
			if run.generation != generation {
				return;
			}
			*run = RunSlot {
				generation: generation + 1,
				..RunSlot::default()
			};
		}

		self.apply(StreamStatus::Unknown, None, StatusSource::Reset);
		warn!(attempts, "stream subscription reconnect exhausted; monitoring stopped");
		self.emit(MonitorError::ReconnectExhausted { attempts }.into());
		self.emit(MonitorEvent::Stopped {
			reason: StopReason::ReconnectExhausted,
		});
	}
}

impl From<MonitorError> for MonitorEvent {
	fn from(e: MonitorError) -> Self {
		MonitorEvent::Error(e)
	}
}

/// Polls for metadata that is usually missing right after `stream.online`.
/// The caller raises `online_retry_active` before spawning.
async fn retry_online_metadata(
	inner: Arc<Inner>,
	generation: u64,
	broadcaster: BroadcasterId,
	cancel: CancellationToken,
) {
	for attempt in 1..=inner.cfg.online_retry_attempts {
		tokio::select! {
			_ = cancel.cancelled() => break,
			_ = sleep(inner.cfg.online_retry_delay(attempt)) => {}
		}

		if inner.state.read().status != StreamStatus::Online {
			debug!("status changed during metadata retry; giving up");
			break;
		}

		let fetched = tokio::select! {
			_ = cancel.cancelled() => break,
			res = inner.api.fetch_stream(&broadcaster) => res,
		};
		match fetched {
			Ok(Some(info)) => {
				inner.apply_for(generation, StreamStatus::Online, Some(info), StatusSource::Poll);
				debug!(attempt, "stream metadata available");
				break;
			}
			Ok(None) => debug!(attempt, "stream metadata not available yet"),
			Err(e) => {
				let err = MonitorError::Poll(format!("{e:#}"));
				inner.emit(err.into());
				break;
			}
		}
	}

	// A cancelled retry has been superseded; the flag belongs to its successor.
	if !cancel.is_cancelled() {
		inner.online_retry_active.store(false, Ordering::SeqCst);
	}
}

async fn pump(
	inner: Arc<Inner>,
	generation: u64,
	broadcaster: BroadcasterId,
	mut subscription: StreamSubscription,
	cancel: CancellationToken,
) {
	let period = inner.cfg.poll_interval;
	let mut poll = interval_at(Instant::now() + period, period);
	poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
	let mut retry: Option<CancellationToken> = None;

	loop {
		tokio::select! {
			_ = cancel.cancelled() => break,

			_ = poll.tick() => {
				tokio::select! {
					_ = cancel.cancelled() => break,
					_ = inner.poll(generation, &broadcaster) => {}
				}
			}

			event = subscription.next() => {
				let reason = match event {
					Some(StreamEvent::Online { .. }) if inner.state.read().status == StreamStatus::Online => {
						debug!(%broadcaster, "online notification while already online");
						continue;
					}
					Some(StreamEvent::Online { started_at }) => {
						let info = StreamInfo {
							title: String::new(),
							game: None,
							viewers: None,
							started_at: started_at.or_else(|| Some(SystemTime::now())),
						};
						inner.apply_for(generation, StreamStatus::Online, Some(info), StatusSource::Push);

						if let Some(old) = retry.take() {
							old.cancel();
						}
						let token = cancel.child_token();
						inner.online_retry_active.store(true, Ordering::SeqCst);
						tokio::spawn(retry_online_metadata(
							inner.clone(),
							generation,
							broadcaster.clone(),
							token.clone(),
						));
						retry = Some(token);
						continue;
					}
					Some(StreamEvent::Offline) => {
						if let Some(old) = retry.take() {
							old.cancel();
						}
						inner.online_retry_active.store(false, Ordering::SeqCst);
						inner.apply_for(generation, StreamStatus::Offline, None, StatusSource::Push);
						continue;
					}
					Some(StreamEvent::Dropped { reason }) => reason,
					None => "subscription closed".to_string(),
				};

				warn!(%broadcaster, %reason, "stream subscription lost");
				match inner.reconnect(&broadcaster, &cancel).await {
					Reconnect::Resubscribed(sub) => {
						subscription = sub;
						tokio::select! {
							_ = cancel.cancelled() => break,
							_ = inner.poll(generation, &broadcaster) => {}
						}
					}
					Reconnect::Cancelled => break,
					Reconnect::Exhausted(attempts) => {
						inner.give_up(generation, attempts);
						break;
					}
				}
			}
		}
	}

	if let Some(token) = retry {
		token.cancel();
	}
	inner.online_retry_active.store(false, Ordering::SeqCst);
	debug!(%broadcaster, "stream monitor pump exited");
}
