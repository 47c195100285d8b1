#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use streambot_domain::{ChannelName, ChatMessage, ConnectionState, StreamInfo, StreamStatus};
use streambot_platform::{ChatCredentials, ChatTransport, ChatTransportEvent, DecorationSet, DecorationSource, Messenger};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audience::{AudienceTracker, welcome_text};
use crate::commands::{CommandOutcome, CommandProcessor, ResponseMode};
use crate::error::{ConnectionError, MonitorError, StartOutcome};
use crate::history::{ChatHistory, ChatMessageRecord, PushEvent};
use crate::scheduler::BroadcastScheduler;
use crate::settings::{BotSettings, SharedSettings};
use crate::statistics::StatisticsCollector;
use crate::stream_monitor::{MonitorEvent, StopReason, StreamInfoSource, StreamMonitor};
use crate::token_broker::TokenBroker;

const BOT_EVENT_CAPACITY: usize = 256;
const RESPONSE_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct BotSessionConfig {
	pub connect_timeout: Duration,
	pub connect_poll_interval: Duration,
}

impl Default for BotSessionConfig {
	fn default() -> Self {
		Self {
			connect_timeout: Duration::from_secs(30),
			connect_poll_interval: Duration::from_millis(250),
		}
	}
}

/// Collaborators wired into a session.
pub struct BotSessionDeps {
	pub settings: SharedSettings,
	pub tokens: TokenBroker,
	pub chat: Arc<dyn ChatTransport>,
	pub messenger: Arc<dyn Messenger>,
	pub monitor: StreamMonitor,
	pub scheduler: BroadcastScheduler,
	pub statistics: Arc<dyn StatisticsCollector>,
	pub decorations: Arc<dyn DecorationSource>,
	pub history: Arc<ChatHistory>,
	pub audience: Arc<AudienceTracker>,
	pub commands: Arc<CommandProcessor>,
}

/// Observable session activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotEvent {
	StateChanged {
		previous: ConnectionState,
		current: ConnectionState,
	},
	Progress {
		step: &'static str,
		ok: bool,
		detail: String,
	},
	StreamStatus {
		status: StreamStatus,
		info: Option<StreamInfo>,
	},
	MonitorError(MonitorError),
	/// Monitoring gave up and needs a manual restart.
	MonitoringStopped,
	TransportLog(String),
}

/// Outbound message produced by chat dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
	pub reply_to: Option<String>,
	pub text: String,
}

/// Combines a command outcome with an optional welcome into at most one message.
pub fn plan_dispatch(message: &ChatMessage, outcome: CommandOutcome, welcome: Option<String>) -> Option<Outgoing> {
	match (outcome, welcome) {
		(CommandOutcome::Respond(resp), welcome) => {
			let text = match welcome {
				Some(w) => format!("{w} {}", resp.text),
				None => resp.text,
			};
			let reply_to = match resp.mode {
				ResponseMode::Reply { target } => Some(target.unwrap_or_else(|| message.id.clone())),
				ResponseMode::Normal => None,
			};
			Some(Outgoing { reply_to, text })
		}
		(_, Some(welcome)) => Some(Outgoing {
			reply_to: Some(message.id.clone()),
			text: welcome,
		}),
		_ => None,
	}
}

#[derive(Default)]
struct SessionState {
	state: ConnectionState,
	channel: Option<ChannelName>,
	started_at: Option<SystemTime>,
	run_id: Option<Uuid>,
	/// Cancels the in-flight `start_connection`, if any.
	attempt: Option<CancellationToken>,
	bot_login: Option<String>,
	decorations: Arc<DecorationSet>,
	workers: Option<Workers>,
}

struct Workers {
	cancel: CancellationToken,
	tasks: Vec<JoinHandle<()>>,
}

struct Inner {
	deps: BotSessionDeps,
	cfg: BotSessionConfig,
	session: Mutex<SessionState>,
	state_tx: watch::Sender<ConnectionState>,
	events: broadcast::Sender<BotEvent>,
}

/// Coordinates token acquisition, the chat connection, stream monitoring and
/// the broadcast scheduler as one session.
#[derive(Clone)]
pub struct BotSession {
	inner: Arc<Inner>,
}

impl BotSession {
	pub fn new(deps: BotSessionDeps, cfg: BotSessionConfig) -> Self {
		let (events, _) = broadcast::channel(BOT_EVENT_CAPACITY);
		Self {
			inner: Arc::new(Inner {
				deps,
				cfg,
				session: Mutex::new(SessionState::default()),
				state_tx: watch::Sender::new(ConnectionState::Idle),
				events,
			}),
		}
	}

	pub fn subscribe(&self) -> broadcast::Receiver<BotEvent> {
		self.inner.events.subscribe()
	}

	pub fn state(&self) -> ConnectionState {
		self.inner.session.lock().state
	}

	pub fn channel(&self) -> Option<ChannelName> {
		self.inner.session.lock().channel.clone()
	}

	pub fn started_at(&self) -> Option<SystemTime> {
		self.inner.session.lock().started_at
	}

	pub fn settings(&self) -> &SharedSettings {
		&self.inner.deps.settings
	}

	pub fn tokens(&self) -> &TokenBroker {
		&self.inner.deps.tokens
	}

	pub fn scheduler(&self) -> &BroadcastScheduler {
		&self.inner.deps.scheduler
	}

	pub fn monitor(&self) -> &StreamMonitor {
		&self.inner.deps.monitor
	}

	pub fn history(&self) -> &Arc<ChatHistory> {
		&self.inner.deps.history
	}

	pub fn statistics(&self) -> &Arc<dyn StatisticsCollector> {
		&self.inner.deps.statistics
	}

	/// Runs the connection sequence. `cancel`, or a `stop` issued meanwhile,
	/// aborts it at the next step boundary or wait.
	pub async fn start_connection(&self, cancel: CancellationToken) -> StartOutcome {
		let attempt = cancel.child_token();
		let (run_id, previous) = {
			let mut session = self.inner.session.lock();
			if session.state != ConnectionState::Idle {
				return StartOutcome::Failed(ConnectionError::Busy);
			}
			let run_id = Uuid::new_v4();
			session.run_id = Some(run_id);
			session.attempt = Some(attempt.clone());
			(run_id, self.inner.swap_state(&mut session, ConnectionState::Connecting))
		};
		self.inner.announce(previous, ConnectionState::Connecting);
		info!(%run_id, "starting bot connection");

		let res = self.connect_steps(&attempt).await.and_then(|()| {
			// Decided under the lock so a concurrent `stop` either sees
			// Connected or has already cancelled this attempt.
			let mut session = self.inner.session.lock();
			ensure_live(&attempt)?;
			session.attempt = None;
			session.started_at = Some(SystemTime::now());
			Ok(self.inner.swap_state(&mut session, ConnectionState::Connected))
		});

		match res {
			Ok(previous) => {
				self.inner.announce(previous, ConnectionState::Connected);
				metrics::counter!("streambot_sessions_started_total").increment(1);
				info!(%run_id, "bot connected");
				StartOutcome::Connected
			}
			Err(e) => {
				let outcome = StartOutcome::from(e);
				match &outcome {
					StartOutcome::Cancelled => info!(%run_id, "connection cancelled"),
					StartOutcome::Failed(err) => warn!(%run_id, error = %err, "connection failed"),
					StartOutcome::Connected => {}
				}
				self.abort_partial().await;
				outcome
			}
		}
	}

	async fn connect_steps(&self, cancel: &CancellationToken) -> Result<(), ConnectionError> {
		let deps = &self.inner.deps;
		let settings = deps.settings.snapshot();
		let channel = settings
			.channel
			.clone()
			.ok_or_else(|| ConnectionError::Configuration("no channel configured".to_string()))?;
		self.inner.session.lock().channel = Some(channel.clone());
		ensure_live(cancel)?;

		let token = deps.tokens.get_valid_token(cancel).await?;
		self.inner.progress("token", true, "access token ready");
		ensure_live(cancel)?;

		let bot_login = deps
			.tokens
			.identity()
			.map(|id| id.login)
			.unwrap_or_else(|| settings.bot_username.clone());
		self.inner.session.lock().bot_login = Some(bot_login.to_lowercase());
		deps.chat.set_credentials(ChatCredentials {
			client_id: settings.client_id.clone(),
			access_token: token.access_token.clone(),
			bot_login,
		});

		self.spawn_workers();

		deps.chat
			.connect(&channel)
			.await
			.map_err(|e| ConnectionError::TransportFailure(format!("{e:#}")))?;
		self.wait_connected(cancel).await?;
		self.inner.progress("chat", true, format!("joined #{channel}"));
		ensure_live(cancel)?;

		match deps.statistics.start().await {
			Ok(()) => deps.statistics.reset_start_time(),
			Err(e) => self.inner.progress("statistics", false, format!("{e:#}")),
		}
		ensure_live(cancel)?;

		match deps.decorations.load(&channel).await {
			Ok(set) => {
				debug!(badges = set.len(), "chat decorations loaded");
				self.inner.session.lock().decorations = Arc::new(set);
			}
			Err(e) => {
				warn!(error = ?e, "failed to load chat decorations");
				self.inner.progress("decorations", false, format!("{e:#}"));
			}
		}
		ensure_live(cancel)?;

		if settings.client_id.trim().is_empty() {
			warn!("client id missing; stream monitoring skipped");
			self.inner.progress("monitor", false, "skipped: client id missing");
		} else {
			// An abandoned start is reset by `abort_partial`.
			let started = tokio::select! {
				_ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
				res = deps.monitor.start_monitoring(&channel) => res,
			};
			match started {
				Ok(()) => self.inner.progress("monitor", true, "stream monitoring started"),
				Err(e) => self.inner.progress("monitor", false, e.to_string()),
			}
		}

		Ok(())
	}

	async fn wait_connected(&self, cancel: &CancellationToken) -> Result<(), ConnectionError> {
		let chat = &self.inner.deps.chat;
		let deadline = Instant::now() + self.inner.cfg.connect_timeout;
		loop {
			if chat.is_connected() {
				return Ok(());
			}
			if Instant::now() >= deadline {
				return Err(ConnectionError::Timeout);
			}
			tokio::select! {
				_ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
				_ = sleep(self.inner.cfg.connect_poll_interval) => {}
			}
		}
	}

	/// Undoes whatever a failed or cancelled start already did.
	async fn abort_partial(&self) {
		let deps = &self.inner.deps;
		self.inner.stop_workers().await;
		if let Err(e) = deps.chat.disconnect().await {
			warn!(error = ?e, "chat disconnect after failed start");
		}
		deps.monitor.stop_monitoring().await;
		if deps.statistics.is_running()
			&& let Err(e) = deps.statistics.stop().await
		{
			warn!(error = ?e, "statistics stop after failed start");
		}
		{
			let mut session = self.inner.session.lock();
			session.channel = None;
			session.run_id = None;
			session.attempt = None;
		}
		self.inner.transition(ConnectionState::Idle);
	}

	/// Best-effort teardown; every step runs even if an earlier one failed.
	/// A connection still in progress is cancelled and unwound by its own
	/// `start_connection`, which this waits for.
	pub async fn stop(&self) {
		let channel = {
			let session = self.inner.session.lock();
			match session.state {
				ConnectionState::Idle | ConnectionState::Disconnecting => return,
				ConnectionState::Connecting => {
					let rx = self.inner.state_tx.subscribe();
					if let Some(attempt) = session.attempt.as_ref() {
						attempt.cancel();
					}
					Err(rx)
				}
				ConnectionState::Connected => Ok(session.channel.clone()),
			}
		};
		let channel = match channel {
			Ok(channel) => channel,
			Err(mut rx) => {
				info!("stop requested while connecting; cancelling the attempt");
				let _ = rx.wait_for(|state| *state != ConnectionState::Connecting).await;
				return;
			}
		};
		self.inner.transition(ConnectionState::Disconnecting);
		let deps = &self.inner.deps;

		self.inner
			.step("farewell", async {
				let Some(channel) = channel.as_ref() else {
					return Ok(());
				};
				if !deps.chat.is_connected() {
					return Ok(());
				}
				let settings = deps.settings.snapshot();
				match farewell_message(&settings, &deps.audience) {
					Some(text) => deps.messenger.send(channel, &text).await,
					None => Ok(()),
				}
			})
			.await;

		self.inner.step("disconnect", deps.chat.disconnect()).await;

		self.inner
			.step("monitor", async {
				deps.scheduler.stop();
				deps.monitor.stop_monitoring().await;
				Ok(())
			})
			.await;

		self.inner.step("statistics", deps.statistics.stop()).await;

		deps.audience.clear_all();
		self.inner.stop_workers().await;

		{
			let mut session = self.inner.session.lock();
			session.channel = None;
			session.started_at = None;
			session.run_id = None;
			session.decorations = Arc::new(DecorationSet::default());
		}
		self.inner.transition(ConnectionState::Idle);
		info!("bot disconnected");
	}

	/// Starts the scheduler on the session channel; `false` when not connected.
	pub fn start_broadcast(&self) -> bool {
		let channel = {
			let session = self.inner.session.lock();
			if session.state != ConnectionState::Connected {
				return false;
			}
			session.channel.clone()
		};
		match channel {
			Some(channel) => {
				self.inner.deps.scheduler.start(&channel);
				true
			}
			None => false,
		}
	}

	pub fn stop_broadcast(&self) {
		self.inner.deps.scheduler.stop();
	}

	/// Applies a settings change and propagates it to the live components.
	pub fn update_settings(&self, f: impl FnOnce(&mut BotSettings)) -> BotSettings {
		let deps = &self.inner.deps;
		let before = deps.settings.snapshot();
		let after = deps.settings.update(f);

		if before.commands != after.commands {
			deps.commands.reconfigure(&after.commands);
		}
		if before.overlay.history_max != after.overlay.history_max {
			deps.history.set_max(after.overlay.history_max);
		}
		if before.broadcast.interval_minutes != after.broadcast.interval_minutes && deps.scheduler.restart() {
			info!(interval_minutes = after.broadcast.interval_minutes, "broadcast interval changed; run restarted");
		}
		if before.overlay != after.overlay {
			deps.history.hub().publish(PushEvent::SettingsChanged {
				overlay: after.overlay.clone(),
			});
		}
		after
	}

	fn spawn_workers(&self) {
		let cancel = CancellationToken::new();
		let chat_rx = self.inner.deps.chat.subscribe();
		let monitor_rx = self.inner.deps.monitor.subscribe();
		let (responses_tx, responses_rx) = mpsc::channel(RESPONSE_QUEUE_CAPACITY);

		let tasks = vec![
			tokio::spawn(chat_events(self.inner.clone(), chat_rx, responses_tx, cancel.clone())),
			tokio::spawn(responder(self.inner.clone(), responses_rx, cancel.clone())),
			tokio::spawn(monitor_events(self.inner.clone(), monitor_rx, cancel.clone())),
		];

		let previous = self.inner.session.lock().workers.replace(Workers { cancel, tasks });
		if let Some(previous) = previous {
			previous.cancel.cancel();
		}
	}
}

fn ensure_live(cancel: &CancellationToken) -> Result<(), ConnectionError> {
	if cancel.is_cancelled() {
		return Err(ConnectionError::Cancelled);
	}
	Ok(())
}

fn farewell_message(settings: &BotSettings, audience: &AudienceTracker) -> Option<String> {
	let farewell = settings
		.audience
		.farewell_enabled
		.then(|| audience.collective_farewell(&settings.audience.farewell_text))
		.flatten();
	let disconnect = Some(settings.notifications.disconnect_message.trim().to_string()).filter(|s| !s.is_empty());

	match (farewell, disconnect) {
		(Some(f), Some(d)) => Some(format!("{f} {d}")),
		(Some(f), None) => Some(f),
		(None, Some(d)) => Some(d),
		(None, None) => None,
	}
}

impl Inner {
	fn emit(&self, event: BotEvent) {
		let _ = self.events.send(event);
	}

	fn transition(&self, next: ConnectionState) {
		let previous = self.swap_state(&mut self.session.lock(), next);
		self.announce(previous, next);
	}

	fn swap_state(&self, session: &mut SessionState, next: ConnectionState) -> ConnectionState {
		self.state_tx.send_replace(next);
		std::mem::replace(&mut session.state, next)
	}

	fn announce(&self, previous: ConnectionState, next: ConnectionState) {
		if previous != next {
			debug!(%previous, current = %next, "session state changed");
			self.emit(BotEvent::StateChanged { previous, current: next });
		}
	}

	fn progress(&self, step: &'static str, ok: bool, detail: impl Into<String>) {
		let detail = detail.into();
		if ok {
			debug!(step, %detail, "session step");
		} else {
			warn!(step, %detail, "session step failed");
		}
		self.emit(BotEvent::Progress { step, ok, detail });
	}

	async fn step(&self, name: &'static str, fut: impl Future<Output = anyhow::Result<()>>) {
		match fut.await {
			Ok(()) => self.progress(name, true, "done"),
			Err(e) => self.progress(name, false, format!("{e:#}")),
		}
	}

	async fn stop_workers(&self) {
		let workers = self.session.lock().workers.take();
		if let Some(workers) = workers {
			workers.cancel.cancel();
			for task in workers.tasks {
				let _ = task.await;
			}
		}
	}

	fn is_own_message(&self, message: &ChatMessage) -> bool {
		self.session
			.lock()
			.bot_login
			.as_deref()
			.is_some_and(|login| message.author.login.eq_ignore_ascii_case(login))
	}

	/// Records `message` and returns the response it calls for, if any.
	fn handle_message(&self, message: ChatMessage) -> Option<Response> {
		let deps = &self.deps;
		deps.statistics.track(&message);

		let own = self.is_own_message(&message);
		let first_time = !own && deps.audience.observe(&message.author);
		let decorations = self.session.lock().decorations.clone();
		deps.history
			.append(ChatMessageRecord::from_message(&message, &decorations, first_time));

		if own {
			return None;
		}

		let outcome = deps.commands.process(&message, deps.monitor.current_stream().as_ref());
		let welcome = if first_time {
			deps.settings.read(|s| {
				s.audience
					.welcome_enabled
					.then(|| welcome_text(&s.audience.welcome_text, &message.author))
					.flatten()
			})
		} else {
			None
		};

		plan_dispatch(&message, outcome, welcome).map(|out| Response {
			channel: message.channel,
			out,
		})
	}

	async fn send_response(&self, Response { channel, out }: Response) {
		let res = match out.reply_to.as_deref() {
			Some(parent) => self.deps.messenger.reply(&channel, parent, &out.text).await,
			None => self.deps.messenger.send(&channel, &out.text).await,
		};
		if let Err(e) = res {
			warn!(%channel, error = ?e, "failed to send chat response");
		}
	}

	async fn on_stream_status(&self, current: StreamStatus, info: Option<StreamInfo>) {
		self.emit(BotEvent::StreamStatus {
			status: current,
			info,
		});

		let Some(channel) = self.session.lock().channel.clone() else {
			return;
		};
		let settings = self.deps.settings.snapshot();
		let scheduler = &self.deps.scheduler;

		let notification = match current {
			StreamStatus::Online => {
				if settings.broadcast.auto_start && !scheduler.is_active() {
					scheduler.start(&channel);
				}
				settings
					.notifications
					.stream_started_enabled
					.then_some(settings.notifications.stream_started_text)
			}
			StreamStatus::Offline => {
				if scheduler.is_active() {
					scheduler.stop();
				}
				settings
					.notifications
					.stream_stopped_enabled
					.then_some(settings.notifications.stream_stopped_text)
			}
			StreamStatus::Unknown => None,
		};

		if let Some(text) = notification.filter(|t| !t.trim().is_empty())
			&& let Err(e) = self.deps.messenger.send(&channel, &text).await
		{
			warn!(%channel, error = ?e, "failed to send stream notification");
		}
	}
}

struct Response {
	channel: ChannelName,
	out: Outgoing,
}

async fn chat_events(
	inner: Arc<Inner>,
	mut rx: broadcast::Receiver<ChatTransportEvent>,
	responses: mpsc::Sender<Response>,
	cancel: CancellationToken,
) {
	loop {
		let event = tokio::select! {
			_ = cancel.cancelled() => break,
			ev = rx.recv() => ev,
		};

		match event {
			Ok(ChatTransportEvent::Message(message)) => {
				if let Some(response) = inner.handle_message(*message)
					&& responses.try_send(response).is_err()
				{
					warn!("chat response queue full; dropping response");
				}
			}
			Ok(ChatTransportEvent::Log(line)) => inner.emit(BotEvent::TransportLog(line)),
			Ok(ChatTransportEvent::Connected) => debug!("chat transport connected"),
			Ok(ChatTransportEvent::Joined(channel)) => info!(%channel, "joined channel"),
			Ok(ChatTransportEvent::Disconnected { reason }) => {
				inner.emit(BotEvent::TransportLog(format!("disconnected: {reason}")));
			}
			Err(RecvError::Lagged(n)) => warn!(skipped = n, "chat events lagged"),
			Err(RecvError::Closed) => break,
		}
	}
}

/// Sends chat responses one at a time, in the order they were produced.
async fn responder(inner: Arc<Inner>, mut rx: mpsc::Receiver<Response>, cancel: CancellationToken) {
	loop {
		let response = tokio::select! {
			_ = cancel.cancelled() => break,
			response = rx.recv() => response,
		};
		match response {
			Some(response) => inner.send_response(response).await,
			None => break,
		}
	}
}

async fn monitor_events(inner: Arc<Inner>, mut rx: broadcast::Receiver<MonitorEvent>, cancel: CancellationToken) {
	loop {
		let event = tokio::select! {
			_ = cancel.cancelled() => break,
			ev = rx.recv() => ev,
		};

		match event {
			Ok(MonitorEvent::StatusChanged { current, info, .. }) => inner.on_stream_status(current, info).await,
			Ok(MonitorEvent::InfoUpdated(info)) => inner.emit(BotEvent::StreamStatus {
				status: StreamStatus::Online,
				info: Some(info),
			}),
			Ok(MonitorEvent::Error(e)) => inner.emit(BotEvent::MonitorError(e)),
			Ok(MonitorEvent::Stopped {
				reason: StopReason::ReconnectExhausted,
			}) => inner.emit(BotEvent::MonitoringStopped),
			Ok(MonitorEvent::Stopped { .. }) => {}
			Err(RecvError::Lagged(n)) => warn!(skipped = n, "monitor events lagged"),
			Err(RecvError::Closed) => break,
		}
	}
}
