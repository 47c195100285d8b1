#![forbid(unsafe_code)]

//! In-memory collaborators for unit tests.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use streambot_domain::{BroadcasterId, ChannelName, ChatMessage, StreamInfo, UserRef};
use streambot_platform::{
	BrowserLauncher, ChatCredentials, ChatTransport, ChatTransportEvent, DecorationSet, DecorationSource, Messenger,
	OAuthClient, OAuthToken, SecretString, StreamApi, StreamEvent, StreamEventSource, StreamSubscription, TokenStore,
	TokenValidity,
};
use tokio::sync::{Notify, broadcast, mpsc};
use url::Url;

use crate::statistics::{StatisticsStore, StatsSnapshot};
use crate::stream_monitor::StreamInfoSource;

pub(crate) fn channel(name: &str) -> ChannelName {
	ChannelName::new(name).expect("valid channel")
}

pub(crate) fn chat_message(id: &str, login: &str, text: &str) -> ChatMessage {
	ChatMessage {
		id: id.to_string(),
		channel: channel("test"),
		author: UserRef {
			id: format!("u-{login}"),
			login: login.to_string(),
			display: None,
		},
		text: text.to_string(),
		badges: Vec::new(),
		emotes: Vec::new(),
		timestamp: SystemTime::now(),
	}
}

pub(crate) fn live_info(title: &str) -> StreamInfo {
	StreamInfo {
		title: title.to_string(),
		game: Some("Software and Game Development".to_string()),
		viewers: Some(12),
		started_at: Some(SystemTime::now()),
	}
}

pub(crate) fn token(access: &str, refresh: Option<&str>) -> OAuthToken {
	let mut t = OAuthToken::new(SecretString::new(access));
	t.refresh_token = refresh.map(SecretString::new);
	t
}

/// OAuth endpoints that accept a configurable set of access tokens.
#[derive(Default)]
pub(crate) struct FakeOAuth {
	pub valid: Mutex<HashSet<String>>,
	pub unreachable: AtomicBool,
	pub refresh_fails: AtomicBool,
	pub refresh_delay: Mutex<Duration>,
	pub refresh_calls: AtomicUsize,
	pub exchanged_codes: Mutex<Vec<String>>,
}

impl FakeOAuth {
	pub fn accepting(tokens: &[&str]) -> Self {
		let fake = Self::default();
		fake.valid.lock().extend(tokens.iter().map(|t| t.to_string()));
		fake
	}
}

#[async_trait::async_trait]
impl OAuthClient for FakeOAuth {
	fn authorize_url(&self, state: &str) -> anyhow::Result<Url> {
		let mut url = Url::parse("https://id.example.test/oauth2/authorize")?;
		url.query_pairs_mut().append_pair("state", state);
		Ok(url)
	}

	async fn validate(&self, access_token: &SecretString) -> anyhow::Result<TokenValidity> {
		if self.unreachable.load(Ordering::SeqCst) {
			anyhow::bail!("connection refused");
		}
		if self.valid.lock().contains(access_token.expose()) {
			Ok(TokenValidity::Valid {
				login: "botuser".to_string(),
				user_id: "1000".to_string(),
				expires_in: Duration::from_secs(3600),
			})
		} else {
			Ok(TokenValidity::Invalid)
		}
	}

	async fn refresh(&self, _refresh_token: &SecretString) -> anyhow::Result<OAuthToken> {
		let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
		let delay = *self.refresh_delay.lock();
		if !delay.is_zero() {
			tokio::time::sleep(delay).await;
		}
		if self.refresh_fails.load(Ordering::SeqCst) {
			anyhow::bail!("invalid refresh token");
		}
		let access = format!("refreshed-{n}");
		self.valid.lock().insert(access.clone());
		Ok(token(&access, Some(&format!("refresh-{n}"))))
	}

	async fn exchange_code(&self, code: &str) -> anyhow::Result<OAuthToken> {
		self.exchanged_codes.lock().push(code.to_string());
		let access = format!("exchanged-{code}");
		self.valid.lock().insert(access.clone());
		Ok(token(&access, Some("refresh-exchanged")))
	}
}

#[derive(Default)]
pub(crate) struct MemoryTokenStore {
	pub token: Mutex<Option<OAuthToken>>,
	pub saves: AtomicUsize,
}

impl MemoryTokenStore {
	pub fn with(token: OAuthToken) -> Self {
		Self {
			token: Mutex::new(Some(token)),
			saves: AtomicUsize::new(0),
		}
	}
}

#[async_trait::async_trait]
impl TokenStore for MemoryTokenStore {
	async fn load(&self) -> anyhow::Result<Option<OAuthToken>> {
		Ok(self.token.lock().clone())
	}

	async fn save(&self, token: &OAuthToken) -> anyhow::Result<()> {
		self.saves.fetch_add(1, Ordering::SeqCst);
		*self.token.lock() = Some(token.clone());
		Ok(())
	}

	async fn clear(&self) -> anyhow::Result<()> {
		*self.token.lock() = None;
		Ok(())
	}
}

/// Records opened URLs and forwards them to the test.
pub(crate) struct FakeBrowser {
	pub fail: AtomicBool,
	pub opened: Mutex<Vec<Url>>,
	notify: mpsc::UnboundedSender<Url>,
}

impl FakeBrowser {
	pub fn new() -> (Self, mpsc::UnboundedReceiver<Url>) {
		let (notify, rx) = mpsc::unbounded_channel();
		(
			Self {
				fail: AtomicBool::new(false),
				opened: Mutex::new(Vec::new()),
				notify,
			},
			rx,
		)
	}
}

impl BrowserLauncher for FakeBrowser {
	fn open(&self, url: &Url) -> anyhow::Result<()> {
		if self.fail.load(Ordering::SeqCst) {
			anyhow::bail!("no browser");
		}
		self.opened.lock().push(url.clone());
		let _ = self.notify.send(url.clone());
		Ok(())
	}
}

pub(crate) fn state_param(url: &Url) -> String {
	url.query_pairs()
		.find(|(k, _)| k == "state")
		.map(|(_, v)| v.into_owned())
		.unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Sent {
	pub channel: String,
	pub reply_to: Option<String>,
	pub text: String,
}

#[derive(Default)]
pub(crate) struct FakeMessenger {
	pub sent: Mutex<Vec<Sent>>,
	pub fail: AtomicBool,
	/// Held by the next send only.
	pub next_delay: Mutex<Option<Duration>>,
}

impl FakeMessenger {
	async fn lag(&self) {
		let delay = self.next_delay.lock().take();
		if let Some(delay) = delay {
			tokio::time::sleep(delay).await;
		}
	}

	pub fn texts(&self) -> Vec<String> {
		self.sent.lock().iter().map(|s| s.text.clone()).collect()
	}
}

#[async_trait::async_trait]
impl Messenger for FakeMessenger {
	async fn send(&self, channel: &ChannelName, text: &str) -> anyhow::Result<()> {
		self.lag().await;
		if self.fail.load(Ordering::SeqCst) {
			anyhow::bail!("send failed");
		}
		self.sent.lock().push(Sent {
			channel: channel.to_string(),
			reply_to: None,
			text: text.to_string(),
		});
		Ok(())
	}

	async fn reply(&self, channel: &ChannelName, parent_message_id: &str, text: &str) -> anyhow::Result<()> {
		self.lag().await;
		if self.fail.load(Ordering::SeqCst) {
			anyhow::bail!("send failed");
		}
		self.sent.lock().push(Sent {
			channel: channel.to_string(),
			reply_to: Some(parent_message_id.to_string()),
			text: text.to_string(),
		});
		Ok(())
	}
}

/// Stream metadata fixed by the test.
#[derive(Default)]
pub(crate) struct StaticStream(pub Mutex<Option<StreamInfo>>);

impl StreamInfoSource for StaticStream {
	fn current_stream(&self) -> Option<StreamInfo> {
		self.0.lock().clone()
	}
}

pub(crate) struct FakeStreamApi {
	pub broadcaster: Mutex<Option<BroadcasterId>>,
	pub stream: Mutex<Option<StreamInfo>>,
	pub fail: AtomicBool,
	pub fetch_calls: AtomicUsize,
	fetch_gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeStreamApi {
	/// Every later fetch waits for one `notify_one` on the returned gate.
	pub fn gate_fetches(&self) -> Arc<Notify> {
		let gate = Arc::new(Notify::new());
		*self.fetch_gate.lock() = Some(gate.clone());
		gate
	}
}

impl Default for FakeStreamApi {
	fn default() -> Self {
		Self {
			broadcaster: Mutex::new(Some(BroadcasterId::new("42").expect("valid id"))),
			stream: Mutex::new(None),
			fail: AtomicBool::new(false),
			fetch_calls: AtomicUsize::new(0),
			fetch_gate: Mutex::new(None),
		}
	}
}

#[async_trait::async_trait]
impl StreamApi for FakeStreamApi {
	async fn resolve_broadcaster(&self, _channel: &ChannelName) -> anyhow::Result<Option<BroadcasterId>> {
		Ok(self.broadcaster.lock().clone())
	}

	async fn fetch_stream(&self, _broadcaster: &BroadcasterId) -> anyhow::Result<Option<StreamInfo>> {
		self.fetch_calls.fetch_add(1, Ordering::SeqCst);
		let gate = self.fetch_gate.lock().clone();
		if let Some(gate) = gate {
			gate.notified().await;
		}
		if self.fail.load(Ordering::SeqCst) {
			anyhow::bail!("helix unavailable");
		}
		Ok(self.stream.lock().clone())
	}
}

/// Hands out subscriptions whose sending ends the test drives.
#[derive(Default)]
pub(crate) struct FakeStreamEvents {
	pub fail: AtomicBool,
	pub subscribe_calls: AtomicUsize,
	senders: Mutex<Vec<mpsc::Sender<StreamEvent>>>,
}

impl FakeStreamEvents {
	pub async fn push(&self, event: StreamEvent) {
		let tx = self.senders.lock().last().cloned().expect("no subscription");
		tx.send(event).await.expect("subscription receiver alive");
	}

	pub fn active_senders(&self) -> usize {
		self.senders.lock().iter().filter(|s| !s.is_closed()).count()
	}
}

#[async_trait::async_trait]
impl StreamEventSource for FakeStreamEvents {
	async fn subscribe(&self, _broadcaster: &BroadcasterId) -> anyhow::Result<StreamSubscription> {
		self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
		if self.fail.load(Ordering::SeqCst) {
			anyhow::bail!("eventsub unavailable");
		}
		let (tx, rx) = mpsc::channel(16);
		self.senders.lock().push(tx);
		Ok(StreamSubscription::new(rx, None))
	}
}

/// Chat transport that confirms the connection only when told to.
pub(crate) struct FakeChat {
	pub auto_confirm: AtomicBool,
	pub connected: AtomicBool,
	pub fail_connect: AtomicBool,
	pub credentials: Mutex<Option<ChatCredentials>>,
	pub connect_calls: AtomicUsize,
	pub disconnect_calls: AtomicUsize,
	events: broadcast::Sender<ChatTransportEvent>,
}

impl FakeChat {
	pub fn new(auto_confirm: bool) -> Self {
		let (events, _) = broadcast::channel(64);
		Self {
			auto_confirm: AtomicBool::new(auto_confirm),
			connected: AtomicBool::new(false),
			fail_connect: AtomicBool::new(false),
			credentials: Mutex::new(None),
			connect_calls: AtomicUsize::new(0),
			disconnect_calls: AtomicUsize::new(0),
			events,
		}
	}

	pub fn emit(&self, event: ChatTransportEvent) {
		let _ = self.events.send(event);
	}
}

#[async_trait::async_trait]
impl ChatTransport for FakeChat {
	fn set_credentials(&self, credentials: ChatCredentials) {
		*self.credentials.lock() = Some(credentials);
	}

	async fn connect(&self, channel: &ChannelName) -> anyhow::Result<()> {
		self.connect_calls.fetch_add(1, Ordering::SeqCst);
		if self.fail_connect.load(Ordering::SeqCst) {
			anyhow::bail!("socket refused");
		}
		if self.auto_confirm.load(Ordering::SeqCst) {
			self.connected.store(true, Ordering::SeqCst);
			self.emit(ChatTransportEvent::Connected);
			self.emit(ChatTransportEvent::Joined(channel.clone()));
		}
		Ok(())
	}

	async fn disconnect(&self) -> anyhow::Result<()> {
		self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
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

#[derive(Default)]
pub(crate) struct EmptyDecorations {
	pub loads: AtomicUsize,
}

#[async_trait::async_trait]
impl DecorationSource for EmptyDecorations {
	async fn load(&self, _channel: &ChannelName) -> anyhow::Result<DecorationSet> {
		self.loads.fetch_add(1, Ordering::SeqCst);
		Ok(DecorationSet::default())
	}
}

#[derive(Default)]
pub(crate) struct MemoryStatsStore {
	pub saved: Mutex<Vec<StatsSnapshot>>,
}

#[async_trait::async_trait]
impl StatisticsStore for MemoryStatsStore {
	async fn load(&self) -> anyhow::Result<Option<StatsSnapshot>> {
		Ok(self.saved.lock().last().cloned())
	}

	async fn save(&self, snapshot: &StatsSnapshot) -> anyhow::Result<()> {
		self.saved.lock().push(snapshot.clone());
		Ok(())
	}
}
