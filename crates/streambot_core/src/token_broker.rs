#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use base64::Engine as _;
use futures::FutureExt as _;
use futures::future::{BoxFuture, Shared};
use parking_lot::{Mutex, RwLock};
use streambot_platform::{BrowserLauncher, OAuthClient, OAuthToken, TokenStore, TokenValidity};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AuthError;

const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct TokenBrokerConfig {
	/// How long an interactive flow waits for its callback.
	pub auth_timeout: Duration,
}

impl Default for TokenBrokerConfig {
	fn default() -> Self {
		Self {
			auth_timeout: DEFAULT_AUTH_TIMEOUT,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthFlowState {
	#[default]
	Idle,
	AwaitingCallback,
	ExchangingCode,
}

/// Account the current token belongs to, as reported by validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenIdentity {
	pub login: String,
	pub user_id: String,
}

type SharedRefresh = Shared<BoxFuture<'static, Result<OAuthToken, AuthError>>>;

struct PendingFlow {
	csrf_state: String,
	tx: oneshot::Sender<Result<String, AuthError>>,
}

#[derive(Default)]
struct FlowSlot {
	state: AuthFlowState,
	active: Option<u64>,
	pending: Option<PendingFlow>,
}

struct Inner {
	oauth: Arc<dyn OAuthClient>,
	store: Arc<dyn TokenStore>,
	browser: Arc<dyn BrowserLauncher>,
	cfg: TokenBrokerConfig,

	cached: RwLock<Option<OAuthToken>>,
	identity: RwLock<Option<TokenIdentity>>,
	refresh: Mutex<Option<SharedRefresh>>,
	flow: Mutex<FlowSlot>,
	next_flow_id: AtomicU64,
}

/// Owns the OAuth token lifecycle: validation, single-flight refresh and the
/// interactive authorization-code flow.
#[derive(Clone)]
pub struct TokenBroker {
	inner: Arc<Inner>,
}

/// Resets the flow slot when the waiting future ends, however it ends.
struct FlowGuard<'a> {
	inner: &'a Inner,
	id: u64,
}

impl Drop for FlowGuard<'_> {
	fn drop(&mut self) {
		let mut flow = self.inner.flow.lock();
		if flow.active == Some(self.id) {
			*flow = FlowSlot::default();
		}
	}
}

/// 32 random bytes, URL-safe base64 without padding.
pub fn generate_csrf_state() -> String {
	let bytes: [u8; 32] = rand::random();
	base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn states_match(expected: &str, provided: &str) -> bool {
	let (a, b) = (expected.as_bytes(), provided.as_bytes());
	a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn expires_soon(token: &OAuthToken) -> bool {
	token
		.expires_at
		.is_some_and(|at| at <= SystemTime::now() + EXPIRY_MARGIN)
}

impl TokenBroker {
	pub fn new(
		oauth: Arc<dyn OAuthClient>,
		store: Arc<dyn TokenStore>,
		browser: Arc<dyn BrowserLauncher>,
		cfg: TokenBrokerConfig,
	) -> Self {
		Self {
			inner: Arc::new(Inner {
				oauth,
				store,
				browser,
				cfg,
				cached: RwLock::new(None),
				identity: RwLock::new(None),
				refresh: Mutex::new(None),
				flow: Mutex::new(FlowSlot::default()),
				next_flow_id: AtomicU64::new(1),
			}),
		}
	}

	pub fn auth_state(&self) -> AuthFlowState {
		self.inner.flow.lock().state
	}

	pub fn identity(&self) -> Option<TokenIdentity> {
		self.inner.identity.read().clone()
	}

	pub fn cached_token(&self) -> Option<OAuthToken> {
		self.inner.cached.read().clone()
	}

	/// Cached or stored token if it validates, else a refreshed one, else the
	/// result of an interactive authorization.
	pub async fn get_valid_token(&self, cancel: &CancellationToken) -> Result<OAuthToken, AuthError> {
		if cancel.is_cancelled() {
			return Err(AuthError::Cancelled);
		}

		let current = match self.cached_token() {
			Some(t) => Some(t),
			None => self.inner.load_stored().await,
		};

		if let Some(token) = current {
			*self.inner.cached.write() = Some(token.clone());

			if !expires_soon(&token) {
				let valid = tokio::select! {
					_ = cancel.cancelled() => return Err(AuthError::Cancelled),
					v = self.inner.validate(&token) => v?,
				};
				if let Some(token) = valid {
					debug!("cached token is valid");
					return Ok(token);
				}
			}

			if token.refresh_token.is_some() {
				match self.refresh_token(cancel).await {
					Ok(t) => return Ok(t),
					Err(AuthError::Cancelled) => return Err(AuthError::Cancelled),
					Err(e) => warn!(error = %e, "token refresh failed; falling back to interactive auth"),
				}
			}
		}

		self.begin_interactive_auth(cancel).await
	}

	/// Exchanges the stored refresh token. Concurrent callers share one request.
	pub async fn refresh_token(&self, cancel: &CancellationToken) -> Result<OAuthToken, AuthError> {
		let fut = {
			let mut slot = self.inner.refresh.lock();
			match slot.as_ref() {
				Some(f) => {
					debug!("joining in-flight token refresh");
					f.clone()
				}
				None => {
					let inner = self.inner.clone();
					let task = tokio::spawn(async move {
						let res = inner.do_refresh().await;
						*inner.refresh.lock() = None;
						res
					});
					let f = async move {
						task.await
							.unwrap_or_else(|e| Err(AuthError::RefreshFailed(format!("refresh task failed: {e}"))))
					}
					.boxed()
					.shared();
					*slot = Some(f.clone());
					f
				}
			}
		};

		tokio::select! {
			_ = cancel.cancelled() => Err(AuthError::Cancelled),
			res = fut => res,
		}
	}

	/// Opens the authorization page and waits for `complete_auth`/`fail_auth`.
	pub async fn begin_interactive_auth(&self, cancel: &CancellationToken) -> Result<OAuthToken, AuthError> {
		let id = self.inner.next_flow_id.fetch_add(1, Ordering::Relaxed);
		let csrf_state = generate_csrf_state();
		let (tx, rx) = oneshot::channel();

		{
			let mut flow = self.inner.flow.lock();
			if flow.state != AuthFlowState::Idle {
				return Err(AuthError::AlreadyPending);
			}
			*flow = FlowSlot {
				state: AuthFlowState::AwaitingCallback,
				active: Some(id),
				pending: Some(PendingFlow {
					csrf_state: csrf_state.clone(),
					tx,
				}),
			};
		}
		let _guard = FlowGuard { inner: &self.inner, id };

		let url = self
			.inner
			.oauth
			.authorize_url(&csrf_state)
			.map_err(|e| AuthError::BrowserLaunchFailed(format!("{e:#}")))?;
		self.inner
			.browser
			.open(&url)
			.map_err(|e| AuthError::BrowserLaunchFailed(format!("{e:#}")))?;
		info!(flow_id = id, "waiting for authorization callback");

		let code = tokio::select! {
			_ = cancel.cancelled() => return Err(AuthError::Cancelled),
			_ = tokio::time::sleep(self.inner.cfg.auth_timeout) => {
				warn!(flow_id = id, "authorization timed out");
				return Err(AuthError::Timeout);
			}
			res = rx => match res {
				Ok(Ok(code)) => code,
				Ok(Err(e)) => return Err(e),
				Err(_) => return Err(AuthError::Cancelled),
			},
		};

		self.inner.flow.lock().state = AuthFlowState::ExchangingCode;

		let token = tokio::select! {
			_ = cancel.cancelled() => return Err(AuthError::Cancelled),
			res = self.inner.oauth.exchange_code(&code) => {
				res.map_err(|e| AuthError::ExchangeFailed(format!("{e:#}")))?
			}
		};

		let token = match self.inner.validate(&token).await {
			Ok(Some(t)) => t,
			Ok(None) => return Err(AuthError::InvalidCredentials),
			Err(e) => {
				warn!(error = %e, "could not validate exchanged token");
				token
			}
		};

		self.inner.adopt(&token).await;
		info!(flow_id = id, "interactive authorization complete");
		Ok(token)
	}

	/// Delivers the callback of the pending flow. A wrong `state` fails the
	/// flow instead of handing over the code.
	pub fn complete_auth(&self, code: &str, state: &str) -> Result<(), AuthError> {
		let mut flow = self.inner.flow.lock();
		let Some(pending) = flow.pending.take() else {
			debug!("authorization callback without a pending flow");
			return Err(AuthError::NoPendingFlow);
		};

		if !states_match(&pending.csrf_state, state) {
			warn!("authorization callback state mismatch");
			metrics::counter!("streambot_auth_state_mismatch_total").increment(1);
			let _ = pending.tx.send(Err(AuthError::StateMismatch));
			return Err(AuthError::StateMismatch);
		}

		let _ = pending.tx.send(Ok(code.to_string()));
		Ok(())
	}

	/// The provider reported an error (for example `access_denied`).
	pub fn fail_auth(&self, error: &str) -> Result<(), AuthError> {
		let Some(pending) = self.inner.flow.lock().pending.take() else {
			return Err(AuthError::NoPendingFlow);
		};
		let _ = pending.tx.send(Err(AuthError::UserDenied(error.to_string())));
		Ok(())
	}

	/// Forgets the cached and stored token.
	pub async fn sign_out(&self) -> anyhow::Result<()> {
		*self.inner.cached.write() = None;
		*self.inner.identity.write() = None;
		self.inner.store.clear().await
	}
}

impl Inner {
	async fn load_stored(&self) -> Option<OAuthToken> {
		match self.store.load().await {
			Ok(t) => t,
			Err(e) => {
				warn!(error = ?e, "failed to load stored token");
				None
			}
		}
	}

	/// `Ok(None)` when the provider rejects the token.
	async fn validate(&self, token: &OAuthToken) -> Result<Option<OAuthToken>, AuthError> {
		match self.oauth.validate(&token.access_token).await {
			Ok(TokenValidity::Valid {
				login,
				user_id,
				expires_in,
			}) => {
				let token = token.clone().with_expires_in(expires_in);
				*self.identity.write() = Some(TokenIdentity { login, user_id });
				*self.cached.write() = Some(token.clone());
				Ok(Some(token))
			}
			Ok(TokenValidity::Invalid) => Ok(None),
			Err(e) => Err(AuthError::Unreachable(format!("{e:#}"))),
		}
	}

	async fn do_refresh(&self) -> Result<OAuthToken, AuthError> {
		let cached_refresh = self.cached.read().as_ref().and_then(|t| t.refresh_token.clone());
		let refresh = match cached_refresh {
			Some(r) => Some(r),
			None => self.load_stored().await.and_then(|t| t.refresh_token),
		};
		let Some(refresh) = refresh else {
			return Err(AuthError::RefreshFailed("no refresh token".to_string()));
		};

		info!("refreshing access token");
		let mut token = self
			.oauth
			.refresh(&refresh)
			.await
			.map_err(|e| AuthError::RefreshFailed(format!("{e:#}")))?;
		if token.refresh_token.is_none() {
			token.refresh_token = Some(refresh);
		}

		let token = match self.validate(&token).await {
			Ok(Some(validated)) => validated,
			Ok(None) => return Err(AuthError::RefreshFailed("refreshed token was rejected".to_string())),
			Err(e) => {
				debug!(error = %e, "post-refresh validation skipped");
				token
			}
		};
		self.adopt(&token).await;
		metrics::counter!("streambot_token_refreshes_total").increment(1);
		Ok(token)
	}

	async fn adopt(&self, token: &OAuthToken) {
		*self.cached.write() = Some(token.clone());
		if let Err(e) = self.store.save(token).await {
			warn!(error = ?e, "failed to persist token");
		}
	}
}
