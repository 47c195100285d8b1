#![forbid(unsafe_code)]

use thiserror::Error;

/// Failures of token acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
	#[error("invalid credentials")]
	InvalidCredentials,

	#[error("failed to launch browser: {0}")]
	BrowserLaunchFailed(String),

	#[error("timed out waiting for authorization")]
	Timeout,

	/// The callback `state` did not match the pending flow.
	#[error("authorization state mismatch")]
	StateMismatch,

	#[error("authorization denied: {0}")]
	UserDenied(String),

	#[error("code exchange failed: {0}")]
	ExchangeFailed(String),

	#[error("token refresh failed: {0}")]
	RefreshFailed(String),

	#[error("an authorization flow is already pending")]
	AlreadyPending,

	#[error("no authorization flow is pending")]
	NoPendingFlow,

	#[error("authorization cancelled")]
	Cancelled,

	/// Validation endpoint could not be reached; the token may still be good.
	#[error("token validation unreachable: {0}")]
	Unreachable(String),
}

/// Terminal failures of a connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
	#[error("a connection is already active or in progress")]
	Busy,

	#[error("timed out waiting for chat connection")]
	Timeout,

	#[error("connection cancelled")]
	Cancelled,

	#[error("chat transport failure: {0}")]
	TransportFailure(String),

	#[error(transparent)]
	Auth(#[from] AuthError),

	#[error("configuration error: {0}")]
	Configuration(String),
}

/// Stream monitoring failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorError {
	#[error("channel not found: {0}")]
	ChannelNotFound(String),

	#[error("already monitoring {0}")]
	AlreadyMonitoring(String),

	#[error("stream subscription failed: {0}")]
	SubscriptionFailure(String),

	#[error("stream subscription reconnect exhausted after {attempts} attempts")]
	ReconnectExhausted { attempts: u32 },

	#[error("stream status poll failed: {0}")]
	Poll(String),

	#[error("not monitoring")]
	NotMonitoring,
}

/// Result of `BotSession::start_connection`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
	Connected,
	Cancelled,
	Failed(ConnectionError),
}

impl StartOutcome {
	pub fn is_connected(&self) -> bool {
		matches!(self, StartOutcome::Connected)
	}
}

impl From<ConnectionError> for StartOutcome {
	fn from(e: ConnectionError) -> Self {
		match e {
			ConnectionError::Cancelled | ConnectionError::Auth(AuthError::Cancelled) => StartOutcome::Cancelled,
			other => StartOutcome::Failed(other),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cancelled_auth_maps_to_cancelled_outcome() {
		assert_eq!(
			StartOutcome::from(ConnectionError::Auth(AuthError::Cancelled)),
			StartOutcome::Cancelled
		);
		assert_eq!(
			StartOutcome::from(ConnectionError::Timeout),
			StartOutcome::Failed(ConnectionError::Timeout)
		);
	}
}
