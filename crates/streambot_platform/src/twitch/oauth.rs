#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use super::TwitchContext;
use crate::{OAuthClient, OAuthToken, SecretString, TokenValidity};

/// Twitch identity endpoints (authorization code grant).
#[derive(Clone)]
pub struct TwitchOAuth {
	ctx: TwitchContext,
}

#[derive(Debug, Clone, Deserialize)]
struct TwitchTokenValidation {
	login: String,
	user_id: String,
	expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct TwitchTokenResponse {
	access_token: String,
	#[serde(default)]
	refresh_token: Option<String>,
	#[serde(default)]
	expires_in: Option<u64>,
	#[serde(default)]
	scope: Vec<String>,
}

impl TwitchTokenResponse {
	fn into_token(self) -> OAuthToken {
		let mut token = OAuthToken::new(SecretString::new(self.access_token));
		token.refresh_token = self.refresh_token.filter(|s| !s.trim().is_empty()).map(SecretString::new);
		token.scopes = self.scope;
		match self.expires_in {
			Some(secs) => token.with_expires_in(Duration::from_secs(secs)),
			None => token,
		}
	}
}

impl TwitchOAuth {
	pub fn new(ctx: TwitchContext) -> Self {
		Self { ctx }
	}

	fn endpoint(&self, path: &str) -> anyhow::Result<Url> {
		Url::parse(&self.ctx.config().id_base_url)
			.context("parse id_base_url")?
			.join(path)
			.context("join id url")
	}

	fn client_secret(&self) -> anyhow::Result<&str> {
		self.ctx
			.config()
			.client_secret
			.as_ref()
			.map(SecretString::expose)
			.filter(|s| !s.trim().is_empty())
			.context("twitch client_secret is not configured")
	}

	async fn token_request(&self, form: &[(&str, &str)], label: &'static str) -> anyhow::Result<OAuthToken> {
		let resp = self
			.ctx
			.http()
			.post(self.endpoint("/oauth2/token")?)
			.form(form)
			.send()
			.await
			.with_context(|| format!("twitch {label} request"))?;

		let status = resp.status();
		let body = resp.text().await.with_context(|| format!("twitch {label} read body"))?;

		if !status.is_success() {
			anyhow::bail!("twitch {label} failed: status={status} body={body}");
		}

		let parsed: TwitchTokenResponse =
			serde_json::from_str(&body).with_context(|| format!("twitch {label} parse json"))?;
		Ok(parsed.into_token())
	}
}

#[async_trait::async_trait]
impl OAuthClient for TwitchOAuth {
	fn authorize_url(&self, state: &str) -> anyhow::Result<Url> {
		let cfg = self.ctx.config();
		let mut url = self.endpoint("/oauth2/authorize")?;
		url.query_pairs_mut()
			.append_pair("response_type", "code")
			.append_pair("client_id", &cfg.client_id)
			.append_pair("redirect_uri", &cfg.redirect_uri)
			.append_pair("scope", &cfg.scopes.join(" "))
			.append_pair("state", state);
		Ok(url)
	}

	async fn validate(&self, access_token: &SecretString) -> anyhow::Result<TokenValidity> {
		let resp = self
			.ctx
			.http()
			.get(self.endpoint("/oauth2/validate")?)
			.header("Authorization", format!("OAuth {}", access_token.expose()))
			.send()
			.await
			.context("twitch validate token request")?;

		let status = resp.status();
		if status == StatusCode::UNAUTHORIZED {
			return Ok(TokenValidity::Invalid);
		}

		let body = resp.text().await.context("twitch validate token read body")?;
		if !status.is_success() {
			anyhow::bail!("twitch validate token failed: status={status} body={body}");
		}

		let parsed: TwitchTokenValidation = serde_json::from_str(&body).context("twitch validate token parse json")?;
		metrics::counter!("streambot_token_validations_total").increment(1);
		Ok(TokenValidity::Valid {
			login: parsed.login,
			user_id: parsed.user_id,
			expires_in: Duration::from_secs(parsed.expires_in),
		})
	}

	async fn refresh(&self, refresh_token: &SecretString) -> anyhow::Result<OAuthToken> {
		let client_id = self.ctx.config().client_id.clone();
		let secret = self.client_secret()?;
		self.token_request(
			&[
				("grant_type", "refresh_token"),
				("client_id", &client_id),
				("client_secret", secret),
				("refresh_token", refresh_token.expose()),
			],
			"refresh token",
		)
		.await
	}

	async fn exchange_code(&self, code: &str) -> anyhow::Result<OAuthToken> {
		let cfg = self.ctx.config();
		let secret = self.client_secret()?;
		self.token_request(
			&[
				("grant_type", "authorization_code"),
				("client_id", &cfg.client_id),
				("client_secret", secret),
				("code", code),
				("redirect_uri", &cfg.redirect_uri),
			],
			"exchange code",
		)
		.await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::twitch::TwitchConfig;

	#[test]
	fn authorize_url_carries_state_and_scopes() {
		let ctx = TwitchContext::new(TwitchConfig::new("cid")).unwrap();
		let url = TwitchOAuth::new(ctx).authorize_url("abc123").unwrap();
		let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();

		assert_eq!(url.path(), "/oauth2/authorize");
		assert_eq!(pairs.get("state").map(String::as_str), Some("abc123"));
		assert_eq!(pairs.get("client_id").map(String::as_str), Some("cid"));
		assert!(pairs.get("scope").is_some_and(|s| s.contains("user:write:chat")));
	}

	#[test]
	fn token_response_keeps_refresh_token() {
		let raw = r#"{"access_token":"a","refresh_token":"r","expires_in":3600,"scope":["user:read:chat"],"token_type":"bearer"}"#;
		let token = serde_json::from_str::<TwitchTokenResponse>(raw).unwrap().into_token();
		assert_eq!(token.access_token.expose(), "a");
		assert_eq!(token.refresh_token.as_ref().map(SecretString::expose), Some("r"));
		assert!(token.expires_at.is_some());
	}

	#[test]
	fn refresh_requires_client_secret() {
		let ctx = TwitchContext::new(TwitchConfig::new("cid")).unwrap();
		assert!(TwitchOAuth::new(ctx).client_secret().is_err());
	}
}
