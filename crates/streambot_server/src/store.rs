#![forbid(unsafe_code)]

//! JSON file stores for the OAuth token and chat statistics.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use streambot_core::statistics::{StatisticsStore, StatsSnapshot};
use streambot_platform::{OAuthToken, SecretString, TokenStore};
use tracing::{debug, warn};

/// Reads `path`; an unparseable file is moved to `<path>.bak` and treated as absent.
async fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
	let raw = match tokio::fs::read(path).await {
		Ok(raw) => raw,
		Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
		Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
	};

	match serde_json::from_slice(&raw) {
		Ok(v) => Ok(Some(v)),
		Err(e) => {
			let backup = with_suffix(path, "bak");
			warn!(path = %path.display(), backup = %backup.display(), error = %e, "corrupt store file; moving aside");
			tokio::fs::rename(path, &backup)
				.await
				.with_context(|| format!("move corrupt {} aside", path.display()))?;
			Ok(None)
		}
	}
}

/// Temp file plus rename so readers never see a partial write.
async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
	if let Some(dir) = path.parent() {
		tokio::fs::create_dir_all(dir)
			.await
			.with_context(|| format!("create {}", dir.display()))?;
	}

	let body = serde_json::to_vec_pretty(value).context("serialize store file")?;
	let tmp = with_suffix(path, "tmp");
	tokio::fs::write(&tmp, &body)
		.await
		.with_context(|| format!("write {}", tmp.display()))?;
	tokio::fs::rename(&tmp, path)
		.await
		.with_context(|| format!("replace {}", path.display()))?;
	debug!(path = %path.display(), bytes = body.len(), "store file written");
	Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
	let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
	name.push(".");
	name.push(suffix);
	path.with_file_name(name)
}

#[derive(Serialize, Deserialize)]
struct StoredToken {
	access_token: String,
	refresh_token: Option<String>,
	expires_at_unix: Option<u64>,
	#[serde(default)]
	scopes: Vec<String>,
}

impl From<&OAuthToken> for StoredToken {
	fn from(t: &OAuthToken) -> Self {
		Self {
			access_token: t.access_token.expose().to_string(),
			refresh_token: t.refresh_token.as_ref().map(|r| r.expose().to_string()),
			expires_at_unix: t
				.expires_at
				.and_then(|at| at.duration_since(UNIX_EPOCH).ok())
				.map(|d| d.as_secs()),
			scopes: t.scopes.clone(),
		}
	}
}

impl From<StoredToken> for OAuthToken {
	fn from(s: StoredToken) -> Self {
		Self {
			access_token: SecretString::new(s.access_token),
			refresh_token: s.refresh_token.filter(|r| !r.trim().is_empty()).map(SecretString::new),
			expires_at: s.expires_at_unix.map(|secs| UNIX_EPOCH + Duration::from_secs(secs)),
			scopes: s.scopes,
		}
	}
}

pub struct FileTokenStore {
	path: PathBuf,
}

impl FileTokenStore {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}
}

#[async_trait::async_trait]
impl TokenStore for FileTokenStore {
	async fn load(&self) -> anyhow::Result<Option<OAuthToken>> {
		let stored: Option<StoredToken> = read_json(&self.path).await?;
		Ok(stored
			.filter(|s| !s.access_token.trim().is_empty())
			.map(OAuthToken::from))
	}

	async fn save(&self, token: &OAuthToken) -> anyhow::Result<()> {
		write_json_atomic(&self.path, &StoredToken::from(token)).await
	}

	async fn clear(&self) -> anyhow::Result<()> {
		match tokio::fs::remove_file(&self.path).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e).with_context(|| format!("remove {}", self.path.display())),
		}
	}
}

#[derive(Serialize, Deserialize)]
struct StoredStats {
	total_messages: u64,
	#[serde(default)]
	per_user: BTreeMap<String, u64>,
	#[serde(default)]
	sessions: u64,
	saved_at_unix: u64,
}

pub struct FileStatsStore {
	path: PathBuf,
}

impl FileStatsStore {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}
}

#[async_trait::async_trait]
impl StatisticsStore for FileStatsStore {
	async fn load(&self) -> anyhow::Result<Option<StatsSnapshot>> {
		let stored: Option<StoredStats> = read_json(&self.path).await?;
		Ok(stored.map(|s| StatsSnapshot {
			total_messages: s.total_messages,
			per_user: s.per_user,
			sessions: s.sessions,
			session_started_at: None,
		}))
	}

	async fn save(&self, snapshot: &StatsSnapshot) -> anyhow::Result<()> {
		let stored = StoredStats {
			total_messages: snapshot.total_messages,
			per_user: snapshot.per_user.clone(),
			sessions: snapshot.sessions,
			saved_at_unix: SystemTime::now()
				.duration_since(UNIX_EPOCH)
				.map(|d| d.as_secs())
				.unwrap_or_default(),
		};
		write_json_atomic(&self.path, &stored).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn missing_token_file_loads_as_none() {
		let dir = tempfile::tempdir().expect("tempdir");
		let store = FileTokenStore::new(dir.path().join("token.json"));

		assert!(store.load().await.expect("load").is_none());
		store.clear().await.expect("clear of a missing file");
	}

	#[tokio::test]
	async fn token_survives_a_save_and_load() {
		let dir = tempfile::tempdir().expect("tempdir");
		let path = dir.path().join("nested").join("token.json");
		let store = FileTokenStore::new(&path);

		let mut token = OAuthToken::new(SecretString::new("access")).with_expires_in(Duration::from_secs(3600));
		token.refresh_token = Some(SecretString::new("refresh"));
		store.save(&token).await.expect("save");

		let loaded = store.load().await.expect("load").expect("token present");
		assert_eq!(loaded.access_token.expose(), "access");
		assert_eq!(loaded.refresh_token.as_ref().map(|r| r.expose()), Some("refresh"));
		assert!(loaded.expires_at.is_some());
		assert!(!with_suffix(&path, "tmp").exists(), "temp file renamed away");

		store.clear().await.expect("clear");
		assert!(store.load().await.expect("load").is_none());
	}

	#[tokio::test]
	async fn corrupt_file_is_moved_aside() {
		let dir = tempfile::tempdir().expect("tempdir");
		let path = dir.path().join("statistics.json");
		std::fs::write(&path, b"{ not json").expect("seed");
		let store = FileStatsStore::new(&path);

		assert!(store.load().await.expect("load").is_none());
		assert!(!path.exists());
		assert_eq!(
			std::fs::read(dir.path().join("statistics.json.bak")).expect("backup"),
			b"{ not json"
		);

		let mut snapshot = StatsSnapshot {
			total_messages: 3,
			sessions: 1,
			..StatsSnapshot::default()
		};
		snapshot.per_user.insert("alice".to_string(), 3);
		store.save(&snapshot).await.expect("save");
		assert_eq!(store.load().await.expect("load"), Some(snapshot));
	}
}
