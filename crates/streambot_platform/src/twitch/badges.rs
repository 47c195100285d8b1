#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Context;
use parking_lot::Mutex;
use streambot_domain::{ChannelName, Decoration, DecorationKind};
use tracing::debug;

use super::TwitchContext;
use super::helix::HelixBadgeSet;
use crate::{DecorationSet, DecorationSource};

const BADGES_TTL: Duration = Duration::from_secs(600);

struct CachedSet {
	fetched_at: Instant,
	set: DecorationSet,
}

/// Global and channel chat badges, cached per channel.
pub struct TwitchDecorations {
	ctx: TwitchContext,
	cache: Mutex<HashMap<ChannelName, CachedSet>>,
}

impl TwitchDecorations {
	pub fn new(ctx: TwitchContext) -> Self {
		Self {
			ctx,
			cache: Mutex::new(HashMap::new()),
		}
	}

	fn cached(&self, channel: &ChannelName) -> Option<DecorationSet> {
		let mut guard = self.cache.lock();
		guard.retain(|_, entry| entry.fetched_at.elapsed() <= BADGES_TTL);
		guard.get(channel).map(|entry| entry.set.clone())
	}
}

fn badge_decorations(sets: Vec<HelixBadgeSet>, out: &mut HashMap<String, Decoration>) {
	for set in sets {
		for version in set.versions {
			let key = format!("{}:{}", set.set_id, version.id);
			let name = version.title.unwrap_or_else(|| key.clone());
			out.insert(
				key,
				Decoration {
					kind: DecorationKind::Badge,
					id: format!("{}:{}", set.set_id, version.id),
					name,
					image_url: version.image_url_1x,
				},
			);
		}
	}
}

#[async_trait::async_trait]
impl DecorationSource for TwitchDecorations {
	async fn load(&self, channel: &ChannelName) -> anyhow::Result<DecorationSet> {
		if let Some(set) = self.cached(channel) {
			return Ok(set);
		}

		let helix = self.ctx.helix()?;
		let broadcaster = helix
			.get_user_by_login(channel.as_str())
			.await?
			.with_context(|| format!("channel not found: {channel}"))?;

		let global = helix.get_global_badges().await?;
		let local = helix.get_channel_badges(&broadcaster.id).await?;

		// Channel badges override global versions with the same key.
		let mut badges = HashMap::new();
		badge_decorations(global, &mut badges);
		badge_decorations(local, &mut badges);

		debug!(%channel, count = badges.len(), "loaded chat badges");
		let set = DecorationSet { badges };
		self.cache.lock().insert(
			channel.clone(),
			CachedSet {
				fetched_at: Instant::now(),
				set: set.clone(),
			},
		);
		Ok(set)
	}
}
