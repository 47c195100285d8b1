#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::time::SystemTime;

use parking_lot::Mutex;
use streambot_domain::UserRef;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudienceEntry {
	pub user_id: String,
	pub display_name: String,
	pub first_seen_at: SystemTime,
}

#[derive(Default)]
struct Seen {
	ids: HashSet<String>,
	entries: Vec<AudienceEntry>,
}

/// First-seen bookkeeping for the current session.
#[derive(Default)]
pub struct AudienceTracker {
	seen: Mutex<Seen>,
}

impl AudienceTracker {
	pub fn new() -> Self {
		Self::default()
	}

	/// Records `user`; `true` on their first message since the last `clear_all`.
	pub fn observe(&self, user: &UserRef) -> bool {
		let mut seen = self.seen.lock();
		if !seen.ids.insert(user.id.clone()) {
			return false;
		}
		seen.entries.push(AudienceEntry {
			user_id: user.id.clone(),
			display_name: user.display_name().to_string(),
			first_seen_at: SystemTime::now(),
		});
		true
	}

	pub fn has_seen(&self, user_id: &str) -> bool {
		self.seen.lock().ids.contains(user_id)
	}

	pub fn len(&self) -> usize {
		self.seen.lock().entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Entries in first-seen order.
	pub fn entries(&self) -> Vec<AudienceEntry> {
		self.seen.lock().entries.clone()
	}

	pub fn clear_all(&self) {
		*self.seen.lock() = Seen::default();
	}

	/// Farewell addressed to everyone seen this session, `None` when nobody was.
	pub fn collective_farewell(&self, template: &str) -> Option<String> {
		let seen = self.seen.lock();
		if seen.entries.is_empty() || template.trim().is_empty() {
			return None;
		}
		let names = seen
			.entries
			.iter()
			.map(|e| e.display_name.as_str())
			.collect::<Vec<_>>()
			.join(", ");
		Some(template.replace("{users}", &names))
	}
}

pub fn welcome_text(template: &str, user: &UserRef) -> Option<String> {
	let text = template.replace("{user}", user.display_name());
	(!text.trim().is_empty()).then_some(text)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn user(id: &str, name: &str) -> UserRef {
		UserRef {
			id: id.to_string(),
			login: name.to_lowercase(),
			display: Some(name.to_string()),
		}
	}

	#[test]
	fn first_message_only_until_cleared() {
		let tracker = AudienceTracker::new();
		let alice = user("1", "Alice");

		assert!(tracker.observe(&alice));
		assert!(!tracker.observe(&alice));
		assert!(!tracker.observe(&alice));

		tracker.clear_all();
		assert!(tracker.observe(&alice));
	}

	#[test]
	fn farewell_lists_everyone_in_order() {
		let tracker = AudienceTracker::new();
		assert_eq!(tracker.collective_farewell("bye {users}"), None);

		tracker.observe(&user("1", "Alice"));
		tracker.observe(&user("2", "Bob"));
		tracker.observe(&user("1", "Alice"));

		assert_eq!(tracker.collective_farewell("bye {users}!").as_deref(), Some("bye Alice, Bob!"));
	}

	#[test]
	fn welcome_substitutes_display_name() {
		assert_eq!(welcome_text("hi {user}", &user("1", "Alice")).as_deref(), Some("hi Alice"));
		assert_eq!(welcome_text("  ", &user("1", "Alice")), None);
	}
}
