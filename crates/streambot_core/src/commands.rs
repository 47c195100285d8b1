#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use streambot_domain::{ChatMessage, StreamInfo};
use tokio::time::Instant;
use tracing::debug;

use crate::settings::CommandSettings;

/// How a command response is delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseMode {
	/// Threaded reply; `None` targets the invoking message.
	Reply { target: Option<String> },
	Normal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
	pub mode: ResponseMode,
	pub text: String,
}

impl CommandResponse {
	pub fn reply(text: impl Into<String>) -> Self {
		Self {
			mode: ResponseMode::Reply { target: None },
			text: text.into(),
		}
	}

	pub fn normal(text: impl Into<String>) -> Self {
		Self {
			mode: ResponseMode::Normal,
			text: text.into(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
	NotACommand,
	/// Recognized but nothing to say (cooldown, empty output).
	Silent,
	Respond(CommandResponse),
}

pub struct CommandContext<'a> {
	pub message: &'a ChatMessage,
	pub args: &'a str,
	pub stream: Option<&'a StreamInfo>,
	pub prefix: &'a str,
	/// Every registered trigger, sorted.
	pub triggers: &'a [String],
}

pub trait Command: Send + Sync {
	fn trigger(&self) -> &str;

	fn execute(&self, ctx: &CommandContext<'_>) -> Option<CommandResponse>;
}

struct HelpCommand;

impl Command for HelpCommand {
	fn trigger(&self) -> &str {
		"help"
	}

	fn execute(&self, ctx: &CommandContext<'_>) -> Option<CommandResponse> {
		let others: Vec<String> = ctx
			.triggers
			.iter()
			.filter(|t| t.as_str() != self.trigger())
			.map(|t| format!("{}{t}", ctx.prefix))
			.collect();
		if others.is_empty() {
			return Some(CommandResponse::reply("No commands available."));
		}
		Some(CommandResponse::reply(format!("Commands: {}", others.join(", "))))
	}
}

struct UptimeCommand;

fn format_uptime(elapsed: Duration) -> String {
	let mins = elapsed.as_secs() / 60;
	let (h, m) = (mins / 60, mins % 60);
	if h > 0 { format!("{h}h {m}m") } else { format!("{m}m") }
}

impl Command for UptimeCommand {
	fn trigger(&self) -> &str {
		"uptime"
	}

	fn execute(&self, ctx: &CommandContext<'_>) -> Option<CommandResponse> {
		let text = match ctx.stream.and_then(|s| s.started_at) {
			Some(started) => {
				let elapsed = SystemTime::now().duration_since(started).unwrap_or_default();
				format!("Live for {}", format_uptime(elapsed))
			}
			None if ctx.stream.is_some() => "The stream is live.".to_string(),
			None => "The stream is offline.".to_string(),
		};
		Some(CommandResponse::reply(text))
	}
}

struct TitleCommand;

impl Command for TitleCommand {
	fn trigger(&self) -> &str {
		"title"
	}

	fn execute(&self, ctx: &CommandContext<'_>) -> Option<CommandResponse> {
		let title = ctx.stream.map(|s| s.title.trim()).filter(|t| !t.is_empty())?;
		Some(CommandResponse::reply(format!("Title: {title}")))
	}
}

struct GameCommand;

impl Command for GameCommand {
	fn trigger(&self) -> &str {
		"game"
	}

	fn execute(&self, ctx: &CommandContext<'_>) -> Option<CommandResponse> {
		let game = ctx.stream.and_then(|s| s.game.as_deref())?;
		Some(CommandResponse::reply(format!("Playing {game}")))
	}
}

/// Fixed text; `{user}` and `{args}` are substituted.
struct TextCommand {
	trigger: String,
	text: String,
}

impl Command for TextCommand {
	fn trigger(&self) -> &str {
		&self.trigger
	}

	fn execute(&self, ctx: &CommandContext<'_>) -> Option<CommandResponse> {
		let text = self
			.text
			.replace("{user}", ctx.message.author.display_name())
			.replace("{args}", ctx.args);
		let text = text.trim();
		(!text.is_empty()).then(|| CommandResponse::normal(text))
	}
}

struct Registry {
	prefix: String,
	cooldown: Duration,
	commands: BTreeMap<String, Arc<dyn Command>>,
	triggers: Vec<String>,
}

impl Registry {
	fn build(settings: &CommandSettings) -> Self {
		let mut commands: BTreeMap<String, Arc<dyn Command>> = BTreeMap::new();
		for (trigger, text) in &settings.custom {
			let trigger = trigger.trim();
			let trigger = trigger.strip_prefix(settings.prefix.as_str()).unwrap_or(trigger).to_lowercase();
			if trigger.is_empty() || trigger.contains(char::is_whitespace) {
				debug!(%trigger, "skipping invalid custom command");
				continue;
			}
			commands.insert(
				trigger.clone(),
				Arc::new(TextCommand {
					trigger,
					text: text.clone(),
				}),
			);
		}

		let builtins: [Arc<dyn Command>; 4] = [
			Arc::new(HelpCommand),
			Arc::new(UptimeCommand),
			Arc::new(TitleCommand),
			Arc::new(GameCommand),
		];
		for cmd in builtins {
			// Help always stays built in; the others can be overridden.
			if cmd.trigger() == "help" || !commands.contains_key(cmd.trigger()) {
				commands.insert(cmd.trigger().to_string(), cmd);
			}
		}

		let triggers = commands.keys().cloned().collect();
		Self {
			prefix: settings.prefix.clone(),
			cooldown: settings.cooldown(),
			commands,
			triggers,
		}
	}
}

/// Parses prefixed chat text into command invocations.
pub struct CommandProcessor {
	registry: RwLock<Registry>,
	last_used: Mutex<HashMap<String, Instant>>,
}

/// `(trigger, args)` when `text` starts with `prefix`.
pub fn parse_invocation<'a>(prefix: &str, text: &'a str) -> Option<(String, &'a str)> {
	if prefix.is_empty() {
		return None;
	}
	let rest = text.trim_start().strip_prefix(prefix)?;
	let (trigger, args) = match rest.split_once(char::is_whitespace) {
		Some((t, a)) => (t, a.trim()),
		None => (rest, ""),
	};
	if trigger.is_empty() {
		return None;
	}
	Some((trigger.to_lowercase(), args))
}

impl CommandProcessor {
	pub fn new(settings: &CommandSettings) -> Self {
		Self {
			registry: RwLock::new(Registry::build(settings)),
			last_used: Mutex::new(HashMap::new()),
		}
	}

	pub fn reconfigure(&self, settings: &CommandSettings) {
		*self.registry.write() = Registry::build(settings);
	}

	pub fn triggers(&self) -> Vec<String> {
		self.registry.read().triggers.clone()
	}

	pub fn process(&self, message: &ChatMessage, stream: Option<&StreamInfo>) -> CommandOutcome {
		let registry = self.registry.read();
		let Some((trigger, args)) = parse_invocation(&registry.prefix, &message.text) else {
			return CommandOutcome::NotACommand;
		};
		let Some(command) = registry.commands.get(&trigger) else {
			return CommandOutcome::NotACommand;
		};

		let privileged = message.is_broadcaster() || message.is_moderator();
		if !privileged
			&& let Some(last) = self.last_used.lock().get(&trigger)
			&& last.elapsed() < registry.cooldown
		{
			debug!(%trigger, "command on cooldown");
			return CommandOutcome::Silent;
		}

		let ctx = CommandContext {
			message,
			args,
			stream,
			prefix: &registry.prefix,
			triggers: &registry.triggers,
		};
		match command.execute(&ctx) {
			Some(response) => {
				self.last_used.lock().insert(trigger.clone(), Instant::now());
				metrics::counter!("streambot_commands_total").increment(1);
				debug!(%trigger, "command executed");
				CommandOutcome::Respond(response)
			}
			None => CommandOutcome::Silent,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::chat_message;

	fn settings() -> CommandSettings {
		let mut s = CommandSettings::default();
		s.custom.insert("discord".to_string(), "Join us, {user}!".to_string());
		s
	}

	fn live(title: &str) -> StreamInfo {
		StreamInfo {
			title: title.to_string(),
			game: Some("Rust".to_string()),
			viewers: Some(3),
			started_at: Some(SystemTime::now() - Duration::from_secs(3 * 3600 + 25 * 60)),
		}
	}

	#[test]
	fn parses_prefix_and_args() {
		assert_eq!(parse_invocation("!", "!Title  hello world"), Some(("title".to_string(), "hello world")));
		assert_eq!(parse_invocation("!", "hello !title"), None);
		assert_eq!(parse_invocation("!", "!"), None);
	}

	#[tokio::test]
	async fn unknown_trigger_is_not_a_command() {
		let p = CommandProcessor::new(&settings());
		assert_eq!(p.process(&chat_message("1", "alice", "!nope"), None), CommandOutcome::NotACommand);
		assert_eq!(p.process(&chat_message("2", "alice", "hi"), None), CommandOutcome::NotACommand);
	}

	#[tokio::test]
	async fn help_lists_others_but_not_itself() {
		let p = CommandProcessor::new(&settings());
		let CommandOutcome::Respond(resp) = p.process(&chat_message("1", "alice", "!HELP"), None) else {
			panic!("help should respond");
		};
		assert_eq!(resp.text, "Commands: !discord, !game, !title, !uptime");
		assert_eq!(resp.mode, ResponseMode::Reply { target: None });
	}

	#[tokio::test]
	async fn builtins_read_stream_info() {
		let p = CommandProcessor::new(&settings());
		let info = live("Coding");

		let CommandOutcome::Respond(r) = p.process(&chat_message("1", "a", "!title"), Some(&info)) else {
			panic!();
		};
		assert_eq!(r.text, "Title: Coding");

		let CommandOutcome::Respond(r) = p.process(&chat_message("2", "b", "!uptime"), Some(&info)) else {
			panic!();
		};
		assert_eq!(r.text, "Live for 3h 25m");

		assert_eq!(p.process(&chat_message("3", "c", "!game"), None), CommandOutcome::Silent);
	}

	#[tokio::test(start_paused = true)]
	async fn cooldown_applies_to_viewers_only() {
		let p = CommandProcessor::new(&settings());

		let first = p.process(&chat_message("1", "alice", "!discord"), None);
		assert_eq!(first, CommandOutcome::Respond(CommandResponse::normal("Join us, alice!")));
		assert_eq!(p.process(&chat_message("2", "bob", "!discord"), None), CommandOutcome::Silent);

		let mut mod_msg = chat_message("3", "carol", "!discord");
		mod_msg.badges.push("moderator:1".to_string());
		assert!(matches!(p.process(&mod_msg, None), CommandOutcome::Respond(_)));

		tokio::time::advance(Duration::from_secs(6)).await;
		assert!(matches!(
			p.process(&chat_message("4", "bob", "!discord"), None),
			CommandOutcome::Respond(_)
		));
	}
}
