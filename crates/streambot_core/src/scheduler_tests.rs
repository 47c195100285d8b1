#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use proptest::prelude::*;
use tokio::time::sleep;

use crate::scheduler::{BroadcastScheduler, render_template};
use crate::settings::{BotSettings, SharedSettings};
use crate::testing::{FakeMessenger, StaticStream, channel, live_info};

const INTERVAL: Duration = Duration::from_secs(60);
/// Just past one interval so each step observes exactly one tick.
const STEP: Duration = Duration::from_secs(61);

struct Harness {
	scheduler: BroadcastScheduler,
	settings: SharedSettings,
	messenger: Arc<FakeMessenger>,
	stream: Arc<StaticStream>,
}

fn harness(template: &str) -> Harness {
	let mut settings = BotSettings::default();
	settings.broadcast.interval_minutes = 1;
	settings.broadcast.template = template.to_string();
	let settings = SharedSettings::new(settings);

	let messenger = Arc::new(FakeMessenger::default());
	let stream = Arc::new(StaticStream::default());
	*stream.0.lock() = Some(live_info("Coding"));

	let scheduler = BroadcastScheduler::new(settings.clone(), messenger.clone(), stream.clone());
	Harness {
		scheduler,
		settings,
		messenger,
		stream,
	}
}

#[test]
fn template_substitutes_known_fields_and_blanks_unknown() {
	let info = live_info("Coding");
	assert_eq!(
		render_template("#{counter} {title} / {game} ({viewers})", 7, Some(&info)),
		"#7 Coding / Software and Game Development (12)"
	);
	assert_eq!(render_template("  {title}  ", 1, None), "");
	assert_eq!(render_template("{unknown} {counter}", 2, None), "{unknown} 2");
}

#[tokio::test(start_paused = true)]
async fn ticks_render_an_increasing_counter() {
	let h = harness("#{counter}: {title}");

	h.scheduler.start(&channel("test"));
	sleep(INTERVAL * 3 + Duration::from_secs(1)).await;

	assert_eq!(h.messenger.texts(), ["#1: Coding", "#2: Coding", "#3: Coding"]);
	assert!(h.messenger.sent.lock().iter().all(|s| s.channel == "test" && s.reply_to.is_none()));
	assert_eq!(h.scheduler.sent_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn stop_resets_and_silences() {
	let h = harness("#{counter}");
	h.scheduler.start(&channel("test"));
	sleep(STEP).await;
	assert_eq!(h.scheduler.sent_count(), 1);

	h.scheduler.stop();
	assert!(!h.scheduler.is_active());
	assert_eq!(h.scheduler.sent_count(), 0);
	assert!(h.scheduler.run().is_none());

	sleep(INTERVAL * 5).await;
	assert_eq!(h.messenger.texts(), ["#1"]);

	h.scheduler.start(&channel("test"));
	sleep(STEP).await;
	assert_eq!(h.messenger.texts(), ["#1", "#1"]);
}

#[tokio::test(start_paused = true)]
async fn restarting_does_not_leave_a_second_loop() {
	let h = harness("#{counter}");

	h.scheduler.start(&channel("test"));
	h.scheduler.start(&channel("test"));
	h.scheduler.start(&channel("test"));
	sleep(STEP).await;

	assert_eq!(h.messenger.texts(), ["#1"]);
}

#[tokio::test(start_paused = true)]
async fn manual_send_shares_the_counter_but_not_the_timer() {
	let h = harness("#{counter}");
	assert_eq!(h.scheduler.manual_send().await.expect("idle send"), None);

	h.scheduler.start(&channel("test"));
	let next = h.scheduler.run().and_then(|r| r.next_fire_at);

	sleep(Duration::from_secs(10)).await;
	assert_eq!(h.scheduler.manual_send().await.expect("manual"), Some(1));
	assert_eq!(h.scheduler.run().and_then(|r| r.next_fire_at), next);

	sleep(Duration::from_secs(51)).await;
	assert_eq!(h.messenger.texts(), ["#1", "#2"]);
}

#[tokio::test(start_paused = true)]
async fn empty_render_sends_nothing() {
	let h = harness("{title}");
	*h.stream.0.lock() = None;

	h.scheduler.start(&channel("test"));
	sleep(STEP * 2).await;

	assert!(h.messenger.texts().is_empty());
	assert_eq!(h.scheduler.sent_count(), 0);
	assert!(h.scheduler.is_active());
}

#[tokio::test(start_paused = true)]
async fn failed_send_keeps_the_run_alive() {
	let h = harness("#{counter}");
	h.messenger.fail.store(true, Ordering::SeqCst);

	h.scheduler.start(&channel("test"));
	sleep(STEP).await;
	h.messenger.fail.store(false, Ordering::SeqCst);
	sleep(INTERVAL).await;

	assert_eq!(h.messenger.texts(), ["#2"]);
}

#[tokio::test(start_paused = true)]
async fn restart_picks_up_a_new_interval() {
	let h = harness("#{counter}");
	h.scheduler.start(&channel("test"));

	h.settings.update(|s| s.broadcast.interval_minutes = 2);
	assert!(h.scheduler.restart());
	assert_eq!(h.scheduler.run().map(|r| r.interval), Some(Duration::from_secs(120)));

	sleep(STEP).await;
	assert!(h.messenger.texts().is_empty());
	sleep(STEP).await;
	assert_eq!(h.messenger.texts(), ["#1"]);

	h.scheduler.shutdown().await;
	assert!(!h.scheduler.restart());
}

#[derive(Debug, Clone, Copy)]
enum Op {
	Start,
	Stop,
	Step,
}

fn op() -> impl Strategy<Value = Op> {
	prop_oneof![1 => Just(Op::Start), 1 => Just(Op::Stop), 3 => Just(Op::Step)]
}

proptest! {
	#![proptest_config(ProptestConfig::with_cases(48))]

	#[test]
	fn each_interval_sends_exactly_once_while_active(ops in proptest::collection::vec(op(), 1..24)) {
		let rt = tokio::runtime::Builder::new_current_thread()
			.enable_all()
			.start_paused(true)
			.build()
			.expect("runtime");

		rt.block_on(async {
			let h = harness("#{counter}");
			let mut active = false;
			let mut counter = 0u64;
			let mut expected = Vec::new();

			for op in ops {
				match op {
					Op::Start => {
						h.scheduler.start(&channel("test"));
						active = true;
						counter = 0;
					}
					Op::Stop => {
						h.scheduler.stop();
						active = false;
						counter = 0;
					}
					Op::Step => {
						sleep(STEP).await;
						if active {
							counter += 1;
							expected.push(format!("#{counter}"));
						}
					}
				}
				prop_assert_eq!(h.scheduler.sent_count(), counter);
			}

			prop_assert_eq!(h.messenger.texts(), expected);
			h.scheduler.shutdown().await;
			Ok(())
		})?;
	}
}
