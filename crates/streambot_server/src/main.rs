#![forbid(unsafe_code)]

mod config;
mod http;
mod store;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use streambot_core::audience::AudienceTracker;
use streambot_core::commands::CommandProcessor;
use streambot_core::statistics::SessionStatistics;
use streambot_core::{
	BotEvent, BotSession, BotSessionConfig, BotSessionDeps, BroadcastScheduler, ChatHistory, PushHub, PushHubConfig,
	SharedSettings, StartOutcome, StreamMonitor, StreamMonitorConfig, TokenBroker, TokenBrokerConfig,
};
use streambot_platform::SystemBrowser;
use streambot_platform::twitch::{TwitchConfig, TwitchContext};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::AppConfig;
use crate::http::{HttpState, spawn_http_server};
use crate::store::{FileStatsStore, FileTokenStore};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: streambot_server [--config path]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.streambot/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG")
		.unwrap_or_else(|_| "info,streambot_server=debug,streambot_core=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	let Some(endpoint) = otlp_endpoint else {
		base.init();
		return;
	};

	use opentelemetry::global;
	use opentelemetry::trace::TracerProvider as _;
	use opentelemetry_otlp::WithExportConfig;

	match opentelemetry_otlp::SpanExporter::builder()
		.with_tonic()
		.with_endpoint(endpoint.clone())
		.build()
	{
		Ok(exporter) => {
			let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
				.with_batch_exporter(exporter)
				.build();
			let tracer = provider.tracer("streambot_server");
			global::set_tracer_provider(provider);

			base.with(tracing_opentelemetry::layer().with_tracer(tracer)).init();
			info!(endpoint = %endpoint, "otlp tracing enabled");
		}
		Err(e) => {
			base.init();
			warn!(error = %e, "failed to initialize otlp tracing");
		}
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)"),
	}
}

fn twitch_config(cfg: &AppConfig) -> TwitchConfig {
	let mut twitch = TwitchConfig::new(cfg.twitch.client_id.clone().unwrap_or_default());
	twitch.client_secret = cfg.twitch.client_secret.clone();
	if let Some(uri) = cfg.twitch.redirect_uri.clone() {
		twitch.redirect_uri = uri;
	}
	if !cfg.twitch.scopes.is_empty() {
		twitch.scopes = cfg.twitch.scopes.clone();
	}
	if let Some(url) = cfg.twitch.eventsub_ws_url.clone() {
		twitch.eventsub_ws_url = url;
	}
	if let Some(url) = cfg.twitch.helix_base_url.clone() {
		twitch.helix_base_url = url;
	}
	twitch
}

fn build_session(cfg: &AppConfig, ctx: &TwitchContext) -> BotSession {
	let settings = SharedSettings::new(cfg.bot.clone());

	let tokens = TokenBroker::new(
		Arc::new(ctx.oauth()),
		Arc::new(FileTokenStore::new(cfg.storage.token_path())),
		Arc::new(SystemBrowser),
		TokenBrokerConfig::default(),
	);

	let messenger = Arc::new(ctx.messenger());
	let monitor = StreamMonitor::new(
		Arc::new(ctx.stream_api()),
		Arc::new(ctx.stream_events()),
		StreamMonitorConfig::default(),
	);
	let scheduler = BroadcastScheduler::new(settings.clone(), messenger.clone(), Arc::new(monitor.clone()));

	let history = Arc::new(ChatHistory::new(
		cfg.bot.overlay.history_max,
		PushHub::new(PushHubConfig::default()),
	));

	BotSession::new(
		BotSessionDeps {
			settings,
			tokens,
			chat: Arc::new(ctx.chat()),
			messenger,
			monitor,
			scheduler,
			statistics: Arc::new(SessionStatistics::new(Arc::new(FileStatsStore::new(
				cfg.storage.statistics_path(),
			)))),
			decorations: Arc::new(ctx.decorations()),
			history,
			audience: Arc::new(AudienceTracker::new()),
			commands: Arc::new(CommandProcessor::new(&cfg.bot.commands)),
		},
		BotSessionConfig::default(),
	)
}

fn spawn_event_logger(session: &BotSession) {
	let mut rx = session.subscribe();
	tokio::spawn(async move {
		loop {
			match rx.recv().await {
				Ok(BotEvent::StateChanged { previous, current }) => {
					info!(?previous, ?current, "session state changed");
				}
				Ok(BotEvent::Progress { step, ok: true, detail }) => debug!(step, %detail, "session step ok"),
				Ok(BotEvent::Progress { step, ok: false, detail }) => warn!(step, %detail, "session step failed"),
				Ok(BotEvent::StreamStatus { status, info }) => {
					info!(?status, title = info.as_ref().map(|i| i.title.as_str()), "stream status");
				}
				Ok(BotEvent::MonitorError(e)) => warn!(error = %e, "stream monitor error"),
				Ok(BotEvent::MonitoringStopped) => {
					error!("stream monitoring stopped; reconnect the session to resume");
				}
				Ok(BotEvent::TransportLog(line)) => debug!(%line, "chat transport"),
				Err(RecvError::Lagged(n)) => debug!(skipped = n, "event logger lagged"),
				Err(RecvError::Closed) => break,
			}
		}
	});
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let cfg = crate::config::load_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let ctx = TwitchContext::new(twitch_config(&cfg))?;
	let session = build_session(&cfg, &ctx);
	spawn_event_logger(&session);

	let shutdown = CancellationToken::new();
	let http_state = HttpState::new(session.clone());
	let bind: SocketAddr = cfg
		.server
		.overlay_bind
		.parse()
		.map_err(|e| anyhow::anyhow!("invalid overlay bind {:?}: {e}", cfg.server.overlay_bind))?;
	let addr = spawn_http_server(bind, http_state.clone(), shutdown.child_token()).await?;
	info!(%addr, "http server listening");
	http_state.mark_ready();

	if cfg.server.auto_connect {
		let session = session.clone();
		let cancel = shutdown.child_token();
		tokio::spawn(async move {
			match session.start_connection(cancel).await {
				StartOutcome::Connected => info!("auto-connect complete"),
				StartOutcome::Cancelled => info!("auto-connect cancelled"),
				StartOutcome::Failed(e) => warn!(error = %e, "auto-connect failed"),
			}
		});
	}

	tokio::signal::ctrl_c().await?;
	info!("shutdown requested");

	shutdown.cancel();
	session.stop().await;
	session.scheduler().shutdown().await;

	Ok(())
}
