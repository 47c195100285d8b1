#![forbid(unsafe_code)]

//! Local HTTP boundary: OAuth redirect target, overlay event stream, health
//! probes and a few control endpoints.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use streambot_core::statistics::StatisticsCollector as _;
use streambot_core::stream_monitor::StreamInfoSource as _;
use streambot_core::{AuthError, BotSession, PushEvent, PushItem};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Body = UnsyncBoxBody<Bytes, Infallible>;

const SSE_KEEPALIVE: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct HttpState {
	session: BotSession,
	ready: Arc<AtomicBool>,
}

impl HttpState {
	pub fn new(session: BotSession) -> Self {
		Self {
			session,
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
	Health,
	Ready,
	OAuthCallback,
	Events,
	History,
	HistoryClear,
	BroadcastSend,
	BroadcastStart,
	BroadcastStop,
	Status,
	NotFound,
	MethodNotAllowed,
}

pub fn route(method: &Method, path: &str) -> Route {
	let (expected, route) = match path {
		"/healthz" => (Method::GET, Route::Health),
		"/readyz" => (Method::GET, Route::Ready),
		"/oauth/callback" => (Method::GET, Route::OAuthCallback),
		"/events" => (Method::GET, Route::Events),
		"/history" => (Method::GET, Route::History),
		"/status" => (Method::GET, Route::Status),
		"/history/clear" => (Method::POST, Route::HistoryClear),
		"/broadcast/send" => (Method::POST, Route::BroadcastSend),
		"/broadcast/start" => (Method::POST, Route::BroadcastStart),
		"/broadcast/stop" => (Method::POST, Route::BroadcastStop),
		_ => return Route::NotFound,
	};

	if *method == expected { route } else { Route::MethodNotAllowed }
}

/// What the provider redirected back with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackParams {
	Code { code: String, state: String },
	Denied { error: String },
	Malformed,
}

pub fn parse_callback(query: Option<&str>) -> CallbackParams {
	let mut code = None;
	let mut state = None;
	let mut error = None;
	let mut description = None;

	for (k, v) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
		match k.as_ref() {
			"code" => code = Some(v.into_owned()),
			"state" => state = Some(v.into_owned()),
			"error" => error = Some(v.into_owned()),
			"error_description" => description = Some(v.into_owned()),
			_ => {}
		}
	}

	if let Some(error) = error {
		let error = match description {
			Some(d) if !d.trim().is_empty() => format!("{error}: {d}"),
			_ => error,
		};
		return CallbackParams::Denied { error };
	}

	match (code, state) {
		(Some(code), Some(state)) if !code.is_empty() && !state.is_empty() => CallbackParams::Code { code, state },
		_ => CallbackParams::Malformed,
	}
}

pub fn sse_frame<T: Serialize>(event: &str, data: &T) -> Option<Bytes> {
	match serde_json::to_string(data) {
		Ok(json) => Some(Bytes::from(format!("event: {event}\ndata: {json}\n\n"))),
		Err(e) => {
			warn!(error = %e, event, "failed to encode push event");
			None
		}
	}
}

/// Binds `bind` and serves until `cancel` fires. Returns the bound address.
pub async fn spawn_http_server(bind: SocketAddr, state: HttpState, cancel: CancellationToken) -> anyhow::Result<SocketAddr> {
	let listener = TcpListener::bind(bind).await?;
	let addr = listener.local_addr()?;
	tokio::spawn(async move {
		if let Err(err) = run_http_server(listener, state, cancel).await {
			warn!(error = %err, "http server stopped");
		}
	});
	Ok(addr)
}

async fn run_http_server(listener: TcpListener, state: HttpState, cancel: CancellationToken) -> anyhow::Result<()> {
	loop {
		let (stream, peer) = tokio::select! {
			_ = cancel.cancelled() => {
				debug!("http server shutting down");
				return Ok(());
			}
			accepted = listener.accept() => accepted?,
		};

		let io = TokioIo::new(stream);
		let state = state.clone();
		let cancel = cancel.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle(req, state.clone(), cancel.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				debug!(error = %err, %peer, "http connection error");
			}
		});
	}
}

async fn handle(req: Request<Incoming>, state: HttpState, cancel: CancellationToken) -> Result<Response<Body>, Infallible> {
	let route = route(req.method(), req.uri().path());
	metrics::counter!("streambot_http_requests_total").increment(1);

	let resp = match route {
		Route::Health => text(StatusCode::OK, "ok"),
		Route::Ready if state.is_ready() => text(StatusCode::OK, "ready"),
		Route::Ready => text(StatusCode::SERVICE_UNAVAILABLE, "not-ready"),
		Route::OAuthCallback => oauth_callback(&state, req.uri().query()),
		Route::Events => events(&state, cancel),
		Route::History => json(StatusCode::OK, &state.session.history().snapshot()),
		Route::HistoryClear => {
			state.session.history().clear();
			empty(StatusCode::NO_CONTENT)
		}
		Route::BroadcastSend => match state.session.scheduler().manual_send().await {
			Ok(Some(counter)) => json(StatusCode::OK, &serde_json::json!({ "counter": counter })),
			Ok(None) => text(StatusCode::CONFLICT, "broadcast not active"),
			Err(e) => {
				warn!(error = %e, "manual broadcast failed");
				text(StatusCode::BAD_GATEWAY, &e.to_string())
			}
		},
		Route::BroadcastStart if state.session.start_broadcast() => empty(StatusCode::NO_CONTENT),
		Route::BroadcastStart => text(StatusCode::CONFLICT, "not connected"),
		Route::BroadcastStop => {
			state.session.stop_broadcast();
			empty(StatusCode::NO_CONTENT)
		}
		Route::Status => json(StatusCode::OK, &status(&state.session)),
		Route::NotFound => empty(StatusCode::NOT_FOUND),
		Route::MethodNotAllowed => empty(StatusCode::METHOD_NOT_ALLOWED),
	};
	Ok(resp)
}

fn oauth_callback(state: &HttpState, query: Option<&str>) -> Response<Body> {
	let tokens = state.session.tokens();
	let result = match parse_callback(query) {
		CallbackParams::Code { code, state } => tokens.complete_auth(&code, &state),
		CallbackParams::Denied { error } => {
			info!(%error, "authorization denied by provider");
			tokens.fail_auth(&error)
		}
		CallbackParams::Malformed => return text(StatusCode::BAD_REQUEST, "missing code or state"),
	};

	match result {
		Ok(()) => text(StatusCode::OK, "Authorization received. You can close this window."),
		Err(AuthError::NoPendingFlow) => text(StatusCode::CONFLICT, "no authorization in progress"),
		Err(AuthError::StateMismatch) => text(StatusCode::BAD_REQUEST, "authorization state mismatch"),
		Err(e) => text(StatusCode::BAD_REQUEST, &e.to_string()),
	}
}

fn events(state: &HttpState, cancel: CancellationToken) -> Response<Body> {
	// Subscribe before the snapshot so nothing between the two is missed.
	let rx = state.session.history().hub().subscribe();
	let overlay = state.session.settings().read(|s| s.overlay.clone());

	let mut initial = Vec::with_capacity(2);
	initial.extend(sse_frame("settings", &PushEvent::SettingsChanged { overlay }));
	initial.extend(sse_frame("history", &state.session.history().snapshot()));

	let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + SSE_KEEPALIVE, SSE_KEEPALIVE);
	keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

	let head = futures::stream::iter(initial.into_iter().map(|b| Ok::<_, Infallible>(Frame::data(b))));
	let tail = futures::stream::unfold((rx, keepalive, cancel), |(mut rx, mut keepalive, cancel)| async move {
		let frame = next_push_frame(&mut rx, &mut keepalive, &cancel).await?;
		Some((Ok::<_, Infallible>(Frame::data(frame)), (rx, keepalive, cancel)))
	});

	let body = StreamBody::new(futures::StreamExt::chain(head, tail)).boxed_unsync();
	let mut resp = Response::new(body);
	let headers = resp.headers_mut();
	headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
	headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
	resp
}

async fn next_push_frame(
	rx: &mut mpsc::Receiver<PushItem>,
	keepalive: &mut Interval,
	cancel: &CancellationToken,
) -> Option<Bytes> {
	loop {
		tokio::select! {
			_ = cancel.cancelled() => return None,
			item = rx.recv() => match item? {
				PushItem::Event(ev) => {
					if let Some(frame) = sse_frame(ev.name(), &*ev) {
						return Some(frame);
					}
				}
				PushItem::Lagged { dropped } => {
					return sse_frame("lagged", &serde_json::json!({ "dropped": dropped }));
				}
			},
			_ = keepalive.tick() => return Some(Bytes::from_static(b": keepalive\n\n")),
		}
	}
}

fn status(session: &BotSession) -> serde_json::Value {
	let stats = session.statistics().snapshot();
	let uptime_secs = session
		.started_at()
		.and_then(|t| SystemTime::now().duration_since(t).ok())
		.map(|d| d.as_secs());
	let broadcast = session.scheduler().run();

	serde_json::json!({
		"state": session.state(),
		"channel": session.channel().map(|c| c.as_str().to_string()),
		"uptime_secs": uptime_secs,
		"stream_status": session.monitor().status(),
		"stream": session.monitor().current_stream(),
		"broadcast": {
			"active": broadcast.is_some(),
			"sent_count": broadcast.as_ref().map(|r| r.sent_count).unwrap_or(0),
			"interval_secs": broadcast.as_ref().map(|r| r.interval.as_secs()),
		},
		"history_len": session.history().len(),
		"statistics": {
			"total_messages": stats.total_messages,
			"unique_chatters": stats.unique_chatters(),
			"sessions": stats.sessions,
		},
	})
}

fn with_status(body: Body, status: StatusCode) -> Response<Body> {
	let mut resp = Response::new(body);
	*resp.status_mut() = status;
	resp
}

fn empty(status: StatusCode) -> Response<Body> {
	with_status(Full::new(Bytes::new()).boxed_unsync(), status)
}

fn text(status: StatusCode, msg: &str) -> Response<Body> {
	let mut resp = with_status(Full::new(Bytes::from(msg.to_string())).boxed_unsync(), status);
	resp.headers_mut()
		.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
	resp
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
	match serde_json::to_vec(value) {
		Ok(body) => {
			let mut resp = with_status(Full::new(Bytes::from(body)).boxed_unsync(), status);
			resp.headers_mut()
				.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
			resp
		}
		Err(e) => {
			warn!(error = %e, "failed to encode response");
			empty(StatusCode::INTERNAL_SERVER_ERROR)
		}
	}
}
