#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::warn;

/// Liveness is process-up; readiness flips once every runner task is running and back on shutdown.
#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn mark_not_ready(&self) {
		self.ready.store(false, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

fn respond(status: StatusCode, body: &'static [u8]) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::from_static(body)));
	*resp.status_mut() = status;
	resp
}

fn route(method: &Method, path: &str, state: &HealthState) -> Response<Full<Bytes>> {
	if method != Method::GET {
		return respond(StatusCode::METHOD_NOT_ALLOWED, b"");
	}
	match path {
		"/healthz" => respond(StatusCode::OK, b"ok"),
		"/readyz" if state.is_ready() => respond(StatusCode::OK, b"ready"),
		"/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, b"not-ready"),
		_ => respond(StatusCode::NOT_FOUND, b""),
	}
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	Ok(route(req.method(), req.uri().path(), &state))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn readiness_follows_the_flag() {
		let state = HealthState::new();
		assert_eq!(route(&Method::GET, "/healthz", &state).status(), StatusCode::OK);
		assert_eq!(
			route(&Method::GET, "/readyz", &state).status(),
			StatusCode::SERVICE_UNAVAILABLE
		);

		state.mark_ready();
		assert_eq!(route(&Method::GET, "/readyz", &state).status(), StatusCode::OK);
		state.mark_not_ready();
		assert!(!state.is_ready());
	}

	#[test]
	fn unknown_routes_and_methods() {
		let state = HealthState::new();
		assert_eq!(route(&Method::POST, "/healthz", &state).status(), StatusCode::METHOD_NOT_ALLOWED);
		assert_eq!(route(&Method::GET, "/metrics", &state).status(), StatusCode::NOT_FOUND);
	}
}
