#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	/// Flipped once the change-feed and listeners are up.
	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

fn plain(status: StatusCode, body: &'static [u8]) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::from_static(body)));
	*resp.status_mut() = status;
	resp
}

/// Liveness/readiness probes; `None` for any other path.
pub fn probe(path: &str, state: &HealthState) -> Option<Response<Full<Bytes>>> {
	match path {
		"/healthz" => Some(plain(StatusCode::OK, b"ok")),
		"/readyz" if state.is_ready() => Some(plain(StatusCode::OK, b"ready")),
		"/readyz" => Some(plain(StatusCode::SERVICE_UNAVAILABLE, b"not-ready")),
		_ => None,
	}
}
