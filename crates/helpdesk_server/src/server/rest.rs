#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use bytes::Bytes;
use helpdesk_domain::{
	ChatError, DEFAULT_PAGE_LIMIT, FieldError, MessageDraft, PageRequest, ParseIdError, Principal, RoomDraft, RoomId,
	UserId,
};
use http_body_util::{BodyExt as _, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::server::auth::Authenticator;
use crate::server::directory::RoomFilter;
use crate::server::health::{self, HealthState};
use crate::server::messages::HISTORY_PAGE_LIMIT;
use crate::server::service::{ChatService, StatsPeriod, parse_room_id, parse_status, parse_user_id};
use crate::server::session::{SendBuckets, SendRateLimit};

/// Request bodies above this are rejected.
const MAX_BODY_BYTES: usize = 64 * 1024;

const API_PREFIX: &str = "/api/chat";

type RestResponse = Response<Full<Bytes>>;

/// Everything a REST handler needs.
#[derive(Clone)]
pub struct RestState {
	service: ChatService,
	auth: Authenticator,
	health: HealthState,
	send_buckets: Arc<Mutex<SendBuckets>>,
}

impl RestState {
	pub fn new(service: ChatService, auth: Authenticator, health: HealthState, send_limit: SendRateLimit) -> Self {
		Self {
			service,
			auth,
			health,
			send_buckets: Arc::new(Mutex::new(SendBuckets::new(send_limit))),
		}
	}

	async fn allow_send(&self, user_id: &UserId) -> bool {
		self.send_buckets.lock().await.allow(user_id)
	}
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
	code: &'static str,
	message: String,
	#[serde(skip_serializing_if = "no_fields")]
	fields: &'a [FieldError],
}

fn no_fields(fields: &&[FieldError]) -> bool {
	fields.is_empty()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignBody {
	#[serde(default)]
	staff_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct StatusBody {
	#[serde(default)]
	status: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BlockedBody {
	user_id: String,
	disconnected: usize,
}

pub fn status_for(err: &ChatError) -> StatusCode {
	match err {
		ChatError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
		ChatError::Forbidden(_) => StatusCode::FORBIDDEN,
		ChatError::NotFound(_) => StatusCode::NOT_FOUND,
		ChatError::Validation(_) => StatusCode::BAD_REQUEST,
		ChatError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
		ChatError::StoreUnavailable(_) | ChatError::DeliveryDegraded(_) => StatusCode::SERVICE_UNAVAILABLE,
	}
}

fn with_json(status: StatusCode, body: Vec<u8>) -> RestResponse {
	let mut resp = Response::new(Full::new(Bytes::from(body)));
	*resp.status_mut() = status;
	resp.headers_mut()
		.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
	resp
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> RestResponse {
	match serde_json::to_vec(value) {
		Ok(body) => with_json(status, body),
		Err(e) => {
			warn!(error = %e, "failed to serialize response body");
			with_json(
				StatusCode::INTERNAL_SERVER_ERROR,
				br#"{"code":"INTERNAL","message":"response serialization failed"}"#.to_vec(),
			)
		}
	}
}

fn error_response(err: &ChatError) -> RestResponse {
	json(
		status_for(err),
		&ErrorBody {
			code: err.code(),
			message: err.to_string(),
			fields: err.fields(),
		},
	)
}

fn no_content() -> RestResponse {
	let mut resp = Response::new(Full::new(Bytes::new()));
	*resp.status_mut() = StatusCode::NO_CONTENT;
	resp
}

fn bearer(headers: &HeaderMap) -> &str {
	headers
		.get(AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
		.unwrap_or("")
}

fn query_map(query: Option<&str>) -> HashMap<String, String> {
	url::form_urlencoded::parse(query.unwrap_or("").as_bytes())
		.into_owned()
		.collect()
}

fn query_u32(query: &HashMap<String, String>, field: &str) -> Result<Option<u32>, ChatError> {
	match query.get(field).map(|v| v.trim()).filter(|v| !v.is_empty()) {
		None => Ok(None),
		Some(raw) => raw
			.parse()
			.map(Some)
			.map_err(|_| ChatError::invalid(field, format!("{field} must be a positive integer"))),
	}
}

fn page_query(query: &HashMap<String, String>, default_limit: u32) -> Result<PageRequest, ChatError> {
	Ok(PageRequest::new(
		query_u32(query, "page")?,
		query_u32(query, "limit")?,
		default_limit,
	))
}

fn filter_query(query: &HashMap<String, String>) -> Result<RoomFilter, ChatError> {
	let non_empty = |field: &str| query.get(field).map(|v| v.trim()).filter(|v| !v.is_empty());
	let status = non_empty("status").map(parse_status).transpose()?;
	let category = non_empty("category")
		.map(|raw| raw.parse().map_err(|e: ParseIdError| ChatError::invalid("category", e.to_string())))
		.transpose()?;
	Ok(RoomFilter { status, category })
}

async fn read_json<T: DeserializeOwned>(body: Incoming) -> Result<T, ChatError> {
	let bytes = Limited::new(body, MAX_BODY_BYTES)
		.collect()
		.await
		.map_err(|e| ChatError::invalid("body", format!("unreadable body: {e}")))?
		.to_bytes();
	if bytes.is_empty() {
		return Err(ChatError::missing("body"));
	}
	serde_json::from_slice(&bytes).map_err(|e| ChatError::invalid("body", format!("invalid JSON: {e}")))
}

async fn handle(req: Request<Incoming>, state: RestState) -> Result<RestResponse, Infallible> {
	let started = Instant::now();
	let method = req.method().clone();
	let path = req.uri().path().to_string();

	if method == Method::GET
		&& let Some(resp) = health::probe(&path, &state.health)
	{
		return Ok(resp);
	}

	let resp = match route(req, &state).await {
		Ok(resp) => resp,
		Err(err) => {
			debug!(method = %method, path = %path, code = err.code(), error = %err, "rest request failed");
			error_response(&err)
		}
	};

	metrics::counter!("helpdesk_server_rest_requests_total", "status" => resp.status().as_u16().to_string())
		.increment(1);
	metrics::histogram!("helpdesk_server_rest_request_seconds").record(started.elapsed().as_secs_f64());
	Ok(resp)
}

async fn route(req: Request<Incoming>, state: &RestState) -> Result<RestResponse, ChatError> {
	let (parts, body) = req.into_parts();
	let Some(rest) = parts.uri.path().strip_prefix(API_PREFIX) else {
		return Err(ChatError::NotFound(format!("no route for {}", parts.uri.path())));
	};
	let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();

	let principal = state.auth.authenticate(bearer(&parts.headers)).await?;
	let query = query_map(parts.uri.query());
	let service = &state.service;

	match (&parts.method, segments.as_slice()) {
		(&Method::POST, ["rooms"]) => {
			let draft: RoomDraft = read_json(body).await?;
			let room = service.create_room(&principal, draft).await?;
			Ok(json(StatusCode::CREATED, &room))
		}
		(&Method::GET, ["rooms"]) => {
			let filter = filter_query(&query)?;
			let page = page_query(&query, DEFAULT_PAGE_LIMIT)?;
			Ok(json(StatusCode::OK, &service.list_all_rooms(&principal, filter, page).await?))
		}
		(&Method::GET, ["rooms", "my"]) => {
			let page = page_query(&query, DEFAULT_PAGE_LIMIT)?;
			Ok(json(StatusCode::OK, &service.list_my_rooms(&principal, page).await?))
		}
		(&Method::GET, ["rooms", "assigned"]) => {
			let page = page_query(&query, DEFAULT_PAGE_LIMIT)?;
			Ok(json(StatusCode::OK, &service.list_assigned_rooms(&principal, page).await?))
		}
		(&Method::GET, ["rooms", id]) => {
			let room_id = parse_room_id(id)?;
			Ok(json(StatusCode::OK, &service.get_room(&principal, &room_id).await?))
		}
		(&Method::DELETE, ["rooms", id]) => {
			let room_id = parse_room_id(id)?;
			service.deactivate_room(&principal, &room_id).await?;
			Ok(no_content())
		}
		(&Method::PUT, ["rooms", id, "assign"]) => {
			let room_id = parse_room_id(id)?;
			let req: AssignBody = read_json(body).await?;
			let staff_id = parse_user_id(&req.staff_id, "staffId")?;
			Ok(json(StatusCode::OK, &service.assign_staff(&principal, &room_id, &staff_id).await?))
		}
		(&Method::PUT, ["rooms", id, "status"]) => {
			let room_id = parse_room_id(id)?;
			let req: StatusBody = read_json(body).await?;
			let status = parse_status(&req.status)?;
			let (room, _) = service.update_status(&principal, &room_id, status, None).await?;
			Ok(json(StatusCode::OK, &room))
		}
		(&Method::POST, ["rooms", id, "messages"]) => {
			let room_id = parse_room_id(id)?;
			let draft: MessageDraft = read_json(body).await?;
			send_message(state, &principal, &room_id, draft).await
		}
		(&Method::GET, ["rooms", id, "messages"]) => {
			let room_id = parse_room_id(id)?;
			let page = page_query(&query, HISTORY_PAGE_LIMIT)?;
			Ok(json(StatusCode::OK, &service.history(&principal, &room_id, page).await?))
		}
		(&Method::GET, ["stats"]) => {
			let period: StatsPeriod = query.get("period").map(String::as_str).unwrap_or("").parse()?;
			Ok(json(StatusCode::OK, &service.stats(&principal, period).await?))
		}
		(&Method::POST, ["users", id, "block"]) => {
			let user_id = parse_user_id(id, "userId")?;
			let disconnected = service.block_user(&principal, &user_id).await?;
			Ok(json(
				StatusCode::OK,
				&BlockedBody {
					user_id: user_id.to_string(),
					disconnected,
				},
			))
		}
		(method, _) => Err(ChatError::NotFound(format!("no route for {method} {}", parts.uri.path()))),
	}
}

async fn send_message(
	state: &RestState,
	principal: &Principal,
	room_id: &RoomId,
	draft: MessageDraft,
) -> Result<RestResponse, ChatError> {
	if !state.allow_send(&principal.user_id).await {
		metrics::counter!("helpdesk_server_rate_limited_total").increment(1);
		return Err(ChatError::RateLimited);
	}
	let msg = state.service.send_message(principal, room_id, draft, None).await?;
	Ok(json(StatusCode::CREATED, &msg))
}

/// Serve REST and health probes on an already bound listener.
pub async fn serve(listener: TcpListener, state: RestState) -> anyhow::Result<()> {
	loop {
		let (stream, _addr) = listener.accept().await.context("accept REST connection")?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				debug!(error = %err, "rest connection error");
			}
		});
	}
}

pub fn spawn_rest_server(listener: TcpListener, state: RestState) -> JoinHandle<()> {
	tokio::spawn(async move {
		if let Err(err) = serve(listener, state).await {
			warn!(error = %err, "rest server stopped");
		}
	})
}
