#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Instant;

use helpdesk_domain::{ChatError, Principal, UserId};
use helpdesk_protocol::pb::{self, client_event};
use helpdesk_protocol::convert;
use tokio::sync::mpsc;
use tracing::debug;

use crate::server::messages::Origin;
use crate::server::room_hub::{ConnId, HubItem};
use crate::server::service::{ChatService, parse_room_id, parse_status};

/// Burst + per-minute limit. `None` from [`TokenBucket::new`] means unlimited.
#[derive(Debug, Clone)]
pub(crate) struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last: Instant,
}

impl TokenBucket {
	pub(crate) fn new(capacity: u32, refill_per_minute: u32) -> Option<Self> {
		if capacity == 0 || refill_per_minute == 0 {
			return None;
		}
		Some(Self {
			capacity: capacity as f64,
			tokens: capacity as f64,
			refill_per_sec: refill_per_minute as f64 / 60.0,
			last: Instant::now(),
		})
	}

	pub(crate) fn allow(&mut self) -> bool {
		let now = Instant::now();
		let elapsed = now.duration_since(self.last).as_secs_f64();
		if elapsed > 0.0 {
			self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
			self.last = now;
		}
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}

	/// Refilled to capacity, so indistinguishable from a fresh bucket.
	pub(crate) fn is_full(&self) -> bool {
		let elapsed = self.last.elapsed().as_secs_f64();
		self.tokens + elapsed * self.refill_per_sec >= self.capacity
	}
}

const MIN_SWEEP_AT: usize = 256;

/// One [`TokenBucket`] per user. Full buckets are swept once the map grows.
#[derive(Debug)]
pub(crate) struct SendBuckets {
	limit: SendRateLimit,
	buckets: HashMap<UserId, TokenBucket>,
	sweep_at: usize,
}

impl SendBuckets {
	pub(crate) fn new(limit: SendRateLimit) -> Self {
		Self {
			limit,
			buckets: HashMap::new(),
			sweep_at: MIN_SWEEP_AT,
		}
	}

	pub(crate) fn allow(&mut self, user_id: &UserId) -> bool {
		if let Some(bucket) = self.buckets.get_mut(user_id) {
			return bucket.allow();
		}
		let Some(mut bucket) = TokenBucket::new(self.limit.burst, self.limit.per_minute) else {
			return true;
		};
		let allowed = bucket.allow();
		if self.buckets.len() >= self.sweep_at {
			self.buckets.retain(|_, b| !b.is_full());
			self.sweep_at = (self.buckets.len() * 2).max(MIN_SWEEP_AT);
		}
		self.buckets.insert(user_id.clone(), bucket);
		allowed
	}

	#[cfg(test)]
	pub(crate) fn len(&self) -> usize {
		self.buckets.len()
	}
}

/// `send_message` limits for one connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendRateLimit {
	pub burst: u32,
	pub per_minute: u32,
}

/// Dispatches client events for one authenticated connection.
///
/// Every event ends in exactly one reply or one error to this connection.
/// A `send_message` reply is queued by the bridge so it keeps its place in the room's order.
pub struct Session {
	conn_id: ConnId,
	principal: Principal,
	service: ChatService,
	outbox: mpsc::Sender<HubItem>,
	send_limiter: Option<TokenBucket>,
}

impl Session {
	pub fn new(
		conn_id: ConnId,
		principal: Principal,
		service: ChatService,
		outbox: mpsc::Sender<HubItem>,
		limit: SendRateLimit,
	) -> Self {
		Self {
			conn_id,
			principal,
			service,
			outbox,
			send_limiter: TokenBucket::new(limit.burst, limit.per_minute),
		}
	}

	pub fn principal(&self) -> &Principal {
		&self.principal
	}

	pub async fn handle(&mut self, request_id: String, event: pb::ClientEvent) {
		metrics::counter!("helpdesk_server_client_events_total").increment(1);
		match self.dispatch(&request_id, event).await {
			Ok(Some(reply)) => {
				let _ = self.outbox.send(HubItem::Reply { request_id, event: reply }).await;
			}
			Ok(None) => {}
			Err(err) => self.fail(request_id, &err).await,
		}
	}

	/// Reply with a single error.
	pub async fn fail(&self, request_id: String, err: &ChatError) {
		debug!(
			conn_id = self.conn_id,
			user_id = %self.principal.user_id,
			request_id = %request_id,
			code = err.code(),
			error = %err,
			"request failed"
		);
		metrics::counter!("helpdesk_server_request_errors_total", "code" => err.code()).increment(1);
		let _ = self
			.outbox
			.send(HubItem::Error {
				request_id,
				error: convert::error(err),
			})
			.await;
	}

	async fn dispatch(&mut self, request_id: &str, event: pb::ClientEvent) -> Result<Option<pb::ServerEvent>, ChatError> {
		let Some(event) = event.event else {
			return Err(ChatError::missing("event"));
		};
		let conn_id = self.conn_id;

		match event {
			client_event::Event::JoinUserRooms(_) => {
				let reply = self.service.join_user_rooms(conn_id, &self.principal).await?;
				Ok(Some(reply))
			}
			client_event::Event::JoinRoom(req) => {
				let room_id = parse_room_id(&req.room_id)?;
				let reply = self.service.join_room(conn_id, &self.principal, &room_id).await?;
				Ok(Some(reply))
			}
			client_event::Event::LeaveRoom(req) => {
				let room_id = parse_room_id(&req.room_id)?;
				Ok(Some(self.service.leave_room(conn_id, &self.principal, &room_id).await))
			}
			client_event::Event::SendMessage(req) => {
				let room_id = parse_room_id(&req.room_id)?;
				let draft = convert::message_draft(&req)?;
				if let Some(bucket) = self.send_limiter.as_mut()
					&& !bucket.allow()
				{
					metrics::counter!("helpdesk_server_rate_limited_total").increment(1);
					return Err(ChatError::RateLimited);
				}
				let origin = Origin {
					conn_id,
					request_id: request_id.to_string(),
				};
				// The message itself is the reply; the bridge delivers it.
				self.service
					.send_message(&self.principal, &room_id, draft, Some(origin))
					.await?;
				Ok(None)
			}
			client_event::Event::TypingStart(req) => {
				let room_id = parse_room_id(&req.room_id)?;
				let reply = self.service.typing(conn_id, &self.principal, &room_id, true).await?;
				Ok(Some(reply))
			}
			client_event::Event::TypingStop(req) => {
				let room_id = parse_room_id(&req.room_id)?;
				let reply = self.service.typing(conn_id, &self.principal, &room_id, false).await?;
				Ok(Some(reply))
			}
			client_event::Event::RoomStatusUpdate(req) => {
				let room_id = parse_room_id(&req.room_id)?;
				let status = parse_status(&req.status)?;
				let (_, reply) = self
					.service
					.update_status(&self.principal, &room_id, status, Some(conn_id))
					.await?;
				Ok(Some(reply))
			}
			client_event::Event::UpdateOnlineStatus(req) => {
				let reply = self
					.service
					.update_online_status(conn_id, &self.principal, &req.status)
					.await?;
				Ok(Some(reply))
			}
		}
	}
}
