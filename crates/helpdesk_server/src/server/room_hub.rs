#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use helpdesk_domain::{Principal, RoomId, UserId};
use helpdesk_protocol::pb;
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::{debug, warn};

pub type ConnId = u64;

/// Process-wide registry of live connections and their room subscriptions.
///
/// The only path to a connection's outbound mailbox. Fan-out never blocks:
/// a full mailbox drops the item and the drop is reported later as
/// [`HubItem::Lagged`].
#[derive(Debug, Clone)]
pub struct RoomHub {
	inner: Arc<Mutex<Inner>>,
	next_conn_id: Arc<AtomicU64>,
	cfg: RoomHubConfig,
}

#[derive(Debug, Clone)]
pub struct RoomHubConfig {
	/// Maximum number of queued items per connection.
	pub mailbox_capacity: usize,

	pub debug_logs: bool,
}

impl Default for RoomHubConfig {
	fn default() -> Self {
		Self {
			mailbox_capacity: 1024,
			debug_logs: false,
		}
	}
}

/// Items delivered to a connection's writer.
#[derive(Debug, Clone)]
pub enum HubItem {
	/// Broadcast, shared by every recipient.
	Event(Arc<pb::ServerEvent>),

	/// Reply correlated with a client request.
	Reply {
		request_id: String,
		event: pb::ServerEvent,
	},

	Error {
		request_id: String,
		error: pb::Error,
	},

	/// Items were dropped because the mailbox was full.
	Lagged {
		dropped: u64,
	},
}

/// Handles returned when a connection joins the hub.
#[derive(Debug)]
pub struct Registration {
	pub conn_id: ConnId,
	pub mailbox: mpsc::Receiver<HubItem>,
	/// Sender side of `mailbox`, for the connection's own replies.
	pub outbox: mpsc::Sender<HubItem>,
	/// Signalled when the connection must be closed (e.g. the user was blocked).
	pub kicked: Arc<Notify>,
}

/// What a connection left behind when it was unregistered.
#[derive(Debug, Clone)]
pub struct Departed {
	pub principal: Principal,
	pub rooms: Vec<RoomId>,
}

#[derive(Debug, Default)]
struct Inner {
	conns: HashMap<ConnId, ConnEntry>,
	rooms: HashMap<RoomId, BTreeSet<ConnId>>,
}

#[derive(Debug)]
struct ConnEntry {
	principal: Principal,
	tx: mpsc::Sender<HubItem>,
	rooms: HashSet<RoomId>,
	pending_lag: u64,
	kicked: Arc<Notify>,
}

enum Offer {
	Sent,
	Dropped,
	Closed,
}

fn offer(entry: &mut ConnEntry, item: HubItem) -> Offer {
	match entry.tx.try_send(item) {
		Ok(()) => {
			if entry.pending_lag > 0
				&& entry
					.tx
					.try_send(HubItem::Lagged {
						dropped: entry.pending_lag,
					})
					.is_ok()
			{
				entry.pending_lag = 0;
			}
			Offer::Sent
		}
		Err(mpsc::error::TrySendError::Full(_)) => {
			entry.pending_lag = entry.pending_lag.saturating_add(1);
			Offer::Dropped
		}
		Err(mpsc::error::TrySendError::Closed(_)) => Offer::Closed,
	}
}

impl Inner {
	fn remove_conn(&mut self, conn_id: ConnId) -> Option<Departed> {
		let entry = self.conns.remove(&conn_id)?;
		for room in &entry.rooms {
			if let Some(subs) = self.rooms.get_mut(room) {
				subs.remove(&conn_id);
				if subs.is_empty() {
					self.rooms.remove(room);
				}
			}
		}
		let mut rooms: Vec<RoomId> = entry.rooms.into_iter().collect();
		rooms.sort();
		Some(Departed {
			principal: entry.principal,
			rooms,
		})
	}

	/// Offer `item` to each target; closed mailboxes are pruned.
	fn fan_out(&mut self, targets: Vec<ConnId>, item: HubItem) -> (usize, u64) {
		let mut sent = 0;
		let mut dropped = 0u64;
		let mut closed = Vec::new();

		for conn_id in targets {
			let Some(entry) = self.conns.get_mut(&conn_id) else {
				continue;
			};
			match offer(entry, item.clone()) {
				Offer::Sent => sent += 1,
				Offer::Dropped => dropped += 1,
				Offer::Closed => closed.push(conn_id),
			}
		}

		for conn_id in closed {
			self.remove_conn(conn_id);
		}

		(sent, dropped)
	}
}

impl RoomHub {
	pub fn new(cfg: RoomHubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			next_conn_id: Arc::new(AtomicU64::new(1)),
			cfg,
		}
	}

	pub fn allocate_conn_id(&self) -> ConnId {
		self.next_conn_id.fetch_add(1, Ordering::Relaxed)
	}

	pub async fn register(&self, conn_id: ConnId, principal: Principal) -> Registration {
		let (tx, rx) = mpsc::channel(self.cfg.mailbox_capacity.max(1));
		let kicked = Arc::new(Notify::new());

		let mut inner = self.inner.lock().await;
		if let Some(prev) = inner.remove_conn(conn_id) {
			debug!(conn_id, user_id = %prev.principal.user_id, "room hub: replaced stale connection entry");
		}
		inner.conns.insert(
			conn_id,
			ConnEntry {
				principal,
				tx: tx.clone(),
				rooms: HashSet::new(),
				pending_lag: 0,
				kicked: Arc::clone(&kicked),
			},
		);
		metrics::gauge!("helpdesk_server_hub_connections").set(inner.conns.len() as f64);

		Registration {
			conn_id,
			mailbox: rx,
			outbox: tx,
			kicked,
		}
	}

	/// Drop a connection and all of its subscriptions.
	pub async fn unregister(&self, conn_id: ConnId) -> Option<Departed> {
		let mut inner = self.inner.lock().await;
		let departed = inner.remove_conn(conn_id);
		metrics::gauge!("helpdesk_server_hub_connections").set(inner.conns.len() as f64);
		departed
	}

	/// Subscribe; `false` if already joined or the connection is unknown.
	pub async fn join(&self, conn_id: ConnId, room_id: &RoomId) -> bool {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.conns.get_mut(&conn_id) else {
			return false;
		};
		if !entry.rooms.insert(room_id.clone()) {
			return false;
		}
		inner.rooms.entry(room_id.clone()).or_default().insert(conn_id);

		if self.cfg.debug_logs {
			debug!(conn_id, room_id = %room_id, "room hub: joined");
		}
		true
	}

	/// Unsubscribe; `false` if the connection had not joined.
	pub async fn leave(&self, conn_id: ConnId, room_id: &RoomId) -> bool {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.conns.get_mut(&conn_id) else {
			return false;
		};
		if !entry.rooms.remove(room_id) {
			return false;
		}
		if let Some(subs) = inner.rooms.get_mut(room_id) {
			subs.remove(&conn_id);
			if subs.is_empty() {
				inner.rooms.remove(room_id);
			}
		}
		true
	}

	pub async fn is_joined(&self, conn_id: ConnId, room_id: &RoomId) -> bool {
		let inner = self.inner.lock().await;
		inner.conns.get(&conn_id).is_some_and(|e| e.rooms.contains(room_id))
	}

	/// Broadcast to every subscriber of `room_id`. Returns how many got it.
	pub async fn publish_room(&self, room_id: &RoomId, event: pb::ServerEvent) -> usize {
		self.publish_room_filtered(room_id, None, event).await
	}

	/// Broadcast to every subscriber of `room_id` except `except`.
	pub async fn publish_room_except(&self, room_id: &RoomId, except: ConnId, event: pb::ServerEvent) -> usize {
		self.publish_room_filtered(room_id, Some(except), event).await
	}

	async fn publish_room_filtered(&self, room_id: &RoomId, except: Option<ConnId>, event: pb::ServerEvent) -> usize {
		let mut inner = self.inner.lock().await;
		let Some(subs) = inner.rooms.get(room_id) else {
			return 0;
		};
		let targets: Vec<ConnId> = subs.iter().copied().filter(|c| Some(*c) != except).collect();

		let (sent, dropped) = inner.fan_out(targets, HubItem::Event(Arc::new(event)));
		self.note_drops(dropped, "room");
		if self.cfg.debug_logs {
			debug!(room_id = %room_id, sent, dropped, "room hub: published");
		}
		sent
	}

	/// Send a final event to the room's subscribers, then drop the room.
	pub async fn close_room(&self, room_id: &RoomId, event: pb::ServerEvent) -> usize {
		let mut inner = self.inner.lock().await;
		let Some(subs) = inner.rooms.remove(room_id) else {
			return 0;
		};
		for conn_id in &subs {
			if let Some(entry) = inner.conns.get_mut(conn_id) {
				entry.rooms.remove(room_id);
			}
		}
		let (sent, dropped) = inner.fan_out(subs.into_iter().collect(), HubItem::Event(Arc::new(event)));
		self.note_drops(dropped, "room");
		sent
	}

	/// Broadcast to every live connection, optionally skipping one.
	pub async fn publish_all(&self, except: Option<ConnId>, event: pb::ServerEvent) -> usize {
		let mut inner = self.inner.lock().await;
		let targets: Vec<ConnId> = inner.conns.keys().copied().filter(|c| Some(*c) != except).collect();
		let (sent, dropped) = inner.fan_out(targets, HubItem::Event(Arc::new(event)));
		self.note_drops(dropped, "all");
		sent
	}

	/// Deliver to every connection of one user.
	pub async fn publish_user(&self, user_id: &UserId, event: pb::ServerEvent) -> usize {
		let mut inner = self.inner.lock().await;
		let targets: Vec<ConnId> = inner
			.conns
			.iter()
			.filter(|(_, e)| &e.principal.user_id == user_id)
			.map(|(id, _)| *id)
			.collect();
		let (sent, dropped) = inner.fan_out(targets, HubItem::Event(Arc::new(event)));
		self.note_drops(dropped, "user");
		sent
	}

	/// Queue a reply for one connection, waiting up to `wait` for mailbox room.
	///
	/// Replies are never dropped: a connection that cannot take one in time is
	/// asked to close instead.
	pub async fn reply_to(&self, conn_id: ConnId, item: HubItem, wait: Duration) -> bool {
		let (tx, kicked) = {
			let inner = self.inner.lock().await;
			match inner.conns.get(&conn_id) {
				Some(entry) => (entry.tx.clone(), Arc::clone(&entry.kicked)),
				None => return false,
			}
		};
		match tx.send_timeout(item, wait).await {
			Ok(()) => true,
			Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
				metrics::counter!("helpdesk_server_reply_timeouts_total").increment(1);
				warn!(conn_id, wait_ms = wait.as_millis() as u64, "mailbox stayed full; closing connection");
				kicked.notify_one();
				false
			}
			Err(mpsc::error::SendTimeoutError::Closed(_)) => false,
		}
	}

	/// Ask every connection of `user_id` to close. Returns how many were asked.
	pub async fn disconnect_user(&self, user_id: &UserId) -> usize {
		let inner = self.inner.lock().await;
		let mut n = 0;
		for entry in inner.conns.values().filter(|e| &e.principal.user_id == user_id) {
			entry.kicked.notify_one();
			n += 1;
		}
		n
	}

	pub async fn connection_count(&self) -> usize {
		self.inner.lock().await.conns.len()
	}

	pub async fn room_subscriber_count(&self, room_id: &RoomId) -> usize {
		self.inner.lock().await.rooms.get(room_id).map_or(0, BTreeSet::len)
	}

	fn note_drops(&self, dropped: u64, scope: &'static str) {
		if dropped > 0 {
			metrics::counter!("helpdesk_server_hub_dropped_total", "scope" => scope).increment(dropped);
			if self.cfg.debug_logs {
				debug!(dropped, scope, "room hub: dropped due to full mailboxes");
			}
		}
	}
}
