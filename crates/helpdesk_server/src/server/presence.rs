#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use helpdesk_domain::{OnlineStatus, Principal, RoomId, UserId};
use helpdesk_protocol::{convert, pb};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::server::collaborators::UserDirectory;
use crate::server::room_hub::{ConnId, RoomHub};
use crate::util::time::unix_ms_now;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceEntry {
	pub status: OnlineStatus,
	pub connections: u32,
	pub last_seen: i64,
}

#[derive(Debug, Default)]
struct PresenceInner {
	users: HashMap<UserId, PresenceEntry>,
	/// room -> connection -> who is typing there.
	typing: HashMap<RoomId, HashMap<ConnId, Principal>>,
}

/// Ephemeral presence and typing state. Nothing here is durable except the
/// best-effort last-seen write on final disconnect.
#[derive(Clone)]
pub struct PresenceTracker {
	inner: Arc<Mutex<PresenceInner>>,
	hub: RoomHub,
	users: Option<Arc<dyn UserDirectory>>,
	timeout: Duration,
}

fn status_changed(user_id: &UserId, entry: &PresenceEntry) -> pb::ServerEvent {
	convert::server_event(pb::server_event::Event::UserStatusChanged(pb::UserStatusChanged {
		user_id: user_id.to_string(),
		status: entry.status.as_str().to_string(),
		last_seen_unix_ms: entry.last_seen,
	}))
}

pub(crate) fn started_typing(room_id: &RoomId, principal: &Principal) -> pb::ServerEvent {
	convert::server_event(pb::server_event::Event::UserTyping(pb::UserTyping {
		room_id: room_id.to_string(),
		user: Some(convert::principal_info(principal)),
	}))
}

pub(crate) fn stopped_typing(room_id: &RoomId, user_id: &UserId) -> pb::ServerEvent {
	convert::server_event(pb::server_event::Event::UserStoppedTyping(pb::UserStoppedTyping {
		room_id: room_id.to_string(),
		user_id: user_id.to_string(),
	}))
}

impl PresenceTracker {
	pub fn new(hub: RoomHub) -> Self {
		Self {
			inner: Arc::new(Mutex::new(PresenceInner::default())),
			hub,
			users: None,
			timeout: Duration::from_secs(5),
		}
	}

	/// Persist last-seen through the back-office on final disconnect.
	pub fn with_directory(mut self, users: Arc<dyn UserDirectory>, timeout: Duration) -> Self {
		self.users = Some(users);
		self.timeout = timeout;
		self
	}

	/// A connection for `principal` finished its handshake.
	pub async fn connected(&self, conn_id: ConnId, principal: &Principal) {
		let now = unix_ms_now();
		let announce = {
			let mut inner = self.inner.lock().await;
			let entry = inner.users.entry(principal.user_id.clone()).or_insert(PresenceEntry {
				status: OnlineStatus::Offline,
				connections: 0,
				last_seen: now,
			});
			entry.connections += 1;
			entry.last_seen = now;
			if entry.status == OnlineStatus::Offline {
				entry.status = OnlineStatus::Online;
				Some(*entry)
			} else {
				None
			}
		};

		if let Some(entry) = announce {
			self.hub
				.publish_all(Some(conn_id), status_changed(&principal.user_id, &entry))
				.await;
		}
	}

	/// A connection closed. Clears its typing flags; the identity goes offline
	/// when its last connection is gone.
	pub async fn disconnected(&self, conn_id: ConnId, principal: &Principal) {
		let now = unix_ms_now();
		let (cleared, went_offline) = {
			let mut inner = self.inner.lock().await;
			let cleared = take_typing_for_conn(&mut inner, conn_id);

			let went_offline = match inner.users.get_mut(&principal.user_id) {
				Some(entry) => {
					entry.connections = entry.connections.saturating_sub(1);
					entry.last_seen = now;
					if entry.connections == 0 {
						entry.status = OnlineStatus::Offline;
						Some(*entry)
					} else {
						None
					}
				}
				None => None,
			};
			(cleared, went_offline)
		};

		for (room_id, user_id) in cleared {
			self.hub
				.publish_room_except(&room_id, conn_id, stopped_typing(&room_id, &user_id))
				.await;
		}

		let Some(entry) = went_offline else {
			return;
		};
		self.hub
			.publish_all(Some(conn_id), status_changed(&principal.user_id, &entry))
			.await;

		if let Some(users) = self.users.clone() {
			let user_id = principal.user_id.clone();
			let timeout = self.timeout;
			tokio::spawn(async move {
				match tokio::time::timeout(timeout, users.record_last_seen(&user_id, now)).await {
					Ok(Ok(())) => debug!(user_id = %user_id, "last seen recorded"),
					Ok(Err(e)) => warn!(user_id = %user_id, error = %e, "failed to record last seen"),
					Err(_) => warn!(user_id = %user_id, "recording last seen timed out"),
				}
			});
		}
	}

	/// Explicit status change, broadcast to every connection but the caller's.
	/// Returns the event so the caller can be answered with it.
	pub async fn set_status(&self, conn_id: ConnId, principal: &Principal, status: OnlineStatus) -> pb::ServerEvent {
		let now = unix_ms_now();
		let entry = {
			let mut inner = self.inner.lock().await;
			let entry = inner.users.entry(principal.user_id.clone()).or_insert(PresenceEntry {
				status,
				connections: 0,
				last_seen: now,
			});
			entry.status = status;
			entry.last_seen = now;
			*entry
		};

		let event = status_changed(&principal.user_id, &entry);
		self.hub.publish_all(Some(conn_id), event.clone()).await;
		event
	}

	/// Mark `conn_id` as typing in `room_id`. Repeats are not re-broadcast.
	pub async fn typing_start(&self, conn_id: ConnId, principal: &Principal, room_id: &RoomId) -> bool {
		let fresh = {
			let mut inner = self.inner.lock().await;
			inner
				.typing
				.entry(room_id.clone())
				.or_default()
				.insert(conn_id, principal.clone())
				.is_none()
		};
		if fresh {
			self.hub
				.publish_room_except(room_id, conn_id, started_typing(room_id, principal))
				.await;
		}
		fresh
	}

	/// Clear the flag and tell the room. `false` if it was not set.
	pub async fn typing_stop(&self, conn_id: ConnId, room_id: &RoomId) -> bool {
		let removed = {
			let mut inner = self.inner.lock().await;
			let removed = inner.typing.get_mut(room_id).and_then(|m| m.remove(&conn_id));
			if inner.typing.get(room_id).is_some_and(HashMap::is_empty) {
				inner.typing.remove(room_id);
			}
			removed
		};
		let Some(principal) = removed else {
			return false;
		};
		self.hub
			.publish_room_except(room_id, conn_id, stopped_typing(room_id, &principal.user_id))
			.await;
		true
	}

	pub async fn status_of(&self, user_id: &UserId) -> Option<PresenceEntry> {
		self.inner.lock().await.users.get(user_id).copied()
	}

	/// Users currently typing in `room_id`, sorted.
	pub async fn typing_in(&self, room_id: &RoomId) -> Vec<UserId> {
		let inner = self.inner.lock().await;
		let mut ids: Vec<UserId> = inner
			.typing
			.get(room_id)
			.map(|m| m.values().map(|p| p.user_id.clone()).collect())
			.unwrap_or_default();
		ids.sort();
		ids.dedup();
		ids
	}
}

fn take_typing_for_conn(inner: &mut PresenceInner, conn_id: ConnId) -> Vec<(RoomId, UserId)> {
	let mut cleared = Vec::new();
	inner.typing.retain(|room_id, by_conn| {
		if let Some(p) = by_conn.remove(&conn_id) {
			cleared.push((room_id.clone(), p.user_id));
		}
		!by_conn.is_empty()
	});
	cleared
}

#[cfg(test)]
mod tests {
	use helpdesk_domain::Role;
	use helpdesk_protocol::pb::server_event::Event;

	use super::*;
	use crate::server::collaborators::MemoryBackOffice;
	use crate::server::room_hub::{HubItem, RoomHubConfig};

	fn principal(id: &str) -> Principal {
		Principal::new(UserId::new(id).unwrap(), Role::User, id)
	}

	fn event_of(item: HubItem) -> Event {
		match item {
			HubItem::Event(ev) => ev.event.clone().unwrap(),
			other => panic!("expected Event, got: {other:?}"),
		}
	}

	#[tokio::test]
	async fn offline_only_after_last_connection() {
		let hub = RoomHub::new(RoomHubConfig::default());
		let office = Arc::new(MemoryBackOffice::new());
		let presence = PresenceTracker::new(hub.clone()).with_directory(office.clone(), Duration::from_secs(1));
		let mut watcher = hub.register(hub.allocate_conn_id(), principal("w")).await;

		let u = principal("u1");
		presence.connected(10, &u).await;
		presence.connected(11, &u).await;
		match event_of(watcher.mailbox.recv().await.unwrap()) {
			Event::UserStatusChanged(ev) => assert_eq!(ev.status, "online"),
			other => panic!("unexpected: {other:?}"),
		}

		presence.disconnected(10, &u).await;
		assert_eq!(presence.status_of(&u.user_id).await.unwrap().status, OnlineStatus::Online);
		assert!(watcher.mailbox.try_recv().is_err(), "second connection keeps the user online");

		presence.disconnected(11, &u).await;
		match event_of(watcher.mailbox.recv().await.unwrap()) {
			Event::UserStatusChanged(ev) => assert_eq!(ev.status, "offline"),
			other => panic!("unexpected: {other:?}"),
		}

		for _ in 0..50 {
			if office.last_seen(&u.user_id).await.is_some() {
				return;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		panic!("last seen was never recorded");
	}

	#[tokio::test]
	async fn typing_is_relayed_to_others_once_and_cleared_on_disconnect() {
		let hub = RoomHub::new(RoomHubConfig::default());
		let presence = PresenceTracker::new(hub.clone());
		let room = RoomId::new("r1").unwrap();

		let typist = hub.register(hub.allocate_conn_id(), principal("u1")).await;
		let mut other = hub.register(hub.allocate_conn_id(), principal("s1")).await;
		hub.join(typist.conn_id, &room).await;
		hub.join(other.conn_id, &room).await;

		assert!(presence.typing_start(typist.conn_id, &principal("u1"), &room).await);
		assert!(!presence.typing_start(typist.conn_id, &principal("u1"), &room).await);
		match event_of(other.mailbox.recv().await.unwrap()) {
			Event::UserTyping(ev) => assert_eq!(ev.user.unwrap().user_id, "u1"),
			other => panic!("unexpected: {other:?}"),
		}
		assert!(other.mailbox.try_recv().is_err());
		assert_eq!(presence.typing_in(&room).await, vec![UserId::new("u1").unwrap()]);

		presence.disconnected(typist.conn_id, &principal("u1")).await;
		match event_of(other.mailbox.recv().await.unwrap()) {
			Event::UserStoppedTyping(ev) => assert_eq!(ev.user_id, "u1"),
			other => panic!("unexpected: {other:?}"),
		}
		assert!(presence.typing_in(&room).await.is_empty());
		assert!(!presence.typing_stop(typist.conn_id, &room).await);
	}

	#[tokio::test]
	async fn explicit_status_is_broadcast() {
		let hub = RoomHub::new(RoomHubConfig::default());
		let presence = PresenceTracker::new(hub.clone());
		let me = hub.register(hub.allocate_conn_id(), principal("s1")).await;
		let mut other = hub.register(hub.allocate_conn_id(), principal("u1")).await;

		let reply = presence.set_status(me.conn_id, &principal("s1"), OnlineStatus::Busy).await;
		assert!(matches!(reply.event, Some(Event::UserStatusChanged(ref ev)) if ev.status == "busy"));
		assert!(matches!(event_of(other.mailbox.recv().await.unwrap()), Event::UserStatusChanged(_)));
		assert_eq!(
			presence.status_of(&UserId::new("s1").unwrap()).await.unwrap().status,
			OnlineStatus::Busy
		);
	}
}
