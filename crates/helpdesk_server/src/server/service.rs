#![forbid(unsafe_code)]

use std::str::FromStr;
use std::time::Duration;

use helpdesk_domain::{
	ChatError, Message, MessageDraft, OnlineStatus, Page, PageRequest, ParseIdError, Principal, Role, Room,
	RoomDraft, RoomId, RoomStatus, UserId,
};
use helpdesk_protocol::{convert, pb};
use serde::Serialize;
use tracing::{info, warn};

use crate::server::assignment::AutoAssigner;
use crate::server::collaborators::{BackOffice, Notification};
use crate::server::directory::{RoomDirectory, RoomFilter, RoomStats};
use crate::server::messages::{MessageBridge, Origin};
use crate::server::presence::{self, PresenceTracker};
use crate::server::room_hub::{ConnId, RoomHub};
use crate::util::time::unix_ms_now;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Trailing window for statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatsPeriod {
	#[default]
	Week,
	Month,
}

impl StatsPeriod {
	pub const fn days(self) -> u32 {
		match self {
			StatsPeriod::Week => 7,
			StatsPeriod::Month => 30,
		}
	}
}

impl FromStr for StatsPeriod {
	type Err = ChatError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim() {
			"" | "7d" | "7" => Ok(StatsPeriod::Week),
			"30d" | "30" => Ok(StatsPeriod::Month),
			other => Err(ChatError::invalid("period", format!("unknown period: {other} (use 7d or 30d)"))),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStats {
	#[serde(flatten)]
	pub rooms: RoomStats,
	pub total_messages: u64,
	pub period_days: u32,
	/// Window start, unix ms.
	pub since: i64,
}

fn id_error(field: &str, err: ParseIdError) -> ChatError {
	match err {
		ParseIdError::Empty => ChatError::missing(field),
		other => ChatError::invalid(field, other.to_string()),
	}
}

pub fn parse_room_id(raw: &str) -> Result<RoomId, ChatError> {
	RoomId::new(raw).map_err(|e| id_error("roomId", e))
}

pub fn parse_user_id(raw: &str, field: &str) -> Result<UserId, ChatError> {
	UserId::new(raw).map_err(|e| id_error(field, e))
}

pub fn parse_status(raw: &str) -> Result<RoomStatus, ChatError> {
	raw.parse().map_err(|e: ParseIdError| id_error("status", e))
}

fn status_event(room: &Room, by: &UserId) -> pb::ServerEvent {
	convert::server_event(pb::server_event::Event::RoomStatusUpdated(pb::RoomStatusUpdated {
		room_id: room.id.to_string(),
		status: room.status.as_str().to_string(),
		updated_by: by.to_string(),
		assigned_staff_id: room.assigned_staff_id.as_ref().map(ToString::to_string),
	}))
}

/// Every chat operation, shared by the QUIC channel and the REST façade.
///
/// Operations either succeed with their side effects or return one
/// [`ChatError`] and leave nothing behind.
#[derive(Clone)]
pub struct ChatService {
	rooms: RoomDirectory,
	bridge: MessageBridge,
	hub: RoomHub,
	presence: PresenceTracker,
	assigner: AutoAssigner,
	backoffice: BackOffice,
	collaborator_timeout: Duration,
}

impl ChatService {
	pub fn new(
		rooms: RoomDirectory,
		bridge: MessageBridge,
		hub: RoomHub,
		presence: PresenceTracker,
		assigner: AutoAssigner,
		backoffice: BackOffice,
		collaborator_timeout: Duration,
	) -> Self {
		Self {
			rooms,
			bridge,
			hub,
			presence,
			assigner,
			backoffice,
			collaborator_timeout,
		}
	}

	pub fn hub(&self) -> &RoomHub {
		&self.hub
	}

	pub fn rooms(&self) -> &RoomDirectory {
		&self.rooms
	}

	// ---- rooms ----

	/// Create a room and try to hand it to the least loaded staff member.
	/// Assignment trouble never fails the creation; the room stays `open`.
	pub async fn create_room(&self, creator: &Principal, draft: RoomDraft) -> Result<Room, ChatError> {
		let room = self.rooms.create_room(creator, draft).await?;

		match self.assigner.assign(&room).await {
			Ok(Some(assigned)) => {
				self.announce_assignment(&assigned, &creator.user_id).await;
				Ok(assigned)
			}
			Ok(None) => Ok(room),
			Err(e) => {
				warn!(room_id = %room.id, error = %e, "auto-assignment failed; room left open");
				Ok(room)
			}
		}
	}

	/// Manual (re)assignment; admin only.
	pub async fn assign_staff(&self, by: &Principal, room_id: &RoomId, staff_id: &UserId) -> Result<Room, ChatError> {
		let room = self.rooms.assign_staff(room_id, staff_id, by).await?;
		self.announce_assignment(&room, &by.user_id).await;
		Ok(room)
	}

	async fn announce_assignment(&self, room: &Room, by: &UserId) {
		let Some(staff_id) = room.assigned_staff_id.clone() else {
			return;
		};

		let event = status_event(room, by);
		self.hub.publish_room(&room.id, event.clone()).await;
		self.hub.publish_user(&staff_id, event).await;

		let notification = Notification::room_assigned(staff_id.clone(), &room.id, &room.subject);
		match tokio::time::timeout(self.collaborator_timeout, self.backoffice.notifier.notify(notification)).await {
			Ok(Ok(())) => {}
			Ok(Err(e)) => warn!(room_id = %room.id, staff_id = %staff_id, error = %e, "assignment notification failed"),
			Err(_) => warn!(room_id = %room.id, staff_id = %staff_id, "assignment notification timed out"),
		}
	}

	pub async fn get_room(&self, principal: &Principal, room_id: &RoomId) -> Result<Room, ChatError> {
		self.rooms.authorize(room_id, principal).await
	}

	pub async fn list_my_rooms(&self, principal: &Principal, page: PageRequest) -> Result<Page<Room>, ChatError> {
		self.rooms.list_my_rooms(principal, page).await
	}

	pub async fn list_assigned_rooms(&self, principal: &Principal, page: PageRequest) -> Result<Page<Room>, ChatError> {
		self.rooms.list_assigned_rooms(principal, page).await
	}

	pub async fn list_all_rooms(
		&self,
		principal: &Principal,
		filter: RoomFilter,
		page: PageRequest,
	) -> Result<Page<Room>, ChatError> {
		self.rooms.list_all_rooms(principal, filter, page).await
	}

	/// Status change; the room is told, and so is the origin connection when
	/// there is one (as its reply).
	pub async fn update_status(
		&self,
		by: &Principal,
		room_id: &RoomId,
		status: RoomStatus,
		origin: Option<ConnId>,
	) -> Result<(Room, pb::ServerEvent), ChatError> {
		let room = self.rooms.update_status(room_id, status, by).await?;
		let event = status_event(&room, &by.user_id);
		match origin {
			Some(conn_id) => self.hub.publish_room_except(room_id, conn_id, event.clone()).await,
			None => self.hub.publish_room(room_id, event.clone()).await,
		};
		Ok((room, event))
	}

	/// Soft-delete; subscribers get `room_left` and are unsubscribed.
	pub async fn deactivate_room(&self, by: &Principal, room_id: &RoomId) -> Result<(), ChatError> {
		self.rooms.deactivate(room_id, by).await?;
		let event = convert::server_event(pb::server_event::Event::RoomLeft(pb::RoomLeft {
			room_id: room_id.to_string(),
		}));
		self.hub.close_room(room_id, event).await;
		Ok(())
	}

	pub async fn stats(&self, principal: &Principal, period: StatsPeriod) -> Result<ChatStats, ChatError> {
		if principal.role == Role::User {
			return Err(ChatError::Forbidden("statistics require staff or admin".to_string()));
		}
		let since = unix_ms_now() - i64::from(period.days()) * DAY_MS;
		let rooms = self.rooms.room_stats(since).await?;
		let total_messages = self.bridge.count_since(since).await?;
		Ok(ChatStats {
			rooms,
			total_messages,
			period_days: period.days(),
			since,
		})
	}

	// ---- messages ----

	/// Validate, re-check access, append and publish. A caller without access
	/// gets `Forbidden` and nothing is stored or broadcast.
	pub async fn send_message(
		&self,
		sender: &Principal,
		room_id: &RoomId,
		draft: MessageDraft,
		origin: Option<Origin>,
	) -> Result<Message, ChatError> {
		let body = draft.validate()?;
		self.rooms.authorize(room_id, sender).await?;

		let typing_conn = origin.as_ref().map(|o| o.conn_id);
		let msg = self.bridge.append(room_id, sender, body, origin).await?;

		if let Some(conn_id) = typing_conn {
			self.presence.typing_stop(conn_id, room_id).await;
		}
		Ok(msg)
	}

	pub async fn history(
		&self,
		principal: &Principal,
		room_id: &RoomId,
		page: PageRequest,
	) -> Result<Page<Message>, ChatError> {
		self.rooms.authorize(room_id, principal).await?;
		self.bridge.history(room_id, page).await
	}

	// ---- users ----

	/// Block through the back-office, then drop the user's live connections.
	pub async fn block_user(&self, by: &Principal, user_id: &UserId) -> Result<usize, ChatError> {
		if !by.is_admin() {
			return Err(ChatError::Forbidden("blocking users requires admin".to_string()));
		}
		if &by.user_id == user_id {
			return Err(ChatError::invalid("userId", "admins cannot block themselves"));
		}

		match tokio::time::timeout(self.collaborator_timeout, self.backoffice.users.block(user_id)).await {
			Ok(Ok(())) => {}
			Ok(Err(e)) => return Err(ChatError::store(format!("block user: {e}"))),
			Err(_) => return Err(ChatError::store("block user timed out")),
		}

		let dropped = self.hub.disconnect_user(user_id).await;
		info!(user_id = %user_id, by = %by.user_id, dropped, "user blocked");
		Ok(dropped)
	}

	// ---- connection-scoped ----

	pub async fn on_connect(&self, conn_id: ConnId, principal: &Principal) {
		self.presence.connected(conn_id, principal).await;
	}

	/// Unsubscribe everywhere, tell the rooms, update presence.
	pub async fn on_disconnect(&self, conn_id: ConnId) {
		let Some(departed) = self.hub.unregister(conn_id).await else {
			return;
		};
		let user = convert::principal_info(&departed.principal);
		for room_id in &departed.rooms {
			let event = convert::server_event(pb::server_event::Event::UserLeft(pb::UserLeft {
				room_id: room_id.to_string(),
				user: Some(user.clone()),
			}));
			self.hub.publish_room(room_id, event).await;
		}
		self.presence.disconnected(conn_id, &departed.principal).await;
	}

	/// Subscribe the connection to every room its identity may see.
	pub async fn join_user_rooms(&self, conn_id: ConnId, principal: &Principal) -> Result<pb::ServerEvent, ChatError> {
		let rooms = self.rooms.find_rooms_for(principal).await?;
		for room in &rooms {
			self.hub.join(conn_id, &room.id).await;
		}
		Ok(convert::server_event(pb::server_event::Event::RoomsJoined(pb::RoomsJoined {
			count: rooms.len() as u32,
			rooms: rooms.iter().map(convert::room_info).collect(),
		})))
	}

	pub async fn join_room(
		&self,
		conn_id: ConnId,
		principal: &Principal,
		room_id: &RoomId,
	) -> Result<pb::ServerEvent, ChatError> {
		let room = self.rooms.authorize(room_id, principal).await?;
		if self.hub.join(conn_id, room_id).await {
			let event = convert::server_event(pb::server_event::Event::UserJoined(pb::UserJoined {
				room_id: room_id.to_string(),
				user: Some(convert::principal_info(principal)),
			}));
			self.hub.publish_room_except(room_id, conn_id, event).await;
		}
		Ok(convert::server_event(pb::server_event::Event::RoomJoined(pb::RoomJoined {
			room: Some(convert::room_info(&room)),
		})))
	}

	/// Leaving a room that was never joined is not an error.
	pub async fn leave_room(&self, conn_id: ConnId, principal: &Principal, room_id: &RoomId) -> pb::ServerEvent {
		self.presence.typing_stop(conn_id, room_id).await;
		if self.hub.leave(conn_id, room_id).await {
			let event = convert::server_event(pb::server_event::Event::UserLeft(pb::UserLeft {
				room_id: room_id.to_string(),
				user: Some(convert::principal_info(principal)),
			}));
			self.hub.publish_room(room_id, event).await;
		}
		convert::server_event(pb::server_event::Event::RoomLeft(pb::RoomLeft {
			room_id: room_id.to_string(),
		}))
	}

	pub async fn update_online_status(
		&self,
		conn_id: ConnId,
		principal: &Principal,
		raw_status: &str,
	) -> Result<pb::ServerEvent, ChatError> {
		let status: OnlineStatus = raw_status.parse().map_err(|e: ParseIdError| id_error("status", e))?;
		Ok(self.presence.set_status(conn_id, principal, status).await)
	}

	/// Typing needs a joined room.
	pub async fn typing(
		&self,
		conn_id: ConnId,
		principal: &Principal,
		room_id: &RoomId,
		active: bool,
	) -> Result<pb::ServerEvent, ChatError> {
		if !self.hub.is_joined(conn_id, room_id).await {
			return Err(ChatError::Forbidden(format!("not joined to room {room_id}")));
		}
		// The room only hears about changes; the caller always gets its own state back.
		if active {
			self.presence.typing_start(conn_id, principal, room_id).await;
			Ok(presence::started_typing(room_id, principal))
		} else {
			self.presence.typing_stop(conn_id, room_id).await;
			Ok(presence::stopped_typing(room_id, &principal.user_id))
		}
	}
}

#[cfg(test)]
pub(crate) mod testing {
	use std::sync::Arc;

	use super::*;
	use crate::config::FeedSettings;
	use crate::server::collaborators::MemoryBackOffice;
	use crate::server::messages::{MemoryMessageStore, MessageStore};
	use crate::server::room_hub::RoomHubConfig;

	/// Everything in memory, with handles kept for assertions.
	pub(crate) struct Harness {
		pub service: ChatService,
		pub office: Arc<MemoryBackOffice>,
		pub store: Arc<MemoryMessageStore>,
		pub bridge: MessageBridge,
		pub hub: RoomHub,
	}

	pub(crate) fn harness() -> Harness {
		harness_with_feed(FeedSettings::default())
	}

	pub(crate) fn harness_with_feed(feed: FeedSettings) -> Harness {
		let timeout = Duration::from_secs(2);
		let office = Arc::new(MemoryBackOffice::new());
		let backoffice = BackOffice::from_shared(office.clone());
		let hub = RoomHub::new(RoomHubConfig::default());
		let rooms = RoomDirectory::in_memory();
		let store = Arc::new(MemoryMessageStore::new());
		let dyn_store: Arc<dyn MessageStore> = store.clone();
		let bridge = MessageBridge::new(dyn_store, rooms.clone(), hub.clone(), feed, timeout);
		let presence = PresenceTracker::new(hub.clone());
		let assigner = AutoAssigner::new(backoffice.staff.clone(), rooms.clone(), true, timeout);
		let service = ChatService::new(
			rooms,
			bridge.clone(),
			hub.clone(),
			presence,
			assigner,
			backoffice,
			timeout,
		);
		Harness {
			service,
			office,
			store,
			bridge,
			hub,
		}
	}
}
