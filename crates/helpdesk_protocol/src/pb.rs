//! Wire messages (`helpdesk.v1`).
//!
//! Enumerated values (role, status, category, ...) travel as their stable
//! lowercase string names so clients never depend on numeric tags. Free-form
//! JSON (room and message metadata) travels as an encoded string.

/// Top-level frame payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
	#[prost(uint32, tag = "1")]
	pub version: u32,
	/// Echoed on direct replies; empty on broadcasts.
	#[prost(string, tag = "2")]
	pub request_id: String,
	#[prost(oneof = "envelope::Msg", tags = "10, 11, 12, 13, 14")]
	pub msg: Option<envelope::Msg>,
}

pub mod envelope {
	#[allow(clippy::large_enum_variant)]
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Msg {
		#[prost(message, tag = "10")]
		Hello(super::Hello),
		#[prost(message, tag = "11")]
		Welcome(super::Welcome),
		#[prost(message, tag = "12")]
		Client(super::ClientEvent),
		#[prost(message, tag = "13")]
		Server(super::ServerEvent),
		#[prost(message, tag = "14")]
		Error(super::Error),
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hello {
	#[prost(string, tag = "1")]
	pub client_name: String,
	#[prost(string, tag = "2")]
	pub auth_token: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Welcome {
	#[prost(string, tag = "1")]
	pub server_name: String,
	#[prost(int64, tag = "2")]
	pub server_time_unix_ms: i64,
	#[prost(uint32, tag = "3")]
	pub max_frame_bytes: u32,
	#[prost(string, tag = "4")]
	pub user_id: String,
	#[prost(string, tag = "5")]
	pub role: String,
	#[prost(string, tag = "6")]
	pub display_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FieldError {
	#[prost(string, tag = "1")]
	pub field: String,
	#[prost(string, tag = "2")]
	pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Error {
	#[prost(string, tag = "1")]
	pub code: String,
	#[prost(string, tag = "2")]
	pub message: String,
	#[prost(message, repeated, tag = "3")]
	pub fields: Vec<FieldError>,
}

// ---- shared payloads ----

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserInfo {
	#[prost(string, tag = "1")]
	pub user_id: String,
	#[prost(string, tag = "2")]
	pub role: String,
	#[prost(string, tag = "3")]
	pub display_name: String,
	#[prost(string, optional, tag = "4")]
	pub avatar: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoomInfo {
	#[prost(string, tag = "1")]
	pub id: String,
	#[prost(string, tag = "2")]
	pub creator_id: String,
	#[prost(string, optional, tag = "3")]
	pub assigned_staff_id: Option<String>,
	#[prost(string, tag = "4")]
	pub subject: String,
	#[prost(string, tag = "5")]
	pub category: String,
	#[prost(string, tag = "6")]
	pub status: String,
	#[prost(string, tag = "7")]
	pub priority: String,
	#[prost(int64, optional, tag = "8")]
	pub last_message_at_unix_ms: Option<i64>,
	#[prost(bool, tag = "9")]
	pub is_active: bool,
	#[prost(string, tag = "10")]
	pub metadata_json: String,
	#[prost(int64, tag = "11")]
	pub created_at_unix_ms: i64,
	#[prost(int64, tag = "12")]
	pub updated_at_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageInfo {
	#[prost(string, tag = "1")]
	pub id: String,
	#[prost(int64, tag = "2")]
	pub seq: i64,
	#[prost(string, tag = "3")]
	pub room_id: String,
	#[prost(message, optional, tag = "4")]
	pub sender: Option<UserInfo>,
	#[prost(string, tag = "5")]
	pub content: String,
	#[prost(string, tag = "6")]
	pub message_type: String,
	#[prost(string, tag = "7")]
	pub metadata_json: String,
	#[prost(int64, tag = "8")]
	pub created_at_unix_ms: i64,
}

// ---- client -> server ----

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientEvent {
	#[prost(oneof = "client_event::Event", tags = "1, 2, 3, 4, 5, 6, 7, 8")]
	pub event: Option<client_event::Event>,
}

pub mod client_event {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Event {
		#[prost(message, tag = "1")]
		JoinUserRooms(super::JoinUserRooms),
		#[prost(message, tag = "2")]
		JoinRoom(super::JoinRoom),
		#[prost(message, tag = "3")]
		LeaveRoom(super::LeaveRoom),
		#[prost(message, tag = "4")]
		SendMessage(super::SendMessage),
		#[prost(message, tag = "5")]
		TypingStart(super::TypingStart),
		#[prost(message, tag = "6")]
		TypingStop(super::TypingStop),
		#[prost(message, tag = "7")]
		RoomStatusUpdate(super::RoomStatusUpdate),
		#[prost(message, tag = "8")]
		UpdateOnlineStatus(super::UpdateOnlineStatus),
	}
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct JoinUserRooms {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JoinRoom {
	#[prost(string, tag = "1")]
	pub room_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LeaveRoom {
	#[prost(string, tag = "1")]
	pub room_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendMessage {
	#[prost(string, tag = "1")]
	pub room_id: String,
	#[prost(string, tag = "2")]
	pub content: String,
	/// Empty means `text`.
	#[prost(string, tag = "3")]
	pub message_type: String,
	/// Empty means no metadata.
	#[prost(string, tag = "4")]
	pub metadata_json: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TypingStart {
	#[prost(string, tag = "1")]
	pub room_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TypingStop {
	#[prost(string, tag = "1")]
	pub room_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoomStatusUpdate {
	#[prost(string, tag = "1")]
	pub room_id: String,
	#[prost(string, tag = "2")]
	pub status: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateOnlineStatus {
	#[prost(string, tag = "1")]
	pub status: String,
}

// ---- server -> client ----

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerEvent {
	#[prost(oneof = "server_event::Event", tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11")]
	pub event: Option<server_event::Event>,
}

pub mod server_event {
	#[allow(clippy::large_enum_variant)]
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Event {
		#[prost(message, tag = "1")]
		RoomsJoined(super::RoomsJoined),
		#[prost(message, tag = "2")]
		RoomJoined(super::RoomJoined),
		#[prost(message, tag = "3")]
		RoomLeft(super::RoomLeft),
		#[prost(message, tag = "4")]
		UserJoined(super::UserJoined),
		#[prost(message, tag = "5")]
		UserLeft(super::UserLeft),
		#[prost(message, tag = "6")]
		NewMessage(super::NewMessage),
		#[prost(message, tag = "7")]
		RoomUpdated(super::RoomUpdated),
		#[prost(message, tag = "8")]
		RoomStatusUpdated(super::RoomStatusUpdated),
		#[prost(message, tag = "9")]
		UserTyping(super::UserTyping),
		#[prost(message, tag = "10")]
		UserStoppedTyping(super::UserStoppedTyping),
		#[prost(message, tag = "11")]
		UserStatusChanged(super::UserStatusChanged),
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoomsJoined {
	#[prost(message, repeated, tag = "1")]
	pub rooms: Vec<RoomInfo>,
	#[prost(uint32, tag = "2")]
	pub count: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoomJoined {
	#[prost(message, optional, tag = "1")]
	pub room: Option<RoomInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoomLeft {
	#[prost(string, tag = "1")]
	pub room_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserJoined {
	#[prost(string, tag = "1")]
	pub room_id: String,
	#[prost(message, optional, tag = "2")]
	pub user: Option<UserInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserLeft {
	#[prost(string, tag = "1")]
	pub room_id: String,
	#[prost(message, optional, tag = "2")]
	pub user: Option<UserInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NewMessage {
	#[prost(message, optional, tag = "1")]
	pub message: Option<MessageInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoomUpdated {
	#[prost(string, tag = "1")]
	pub room_id: String,
	#[prost(int64, tag = "2")]
	pub last_message_at_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoomStatusUpdated {
	#[prost(string, tag = "1")]
	pub room_id: String,
	#[prost(string, tag = "2")]
	pub status: String,
	#[prost(string, tag = "3")]
	pub updated_by: String,
	#[prost(string, optional, tag = "4")]
	pub assigned_staff_id: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserTyping {
	#[prost(string, tag = "1")]
	pub room_id: String,
	#[prost(message, optional, tag = "2")]
	pub user: Option<UserInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserStoppedTyping {
	#[prost(string, tag = "1")]
	pub room_id: String,
	#[prost(string, tag = "2")]
	pub user_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserStatusChanged {
	#[prost(string, tag = "1")]
	pub user_id: String,
	#[prost(string, tag = "2")]
	pub status: String,
	#[prost(int64, tag = "3")]
	pub last_seen_unix_ms: i64,
}
