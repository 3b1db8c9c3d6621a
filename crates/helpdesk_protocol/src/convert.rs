//! Domain to wire conversions.

use helpdesk_domain::{ChatError, Message, MessageDraft, Principal, Room, SenderSnapshot};

use crate::pb;

pub fn room_info(room: &Room) -> pb::RoomInfo {
	pb::RoomInfo {
		id: room.id.to_string(),
		creator_id: room.creator_id.to_string(),
		assigned_staff_id: room.assigned_staff_id.as_ref().map(ToString::to_string),
		subject: room.subject.clone(),
		category: room.category.as_str().to_string(),
		status: room.status.as_str().to_string(),
		priority: room.priority.as_str().to_string(),
		last_message_at_unix_ms: room.last_message_at,
		is_active: room.is_active,
		metadata_json: serde_json::to_string(&room.metadata).unwrap_or_default(),
		created_at_unix_ms: room.created_at,
		updated_at_unix_ms: room.updated_at,
	}
}

pub fn sender_info(sender: &SenderSnapshot) -> pb::UserInfo {
	pb::UserInfo {
		user_id: sender.user_id.to_string(),
		role: sender.role.as_str().to_string(),
		display_name: sender.display_name.clone(),
		avatar: sender.avatar.clone(),
	}
}

pub fn principal_info(principal: &Principal) -> pb::UserInfo {
	sender_info(&principal.sender_snapshot())
}

pub fn message_info(msg: &Message) -> pb::MessageInfo {
	pb::MessageInfo {
		id: msg.id.to_string(),
		seq: msg.seq,
		room_id: msg.room_id.to_string(),
		sender: Some(sender_info(&msg.sender)),
		content: msg.content.clone(),
		message_type: msg.kind.as_str().to_string(),
		metadata_json: msg.metadata.as_ref().map(ToString::to_string).unwrap_or_default(),
		created_at_unix_ms: msg.created_at,
	}
}

pub fn error(err: &ChatError) -> pb::Error {
	pb::Error {
		code: err.code().to_string(),
		message: err.to_string(),
		fields: err
			.fields()
			.iter()
			.map(|f| pb::FieldError {
				field: f.field.clone(),
				message: f.message.clone(),
			})
			.collect(),
	}
}

pub fn server_event(event: pb::server_event::Event) -> pb::ServerEvent {
	pb::ServerEvent { event: Some(event) }
}

pub fn new_message_event(msg: &Message) -> pb::ServerEvent {
	server_event(pb::server_event::Event::NewMessage(pb::NewMessage {
		message: Some(message_info(msg)),
	}))
}

/// Unvalidated draft from a wire `SendMessage`. Metadata that is not valid
/// JSON is a validation error on `metadata`.
pub fn message_draft(req: &pb::SendMessage) -> Result<MessageDraft, ChatError> {
	let metadata = match req.metadata_json.trim() {
		"" => None,
		raw => Some(
			serde_json::from_str(raw).map_err(|e| ChatError::invalid("metadata", format!("invalid JSON: {e}")))?,
		),
	};

	Ok(MessageDraft {
		content: req.content.clone(),
		kind: (!req.message_type.is_empty()).then(|| req.message_type.clone()),
		metadata,
	})
}

#[cfg(test)]
mod tests {
	use helpdesk_domain::{MessageKind, PendingMessage, Role, RoomDraft, RoomId, UserId};

	use super::*;

	#[test]
	fn message_info_carries_sender_snapshot() {
		let sender = Principal::new(UserId::new("u1").unwrap(), Role::User, "Una").with_avatar("a.png");
		let body = MessageDraft::text("Where is my package?").validate().unwrap();
		let msg = PendingMessage::new(RoomId::new("r1").unwrap(), sender.sender_snapshot(), body, 42).stored(7);

		let info = message_info(&msg);
		assert_eq!(info.seq, 7);
		assert_eq!(info.message_type, "text");
		assert!(info.metadata_json.is_empty());
		let sender = info.sender.unwrap();
		assert_eq!(sender.display_name, "Una");
		assert_eq!(sender.avatar.as_deref(), Some("a.png"));
		assert_eq!(sender.role, "user");
	}

	#[test]
	fn room_info_uses_wire_names() {
		let new_room = RoomDraft {
			subject: "Broken zipper".into(),
			category: "complaint".into(),
			priority: Some("high".into()),
			..RoomDraft::default()
		}
		.validate()
		.unwrap();
		let room = Room::open(RoomId::new("r9").unwrap(), UserId::new("u1").unwrap(), new_room, 10);

		let info = room_info(&room);
		assert_eq!(info.status, "open");
		assert_eq!(info.category, "complaint");
		assert_eq!(info.priority, "high");
		assert_eq!(info.assigned_staff_id, None);
		assert_eq!(info.metadata_json, "{}");
	}

	#[test]
	fn send_message_metadata_must_be_json() {
		let mut req = pb::SendMessage {
			room_id: "r1".into(),
			content: "photo".into(),
			message_type: "image".into(),
			metadata_json: "{not json".into(),
		};
		let err = message_draft(&req).unwrap_err();
		assert_eq!(err.fields()[0].field, "metadata");

		req.metadata_json = r#"{"width": 10}"#.into();
		let body = message_draft(&req).unwrap().validate().unwrap();
		assert_eq!(body.kind, MessageKind::Image);
	}

	#[test]
	fn error_carries_code_and_fields() {
		let wire = error(&ChatError::missing("roomId"));
		assert_eq!(wire.code, "VALIDATION");
		assert_eq!(wire.fields.len(), 1);
		assert_eq!(wire.fields[0].field, "roomId");
	}
}
