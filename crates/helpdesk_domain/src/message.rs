use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ChatError, FieldError, MessageId, MessageKind, Role, RoomId, UserId};

pub const MAX_MESSAGE_CHARS: usize = 5000;

/// Sender identity copied onto a message at write time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderSnapshot {
	pub user_id: UserId,
	pub role: Role,
	pub display_name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub avatar: Option<String>,
}

/// Unvalidated send-message input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageDraft {
	#[serde(default)]
	pub content: String,
	#[serde(default, rename = "messageType", alias = "type")]
	pub kind: Option<String>,
	#[serde(default)]
	pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
	pub content: String,
	pub kind: MessageKind,
	pub metadata: Option<Value>,
}

impl MessageDraft {
	pub fn text(content: impl Into<String>) -> Self {
		Self {
			content: content.into(),
			..Self::default()
		}
	}

	pub fn validate(self) -> Result<NewMessage, ChatError> {
		let mut errors = Vec::new();

		if self.content.trim().is_empty() {
			errors.push(FieldError::new("content", "content is required"));
		} else if self.content.chars().count() > MAX_MESSAGE_CHARS {
			errors.push(FieldError::new(
				"content",
				format!("content must be at most {MAX_MESSAGE_CHARS} characters"),
			));
		}

		let kind = match self.kind.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
			None => Some(MessageKind::default()),
			Some(k) => match k.parse::<MessageKind>() {
				Ok(k) => Some(k),
				Err(e) => {
					errors.push(FieldError::new("messageType", e.to_string()));
					None
				}
			},
		};

		if let Some(meta) = &self.metadata
			&& !(meta.is_object() || meta.is_null())
		{
			errors.push(FieldError::new("metadata", "metadata must be a JSON object"));
		}

		match kind {
			Some(kind) if errors.is_empty() => Ok(NewMessage {
				content: self.content,
				kind,
				metadata: self.metadata.filter(|m| !m.is_null()),
			}),
			_ => Err(ChatError::Validation(errors)),
		}
	}
}

/// A message that has not been handed to the store yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
	pub id: MessageId,
	pub room_id: RoomId,
	pub sender: SenderSnapshot,
	pub content: String,
	pub kind: MessageKind,
	pub metadata: Option<Value>,
	pub created_at: i64,
}

impl PendingMessage {
	pub fn new(room_id: RoomId, sender: SenderSnapshot, body: NewMessage, created_at: i64) -> Self {
		Self {
			id: MessageId::new_v4(),
			room_id,
			sender,
			content: body.content,
			kind: body.kind,
			metadata: body.metadata,
			created_at,
		}
	}

	/// Attach the sequence number the store assigned.
	pub fn stored(self, seq: i64) -> Message {
		Message {
			id: self.id,
			seq,
			room_id: self.room_id,
			sender: self.sender,
			content: self.content,
			kind: self.kind,
			metadata: self.metadata,
			created_at: self.created_at,
		}
	}
}

/// An immutable, persisted chat message.
///
/// `seq` is assigned by the message store and orders messages that share a
/// `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
	pub id: MessageId,
	pub seq: i64,
	pub room_id: RoomId,
	pub sender: SenderSnapshot,
	pub content: String,
	#[serde(rename = "messageType")]
	pub kind: MessageKind,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub metadata: Option<Value>,
	pub created_at: i64,
}

impl Message {
	/// History order: `(created_at, seq)` ascending.
	pub fn order_key(&self) -> (i64, i64) {
		(self.created_at, self.seq)
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn draft_defaults_to_text() {
		let body = MessageDraft::text("hello").validate().unwrap();
		assert_eq!(body.kind, MessageKind::Text);
		assert!(body.metadata.is_none());
	}

	#[test]
	fn draft_rejects_blank_and_oversized_content() {
		let err = MessageDraft::text("   ").validate().unwrap_err();
		assert_eq!(err.fields()[0].field, "content");

		let err = MessageDraft::text("x".repeat(MAX_MESSAGE_CHARS + 1)).validate().unwrap_err();
		assert_eq!(err.code(), "VALIDATION");

		assert!(MessageDraft::text("x".repeat(MAX_MESSAGE_CHARS)).validate().is_ok());
	}

	#[test]
	fn draft_checks_kind_and_metadata() {
		let err = MessageDraft {
			content: "see attached".into(),
			kind: Some("video".into()),
			metadata: Some(json!([1, 2])),
		}
		.validate()
		.unwrap_err();
		let fields: Vec<_> = err.fields().iter().map(|f| f.field.as_str()).collect();
		assert_eq!(fields, vec!["messageType", "metadata"]);

		let body = MessageDraft {
			content: "https://cdn.example/receipt.png".into(),
			kind: Some("IMAGE".into()),
			metadata: Some(json!({ "width": 640 })),
		}
		.validate()
		.unwrap();
		assert_eq!(body.kind, MessageKind::Image);
		assert_eq!(body.metadata, Some(json!({ "width": 640 })));
	}

	#[test]
	fn draft_deserializes_wire_names() {
		let draft: MessageDraft = serde_json::from_value(json!({ "content": "hi", "messageType": "file" })).unwrap();
		assert_eq!(draft.kind.as_deref(), Some("file"));
	}
}
