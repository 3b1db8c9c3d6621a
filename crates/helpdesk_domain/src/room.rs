use serde::{Deserialize, Serialize};

use crate::{ChatError, FieldError, Priority, Role, RoomCategory, RoomId, RoomStatus, UserId};

pub const MAX_SUBJECT_CHARS: usize = 200;

/// Contact details a customer attached to a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub email: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub phone: Option<String>,
}

/// Free-form room metadata (order/product references, tags, contact info).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMetadata {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub order_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub product_id: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub tags: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub contact: Option<ContactInfo>,
}

/// A support conversation.
///
/// Exactly one creator, at most one assigned staff member, and a
/// `last_message_at` that never moves backwards. Rooms are never deleted;
/// `is_active = false` hides them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
	pub id: RoomId,
	pub creator_id: UserId,
	pub assigned_staff_id: Option<UserId>,
	pub subject: String,
	pub category: RoomCategory,
	pub status: RoomStatus,
	pub priority: Priority,
	pub last_message_at: Option<i64>,
	pub is_active: bool,
	pub metadata: RoomMetadata,
	pub created_at: i64,
	pub updated_at: i64,
}

impl Room {
	/// A freshly opened room: status `open`, nobody assigned.
	pub fn open(id: RoomId, creator_id: UserId, new_room: NewRoom, now_ms: i64) -> Self {
		Self {
			id,
			creator_id,
			assigned_staff_id: None,
			subject: new_room.subject,
			category: new_room.category,
			status: RoomStatus::Open,
			priority: new_room.priority,
			last_message_at: None,
			is_active: true,
			metadata: new_room.metadata,
			created_at: now_ms,
			updated_at: now_ms,
		}
	}

	/// Access predicate: admin, the creator, or the assigned staff member.
	pub fn allows(&self, user_id: &UserId, role: Role) -> bool {
		match role {
			Role::Admin => true,
			Role::Staff | Role::User => {
				&self.creator_id == user_id || self.assigned_staff_id.as_ref() == Some(user_id)
			}
		}
	}

	/// Advance `last_message_at`; older timestamps are ignored.
	pub fn touch(&mut self, at_ms: i64) {
		self.last_message_at = Some(self.last_message_at.map_or(at_ms, |prev| prev.max(at_ms)));
		self.updated_at = self.updated_at.max(at_ms);
	}

	/// Sort key for listings: most recent activity first.
	pub fn activity_key(&self) -> i64 {
		self.last_message_at.unwrap_or(self.created_at)
	}
}

/// Unvalidated create-room input, as received from a client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomDraft {
	#[serde(default)]
	pub subject: String,
	#[serde(default)]
	pub category: String,
	#[serde(default)]
	pub priority: Option<String>,
	#[serde(default)]
	pub metadata: RoomMetadata,
}

/// Validated create-room input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRoom {
	pub subject: String,
	pub category: RoomCategory,
	pub priority: Priority,
	pub metadata: RoomMetadata,
}

impl RoomDraft {
	/// Validate every field and report all failures at once.
	pub fn validate(self) -> Result<NewRoom, ChatError> {
		let mut errors = Vec::new();

		let subject = self.subject.trim().to_string();
		if subject.is_empty() {
			errors.push(FieldError::new("subject", "subject is required"));
		} else if subject.chars().count() > MAX_SUBJECT_CHARS {
			errors.push(FieldError::new(
				"subject",
				format!("subject must be at most {MAX_SUBJECT_CHARS} characters"),
			));
		}

		let category = match self.category.parse::<RoomCategory>() {
			Ok(c) => Some(c),
			Err(e) => {
				errors.push(FieldError::new("category", e.to_string()));
				None
			}
		};

		let priority = match self.priority.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
			None => Some(Priority::default()),
			Some(p) => match p.parse::<Priority>() {
				Ok(p) => Some(p),
				Err(e) => {
					errors.push(FieldError::new("priority", e.to_string()));
					None
				}
			},
		};

		match (category, priority) {
			(Some(category), Some(priority)) if errors.is_empty() => Ok(NewRoom {
				subject,
				category,
				priority,
				metadata: self.metadata,
			}),
			_ => Err(ChatError::Validation(errors)),
		}
	}
}
