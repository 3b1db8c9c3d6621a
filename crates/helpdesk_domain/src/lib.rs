#![forbid(unsafe_code)]

mod error;
mod message;
mod page;
mod room;

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use error::{ChatError, FieldError};
pub use message::{MAX_MESSAGE_CHARS, Message, MessageDraft, NewMessage, PendingMessage, SenderSnapshot};
pub use page::{DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT, Page, PageInfo, PageRequest};
pub use room::{ContactInfo, MAX_SUBJECT_CHARS, NewRoom, Room, RoomDraft, RoomMetadata};

/// Errors for parsing identifiers and enumerated values from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown {kind}: {value}")]
	UnknownVariant {
		kind: &'static str,
		value: String,
	},
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Declares a closed string-backed enum with stable wire names.
macro_rules! string_enum {
	(
		$(#[$meta:meta])*
		$name:ident ($kind:literal) {
			$( $(#[$vmeta:meta])* $variant:ident => $wire:literal $(| $alias:literal)* ),+ $(,)?
		}
	) => {
		$(#[$meta])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(rename_all = "snake_case")]
		pub enum $name {
			$( $(#[$vmeta])* $variant ),+
		}

		impl $name {
			/// Every variant, in declaration order.
			pub const ALL: &'static [$name] = &[$($name::$variant),+];

			/// Stable string identifier.
			pub const fn as_str(self) -> &'static str {
				match self {
					$( $name::$variant => $wire ),+
				}
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(self.as_str())
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				let s = s.trim();
				if s.is_empty() {
					return Err(ParseIdError::Empty);
				}

				match s.to_ascii_lowercase().as_str() {
					$( $wire $(| $alias)* => Ok($name::$variant), )+
					other => Err(ParseIdError::UnknownVariant {
						kind: $kind,
						value: other.to_string(),
					}),
				}
			}
		}
	};
}

string_enum! {
	/// Resolved role of an authenticated identity.
	Role ("role") {
		Admin => "admin",
		Staff => "staff",
		User => "user" | "customer",
	}
}

string_enum! {
	/// Room lifecycle: `open -> assigned -> resolved -> closed`, plus direct closes.
	RoomStatus ("status") {
		Open => "open",
		Assigned => "assigned" | "in_progress",
		Resolved => "resolved",
		Closed => "closed",
	}
}

string_enum! {
	/// Subject area of a support request.
	RoomCategory ("category") {
		ProductInquiry => "product_inquiry",
		OrderSupport => "order_support",
		Complaint => "complaint",
		General => "general",
		TechnicalSupport => "technical_support",
		AccountSupport => "account_support",
	}
}

string_enum! {
	Priority ("priority") {
		Low => "low",
		Medium => "medium",
		High => "high",
	}
}

string_enum! {
	/// Message payload type; `image` and `file` carry a reference in `content`.
	MessageKind ("message type") {
		Text => "text",
		Image => "image",
		File => "file",
	}
}

string_enum! {
	/// Presence state broadcast to every connection.
	OnlineStatus ("online status") {
		Online => "online",
		Away => "away",
		Busy => "busy",
		Offline => "offline",
	}
}

impl RoomStatus {
	/// Rooms in these states count towards a staff member's load.
	pub const fn counts_as_load(self) -> bool {
		matches!(self, RoomStatus::Open | RoomStatus::Assigned)
	}
}

impl Default for Priority {
	fn default() -> Self {
		Priority::Medium
	}
}

impl Default for MessageKind {
	fn default() -> Self {
		MessageKind::Text
	}
}

macro_rules! string_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(String);

		impl $name {
			/// Create a non-empty id.
			pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
				let id = id.into();
				let trimmed = id.trim();
				if trimmed.is_empty() {
					return Err(ParseIdError::Empty);
				}
				if trimmed.len() != id.len() {
					return Ok(Self(trimmed.to_string()));
				}
				Ok(Self(id))
			}

			pub fn as_str(&self) -> &str {
				&self.0
			}

			pub fn into_string(self) -> String {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				$name::new(s.to_string())
			}
		}
	};
}

string_id! {
	/// Opaque, client-visible room identifier.
	RoomId
}

string_id! {
	/// Identity of a user, staff member or admin in the back-office.
	UserId
}

impl RoomId {
	/// Fresh globally unique room id.
	pub fn generate() -> Self {
		Self(uuid::Uuid::new_v4().to_string())
	}
}

/// Store-generated message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub uuid::Uuid);

impl MessageId {
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for MessageId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(MessageId)
			.map_err(|e| ParseIdError::InvalidFormat(e.to_string()))
	}
}

/// An authenticated identity as resolved at connection time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
	pub user_id: UserId,
	pub role: Role,
	pub display_name: String,
	pub avatar: Option<String>,
}

impl Principal {
	pub fn new(user_id: UserId, role: Role, display_name: impl Into<String>) -> Self {
		Self {
			user_id,
			role,
			display_name: display_name.into(),
			avatar: None,
		}
	}

	pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
		self.avatar = Some(avatar.into());
		self
	}

	pub fn is_admin(&self) -> bool {
		self.role == Role::Admin
	}

	/// Denormalized copy stored alongside every message this identity sends.
	pub fn sender_snapshot(&self) -> SenderSnapshot {
		SenderSnapshot {
			user_id: self.user_id.clone(),
			role: self.role,
			display_name: self.display_name.clone(),
			avatar: self.avatar.clone(),
		}
	}
}
