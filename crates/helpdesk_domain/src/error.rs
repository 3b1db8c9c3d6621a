use core::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
	pub field: String,
	pub message: String,
}

impl FieldError {
	pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			field: field.into(),
			message: message.into(),
		}
	}
}

impl fmt::Display for FieldError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}: {}", self.field, self.message)
	}
}

/// Error taxonomy for every chat operation.
///
/// `Unauthenticated`, `Forbidden`, `Validation` and `RateLimited` are reported
/// to the caller only. `StoreUnavailable` on a write is always surfaced so the
/// caller can retry. `DeliveryDegraded` never leaves the server.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
	#[error("unauthenticated: {0}")]
	Unauthenticated(String),

	#[error("forbidden: {0}")]
	Forbidden(String),

	#[error("not found: {0}")]
	NotFound(String),

	#[error("validation failed: {}", join_fields(.0))]
	Validation(Vec<FieldError>),

	#[error("rate limited")]
	RateLimited,

	#[error("store unavailable: {0}")]
	StoreUnavailable(String),

	#[error("delivery degraded: {0}")]
	DeliveryDegraded(String),
}

fn join_fields(fields: &[FieldError]) -> String {
	fields.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

impl ChatError {
	/// Single-field validation error.
	pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
		ChatError::Validation(vec![FieldError::new(field, message)])
	}

	/// Validation error for a required field that was absent or blank.
	pub fn missing(field: &str) -> Self {
		ChatError::invalid(field, format!("{field} is required"))
	}

	/// Wrap an infrastructure failure from either data store.
	pub fn store(err: impl fmt::Display) -> Self {
		ChatError::StoreUnavailable(err.to_string())
	}

	/// Stable machine-readable code used on the wire.
	pub const fn code(&self) -> &'static str {
		match self {
			ChatError::Unauthenticated(_) => "UNAUTHENTICATED",
			ChatError::Forbidden(_) => "FORBIDDEN",
			ChatError::NotFound(_) => "NOT_FOUND",
			ChatError::Validation(_) => "VALIDATION",
			ChatError::RateLimited => "RATE_LIMITED",
			ChatError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
			ChatError::DeliveryDegraded(_) => "DELIVERY_DEGRADED",
		}
	}

	pub fn fields(&self) -> &[FieldError] {
		match self {
			ChatError::Validation(fields) => fields,
			_ => &[],
		}
	}
}
