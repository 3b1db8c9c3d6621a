#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use helpdesk_domain::{ChatError, Principal, Role, UserId};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::config::SecretString;
use crate::server::collaborators::UserDirectory;
use crate::util::time::unix_secs_now;

/// Session credential claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub role: String,
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub avatar: Option<String>,
	/// Expiry, unix seconds.
	pub exp: u64,
}

pub fn verify_hmac_token(token: &str, secret: &str) -> anyhow::Result<AuthClaims> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(anyhow!("invalid token format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid token signature"));
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	if claims.exp <= unix_secs_now() {
		return Err(anyhow!("token expired"));
	}

	Ok(claims)
}

/// Mint a `v1.<claims>.<sig>` credential.
pub fn sign_hmac_token(claims: &AuthClaims, secret: &str) -> anyhow::Result<String> {
	let payload = serde_json::to_vec(claims).context("encode token claims")?;
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	Ok(format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> anyhow::Result<Vec<u8>> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|e| anyhow!("hmac key: {e}"))?;
	mac.update(payload_b64);
	Ok(mac.finalize().into_bytes().to_vec())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

/// Resolves a session credential to a [`Principal`], once per connection.
#[derive(Clone)]
pub struct Authenticator {
	secret: SecretString,
	users: Option<Arc<dyn UserDirectory>>,
	unknown_users: UnknownUsers,
	timeout: Duration,
}

/// What to do with a verified credential whose subject the directory has never seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownUsers {
	Reject,
	/// Build the principal from the claims. Known users are still checked for blocks.
	TrustCredential,
}

impl Authenticator {
	pub fn new(secret: SecretString, timeout: Duration) -> Self {
		Self {
			secret,
			users: None,
			unknown_users: UnknownUsers::Reject,
			timeout,
		}
	}

	/// Check ban/active status (and take name/role) from the back-office.
	pub fn with_directory(mut self, users: Arc<dyn UserDirectory>) -> Self {
		self.users = Some(users);
		self
	}

	pub fn unknown_users(mut self, policy: UnknownUsers) -> Self {
		self.unknown_users = policy;
		self
	}

	pub async fn authenticate(&self, token: &str) -> Result<Principal, ChatError> {
		let token = token.trim();
		if token.is_empty() {
			return Err(ChatError::Unauthenticated("missing credential".to_string()));
		}

		let claims = verify_hmac_token(token, self.secret.expose()).map_err(|e| {
			debug!(error = %e, "credential rejected");
			ChatError::Unauthenticated(e.to_string())
		})?;

		let user_id =
			UserId::new(claims.sub.clone()).map_err(|_| ChatError::Unauthenticated("credential has no subject".into()))?;
		let role: Role = claims
			.role
			.parse()
			.map_err(|e| ChatError::Unauthenticated(format!("credential role: {e}")))?;

		let from_claims = |user_id: UserId| {
			let mut principal = Principal::new(user_id, role, claims.name.clone());
			principal.avatar = claims.avatar.clone();
			principal
		};

		let Some(users) = &self.users else {
			return Ok(from_claims(user_id));
		};

		let record = match tokio::time::timeout(self.timeout, users.lookup(&user_id)).await {
			Ok(Ok(Some(record))) => record,
			Ok(Ok(None)) if self.unknown_users == UnknownUsers::TrustCredential => return Ok(from_claims(user_id)),
			Ok(Ok(None)) => return Err(ChatError::Unauthenticated("unknown user".to_string())),
			Ok(Err(e)) => {
				warn!(user_id = %user_id, error = %e, "user directory lookup failed");
				return Err(ChatError::Unauthenticated("user directory unavailable".to_string()));
			}
			Err(_) => {
				warn!(user_id = %user_id, timeout_ms = self.timeout.as_millis(), "user directory lookup timed out");
				return Err(ChatError::Unauthenticated("user directory unavailable".to_string()));
			}
		};

		if record.is_blocked {
			return Err(ChatError::Unauthenticated("account is blocked".to_string()));
		}
		if !record.is_active {
			return Err(ChatError::Unauthenticated("account is inactive".to_string()));
		}

		Ok(Principal {
			user_id,
			role: record.role,
			display_name: record.display_name,
			avatar: record.avatar,
		})
	}
}
