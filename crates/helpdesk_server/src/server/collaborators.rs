#![forbid(unsafe_code)]

//! Back-office services the chat core calls into but does not own:
//! notification dispatch, the user directory (lookup, block, last seen)
//! and the staff listing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use helpdesk_domain::{Role, RoomId, UserId};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::SecretString;

/// A user as known to the back-office.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
	pub user_id: UserId,
	pub role: Role,
	pub display_name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub avatar: Option<String>,
	#[serde(default = "default_true")]
	pub is_active: bool,
	#[serde(default)]
	pub is_blocked: bool,
}

fn default_true() -> bool {
	true
}

impl UserRecord {
	pub fn new(user_id: UserId, role: Role, display_name: impl Into<String>) -> Self {
		Self {
			user_id,
			role,
			display_name: display_name.into(),
			avatar: None,
			is_active: true,
			is_blocked: false,
		}
	}

	/// Staff that may receive new rooms.
	pub fn is_assignable(&self) -> bool {
		self.role == Role::Staff && self.is_active && !self.is_blocked
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
	pub recipient_id: UserId,
	pub title: String,
	pub body: String,
	pub kind: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub room_id: Option<RoomId>,
}

impl Notification {
	pub fn room_assigned(recipient_id: UserId, room_id: &RoomId, subject: &str) -> Self {
		Self {
			recipient_id,
			title: "New support request assigned".to_string(),
			body: subject.to_string(),
			kind: "chat_assignment".to_string(),
			room_id: Some(room_id.clone()),
		}
	}
}

#[async_trait]
pub trait Notifier: Send + Sync {
	async fn notify(&self, notification: Notification) -> anyhow::Result<()>;

	async fn notify_many(&self, notifications: Vec<Notification>) -> anyhow::Result<()>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
	/// `None` when the back-office does not know the user.
	async fn lookup(&self, user_id: &UserId) -> anyhow::Result<Option<UserRecord>>;

	async fn block(&self, user_id: &UserId) -> anyhow::Result<()>;

	async fn record_last_seen(&self, user_id: &UserId, at_ms: i64) -> anyhow::Result<()>;
}

#[async_trait]
pub trait StaffDirectory: Send + Sync {
	/// Staff in a stable enumeration order.
	async fn list_staff(&self) -> anyhow::Result<Vec<UserRecord>>;
}

/// The three collaborator seams, wired once at startup.
#[derive(Clone)]
pub struct BackOffice {
	pub notifier: Arc<dyn Notifier>,
	pub users: Arc<dyn UserDirectory>,
	pub staff: Arc<dyn StaffDirectory>,
}

impl BackOffice {
	pub fn from_shared<T>(inner: Arc<T>) -> Self
	where
		T: Notifier + UserDirectory + StaffDirectory + 'static,
	{
		Self {
			notifier: inner.clone(),
			users: inner.clone(),
			staff: inner,
		}
	}
}

/// In-process back-office for development and tests.
#[derive(Default)]
pub struct MemoryBackOffice {
	inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
	users: Vec<UserRecord>,
	notifications: Vec<Notification>,
	last_seen: HashMap<UserId, i64>,
	fail_notifications: bool,
}

impl MemoryBackOffice {
	pub fn new() -> Self {
		Self::default()
	}

	/// Insert or replace a user, keeping first-insertion order.
	pub async fn upsert_user(&self, record: UserRecord) {
		let mut inner = self.inner.lock().await;
		match inner.users.iter_mut().find(|u| u.user_id == record.user_id) {
			Some(existing) => *existing = record,
			None => inner.users.push(record),
		}
	}

	pub async fn notifications(&self) -> Vec<Notification> {
		self.inner.lock().await.notifications.clone()
	}

	pub async fn last_seen(&self, user_id: &UserId) -> Option<i64> {
		self.inner.lock().await.last_seen.get(user_id).copied()
	}

	/// Make every notification call fail.
	pub async fn set_fail_notifications(&self, fail: bool) {
		self.inner.lock().await.fail_notifications = fail;
	}
}

#[async_trait]
impl Notifier for MemoryBackOffice {
	async fn notify(&self, notification: Notification) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;
		if inner.fail_notifications {
			return Err(anyhow!("notification endpoint unavailable"));
		}
		inner.notifications.push(notification);
		Ok(())
	}

	async fn notify_many(&self, notifications: Vec<Notification>) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;
		if inner.fail_notifications {
			return Err(anyhow!("notification endpoint unavailable"));
		}
		inner.notifications.extend(notifications);
		Ok(())
	}
}

#[async_trait]
impl UserDirectory for MemoryBackOffice {
	async fn lookup(&self, user_id: &UserId) -> anyhow::Result<Option<UserRecord>> {
		let inner = self.inner.lock().await;
		Ok(inner.users.iter().find(|u| &u.user_id == user_id).cloned())
	}

	/// Users only known from their credentials get a blocked placeholder record.
	async fn block(&self, user_id: &UserId) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;
		match inner.users.iter_mut().find(|u| &u.user_id == user_id) {
			Some(user) => user.is_blocked = true,
			None => {
				let mut record = UserRecord::new(user_id.clone(), Role::User, user_id.as_str());
				record.is_blocked = true;
				inner.users.push(record);
			}
		}
		Ok(())
	}

	async fn record_last_seen(&self, user_id: &UserId, at_ms: i64) -> anyhow::Result<()> {
		self.inner.lock().await.last_seen.insert(user_id.clone(), at_ms);
		Ok(())
	}
}

#[async_trait]
impl StaffDirectory for MemoryBackOffice {
	async fn list_staff(&self) -> anyhow::Result<Vec<UserRecord>> {
		let inner = self.inner.lock().await;
		Ok(inner.users.iter().filter(|u| u.role == Role::Staff).cloned().collect())
	}
}

/// JSON-over-HTTP back-office client.
#[derive(Debug, Clone)]
pub struct HttpBackOffice {
	base_url: Url,
	api_key: Option<SecretString>,
	client: reqwest::Client,
}

#[derive(Serialize)]
struct BulkNotifyRequest<'a> {
	notifications: &'a [Notification],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LastSeenRequest {
	last_seen: i64,
}

impl HttpBackOffice {
	pub fn new(base_url: &str, api_key: Option<SecretString>, timeout: Duration) -> anyhow::Result<Self> {
		let base_url = Url::parse(base_url.trim()).context("parse backoffice base_url")?;
		if base_url.cannot_be_a_base() {
			return Err(anyhow!("backoffice base_url must be hierarchical: {base_url}"));
		}
		let client = reqwest::Client::builder()
			.timeout(timeout)
			.build()
			.context("build backoffice http client")?;
		Ok(Self {
			base_url,
			api_key,
			client,
		})
	}

	fn url(&self, segments: &[&str]) -> anyhow::Result<Url> {
		let mut url = self.base_url.clone();
		url.path_segments_mut()
			.map_err(|_| anyhow!("backoffice base_url cannot be a base"))?
			.pop_if_empty()
			.extend(segments);
		Ok(url)
	}

	fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
		let req = self.client.request(method, url);
		match &self.api_key {
			Some(key) => req.header("Authorization", format!("Bearer {}", key.expose())),
			None => req,
		}
	}
}

#[async_trait]
impl Notifier for HttpBackOffice {
	async fn notify(&self, notification: Notification) -> anyhow::Result<()> {
		let url = self.url(&["notifications"])?;
		let resp = self
			.request(reqwest::Method::POST, url)
			.json(&notification)
			.send()
			.await
			.context("backoffice notify")?;

		match resp.status() {
			StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED | StatusCode::NO_CONTENT => Ok(()),
			status => Err(anyhow!("backoffice notify failed: status={}", status)),
		}
	}

	async fn notify_many(&self, notifications: Vec<Notification>) -> anyhow::Result<()> {
		if notifications.is_empty() {
			return Ok(());
		}
		let url = self.url(&["notifications", "bulk"])?;
		let resp = self
			.request(reqwest::Method::POST, url)
			.json(&BulkNotifyRequest {
				notifications: &notifications,
			})
			.send()
			.await
			.context("backoffice bulk notify")?;

		match resp.status() {
			StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED | StatusCode::NO_CONTENT => Ok(()),
			status => Err(anyhow!("backoffice bulk notify failed: status={}", status)),
		}
	}
}

#[async_trait]
impl UserDirectory for HttpBackOffice {
	async fn lookup(&self, user_id: &UserId) -> anyhow::Result<Option<UserRecord>> {
		let url = self.url(&["users", user_id.as_str()])?;
		let resp = self
			.request(reqwest::Method::GET, url)
			.send()
			.await
			.context("backoffice get user")?;

		match resp.status() {
			StatusCode::OK => Ok(Some(resp.json::<UserRecord>().await.context("decode user record")?)),
			StatusCode::NOT_FOUND => Ok(None),
			status => Err(anyhow!("backoffice get user failed: status={}", status)),
		}
	}

	async fn block(&self, user_id: &UserId) -> anyhow::Result<()> {
		let url = self.url(&["users", user_id.as_str(), "block"])?;
		let resp = self
			.request(reqwest::Method::POST, url)
			.send()
			.await
			.context("backoffice block user")?;

		match resp.status() {
			StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
			status => Err(anyhow!("backoffice block user failed: status={}", status)),
		}
	}

	async fn record_last_seen(&self, user_id: &UserId, at_ms: i64) -> anyhow::Result<()> {
		let url = self.url(&["users", user_id.as_str(), "last-seen"])?;
		let resp = self
			.request(reqwest::Method::PUT, url)
			.json(&LastSeenRequest { last_seen: at_ms })
			.send()
			.await
			.context("backoffice record last seen")?;

		match resp.status() {
			StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
			status => Err(anyhow!("backoffice record last seen failed: status={}", status)),
		}
	}
}

#[async_trait]
impl StaffDirectory for HttpBackOffice {
	async fn list_staff(&self) -> anyhow::Result<Vec<UserRecord>> {
		let url = self.url(&["staff"])?;
		let resp = self
			.request(reqwest::Method::GET, url)
			.send()
			.await
			.context("backoffice list staff")?;

		if !resp.status().is_success() {
			return Err(anyhow!("backoffice list staff failed: status={}", resp.status()));
		}
		resp.json::<Vec<UserRecord>>().await.context("decode staff list")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn uid(s: &str) -> UserId {
		UserId::new(s).unwrap()
	}

	#[tokio::test]
	async fn memory_staff_listing_keeps_insertion_order() {
		let office = MemoryBackOffice::new();
		office.upsert_user(UserRecord::new(uid("s2"), Role::Staff, "Sid")).await;
		office.upsert_user(UserRecord::new(uid("u1"), Role::User, "Una")).await;
		office.upsert_user(UserRecord::new(uid("s1"), Role::Staff, "Sam")).await;
		office.upsert_user(UserRecord::new(uid("s2"), Role::Staff, "Sid B.")).await;

		let staff = office.list_staff().await.unwrap();
		let names: Vec<_> = staff.iter().map(|s| s.display_name.as_str()).collect();
		assert_eq!(names, vec!["Sid B.", "Sam"]);
	}

	#[tokio::test]
	async fn memory_block_marks_user() {
		let office = MemoryBackOffice::new();
		office.upsert_user(UserRecord::new(uid("u1"), Role::User, "Una")).await;
		office.block(&uid("u1")).await.unwrap();
		assert!(office.lookup(&uid("u1")).await.unwrap().unwrap().is_blocked);
		office.block(&uid("ghost")).await.unwrap();
		assert!(office.lookup(&uid("ghost")).await.unwrap().unwrap().is_blocked);
		assert!(office.list_staff().await.unwrap().is_empty());
	}

	#[test]
	fn assignable_means_active_unblocked_staff() {
		let mut rec = UserRecord::new(uid("s1"), Role::Staff, "Sam");
		assert!(rec.is_assignable());
		rec.is_active = false;
		assert!(!rec.is_assignable());
		assert!(!UserRecord::new(uid("a1"), Role::Admin, "Ada").is_assignable());
	}

	#[test]
	fn http_urls_escape_ids_and_keep_base_path() {
		let office = HttpBackOffice::new("http://backoffice.local/api/", None, Duration::from_secs(1)).unwrap();
		let url = office.url(&["users", "a b/c", "block"]).unwrap();
		assert_eq!(url.as_str(), "http://backoffice.local/api/users/a%20b%2Fc/block");
	}

	#[test]
	fn user_record_defaults_when_flags_missing() {
		let rec: UserRecord =
			serde_json::from_str(r#"{"userId":"s1","role":"staff","displayName":"Sam"}"#).unwrap();
		assert!(rec.is_active);
		assert!(!rec.is_blocked);
	}
}
