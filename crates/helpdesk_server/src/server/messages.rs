#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use helpdesk_domain::{
	ChatError, Message, MessageId, MessageKind, NewMessage, Page, PageRequest, PendingMessage, Principal, Role,
	RoomId, SenderSnapshot, UserId,
};
use helpdesk_protocol::{convert, pb};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::FeedSettings;
use crate::server::directory::{RoomDirectory, connect_sqlite};
use crate::server::room_hub::{ConnId, HubItem, RoomHub};
use crate::util::deadline::store_call;
use crate::util::time::{backoff_delay, unix_ms_now};

/// Page size for history when the caller does not pick one.
pub const HISTORY_PAGE_LIMIT: u32 = 50;

/// Message persistence. Every record gets a store-assigned `seq` that
/// increases with insertion order.
#[async_trait]
pub trait MessageStore: Send + Sync {
	async fn append(&self, pending: PendingMessage) -> anyhow::Result<Message>;

	/// One page of a room, ascending by `(created_at, seq)`, plus the room total.
	async fn history(&self, room_id: &RoomId, page: PageRequest) -> anyhow::Result<(Vec<Message>, u64)>;

	/// Up to `limit` messages with `seq > after_seq`, ascending by `seq`.
	async fn changes_since(&self, after_seq: i64, limit: usize) -> anyhow::Result<Vec<Message>>;

	async fn count_since(&self, since_ms: i64) -> anyhow::Result<u64>;

	/// Highest `seq` written so far, `0` for an empty store.
	async fn latest_seq(&self) -> anyhow::Result<i64>;
}

#[derive(Default)]
pub struct MemoryMessageStore {
	inner: Mutex<MemoryMessages>,
}

#[derive(Default)]
struct MemoryMessages {
	next_seq: i64,
	messages: Vec<Message>,
}

impl MemoryMessageStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
	async fn append(&self, pending: PendingMessage) -> anyhow::Result<Message> {
		let mut inner = self.inner.lock().await;
		if inner.messages.iter().any(|m| m.id == pending.id) {
			return Err(anyhow!("message {} already exists", pending.id));
		}
		inner.next_seq += 1;
		let msg = pending.stored(inner.next_seq);
		inner.messages.push(msg.clone());
		Ok(msg)
	}

	async fn history(&self, room_id: &RoomId, page: PageRequest) -> anyhow::Result<(Vec<Message>, u64)> {
		let inner = self.inner.lock().await;
		let mut in_room: Vec<Message> = inner.messages.iter().filter(|m| &m.room_id == room_id).cloned().collect();
		in_room.sort_by_key(Message::order_key);
		let total = in_room.len() as u64;
		Ok((page.slice(&in_room), total))
	}

	async fn changes_since(&self, after_seq: i64, limit: usize) -> anyhow::Result<Vec<Message>> {
		let inner = self.inner.lock().await;
		Ok(inner
			.messages
			.iter()
			.filter(|m| m.seq > after_seq)
			.take(limit)
			.cloned()
			.collect())
	}

	async fn count_since(&self, since_ms: i64) -> anyhow::Result<u64> {
		let inner = self.inner.lock().await;
		Ok(inner.messages.iter().filter(|m| m.created_at >= since_ms).count() as u64)
	}

	async fn latest_seq(&self) -> anyhow::Result<i64> {
		Ok(self.inner.lock().await.next_seq)
	}
}

const MESSAGE_COLUMNS: &str =
	"seq, id, room_id, sender_id, sender_role, sender_name, sender_avatar, content, message_type, metadata, created_at";

type MessageRow = (
	i64,
	String,
	String,
	String,
	String,
	String,
	Option<String>,
	String,
	String,
	Option<String>,
	i64,
);

fn message_from_row(row: MessageRow) -> anyhow::Result<Message> {
	let (seq, id, room_id, sender_id, sender_role, sender_name, sender_avatar, content, kind, metadata, created_at) =
		row;

	Ok(Message {
		id: id.parse::<MessageId>().context("message id")?,
		seq,
		room_id: RoomId::new(room_id).context("message room_id")?,
		sender: SenderSnapshot {
			user_id: UserId::new(sender_id).context("message sender_id")?,
			role: sender_role.parse::<Role>().context("message sender_role")?,
			display_name: sender_name,
			avatar: sender_avatar,
		},
		content,
		kind: kind.parse::<MessageKind>().context("message type")?,
		metadata: metadata
			.as_deref()
			.map(serde_json::from_str)
			.transpose()
			.context("message metadata")?,
		created_at,
	})
}

fn messages_from_rows(rows: Vec<MessageRow>) -> anyhow::Result<Vec<Message>> {
	rows.into_iter().map(message_from_row).collect()
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

/// Message store on sqlite or postgres.
#[derive(Clone)]
pub struct SqlMessageStore {
	backend: SqlBackend,
}

impl SqlMessageStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = connect_sqlite(database_url).await?;
			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported messages database url (use sqlite: or postgres:)"))
		}
	}
}

#[async_trait]
impl MessageStore for SqlMessageStore {
	async fn append(&self, pending: PendingMessage) -> anyhow::Result<Message> {
		let metadata = pending
			.metadata
			.as_ref()
			.map(serde_json::to_string)
			.transpose()
			.context("encode message metadata")?;
		let id = pending.id.to_string();

		let (seq,): (i64,) = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"INSERT INTO messages (id, room_id, sender_id, sender_role, sender_name, sender_avatar, content, \
				message_type, metadata, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING seq",
			)
			.bind(&id)
			.bind(pending.room_id.as_str())
			.bind(pending.sender.user_id.as_str())
			.bind(pending.sender.role.as_str())
			.bind(&pending.sender.display_name)
			.bind(pending.sender.avatar.as_deref())
			.bind(&pending.content)
			.bind(pending.kind.as_str())
			.bind(metadata.as_deref())
			.bind(pending.created_at)
			.fetch_one(pool)
			.await
			.context("insert message (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"INSERT INTO messages (id, room_id, sender_id, sender_role, sender_name, sender_avatar, content, \
				message_type, metadata, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING seq",
			)
			.bind(&id)
			.bind(pending.room_id.as_str())
			.bind(pending.sender.user_id.as_str())
			.bind(pending.sender.role.as_str())
			.bind(&pending.sender.display_name)
			.bind(pending.sender.avatar.as_deref())
			.bind(&pending.content)
			.bind(pending.kind.as_str())
			.bind(metadata.as_deref())
			.bind(pending.created_at)
			.fetch_one(pool)
			.await
			.context("insert message (postgres)")?,
		};

		Ok(pending.stored(seq))
	}

	async fn history(&self, room_id: &RoomId, page: PageRequest) -> anyhow::Result<(Vec<Message>, u64)> {
		let limit = i64::from(page.limit);
		let offset = page.offset() as i64;

		let (total, rows): ((i64,), Vec<MessageRow>) = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let total = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE room_id = ?")
					.bind(room_id.as_str())
					.fetch_one(pool)
					.await
					.context("count messages (sqlite)")?;
				let rows = sqlx::query_as(&format!(
					"SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id = ? \
					ORDER BY created_at ASC, seq ASC LIMIT ? OFFSET ?"
				))
				.bind(room_id.as_str())
				.bind(limit)
				.bind(offset)
				.fetch_all(pool)
				.await
				.context("select messages (sqlite)")?;
				(total, rows)
			}
			SqlBackend::Postgres(pool) => {
				let total = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE room_id = $1")
					.bind(room_id.as_str())
					.fetch_one(pool)
					.await
					.context("count messages (postgres)")?;
				let rows = sqlx::query_as(&format!(
					"SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id = $1 \
					ORDER BY created_at ASC, seq ASC LIMIT $2 OFFSET $3"
				))
				.bind(room_id.as_str())
				.bind(limit)
				.bind(offset)
				.fetch_all(pool)
				.await
				.context("select messages (postgres)")?;
				(total, rows)
			}
		};

		Ok((messages_from_rows(rows)?, total.0.max(0) as u64))
	}

	async fn changes_since(&self, after_seq: i64, limit: usize) -> anyhow::Result<Vec<Message>> {
		let limit = i64::try_from(limit).unwrap_or(i64::MAX);
		let rows: Vec<MessageRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as(&format!(
					"SELECT {MESSAGE_COLUMNS} FROM messages WHERE seq > ? ORDER BY seq ASC LIMIT ?"
				))
				.bind(after_seq)
				.bind(limit)
				.fetch_all(pool)
				.await
				.context("select message changes (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as(&format!(
					"SELECT {MESSAGE_COLUMNS} FROM messages WHERE seq > $1 ORDER BY seq ASC LIMIT $2"
				))
				.bind(after_seq)
				.bind(limit)
				.fetch_all(pool)
				.await
				.context("select message changes (postgres)")?
			}
		};
		messages_from_rows(rows)
	}

	async fn count_since(&self, since_ms: i64) -> anyhow::Result<u64> {
		let (n,): (i64,) = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT COUNT(*) FROM messages WHERE created_at >= ?")
				.bind(since_ms)
				.fetch_one(pool)
				.await
				.context("count messages since (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as("SELECT COUNT(*) FROM messages WHERE created_at >= $1")
				.bind(since_ms)
				.fetch_one(pool)
				.await
				.context("count messages since (postgres)")?,
		};
		Ok(n.max(0) as u64)
	}

	async fn latest_seq(&self) -> anyhow::Result<i64> {
		let (seq,): (i64,) = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT COALESCE(MAX(seq), 0) FROM messages")
				.fetch_one(pool)
				.await
				.context("select latest seq (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as("SELECT COALESCE(MAX(seq), 0)::BIGINT FROM messages")
				.fetch_one(pool)
				.await
				.context("select latest seq (postgres)")?,
		};
		Ok(seq)
	}
}

/// Serializes sends to one room and remembers the room's latest creation time.
#[derive(Debug, Default)]
struct RoomSlot {
	last_created_at: Option<i64>,
}

/// Bounded memory of message ids already published to the hub.
#[derive(Debug)]
pub struct DeliveredSet {
	seen: HashSet<MessageId>,
	order: VecDeque<MessageId>,
	capacity: usize,
}

impl DeliveredSet {
	pub fn new(capacity: usize) -> Self {
		Self {
			seen: HashSet::new(),
			order: VecDeque::new(),
			capacity: capacity.max(1),
		}
	}

	/// `true` exactly once per id (while it is remembered).
	pub fn claim(&mut self, id: MessageId) -> bool {
		if !self.seen.insert(id) {
			return false;
		}
		self.order.push_back(id);
		while self.order.len() > self.capacity {
			if let Some(old) = self.order.pop_front() {
				self.seen.remove(&old);
			}
		}
		true
	}

	pub fn len(&self) -> usize {
		self.order.len()
	}

	pub fn is_empty(&self) -> bool {
		self.order.is_empty()
	}
}

/// The connection that sent a message; it gets the message as its reply.
#[derive(Debug, Clone)]
pub struct Origin {
	pub conn_id: ConnId,
	pub request_id: String,
}

/// Joins the message store to live delivery.
///
/// The send path publishes directly; the change feed catches up on anything
/// the send path did not publish (other writers, missed wakeups). Both claim
/// the message id first, so an append reaches the hub once.
#[derive(Clone)]
pub struct MessageBridge {
	store: Arc<dyn MessageStore>,
	rooms: RoomDirectory,
	hub: RoomHub,
	delivered: Arc<Mutex<DeliveredSet>>,
	room_slots: Arc<Mutex<HashMap<RoomId, Arc<Mutex<RoomSlot>>>>>,
	wake: Arc<Notify>,
	feed: FeedSettings,
	timeout: Duration,
}

impl MessageBridge {
	pub fn new(
		store: Arc<dyn MessageStore>,
		rooms: RoomDirectory,
		hub: RoomHub,
		feed: FeedSettings,
		timeout: Duration,
	) -> Self {
		Self {
			store,
			rooms,
			hub,
			delivered: Arc::new(Mutex::new(DeliveredSet::new(feed.dedupe_capacity))),
			room_slots: Arc::new(Mutex::new(HashMap::new())),
			wake: Arc::new(Notify::new()),
			feed,
			timeout,
		}
	}

	async fn room_slot(&self, room_id: &RoomId) -> Arc<Mutex<RoomSlot>> {
		let mut slots = self.room_slots.lock().await;
		Arc::clone(slots.entry(room_id.clone()).or_default())
	}

	/// Forget a slot nobody else is holding or waiting on.
	async fn release_slot(&self, room_id: &RoomId, slot: Arc<Mutex<RoomSlot>>) {
		let mut slots = self.room_slots.lock().await;
		if Arc::strong_count(&slot) == 2 {
			slots.remove(room_id);
		}
	}

	#[cfg(test)]
	pub(crate) async fn room_slot_count(&self) -> usize {
		self.room_slots.lock().await.len()
	}

	/// Creation time for the next message in a room: never behind the last one.
	async fn stamp(&self, room_id: &RoomId, slot: &mut RoomSlot) -> i64 {
		if slot.last_created_at.is_none() {
			slot.last_created_at = match self.rooms.get_room(room_id).await {
				Ok(room) => room.last_message_at,
				Err(e) => {
					debug!(room_id = %room_id, error = %e, "no room pointer to seed the message clock");
					None
				}
			};
		}
		let at = unix_ms_now().max(slot.last_created_at.unwrap_or(i64::MIN));
		slot.last_created_at = Some(at);
		at
	}

	/// Persist and publish one message.
	///
	/// With an `origin`, that connection receives the message as the reply to
	/// its request and everyone else in the room gets a broadcast. Access is
	/// the caller's responsibility.
	pub async fn append(
		&self,
		room_id: &RoomId,
		sender: &Principal,
		body: NewMessage,
		origin: Option<Origin>,
	) -> Result<Message, ChatError> {
		let slot = self.room_slot(room_id).await;
		let mut guard = slot.lock().await;

		let created_at = self.stamp(room_id, &mut guard).await;
		let pending = PendingMessage::new(room_id.clone(), sender.sender_snapshot(), body, created_at);
		let msg = match store_call("append message", self.timeout, self.store.append(pending)).await {
			Ok(msg) => msg,
			Err(e) => {
				drop(guard);
				self.release_slot(room_id, slot).await;
				return Err(e);
			}
		};
		self.delivered.lock().await.claim(msg.id);

		let event = convert::new_message_event(&msg);
		match &origin {
			Some(origin) => {
				self.hub.publish_room_except(room_id, origin.conn_id, event.clone()).await;
				self.hub
					.reply_to(
						origin.conn_id,
						HubItem::Reply {
							request_id: origin.request_id.clone(),
							event,
						},
						self.timeout,
					)
					.await;
			}
			None => {
				self.hub.publish_room(room_id, event).await;
			}
		}
		self.after_publish(&msg).await;
		drop(guard);
		self.release_slot(room_id, slot).await;

		debug!(room_id = %room_id, message_id = %msg.id, seq = msg.seq, sender = %sender.user_id, "message appended");
		metrics::counter!("helpdesk_server_messages_total", "path" => "send").increment(1);

		self.wake.notify_one();
		Ok(msg)
	}

	/// Move the room pointer forward and tell the room. The message is already
	/// stored, so failures here only leave the pointer stale.
	async fn after_publish(&self, msg: &Message) {
		match self.rooms.touch_last_message(&msg.room_id, msg.created_at).await {
			Ok(Some(at)) => {
				let event = convert::server_event(pb::server_event::Event::RoomUpdated(pb::RoomUpdated {
					room_id: msg.room_id.to_string(),
					last_message_at_unix_ms: at,
				}));
				self.hub.publish_room(&msg.room_id, event).await;
			}
			Ok(None) => {
				debug!(room_id = %msg.room_id, "message for unknown room; pointer not updated");
			}
			Err(e) => {
				warn!(room_id = %msg.room_id, message_id = %msg.id, error = %e, "failed to update lastMessageAt");
			}
		}
	}

	/// Ascending page of a room's messages. Access is the caller's responsibility.
	pub async fn history(&self, room_id: &RoomId, page: PageRequest) -> Result<Page<Message>, ChatError> {
		let (items, total) = store_call("message history", self.timeout, self.store.history(room_id, page)).await?;
		Ok(Page::new(items, page, total))
	}

	pub async fn count_since(&self, since_ms: i64) -> Result<u64, ChatError> {
		store_call("count messages", self.timeout, self.store.count_since(since_ms)).await
	}

	/// Start the single background change-feed task.
	pub fn spawn_change_feed(&self) -> JoinHandle<()> {
		let bridge = self.clone();
		tokio::spawn(async move { bridge.run_change_feed().await })
	}

	async fn run_change_feed(self) {
		let mut cursor: Option<i64> = None;
		let mut attempt: u32 = 0;

		info!(
			poll_interval_ms = self.feed.poll_interval.as_millis() as u64,
			lookback = self.feed.lookback,
			"message change feed started"
		);

		loop {
			let outcome = match cursor {
				None => self.feed_call("latest seq", self.store.latest_seq()).await.map(|seq| (seq, false)),
				Some(at) => self.poll_once(at).await,
			};

			match outcome {
				Ok((next, more)) => {
					if attempt > 0 {
						info!(attempt, "message change feed recovered");
					}
					attempt = 0;
					cursor = Some(next);
					if more {
						continue;
					}
					tokio::select! {
						_ = self.wake.notified() => {}
						_ = tokio::time::sleep(self.feed.poll_interval) => {}
					}
				}
				Err(err) => {
					let delay = backoff_delay(attempt, self.feed.backoff_min, self.feed.backoff_max);
					attempt = attempt.saturating_add(1);
					warn!(error = %err, attempt, delay_ms = delay.as_millis() as u64, "message change feed degraded; retrying");
					metrics::counter!("helpdesk_server_feed_degraded_total").increment(1);
					tokio::time::sleep(delay).await;
				}
			}
		}
	}

	async fn feed_call<T, F>(&self, op: &str, fut: F) -> Result<T, ChatError>
	where
		F: std::future::Future<Output = anyhow::Result<T>>,
	{
		match tokio::time::timeout(self.timeout, fut).await {
			Ok(Ok(v)) => Ok(v),
			Ok(Err(e)) => Err(ChatError::DeliveryDegraded(format!("{op}: {e:#}"))),
			Err(_) => Err(ChatError::DeliveryDegraded(format!("{op} timed out"))),
		}
	}

	/// Rescan from `cursor - lookback` and publish anything unclaimed.
	/// Returns the new cursor and whether a full batch suggests more is waiting.
	async fn poll_once(&self, cursor: i64) -> Result<(i64, bool), ChatError> {
		let lookback = self.feed.lookback.max(0);
		let from = cursor.saturating_sub(lookback).max(0);
		let limit = self.feed.batch_size.max(1) + lookback as usize;

		let batch = self.feed_call("changes since", self.store.changes_since(from, limit)).await?;
		let full = batch.len() >= limit;

		let mut next = cursor;
		for msg in batch {
			next = next.max(msg.seq);
			self.deliver_from_feed(msg).await;
		}

		Ok((next, full && next > cursor))
	}

	async fn deliver_from_feed(&self, msg: Message) {
		let slot = self.room_slot(&msg.room_id).await;
		let mut guard = slot.lock().await;
		let claimed = self.delivered.lock().await.claim(msg.id);
		if claimed {
			if let Some(last) = guard.last_created_at {
				guard.last_created_at = Some(last.max(msg.created_at));
			}
			let sent = self.hub.publish_room(&msg.room_id, convert::new_message_event(&msg)).await;
			self.after_publish(&msg).await;
			debug!(room_id = %msg.room_id, message_id = %msg.id, seq = msg.seq, sent, "change feed delivered message");
			metrics::counter!("helpdesk_server_messages_total", "path" => "feed").increment(1);
		}
		drop(guard);
		self.release_slot(&msg.room_id, slot).await;
	}
}
