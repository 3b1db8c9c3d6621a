#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use helpdesk_domain::{
	ChatError, Page, PageRequest, Principal, Priority, Role, Room, RoomCategory, RoomDraft, RoomId, RoomMetadata,
	RoomStatus, UserId,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::util::deadline::store_call;
use crate::util::time::unix_ms_now;

/// Which rooms a listing covers; one shape per role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomScope {
	All,
	AssignedTo(UserId),
	CreatedBy(UserId),
}

impl RoomScope {
	pub fn for_principal(principal: &Principal) -> Self {
		match principal.role {
			Role::Admin => RoomScope::All,
			Role::Staff => RoomScope::AssignedTo(principal.user_id.clone()),
			Role::User => RoomScope::CreatedBy(principal.user_id.clone()),
		}
	}

	fn matches(&self, room: &Room) -> bool {
		match self {
			RoomScope::All => true,
			RoomScope::AssignedTo(staff) => room.assigned_staff_id.as_ref() == Some(staff),
			RoomScope::CreatedBy(creator) => &room.creator_id == creator,
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomFilter {
	pub status: Option<RoomStatus>,
	pub category: Option<RoomCategory>,
}

impl RoomFilter {
	fn matches(&self, room: &Room) -> bool {
		self.status.is_none_or(|s| s == room.status) && self.category.is_none_or(|c| c == room.category)
	}
}

/// Most recent activity first; ties by newest room, then id.
fn sort_by_activity(rooms: &mut [Room]) {
	rooms.sort_by(|a, b| {
		b.activity_key()
			.cmp(&a.activity_key())
			.then(b.created_at.cmp(&a.created_at))
			.then(a.id.cmp(&b.id))
	});
}

/// Room persistence. Only active rooms are listed or mutated.
#[async_trait]
pub trait RoomStore: Send + Sync {
	async fn insert(&self, room: &Room) -> anyhow::Result<()>;

	/// Includes inactive rooms.
	async fn get(&self, id: &RoomId) -> anyhow::Result<Option<Room>>;

	/// Active rooms in `scope`, ordered by activity. `None` page means all.
	async fn list(
		&self,
		scope: &RoomScope,
		filter: &RoomFilter,
		page: Option<PageRequest>,
	) -> anyhow::Result<(Vec<Room>, u64)>;

	async fn assign(&self, id: &RoomId, staff_id: &UserId, at_ms: i64) -> anyhow::Result<Option<Room>>;

	async fn set_status(&self, id: &RoomId, status: RoomStatus, at_ms: i64) -> anyhow::Result<Option<Room>>;

	/// `last_message_at = max(old, at)`. Returns the resulting value.
	async fn touch_last_message(&self, id: &RoomId, at_ms: i64) -> anyhow::Result<Option<i64>>;

	async fn deactivate(&self, id: &RoomId, at_ms: i64) -> anyhow::Result<bool>;

	/// Active `open`/`assigned` rooms per assigned staff member.
	async fn active_room_counts(&self) -> anyhow::Result<HashMap<UserId, u64>>;

	async fn created_since(&self, since_ms: i64) -> anyhow::Result<Vec<Room>>;
}

#[derive(Default)]
pub struct MemoryRoomStore {
	rooms: Mutex<HashMap<RoomId, Room>>,
}

impl MemoryRoomStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl RoomStore for MemoryRoomStore {
	async fn insert(&self, room: &Room) -> anyhow::Result<()> {
		let mut rooms = self.rooms.lock().await;
		if rooms.contains_key(&room.id) {
			return Err(anyhow!("room {} already exists", room.id));
		}
		rooms.insert(room.id.clone(), room.clone());
		Ok(())
	}

	async fn get(&self, id: &RoomId) -> anyhow::Result<Option<Room>> {
		Ok(self.rooms.lock().await.get(id).cloned())
	}

	async fn list(
		&self,
		scope: &RoomScope,
		filter: &RoomFilter,
		page: Option<PageRequest>,
	) -> anyhow::Result<(Vec<Room>, u64)> {
		let mut matching: Vec<Room> = self
			.rooms
			.lock()
			.await
			.values()
			.filter(|r| r.is_active && scope.matches(r) && filter.matches(r))
			.cloned()
			.collect();
		sort_by_activity(&mut matching);

		let total = matching.len() as u64;
		let items = match page {
			Some(page) => page.slice(&matching),
			None => matching,
		};
		Ok((items, total))
	}

	async fn assign(&self, id: &RoomId, staff_id: &UserId, at_ms: i64) -> anyhow::Result<Option<Room>> {
		let mut rooms = self.rooms.lock().await;
		let Some(room) = rooms.get_mut(id).filter(|r| r.is_active) else {
			return Ok(None);
		};
		room.assigned_staff_id = Some(staff_id.clone());
		room.status = RoomStatus::Assigned;
		room.updated_at = at_ms;
		Ok(Some(room.clone()))
	}

	async fn set_status(&self, id: &RoomId, status: RoomStatus, at_ms: i64) -> anyhow::Result<Option<Room>> {
		let mut rooms = self.rooms.lock().await;
		let Some(room) = rooms.get_mut(id).filter(|r| r.is_active) else {
			return Ok(None);
		};
		room.status = status;
		room.updated_at = at_ms;
		Ok(Some(room.clone()))
	}

	async fn touch_last_message(&self, id: &RoomId, at_ms: i64) -> anyhow::Result<Option<i64>> {
		let mut rooms = self.rooms.lock().await;
		let Some(room) = rooms.get_mut(id) else {
			return Ok(None);
		};
		room.touch(at_ms);
		Ok(room.last_message_at)
	}

	async fn deactivate(&self, id: &RoomId, at_ms: i64) -> anyhow::Result<bool> {
		let mut rooms = self.rooms.lock().await;
		let Some(room) = rooms.get_mut(id).filter(|r| r.is_active) else {
			return Ok(false);
		};
		room.is_active = false;
		room.updated_at = at_ms;
		Ok(true)
	}

	async fn active_room_counts(&self) -> anyhow::Result<HashMap<UserId, u64>> {
		let mut counts = HashMap::new();
		for room in self.rooms.lock().await.values() {
			if !room.is_active || !room.status.counts_as_load() {
				continue;
			}
			if let Some(staff) = &room.assigned_staff_id {
				*counts.entry(staff.clone()).or_insert(0) += 1;
			}
		}
		Ok(counts)
	}

	async fn created_since(&self, since_ms: i64) -> anyhow::Result<Vec<Room>> {
		let rooms = self.rooms.lock().await;
		Ok(rooms.values().filter(|r| r.created_at >= since_ms).cloned().collect())
	}
}

const ROOM_COLUMNS: &str = "id, creator_id, assigned_staff_id, subject, category, status, priority, \
	last_message_at, is_active, metadata, created_at, updated_at";

const ORDER_BY_ACTIVITY: &str = "ORDER BY COALESCE(last_message_at, created_at) DESC, created_at DESC, id ASC";

type RoomRow = (
	String,
	String,
	Option<String>,
	String,
	String,
	String,
	String,
	Option<i64>,
	bool,
	String,
	i64,
	i64,
);

fn room_from_row(row: RoomRow) -> anyhow::Result<Room> {
	let (
		id,
		creator_id,
		assigned_staff_id,
		subject,
		category,
		status,
		priority,
		last_message_at,
		is_active,
		metadata,
		created_at,
		updated_at,
	) = row;

	Ok(Room {
		id: RoomId::new(id).context("room id")?,
		creator_id: UserId::new(creator_id).context("room creator_id")?,
		assigned_staff_id: assigned_staff_id
			.map(UserId::new)
			.transpose()
			.context("room assigned_staff_id")?,
		subject,
		category: category.parse().context("room category")?,
		status: status.parse().context("room status")?,
		priority: priority.parse::<Priority>().context("room priority")?,
		last_message_at,
		is_active,
		metadata: serde_json::from_str::<RoomMetadata>(&metadata).context("room metadata")?,
		created_at,
		updated_at,
	})
}

fn rooms_from_rows(rows: Vec<RoomRow>) -> anyhow::Result<Vec<Room>> {
	rows.into_iter().map(room_from_row).collect()
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

/// Room store on sqlite or postgres.
#[derive(Clone)]
pub struct SqlRoomStore {
	backend: SqlBackend,
}

impl SqlRoomStore {
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
			Err(anyhow!("unsupported rooms database url (use sqlite: or postgres:)"))
		}
	}

	async fn fetch(&self, id: &RoomId) -> anyhow::Result<Option<Room>> {
		let row: Option<RoomRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(&format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE id = ?"))
				.bind(id.as_str())
				.fetch_optional(pool)
				.await
				.context("select room (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(&format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE id = $1"))
				.bind(id.as_str())
				.fetch_optional(pool)
				.await
				.context("select room (postgres)")?,
		};
		row.map(room_from_row).transpose()
	}
}

/// In-memory sqlite databases are per connection, so those pools get one.
pub(crate) async fn connect_sqlite(database_url: &str) -> anyhow::Result<sqlx::SqlitePool> {
	let max_connections = if database_url.contains(":memory:") || database_url.contains("mode=memory") {
		1
	} else {
		8
	};
	let options: sqlx::sqlite::SqliteConnectOptions = database_url.parse().context("parse sqlite url")?;
	let pool = sqlx::sqlite::SqlitePoolOptions::new()
		.max_connections(max_connections)
		.connect_with(options.create_if_missing(true))
		.await
		.context("connect sqlite")?;
	sqlx::migrate!("migrations/sqlite")
		.run(&pool)
		.await
		.context("run sqlite migrations")?;
	Ok(pool)
}

#[async_trait]
impl RoomStore for SqlRoomStore {
	async fn insert(&self, room: &Room) -> anyhow::Result<()> {
		let metadata = serde_json::to_string(&room.metadata).context("encode room metadata")?;
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(&format!(
					"INSERT INTO rooms ({ROOM_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
				))
				.bind(room.id.as_str())
				.bind(room.creator_id.as_str())
				.bind(room.assigned_staff_id.as_ref().map(UserId::as_str))
				.bind(&room.subject)
				.bind(room.category.as_str())
				.bind(room.status.as_str())
				.bind(room.priority.as_str())
				.bind(room.last_message_at)
				.bind(room.is_active)
				.bind(&metadata)
				.bind(room.created_at)
				.bind(room.updated_at)
				.execute(pool)
				.await
				.context("insert room (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(&format!(
					"INSERT INTO rooms ({ROOM_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
				))
				.bind(room.id.as_str())
				.bind(room.creator_id.as_str())
				.bind(room.assigned_staff_id.as_ref().map(UserId::as_str))
				.bind(&room.subject)
				.bind(room.category.as_str())
				.bind(room.status.as_str())
				.bind(room.priority.as_str())
				.bind(room.last_message_at)
				.bind(room.is_active)
				.bind(&metadata)
				.bind(room.created_at)
				.bind(room.updated_at)
				.execute(pool)
				.await
				.context("insert room (postgres)")?;
			}
		}
		Ok(())
	}

	async fn get(&self, id: &RoomId) -> anyhow::Result<Option<Room>> {
		self.fetch(id).await
	}

	async fn list(
		&self,
		scope: &RoomScope,
		filter: &RoomFilter,
		page: Option<PageRequest>,
	) -> anyhow::Result<(Vec<Room>, u64)> {
		let (creator, staff) = match scope {
			RoomScope::All => (None, None),
			RoomScope::AssignedTo(staff) => (None, Some(staff.as_str())),
			RoomScope::CreatedBy(creator) => (Some(creator.as_str()), None),
		};
		let status = filter.status.map(RoomStatus::as_str);
		let category = filter.category.map(RoomCategory::as_str);
		let offset = page.map(|p| p.offset() as i64).unwrap_or(0);

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let filter_sql = "WHERE is_active \
					AND (? IS NULL OR creator_id = ?) \
					AND (? IS NULL OR assigned_staff_id = ?) \
					AND (? IS NULL OR status = ?) \
					AND (? IS NULL OR category = ?)";

				let (total,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM rooms {filter_sql}"))
					.bind(creator)
					.bind(creator)
					.bind(staff)
					.bind(staff)
					.bind(status)
					.bind(status)
					.bind(category)
					.bind(category)
					.fetch_one(pool)
					.await
					.context("count rooms (sqlite)")?;

				let rows: Vec<RoomRow> = sqlx::query_as(&format!(
					"SELECT {ROOM_COLUMNS} FROM rooms {filter_sql} {ORDER_BY_ACTIVITY} LIMIT ? OFFSET ?"
				))
				.bind(creator)
				.bind(creator)
				.bind(staff)
				.bind(staff)
				.bind(status)
				.bind(status)
				.bind(category)
				.bind(category)
				.bind(page.map(|p| i64::from(p.limit)).unwrap_or(-1))
				.bind(offset)
				.fetch_all(pool)
				.await
				.context("select rooms (sqlite)")?;

				Ok((rooms_from_rows(rows)?, total.max(0) as u64))
			}
			SqlBackend::Postgres(pool) => {
				let filter_sql = "WHERE is_active \
					AND ($1::text IS NULL OR creator_id = $1) \
					AND ($2::text IS NULL OR assigned_staff_id = $2) \
					AND ($3::text IS NULL OR status = $3) \
					AND ($4::text IS NULL OR category = $4)";

				let (total,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM rooms {filter_sql}"))
					.bind(creator)
					.bind(staff)
					.bind(status)
					.bind(category)
					.fetch_one(pool)
					.await
					.context("count rooms (postgres)")?;

				let rows: Vec<RoomRow> = sqlx::query_as(&format!(
					"SELECT {ROOM_COLUMNS} FROM rooms {filter_sql} {ORDER_BY_ACTIVITY} LIMIT $5 OFFSET $6"
				))
				.bind(creator)
				.bind(staff)
				.bind(status)
				.bind(category)
				.bind(page.map(|p| i64::from(p.limit)))
				.bind(offset)
				.fetch_all(pool)
				.await
				.context("select rooms (postgres)")?;

				Ok((rooms_from_rows(rows)?, total.max(0) as u64))
			}
		}
	}

	async fn assign(&self, id: &RoomId, staff_id: &UserId, at_ms: i64) -> anyhow::Result<Option<Room>> {
		let assigned = RoomStatus::Assigned.as_str();
		let updated = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query(
				"UPDATE rooms SET assigned_staff_id = ?, status = ?, updated_at = ? WHERE id = ? AND is_active",
			)
			.bind(staff_id.as_str())
			.bind(assigned)
			.bind(at_ms)
			.bind(id.as_str())
			.execute(pool)
			.await
			.context("assign room (sqlite)")?
			.rows_affected(),
			SqlBackend::Postgres(pool) => sqlx::query(
				"UPDATE rooms SET assigned_staff_id = $1, status = $2, updated_at = $3 WHERE id = $4 AND is_active",
			)
			.bind(staff_id.as_str())
			.bind(assigned)
			.bind(at_ms)
			.bind(id.as_str())
			.execute(pool)
			.await
			.context("assign room (postgres)")?
			.rows_affected(),
		};
		if updated == 0 {
			return Ok(None);
		}
		self.fetch(id).await
	}

	async fn set_status(&self, id: &RoomId, status: RoomStatus, at_ms: i64) -> anyhow::Result<Option<Room>> {
		let updated = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query("UPDATE rooms SET status = ?, updated_at = ? WHERE id = ? AND is_active")
				.bind(status.as_str())
				.bind(at_ms)
				.bind(id.as_str())
				.execute(pool)
				.await
				.context("update room status (sqlite)")?
				.rows_affected(),
			SqlBackend::Postgres(pool) => {
				sqlx::query("UPDATE rooms SET status = $1, updated_at = $2 WHERE id = $3 AND is_active")
					.bind(status.as_str())
					.bind(at_ms)
					.bind(id.as_str())
					.execute(pool)
					.await
					.context("update room status (postgres)")?
					.rows_affected()
			}
		};
		if updated == 0 {
			return Ok(None);
		}
		self.fetch(id).await
	}

	async fn touch_last_message(&self, id: &RoomId, at_ms: i64) -> anyhow::Result<Option<i64>> {
		let row: Option<(Option<i64>,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"UPDATE rooms SET last_message_at = MAX(COALESCE(last_message_at, ?), ?), \
				updated_at = MAX(updated_at, ?) WHERE id = ? RETURNING last_message_at",
			)
			.bind(at_ms)
			.bind(at_ms)
			.bind(at_ms)
			.bind(id.as_str())
			.fetch_optional(pool)
			.await
			.context("touch room (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"UPDATE rooms SET last_message_at = GREATEST(last_message_at, $1), \
				updated_at = GREATEST(updated_at, $1) WHERE id = $2 RETURNING last_message_at",
			)
			.bind(at_ms)
			.bind(id.as_str())
			.fetch_optional(pool)
			.await
			.context("touch room (postgres)")?,
		};
		Ok(row.and_then(|(at,)| at))
	}

	async fn deactivate(&self, id: &RoomId, at_ms: i64) -> anyhow::Result<bool> {
		let updated = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("UPDATE rooms SET is_active = ?, updated_at = ? WHERE id = ? AND is_active")
					.bind(false)
					.bind(at_ms)
					.bind(id.as_str())
					.execute(pool)
					.await
					.context("deactivate room (sqlite)")?
					.rows_affected()
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("UPDATE rooms SET is_active = FALSE, updated_at = $1 WHERE id = $2 AND is_active")
					.bind(at_ms)
					.bind(id.as_str())
					.execute(pool)
					.await
					.context("deactivate room (postgres)")?
					.rows_affected()
			}
		};
		Ok(updated > 0)
	}

	async fn active_room_counts(&self) -> anyhow::Result<HashMap<UserId, u64>> {
		let rows: Vec<(String, i64)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT assigned_staff_id, COUNT(*) FROM rooms \
				WHERE is_active AND assigned_staff_id IS NOT NULL AND status IN (?, ?) \
				GROUP BY assigned_staff_id",
			)
			.bind(RoomStatus::Open.as_str())
			.bind(RoomStatus::Assigned.as_str())
			.fetch_all(pool)
			.await
			.context("count staff load (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT assigned_staff_id, COUNT(*) FROM rooms \
				WHERE is_active AND assigned_staff_id IS NOT NULL AND status IN ($1, $2) \
				GROUP BY assigned_staff_id",
			)
			.bind(RoomStatus::Open.as_str())
			.bind(RoomStatus::Assigned.as_str())
			.fetch_all(pool)
			.await
			.context("count staff load (postgres)")?,
		};

		rows.into_iter()
			.map(|(staff, n)| -> anyhow::Result<(UserId, u64)> {
				Ok((UserId::new(staff).context("staff id")?, n.max(0) as u64))
			})
			.collect()
	}

	async fn created_since(&self, since_ms: i64) -> anyhow::Result<Vec<Room>> {
		let rows: Vec<RoomRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as(&format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE created_at >= ?"))
					.bind(since_ms)
					.fetch_all(pool)
					.await
					.context("select rooms since (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as(&format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE created_at >= $1"))
					.bind(since_ms)
					.fetch_all(pool)
					.await
					.context("select rooms since (postgres)")?
			}
		};
		rooms_from_rows(rows)
	}
}

/// Room counts over a trailing window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
	pub total_rooms: u64,
	pub by_status: BTreeMap<String, u64>,
	pub by_category: BTreeMap<String, u64>,
	pub by_priority: BTreeMap<String, u64>,
	pub unassigned_open: u64,
}

impl RoomStats {
	fn tally(rooms: &[Room]) -> Self {
		let mut stats = RoomStats {
			total_rooms: rooms.len() as u64,
			by_status: RoomStatus::ALL.iter().map(|s| (s.as_str().to_string(), 0)).collect(),
			by_category: RoomCategory::ALL.iter().map(|c| (c.as_str().to_string(), 0)).collect(),
			by_priority: Priority::ALL.iter().map(|p| (p.as_str().to_string(), 0)).collect(),
			unassigned_open: 0,
		};
		for room in rooms {
			*stats.by_status.entry(room.status.as_str().to_string()).or_insert(0) += 1;
			*stats.by_category.entry(room.category.as_str().to_string()).or_insert(0) += 1;
			*stats.by_priority.entry(room.priority.as_str().to_string()).or_insert(0) += 1;
			if room.status == RoomStatus::Open && room.assigned_staff_id.is_none() {
				stats.unassigned_open += 1;
			}
		}
		stats
	}
}

/// System of record for rooms: creation, role-scoped lookup, access checks
/// and state changes. Every store call is bounded by `timeout`.
#[derive(Clone)]
pub struct RoomDirectory {
	store: Arc<dyn RoomStore>,
	timeout: Duration,
}

impl RoomDirectory {
	pub fn new(store: Arc<dyn RoomStore>, timeout: Duration) -> Self {
		Self { store, timeout }
	}

	pub fn in_memory() -> Self {
		Self::new(Arc::new(MemoryRoomStore::new()), Duration::from_secs(5))
	}

	/// Open a new room for `creator`: status `open`, nobody assigned.
	pub async fn create_room(&self, creator: &Principal, draft: RoomDraft) -> Result<Room, ChatError> {
		let new_room = draft.validate()?;
		let room = Room::open(RoomId::generate(), creator.user_id.clone(), new_room, unix_ms_now());

		store_call("insert room", self.timeout, self.store.insert(&room)).await?;
		info!(room_id = %room.id, user_id = %creator.user_id, category = %room.category, "room created");
		metrics::counter!("helpdesk_server_rooms_created_total").increment(1);
		Ok(room)
	}

	/// Active room by id; inactive and missing rooms are both `NotFound`.
	pub async fn get_room(&self, room_id: &RoomId) -> Result<Room, ChatError> {
		store_call("get room", self.timeout, self.store.get(room_id))
			.await?
			.filter(|r| r.is_active)
			.ok_or_else(|| ChatError::NotFound(format!("room {room_id}")))
	}

	/// Every room `principal` may subscribe to.
	pub async fn find_rooms_for(&self, principal: &Principal) -> Result<Vec<Room>, ChatError> {
		let scope = RoomScope::for_principal(principal);
		let (rooms, _) = store_call(
			"find rooms",
			self.timeout,
			self.store.list(&scope, &RoomFilter::default(), None),
		)
		.await?;
		Ok(rooms)
	}

	pub async fn list_my_rooms(&self, principal: &Principal, page: PageRequest) -> Result<Page<Room>, ChatError> {
		self.list(RoomScope::CreatedBy(principal.user_id.clone()), RoomFilter::default(), page)
			.await
	}

	pub async fn list_assigned_rooms(&self, principal: &Principal, page: PageRequest) -> Result<Page<Room>, ChatError> {
		if principal.role == Role::User {
			return Err(ChatError::Forbidden("only staff have assigned rooms".to_string()));
		}
		self.list(RoomScope::AssignedTo(principal.user_id.clone()), RoomFilter::default(), page)
			.await
	}

	pub async fn list_all_rooms(
		&self,
		principal: &Principal,
		filter: RoomFilter,
		page: PageRequest,
	) -> Result<Page<Room>, ChatError> {
		if !principal.is_admin() {
			return Err(ChatError::Forbidden("listing all rooms requires admin".to_string()));
		}
		self.list(RoomScope::All, filter, page).await
	}

	async fn list(&self, scope: RoomScope, filter: RoomFilter, page: PageRequest) -> Result<Page<Room>, ChatError> {
		let (items, total) = store_call("list rooms", self.timeout, self.store.list(&scope, &filter, Some(page))).await?;
		Ok(Page::new(items, page, total))
	}

	/// Admin, creator, or assigned staff. `NotFound` if the room is gone.
	pub async fn check_access(&self, room_id: &RoomId, user_id: &UserId, role: Role) -> Result<bool, ChatError> {
		let room = self.get_room(room_id).await?;
		Ok(room.allows(user_id, role))
	}

	/// The room, if `principal` passes the access check; `Forbidden` otherwise.
	pub async fn authorize(&self, room_id: &RoomId, principal: &Principal) -> Result<Room, ChatError> {
		let room = self.get_room(room_id).await?;
		if !room.allows(&principal.user_id, principal.role) {
			debug!(room_id = %room_id, user_id = %principal.user_id, "room access denied");
			return Err(ChatError::Forbidden(format!("no access to room {room_id}")));
		}
		Ok(room)
	}

	/// Manual assignment; admin only.
	pub async fn assign_staff(&self, room_id: &RoomId, staff_id: &UserId, by: &Principal) -> Result<Room, ChatError> {
		if !by.is_admin() {
			return Err(ChatError::Forbidden("assigning staff requires admin".to_string()));
		}
		self.apply_assignment(room_id, staff_id).await
	}

	/// Set the assignee and move to `assigned`, without a role check.
	pub async fn apply_assignment(&self, room_id: &RoomId, staff_id: &UserId) -> Result<Room, ChatError> {
		let room = store_call(
			"assign room",
			self.timeout,
			self.store.assign(room_id, staff_id, unix_ms_now()),
		)
		.await?
		.ok_or_else(|| ChatError::NotFound(format!("room {room_id}")))?;
		info!(room_id = %room_id, staff_id = %staff_id, "room assigned");
		Ok(room)
	}

	/// Any status may follow any other; only the caller is checked.
	pub async fn update_status(&self, room_id: &RoomId, status: RoomStatus, by: &Principal) -> Result<Room, ChatError> {
		if by.role == Role::User {
			return Err(ChatError::Forbidden("only staff can change room status".to_string()));
		}
		let current = self.authorize(room_id, by).await?;
		let room = store_call(
			"update room status",
			self.timeout,
			self.store.set_status(room_id, status, unix_ms_now()),
		)
		.await?
		.ok_or_else(|| ChatError::NotFound(format!("room {room_id}")))?;
		info!(room_id = %room_id, from = %current.status, to = %status, by = %by.user_id, "room status updated");
		Ok(room)
	}

	/// Advance the room's `lastMessageAt`; returns the stored value.
	pub async fn touch_last_message(&self, room_id: &RoomId, at_ms: i64) -> Result<Option<i64>, ChatError> {
		store_call("touch room", self.timeout, self.store.touch_last_message(room_id, at_ms)).await
	}

	/// Soft-delete; admin only.
	pub async fn deactivate(&self, room_id: &RoomId, by: &Principal) -> Result<(), ChatError> {
		if !by.is_admin() {
			return Err(ChatError::Forbidden("deactivating rooms requires admin".to_string()));
		}
		let done = store_call(
			"deactivate room",
			self.timeout,
			self.store.deactivate(room_id, unix_ms_now()),
		)
		.await?;
		if !done {
			return Err(ChatError::NotFound(format!("room {room_id}")));
		}
		info!(room_id = %room_id, by = %by.user_id, "room deactivated");
		Ok(())
	}

	/// Load per staff member; staff with no rooms map to zero.
	pub async fn active_room_counts(&self, staff: &[UserId]) -> Result<HashMap<UserId, u64>, ChatError> {
		let all = store_call("count staff load", self.timeout, self.store.active_room_counts()).await?;
		Ok(staff
			.iter()
			.map(|id| (id.clone(), all.get(id).copied().unwrap_or(0)))
			.collect())
	}

	pub async fn room_stats(&self, since_ms: i64) -> Result<RoomStats, ChatError> {
		let rooms = store_call("room stats", self.timeout, self.store.created_since(since_ms)).await?;
		Ok(RoomStats::tally(&rooms))
	}
}
