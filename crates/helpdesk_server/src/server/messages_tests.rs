#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use helpdesk_domain::{
	Message, MessageDraft, MessageId, PageRequest, PendingMessage, Principal, Role, Room, RoomDraft, RoomId, UserId,
};
use helpdesk_protocol::pb::{self, server_event};
use tokio::time::timeout;

use crate::config::FeedSettings;
use crate::server::directory::RoomDirectory;
use crate::server::messages::{DeliveredSet, MemoryMessageStore, MessageBridge, MessageStore, Origin};
use crate::server::room_hub::{HubItem, Registration, RoomHub, RoomHubConfig};
use crate::util::time::unix_ms_now;

fn principal(id: &str, role: Role) -> Principal {
	Principal::new(UserId::new(id).unwrap(), role, id.to_uppercase())
}

fn fast_feed() -> FeedSettings {
	FeedSettings {
		poll_interval: Duration::from_millis(10),
		backoff_min: Duration::from_millis(10),
		backoff_max: Duration::from_millis(50),
		..FeedSettings::default()
	}
}

struct Fixture {
	rooms: RoomDirectory,
	hub: RoomHub,
	bridge: MessageBridge,
	room: Room,
	customer: Principal,
}

async fn fixture(store: Arc<dyn MessageStore>, feed: FeedSettings) -> Fixture {
	fixture_with(store, feed, RoomHubConfig::default(), Duration::from_secs(2)).await
}

async fn fixture_with(store: Arc<dyn MessageStore>, feed: FeedSettings, hub: RoomHubConfig, wait: Duration) -> Fixture {
	let rooms = RoomDirectory::in_memory();
	let hub = RoomHub::new(hub);
	let bridge = MessageBridge::new(store, rooms.clone(), hub.clone(), feed, wait);
	let customer = principal("u1", Role::User);
	let room = rooms
		.create_room(
			&customer,
			RoomDraft {
				subject: "Where is my order".to_string(),
				category: "order_support".to_string(),
				..RoomDraft::default()
			},
		)
		.await
		.unwrap();
	Fixture {
		rooms,
		hub,
		bridge,
		room,
		customer,
	}
}

impl Fixture {
	async fn subscriber(&self, id: &str, role: Role) -> Registration {
		let reg = self.hub.register(self.hub.allocate_conn_id(), principal(id, role)).await;
		assert!(self.hub.join(reg.conn_id, &self.room.id).await);
		reg
	}

	async fn send(&self, text: &str, origin: Option<Origin>) -> Message {
		self.bridge
			.append(
				&self.room.id,
				&self.customer,
				MessageDraft::text(text).validate().unwrap(),
				origin,
			)
			.await
			.unwrap()
	}
}

fn pending(room_id: &RoomId, text: &str) -> PendingMessage {
	let sender = principal("backoffice", Role::Admin).sender_snapshot();
	PendingMessage::new(
		room_id.clone(),
		sender,
		MessageDraft::text(text).validate().unwrap(),
		unix_ms_now(),
	)
}

/// Message ids that reached `reg` before it went quiet for `idle`.
async fn delivered_ids(reg: &mut Registration, idle: Duration) -> Vec<String> {
	let mut ids = Vec::new();
	while let Ok(Some(item)) = timeout(idle, reg.mailbox.recv()).await {
		let event = match item {
			HubItem::Event(ev) => (*ev).clone(),
			HubItem::Reply { event, .. } => event,
			_ => continue,
		};
		if let Some(server_event::Event::NewMessage(m)) = event.event {
			ids.push(m.message.unwrap().id);
		}
	}
	ids
}

/// Fails the change-feed reads while `failing` is set.
struct FlakyStore {
	inner: MemoryMessageStore,
	failing: AtomicBool,
}

#[async_trait]
impl MessageStore for FlakyStore {
	async fn append(&self, pending: PendingMessage) -> anyhow::Result<Message> {
		self.inner.append(pending).await
	}

	async fn history(&self, room_id: &RoomId, page: PageRequest) -> anyhow::Result<(Vec<Message>, u64)> {
		self.inner.history(room_id, page).await
	}

	async fn changes_since(&self, after_seq: i64, limit: usize) -> anyhow::Result<Vec<Message>> {
		if self.failing.load(Ordering::SeqCst) {
			return Err(anyhow!("store unavailable"));
		}
		self.inner.changes_since(after_seq, limit).await
	}

	async fn count_since(&self, since_ms: i64) -> anyhow::Result<u64> {
		self.inner.count_since(since_ms).await
	}

	async fn latest_seq(&self) -> anyhow::Result<i64> {
		if self.failing.load(Ordering::SeqCst) {
			return Err(anyhow!("store unavailable"));
		}
		self.inner.latest_seq().await
	}
}

#[test]
fn delivered_set_claims_once_and_forgets_the_oldest() {
	let mut set = DeliveredSet::new(2);
	let (a, b, c) = (MessageId::new_v4(), MessageId::new_v4(), MessageId::new_v4());

	assert!(set.claim(a));
	assert!(!set.claim(a));
	assert!(set.claim(b));
	assert!(set.claim(c));
	assert_eq!(set.len(), 2);
	assert!(set.claim(a), "evicted ids can be claimed again");
}

#[tokio::test]
async fn history_is_ascending_and_paged() {
	let fx = fixture(Arc::new(MemoryMessageStore::new()), FeedSettings::default()).await;
	let sent: Vec<Message> = vec![fx.send("one", None).await, fx.send("two", None).await, fx.send("three", None).await];

	let first = fx.bridge.history(&fx.room.id, PageRequest::new(Some(1), Some(2), 50)).await.unwrap();
	assert_eq!(first.info.total, 3);
	assert!(first.info.has_next);
	let contents: Vec<&str> = first.items.iter().map(|m| m.content.as_str()).collect();
	assert_eq!(contents, ["one", "two"]);

	let second = fx.bridge.history(&fx.room.id, PageRequest::new(Some(2), Some(2), 50)).await.unwrap();
	assert_eq!(second.items.len(), 1);
	assert_eq!(second.items[0].id, sent[2].id);
	assert!(first.items[0].seq < first.items[1].seq);
}

#[tokio::test]
async fn sends_move_the_room_pointer() {
	let fx = fixture(Arc::new(MemoryMessageStore::new()), FeedSettings::default()).await;
	let mut watcher = fx.subscriber("s1", Role::Staff).await;

	let msg = fx.send("hello", None).await;

	let room = fx.rooms.get_room(&fx.room.id).await.unwrap();
	assert_eq!(room.last_message_at, Some(msg.created_at));

	let mut saw_update = false;
	while let Ok(Some(HubItem::Event(ev))) = timeout(Duration::from_millis(100), watcher.mailbox.recv()).await {
		if let Some(server_event::Event::RoomUpdated(u)) = &ev.event {
			assert_eq!(u.last_message_at_unix_ms, msg.created_at);
			saw_update = true;
		}
	}
	assert!(saw_update);
}

#[tokio::test]
async fn send_path_and_feed_deliver_each_message_once() {
	let fx = fixture(Arc::new(MemoryMessageStore::new()), fast_feed()).await;
	let feed = fx.bridge.spawn_change_feed();

	let mut subs = vec![
		fx.subscriber("u1", Role::User).await,
		fx.subscriber("s1", Role::Staff).await,
		fx.subscriber("a1", Role::Admin).await,
	];

	let mut expected = HashSet::new();
	for i in 0..5 {
		expected.insert(fx.send(&format!("msg {i}"), None).await.id.to_string());
	}

	for sub in &mut subs {
		let ids = delivered_ids(sub, Duration::from_millis(300)).await;
		assert_eq!(ids.len(), 5, "duplicates or gaps: {ids:?}");
		assert_eq!(ids.into_iter().collect::<HashSet<_>>(), expected);
	}
	feed.abort();
}

#[tokio::test]
async fn feed_picks_up_writes_from_other_writers() {
	let store = Arc::new(MemoryMessageStore::new());
	let fx = fixture(store.clone(), fast_feed()).await;
	let feed = fx.bridge.spawn_change_feed();
	let mut sub = fx.subscriber("s1", Role::Staff).await;

	let written = store.append(pending(&fx.room.id, "from the back office")).await.unwrap();

	let ids = delivered_ids(&mut sub, Duration::from_millis(500)).await;
	assert_eq!(ids, vec![written.id.to_string()]);
	assert_eq!(
		fx.rooms.get_room(&fx.room.id).await.unwrap().last_message_at,
		Some(written.created_at)
	);
	feed.abort();
}

#[tokio::test]
async fn feed_recovers_after_the_store_comes_back() {
	let store = Arc::new(FlakyStore {
		inner: MemoryMessageStore::new(),
		failing: AtomicBool::new(true),
	});
	let fx = fixture(store.clone(), fast_feed()).await;
	let feed = fx.bridge.spawn_change_feed();
	let mut sub = fx.subscriber("s1", Role::Staff).await;

	let written = store.inner.append(pending(&fx.room.id, "queued")).await.unwrap();
	assert!(delivered_ids(&mut sub, Duration::from_millis(150)).await.is_empty());

	store.failing.store(false, Ordering::SeqCst);
	let ids = delivered_ids(&mut sub, Duration::from_millis(1000)).await;
	assert_eq!(ids, vec![written.id.to_string()]);
	feed.abort();
}

#[tokio::test]
async fn sender_gets_a_reply_and_the_room_gets_a_broadcast() {
	let fx = fixture(Arc::new(MemoryMessageStore::new()), FeedSettings::default()).await;
	let mut sender = fx.subscriber("u1", Role::User).await;
	let mut other = fx.subscriber("s1", Role::Staff).await;

	let msg = fx
		.send(
			"hi",
			Some(Origin {
				conn_id: sender.conn_id,
				request_id: "req-9".to_string(),
			}),
		)
		.await;

	match timeout(Duration::from_millis(250), sender.mailbox.recv()).await.unwrap().unwrap() {
		HubItem::Reply { request_id, event } => {
			assert_eq!(request_id, "req-9");
			let Some(server_event::Event::NewMessage(m)) = event.event else {
				panic!("reply is not a message");
			};
			assert_eq!(m.message.unwrap().id, msg.id.to_string());
		}
		other => panic!("expected reply, got {other:?}"),
	}

	match timeout(Duration::from_millis(250), other.mailbox.recv()).await.unwrap().unwrap() {
		HubItem::Event(ev) => assert!(matches!(ev.event, Some(server_event::Event::NewMessage(_)))),
		other => panic!("expected broadcast, got {other:?}"),
	}

	// Exactly one copy each.
	assert!(delivered_ids(&mut sender, Duration::from_millis(100)).await.is_empty());
	assert!(delivered_ids(&mut other, Duration::from_millis(100)).await.is_empty());
}

fn small_mailboxes() -> RoomHubConfig {
	RoomHubConfig {
		mailbox_capacity: 1,
		..RoomHubConfig::default()
	}
}

fn origin(reg: &Registration, request_id: &str) -> Option<Origin> {
	Some(Origin {
		conn_id: reg.conn_id,
		request_id: request_id.to_string(),
	})
}

#[tokio::test]
async fn sender_reply_waits_for_room_in_a_full_mailbox() {
	let fx = fixture_with(
		Arc::new(MemoryMessageStore::new()),
		FeedSettings::default(),
		small_mailboxes(),
		Duration::from_secs(2),
	)
	.await;
	let mut sender = fx.subscriber("u1", Role::User).await;
	fx.hub.publish_all(None, pb::ServerEvent::default()).await;

	let bridge = fx.bridge.clone();
	let (room_id, customer) = (fx.room.id.clone(), fx.customer.clone());
	let send_origin = origin(&sender, "req-2");
	let send = tokio::spawn(async move {
		bridge
			.append(&room_id, &customer, MessageDraft::text("second").validate().unwrap(), send_origin)
			.await
	});

	tokio::time::sleep(Duration::from_millis(50)).await;
	assert!(matches!(sender.mailbox.recv().await, Some(HubItem::Event(_))));
	match timeout(Duration::from_millis(500), sender.mailbox.recv()).await.unwrap().unwrap() {
		HubItem::Reply { request_id, .. } => assert_eq!(request_id, "req-2"),
		other => panic!("expected the reply, got {other:?}"),
	}
	let msg = send.await.unwrap().unwrap();
	assert_eq!(msg.content, "second");
}

#[tokio::test]
async fn stuck_sender_is_closed_instead_of_losing_its_reply() {
	let fx = fixture_with(
		Arc::new(MemoryMessageStore::new()),
		FeedSettings::default(),
		small_mailboxes(),
		Duration::from_millis(100),
	)
	.await;
	let sender = fx.subscriber("u1", Role::User).await;
	fx.hub.publish_all(None, pb::ServerEvent::default()).await;

	let msg = fx.send("never acknowledged", origin(&sender, "req-3")).await;

	timeout(Duration::from_millis(250), sender.kicked.notified())
		.await
		.expect("connection is told to close");
	let history = fx.bridge.history(&fx.room.id, PageRequest::default()).await.unwrap();
	assert_eq!(history.items.last().map(|m| m.id), Some(msg.id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sends_arrive_in_history_order() {
	let fx = fixture(Arc::new(MemoryMessageStore::new()), fast_feed()).await;
	let feed = fx.bridge.spawn_change_feed();
	let mut subs = vec![
		fx.subscriber("u1", Role::User).await,
		fx.subscriber("s1", Role::Staff).await,
		fx.subscriber("a1", Role::Admin).await,
	];
	let sender_conn = subs[0].conn_id;

	let mut sends = Vec::new();
	for i in 0..24 {
		let bridge = fx.bridge.clone();
		let (room_id, customer) = (fx.room.id.clone(), fx.customer.clone());
		let send_origin = (i % 3 == 0).then(|| Origin {
			conn_id: sender_conn,
			request_id: format!("req-{i}"),
		});
		sends.push(tokio::spawn(async move {
			bridge
				.append(
					&room_id,
					&customer,
					MessageDraft::text(format!("msg {i}")).validate().unwrap(),
					send_origin,
				)
				.await
				.unwrap()
		}));
	}
	for send in sends {
		send.await.unwrap();
	}

	let history = fx
		.bridge
		.history(&fx.room.id, PageRequest::new(Some(1), Some(100), 50))
		.await
		.unwrap();
	assert_eq!(history.items.len(), 24);
	let in_order: Vec<String> = history.items.iter().map(|m| m.id.to_string()).collect();
	assert!(history.items.windows(2).all(|w| w[0].seq < w[1].seq));

	for sub in &mut subs {
		assert_eq!(delivered_ids(sub, Duration::from_millis(300)).await, in_order);
	}
	feed.abort();
}

#[tokio::test]
async fn creation_times_never_go_backwards_in_a_room() {
	let fx = fixture(Arc::new(MemoryMessageStore::new()), FeedSettings::default()).await;
	let future = unix_ms_now() + 60_000;
	fx.rooms.touch_last_message(&fx.room.id, future).await.unwrap();

	let first = fx.send("after a clock step", None).await;
	let second = fx.send("and again", None).await;
	assert_eq!(first.created_at, future);
	assert_eq!(second.created_at, future);

	let history = fx.bridge.history(&fx.room.id, PageRequest::default()).await.unwrap();
	let ids: Vec<MessageId> = history.items.iter().map(|m| m.id).collect();
	assert_eq!(ids, [first.id, second.id]);
}

#[tokio::test]
async fn idle_rooms_release_their_send_slot() {
	let fx = fixture(Arc::new(MemoryMessageStore::new()), FeedSettings::default()).await;
	fx.send("one", None).await;
	fx.send("two", None).await;
	assert_eq!(fx.bridge.room_slot_count().await, 0);
}
