#![forbid(unsafe_code)]

use std::time::Duration;

use helpdesk_domain::{ChatError, MessageDraft, PageRequest, Principal, Role, Room, RoomDraft, RoomStatus, UserId};
use helpdesk_protocol::pb::{self, server_event::Event};
use tokio::time::timeout;

use crate::server::collaborators::UserRecord;
use crate::server::room_hub::{HubItem, Registration};
use crate::server::service::StatsPeriod;
use crate::server::service::testing::{Harness, harness};

fn principal(id: &str, role: Role) -> Principal {
	Principal::new(UserId::new(id).unwrap(), role, id.to_uppercase())
}

fn draft(subject: &str) -> RoomDraft {
	RoomDraft {
		subject: subject.to_string(),
		category: "technical_support".to_string(),
		priority: Some("high".to_string()),
		..RoomDraft::default()
	}
}

async fn connect(h: &Harness, who: &Principal) -> Registration {
	let reg = h.hub.register(h.hub.allocate_conn_id(), who.clone()).await;
	h.service.on_connect(reg.conn_id, who).await;
	reg
}

/// Every event queued for `reg` until it is quiet.
async fn drain(reg: &mut Registration) -> Vec<pb::ServerEvent> {
	let mut out = Vec::new();
	while let Ok(Some(item)) = timeout(Duration::from_millis(100), reg.mailbox.recv()).await {
		match item {
			HubItem::Event(ev) => out.push((*ev).clone()),
			HubItem::Reply { event, .. } => out.push(event),
			_ => {}
		}
	}
	out
}

fn has(events: &[pb::ServerEvent], pred: impl Fn(&Event) -> bool) -> bool {
	events.iter().filter_map(|e| e.event.as_ref()).any(pred)
}

async fn staffed(h: &Harness, ids: &[&str]) {
	for id in ids {
		h.office
			.upsert_user(UserRecord::new(UserId::new(*id).unwrap(), Role::Staff, id.to_uppercase()))
			.await;
	}
}

async fn open_room(h: &Harness, creator: &Principal) -> Room {
	h.service.create_room(creator, draft("Cannot log in")).await.unwrap()
}

#[tokio::test]
async fn new_room_goes_to_least_loaded_staff_and_they_hear_about_it() {
	let h = harness();
	staffed(&h, &["s1", "s2"]).await;
	let s1 = principal("s1", Role::Staff);
	let s2 = principal("s2", Role::Staff);
	let customer = principal("u1", Role::User);
	let mut s2_conn = connect(&h, &s2).await;

	let first = open_room(&h, &customer).await;
	assert_eq!(first.assigned_staff_id.as_ref(), Some(&s1.user_id));
	assert_eq!(first.status, RoomStatus::Assigned);

	let second = open_room(&h, &customer).await;
	assert_eq!(second.assigned_staff_id.as_ref(), Some(&s2.user_id));

	let events = drain(&mut s2_conn).await;
	assert!(has(&events, |e| matches!(
		e,
		Event::RoomStatusUpdated(u) if u.room_id == second.id.to_string() && u.status == "assigned"
	)));

	let notes = h.office.notifications().await;
	assert_eq!(notes.len(), 2);
	assert_eq!(notes[1].recipient_id, s2.user_id);
	assert_eq!(notes[1].room_id.as_ref(), Some(&second.id));
}

#[tokio::test]
async fn rooms_stay_open_without_eligible_staff() {
	let h = harness();
	let mut blocked = UserRecord::new(UserId::new("s9").unwrap(), Role::Staff, "S9");
	blocked.is_blocked = true;
	h.office.upsert_user(blocked).await;

	let room = open_room(&h, &principal("u1", Role::User)).await;
	assert_eq!(room.status, RoomStatus::Open);
	assert!(room.assigned_staff_id.is_none());
	assert!(h.office.notifications().await.is_empty());
}

#[tokio::test]
async fn failed_notification_keeps_the_assignment() {
	let h = harness();
	staffed(&h, &["s1"]).await;
	h.office.set_fail_notifications(true).await;

	let room = open_room(&h, &principal("u1", Role::User)).await;
	assert_eq!(room.status, RoomStatus::Assigned);
	assert_eq!(
		h.service.rooms().get_room(&room.id).await.unwrap().assigned_staff_id,
		Some(UserId::new("s1").unwrap())
	);
}

#[tokio::test]
async fn forbidden_send_stores_and_broadcasts_nothing() {
	let h = harness();
	let owner = principal("u1", Role::User);
	let intruder = principal("u2", Role::User);
	let room = open_room(&h, &owner).await;

	let mut owner_conn = connect(&h, &owner).await;
	h.service.join_room(owner_conn.conn_id, &owner, &room.id).await.unwrap();
	drain(&mut owner_conn).await;

	let err = h
		.service
		.send_message(&intruder, &room.id, MessageDraft::text("let me in"), None)
		.await
		.unwrap_err();
	assert!(matches!(err, ChatError::Forbidden(_)));

	assert!(drain(&mut owner_conn).await.is_empty());
	let history = h.bridge.history(&room.id, PageRequest::default()).await.unwrap();
	assert_eq!(history.info.total, 0);
}

#[tokio::test]
async fn empty_message_is_a_validation_error() {
	let h = harness();
	let owner = principal("u1", Role::User);
	let room = open_room(&h, &owner).await;

	let err = h
		.service
		.send_message(&owner, &room.id, MessageDraft::text("   "), None)
		.await
		.unwrap_err();
	assert!(matches!(err, ChatError::Validation(ref f) if f[0].field == "content"));
}

#[tokio::test]
async fn customer_and_staff_talk_in_a_room() {
	let h = harness();
	staffed(&h, &["s1"]).await;
	let customer = principal("u1", Role::User);
	let staff = principal("s1", Role::Staff);

	let room = open_room(&h, &customer).await;

	let mut c = connect(&h, &customer).await;
	let mut s = connect(&h, &staff).await;

	let joined = h.service.join_user_rooms(s.conn_id, &staff).await.unwrap();
	let Some(Event::RoomsJoined(list)) = joined.event else {
		panic!("expected rooms_joined");
	};
	assert_eq!(list.count, 1);
	h.service.join_room(c.conn_id, &customer, &room.id).await.unwrap();
	drain(&mut c).await;
	assert!(has(&drain(&mut s).await, |e| matches!(e, Event::UserJoined(_))));

	let msg = h
		.service
		.send_message(&customer, &room.id, MessageDraft::text("my app crashes"), None)
		.await
		.unwrap();

	for conn in [&mut c, &mut s] {
		let events = drain(conn).await;
		assert!(has(&events, |e| matches!(
			e,
			Event::NewMessage(m) if m.message.as_ref().unwrap().id == msg.id.to_string()
		)));
	}

	let history = h.service.history(&staff, &room.id, PageRequest::default()).await.unwrap();
	assert_eq!(history.items.len(), 1);
	assert_eq!(history.items[0].sender.user_id, customer.user_id);
}

#[tokio::test]
async fn typing_requires_a_joined_room() {
	let h = harness();
	let owner = principal("u1", Role::User);
	let admin = principal("a1", Role::Admin);
	let room = open_room(&h, &owner).await;
	let mut owner_conn = connect(&h, &owner).await;
	let mut admin_conn = connect(&h, &admin).await;

	let err = h.service.typing(owner_conn.conn_id, &owner, &room.id, true).await.unwrap_err();
	assert!(matches!(err, ChatError::Forbidden(_)));

	h.service.join_room(owner_conn.conn_id, &owner, &room.id).await.unwrap();
	h.service.join_room(admin_conn.conn_id, &admin, &room.id).await.unwrap();
	drain(&mut owner_conn).await;
	drain(&mut admin_conn).await;

	h.service.typing(owner_conn.conn_id, &owner, &room.id, true).await.unwrap();
	assert!(has(&drain(&mut admin_conn).await, |e| matches!(e, Event::UserTyping(_))));

	// A message clears the sender's typing flag.
	h.service
		.send_message(
			&owner,
			&room.id,
			MessageDraft::text("done typing"),
			Some(crate::server::messages::Origin {
				conn_id: owner_conn.conn_id,
				request_id: "r1".to_string(),
			}),
		)
		.await
		.unwrap();
	assert!(has(&drain(&mut admin_conn).await, |e| matches!(e, Event::UserStoppedTyping(_))));
	assert!(drain(&mut owner_conn).await.iter().all(|e| !matches!(e.event, Some(Event::UserStoppedTyping(_)))));
}

#[tokio::test]
async fn every_typing_request_is_answered_but_only_changes_are_broadcast() {
	let h = harness();
	let owner = principal("u1", Role::User);
	let staff = principal("s1", Role::Staff);
	let room = open_room(&h, &owner).await;
	h.service.assign_staff(&principal("a1", Role::Admin), &room.id, &staff.user_id).await.unwrap();
	let mut owner_conn = connect(&h, &owner).await;
	let mut staff_conn = connect(&h, &staff).await;
	h.service.join_room(owner_conn.conn_id, &owner, &room.id).await.unwrap();
	h.service.join_room(staff_conn.conn_id, &staff, &room.id).await.unwrap();
	drain(&mut owner_conn).await;
	drain(&mut staff_conn).await;

	for _ in 0..2 {
		let reply = h.service.typing(owner_conn.conn_id, &owner, &room.id, true).await.unwrap();
		assert!(matches!(reply.event, Some(Event::UserTyping(ref t)) if t.room_id == room.id.to_string()));
	}
	let heard = drain(&mut staff_conn).await;
	assert_eq!(heard.iter().filter(|e| matches!(e.event, Some(Event::UserTyping(_)))).count(), 1);

	for _ in 0..2 {
		let reply = h.service.typing(owner_conn.conn_id, &owner, &room.id, false).await.unwrap();
		assert!(matches!(reply.event, Some(Event::UserStoppedTyping(ref t)) if t.user_id == "u1"));
	}
	let heard = drain(&mut staff_conn).await;
	assert_eq!(heard.iter().filter(|e| matches!(e.event, Some(Event::UserStoppedTyping(_)))).count(), 1);
	assert!(drain(&mut owner_conn).await.is_empty());
}

#[tokio::test]
async fn only_admins_block_and_blocking_kicks_connections() {
	let h = harness();
	let admin = principal("a1", Role::Admin);
	let staff = principal("s1", Role::Staff);
	let target = principal("u1", Role::User);
	h.office
		.upsert_user(UserRecord::new(target.user_id.clone(), Role::User, "U1"))
		.await;
	let conn = connect(&h, &target).await;

	assert!(matches!(
		h.service.block_user(&staff, &target.user_id).await,
		Err(ChatError::Forbidden(_))
	));
	assert!(matches!(
		h.service.block_user(&admin, &admin.user_id).await,
		Err(ChatError::Validation(_))
	));

	assert_eq!(h.service.block_user(&admin, &target.user_id).await.unwrap(), 1);
	timeout(Duration::from_millis(250), conn.kicked.notified())
		.await
		.expect("blocked connection is told to close");
}

#[tokio::test]
async fn status_updates_reach_the_room_and_exclude_customers() {
	let h = harness();
	staffed(&h, &["s1"]).await;
	let customer = principal("u1", Role::User);
	let staff = principal("s1", Role::Staff);
	let room = open_room(&h, &customer).await;

	let mut c = connect(&h, &customer).await;
	h.service.join_room(c.conn_id, &customer, &room.id).await.unwrap();
	drain(&mut c).await;

	assert!(matches!(
		h.service.update_status(&customer, &room.id, RoomStatus::Closed, None).await,
		Err(ChatError::Forbidden(_))
	));

	let (updated, _) = h
		.service
		.update_status(&staff, &room.id, RoomStatus::Resolved, None)
		.await
		.unwrap();
	assert_eq!(updated.status, RoomStatus::Resolved);
	assert!(has(&drain(&mut c).await, |e| matches!(
		e,
		Event::RoomStatusUpdated(u) if u.status == "resolved" && u.updated_by == "s1"
	)));

	// Closed rooms still accept messages.
	h.service
		.update_status(&staff, &room.id, RoomStatus::Closed, None)
		.await
		.unwrap();
	h.service
		.send_message(&customer, &room.id, MessageDraft::text("one more thing"), None)
		.await
		.unwrap();
}

#[tokio::test]
async fn stats_are_for_staff_and_admins() {
	let h = harness();
	let customer = principal("u1", Role::User);
	let room = open_room(&h, &customer).await;
	h.service
		.send_message(&customer, &room.id, MessageDraft::text("hello"), None)
		.await
		.unwrap();

	assert!(matches!(
		h.service.stats(&customer, StatsPeriod::Week).await,
		Err(ChatError::Forbidden(_))
	));

	let stats = h.service.stats(&principal("s1", Role::Staff), StatsPeriod::Month).await.unwrap();
	assert_eq!(stats.period_days, 30);
	assert_eq!(stats.total_messages, 1);
	assert_eq!(stats.rooms.total_rooms, 1);
	assert_eq!(stats.rooms.by_priority["high"], 1);
	assert_eq!(stats.rooms.by_category["technical_support"], 1);
	assert_eq!(stats.rooms.unassigned_open, 1);
}

#[test]
fn stats_period_parsing() {
	assert_eq!("".parse::<StatsPeriod>().unwrap(), StatsPeriod::Week);
	assert_eq!("30d".parse::<StatsPeriod>().unwrap(), StatsPeriod::Month);
	assert!("90d".parse::<StatsPeriod>().is_err());
}

#[tokio::test]
async fn deactivation_removes_subscribers() {
	let h = harness();
	let owner = principal("u1", Role::User);
	let admin = principal("a1", Role::Admin);
	let room = open_room(&h, &owner).await;
	let mut c = connect(&h, &owner).await;
	h.service.join_room(c.conn_id, &owner, &room.id).await.unwrap();
	drain(&mut c).await;

	assert!(matches!(
		h.service.deactivate_room(&owner, &room.id).await,
		Err(ChatError::Forbidden(_))
	));
	h.service.deactivate_room(&admin, &room.id).await.unwrap();

	assert!(has(&drain(&mut c).await, |e| matches!(e, Event::RoomLeft(l) if l.room_id == room.id.to_string())));
	assert_eq!(h.hub.room_subscriber_count(&room.id).await, 0);
	assert!(matches!(
		h.service.get_room(&owner, &room.id).await,
		Err(ChatError::NotFound(_))
	));
}

#[tokio::test]
async fn disconnect_tells_rooms_and_updates_presence() {
	let h = harness();
	let owner = principal("u1", Role::User);
	let admin = principal("a1", Role::Admin);
	let room = open_room(&h, &owner).await;

	let owner_conn = connect(&h, &owner).await;
	let mut admin_conn = connect(&h, &admin).await;
	h.service.join_room(owner_conn.conn_id, &owner, &room.id).await.unwrap();
	h.service.join_room(admin_conn.conn_id, &admin, &room.id).await.unwrap();
	drain(&mut admin_conn).await;

	h.service.on_disconnect(owner_conn.conn_id).await;

	let events = drain(&mut admin_conn).await;
	assert!(has(&events, |e| matches!(
		e,
		Event::UserLeft(l) if l.user.as_ref().unwrap().user_id == "u1"
	)));
	assert!(has(&events, |e| matches!(
		e,
		Event::UserStatusChanged(s) if s.user_id == "u1" && s.status == "offline"
	)));
	assert_eq!(h.hub.connection_count().await, 1);

	// A second disconnect for the same connection is a no-op.
	h.service.on_disconnect(owner_conn.conn_id).await;
	assert!(drain(&mut admin_conn).await.is_empty());
}

#[tokio::test]
async fn online_status_rejects_unknown_values() {
	let h = harness();
	let user = principal("u1", Role::User);
	let conn = connect(&h, &user).await;

	let event = h.service.update_online_status(conn.conn_id, &user, "away").await.unwrap();
	assert!(matches!(event.event, Some(Event::UserStatusChanged(ref s)) if s.status == "away"));
	assert!(matches!(
		h.service.update_online_status(conn.conn_id, &user, "sleeping").await,
		Err(ChatError::Validation(_))
	));
}

#[tokio::test]
async fn missing_order_scenario() {
	let h = harness();
	staffed(&h, &["s1"]).await;
	let customer = principal("u1", Role::User);
	let staff = principal("s1", Role::Staff);

	let room = h
		.service
		.create_room(
			&customer,
			RoomDraft {
				subject: "Order #123 missing item".to_string(),
				category: "order_support".to_string(),
				..RoomDraft::default()
			},
		)
		.await
		.unwrap();
	assert_eq!(room.assigned_staff_id.as_ref(), Some(&staff.user_id));

	let mut s = connect(&h, &staff).await;
	h.service.join_user_rooms(s.conn_id, &staff).await.unwrap();
	drain(&mut s).await;

	let before = h.service.history(&customer, &room.id, PageRequest::default()).await.unwrap();
	h.service
		.send_message(&customer, &room.id, MessageDraft::text("Where is my package?"), None)
		.await
		.unwrap();
	let after = h.service.history(&customer, &room.id, PageRequest::default()).await.unwrap();
	assert_eq!(after.items.len(), before.items.len() + 1);
	assert_eq!(after.items.last().unwrap().content, "Where is my package?");

	let received: Vec<_> = drain(&mut s)
		.await
		.into_iter()
		.filter_map(|e| match e.event {
			Some(Event::NewMessage(m)) => m.message,
			_ => None,
		})
		.collect();
	assert_eq!(received.len(), 1);
	assert_eq!(received[0].sender.as_ref().unwrap().display_name, "U1");

	h.service
		.update_status(&staff, &room.id, RoomStatus::Resolved, Some(s.conn_id))
		.await
		.unwrap();
	let rooms = h.service.rooms().find_rooms_for(&staff).await.unwrap();
	assert_eq!(rooms.len(), 1);
	assert_eq!(rooms[0].status, RoomStatus::Resolved);
}
