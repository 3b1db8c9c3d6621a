#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use helpdesk_domain::{ChatError, PageRequest, Principal, Role, RoomCategory, RoomDraft, RoomStatus, UserId};

use crate::server::directory::{MemoryRoomStore, RoomDirectory, RoomFilter, SqlRoomStore};

fn principal(id: &str, role: Role) -> Principal {
	Principal::new(UserId::new(id).unwrap(), role, id.to_uppercase())
}

fn draft(subject: &str, category: &str) -> RoomDraft {
	RoomDraft {
		subject: subject.to_string(),
		category: category.to_string(),
		..RoomDraft::default()
	}
}

/// The same directory behaviour over each backend.
async fn directories() -> Vec<(&'static str, RoomDirectory)> {
	let sqlite = SqlRoomStore::connect("sqlite::memory:").await.unwrap();
	vec![
		(
			"memory",
			RoomDirectory::new(Arc::new(MemoryRoomStore::new()), Duration::from_secs(2)),
		),
		("sqlite", RoomDirectory::new(Arc::new(sqlite), Duration::from_secs(2))),
	]
}

#[tokio::test]
async fn created_rooms_are_open_and_unassigned() {
	for (backend, rooms) in directories().await {
		let user = principal("u1", Role::User);
		let room = rooms.create_room(&user, draft("Missing parcel", "order_support")).await.unwrap();

		assert_eq!(room.status, RoomStatus::Open, "{backend}");
		assert!(room.assigned_staff_id.is_none(), "{backend}");
		assert!(room.is_active, "{backend}");
		assert_eq!(rooms.get_room(&room.id).await.unwrap(), room, "{backend}");
	}
}

#[tokio::test]
async fn invalid_drafts_store_nothing() {
	for (backend, rooms) in directories().await {
		let user = principal("u1", Role::User);
		let err = rooms.create_room(&user, draft("", "billing")).await.unwrap_err();
		assert!(matches!(err, ChatError::Validation(ref f) if f.len() == 2), "{backend}: {err:?}");

		let mine = rooms.list_my_rooms(&user, PageRequest::default()).await.unwrap();
		assert_eq!(mine.info.total, 0, "{backend}");
	}
}

#[tokio::test]
async fn access_follows_creator_assignee_and_admin() {
	for (backend, rooms) in directories().await {
		let creator = principal("u1", Role::User);
		let staff = principal("s1", Role::Staff);
		let other_staff = principal("s2", Role::Staff);
		let admin = principal("a1", Role::Admin);
		let stranger = principal("u2", Role::User);

		let room = rooms.create_room(&creator, draft("Refund", "complaint")).await.unwrap();
		rooms.apply_assignment(&room.id, &staff.user_id).await.unwrap();

		for (who, expected) in [
			(&creator, true),
			(&staff, true),
			(&admin, true),
			(&other_staff, false),
			(&stranger, false),
		] {
			let allowed = rooms.check_access(&room.id, &who.user_id, who.role).await.unwrap();
			assert_eq!(allowed, expected, "{backend}: {}", who.user_id);
		}

		let err = rooms.authorize(&room.id, &stranger).await.unwrap_err();
		assert!(matches!(err, ChatError::Forbidden(_)), "{backend}");
	}
}

#[tokio::test]
async fn find_rooms_for_is_scoped_by_role() {
	for (backend, rooms) in directories().await {
		let u1 = principal("u1", Role::User);
		let u2 = principal("u2", Role::User);
		let staff = principal("s1", Role::Staff);
		let admin = principal("a1", Role::Admin);

		let a = rooms.create_room(&u1, draft("A", "general")).await.unwrap();
		let b = rooms.create_room(&u2, draft("B", "general")).await.unwrap();
		rooms.apply_assignment(&b.id, &staff.user_id).await.unwrap();

		let ids = |list: Vec<helpdesk_domain::Room>| list.into_iter().map(|r| r.id).collect::<Vec<_>>();
		assert_eq!(ids(rooms.find_rooms_for(&u1).await.unwrap()), vec![a.id.clone()], "{backend}");
		assert_eq!(ids(rooms.find_rooms_for(&staff).await.unwrap()), vec![b.id.clone()], "{backend}");
		assert_eq!(rooms.find_rooms_for(&admin).await.unwrap().len(), 2, "{backend}");
	}
}

#[tokio::test]
async fn role_gates_on_listings_and_mutations() {
	for (backend, rooms) in directories().await {
		let user = principal("u1", Role::User);
		let staff = principal("s1", Role::Staff);
		let admin = principal("a1", Role::Admin);
		let room = rooms.create_room(&user, draft("Login broken", "account_support")).await.unwrap();

		let forbidden = |r: Result<_, ChatError>| matches!(r, Err(ChatError::Forbidden(_)));
		assert!(forbidden(rooms.list_assigned_rooms(&user, PageRequest::default()).await.map(|_| ())), "{backend}");
		assert!(
			forbidden(rooms.list_all_rooms(&staff, RoomFilter::default(), PageRequest::default()).await.map(|_| ())),
			"{backend}"
		);
		assert!(forbidden(rooms.assign_staff(&room.id, &staff.user_id, &staff).await.map(|_| ())), "{backend}");
		assert!(forbidden(rooms.update_status(&room.id, RoomStatus::Closed, &user).await.map(|_| ())), "{backend}");
		assert!(forbidden(rooms.deactivate(&room.id, &staff).await), "{backend}");

		let assigned = rooms.assign_staff(&room.id, &staff.user_id, &admin).await.unwrap();
		assert_eq!(assigned.status, RoomStatus::Assigned, "{backend}");
		assert_eq!(assigned.assigned_staff_id.as_ref(), Some(&staff.user_id), "{backend}");

		let mine = rooms.list_assigned_rooms(&staff, PageRequest::default()).await.unwrap();
		assert_eq!(mine.items.len(), 1, "{backend}");
	}
}

#[tokio::test]
async fn any_status_may_follow_any_other() {
	for (backend, rooms) in directories().await {
		let user = principal("u1", Role::User);
		let admin = principal("a1", Role::Admin);
		let room = rooms.create_room(&user, draft("Question", "product_inquiry")).await.unwrap();

		for status in [RoomStatus::Resolved, RoomStatus::Closed, RoomStatus::Open] {
			let updated = rooms.update_status(&room.id, status, &admin).await.unwrap();
			assert_eq!(updated.status, status, "{backend}");
		}
	}
}

#[tokio::test]
async fn last_message_pointer_never_moves_back() {
	for (backend, rooms) in directories().await {
		let user = principal("u1", Role::User);
		let room = rooms.create_room(&user, draft("Tracking", "order_support")).await.unwrap();

		let later = room.created_at + 5_000;
		assert_eq!(rooms.touch_last_message(&room.id, later).await.unwrap(), Some(later), "{backend}");
		assert_eq!(
			rooms.touch_last_message(&room.id, later - 1_000).await.unwrap(),
			Some(later),
			"{backend}"
		);
		assert_eq!(rooms.get_room(&room.id).await.unwrap().last_message_at, Some(later), "{backend}");
	}
}

#[tokio::test]
async fn deactivated_rooms_disappear() {
	for (backend, rooms) in directories().await {
		let user = principal("u1", Role::User);
		let admin = principal("a1", Role::Admin);
		let room = rooms.create_room(&user, draft("Old", "general")).await.unwrap();

		rooms.deactivate(&room.id, &admin).await.unwrap();
		assert!(matches!(rooms.get_room(&room.id).await, Err(ChatError::NotFound(_))), "{backend}");
		assert!(rooms.find_rooms_for(&user).await.unwrap().is_empty(), "{backend}");
		assert!(
			matches!(rooms.deactivate(&room.id, &admin).await, Err(ChatError::NotFound(_))),
			"{backend}"
		);
	}
}

#[tokio::test]
async fn filters_and_pagination() {
	for (backend, rooms) in directories().await {
		let user = principal("u1", Role::User);
		let admin = principal("a1", Role::Admin);
		for i in 0..5 {
			let category = if i % 2 == 0 { "complaint" } else { "general" };
			rooms.create_room(&user, draft(&format!("Room {i}"), category)).await.unwrap();
		}

		let filter = RoomFilter {
			status: Some(RoomStatus::Open),
			category: Some(RoomCategory::Complaint),
		};
		let page = rooms.list_all_rooms(&admin, filter, PageRequest::default()).await.unwrap();
		assert_eq!(page.info.total, 3, "{backend}");

		let page = rooms
			.list_my_rooms(&user, PageRequest::new(Some(2), Some(2), 20))
			.await
			.unwrap();
		assert_eq!(page.items.len(), 2, "{backend}");
		assert_eq!(page.info.total_pages, 3, "{backend}");
		assert!(page.info.has_next && page.info.has_prev, "{backend}");
	}
}

#[tokio::test]
async fn staff_load_counts_only_active_work() {
	for (backend, rooms) in directories().await {
		let user = principal("u1", Role::User);
		let admin = principal("a1", Role::Admin);
		let s1 = UserId::new("s1").unwrap();
		let s2 = UserId::new("s2").unwrap();

		let a = rooms.create_room(&user, draft("A", "general")).await.unwrap();
		let b = rooms.create_room(&user, draft("B", "general")).await.unwrap();
		rooms.apply_assignment(&a.id, &s1).await.unwrap();
		rooms.apply_assignment(&b.id, &s1).await.unwrap();
		rooms.update_status(&b.id, RoomStatus::Resolved, &admin).await.unwrap();

		let loads = rooms.active_room_counts(&[s1.clone(), s2.clone()]).await.unwrap();
		assert_eq!(loads[&s1], 1, "{backend}");
		assert_eq!(loads[&s2], 0, "{backend}");

		let stats = rooms.room_stats(0).await.unwrap();
		assert_eq!(stats.total_rooms, 2, "{backend}");
		assert_eq!(stats.by_status["resolved"], 1, "{backend}");
		assert_eq!(stats.by_status["closed"], 0, "{backend}");
		assert_eq!(stats.unassigned_open, 0, "{backend}");
	}
}
