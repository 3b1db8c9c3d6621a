#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use helpdesk_domain::{ChatError, Room, UserId};
use tracing::{debug, info, warn};

use crate::server::collaborators::StaffDirectory;
use crate::server::directory::RoomDirectory;

/// Greedy pick: the first candidate with no load, otherwise the first with the
/// smallest load. Candidates without an entry in `loads` count as zero.
pub fn pick_staff<'a>(candidates: &'a [UserId], loads: &HashMap<UserId, u64>) -> Option<&'a UserId> {
	let load = |id: &UserId| loads.get(id).copied().unwrap_or(0);

	if let Some(idle) = candidates.iter().find(|id| load(*id) == 0) {
		return Some(idle);
	}

	// `min_by_key` keeps the first of equal minima.
	candidates.iter().min_by_key(|id| load(*id))
}

/// Assigns freshly created rooms to the least loaded eligible staff member.
#[derive(Clone)]
pub struct AutoAssigner {
	staff: Arc<dyn StaffDirectory>,
	rooms: RoomDirectory,
	enabled: bool,
	timeout: Duration,
}

impl AutoAssigner {
	pub fn new(staff: Arc<dyn StaffDirectory>, rooms: RoomDirectory, enabled: bool, timeout: Duration) -> Self {
		Self {
			staff,
			rooms,
			enabled,
			timeout,
		}
	}

	/// The room after assignment, or `None` when it stays `open` (disabled,
	/// nobody eligible).
	pub async fn assign(&self, room: &Room) -> Result<Option<Room>, ChatError> {
		if !self.enabled {
			return Ok(None);
		}

		let staff = match tokio::time::timeout(self.timeout, self.staff.list_staff()).await {
			Ok(Ok(staff)) => staff,
			Ok(Err(e)) => {
				warn!(room_id = %room.id, error = %e, "staff listing failed; room stays open");
				return Err(ChatError::store(format!("list staff: {e}")));
			}
			Err(_) => {
				warn!(room_id = %room.id, "staff listing timed out; room stays open");
				return Err(ChatError::store("list staff timed out"));
			}
		};

		let candidates: Vec<UserId> = staff
			.into_iter()
			.filter(|s| s.is_assignable())
			.map(|s| s.user_id)
			.collect();
		if candidates.is_empty() {
			debug!(room_id = %room.id, "no eligible staff; room stays open");
			return Ok(None);
		}

		let loads = self.rooms.active_room_counts(&candidates).await?;
		let Some(chosen) = pick_staff(&candidates, &loads) else {
			return Ok(None);
		};

		let assigned = self.rooms.apply_assignment(&room.id, chosen).await?;
		info!(
			room_id = %room.id,
			staff_id = %chosen,
			load = loads.get(chosen).copied().unwrap_or(0),
			candidates = candidates.len(),
			"room auto-assigned"
		);
		metrics::counter!("helpdesk_server_rooms_auto_assigned_total").increment(1);
		Ok(Some(assigned))
	}
}
