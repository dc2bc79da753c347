#![forbid(unsafe_code)]

//! Room/user service (spec.md §4.G, §2.G): a thin facade over the `Store`
//! that applies the room and active-user invariants of spec.md §3.

use std::sync::Arc;

use pairlive_domain::{Account, ActiveUser, Room, RoomId, UserId, UserStatus};
use pairlive_platform::{Store, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RoomServiceError {
	#[error(transparent)]
	Store(#[from] StoreError),

	#[error("room not found")]
	RoomNotFound,

	#[error("creator already has a room")]
	CreatorAlreadyHasRoom,

	#[error("max rooms admission cap reached")]
	MaxRoomsExceeded,

	#[error("only the creator may close this room")]
	NotCreator,
}

/// Narrow surface the PK coordinator depends on (spec.md §4.G).
#[derive(Clone)]
pub struct RoomService {
	store: Arc<dyn Store>,
	max_rooms: u32,
}

impl RoomService {
	pub fn new(store: Arc<dyn Store>, max_rooms: u32) -> Self {
		Self { store, max_rooms }
	}

	pub async fn get_room_by_id(&self, id: &RoomId) -> Result<Option<Room>, RoomServiceError> {
		Ok(self.store.get_room(id).await?)
	}

	pub async fn get_room_by_creator(&self, creator: &UserId) -> Result<Option<Room>, RoomServiceError> {
		Ok(self.store.get_room_by_creator(creator).await?)
	}

	pub async fn update_room(&self, room: &Room) -> Result<(), RoomServiceError> {
		Ok(self.store.upsert_room(room).await?)
	}

	pub async fn get_account(&self, id: &UserId) -> Result<Option<Account>, RoomServiceError> {
		Ok(self.store.get_account(id).await?)
	}

	pub async fn get_active_user(&self, id: &UserId) -> Result<Option<ActiveUser>, RoomServiceError> {
		Ok(self.store.get_active_user(id).await?)
	}

	pub async fn update_active_user(&self, user: &ActiveUser) -> Result<(), RoomServiceError> {
		Ok(self.store.upsert_active_user(user).await?)
	}

	/// Create a room for `creator` (spec.md §3 invariant 4: at most one room per user;
	/// §6: `maxRooms` admission cap).
	pub async fn create_room(&self, creator: UserId, display_name: String) -> Result<Room, RoomServiceError> {
		if self.store.get_room_by_creator(&creator).await?.is_some() {
			return Err(RoomServiceError::CreatorAlreadyHasRoom);
		}
		if self.store.count_rooms().await? >= u64::from(self.max_rooms) {
			return Err(RoomServiceError::MaxRoomsExceeded);
		}

		let room = Room::new(RoomId::new_random(), creator.clone(), display_name);
		self.store.upsert_room(&room).await?;

		if let Some(mut user) = self.store.get_active_user(&creator).await? {
			user.status = UserStatus::SingleLive;
			user.room = Some(room.id.clone());
			self.store.upsert_active_user(&user).await?;
		}

		Ok(room)
	}

	/// Close `room_id`, authorized to its creator only; cascades to resetting
	/// every audience member's active-user to `idle` with empty `room`
	/// (spec.md §4.G).
	pub async fn close_room(&self, user: &UserId, room_id: &RoomId) -> Result<(), RoomServiceError> {
		let Some(room) = self.store.get_room(room_id).await? else {
			return Err(RoomServiceError::RoomNotFound);
		};
		if &room.creator != user {
			return Err(RoomServiceError::NotCreator);
		}

		for audience_id in &room.audience {
			if let Some(mut audience) = self.store.get_active_user(audience_id).await? {
				audience.status = UserStatus::Idle;
				audience.room = None;
				self.store.upsert_active_user(&audience).await?;
			}
		}

		self.store.delete_room(room_id).await?;
		self.store.delete_active_user(user).await.ok();
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;
	use std::sync::Mutex;

	use async_trait::async_trait;
	use pairlive_domain::Account;

	use super::*;

	#[derive(Default)]
	struct MemoryStore {
		rooms: Mutex<HashMap<RoomId, Room>>,
		users: Mutex<HashMap<UserId, ActiveUser>>,
	}

	#[async_trait]
	impl Store for MemoryStore {
		async fn get_account(&self, _id: &UserId) -> Result<Option<Account>, StoreError> {
			Ok(None)
		}
		async fn upsert_account(&self, _account: &Account) -> Result<(), StoreError> {
			Ok(())
		}
		async fn get_active_user(&self, id: &UserId) -> Result<Option<ActiveUser>, StoreError> {
			Ok(self.users.lock().unwrap().get(id).cloned())
		}
		async fn upsert_active_user(&self, user: &ActiveUser) -> Result<(), StoreError> {
			self.users.lock().unwrap().insert(user.id.clone(), user.clone());
			Ok(())
		}
		async fn delete_active_user(&self, id: &UserId) -> Result<(), StoreError> {
			self.users.lock().unwrap().remove(id);
			Ok(())
		}
		async fn get_room(&self, id: &RoomId) -> Result<Option<Room>, StoreError> {
			Ok(self.rooms.lock().unwrap().get(id).cloned())
		}
		async fn get_room_by_creator(&self, creator: &UserId) -> Result<Option<Room>, StoreError> {
			Ok(self.rooms.lock().unwrap().values().find(|r| &r.creator == creator).cloned())
		}
		async fn upsert_room(&self, room: &Room) -> Result<(), StoreError> {
			self.rooms.lock().unwrap().insert(room.id.clone(), room.clone());
			Ok(())
		}
		async fn delete_room(&self, id: &RoomId) -> Result<(), StoreError> {
			self.rooms.lock().unwrap().remove(id);
			Ok(())
		}
		async fn count_rooms(&self) -> Result<u64, StoreError> {
			Ok(self.rooms.lock().unwrap().len() as u64)
		}
	}

	fn user(id: &str) -> UserId {
		UserId::new(id).unwrap()
	}

	#[tokio::test]
	async fn creator_may_only_create_one_room() {
		let store = Arc::new(MemoryStore::default());
		store
			.upsert_active_user(&ActiveUser::idle(user("u1"), "tok"))
			.await
			.unwrap();
		let svc = RoomService::new(store, 20);

		svc.create_room(user("u1"), "Room 1".to_string()).await.unwrap();
		let err = svc.create_room(user("u1"), "Room 2".to_string()).await.unwrap_err();
		assert!(matches!(err, RoomServiceError::CreatorAlreadyHasRoom));
	}

	#[tokio::test]
	async fn max_rooms_cap_is_enforced() {
		let store = Arc::new(MemoryStore::default());
		let svc = RoomService::new(store, 1);

		svc.create_room(user("u1"), "Room 1".to_string()).await.unwrap();
		let err = svc.create_room(user("u2"), "Room 2".to_string()).await.unwrap_err();
		assert!(matches!(err, RoomServiceError::MaxRoomsExceeded));
	}

	#[tokio::test]
	async fn close_room_resets_audience_and_requires_creator() {
		let store = Arc::new(MemoryStore::default());
		store
			.upsert_active_user(&ActiveUser::idle(user("u1"), "tok"))
			.await
			.unwrap();
		let svc = RoomService::new(store.clone(), 20);
		let room = svc.create_room(user("u1"), "Room 1".to_string()).await.unwrap();

		let mut watcher = ActiveUser::idle(user("u2"), "tok2");
		watcher.status = UserStatus::Watching;
		watcher.room = Some(room.id.clone());
		store.upsert_active_user(&watcher).await.unwrap();
		{
			let mut rooms = store.rooms.lock().unwrap();
			rooms.get_mut(&room.id).unwrap().audience.push(user("u2"));
		}

		let err = svc.close_room(&user("u2"), &room.id).await.unwrap_err();
		assert!(matches!(err, RoomServiceError::NotCreator));

		svc.close_room(&user("u1"), &room.id).await.unwrap();
		assert!(svc.get_room_by_id(&room.id).await.unwrap().is_none());
		let watcher_after = svc.get_active_user(&user("u2")).await.unwrap().unwrap();
		assert_eq!(watcher_after.status, UserStatus::Idle);
		assert!(watcher_after.room.is_none());
	}
}
