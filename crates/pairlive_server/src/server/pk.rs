#![forbid(unsafe_code)]

//! PK coordinator (spec.md §4.E): the state machine that coordinates two
//! independent anchors through offer, accept/reject, timeout, end, and
//! disconnect transitions while maintaining consistent, crash-safe joint
//! state across the `(roomA, roomB, userA, userB)` quadruple.
//!
//! Every operation is processed under exclusion scoped to "the two rooms
//! involved" (spec.md §4.E, §5) rather than a single global lock, grounded
//! on the teacher's `RoomHub`'s map-of-channels-behind-a-mutex shape.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pairlive_domain::{ErrorCode, PairKey, Room, RoomId, RoomStatus, UserId, UserStatus};
use pairlive_platform::RtcTokenMinter;
use pairlive_platform::rtc::RtcPermission;
use pairlive_protocol::framing::FrameType;
use pairlive_protocol::messages::{
	AnswerPkBody, EndPkBody, OnPkAnswerBody, OnPkEndBody, OnPkOfferBody, OnPkTimeoutBody, RpcResultBody, StartPkBody,
};
use tokio::sync::{Mutex, OwnedMutexGuard, oneshot};
use tracing::{info, warn};

use super::notifier::Notifier;
use super::rooms::{RoomService, RoomServiceError};

/// Exclusive access to one or two rooms, held for the lifetime of a single
/// state transition. Locks are always acquired in sorted `RoomId` order so
/// two operations that touch the same pair of rooms from either direction
/// cannot deadlock.
#[derive(Clone, Default)]
struct RoomLocks {
	inner: Arc<Mutex<HashMap<RoomId, Arc<Mutex<()>>>>>,
}

struct RoomLockGuard {
	_first: OwnedMutexGuard<()>,
	_second: Option<OwnedMutexGuard<()>>,
}

impl RoomLocks {
	async fn lock_for(&self, id: &RoomId) -> Arc<Mutex<()>> {
		let mut inner = self.inner.lock().await;
		inner.entry(id.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
	}

	async fn acquire_pair(&self, a: &RoomId, b: &RoomId) -> RoomLockGuard {
		if a == b {
			let lock = self.lock_for(a).await;
			return RoomLockGuard {
				_first: lock.lock_owned().await,
				_second: None,
			};
		}

		let (first_id, second_id) = if a.as_str() <= b.as_str() { (a, b) } else { (b, a) };
		let first = self.lock_for(first_id).await;
		let second = self.lock_for(second_id).await;
		RoomLockGuard {
			_first: first.lock_owned().await,
			_second: Some(second.lock_owned().await),
		}
	}
}

/// In-memory record of a pending PK proposal (spec.md §3's "PK offer").
struct PendingOffer {
	proposer_room: RoomId,
	receiver_room: RoomId,
	/// Sent when `answer-pk` resolves the offer, to cancel the deadline timer
	/// (spec.md §4.E.4, §4.E.8).
	cancel_timeout: oneshot::Sender<()>,
}

pub struct PkCoordinator {
	rooms: RoomService,
	notifier: Arc<Notifier>,
	rtc: Arc<dyn RtcTokenMinter>,
	room_locks: RoomLocks,
	offers: Mutex<HashMap<PairKey, PendingOffer>>,
	pk_request_timeout: Duration,
	rtc_room_token_ttl: Duration,
}

impl PkCoordinator {
	pub fn new(
		rooms: RoomService,
		notifier: Arc<Notifier>,
		rtc: Arc<dyn RtcTokenMinter>,
		pk_request_timeout: Duration,
		rtc_room_token_ttl: Duration,
	) -> Arc<Self> {
		Arc::new(Self {
			rooms,
			notifier,
			rtc,
			room_locks: RoomLocks::default(),
			offers: Mutex::new(HashMap::new()),
			pk_request_timeout,
			rtc_room_token_ttl,
		})
	}

	// ---- entry points (spec.md §4.E.1) ----

	pub async fn handle_start_pk(self: &Arc<Self>, sender: UserId, body: StartPkBody) -> RpcResultBody {
		match self.start_pk(sender, &body.pk_room_id).await {
			Ok(()) => RpcResultBody::ok(body.rpc_id),
			Err(code) => RpcResultBody::err(body.rpc_id, code.as_u32(), code_message(code)),
		}
	}

	pub async fn handle_answer_pk(&self, sender: UserId, body: AnswerPkBody) -> RpcResultBody {
		match self.answer_pk(sender, &body.req_room_id, body.accept).await {
			Ok(()) => RpcResultBody::ok(body.rpc_id),
			Err(code) => RpcResultBody::err(body.rpc_id, code.as_u32(), code_message(code)),
		}
	}

	pub async fn handle_end_pk(&self, sender: UserId, body: EndPkBody) -> RpcResultBody {
		match self.end_pk(sender, &body.pk_room_id).await {
			Ok(()) => RpcResultBody::ok(body.rpc_id),
			Err(code) => RpcResultBody::err(body.rpc_id, code.as_u32(), code_message(code)),
		}
	}

	/// Invoked by the connection pump when it observes the user offline
	/// (spec.md §4.C, §4.E.7). Never invoked on eviction.
	pub async fn handle_disconnect(&self, user: UserId) {
		let Ok(Some(active)) = self.rooms.get_active_user(&user).await else {
			return;
		};
		if !matches!(active.status, UserStatus::SingleLive | UserStatus::PkLive | UserStatus::PkWait) {
			return;
		}
		let Ok(Some(room)) = self.rooms.get_room_by_creator(&user).await else {
			return;
		};

		if let Some(peer_id) = room.pk_anchor.clone() {
			let pair_key = PairKey::new(user.clone(), peer_id.clone());
			let Ok(Some(peer_room)) = self.rooms.get_room_by_creator(&peer_id).await else {
				return;
			};
			let _guard = self.room_locks.acquire_pair(&room.id, &peer_room.id).await;

			if let Some(offer) = self.offers.lock().await.remove(&pair_key) {
				let _ = offer.cancel_timeout.send(());
			}

			let was_pk_live = active.status == UserStatus::PkLive;
			self.reset_room_and_creator_to_single(&peer_room).await;

			if was_pk_live
				&& let Ok(Some(peer_active)) = self.rooms.get_active_user(&peer_id).await
			{
				self.notifier
					.notify(
						&peer_id,
						FrameType::OnPkEnd,
						&OnPkEndBody {
							pk_room_id: room.id.as_str().to_string(),
						},
						peer_active.im_user.as_deref(),
					)
					.await
					.ok();
			}
		}

		info!(user = %user, room = %room.id, "disconnect: closing room");
		if let Err(e) = self.rooms.close_room(&user, &room.id).await {
			warn!(error = %e, "disconnect: failed to close room");
		}
	}

	// ---- start-pk (spec.md §4.E.3) ----

	async fn start_pk(self: &Arc<Self>, self_id: UserId, pk_room_id_raw: &str) -> Result<(), ErrorCode> {
		let other_room_id = RoomId::new(pk_room_id_raw.to_string()).map_err(|_| ErrorCode::InvalidParameter)?;

		let other_room = self
			.rooms
			.get_room_by_id(&other_room_id)
			.await
			.map_err(store_err)?
			.ok_or(ErrorCode::RoomNoExist)?;
		if other_room.status != RoomStatus::Single {
			return Err(ErrorCode::RoomInPk);
		}

		let self_room = self
			.rooms
			.get_room_by_creator(&self_id)
			.await
			.map_err(store_err)?
			.ok_or(ErrorCode::InvalidParameter)?;
		if self_room.status != RoomStatus::Single {
			return Err(ErrorCode::RoomInPk);
		}

		let other_creator = other_room.creator.clone();
		let self_account = self
			.rooms
			.get_account(&self_id)
			.await
			.map_err(store_err)?
			.ok_or(ErrorCode::InvalidParameter)?;
		self.rooms
			.get_account(&other_creator)
			.await
			.map_err(store_err)?
			.ok_or(ErrorCode::PlayerNoExist)?;
		self.rooms
			.get_active_user(&self_id)
			.await
			.map_err(store_err)?
			.ok_or(ErrorCode::InvalidParameter)?;
		let other_active = self
			.rooms
			.get_active_user(&other_creator)
			.await
			.map_err(store_err)?
			.ok_or(ErrorCode::PlayerNoExist)?;

		let _guard = self.room_locks.acquire_pair(&self_room.id, &other_room_id).await;

		// Re-read under lock: a concurrent `start-pk` targeting the same room
		// from a different proposer (scenario 4) must see the freshest status.
		let mut self_room = self
			.rooms
			.get_room_by_id(&self_room.id)
			.await
			.map_err(store_err)?
			.ok_or(ErrorCode::InvalidParameter)?;
		let mut other_room = self
			.rooms
			.get_room_by_id(&other_room_id)
			.await
			.map_err(store_err)?
			.ok_or(ErrorCode::RoomNoExist)?;
		if self_room.status != RoomStatus::Single || other_room.status != RoomStatus::Single {
			return Err(ErrorCode::RoomInPk);
		}

		self_room.status = RoomStatus::WaitPk;
		self_room.pk_anchor = Some(other_creator.clone());
		other_room.status = RoomStatus::WaitPk;
		other_room.pk_anchor = Some(self_id.clone());

		// rooms first, then users (spec.md §4.E.3 crash/partial-failure policy).
		if let Err(e) = self.rooms.update_room(&self_room).await {
			warn!(error = %e, "start-pk: self room update failed");
			return Err(ErrorCode::InvalidParameter);
		}
		if let Err(e) = self.rooms.update_room(&other_room).await {
			warn!(error = %e, "start-pk: other room update failed, reverting self room");
			self.revert_rooms_to_single(&[&self_room]).await;
			return Err(ErrorCode::InvalidParameter);
		}

		let mut self_active = self
			.rooms
			.get_active_user(&self_id)
			.await
			.map_err(store_err)?
			.ok_or(ErrorCode::InvalidParameter)?;
		self_active.status = UserStatus::PkWait;
		if let Err(e) = self.rooms.update_active_user(&self_active).await {
			warn!(error = %e, "start-pk: self active-user update failed, reverting rooms");
			self.revert_rooms_to_single(&[&self_room, &other_room]).await;
			return Err(ErrorCode::InvalidParameter);
		}

		let mut other_active = other_active;
		other_active.status = UserStatus::PkWait;
		if let Err(e) = self.rooms.update_active_user(&other_active).await {
			warn!(error = %e, "start-pk: other active-user update failed, reverting");
			self.revert_rooms_to_single(&[&self_room, &other_room]).await;
			self_active.status = UserStatus::SingleLive;
			self.rooms.update_active_user(&self_active).await.ok();
			return Err(ErrorCode::InvalidParameter);
		}

		let pair_key = PairKey::new(self_id.clone(), other_creator.clone());
		let (cancel_tx, cancel_rx) = oneshot::channel();
		self.offers.lock().await.insert(
			pair_key.clone(),
			PendingOffer {
				proposer_room: self_room.id.clone(),
				receiver_room: other_room.id.clone(),
				cancel_timeout: cancel_tx,
			},
		);
		Self::spawn_timeout(self, pair_key, cancel_rx);

		info!(proposer = %self_id, receiver = %other_creator, "start-pk: offer created");

		self.notifier
			.notify(
				&other_creator,
				FrameType::OnPkOffer,
				&OnPkOfferBody {
					from_user_id: self_id.into_string(),
					from_nickname: self_account.display_name,
					from_room_id: self_room.id.into_string(),
					from_room_name: self_room.display_name,
				},
				other_active.im_user.as_deref(),
			)
			.await
			.ok();

		Ok(())
	}

	fn spawn_timeout(coordinator: &Arc<Self>, pair_key: PairKey, cancel_rx: oneshot::Receiver<()>) {
		let this = Arc::clone(coordinator);
		let deadline = coordinator.pk_request_timeout;
		tokio::spawn(async move {
			tokio::select! {
				_ = tokio::time::sleep(deadline) => {
					this.fire_timeout(pair_key).await;
				}
				_ = cancel_rx => {
					// answer-pk already resolved the offer.
				}
			}
		});
	}

	// ---- offer timeout (spec.md §4.E.6) ----

	async fn fire_timeout(&self, pair_key: PairKey) {
		let Some(offer) = ({
			// Acquiring the per-room locks before touching the offer table
			// makes this mutually exclusive with a concurrent `answer-pk` on
			// the same pair (spec.md §4.E.8's race).
			let _guard = self.room_locks.acquire_pair(&offer_room_a(&pair_key, &self.offers).await, &offer_room_b(&pair_key, &self.offers).await).await;
			self.offers.lock().await.remove(&pair_key)
		}) else {
			return;
		};

		self.reset_side_if_waiting(&offer.proposer_room, &offer.receiver_room).await;
		self.reset_side_if_waiting(&offer.receiver_room, &offer.proposer_room).await;
	}

	/// Reset `room_id` to `single`/`singleLive` if it is still `waitPK`, and
	/// notify its creator with the peer's room id and user id. Conditional on
	/// observed state so a race with a late `answer-pk` does not double-reset.
	async fn reset_side_if_waiting(&self, room_id: &RoomId, peer_room_id: &RoomId) {
		let Ok(Some(mut room)) = self.rooms.get_room_by_id(room_id).await else {
			return;
		};
		if room.status != RoomStatus::WaitPk {
			return;
		}
		let creator = room.creator.clone();
		room.reset_to_single();
		if self.rooms.update_room(&room).await.is_err() {
			warn!(room = %room_id, "offer-timeout: failed to reset room");
			return;
		}

		let peer_creator = self.rooms.get_room_by_id(peer_room_id).await.ok().flatten().map(|r| r.creator);

		if let Ok(Some(mut active)) = self.rooms.get_active_user(&creator).await {
			active.status = UserStatus::SingleLive;
			self.rooms.update_active_user(&active).await.ok();
			self.notifier
				.notify(
					&creator,
					FrameType::OnPkTimeout,
					&OnPkTimeoutBody {
						pk_anchor_id: peer_creator.map(UserId::into_string).unwrap_or_default(),
						pk_room_id: peer_room_id.as_str().to_string(),
					},
					active.im_user.as_deref(),
				)
				.await
				.ok();
		}
	}

	// ---- answer-pk (spec.md §4.E.4) ----

	async fn answer_pk(&self, self_id: UserId, req_room_id_raw: &str, accept: bool) -> Result<(), ErrorCode> {
		let req_room_id = RoomId::new(req_room_id_raw.to_string()).map_err(|_| ErrorCode::InvalidParameter)?;

		let self_room = self
			.rooms
			.get_room_by_creator(&self_id)
			.await
			.map_err(store_err)?
			.ok_or(ErrorCode::InvalidParameter)?;

		let result = self.answer_pk_checked(&self_id, self_room.clone(), &req_room_id, accept).await;
		if result.is_err() {
			// spec.md §4.E.4: any failure after the initial self-room lookup
			// resets self's side; the proposer side is reset by its own timeout.
			self.reset_room_and_creator_to_single(&self_room).await;
		}
		result
	}

	async fn answer_pk_checked(&self, self_id: &UserId, self_room: Room, req_room_id: &RoomId, accept: bool) -> Result<(), ErrorCode> {
		if self_room.status != RoomStatus::WaitPk {
			return Err(ErrorCode::RoomNotInPk);
		}

		let req_room = self.rooms.get_room_by_id(req_room_id).await.map_err(store_err)?;
		let req_room = match req_room {
			Some(r) if r.status == RoomStatus::WaitPk => r,
			Some(_) => return Err(ErrorCode::RoomNotInPk),
			None => return Err(ErrorCode::RoomNoExist),
		};

		let proposer_id = req_room.creator.clone();
		self.rooms
			.get_account(&proposer_id)
			.await
			.map_err(store_err)?
			.ok_or(ErrorCode::PlayerNoExist)?;

		let _guard = self.room_locks.acquire_pair(&self_room.id, req_room_id).await;

		let self_room = self
			.rooms
			.get_room_by_id(&self_room.id)
			.await
			.map_err(store_err)?
			.ok_or(ErrorCode::InvalidParameter)?;
		let req_room = self
			.rooms
			.get_room_by_id(req_room_id)
			.await
			.map_err(store_err)?
			.ok_or(ErrorCode::RoomNoExist)?;
		if self_room.status != RoomStatus::WaitPk || req_room.status != RoomStatus::WaitPk {
			return Err(ErrorCode::RoomNotInPk);
		}

		let pair_key = PairKey::new(self_id.clone(), proposer_id.clone());

		if accept {
			self.accept_pk(self_id, &self_room, &req_room, &pair_key).await
		} else {
			self.reject_pk(self_id, &self_room, &req_room, &proposer_id, &pair_key).await
		}
	}

	async fn accept_pk(&self, self_id: &UserId, self_room: &Room, req_room: &Room, pair_key: &PairKey) -> Result<(), ErrorCode> {
		let proposer_id = req_room.creator.clone();

		let token = self
			.rtc
			.mint(&self_room.rtc_room, &proposer_id, RtcPermission::User, self.rtc_room_token_ttl)
			.await
			.map_err(|e| {
				warn!(error = %e, "answer-pk: rtc token mint failed");
				ErrorCode::InvalidParameter
			})?;

		// Past this point we are committed: cancel the timer so it cannot
		// race a half-applied transition (spec.md §4.E.8).
		if let Some(offer) = self.offers.lock().await.remove(pair_key) {
			let _ = offer.cancel_timeout.send(());
		}

		let mut self_room = self_room.clone();
		let mut req_room = req_room.clone();
		self_room.status = RoomStatus::Pk;
		self_room.pk_anchor = Some(proposer_id.clone());
		req_room.status = RoomStatus::Pk;
		req_room.pk_anchor = Some(self_id.clone());

		if let Err(e) = self.rooms.update_room(&self_room).await {
			warn!(error = %e, "answer-pk: self room update failed");
			return Err(ErrorCode::InvalidParameter);
		}
		if let Err(e) = self.rooms.update_room(&req_room).await {
			warn!(error = %e, "answer-pk: peer room update failed, reverting self room");
			self.revert_rooms_to_single(&[&self_room]).await;
			return Err(ErrorCode::InvalidParameter);
		}

		let mut self_active = self
			.rooms
			.get_active_user(self_id)
			.await
			.map_err(store_err)?
			.ok_or(ErrorCode::InvalidParameter)?;
		self_active.status = UserStatus::PkLive;
		self_active.room = Some(self_room.id.clone());
		if let Err(e) = self.rooms.update_active_user(&self_active).await {
			warn!(error = %e, "answer-pk: self active-user update failed, reverting pair");
			self.revert_rooms_to_single(&[&self_room, &req_room]).await;
			return Err(ErrorCode::InvalidParameter);
		}

		// Open question (§9): a reciprocal failure here is treated like any
		// other post-commit store failure — best-effort revert, then
		// `invalid-parameter`.
		let mut proposer_active = self
			.rooms
			.get_active_user(&proposer_id)
			.await
			.map_err(store_err)?
			.ok_or(ErrorCode::InvalidParameter)?;
		proposer_active.status = UserStatus::PkLive;
		proposer_active.room = Some(self_room.id.clone());
		if let Err(e) = self.rooms.update_active_user(&proposer_active).await {
			warn!(error = %e, "answer-pk: proposer active-user update failed, reverting");
			self.revert_rooms_to_single(&[&self_room, &req_room]).await;
			self_active.status = UserStatus::SingleLive;
			self_active.room = Some(self_room.id.clone());
			self.rooms.update_active_user(&self_active).await.ok();
			return Err(ErrorCode::InvalidParameter);
		}

		self.notifier
			.notify(
				&proposer_id,
				FrameType::OnPkAnswer,
				&OnPkAnswerBody {
					req_room_id: req_room.id.as_str().to_string(),
					accepted: true,
					rtc_room: Some(self_room.rtc_room.clone()),
					rtc_room_token: Some(token),
				},
				proposer_active.im_user.as_deref(),
			)
			.await
			.ok();

		Ok(())
	}

	async fn reject_pk(
		&self,
		self_id: &UserId,
		self_room: &Room,
		req_room: &Room,
		proposer_id: &UserId,
		pair_key: &PairKey,
	) -> Result<(), ErrorCode> {
		if let Some(offer) = self.offers.lock().await.remove(pair_key) {
			let _ = offer.cancel_timeout.send(());
		}

		self.notifier
			.notify(
				proposer_id,
				FrameType::OnPkAnswer,
				&OnPkAnswerBody {
					req_room_id: req_room.id.as_str().to_string(),
					accepted: false,
					rtc_room: None,
					rtc_room_token: None,
				},
				None,
			)
			.await
			.ok();

		self.revert_rooms_to_single(&[self_room, req_room]).await;

		if let Ok(Some(mut active)) = self.rooms.get_active_user(self_id).await {
			active.status = UserStatus::SingleLive;
			self.rooms.update_active_user(&active).await.ok();
		}
		if let Ok(Some(mut active)) = self.rooms.get_active_user(proposer_id).await {
			active.status = UserStatus::SingleLive;
			self.rooms.update_active_user(&active).await.ok();
		}

		Ok(())
	}

	// ---- end-pk (spec.md §4.E.5) ----

	async fn end_pk(&self, self_id: UserId, pk_room_id: &str) -> Result<(), ErrorCode> {
		let self_active = self
			.rooms
			.get_active_user(&self_id)
			.await
			.map_err(store_err)?
			.ok_or(ErrorCode::InvalidParameter)?;
		if self_active.status != UserStatus::PkLive {
			return Err(ErrorCode::RoomNotInPk);
		}

		let self_room = self
			.rooms
			.get_room_by_creator(&self_id)
			.await
			.map_err(store_err)?
			.ok_or(ErrorCode::InvalidParameter)?;
		let Some(pk_anchor) = self_room.pk_anchor.clone() else {
			return Err(ErrorCode::RoomNotInPk);
		};

		let peer_room_hint = self
			.rooms
			.get_room_by_creator(&pk_anchor)
			.await
			.map_err(store_err)?
			.ok_or(ErrorCode::InvalidParameter)?;
		let _guard = self.room_locks.acquire_pair(&self_room.id, &peer_room_hint.id).await;

		// Re-read under the pair lock (idempotence law, spec.md §8: a second
		// `end-pk` after the first completes returns `room-not-in-pk`).
		let self_room = self
			.rooms
			.get_room_by_id(&self_room.id)
			.await
			.map_err(store_err)?
			.ok_or(ErrorCode::InvalidParameter)?;
		if self_room.status != RoomStatus::Pk {
			return Err(ErrorCode::RoomNotInPk);
		}

		let peer_active = self
			.rooms
			.get_active_user(&pk_anchor)
			.await
			.map_err(store_err)?
			.ok_or(ErrorCode::InvalidParameter)?;
		let peer_room = self
			.rooms
			.get_room_by_creator(&pk_anchor)
			.await
			.map_err(store_err)?
			.ok_or(ErrorCode::InvalidParameter)?;
		if peer_room.status != RoomStatus::Pk {
			return Err(ErrorCode::RoomNotInPk);
		}

		if pk_room_id != self_room.id.as_str() && pk_room_id != peer_room.id.as_str() {
			return Err(ErrorCode::NoPermission);
		}

		self.notifier
			.notify(
				&pk_anchor,
				FrameType::OnPkEnd,
				&OnPkEndBody {
					pk_room_id: pk_room_id.to_string(),
				},
				peer_active.im_user.as_deref(),
			)
			.await
			.ok();

		// Open question (§9): track the last update failure but still attempt
		// every reset before surfacing it, rather than short-circuiting.
		let mut last_err: Option<RoomServiceError> = None;

		let mut self_room_reset = self_room.clone();
		self_room_reset.reset_to_single();
		if let Err(e) = self.rooms.update_room(&self_room_reset).await {
			last_err = Some(e);
		}
		let mut peer_room_reset = peer_room.clone();
		peer_room_reset.reset_to_single();
		if let Err(e) = self.rooms.update_room(&peer_room_reset).await {
			last_err = Some(e);
		}

		let mut self_active = self_active;
		self_active.status = UserStatus::SingleLive;
		self_active.room = Some(self_room.id.clone());
		if let Err(e) = self.rooms.update_active_user(&self_active).await {
			last_err = Some(e);
		}
		let mut peer_active = peer_active;
		peer_active.status = UserStatus::SingleLive;
		peer_active.room = Some(peer_room.id.clone());
		if let Err(e) = self.rooms.update_active_user(&peer_active).await {
			last_err = Some(e);
		}

		match last_err {
			Some(e) => {
				warn!(error = %e, "end-pk: partial update failure");
				Err(ErrorCode::InvalidParameter)
			}
			None => Ok(()),
		}
	}

	// ---- shared reset helpers ----

	async fn revert_rooms_to_single(&self, rooms: &[&Room]) {
		for room in rooms {
			let mut r = (*room).clone();
			r.reset_to_single();
			self.rooms.update_room(&r).await.ok();
		}
	}

	async fn reset_room_and_creator_to_single(&self, room: &Room) {
		let mut r = room.clone();
		r.reset_to_single();
		self.rooms.update_room(&r).await.ok();
		if let Ok(Some(mut active)) = self.rooms.get_active_user(&room.creator).await {
			active.status = UserStatus::SingleLive;
			self.rooms.update_active_user(&active).await.ok();
		}
	}
}

async fn offer_room_a(pair_key: &PairKey, offers: &Mutex<HashMap<PairKey, PendingOffer>>) -> RoomId {
	offers
		.lock()
		.await
		.get(pair_key)
		.map(|o| o.proposer_room.clone())
		.unwrap_or_else(|| RoomId::new_random())
}

async fn offer_room_b(pair_key: &PairKey, offers: &Mutex<HashMap<PairKey, PendingOffer>>) -> RoomId {
	offers
		.lock()
		.await
		.get(pair_key)
		.map(|o| o.receiver_room.clone())
		.unwrap_or_else(|| RoomId::new_random())
}

fn store_err(e: RoomServiceError) -> ErrorCode {
	warn!(error = %e, "store error mapped to invalid-parameter");
	ErrorCode::InvalidParameter
}

fn code_message(code: ErrorCode) -> &'static str {
	match code {
		ErrorCode::Ok => "",
		ErrorCode::UnknownMessage => "unknown message",
		ErrorCode::TokenInvalid => "token invalid",
		ErrorCode::NoPermission => "no permission",
		ErrorCode::RoomNoExist => "room does not exist",
		ErrorCode::RoomInPk => "room already in pk",
		ErrorCode::RoomNotInPk => "room not in pk",
		ErrorCode::PlayerNoExist => "player does not exist",
		ErrorCode::PlayerOffline => "player offline",
		ErrorCode::InvalidParameter => "invalid parameter",
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap as StdHashMap;
	use std::sync::Mutex as StdMutex;
	use std::time::Duration;

	use async_trait::async_trait;
	use pairlive_domain::{Account, ActiveUser, Gender};
	use pairlive_platform::StoreError;
	use pairlive_platform::im::ImNotifyError;
	use pairlive_platform::rtc::RtcTokenError;

	use super::*;
	use crate::server::notifier::Notifier;
	use crate::server::registry::SessionRegistry;

	#[derive(Default)]
	struct MemoryStore {
		accounts: StdMutex<StdHashMap<UserId, Account>>,
		users: StdMutex<StdHashMap<UserId, ActiveUser>>,
		rooms: StdMutex<StdHashMap<RoomId, Room>>,
	}

	#[async_trait]
	impl pairlive_platform::Store for MemoryStore {
		async fn get_account(&self, id: &UserId) -> Result<Option<Account>, StoreError> {
			Ok(self.accounts.lock().unwrap().get(id).cloned())
		}
		async fn upsert_account(&self, account: &Account) -> Result<(), StoreError> {
			self.accounts.lock().unwrap().insert(account.id.clone(), account.clone());
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

	struct FakeRtc;

	#[async_trait]
	impl RtcTokenMinter for FakeRtc {
		async fn mint(&self, _room: &str, _user: &UserId, _permission: RtcPermission, _ttl: Duration) -> Result<String, RtcTokenError> {
			Ok("fake-rtc-token".to_string())
		}
	}

	struct FailingIm;

	#[async_trait]
	impl pairlive_platform::ImNotifier for FailingIm {
		async fn send_frame(&self, _im_user: &str, _frame: &[u8]) -> Result<(), ImNotifyError> {
			Err(ImNotifyError::Provider(anyhow::anyhow!("no im in tests")))
		}
	}

	fn uid(s: &str) -> UserId {
		UserId::new(s).unwrap()
	}

	async fn setup() -> (Arc<PkCoordinator>, Arc<MemoryStore>, RoomService) {
		let store = Arc::new(MemoryStore::default());
		let rooms = RoomService::new(store.clone(), 20);
		let registry = SessionRegistry::new();
		let notifier = Arc::new(Notifier::new(registry, Arc::new(FailingIm)));
		let coordinator = PkCoordinator::new(rooms.clone(), notifier, Arc::new(FakeRtc), Duration::from_millis(50), Duration::from_secs(60));
		(coordinator, store, rooms)
	}

	async fn make_anchor(store: &MemoryStore, rooms: &RoomService, id: &str) -> Room {
		let user = uid(id);
		store
			.upsert_account(&Account {
				id: user.clone(),
				phone: String::new(),
				display_name: format!("anchor-{id}"),
				gender: Gender::Unknown,
				created_at_unix: 0,
				updated_at_unix: 0,
			})
			.await
			.unwrap();
		store.upsert_active_user(&ActiveUser::idle(user.clone(), "tok")).await.unwrap();
		rooms.create_room(user, format!("room-{id}")).await.unwrap()
	}

	#[tokio::test]
	async fn happy_path_pk_lifecycle() {
		let (coordinator, store, rooms) = setup().await;
		let ra = make_anchor(&store, &rooms, "a").await;
		let rb = make_anchor(&store, &rooms, "b").await;

		let start_res = coordinator
			.handle_start_pk(
				uid("a"),
				StartPkBody {
					pk_room_id: rb.id.as_str().to_string(),
					rpc_id: "1".to_string(),
				},
			)
			.await;
		assert_eq!(start_res.code, 0);

		let ra_after = rooms.get_room_by_id(&ra.id).await.unwrap().unwrap();
		let rb_after = rooms.get_room_by_id(&rb.id).await.unwrap().unwrap();
		assert_eq!(ra_after.status, RoomStatus::WaitPk);
		assert_eq!(rb_after.status, RoomStatus::WaitPk);

		let answer_res = coordinator
			.handle_answer_pk(
				uid("b"),
				AnswerPkBody {
					req_room_id: ra.id.as_str().to_string(),
					accept: true,
					rpc_id: "2".to_string(),
				},
			)
			.await;
		assert_eq!(answer_res.code, 0);

		let ra_after = rooms.get_room_by_id(&ra.id).await.unwrap().unwrap();
		let rb_after = rooms.get_room_by_id(&rb.id).await.unwrap().unwrap();
		assert_eq!(ra_after.status, RoomStatus::Pk);
		assert_eq!(rb_after.status, RoomStatus::Pk);
		assert_eq!(ra_after.pk_anchor, Some(uid("b")));
		assert_eq!(rb_after.pk_anchor, Some(uid("a")));

		let user_a = rooms.get_active_user(&uid("a")).await.unwrap().unwrap();
		let user_b = rooms.get_active_user(&uid("b")).await.unwrap().unwrap();
		assert_eq!(user_a.status, UserStatus::PkLive);
		assert_eq!(user_b.status, UserStatus::PkLive);
		assert_eq!(user_a.room, Some(rb.id.clone()));
		assert_eq!(user_b.room, Some(rb.id.clone()));

		let end_res = coordinator
			.handle_end_pk(
				uid("a"),
				EndPkBody {
					pk_room_id: ra.id.as_str().to_string(),
					rpc_id: "3".to_string(),
				},
			)
			.await;
		assert_eq!(end_res.code, 0);

		let ra_after = rooms.get_room_by_id(&ra.id).await.unwrap().unwrap();
		let rb_after = rooms.get_room_by_id(&rb.id).await.unwrap().unwrap();
		assert_eq!(ra_after.status, RoomStatus::Single);
		assert_eq!(rb_after.status, RoomStatus::Single);

		let second_end = coordinator
			.handle_end_pk(
				uid("a"),
				EndPkBody {
					pk_room_id: ra.id.as_str().to_string(),
					rpc_id: "4".to_string(),
				},
			)
			.await;
		assert_eq!(second_end.code, ErrorCode::RoomNotInPk.as_u32());
	}

	#[tokio::test]
	async fn reject_resets_both_sides_without_token() {
		let (coordinator, store, rooms) = setup().await;
		let ra = make_anchor(&store, &rooms, "a").await;
		let rb = make_anchor(&store, &rooms, "b").await;

		coordinator
			.handle_start_pk(
				uid("a"),
				StartPkBody {
					pk_room_id: rb.id.as_str().to_string(),
					rpc_id: "1".to_string(),
				},
			)
			.await;

		let answer_res = coordinator
			.handle_answer_pk(
				uid("b"),
				AnswerPkBody {
					req_room_id: ra.id.as_str().to_string(),
					accept: false,
					rpc_id: "2".to_string(),
				},
			)
			.await;
		assert_eq!(answer_res.code, 0);

		let ra_after = rooms.get_room_by_id(&ra.id).await.unwrap().unwrap();
		let rb_after = rooms.get_room_by_id(&rb.id).await.unwrap().unwrap();
		assert_eq!(ra_after.status, RoomStatus::Single);
		assert_eq!(rb_after.status, RoomStatus::Single);
		assert_eq!(rooms.get_active_user(&uid("a")).await.unwrap().unwrap().status, UserStatus::SingleLive);
		assert_eq!(rooms.get_active_user(&uid("b")).await.unwrap().unwrap().status, UserStatus::SingleLive);
	}

	#[tokio::test]
	async fn cross_request_conflict_is_rejected() {
		let (coordinator, store, rooms) = setup().await;
		make_anchor(&store, &rooms, "a").await;
		let rb = make_anchor(&store, &rooms, "b").await;
		let rc = make_anchor(&store, &rooms, "c").await;

		let start_a = coordinator
			.handle_start_pk(
				uid("a"),
				StartPkBody {
					pk_room_id: rb.id.as_str().to_string(),
					rpc_id: "1".to_string(),
				},
			)
			.await;
		assert_eq!(start_a.code, 0);

		let start_c = coordinator
			.handle_start_pk(
				uid("c"),
				StartPkBody {
					pk_room_id: rb.id.as_str().to_string(),
					rpc_id: "2".to_string(),
				},
			)
			.await;
		assert_eq!(start_c.code, ErrorCode::RoomInPk.as_u32());

		let rc_after = rooms.get_room_by_id(&rc.id).await.unwrap().unwrap();
		assert_eq!(rc_after.status, RoomStatus::Single);
	}

	#[tokio::test]
	async fn offer_times_out_and_resets_both_sides() {
		let (coordinator, store, rooms) = setup().await;
		let ra = make_anchor(&store, &rooms, "a").await;
		let rb = make_anchor(&store, &rooms, "b").await;

		coordinator
			.handle_start_pk(
				uid("a"),
				StartPkBody {
					pk_room_id: rb.id.as_str().to_string(),
					rpc_id: "1".to_string(),
				},
			)
			.await;

		tokio::time::sleep(Duration::from_millis(200)).await;

		let ra_after = rooms.get_room_by_id(&ra.id).await.unwrap().unwrap();
		let rb_after = rooms.get_room_by_id(&rb.id).await.unwrap().unwrap();
		assert_eq!(ra_after.status, RoomStatus::Single);
		assert_eq!(rb_after.status, RoomStatus::Single);

		let late_answer = coordinator
			.handle_answer_pk(
				uid("b"),
				AnswerPkBody {
					req_room_id: ra.id.as_str().to_string(),
					accept: true,
					rpc_id: "2".to_string(),
				},
			)
			.await;
		assert_eq!(late_answer.code, ErrorCode::RoomNotInPk.as_u32());
	}

	#[tokio::test]
	async fn proposer_disconnect_mid_offer_resets_receiver_without_pk_end() {
		let (coordinator, store, rooms) = setup().await;
		let ra = make_anchor(&store, &rooms, "a").await;
		let rb = make_anchor(&store, &rooms, "b").await;

		coordinator
			.handle_start_pk(
				uid("a"),
				StartPkBody {
					pk_room_id: rb.id.as_str().to_string(),
					rpc_id: "1".to_string(),
				},
			)
			.await;

		coordinator.handle_disconnect(uid("a")).await;

		assert!(rooms.get_room_by_id(&ra.id).await.unwrap().is_none());
		let rb_after = rooms.get_room_by_id(&rb.id).await.unwrap().unwrap();
		assert_eq!(rb_after.status, RoomStatus::Single);
		assert_eq!(rooms.get_active_user(&uid("b")).await.unwrap().unwrap().status, UserStatus::SingleLive);
	}
}
