#![forbid(unsafe_code)]

//! End-to-end PK pairing scenarios (spec.md §8 "Concrete scenarios"), driven
//! over real QUIC connections via `pairlive_client_core` against an
//! in-process server assembled from the same components `main.rs` wires up,
//! backed by an in-memory `Store` double.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use pairlive_client_core::{ClientConfig1, ClientCoreError, Session};
use pairlive_domain::{Account, ActiveUser, RoomId, UserId, UserStatus};
use pairlive_platform::auth::AuthError;
use pairlive_platform::im::ImNotifyError;
use pairlive_platform::rtc::{RtcPermission, RtcTokenError};
use pairlive_platform::{AuthResolver, ImNotifier, RtcTokenMinter, Store, StoreError};
use pairlive_protocol::framing::FrameType;
use pairlive_server::quic::config::QuicServerConfig;
use pairlive_server::server::connection::{ConnectionSettings, handle_connection};
use pairlive_server::server::notifier::Notifier;
use pairlive_server::server::pk::PkCoordinator;
use pairlive_server::server::registry::SessionRegistry;
use pairlive_server::server::rooms::RoomService;

#[derive(Default)]
struct MemoryStore {
	accounts: StdMutex<HashMap<UserId, Account>>,
	users: StdMutex<HashMap<UserId, ActiveUser>>,
	rooms: StdMutex<HashMap<RoomId, pairlive_domain::Room>>,
}

#[async_trait]
impl Store for MemoryStore {
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
	async fn get_room(&self, id: &RoomId) -> Result<Option<pairlive_domain::Room>, StoreError> {
		Ok(self.rooms.lock().unwrap().get(id).cloned())
	}
	async fn get_room_by_creator(&self, creator: &UserId) -> Result<Option<pairlive_domain::Room>, StoreError> {
		Ok(self.rooms.lock().unwrap().values().find(|r| &r.creator == creator).cloned())
	}
	async fn upsert_room(&self, room: &pairlive_domain::Room) -> Result<(), StoreError> {
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

/// Trivial resolver for tests: the auth token *is* the user id.
struct FixedAuthResolver;

#[async_trait]
impl AuthResolver for FixedAuthResolver {
	async fn resolve(&self, token: &str) -> Result<UserId, AuthError> {
		UserId::new(token).map_err(|e| AuthError::Invalid(e.to_string()))
	}
}

struct FakeRtc;

#[async_trait]
impl RtcTokenMinter for FakeRtc {
	async fn mint(&self, rtc_room: &str, user: &UserId, _permission: RtcPermission, _ttl: Duration) -> Result<String, RtcTokenError> {
		Ok(format!("rtc-token-{rtc_room}-{user}"))
	}
}

struct FailingIm;

#[async_trait]
impl ImNotifier for FailingIm {
	async fn send_frame(&self, _im_user: &str, _frame: &[u8]) -> Result<(), ImNotifyError> {
		Err(ImNotifyError::Provider(anyhow::anyhow!("no im configured in test")))
	}
}

struct TestServer {
	addr: SocketAddr,
	rooms: RoomService,
	store: Arc<MemoryStore>,
}

async fn spawn_server(pk_request_timeout: Duration) -> TestServer {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
	let quic_cfg = QuicServerConfig::dev(bind_addr);
	let (endpoint, _cert_der) = quic_cfg.bind_dev_endpoint().expect("bind dev endpoint");
	let addr = endpoint.local_addr().expect("local addr");

	let store = Arc::new(MemoryStore::default());
	let rooms = RoomService::new(store.clone() as Arc<dyn Store>, 20);
	let registry = SessionRegistry::new();
	let auth: Arc<dyn AuthResolver> = Arc::new(FixedAuthResolver);
	let im: Arc<dyn ImNotifier> = Arc::new(FailingIm);
	let notifier = Arc::new(Notifier::new(registry.clone(), im));
	let rtc: Arc<dyn RtcTokenMinter> = Arc::new(FakeRtc);
	let pk = PkCoordinator::new(rooms.clone(), notifier, rtc, pk_request_timeout, Duration::from_secs(60));

	let settings = ConnectionSettings {
		authorize_timeout: Duration::from_secs(5),
		ping_interval: Duration::from_millis(200),
		pong_timeout: Duration::from_secs(2),
		..ConnectionSettings::default()
	};

	let accept_rooms = rooms.clone();
	tokio::spawn(async move {
		let mut next_conn_id: u64 = 1;
		loop {
			let Some(connecting) = endpoint.accept().await else { break };
			let conn_id = next_conn_id;
			next_conn_id += 1;

			let rooms = accept_rooms.clone();
			let registry = registry.clone();
			let pk = Arc::clone(&pk);
			let auth = Arc::clone(&auth);
			let settings = settings.clone();

			tokio::spawn(async move {
				if let Ok(connection) = connecting.await {
					let _ = handle_connection(conn_id, connection, rooms, registry, pk, auth, settings).await;
				}
			});
		}
	});

	TestServer { addr, rooms, store }
}

async fn seed_room(server: &TestServer, user: &str, display_name: &str) -> RoomId {
	let id = UserId::new(user).unwrap();
	server
		.store
		.upsert_account(&Account {
			id: id.clone(),
			phone: format!("+1555{user}"),
			display_name: display_name.to_string(),
			gender: pairlive_domain::Gender::Unknown,
			created_at_unix: 0,
			updated_at_unix: 0,
		})
		.await
		.unwrap();
	server
		.rooms
		.update_active_user(&ActiveUser::idle(id.clone(), format!("tok-{user}")))
		.await
		.unwrap();
	let room = server.rooms.create_room(id, display_name.to_string()).await.unwrap();
	room.id
}

async fn connect(addr: SocketAddr, user: &str) -> Session {
	let cfg = ClientConfig1 {
		server_addr: Some(addr),
		auth_token: user.to_string(),
		connect_timeout: Duration::from_secs(5),
		..ClientConfig1::default()
	};
	let (session, auth_res) = tokio::time::timeout(Duration::from_secs(5), Session::connect(cfg))
		.await
		.expect("connect did not time out")
		.expect("connect succeeds");
	assert_eq!(auth_res.code, 0, "auth should be accepted: {}", auth_res.error);
	session
}

async fn next_push(session: &mut Session) -> pairlive_protocol::framing::RawFrame {
	tokio::time::timeout(Duration::from_secs(5), session.next_push())
		.await
		.expect("push frame arrives before timeout")
		.expect("push frame read succeeds")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn happy_path_pk_lifecycle() {
	let server = spawn_server(Duration::from_secs(10)).await;
	let ra = seed_room(&server, "a", "Room A").await;
	let rb = seed_room(&server, "b", "Room B").await;

	let mut a = connect(server.addr, "a").await;
	let mut b = connect(server.addr, "b").await;

	let res = a.start_pk(rb.as_str().to_string()).await.unwrap();
	assert_eq!(res.code, 0);

	let offer = next_push(&mut b).await;
	assert_eq!(offer.frame_type, FrameType::OnPkOffer);
	let offer_body: pairlive_protocol::messages::OnPkOfferBody = offer.parse_body().unwrap();
	assert_eq!(offer_body.from_user_id, "a");
	assert_eq!(offer_body.from_room_id, ra.as_str());

	let res = b.answer_pk(ra.as_str().to_string(), true).await.unwrap();
	assert_eq!(res.code, 0);

	let answer = next_push(&mut a).await;
	assert_eq!(answer.frame_type, FrameType::OnPkAnswer);
	let answer_body: pairlive_protocol::messages::OnPkAnswerBody = answer.parse_body().unwrap();
	assert!(answer_body.accepted);
	assert_eq!(answer_body.req_room_id, ra.as_str());
	assert_eq!(answer_body.rtc_room.as_deref(), Some(rb.as_str()));
	assert!(answer_body.rtc_room_token.as_deref().is_some_and(|t| !t.is_empty()));

	let room_a = server.rooms.get_room_by_id(&ra).await.unwrap().unwrap();
	let room_b = server.rooms.get_room_by_id(&rb).await.unwrap().unwrap();
	assert_eq!(room_a.status, pairlive_domain::RoomStatus::Pk);
	assert_eq!(room_b.status, pairlive_domain::RoomStatus::Pk);
	assert_eq!(room_a.pk_anchor.as_ref().unwrap().as_str(), "b");
	assert_eq!(room_b.pk_anchor.as_ref().unwrap().as_str(), "a");

	let active_a = server.rooms.get_active_user(&UserId::new("a").unwrap()).await.unwrap().unwrap();
	assert_eq!(active_a.status, UserStatus::PkLive);
	assert_eq!(active_a.room.as_ref(), Some(&rb));

	let res = a.end_pk(ra.as_str().to_string()).await.unwrap();
	assert_eq!(res.code, 0);

	let end = next_push(&mut b).await;
	assert_eq!(end.frame_type, FrameType::OnPkEnd);
	let end_body: pairlive_protocol::messages::OnPkEndBody = end.parse_body().unwrap();
	assert_eq!(end_body.pk_room_id, ra.as_str());

	let room_a = server.rooms.get_room_by_id(&ra).await.unwrap().unwrap();
	let room_b = server.rooms.get_room_by_id(&rb).await.unwrap().unwrap();
	assert_eq!(room_a.status, pairlive_domain::RoomStatus::Single);
	assert_eq!(room_b.status, pairlive_domain::RoomStatus::Single);

	let second_end = a.end_pk(ra.as_str().to_string()).await.unwrap();
	assert_eq!(second_end.code, pairlive_domain::ErrorCode::RoomNotInPk.as_u32());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reject_resets_both_sides_without_token() {
	let server = spawn_server(Duration::from_secs(10)).await;
	let ra = seed_room(&server, "a", "Room A").await;
	let rb = seed_room(&server, "b", "Room B").await;

	let mut a = connect(server.addr, "a").await;
	let mut b = connect(server.addr, "b").await;

	a.start_pk(rb.as_str().to_string()).await.unwrap();
	let _offer = next_push(&mut b).await;

	let res = b.answer_pk(ra.as_str().to_string(), false).await.unwrap();
	assert_eq!(res.code, 0);

	let answer = next_push(&mut a).await;
	let answer_body: pairlive_protocol::messages::OnPkAnswerBody = answer.parse_body().unwrap();
	assert!(!answer_body.accepted);
	assert!(answer_body.rtc_room_token.is_none());

	let room_a = server.rooms.get_room_by_id(&ra).await.unwrap().unwrap();
	let room_b = server.rooms.get_room_by_id(&rb).await.unwrap().unwrap();
	assert_eq!(room_a.status, pairlive_domain::RoomStatus::Single);
	assert_eq!(room_b.status, pairlive_domain::RoomStatus::Single);

	let active_a = server.rooms.get_active_user(&UserId::new("a").unwrap()).await.unwrap().unwrap();
	let active_b = server.rooms.get_active_user(&UserId::new("b").unwrap()).await.unwrap().unwrap();
	assert_eq!(active_a.status, UserStatus::SingleLive);
	assert_eq!(active_b.status, UserStatus::SingleLive);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn offer_times_out_and_resets_both_sides() {
	let server = spawn_server(Duration::from_millis(300)).await;
	let ra = seed_room(&server, "a", "Room A").await;
	let rb = seed_room(&server, "b", "Room B").await;

	let mut a = connect(server.addr, "a").await;
	let mut b = connect(server.addr, "b").await;

	a.start_pk(rb.as_str().to_string()).await.unwrap();
	let _offer = next_push(&mut b).await;

	let timeout_a = next_push(&mut a).await;
	assert_eq!(timeout_a.frame_type, FrameType::OnPkTimeout);
	let timeout_b = next_push(&mut b).await;
	assert_eq!(timeout_b.frame_type, FrameType::OnPkTimeout);

	let room_a = server.rooms.get_room_by_id(&ra).await.unwrap().unwrap();
	let room_b = server.rooms.get_room_by_id(&rb).await.unwrap().unwrap();
	assert_eq!(room_a.status, pairlive_domain::RoomStatus::Single);
	assert_eq!(room_b.status, pairlive_domain::RoomStatus::Single);

	let res = b.answer_pk(ra.as_str().to_string(), true).await.unwrap();
	assert_eq!(res.code, pairlive_domain::ErrorCode::RoomNotInPk.as_u32());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cross_request_conflict_is_rejected() {
	let server = spawn_server(Duration::from_secs(10)).await;
	let _ra = seed_room(&server, "a", "Room A").await;
	let rb = seed_room(&server, "b", "Room B").await;
	let _rc = seed_room(&server, "c", "Room C").await;

	let mut a = connect(server.addr, "a").await;
	let mut b = connect(server.addr, "b").await;
	let mut c = connect(server.addr, "c").await;

	a.start_pk(rb.as_str().to_string()).await.unwrap();
	let _offer = next_push(&mut b).await;

	let res = c.start_pk(rb.as_str().to_string()).await.unwrap();
	assert_eq!(res.code, pairlive_domain::ErrorCode::RoomInPk.as_u32());

	let room_b = server.rooms.get_room_by_id(&rb).await.unwrap().unwrap();
	assert_eq!(room_b.status, pairlive_domain::RoomStatus::WaitPk);
	let active_c = server.rooms.get_active_user(&UserId::new("c").unwrap()).await.unwrap().unwrap();
	assert_eq!(active_c.status, UserStatus::SingleLive);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn proposer_disconnect_mid_offer_resets_receiver_without_pk_end() {
	let server = spawn_server(Duration::from_secs(10)).await;
	let ra = seed_room(&server, "a", "Room A").await;
	let rb = seed_room(&server, "b", "Room B").await;

	let mut a = connect(server.addr, "a").await;
	let mut b = connect(server.addr, "b").await;

	a.start_pk(rb.as_str().to_string()).await.unwrap();
	let _offer = next_push(&mut b).await;

	a.close(0, "test: simulating transport loss");
	drop(a);

	tokio::time::sleep(Duration::from_secs(3)).await;

	let room_b = server.rooms.get_room_by_id(&rb).await.unwrap().unwrap();
	assert_eq!(room_b.status, pairlive_domain::RoomStatus::Single);
	assert!(server.rooms.get_room_by_id(&ra).await.unwrap().is_none(), "a's room should be closed");

	let active_b = server.rooms.get_active_user(&UserId::new("b").unwrap()).await.unwrap().unwrap();
	assert_eq!(active_b.status, UserStatus::SingleLive);

	let push = tokio::time::timeout(Duration::from_millis(500), b.next_push()).await;
	assert!(push.is_err(), "b should receive no on-pk-end for a pair that never reached pk");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn eviction_moves_delivery_to_the_newest_connection() {
	let server = spawn_server(Duration::from_secs(10)).await;
	let ra = seed_room(&server, "a", "Room A").await;
	let rb = seed_room(&server, "b", "Room B").await;

	let mut a_c1 = connect(server.addr, "a").await;
	let mut a_c2 = connect(server.addr, "a").await;
	let mut b = connect(server.addr, "b").await;

	let res = b.start_pk(ra.as_str().to_string()).await.unwrap();
	assert_eq!(res.code, 0);

	let offer = next_push(&mut a_c2).await;
	assert_eq!(offer.frame_type, FrameType::OnPkOffer);

	let stale_read = tokio::time::timeout(Duration::from_millis(500), a_c1.next_push()).await;
	match stale_read {
		Ok(Err(ClientCoreError::Protocol(_) | ClientCoreError::Io(_))) => {}
		other => panic!("evicted connection should observe its stream closed, got {other:?}"),
	}

	let _ = rb;
}
