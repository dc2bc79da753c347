#![forbid(unsafe_code)]

//! Connection pump (spec.md §4.C): drives one QUIC connection's single
//! bidirectional stream through `dialing → awaiting-auth → authorized →
//! closing → closed`.
//!
//! Grounded on the teacher's `handle_connection`: a reader task decoding
//! frames into a channel, a bounded outbound queue drained by a writer loop,
//! and a `CommandRateLimiter` gate in front of command dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use pairlive_domain::{ErrorCode, PairKey, RoomId, UserId, UserStatus};
use pairlive_platform::AuthResolver;
use pairlive_protocol::framing::{self, DEFAULT_MAX_FRAME_SIZE, FrameType, RawFrame, encode_frame_default};
use pairlive_protocol::messages::{AnswerPkBody, AuthBody, AuthResBody, EndPkBody, PingBody, RpcResultBody, StartPkBody};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::util::time::unix_ms_now;

use super::pk::PkCoordinator;
use super::registry::{ConnHandle, SessionRegistry};
use super::rooms::RoomService;

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,
	pub outbound_channel_capacity: usize,
	pub authorize_timeout: Duration,
	pub ping_interval: Duration,
	pub pong_timeout: Duration,
	pub command_rate_limit_per_conn_burst: u32,
	pub command_rate_limit_per_conn_per_minute: u32,
	pub command_rate_limit_per_pair_burst: u32,
	pub command_rate_limit_per_pair_per_minute: u32,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			outbound_channel_capacity: 64,
			authorize_timeout: Duration::from_millis(5000),
			ping_interval: Duration::from_secs(5),
			pong_timeout: Duration::from_secs(20),
			command_rate_limit_per_conn_burst: 20,
			command_rate_limit_per_conn_per_minute: 120,
			command_rate_limit_per_pair_burst: 5,
			command_rate_limit_per_pair_per_minute: 30,
		}
	}
}

#[derive(Debug, Clone)]
struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last: Instant,
}

impl TokenBucket {
	fn new(capacity: u32, refill_per_minute: u32) -> Option<Self> {
		if capacity == 0 || refill_per_minute == 0 {
			return None;
		}
		Some(Self {
			capacity: capacity as f64,
			tokens: capacity as f64,
			refill_per_sec: refill_per_minute as f64 / 60.0,
			last: Instant::now(),
		})
	}

	fn allow(&mut self) -> bool {
		let now = Instant::now();
		let elapsed = now.duration_since(self.last).as_secs_f64();
		if elapsed > 0.0 {
			self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
			self.last = now;
		}
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

/// Gates command frames at two scopes (spec.md §5): per connection, and per
/// proposer/receiver pair, to bound a single relationship's PK churn.
struct CommandRateLimiter {
	per_connection: Option<TokenBucket>,
	per_pair: HashMap<PairKey, TokenBucket>,
	per_pair_burst: u32,
	per_pair_per_minute: u32,
	max_pairs: usize,
}

impl CommandRateLimiter {
	fn new(settings: &ConnectionSettings) -> Self {
		Self {
			per_connection: TokenBucket::new(settings.command_rate_limit_per_conn_burst, settings.command_rate_limit_per_conn_per_minute),
			per_pair: HashMap::new(),
			per_pair_burst: settings.command_rate_limit_per_pair_burst,
			per_pair_per_minute: settings.command_rate_limit_per_pair_per_minute,
			max_pairs: 1024,
		}
	}

	fn allow_connection(&mut self) -> bool {
		match self.per_connection.as_mut() {
			Some(bucket) => bucket.allow(),
			None => true,
		}
	}

	fn allow_pair(&mut self, pair: &PairKey) -> bool {
		let Some(mut bucket) = TokenBucket::new(self.per_pair_burst, self.per_pair_per_minute) else {
			return true;
		};

		if self.per_pair.len() >= self.max_pairs {
			self.per_pair.clear();
		}

		let entry = self.per_pair.entry(pair.clone()).or_insert_with(|| {
			bucket.tokens = bucket.capacity;
			bucket
		});
		entry.allow()
	}
}

/// Reads newline-delimited frames off `recv` into `tx`, stopping at EOF, a
/// read error, or a frame exceeding `max_frame_bytes`.
async fn read_frames(mut recv: quinn::RecvStream, tx: mpsc::Sender<RawFrame>, max_frame_bytes: usize) {
	let mut buf = BytesMut::with_capacity(4096);
	let mut chunk = vec![0u8; 16 * 1024];

	loop {
		match framing::try_decode_frame_from_buffer(&mut buf, max_frame_bytes) {
			Ok(Some(frame)) => {
				if tx.send(frame).await.is_err() {
					return;
				}
				continue;
			}
			Ok(None) => {}
			Err(e) => {
				debug!(error = %e, "connection: frame decode error, closing read side");
				return;
			}
		}

		match recv.read(&mut chunk).await {
			Ok(Some(n)) if n > 0 => buf.extend_from_slice(&chunk[..n]),
			Ok(_) => return,
			Err(e) => {
				debug!(error = %e, "connection: read error, closing read side");
				return;
			}
		}
	}
}

/// Drains `rx` onto `send` until the channel closes or a write fails.
async fn write_frames(mut send: quinn::SendStream, mut rx: mpsc::Receiver<Vec<u8>>) {
	while let Some(frame) = rx.recv().await {
		if let Err(e) = send.write_all(&frame).await {
			debug!(error = %e, "connection: write error, closing write side");
			return;
		}
	}
	let _ = send.finish();
}

/// Runs the full pump for one QUIC connection: accept its single bidirectional
/// stream, gate on `auth`, then dispatch command frames until closed.
pub async fn handle_connection(
	conn_id: u64,
	connection: quinn::Connection,
	rooms: RoomService,
	registry: SessionRegistry,
	pk: Arc<PkCoordinator>,
	auth: Arc<dyn AuthResolver>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	let (send, recv) = connection.accept_bi().await?;

	let (in_tx, mut in_rx) = mpsc::channel::<RawFrame>(64);
	let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(settings.outbound_channel_capacity);
	let (evict_tx, mut evict_rx) = mpsc::channel::<()>(1);

	tokio::spawn(read_frames(recv, in_tx, settings.max_frame_bytes));
	tokio::spawn(write_frames(send, out_rx));

	// awaiting-auth: the only message type processed before a valid `auth`
	// frame is `auth` itself (spec.md §4.C).
	let user_id = match timeout(
		settings.authorize_timeout,
		await_auth(&mut in_rx, &out_tx, auth.as_ref(), settings.pong_timeout.as_secs()),
	)
	.await
	{
		Ok(Some(user_id)) => user_id,
		Ok(None) => {
			debug!(conn_id, "connection: auth failed or stream closed");
			return Ok(());
		}
		Err(_) => {
			debug!(conn_id, "connection: auth deadline elapsed");
			return Ok(());
		}
	};

	info!(conn_id, user = %user_id, "connection: authorized");

	let conn_handle = ConnHandle::new(conn_id, out_tx.clone(), evict_tx);
	registry.register(user_id.clone(), conn_handle.clone()).await;

	let mut rate_limiter = CommandRateLimiter::new(&settings);
	let mut ping_interval = tokio::time::interval(settings.ping_interval);
	ping_interval.tick().await; // first tick fires immediately; not a real heartbeat.

	let mut last_pong = Instant::now();

	let mut evicted = false;

	'authorized: loop {
		tokio::select! {
			_ = evict_rx.recv() => {
				debug!(conn_id, user = %user_id, "connection: evicted by newer session");
				evicted = true;
				break 'authorized;
			}
			_ = ping_interval.tick() => {
				if last_pong.elapsed() > settings.pong_timeout {
					warn!(conn_id, user = %user_id, "connection: pong timeout, closing");
					break 'authorized;
				}
				let ping = PingBody { client_time_unix_ms: unix_ms_now() };
				if let Ok(frame) = encode_frame_default(FrameType::Ping, &ping) {
					let _ = conn_handle.try_send_frame(frame);
				}
			}
			frame = in_rx.recv() => {
				let Some(frame) = frame else {
					debug!(conn_id, user = %user_id, "connection: read side closed");
					break 'authorized;
				};

				if !rate_limiter.allow_connection() {
					debug!(conn_id, user = %user_id, frame_type = %frame.frame_type, "connection: per-connection rate limit exceeded");
					continue;
				}

				dispatch_frame(&frame, &user_id, &rooms, &pk, &conn_handle, &mut rate_limiter, &mut last_pong).await;
			}
		}
	}

	registry.unregister(&user_id, &conn_handle).await;

	// An evicted connection's user is still live on its successor connection;
	// only a real offline transition closes the room (spec.md §4.C, §4.E.7).
	if !evicted
		&& let Ok(Some(active)) = rooms.get_active_user(&user_id).await
		&& active.status != UserStatus::Idle
	{
		pk.handle_disconnect(user_id).await;
	}

	Ok(())
}

async fn dispatch_frame(
	frame: &RawFrame,
	user_id: &UserId,
	rooms: &RoomService,
	pk: &Arc<PkCoordinator>,
	conn_handle: &ConnHandle,
	rate_limiter: &mut CommandRateLimiter,
	last_pong: &mut Instant,
) {
	match frame.frame_type {
		FrameType::Pong => {
			*last_pong = Instant::now();
		}
		FrameType::Auth => {
			// Re-auth mid-session is not part of the protocol; ignore.
		}
		FrameType::StartPk => {
			let Ok(body) = frame.parse_body::<StartPkBody>() else { return };
			if let Ok(target_room_id) = RoomId::new(body.pk_room_id.clone())
				&& let Ok(Some(target)) = rooms.get_room_by_id(&target_room_id).await
			{
				let pair = PairKey::new(user_id.clone(), target.creator.clone());
				if !rate_limiter.allow_pair(&pair) {
					send_rpc_result(
						conn_handle,
						FrameType::StartPkRes,
						RpcResultBody::err(body.rpc_id.clone(), ErrorCode::InvalidParameter.as_u32(), "rate limited"),
					);
					return;
				}
			}
			let result = pk.handle_start_pk(user_id.clone(), body).await;
			send_rpc_result(conn_handle, FrameType::StartPkRes, result);
		}
		FrameType::AnswerPk => {
			let Ok(body) = frame.parse_body::<AnswerPkBody>() else { return };
			let result = pk.handle_answer_pk(user_id.clone(), body).await;
			send_rpc_result(conn_handle, FrameType::AnswerPkRes, result);
		}
		FrameType::EndPk => {
			let Ok(body) = frame.parse_body::<EndPkBody>() else { return };
			let result = pk.handle_end_pk(user_id.clone(), body).await;
			send_rpc_result(conn_handle, FrameType::EndPkRes, result);
		}
		other => {
			debug!(user = %user_id, frame_type = %other, "connection: unexpected frame type while authorized");
		}
	}
}

/// Waits for a valid `auth` frame, replying with `auth-res` either way.
/// Returns `None` on an invalid token, a malformed frame, or stream closure.
async fn await_auth(
	in_rx: &mut mpsc::Receiver<RawFrame>,
	out_tx: &mpsc::Sender<Vec<u8>>,
	auth: &dyn AuthResolver,
	pong_timeout_secs: u64,
) -> Option<UserId> {
	let frame = in_rx.recv().await?;
	if frame.frame_type != FrameType::Auth {
		return None;
	}
	let body: AuthBody = frame.parse_body().ok()?;

	match auth.resolve(&body.token).await {
		Ok(user_id) => {
			let res = AuthResBody {
				rpc_id: body.rpc_id,
				code: ErrorCode::Ok.as_u32(),
				error: String::new(),
				pong_timeout: pong_timeout_secs,
			};
			if let Ok(encoded) = encode_frame_default(FrameType::AuthRes, &res) {
				let _ = out_tx.send(encoded).await;
			}
			Some(user_id)
		}
		Err(e) => {
			let res = AuthResBody {
				rpc_id: body.rpc_id,
				code: ErrorCode::TokenInvalid.as_u32(),
				error: e.to_string(),
				pong_timeout: pong_timeout_secs,
			};
			if let Ok(encoded) = encode_frame_default(FrameType::AuthRes, &res) {
				let _ = out_tx.send(encoded).await;
			}
			None
		}
	}
}

fn send_rpc_result(conn: &ConnHandle, frame_type: FrameType, body: RpcResultBody) {
	if let Ok(frame) = encode_frame_default(frame_type, &body) {
		let _ = conn.try_send_frame(frame);
	}
}
