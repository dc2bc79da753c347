#![forbid(unsafe_code)]

//! Minimal QUIC client for the signaling protocol (spec.md §6), used as an
//! integration-test harness in `pairlive_server`'s test suite and as the
//! basis for any real client embedding this crate.

use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use pairlive_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FrameType, FramingError, RawFrame, encode_frame, try_decode_frame_from_buffer};
use pairlive_protocol::messages::{
	AnswerPkBody, AuthBody, AuthResBody, EndPkBody, PingBody, PongBody, RpcResultBody, StartPkBody,
};
use pairlive_util::endpoint::QuicEndpoint;
use quinn::{ClientConfig, Endpoint, TransportConfig, VarInt};
use tokio::io::AsyncWriteExt as _;
use tracing::{debug, info};

/// Client session configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig1 {
	/// Remote server host (DNS name or IP literal).
	pub server_host: String,

	/// Remote server UDP port.
	pub server_port: u16,

	/// Resolved remote server address override, bypassing DNS.
	pub server_addr: Option<SocketAddr>,

	/// Bearer token sent in the `auth` frame.
	pub auth_token: String,

	/// Maximum inbound/outbound frame size.
	pub max_frame_bytes: usize,

	/// Timeout for connect + auth handshake.
	pub connect_timeout: Duration,
}

impl ClientConfig1 {
	/// Convenience: build a config from `quic://host:port` plus a token.
	pub fn from_quic_endpoint(endpoint: &str, auth_token: impl Into<String>) -> Result<Self, ClientCoreError> {
		let e = QuicEndpoint::parse(endpoint)
			.map_err(|msg| ClientCoreError::Protocol(format!("invalid endpoint (expected quic://host:port): {msg}")))?;
		Ok(Self {
			server_host: e.host,
			server_port: e.port,
			server_addr: None,
			auth_token: auth_token.into(),
			..Self::default()
		})
	}
}

impl Default for ClientConfig1 {
	fn default() -> Self {
		Self {
			server_host: "localhost".to_string(),
			server_port: 18203,
			server_addr: Some("127.0.0.1:18203".parse().expect("valid default addr")),
			auth_token: String::new(),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(15),
		}
	}
}

/// Errors for client core operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientCoreError {
	/// QUIC endpoint setup failed.
	#[error("failed to create QUIC endpoint: {0}")]
	Endpoint(String),

	/// Connection establishment failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	/// Protocol framing error.
	#[error(transparent)]
	Framing(#[from] FramingError),

	/// Protocol error (unexpected message ordering/types, auth rejected).
	#[error("protocol error: {0}")]
	Protocol(String),

	/// IO error.
	#[error("io error: {0}")]
	Io(String),

	/// Other error.
	#[error("error: {0}")]
	Other(String),
}

impl From<anyhow::Error> for ClientCoreError {
	fn from(e: anyhow::Error) -> Self {
		ClientCoreError::Other(format!("{e:#}"))
	}
}

static NEXT_RPC_ID: AtomicU64 = AtomicU64::new(1);

fn next_rpc_id() -> String {
	format!("rpc-{}", NEXT_RPC_ID.fetch_add(1, Ordering::Relaxed))
}

/// A connected, authorized session. Owns the single bidirectional stream the
/// signaling protocol runs over (spec.md §6).
pub struct Session {
	conn: quinn::Connection,
	send: quinn::SendStream,
	recv: quinn::RecvStream,
	buf: BytesMut,
	max_frame_bytes: usize,
	/// Push frames (`on-pk-*`) observed while waiting on an RPC response,
	/// queued for later retrieval via `next_push`.
	pending: VecDeque<RawFrame>,
}

impl Session {
	/// Connect to the server and perform the `auth`/`auth-res` handshake.
	pub async fn connect(cfg: ClientConfig1) -> Result<(Self, AuthResBody), ClientCoreError> {
		let endpoint = make_client_endpoint().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;
		let quinn_cfg = make_insecure_client_config().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;

		let connect_timeout = cfg.connect_timeout;
		let server_name = cfg.server_host.clone();

		let candidates: Vec<SocketAddr> = match cfg.server_addr {
			Some(addr) => vec![addr],
			None => {
				let hostport = format!("{}:{}", cfg.server_host, cfg.server_port);
				let addrs: Vec<SocketAddr> = hostport
					.to_socket_addrs()
					.map_err(|e| ClientCoreError::Connect(format!("failed to resolve {hostport}: {e}")))?
					.collect();
				if addrs.is_empty() {
					return Err(ClientCoreError::Connect(format!("DNS resolution returned no addresses for {hostport}")));
				}
				addrs
			}
		};

		let mut last_err: Option<String> = None;
		let mut conn: Option<quinn::Connection> = None;

		for server_addr in candidates {
			let connecting = endpoint
				.connect_with(quinn_cfg.clone(), server_addr, &server_name)
				.map_err(|e| ClientCoreError::Connect(format!("connect_with({server_addr}, sni={server_name}): {e}")))?;

			match tokio::time::timeout(connect_timeout, connecting).await {
				Ok(Ok(c)) => {
					conn = Some(c);
					break;
				}
				Ok(Err(e)) => {
					last_err = Some(format!("connect failed (addr={server_addr}, sni={server_name}): {e}"));
				}
				Err(_) => {
					last_err = Some(format!("connect timeout after {connect_timeout:?} (addr={server_addr}, sni={server_name})"));
				}
			}
		}

		let conn = conn.ok_or_else(|| {
			ClientCoreError::Connect(last_err.unwrap_or_else(|| format!("connect failed (no addresses attempted) (sni={server_name})")))
		})?;

		info!(remote = %conn.remote_address(), "connected");

		let (mut send, mut recv) = tokio::time::timeout(connect_timeout, conn.open_bi())
			.await
			.map_err(|_| ClientCoreError::Io(format!("timeout opening stream after {connect_timeout:?}")))?
			.map_err(|e| ClientCoreError::Io(format!("open_bi failed: {e}")))?;

		let rpc_id = next_rpc_id();
		let auth_body = AuthBody { rpc_id: rpc_id.clone(), token: cfg.auth_token };
		write_frame(&mut send, FrameType::Auth, &auth_body, cfg.max_frame_bytes).await?;

		let mut buf = BytesMut::with_capacity(8 * 1024);
		let frame = tokio::time::timeout(connect_timeout, read_frame(&mut recv, &mut buf, cfg.max_frame_bytes))
			.await
			.map_err(|_| ClientCoreError::Protocol(format!("timeout waiting for auth-res after {connect_timeout:?}")))??;

		if frame.frame_type != FrameType::AuthRes {
			return Err(ClientCoreError::Protocol(format!("expected auth-res, got {}", frame.frame_type)));
		}

		let auth_res: AuthResBody = frame.parse_body()?;
		if auth_res.rpc_id != rpc_id {
			return Err(ClientCoreError::Protocol(format!(
				"auth-res rpcId mismatch: sent {rpc_id}, got {}",
				auth_res.rpc_id
			)));
		}
		if auth_res.code != 0 {
			return Err(ClientCoreError::Protocol(format!("auth rejected: code={} error={}", auth_res.code, auth_res.error)));
		}

		debug!(pong_timeout = auth_res.pong_timeout, "authorized");

		let session = Self {
			conn,
			send,
			recv,
			buf,
			max_frame_bytes: cfg.max_frame_bytes,
			pending: VecDeque::new(),
		};

		Ok((session, auth_res))
	}

	/// Propose a PK pairing from `pk_room_id`. Waits for `start-pk-res`.
	pub async fn start_pk(&mut self, pk_room_id: impl Into<String>) -> Result<RpcResultBody, ClientCoreError> {
		let rpc_id = next_rpc_id();
		let body = StartPkBody { pk_room_id: pk_room_id.into(), rpc_id: rpc_id.clone() };
		write_frame(&mut self.send, FrameType::StartPk, &body, self.max_frame_bytes).await?;
		self.await_rpc_result(FrameType::StartPkRes, &rpc_id).await
	}

	/// Answer a pending offer addressed to `req_room_id`. Waits for `answer-pk-res`.
	pub async fn answer_pk(&mut self, req_room_id: impl Into<String>, accept: bool) -> Result<RpcResultBody, ClientCoreError> {
		let rpc_id = next_rpc_id();
		let body = AnswerPkBody { req_room_id: req_room_id.into(), accept, rpc_id: rpc_id.clone() };
		write_frame(&mut self.send, FrameType::AnswerPk, &body, self.max_frame_bytes).await?;
		self.await_rpc_result(FrameType::AnswerPkRes, &rpc_id).await
	}

	/// End an active PK pairing. Waits for `end-pk-res`.
	pub async fn end_pk(&mut self, pk_room_id: impl Into<String>) -> Result<RpcResultBody, ClientCoreError> {
		let rpc_id = next_rpc_id();
		let body = EndPkBody { pk_room_id: pk_room_id.into(), rpc_id: rpc_id.clone() };
		write_frame(&mut self.send, FrameType::EndPk, &body, self.max_frame_bytes).await?;
		self.await_rpc_result(FrameType::EndPkRes, &rpc_id).await
	}

	/// Pull the next queued push frame (`on-pk-offer`, `on-pk-answer`,
	/// `on-pk-end`, `on-pk-timeout`), reading more from the stream if none are
	/// buffered. `ping` frames are answered transparently and never returned.
	pub async fn next_push(&mut self) -> Result<RawFrame, ClientCoreError> {
		if let Some(frame) = self.pending.pop_front() {
			return Ok(frame);
		}

		loop {
			let frame = read_frame(&mut self.recv, &mut self.buf, self.max_frame_bytes).await?;
			if let Some(frame) = self.handle_or_return(frame).await? {
				return Ok(frame);
			}
		}
	}

	/// Close the underlying QUIC connection.
	pub fn close(&self, code: u32, reason: &str) {
		self.conn.close(VarInt::from_u32(code), reason.as_bytes());
	}

	async fn await_rpc_result(&mut self, expect: FrameType, rpc_id: &str) -> Result<RpcResultBody, ClientCoreError> {
		loop {
			let frame = read_frame(&mut self.recv, &mut self.buf, self.max_frame_bytes).await?;
			let Some(frame) = self.handle_or_return(frame).await? else {
				continue;
			};

			if frame.frame_type != expect {
				self.pending.push_back(frame);
				continue;
			}

			let body: RpcResultBody = frame.parse_body()?;
			if body.rpc_id != rpc_id {
				self.pending.push_back(frame);
				continue;
			}

			return Ok(body);
		}
	}

	/// Transparently answers `ping`; returns `Ok(None)` when the frame was
	/// consumed internally, `Ok(Some(frame))` when the caller should see it.
	async fn handle_or_return(&mut self, frame: RawFrame) -> Result<Option<RawFrame>, ClientCoreError> {
		if frame.frame_type == FrameType::Ping {
			let ping: PingBody = frame.parse_body()?;
			let pong = PongBody { client_time_unix_ms: ping.client_time_unix_ms };
			write_frame(&mut self.send, FrameType::Pong, &pong, self.max_frame_bytes).await?;
			return Ok(None);
		}
		Ok(Some(frame))
	}
}

async fn write_frame<B: serde::Serialize>(
	send: &mut quinn::SendStream,
	frame_type: FrameType,
	body: &B,
	max_frame_bytes: usize,
) -> Result<(), ClientCoreError> {
	let frame = encode_frame(frame_type, body, max_frame_bytes)?;
	send.write_all(&frame).await.map_err(|e| ClientCoreError::Io(e.to_string()))?;
	Ok(())
}

async fn read_frame(recv: &mut quinn::RecvStream, buf: &mut BytesMut, max_frame_bytes: usize) -> Result<RawFrame, ClientCoreError> {
	loop {
		match try_decode_frame_from_buffer(buf, max_frame_bytes) {
			Ok(Some(frame)) => return Ok(frame),
			Ok(None) => {}
			Err(e) => return Err(ClientCoreError::Framing(e)),
		}

		let mut tmp = [0u8; 8192];
		match recv.read(&mut tmp).await {
			Ok(Some(n)) => buf.extend_from_slice(&tmp[..n]),
			Ok(None) => return Err(ClientCoreError::Protocol("stream closed before receiving full frame".to_string())),
			Err(e) => return Err(ClientCoreError::Io(e.to_string())),
		}
	}
}

fn make_client_endpoint() -> anyhow::Result<Endpoint> {
	let addr: SocketAddr = "0.0.0.0:0".parse().expect("valid wildcard addr");
	let endpoint = Endpoint::client(addr)?;
	Ok(endpoint)
}

/// Dev-only TLS config that skips server cert validation.
fn make_insecure_client_config() -> anyhow::Result<ClientConfig> {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	#[derive(Debug)]
	struct NoVerifier;

	impl rustls::client::danger::ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &rustls::pki_types::CertificateDer<'_>,
			_intermediates: &[rustls::pki_types::CertificateDer<'_>],
			_server_name: &rustls::pki_types::ServerName<'_>,
			_ocsp_response: &[u8],
			_now: rustls::pki_types::UnixTime,
		) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
			Ok(rustls::client::danger::ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Err(rustls::Error::General("TLS1.2 not supported".into()))
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			vec![
				rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
				rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA256,
				rustls::SignatureScheme::RSA_PSS_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA512,
				rustls::SignatureScheme::ED25519,
			]
		}
	}

	let mut tls = rustls::ClientConfig::builder()
		.with_root_certificates(rustls::RootCertStore::empty())
		.with_no_client_auth();

	tls.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
	tls.alpn_protocols = vec![b"pairlive-v1".to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;
	let mut cfg = ClientConfig::new(Arc::new(quic_tls));

	let mut transport = TransportConfig::default();
	transport.max_concurrent_bidi_streams(VarInt::from_u32(16));
	transport.max_concurrent_uni_streams(VarInt::from_u32(0));
	cfg.transport_config(Arc::new(transport));

	Ok(cfg)
}

/// One-line `tracing` setup for test binaries embedding this crate.
pub fn init_test_tracing() {
	let _ = tracing_subscriber::fmt().with_test_writer().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).try_init();
}
