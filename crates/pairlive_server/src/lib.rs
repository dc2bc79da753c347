#![forbid(unsafe_code)]

pub mod config;
pub mod quic;
pub mod server;
pub mod util;

use std::net::SocketAddr;
use std::sync::Arc;

use pairlive_platform::auth::HmacAuthResolver;
use pairlive_platform::rtc::HttpRtcTokenMinter;
use pairlive_platform::HttpImNotifier;
use pairlive_util::endpoint::QuicEndpoint;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::quic::config::QuicServerConfig;
use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::notifier::Notifier;
use crate::server::pk::PkCoordinator;
use crate::server::registry::SessionRegistry;
use crate::server::rooms::RoomService;
use crate::server::store::SqlStore;

pub fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

pub fn init_tracing(log_filter: &str, otlp_endpoint: Option<&str>) {
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(log_filter.to_string()))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder().with_tonic().with_endpoint(endpoint.to_string()).build() {
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder().with_batch_exporter(exporter).build();
				let tracer = tracer_provider.tracer("pairlive_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

pub fn init_metrics(bind: &str) {
	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr).install() {
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)"),
	}
}

/// Runs the server until its QUIC endpoint closes. Reads configuration from
/// the environment (spec.md §6), binds the signaling and health listeners,
/// and accepts connections until shutdown.
pub async fn run() -> anyhow::Result<()> {
	init_rustls_crypto_provider();

	let server_cfg = crate::config::load_server_config()?;
	init_tracing(&server_cfg.log_filter, server_cfg.otlp_endpoint.as_deref());
	info!("pairlive_server starting");

	init_metrics(&server_cfg.metrics_bind);

	let health_state = HealthState::new();
	match server_cfg.health_bind.parse::<SocketAddr>() {
		Ok(addr) => {
			spawn_health_server(addr, health_state.clone());
			info!(%addr, "health server listening");
		}
		Err(e) => warn!(error = %e, bind = %server_cfg.health_bind, "invalid health bind address"),
	}

	let bind = QuicEndpoint::parse(&server_cfg.bind).map_err(|e| anyhow::anyhow!(e))?;
	let bind_addr = bind.to_socket_addr_if_ip_literal().map_err(|e| anyhow::anyhow!(e))?;

	let quic_cfg = QuicServerConfig::dev(bind_addr);
	let endpoint = if let (Some(cert_path), Some(key_path)) = (server_cfg.tls_cert_path.as_deref(), server_cfg.tls_key_path.as_deref()) {
		info!(cert = %cert_path.display(), key = %key_path.display(), "loading TLS cert/key");
		quic_cfg.bind_endpoint_with_tls(cert_path, key_path)?
	} else {
		let (endpoint, server_cert_der) = quic_cfg.bind_dev_endpoint()?;
		info!(bind = %bind_addr, cert_der_len = server_cert_der.len(), "pairlive_server: QUIC endpoint ready (dev self-signed cert)");
		endpoint
	};

	let store = Arc::new(SqlStore::connect(&server_cfg.database_url).await?);
	let rooms = RoomService::new(store, server_cfg.max_rooms);
	let registry = SessionRegistry::new();

	let auth: Arc<dyn pairlive_platform::AuthResolver> = Arc::new(HmacAuthResolver::new(server_cfg.auth_hmac_secret.clone()));

	let im = Arc::new(HttpImNotifier::new(server_cfg.im_base_url.clone(), server_cfg.im_api_key.clone()));
	let notifier = Arc::new(Notifier::new(registry.clone(), im));

	let rtc = Arc::new(HttpRtcTokenMinter::new(server_cfg.rtc_base_url.clone(), server_cfg.rtc_api_key.clone()));

	let pk = PkCoordinator::new(rooms.clone(), notifier, rtc, server_cfg.timeouts.pk_request_timeout, server_cfg.timeouts.rtc_room_token_ttl);

	let conn_settings = ConnectionSettings {
		authorize_timeout: server_cfg.timeouts.authorize_timeout,
		ping_interval: server_cfg.timeouts.ping_interval,
		pong_timeout: server_cfg.timeouts.pong_timeout,
		command_rate_limit_per_conn_burst: server_cfg.rate_limit.per_connection_burst,
		command_rate_limit_per_conn_per_minute: server_cfg.rate_limit.per_connection_per_minute,
		command_rate_limit_per_pair_burst: server_cfg.rate_limit.per_pair_burst,
		command_rate_limit_per_pair_per_minute: server_cfg.rate_limit.per_pair_per_minute,
		..ConnectionSettings::default()
	};

	health_state.mark_ready();

	let mut next_conn_id: u64 = 1;

	loop {
		let Some(connecting) = endpoint.accept().await else {
			break;
		};

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("pairlive_server_connections_total").increment(1);

		let rooms = rooms.clone();
		let registry = registry.clone();
		let pk = Arc::clone(&pk);
		let auth = Arc::clone(&auth);
		let conn_settings = conn_settings.clone();

		tokio::spawn(async move {
			match connecting.await {
				Ok(connection) => {
					info!(conn_id, remote = %connection.remote_address(), "accepted connection");
					if let Err(e) = handle_connection(conn_id, connection, rooms, registry, pk, auth, conn_settings).await {
						warn!(conn_id, error = %e, "connection handler exited with error");
					}
				}
				Err(e) => {
					warn!(conn_id, error = %e, "failed to establish QUIC connection");
				}
			}
		});
	}

	Ok(())
}
