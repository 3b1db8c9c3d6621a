#![forbid(unsafe_code)]

mod config;
mod quic;
mod server;
mod util;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::ServerConfig;
use crate::quic::config::QuicServerConfig;
use crate::server::assignment::AutoAssigner;
use crate::server::auth::{AuthClaims, Authenticator, UnknownUsers, sign_hmac_token};
use crate::server::collaborators::{BackOffice, HttpBackOffice, MemoryBackOffice};
use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::directory::{MemoryRoomStore, RoomDirectory, RoomStore, SqlRoomStore};
use crate::server::health::HealthState;
use crate::server::messages::{MemoryMessageStore, MessageBridge, MessageStore, SqlMessageStore};
use crate::server::presence::PresenceTracker;
use crate::server::rest::{RestState, spawn_rest_server};
use crate::server::room_hub::{RoomHub, RoomHubConfig};
use crate::server::service::ChatService;
use crate::server::session::SendRateLimit;
use crate::util::time::unix_secs_now;

enum Command {
	Serve {
		config: Option<PathBuf>,
		bind: Option<String>,
	},
	Token {
		config: Option<PathBuf>,
		claims: AuthClaims,
	},
}

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: helpdesk_server [--config PATH] [--bind host:port]\n\
\x20      helpdesk_server token --sub USER_ID --role admin|staff|user [--name NAME] [--ttl SECS] [--config PATH]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.helpdesk/config.toml)\n\
\t--bind    QUIC bind address, overrides [server].quic_bind\n\
\t         Format: host:port or quic://host:port\n\
\t--help    Show this help\n\
\n\
The token subcommand prints a session credential signed with the configured secret.\n\
"
	);
	std::process::exit(2)
}

fn next_value(it: &mut impl Iterator<Item = String>, flag: &str) -> String {
	let v = it.next().unwrap_or_else(|| usage_and_exit());
	if v.trim().is_empty() {
		eprintln!("{flag} must be non-empty");
		usage_and_exit();
	}
	v
}

fn parse_args() -> Command {
	let mut args = std::env::args().skip(1).peekable();
	let token_mode = args.peek().is_some_and(|a| a == "token");
	if token_mode {
		args.next();
	}

	let mut config = None;
	let mut bind = None;
	let mut sub = None;
	let mut role = None;
	let mut name = None;
	let mut ttl_secs: u64 = 24 * 60 * 60;

	while let Some(arg) = args.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => config = Some(PathBuf::from(next_value(&mut args, "--config"))),
			"--bind" | "--listen" if !token_mode => bind = Some(next_value(&mut args, "--bind")),
			"--sub" if token_mode => sub = Some(next_value(&mut args, "--sub")),
			"--role" if token_mode => role = Some(next_value(&mut args, "--role")),
			"--name" if token_mode => name = Some(next_value(&mut args, "--name")),
			"--ttl" if token_mode => {
				ttl_secs = next_value(&mut args, "--ttl").parse().unwrap_or_else(|_| {
					eprintln!("--ttl must be a number of seconds");
					usage_and_exit();
				});
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	if !token_mode {
		return Command::Serve { config, bind };
	}

	let (Some(sub), Some(role)) = (sub, role) else {
		eprintln!("token requires --sub and --role");
		usage_and_exit();
	};
	let name = name.unwrap_or_else(|| sub.clone());
	Command::Token {
		config,
		claims: AuthClaims {
			sub,
			role,
			name,
			avatar: None,
			exp: unix_secs_now().saturating_add(ttl_secs),
		},
	}
}

fn parse_socket_addr(raw: &str) -> anyhow::Result<SocketAddr> {
	let trimmed = raw.trim();
	let host_port = trimmed.strip_prefix("quic://").unwrap_or(trimmed);
	host_port
		.parse()
		.with_context(|| format!("invalid bind address {raw:?} (expected host:port)"))
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,helpdesk_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("helpdesk_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
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

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<ServerConfig> {
	let path = match path {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let cfg = crate::config::load_server_config_from_path(&path)?;
	info!(path = %path.display(), "loaded server config (toml + env overrides)");
	Ok(cfg)
}

async fn open_room_store(cfg: &ServerConfig) -> anyhow::Result<Arc<dyn RoomStore>> {
	match cfg.persistence.rooms_database_url.as_deref() {
		Some(url) => {
			let store = SqlRoomStore::connect(url).await?;
			info!("room directory: sql store connected");
			Ok(Arc::new(store))
		}
		None => {
			warn!("room directory: no rooms_database_url; using in-memory store");
			Ok(Arc::new(MemoryRoomStore::new()))
		}
	}
}

async fn open_message_store(cfg: &ServerConfig) -> anyhow::Result<Arc<dyn MessageStore>> {
	match cfg.persistence.messages_database_url.as_deref() {
		Some(url) => {
			let store = SqlMessageStore::connect(url).await?;
			info!("message store: sql store connected");
			Ok(Arc::new(store))
		}
		None => {
			warn!("message store: no messages_database_url; using in-memory store");
			Ok(Arc::new(MemoryMessageStore::new()))
		}
	}
}

/// Back-office collaborators and whether they are the real external system.
fn open_backoffice(cfg: &ServerConfig) -> anyhow::Result<(BackOffice, bool)> {
	match cfg.backoffice.base_url.as_deref() {
		Some(base_url) => {
			let http = HttpBackOffice::new(base_url, cfg.backoffice.api_key.clone(), cfg.backoffice.timeout)?;
			info!(base_url, "back-office: http collaborators enabled");
			Ok((BackOffice::from_shared(Arc::new(http)), true))
		}
		None => {
			warn!("back-office: no base_url; notifications and user checks stay in-process");
			Ok((BackOffice::from_shared(Arc::new(MemoryBackOffice::new())), false))
		}
	}
}

fn print_token(config: Option<PathBuf>, claims: AuthClaims) -> anyhow::Result<()> {
	let cfg = load_config(config)?;
	let secret = cfg
		.server
		.auth_hmac_secret
		.ok_or_else(|| anyhow!("auth_hmac_secret is not configured (set [server].auth_hmac_secret or HELPDESK_AUTH_HMAC_SECRET)"))?;
	claims
		.role
		.parse::<helpdesk_domain::Role>()
		.map_err(|e| anyhow!("--role: {e}"))?;
	println!("{}", sign_hmac_token(&claims, secret.expose())?);
	Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let (config_path, bind_override) = match parse_args() {
		Command::Serve { config, bind } => (config, bind),
		Command::Token { config, claims } => return print_token(config, claims),
	};

	let server_cfg = load_config(config_path)?;
	let secret = server_cfg
		.server
		.auth_hmac_secret
		.clone()
		.ok_or_else(|| anyhow!("auth_hmac_secret is required (set [server].auth_hmac_secret or HELPDESK_AUTH_HMAC_SECRET)"))?;

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let store_timeout = server_cfg.server.store_timeout;
	let collaborator_timeout = server_cfg.backoffice.timeout;

	let (backoffice, external_directory) = open_backoffice(&server_cfg)?;
	let rooms = RoomDirectory::new(open_room_store(&server_cfg).await?, store_timeout);
	let hub = RoomHub::new(RoomHubConfig {
		mailbox_capacity: server_cfg.server.mailbox_capacity,
		debug_logs: false,
	});
	let bridge = MessageBridge::new(
		open_message_store(&server_cfg).await?,
		rooms.clone(),
		hub.clone(),
		server_cfg.feed.clone(),
		store_timeout,
	);
	let presence = PresenceTracker::new(hub.clone()).with_directory(backoffice.users.clone(), collaborator_timeout);
	let assigner = AutoAssigner::new(
		backoffice.staff.clone(),
		rooms.clone(),
		server_cfg.assignment.enabled,
		collaborator_timeout,
	);

	let unknown_users = if external_directory {
		UnknownUsers::Reject
	} else {
		UnknownUsers::TrustCredential
	};
	let auth = Authenticator::new(secret, server_cfg.server.auth_timeout)
		.with_directory(backoffice.users.clone())
		.unknown_users(unknown_users);

	let service = ChatService::new(
		rooms,
		bridge.clone(),
		hub.clone(),
		presence,
		assigner,
		backoffice,
		collaborator_timeout,
	);

	let _feed = bridge.spawn_change_feed();

	let send_rate_limit = SendRateLimit {
		burst: server_cfg.server.send_rate_limit_burst,
		per_minute: server_cfg.server.send_rate_limit_per_minute,
	};

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.rest_bind.as_deref() {
		let addr = parse_socket_addr(bind)?;
		let listener = TcpListener::bind(addr)
			.await
			.with_context(|| format!("bind REST listener on {addr}"))?;
		info!(%addr, "rest api listening");
		spawn_rest_server(
			listener,
			RestState::new(service.clone(), auth.clone(), health_state.clone(), send_rate_limit),
		);
	}

	let bind_addr = parse_socket_addr(bind_override.as_deref().unwrap_or(&server_cfg.server.quic_bind))?;
	let quic_cfg = QuicServerConfig::new(bind_addr);
	let endpoint = if let (Some(cert_path), Some(key_path)) = (
		server_cfg.server.tls_cert_path.as_deref(),
		server_cfg.server.tls_key_path.as_deref(),
	) {
		info!(cert = %cert_path.display(), key = %key_path.display(), "loading TLS cert/key");
		quic_cfg.bind_endpoint_with_tls(cert_path, key_path)?
	} else {
		let (endpoint, server_cert_der) = quic_cfg.bind_dev_endpoint()?;
		info!(
			bind = %bind_addr,
			cert_der_len = server_cert_der.len(),
			"helpdesk_server: QUIC endpoint ready (dev self-signed cert)"
		);
		endpoint
	};

	let conn_settings = ConnectionSettings {
		auth_timeout: server_cfg.server.auth_timeout,
		send_rate_limit,
		..ConnectionSettings::default()
	};

	health_state.mark_ready();

	loop {
		let Some(incoming) = endpoint.accept().await else {
			break;
		};

		let conn_id = hub.allocate_conn_id();
		metrics::counter!("helpdesk_server_connections_total").increment(1);

		let auth = auth.clone();
		let service = service.clone();
		let conn_settings = conn_settings.clone();
		tokio::spawn(async move {
			match incoming.await {
				Ok(connection) => {
					info!(conn_id, remote = %connection.remote_address(), "accepted connection");
					if let Err(e) = handle_connection(conn_id, connection, auth, service, conn_settings).await {
						warn!(conn_id, error = %e, "connection handler exited with error");
					}
				}
				Err(e) => {
					warn!(conn_id, error = %e, "failed to establish QUIC connection");
				}
			}
		});
	}

	endpoint.wait_idle().await;
	Ok(())
}
