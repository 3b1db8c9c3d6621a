#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use helpdesk_protocol::pb::{self, client_event, envelope};
use helpdesk_protocol::version::{ALPN, PROTOCOL_MAJOR};
use helpdesk_protocol::{DEFAULT_MAX_FRAME_SIZE, FrameDecoder, FramingError, encode_frame};
use quinn::{ClientConfig, Endpoint};
use tracing::{debug, info};

/// Client session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
	/// Remote server address.
	pub server_addr: SocketAddr,

	/// TLS server name (SNI).
	pub server_name: String,

	/// Client identifier sent in `Hello`.
	pub client_name: String,

	/// Signed session credential.
	pub auth_token: String,

	/// Maximum inbound/outbound frame size.
	pub max_frame_bytes: usize,

	/// Timeout for connect + handshake.
	pub connect_timeout: Duration,
}

impl SessionConfig {
	pub fn new(server_addr: SocketAddr, auth_token: impl Into<String>) -> Self {
		Self {
			server_addr,
			auth_token: auth_token.into(),
			..Self::default()
		}
	}
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			server_addr: SocketAddr::from(([127, 0, 0, 1], 18203)),
			server_name: "localhost".to_string(),
			client_name: format!("helpdesk-client/{}", env!("CARGO_PKG_VERSION")),
			auth_token: String::new(),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(15),
		}
	}
}

/// Errors for client session operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	/// QUIC endpoint setup failed.
	#[error("failed to create QUIC endpoint: {0}")]
	Endpoint(String),

	/// Connection establishment failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	/// Server refused the handshake or a request.
	#[error("server error {code}: {message}")]
	Server {
		code: String,
		message: String,
	},

	/// Protocol framing error.
	#[error(transparent)]
	Framing(#[from] FramingError),

	/// Unexpected message ordering/types.
	#[error("protocol error: {0}")]
	Protocol(String),

	#[error("io error: {0}")]
	Io(String),
}

impl From<pb::Error> for ClientError {
	fn from(e: pb::Error) -> Self {
		ClientError::Server {
			code: e.code,
			message: e.message,
		}
	}
}

/// One authenticated session over a single bidirectional stream.
pub struct ClientSession {
	endpoint: Endpoint,
	conn: quinn::Connection,
	send: quinn::SendStream,
	recv: quinn::RecvStream,
	decoder: FrameDecoder,
	pending: VecDeque<pb::Envelope>,
	welcome: pb::Welcome,
	max_frame_bytes: usize,
	next_request_id: u64,
}

impl ClientSession {
	/// Connect and perform the `Hello`/`Welcome` handshake.
	pub async fn connect(cfg: SessionConfig) -> Result<Self, ClientError> {
		let endpoint = make_client_endpoint().map_err(|e| ClientError::Endpoint(format!("{e:#}")))?;
		let quinn_cfg = make_insecure_client_config().map_err(|e| ClientError::Endpoint(format!("{e:#}")))?;
		let connect_timeout = cfg.connect_timeout;

		let connecting = endpoint
			.connect_with(quinn_cfg, cfg.server_addr, &cfg.server_name)
			.map_err(|e| ClientError::Connect(format!("connect_with({}): {e}", cfg.server_addr)))?;

		let conn = match tokio::time::timeout(connect_timeout, connecting).await {
			Ok(Ok(c)) => c,
			Ok(Err(e)) => return Err(ClientError::Connect(format!("addr={}: {e}", cfg.server_addr))),
			Err(_) => {
				return Err(ClientError::Connect(format!(
					"connect timeout after {connect_timeout:?} (addr={})",
					cfg.server_addr
				)));
			}
		};

		info!(remote = %conn.remote_address(), "connected");

		let (send, recv) = tokio::time::timeout(connect_timeout, conn.open_bi())
			.await
			.map_err(|_| ClientError::Io(format!("timeout opening stream after {connect_timeout:?}")))?
			.map_err(|e| ClientError::Io(format!("open_bi failed: {e}")))?;

		let mut session = Self {
			endpoint,
			conn,
			send,
			recv,
			decoder: FrameDecoder::new(cfg.max_frame_bytes),
			pending: VecDeque::new(),
			welcome: pb::Welcome::default(),
			max_frame_bytes: cfg.max_frame_bytes,
			next_request_id: 0,
		};

		let hello = pb::Hello {
			client_name: cfg.client_name,
			auth_token: cfg.auth_token,
		};
		session.write(String::new(), envelope::Msg::Hello(hello)).await?;

		let reply = tokio::time::timeout(connect_timeout, session.read_envelope())
			.await
			.map_err(|_| ClientError::Protocol(format!("timeout waiting for Welcome after {connect_timeout:?}")))??;

		let welcome = match reply.and_then(|env| env.msg) {
			Some(envelope::Msg::Welcome(w)) => w,
			Some(envelope::Msg::Error(e)) => return Err(e.into()),
			other => return Err(ClientError::Protocol(format!("expected Welcome, got {other:?}"))),
		};

		debug!(
			server_name = %welcome.server_name,
			user_id = %welcome.user_id,
			role = %welcome.role,
			max_frame_bytes = welcome.max_frame_bytes,
			"received Welcome"
		);

		session.max_frame_bytes = (welcome.max_frame_bytes as usize).min(cfg.max_frame_bytes);
		session.welcome = welcome;
		Ok(session)
	}

	pub fn welcome(&self) -> &pb::Welcome {
		&self.welcome
	}

	/// Send a client event; returns the request id the server will echo.
	pub async fn send(&mut self, event: client_event::Event) -> Result<String, ClientError> {
		self.next_request_id += 1;
		let request_id = self.next_request_id.to_string();
		let client = pb::ClientEvent { event: Some(event) };
		self.write(request_id.clone(), envelope::Msg::Client(client)).await?;
		Ok(request_id)
	}

	/// Send a client event and wait for its reply. Broadcasts that arrive in
	/// between stay queued for [`ClientSession::next_envelope`].
	pub async fn request(&mut self, event: client_event::Event) -> Result<pb::ServerEvent, ClientError> {
		let request_id = self.send(event).await?;
		let mut held = VecDeque::new();

		let result = loop {
			let Some(env) = self.read_envelope().await? else {
				break Err(ClientError::Protocol("stream closed before reply".to_string()));
			};
			if env.request_id != request_id {
				held.push_back(env);
				continue;
			}
			break match env.msg {
				Some(envelope::Msg::Server(ev)) => Ok(ev),
				Some(envelope::Msg::Error(e)) => Err(e.into()),
				other => Err(ClientError::Protocol(format!("unexpected reply: {other:?}"))),
			};
		};

		self.pending.extend(held);
		result
	}

	/// Next envelope from the server; `None` once the server closes the stream.
	pub async fn next_envelope(&mut self) -> Result<Option<pb::Envelope>, ClientError> {
		if let Some(env) = self.pending.pop_front() {
			return Ok(Some(env));
		}
		self.read_envelope().await
	}

	pub fn close(&self, code: u32, reason: &str) {
		self.conn.close(quinn::VarInt::from_u32(code), reason.as_bytes());
	}

	/// Close the connection and wait for the peer to acknowledge.
	pub async fn shutdown(self) {
		self.close(0, "bye");
		self.endpoint.wait_idle().await;
	}

	async fn write(&mut self, request_id: String, msg: envelope::Msg) -> Result<(), ClientError> {
		let env = pb::Envelope {
			version: PROTOCOL_MAJOR,
			request_id,
			msg: Some(msg),
		};
		let frame = encode_frame(&env, self.max_frame_bytes)?;
		self.send
			.write_all(&frame)
			.await
			.map_err(|e| ClientError::Io(e.to_string()))?;
		Ok(())
	}

	async fn read_envelope(&mut self) -> Result<Option<pb::Envelope>, ClientError> {
		let mut tmp = [0u8; 8192];

		loop {
			if let Some(env) = self.decoder.next_frame::<pb::Envelope>()? {
				return Ok(Some(env));
			}

			match self.recv.read(&mut tmp).await {
				Ok(Some(n)) => self.decoder.extend(&tmp[..n]),
				Ok(None) => return Ok(None),
				Err(e) => return Err(ClientError::Io(e.to_string())),
			}
		}
	}
}

fn make_client_endpoint() -> anyhow::Result<Endpoint> {
	let addr = SocketAddr::from(([0, 0, 0, 0], 0));
	let endpoint = Endpoint::client(addr).context("create client endpoint")?;
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
	tls.alpn_protocols = vec![ALPN.to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;
	Ok(ClientConfig::new(Arc::new(quic_tls)))
}
