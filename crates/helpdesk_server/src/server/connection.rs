#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context as _, anyhow};
use helpdesk_domain::ChatError;
use helpdesk_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame};
use helpdesk_protocol::version::PROTOCOL_MAJOR;
use helpdesk_protocol::{FramingError, convert, pb};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::auth::Authenticator;
use crate::server::room_hub::{ConnId, HubItem};
use crate::server::service::ChatService;
use crate::server::session::{SendRateLimit, Session};
use crate::util::time::unix_ms_now;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub server_name: String,

	pub max_frame_bytes: u32,

	/// Hello plus credential check must finish within this window.
	pub auth_timeout: Duration,

	pub send_rate_limit: SendRateLimit,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			server_name: format!("helpdesk-server/{}", env!("CARGO_PKG_VERSION")),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE as u32,
			auth_timeout: Duration::from_secs(5),
			send_rate_limit: SendRateLimit::default(),
		}
	}
}

fn envelope(request_id: String, msg: pb::envelope::Msg) -> pb::Envelope {
	pb::Envelope {
		version: PROTOCOL_MAJOR,
		request_id,
		msg: Some(msg),
	}
}

fn hub_item_envelope(item: HubItem) -> Option<pb::Envelope> {
	match item {
		HubItem::Event(ev) => Some(envelope(String::new(), pb::envelope::Msg::Server((*ev).clone()))),
		HubItem::Reply { request_id, event } => Some(envelope(request_id, pb::envelope::Msg::Server(event))),
		HubItem::Error { request_id, error } => Some(envelope(request_id, pb::envelope::Msg::Error(error))),
		HubItem::Lagged { .. } => None,
	}
}

/// Drive one QUIC connection: handshake, then dispatch client events until
/// the peer goes away or the user is disconnected.
pub async fn handle_connection(
	conn_id: ConnId,
	connection: quinn::Connection,
	auth: Authenticator,
	service: ChatService,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("helpdesk_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("helpdesk_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let max_frame = settings.max_frame_bytes as usize;
	let (mut control_send, mut control_recv) =
		connection.accept_bi().await.context("accept control bidirectional stream")?;

	let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<pb::Envelope>();
	let reader_task = tokio::spawn(async move {
		let mut buf = Vec::<u8>::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match control_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("control stream read failed")),
			};

			metrics::counter!("helpdesk_server_control_bytes_in_total").increment(n as u64);

			buf.extend_from_slice(&tmp[..n]);

			loop {
				match helpdesk_protocol::decode_frame::<pb::Envelope>(&buf, max_frame) {
					Ok((msg, used)) => {
						buf.drain(0..used);
						metrics::counter!("helpdesk_server_envelopes_in_total").increment(1);

						if ctrl_tx.send(msg).is_err() {
							return Ok(());
						}
					}
					Err(FramingError::InsufficientData { .. }) => break,
					Err(e) => {
						metrics::counter!("helpdesk_server_control_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode control frame"));
					}
				}
			}
		}
	});

	let handshake = tokio::time::timeout(settings.auth_timeout, async {
		let hello = wait_for_hello(&mut ctrl_rx)
			.await
			.map_err(|e| ChatError::Unauthenticated(e.to_string()))?;
		info!(conn_id, client_name = %hello.client_name, "received Hello");
		metrics::counter!("helpdesk_server_hello_total").increment(1);
		auth.authenticate(&hello.auth_token).await
	})
	.await
	.unwrap_or_else(|_| Err(ChatError::Unauthenticated("handshake timed out".to_string())));

	let principal = match handshake {
		Ok(principal) => principal,
		Err(err) => {
			warn!(conn_id, error = %err, "handshake rejected");
			metrics::counter!("helpdesk_server_auth_failures_total").increment(1);
			let _ = send_envelope(
				&mut control_send,
				envelope(String::new(), pb::envelope::Msg::Error(convert::error(&err))),
				max_frame,
			)
			.await;
			let _ = control_send.finish();
			let _ = control_send.stopped().await;
			reader_task.abort();
			return Ok(());
		}
	};

	let welcome = pb::Welcome {
		server_name: settings.server_name.clone(),
		server_time_unix_ms: unix_ms_now(),
		max_frame_bytes: settings.max_frame_bytes,
		user_id: principal.user_id.to_string(),
		role: principal.role.as_str().to_string(),
		display_name: principal.display_name.clone(),
	};
	send_envelope(
		&mut control_send,
		envelope(String::new(), pb::envelope::Msg::Welcome(welcome)),
		max_frame,
	)
	.await
	.context("send Welcome")?;
	info!(conn_id, user_id = %principal.user_id, role = principal.role.as_str(), "session established");

	let hub = service.hub().clone();
	let registration = hub.register(conn_id, principal.clone()).await;
	service.on_connect(conn_id, &principal).await;

	let mut mailbox = registration.mailbox;
	let writer_task = tokio::spawn(async move {
		while let Some(item) = mailbox.recv().await {
			if let HubItem::Lagged { dropped } = item {
				metrics::counter!("helpdesk_server_connection_lagged_total").increment(1);
				warn!(conn_id, dropped, "connection lagged; events were dropped");
				continue;
			}
			let Some(env) = hub_item_envelope(item) else { continue };
			if let Err(e) = send_envelope(&mut control_send, env, max_frame).await {
				debug!(conn_id, error = %e, "writer stopped");
				break;
			}
		}
		let _ = control_send.finish();
	});

	let mut session = Session::new(
		conn_id,
		principal,
		service.clone(),
		registration.outbox,
		settings.send_rate_limit,
	);
	let kicked = registration.kicked;

	let mut was_kicked = false;
	loop {
		tokio::select! {
			env = ctrl_rx.recv() => {
				let Some(env) = env else { break };
				dispatch_envelope(&mut session, env).await;
			}
			_ = kicked.notified() => {
				info!(conn_id, user_id = %session.principal().user_id, "connection closed by server");
				was_kicked = true;
				break;
			}
		}
	}

	service.on_disconnect(conn_id).await;
	// Dropping the last outbox sender lets the writer drain and finish.
	drop(session);
	let _ = writer_task.await;

	if was_kicked {
		connection.close(0u32.into(), b"closed by server");
	}
	reader_task.abort();
	let _ = reader_task.await;

	Ok(())
}

async fn dispatch_envelope(session: &mut Session, env: pb::Envelope) {
	let request_id = env.request_id;
	match env.msg {
		Some(pb::envelope::Msg::Client(event)) => session.handle(request_id, event).await,
		Some(pb::envelope::Msg::Hello(_)) => {
			debug!("ignoring duplicate Hello");
		}
		Some(_) => {
			session
				.fail(request_id, &ChatError::invalid("msg", "expected a client event"))
				.await;
		}
		None => session.fail(request_id, &ChatError::missing("msg")).await,
	}
}

async fn wait_for_hello(ctrl_rx: &mut mpsc::UnboundedReceiver<pb::Envelope>) -> anyhow::Result<pb::Hello> {
	while let Some(env) = ctrl_rx.recv().await {
		let Some(msg) = env.msg else { continue };
		if let pb::envelope::Msg::Hello(h) = msg {
			return Ok(h);
		}
	}
	Err(anyhow!("connection closed before Hello"))
}

async fn send_envelope(send: &mut quinn::SendStream, env: pb::Envelope, max_frame: usize) -> anyhow::Result<()> {
	let frame = encode_frame(&env, max_frame).map_err(|e| anyhow!(e))?;
	metrics::counter!("helpdesk_server_envelopes_out_total").increment(1);
	metrics::counter!("helpdesk_server_control_bytes_out_total").increment(frame.len() as u64);

	send.write_all(&frame).await.context("stream write")?;
	Ok(())
}
