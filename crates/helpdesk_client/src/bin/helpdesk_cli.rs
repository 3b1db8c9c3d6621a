#![forbid(unsafe_code)]

use std::net::SocketAddr;

use helpdesk_client::{ClientSession, SessionConfig};
use helpdesk_protocol::pb::{self, client_event, envelope, server_event};
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: helpdesk_cli [--addr ip:port] [--sni name] [--room id] [--send text]\n\
\n\
Options:\n\
	--addr      Server SocketAddr (default: 127.0.0.1:18203)\n\
	--sni       TLS server name (default: localhost)\n\
	--room      Room to join (default: every room visible to the token)\n\
	--send      Send one message to --room after joining\n\
	--help      Show this help\n\
\n\
The session credential is read from HELPDESK_TOKEN.\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,helpdesk_client=debug".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

struct Args {
	cfg: SessionConfig,
	room: Option<String>,
	send: Option<String>,
}

fn parse_args() -> Args {
	let mut cfg = SessionConfig {
		client_name: format!("helpdesk-cli/{}", env!("CARGO_PKG_VERSION")),
		..SessionConfig::default()
	};
	let mut room = None;
	let mut send = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		let mut value = || {
			let v = it.next().unwrap_or_else(|| usage_and_exit());
			if v.trim().is_empty() {
				eprintln!("{arg} must be non-empty");
				usage_and_exit();
			}
			v
		};
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--addr" => {
				let v = value();
				cfg.server_addr = v.parse::<SocketAddr>().unwrap_or_else(|_| {
					eprintln!("Invalid --addr value: {v}");
					usage_and_exit()
				});
			}
			"--sni" => cfg.server_name = value(),
			"--room" => room = Some(value()),
			"--send" => send = Some(value()),
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	cfg.auth_token = std::env::var("HELPDESK_TOKEN").unwrap_or_default().trim().to_string();
	if send.is_some() && room.is_none() {
		eprintln!("--send requires --room");
		usage_and_exit();
	}

	Args { cfg, room, send }
}

fn print_event(ev: pb::ServerEvent) {
	match ev.event {
		Some(server_event::Event::NewMessage(m)) => {
			let Some(msg) = m.message else { return };
			let author = msg.sender.as_ref().map(|s| s.display_name.as_str()).unwrap_or("<unknown>");
			println!("[{} #{}] {}: {}", msg.room_id, msg.seq, author, msg.content);
		}
		Some(server_event::Event::RoomsJoined(j)) => {
			for room in j.rooms {
				println!("joined {} [{}] {}", room.id, room.status, room.subject);
			}
		}
		Some(other) => println!("{other:?}"),
		None => warn!("empty server event"),
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = parse_args();

	info!(server = %args.cfg.server_addr, sni = %args.cfg.server_name, "connecting");
	let mut session = ClientSession::connect(args.cfg).await?;
	info!(user_id = %session.welcome().user_id, role = %session.welcome().role, "authenticated");

	let joined = match &args.room {
		Some(room_id) => {
			session
				.request(client_event::Event::JoinRoom(pb::JoinRoom {
					room_id: room_id.clone(),
				}))
				.await?
		}
		None => session.request(client_event::Event::JoinUserRooms(pb::JoinUserRooms {})).await?,
	};
	print_event(joined);

	if let (Some(room_id), Some(content)) = (args.room, args.send) {
		session
			.send(client_event::Event::SendMessage(pb::SendMessage {
				room_id,
				content,
				message_type: String::new(),
				metadata_json: String::new(),
			}))
			.await?;
	}

	while let Some(env) = session.next_envelope().await? {
		match env.msg {
			Some(envelope::Msg::Server(ev)) => print_event(ev),
			Some(envelope::Msg::Error(e)) => warn!(code = %e.code, "{}", e.message),
			other => warn!("unexpected message: {other:?}"),
		}
	}

	info!("server closed the stream");
	Ok(())
}
