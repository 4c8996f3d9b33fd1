//! `concierge` -- headless monitor for the chat session layer.
//!
//! Connects as one user, opens the requested rooms and logs every session
//! event until interrupted. Useful for watching a room from a terminal or
//! checking that a deployment's socket and chat API agree.
//!
//! ```bash
//! cargo run --bin concierge -- --ws-url ws://127.0.0.1:9100/ws \
//!     --api-base-url http://127.0.0.1:9100/api --user-id op-1 --role operator \
//!     --room R1 --room R2
//!
//! # Or via environment variables
//! CONCIERGE_WS_URL=ws://127.0.0.1:9100/ws CONCIERGE_USER_ID=u-1 cargo run --bin concierge
//! ```

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use concierge::api::ChatApi;
use concierge::api::http::HttpChatApi;
use concierge::config::{CliArgs, ClientConfig};
use concierge::session::{Session, SessionConfig, SessionEvent};
use concierge::transport::Transport;
use concierge::transport::fallback::FallbackTransport;
use concierge::transport::ws::WsTransport;
use concierge_proto::message::RoomCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let Some(session_config) = config.to_session_config() else {
        eprintln!("error: no user id configured (use --user-id or CONCIERGE_USER_ID)");
        return ExitCode::FAILURE;
    };
    let (Some(ws_url), Some(api_url)) = (config.ws_url.as_deref(), config.api_base_url.as_deref())
    else {
        eprintln!("error: both --ws-url and --api-base-url are required");
        return ExitCode::FAILURE;
    };

    let api = match HttpChatApi::new(api_url, config.api_token.clone(), config.api_timeout) {
        Ok(api) => api,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let rooms: Vec<RoomCode> = cli.rooms.iter().map(RoomCode::new).collect();
    let primary = WsTransport::new(ws_url)
        .with_timeouts(config.connect_timeout, config.handshake_timeout);

    tracing::info!(
        user_id = %session_config.user_id,
        role = session_config.role.as_str(),
        "concierge starting"
    );
    let result = match config.fallback_ws_url.as_deref() {
        Some(fallback_url) => {
            let fallback = WsTransport::new(fallback_url)
                .with_timeouts(config.connect_timeout, config.handshake_timeout);
            run(FallbackTransport::new(primary, fallback), api, session_config, &rooms).await
        }
        None => run(primary, api, session_config, &rooms).await,
    };
    tracing::info!("concierge exiting");

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize logging: to a file when `file_path` is given, otherwise stderr.
///
/// Returns a [`WorkerGuard`] for file logging that must be held until
/// shutdown so buffered entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let Some(log_path) = file_path else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(env_filter)
            .init();
        return None;
    };

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;
    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Connect, open `rooms` and log session events until Ctrl-C.
async fn run<T: Transport, A: ChatApi>(
    transport: T,
    api: A,
    config: SessionConfig,
    rooms: &[RoomCode],
) -> Result<(), concierge::session::SessionError> {
    let (mut session, mut events) = Session::new(transport, api, config);

    session.connect().await?;
    if let Err(e) = session.refresh_rooms().await {
        tracing::warn!(err = %e, "initial room list unavailable");
    }
    for room in rooms {
        match session.open_room(room).await {
            Ok(count) => tracing::info!(room = %room, count, "room loaded"),
            Err(e) => tracing::warn!(room = %room, err = %e, "failed to open room"),
        }
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("interrupt received");
                break;
            }
            () = session.step() => log_events(&session, &mut events),
        }
    }

    session.disconnect();
    log_events(&session, &mut events);
    Ok(())
}

fn log_events<T: Transport, A: ChatApi>(
    session: &Session<T, A>,
    events: &mut mpsc::Receiver<SessionEvent>,
) {
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::ConnectionChanged { connected, transport } => {
                tracing::info!(connected, transport = ?transport, "connection changed");
            }
            SessionEvent::DeliveryModeChanged { mode } => tracing::info!(%mode, "delivery mode"),
            SessionEvent::HandoffChanged {
                room,
                from,
                to,
                reason,
            } => tracing::info!(room = %room, %from, %to, reason = ?reason, "handoff"),
            SessionEvent::AttentionRaised { room } => {
                tracing::warn!(room = %room, "room is waiting for an operator");
            }
            SessionEvent::MessageAppended { room, id, .. }
            | SessionEvent::MessageInserted { room, id, .. } => {
                let message = session
                    .stream(&room)
                    .and_then(|s| s.messages().iter().find(|m| m.id == id));
                if let Some(m) = message {
                    tracing::info!(
                        room = %room,
                        seq = %m.seq,
                        sender = %m.sender_id,
                        "{}",
                        m.content
                    );
                }
            }
            SessionEvent::UnreadCountsChanged { total } => tracing::info!(total, "unread"),
            SessionEvent::Notice(notice) => tracing::warn!(
                kind = ?notice.kind,
                room = ?notice.room,
                "{}",
                notice.message
            ),
            other => tracing::debug!(event = ?other, "session event"),
        }
    }
}
