//! Huddle terminal client.
//!
//! Opens one conversation, prints it, and sends each stdin line as a
//! message. Delivery state is shown next to messages this client composed.
//!
//! Usage:
//!   # Remember who you are (stored under the user config dir)
//!   huddle --user 1 --peer 2
//!
//!   # Group chat
//!   huddle --room 7
//!
//!   # Rooms on the server
//!   huddle --list-rooms
//!
//! Logging goes to stderr; set `RUST_LOG=huddle_client=debug` for detail.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use huddle_client::{
    ChatError, ChatView, ClientConfig, ConnectError, FileIdentityStore, HistorySource,
    IdentityStore, Session,
};
use huddle_types::{ChatMessage, DeliveryState, RoomId, UserId, format_timestamp};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, fmt};

/// Terminal chat client.
#[derive(Parser, Debug)]
#[command(name = "huddle")]
#[command(about = "Chat over a Huddle hub from the terminal")]
struct Args {
    /// RON config file (default: <config dir>/huddle/client.ron if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Sign in as this user id and remember it
    #[arg(short, long)]
    user: Option<String>,

    /// Override the hub WebSocket URL
    #[arg(long)]
    hub: Option<String>,

    /// Override the REST API base URL
    #[arg(long)]
    api: Option<String>,

    /// Direct chat with this user id
    #[arg(long, conflicts_with_all = ["room", "list_rooms"])]
    peer: Option<String>,

    /// Group chat in this room id
    #[arg(long, conflicts_with = "list_rooms")]
    room: Option<String>,

    /// Print the rooms the server knows and exit
    #[arg(long)]
    list_rooms: bool,
}

fn load_config(args: &Args) -> Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => match ClientConfig::default_path().filter(|p| p.exists()) {
            Some(path) => ClientConfig::load(&path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ClientConfig::default(),
        },
    };
    if let Some(hub) = &args.hub {
        config.hub_url = hub.clone();
    }
    if let Some(api) = &args.api {
        config.api_base_url = api.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Identity of a printed line: which message, in which state.
fn line_key(msg: &ChatMessage) -> (String, DeliveryState) {
    let id = match (&msg.local_id, &msg.id) {
        (Some(local), _) => local.to_string(),
        (None, Some(id)) => id.to_string(),
        (None, None) => format!("{}:{}:{}", msg.sender_id, msg.timestamp, msg.content),
    };
    (id, msg.state)
}

fn print_message(msg: &ChatMessage, me: &UserId) {
    let marker = if msg.is_optimistic() || msg.local_id.is_some() {
        match msg.state {
            DeliveryState::Pending => " (sending)",
            DeliveryState::Confirmed => "",
            DeliveryState::Failed => " (failed, /retry to resend)",
        }
    } else {
        ""
    };
    let who = if &msg.sender_id == me {
        "me".to_string()
    } else {
        msg.sender_id.to_string()
    };
    println!(
        "[{}] {}: {}{}",
        format_timestamp(msg.timestamp),
        who,
        msg.content,
        marker
    );
}

/// Print every message (or state change) not printed yet.
fn print_new(view: &ChatView, printed: &mut HashSet<(String, DeliveryState)>) {
    for msg in view.snapshot() {
        if printed.insert(line_key(&msg)) {
            print_message(&msg, view.me());
        }
    }
}

async fn list_rooms(session: &Session) -> Result<()> {
    let rooms = session.history().list_rooms().await?;
    if rooms.is_empty() {
        println!("no rooms");
    }
    for room in rooms {
        println!("{}\t{}", room.id, room.name);
    }
    Ok(())
}

async fn chat(session: &Session, view: ChatView) -> Result<()> {
    let view = Arc::new(view);
    let mut printed = HashSet::new();
    print_new(&view, &mut printed);

    let printer = {
        let view = view.clone();
        let mut changes = view.changes();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                print_new(&view, &mut printed);
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line == "/retry" {
            let failed: Vec<_> = view
                .snapshot()
                .into_iter()
                .filter(|m| m.is_failed())
                .filter_map(|m| m.local_id)
                .collect();
            for local_id in failed {
                if let Err(e) = view.retry(&local_id).await {
                    tracing::warn!("retry failed: {e}");
                }
            }
            continue;
        }
        match view.send(line).await {
            Ok(_) | Err(ChatError::EmptyMessage) => {}
            Err(e) => tracing::warn!("{e}"),
        }
    }

    printer.abort();
    session.manager().disconnect().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let store = FileIdentityStore::default_location()?;
    if let Some(user) = &args.user {
        store.save(&UserId::new(user.as_str()))?;
    }
    let session = Session::from_store(Arc::new(store), config)?;

    if args.list_rooms {
        return list_rooms(&session).await;
    }

    match session.connect().await {
        Ok(connected) => tracing::info!(
            user = %connected.user_id,
            generation = connected.generation,
            "connected to hub"
        ),
        Err(ConnectError::MissingIdentity) => {
            bail!("no user id stored; run once with --user <id>")
        }
        // Retried in the background
        Err(e) => tracing::warn!("hub not reachable yet: {e}"),
    }

    let view = match (&args.peer, &args.room) {
        (Some(peer), None) => session.open_direct(UserId::new(peer.as_str())).await?,
        (None, Some(room)) => session.open_room(RoomId::new(room.as_str())).await?,
        _ => bail!("pass --peer <user id> or --room <room id>"),
    };
    tracing::info!("opened {}", view.key());
    chat(&session, view).await
}
