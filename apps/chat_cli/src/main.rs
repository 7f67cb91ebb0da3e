use std::{io::Write, sync::Arc};

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, ClientEvent, DurableSessionVault, NotificationPermission, NotificationSink,
    RealtimeClient, WebSocketConnector,
};
use shared::domain::{Message, MessageId, Username};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    /// Overrides `server_url` from client.toml / APP__SERVER_URL.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    session_database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Signup {
        username: String,
        #[arg(long)]
        password: String,
    },
    Login {
        username: String,
        #[arg(long)]
        password: String,
    },
    Logout,
    Users,
    Chat {
        peer: String,
        /// Show desktop-style notifications for other conversations.
        #[arg(long)]
        notify: bool,
    },
    Search {
        query: String,
        #[arg(long)]
        with: Option<String>,
    },
}

/// Rings the terminal bell and prints notifications to stderr.
struct TerminalNotifier;

impl NotificationSink for TerminalNotifier {
    fn play_sound(&self) {
        print!("\x07");
        let _ = std::io::stdout().flush();
    }

    fn show(&self, title: &str, body: &str) {
        eprintln!("[{title}] {body}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings();
    if let Some(server_url) = cli.server_url {
        settings.server_url = server_url.trim_end_matches('/').to_string();
    }
    if let Some(database_url) = cli.session_database_url {
        settings.session_database_url = database_url;
    }

    let vault = DurableSessionVault::initialize(&settings.session_database_url).await?;
    let client = RealtimeClient::new_with_dependencies(
        settings,
        Arc::new(WebSocketConnector),
        Arc::new(TerminalNotifier),
        vault,
    );

    match cli.command {
        Command::Signup { username, password } => {
            client.signup(&username, &password).await?;
            println!("account created for {username}");
        }
        Command::Login { username, password } => {
            client.login(&username, &password).await?;
            println!("logged in as {username}");
        }
        Command::Logout => {
            client.restore_session().await?;
            client.logout().await;
            println!("logged out");
        }
        Command::Users => {
            require_session(&client).await?;
            client.refresh_unread_counts().await?;
            let counts = client.unread_counts().await;
            for user in client.refresh_roster().await? {
                let label = client
                    .presence_label(&user.username)
                    .await
                    .unwrap_or_default();
                let unread = counts.get(&user.username).copied().unwrap_or(0);
                println!("{:<20} {label:<28} unread: {unread}", user.username.as_str());
            }
        }
        Command::Chat { peer, notify } => {
            require_session(&client).await?;
            if notify {
                client
                    .set_notification_permission(NotificationPermission::Granted)
                    .await;
            }
            run_chat(&client, Username::from(peer)).await?;
        }
        Command::Search { query, with } => {
            require_session(&client).await?;
            let with = with.map(Username::from);
            for message in client.search_messages(&query, with.as_ref()).await? {
                println!("{}", render(&message));
            }
        }
    }

    Ok(())
}

async fn require_session(client: &Arc<RealtimeClient>) -> Result<()> {
    if client.restore_session().await? {
        Ok(())
    } else {
        Err(anyhow!("not logged in; run `chat_cli login <username> --password ...` first"))
    }
}

async fn run_chat(client: &Arc<RealtimeClient>, peer: Username) -> Result<()> {
    client.refresh_roster().await?;
    if let Err(err) = client.refresh_unread_counts().await {
        warn!("unread counts unavailable: {err}");
    }

    let mut events = client.subscribe_events();
    client
        .select_peer(&peer)
        .await
        .with_context(|| format!("failed to open conversation with {peer}"))?;
    let mut shown = client.conversation(&peer).await.unwrap_or_default();
    for message in &shown {
        println!("{}", render(message));
    }
    println!("-- /edit <id> <text>, /delete <id>, /react <id> <emoji>, /resync, /quit --");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match handle_line(client, line.trim()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(err) => eprintln!("error: {err}"),
                }
            }
            event = events.recv() => {
                let Ok(event) = event else { continue };
                match event {
                    ClientEvent::ConversationUpdated { peer: updated } if updated == peer => {
                        let current = client.conversation(&peer).await.unwrap_or_default();
                        print_changes(&shown, &current);
                        shown = current;
                    }
                    ClientEvent::TypingChanged { peer: typing, is_typing } if typing == peer => {
                        if is_typing {
                            println!("   {peer} is typing...");
                        }
                    }
                    ClientEvent::PresenceChanged(user) if user.username == peer => {
                        if let Some(label) = client.presence_label(&peer).await {
                            println!("   {peer}: {label}");
                        }
                    }
                    ClientEvent::ConnectionChanged(state) => println!("   connection: {state:?}"),
                    ClientEvent::LoggedOut { forced: true } => {
                        eprintln!("session expired; log in again");
                        break;
                    }
                    ClientEvent::Error(message) => eprintln!("error: {message}"),
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

/// Returns `Ok(false)` when the user asked to leave.
async fn handle_line(client: &Arc<RealtimeClient>, line: &str) -> Result<bool> {
    let mut parts = line.splitn(3, ' ');
    match parts.next() {
        Some("/quit") => return Ok(false),
        Some("/resync") => client.resync().await?,
        Some("/delete") => {
            let id = parts.next().context("usage: /delete <id>")?;
            client.delete_message(MessageId::from(id)).await?;
        }
        Some("/edit") => {
            let id = parts.next().context("usage: /edit <id> <text>")?;
            let text = parts.next().unwrap_or_default();
            client.edit_message(MessageId::from(id), text).await?;
        }
        Some("/react") => {
            let id = parts.next().context("usage: /react <id> <emoji>")?;
            let emoji = parts.next().unwrap_or_default();
            client.react_to_message(MessageId::from(id), emoji).await?;
        }
        _ if line.is_empty() => {}
        _ => {
            // Stdin only yields whole lines, so the indicator is raised and
            // retracted around each send.
            client.input_changed().await;
            client.send_message(line).await?;
        }
    }
    Ok(true)
}

fn print_changes(before: &[Message], after: &[Message]) {
    for (index, message) in after.iter().enumerate() {
        if before.get(index) != Some(message) {
            println!("{}", render(message));
        }
    }
}

fn render(message: &Message) -> String {
    let id = message
        .id
        .as_ref()
        .map(MessageId::as_str)
        .unwrap_or("pending");
    let at = message.sent_at.with_timezone(&Local).format("%H:%M");
    let body = message.display_content().unwrap_or("(deleted)");
    let mut line = format!("[{at}] {id:>8} {}: {body}", message.sender);
    if message.edited && !message.deleted {
        line.push_str(" (edited)");
    }
    if !message.reactions.is_empty() {
        let reactions: Vec<_> = message
            .reactions
            .iter()
            .map(|(user, emoji)| format!("{emoji} {user}"))
            .collect();
        line.push_str(&format!("  [{}]", reactions.join(", ")));
    }
    if message.read {
        line.push_str(" ✓");
    }
    line
}
