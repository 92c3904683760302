// meetlink — Meeting Client CLI
//
// Cross-platform (macOS, Linux, Windows) command-line client: joins a meeting
// over the relay, prints roster and chat activity, and sends chat from stdin.

mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use config::CliConfig;
use meetlink_core::media::{
    LocalTrack, MeetingDelegate, Participant, PeerManager, RemoteStream, RtcEngine, TrackKind,
};
use meetlink_core::{
    ChatDelegate, ChatMessage, ChatTransport, Credentials, HttpHistoryLoader, Identity,
    SessionState, WsConnector,
};

#[derive(Parser)]
#[command(name = "meetlink")]
#[command(about = "MeetLink — resilient meeting client", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a meeting (media signaling + chat)
    Join {
        meeting_id: String,
        /// Display name override (persisted)
        #[arg(short, long)]
        name: Option<String>,
        /// Bearer token for chat and history
        #[arg(long)]
        token: Option<String>,
        /// Skip media; chat only
        #[arg(long)]
        chat_only: bool,
    },
    /// Show or update configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Set {
        /// Relay WebSocket base, e.g. ws://meet.example.net:8080
        #[arg(long)]
        server: Option<String>,
        /// History HTTP base, e.g. http://meet.example.net:8080
        #[arg(long)]
        http: Option<String>,
        /// Display name
        #[arg(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Config { action } => run_config(action),
        Commands::Join {
            meeting_id,
            name,
            token,
            chat_only,
        } => run_join(meeting_id, name, token, chat_only).await,
    }
}

fn run_config(action: Option<ConfigAction>) -> Result<()> {
    let mut config = CliConfig::load_or_create()?;
    match action {
        None | Some(ConfigAction::Show) => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Some(ConfigAction::Set { server, http, name }) => {
            if let Some(server) = server {
                config.core.ws_base_url = server;
            }
            if let Some(http) = http {
                config.core.http_base_url = http;
            }
            if let Some(name) = name {
                config.display_name = Some(name);
            }
            config.save()?;
            println!("{}", "configuration saved".green());
        }
    }
    Ok(())
}

async fn run_join(
    meeting_id: String,
    name: Option<String>,
    token: Option<String>,
    chat_only: bool,
) -> Result<()> {
    let mut config = CliConfig::load_or_create()?;
    if let Some(name) = name {
        config.display_name = Some(name);
        config.save()?;
    }
    let display_name = config
        .display_name
        .clone()
        .unwrap_or_else(|| format!("guest-{}", &config.user_id[..8]));
    let identity = Identity {
        user_id: config.user_id.clone(),
        display_name,
    };
    let credentials = Credentials {
        identity: identity.clone(),
        token: token.unwrap_or_else(|| "dev-token".to_string()),
    };

    println!(
        "{}",
        format!(
            "joining {} as {}",
            meeting_id.bold(),
            identity.display_name.bold()
        )
    );

    let connector = Arc::new(WsConnector);
    let chat = ChatTransport::open(
        &config.core,
        &meeting_id,
        credentials,
        Arc::new(HttpHistoryLoader::new(config.core.http_base_url.clone())),
        connector.clone(),
        Arc::new(ChatPrinter {
            self_id: config.user_id.clone(),
        }),
    )
    .await?;

    let manager = if chat_only {
        None
    } else {
        // Track descriptors stand in for real capture devices; acquisition
        // is outside the core.
        let tracks = vec![
            LocalTrack::audio("default-microphone"),
            LocalTrack::video("default-camera"),
        ];
        let engine = Arc::new(RtcEngine::new(config.core.ice_servers.clone()));
        let delegate = Arc::new(MeetingPrinter {
            max_attempts: config.core.max_reconnect_attempts,
        });
        match PeerManager::join(
            &config.core,
            &meeting_id,
            identity.clone(),
            tracks,
            engine,
            connector.clone(),
            delegate,
        )
        .await
        {
            Ok(manager) => Some(manager),
            Err(e) => {
                eprintln!("{} {e} — continuing chat-only", "media join failed:".red());
                None
            }
        }
    };

    print_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(command) = line.strip_prefix('/') {
            if !handle_command(command, manager.as_ref()).await {
                break;
            }
        } else {
            match chat.send(line, None).await {
                Ok(_) => {}
                Err(e) => eprintln!("{} {e}", "send failed:".red()),
            }
        }
    }

    if let Some(manager) = &manager {
        manager.leave().await;
    }
    chat.close().await;
    println!("{}", "left meeting".dimmed());
    Ok(())
}

/// Returns false when the session should end.
async fn handle_command(command: &str, manager: Option<&PeerManager>) -> bool {
    let mut parts = command.split_whitespace();
    match parts.next() {
        Some("quit") | Some("q") => return false,
        Some("help") => print_help(),
        Some("who") => match manager {
            Some(manager) => {
                let mut roster = manager.participants();
                roster.sort_by(|a, b| a.display_name.cmp(&b.display_name));
                if roster.is_empty() {
                    println!("{}", "nobody else is here yet".dimmed());
                }
                for p in roster {
                    let mic = if p.muted { "muted" } else { "mic on" };
                    let cam = if p.video_off { "camera off" } else { "camera on" };
                    println!("  {} ({mic}, {cam})", p.display_name.bold());
                }
            }
            None => println!("{}", "chat-only session".dimmed()),
        },
        Some("mute") | Some("unmute") => {
            if let Some(manager) = manager {
                let enabled = command.starts_with("unmute");
                if let Err(e) = manager.toggle_track(TrackKind::Audio, enabled).await {
                    eprintln!("{} {e}", "toggle failed:".red());
                }
            }
        }
        Some("video") => {
            if let Some(manager) = manager {
                let enabled = matches!(parts.next(), Some("on"));
                if let Err(e) = manager.toggle_track(TrackKind::Video, enabled).await {
                    eprintln!("{} {e}", "toggle failed:".red());
                }
            }
        }
        Some("share") => {
            if let Some(manager) = manager {
                let label = parts.next().unwrap_or("screen:0").to_string();
                if let Err(e) = manager
                    .replace_local_tracks(vec![LocalTrack::video(label)])
                    .await
                {
                    eprintln!("{} {e}", "share failed:".red());
                }
            }
        }
        Some("camera") => {
            if let Some(manager) = manager {
                if let Err(e) = manager
                    .replace_local_tracks(vec![LocalTrack::video("default-camera")])
                    .await
                {
                    eprintln!("{} {e}", "camera failed:".red());
                }
            }
        }
        Some(other) => println!("unknown command: /{other} (try /help)"),
        None => {}
    }
    true
}

fn print_help() {
    println!(
        "{}",
        "type to chat · /who /mute /unmute /video on|off /share [label] /camera /quit".dimmed()
    );
}

fn format_time(timestamp: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp)
        .map(|t| t.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string())
}

// ============================================================================
// DELEGATES
// ============================================================================

struct MeetingPrinter {
    max_attempts: u32,
}

impl MeetingDelegate for MeetingPrinter {
    fn participant_joined(&self, participant: &Participant) {
        println!("{} {} joined", "•".green(), participant.display_name.bold());
    }

    fn participant_left(&self, participant_id: &str) {
        println!("{} {} left", "•".yellow(), participant_id);
    }

    fn stream_received(&self, participant_id: &str, stream: &RemoteStream) {
        println!(
            "{} media from {} ({} track(s))",
            "▸".cyan(),
            participant_id,
            stream.tracks.len()
        );
    }

    fn presence_changed(&self, participant: &Participant) {
        let mic = if participant.muted { "muted" } else { "unmuted" };
        let cam = if participant.video_off {
            "camera off"
        } else {
            "camera on"
        };
        println!(
            "{} {} is now {mic}, {cam}",
            "•".dimmed(),
            participant.display_name
        );
    }

    fn connection_state_changed(&self, state: SessionState, attempt: u32) {
        match state {
            SessionState::Open => println!("{}", "signaling connected".green()),
            SessionState::Disconnected { exhausted: true } => println!(
                "{}",
                "signaling gave up — rejoin to retry".red()
            ),
            SessionState::Disconnected { exhausted: false } if attempt > 0 => println!(
                "{}",
                format!("signaling lost — reconnecting (attempt {attempt}/{})", self.max_attempts)
                    .yellow()
            ),
            _ => {}
        }
    }
}

struct ChatPrinter {
    self_id: String,
}

impl ChatDelegate for ChatPrinter {
    fn connection_state_changed(&self, state: SessionState, attempt: u32) {
        match state {
            SessionState::Open => println!("{}", "chat connected".green()),
            SessionState::Disconnected { exhausted: true } => {
                println!("{}", "chat gave up — rejoin to retry".red());
            }
            SessionState::Disconnected { exhausted: false } if attempt > 0 => {
                println!("{}", format!("chat reconnecting (attempt {attempt})").yellow());
            }
            _ => {}
        }
    }

    fn message_appended(&self, message: &ChatMessage) {
        let time = format_time(message.timestamp).dimmed();
        if message.sender_id == self.self_id {
            println!("{time} {} {}", "you:".dimmed(), message.content);
        } else {
            println!(
                "{time} {} {}",
                format!("{}:", message.sender_name).bold(),
                message.content
            );
        }
        if let Some(attachment) = &message.attachment {
            println!("       {} {}", "attachment:".dimmed(), attachment.url);
        }
    }

    fn history_loaded(&self, total: usize) {
        println!("{}", format!("history loaded ({total} messages)").dimmed());
    }

    fn authentication_failed(&self, reason: &str) {
        println!("{} {reason}", "chat authentication failed:".red());
    }
}
