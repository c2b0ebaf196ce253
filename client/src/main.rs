use anyhow::Result;
use clap::Parser;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::{mpsc, oneshot},
    time::Duration,
};

use party_client::{
    constants::{SyncTimings, LOCAL_WS_URL, VERSION},
    invite::{build_invite_url, parse_invite_url},
    protocol::ProgramId,
    session::{run_session, PartyConfig, PartyStatus, SessionEnd, UserCommand},
    sync::SyncClient,
    utils::{format_time, parse_time},
};

#[derive(Parser, Debug)]
#[command(name = "party-client")]
#[command(about = "Watch a stream in sync with everyone else in a room", long_about = None)]
struct Args {
    /// Room to join
    #[arg(short = 'r', long, required_unless_present = "invite")]
    room: Option<String>,

    /// Invite link (party://join?room=...&program=...)
    #[arg(short = 'i', long)]
    invite: Option<String>,

    /// Program to start watching once joined
    #[arg(short = 'p', long)]
    program: Option<String>,

    /// Name shown next to chat messages
    #[arg(short = 'u', long, default_value = "guest")]
    user: String,

    /// Relay websocket URL
    #[arg(short = 's', long, env = "PARTY_SERVER_URL", default_value = LOCAL_WS_URL)]
    server: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "party_client=debug,info".into()),
        )
        .init();

    let args = Args::parse();
    let invite = match args.invite.as_deref() {
        Some(link) => Some(
            parse_invite_url(link).ok_or_else(|| anyhow::anyhow!("Invalid invite link: {link}"))?,
        ),
        None => None,
    };

    let room_id = args
        .room
        .or_else(|| invite.as_ref().map(|i| i.room_id.clone()))
        .ok_or_else(|| anyhow::anyhow!("No room given"))?;
    let initial_program = args
        .program
        .map(ProgramId::new)
        .or_else(|| invite.and_then(|i| i.program));

    tracing::info!("party-client {} joining room {}", VERSION, room_id);
    println!(
        "Invite others with: {}",
        build_invite_url(&room_id, initial_program.as_ref())
    );
    println!("Commands: play | pause | seek <time> | load <program> | say <text> | status | quit");

    let (input_tx, input_rx) = mpsc::unbounded_channel::<UserCommand>();
    tokio::spawn(read_user_input(input_tx));

    let config = PartyConfig {
        room_id,
        user: args.user,
        timings: SyncTimings::from_env(),
        initial_program,
    };
    run_connection_loop(args.server, config, input_rx).await;
    Ok(())
}

async fn run_connection_loop(
    server_url: String,
    mut config: PartyConfig,
    mut input_rx: mpsc::UnboundedReceiver<UserCommand>,
) {
    let client = SyncClient::new();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        tracing::info!("Connecting to relay (attempt {attempt})...");

        let session_config = config.clone();
        // Only the first successful session announces the initial program
        match run_session(&client, &server_url, session_config, &mut input_rx).await {
            Ok(SessionEnd::Quit) => {
                tracing::info!("Leaving watch party");
                return;
            }
            Ok(SessionEnd::Disconnected) => {
                config.initial_program = None;
                attempt = 0;
            }
            Err(e) => {
                tracing::warn!("Failed to connect to relay at {}: {:#}", server_url, e);
            }
        }

        let capped_attempt = attempt.clamp(1, 6);
        let delay = Duration::from_secs(5 * capped_attempt as u64);
        tracing::info!("Reconnecting in {}s", delay.as_secs());
        tokio::time::sleep(delay).await;
    }
}

async fn read_user_input(tx: mpsc::UnboundedSender<UserCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                let _ = tx.send(UserCommand::Quit);
                return;
            }
            Err(e) => {
                tracing::warn!("Failed to read input: {}", e);
                let _ = tx.send(UserCommand::Quit);
                return;
            }
        };

        let command = match parse_input(&line) {
            Ok(Some(Input::Command(command))) => command,
            Ok(Some(Input::Status)) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                if tx.send(UserCommand::Status(reply_tx)).is_err() {
                    return;
                }
                match reply_rx.await {
                    Ok(status) => println!("{}", status_line(&status)),
                    Err(_) => println!("Not connected"),
                }
                continue;
            }
            Ok(None) => continue,
            Err(message) => {
                println!("{message}");
                continue;
            }
        };

        let quitting = matches!(command, UserCommand::Quit);
        if tx.send(command).is_err() || quitting {
            return;
        }
    }
}

#[derive(Debug)]
enum Input {
    Command(UserCommand),
    Status,
}

fn parse_input(line: &str) -> Result<Option<Input>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (verb, rest) = line
        .split_once(char::is_whitespace)
        .map(|(verb, rest)| (verb, rest.trim()))
        .unwrap_or((line, ""));

    let command = match verb {
        "play" => UserCommand::Play,
        "pause" => UserCommand::Pause,
        "seek" => UserCommand::Seek(
            parse_time(rest).ok_or_else(|| format!("Cannot read position '{rest}'"))?,
        ),
        "load" if !rest.is_empty() => UserCommand::Load(ProgramId::new(rest)),
        "say" if !rest.is_empty() => UserCommand::Say(rest.to_string()),
        "status" => return Ok(Some(Input::Status)),
        "quit" | "exit" => UserCommand::Quit,
        other => return Err(format!("Unknown command '{other}'")),
    };
    Ok(Some(Input::Command(command)))
}

fn status_line(status: &PartyStatus) -> String {
    let program = status
        .sync
        .current_program
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "nothing".to_string());
    let position = status
        .position
        .map(format_time)
        .unwrap_or_else(|| "--:--".to_string());
    let membership = match (status.connected, status.joined, status.client_id) {
        (false, _, _) => ", offline".to_string(),
        (true, true, Some(id)) => format!(", you are {id}"),
        (true, _, _) => ", not joined".to_string(),
    };
    format!(
        "Room {} ({} members{}): {} at {} [{}]",
        status.room_id,
        status.members,
        membership,
        program,
        position,
        if status.playing { "playing" } else { "paused" }
    )
}
