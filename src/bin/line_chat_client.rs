//! Interactive chat client
//!
//! Reads commands from stdin and prints what the server sends:
//! - `/nickname <name>` changes the nickname
//! - `/allusers` prints the user directory
//! - `/private <id> <text>` sends a private message
//! - `/exit` leaves the chat
//! - anything else is sent as a chat line

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use line_chat::config::{load_toml, ClientArgs};
use line_chat::message::EXIT_COMMAND;
use line_chat::{
    ClientConfig, ClientSession, ConnectionId, ConnectionStatus, Directory, EventSink,
    ServerLine,
};

/// Pause between connection attempts
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Latest directory received from the server
#[derive(Default)]
struct DirectoryView {
    current: Mutex<Directory>,
    /// Print the next directory reply (set by `/allusers`)
    show_next: AtomicBool,
}

impl DirectoryView {
    fn update(&self, directory: Directory) {
        if self.show_next.swap(false, Ordering::SeqCst) {
            print_directory(&directory);
        }
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = directory;
    }

    fn name_of(&self, id: ConnectionId) -> Option<String> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .name_of(id)
            .map(str::to_string)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = ClientArgs::parse();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    if args.nickname.is_none() && load_toml(args.config.as_deref())?.client.nickname.is_none() {
        print!("Enter your nickname: ");
        std::io::stdout().flush()?;
        args.nickname = stdin.next_line().await?;
    }
    let config = ClientConfig::from_args(args)?;

    // Notices are rendered below; keep tracing for everything else
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "line_chat={},line_chat::events=off",
                config.log_level
            ))
        }))
        .with_writer(std::io::stderr)
        .init();

    let (events, mut event_rx) = EventSink::channel();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            println!("{}", event.full_message());
        }
    });

    let view = Arc::new(DirectoryView::default());

    // A session connects once; every attempt gets a fresh one
    loop {
        let session = ClientSession::new(config.clone(), events.clone());
        let outcome = match session.start(render_lines(&view)).await {
            Ok(()) => chat(&session, &view, &mut stdin).await?,
            // Already reported through the event sink
            Err(_) => Outcome::Disconnected,
        };
        if outcome == Outcome::Left {
            break;
        }

        if !wait_before_retry(&mut stdin).await? {
            break;
        }
    }

    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    /// The user typed `/exit` or closed stdin
    Left,
    /// The connection failed or the server went away
    Disconnected,
}

/// Received-line callback that prints what the server sends
fn render_lines(view: &Arc<DirectoryView>) -> impl FnMut(String) + Send + 'static {
    let view = Arc::clone(view);
    move |line: String| match ServerLine::parse(&line) {
        Ok(ServerLine::Directory(directory)) => view.update(directory),
        Ok(ServerLine::Private(message)) => println!(
            "Private message from {}: {}",
            message.display_name(),
            message.body
        ),
        Ok(ServerLine::Notice(text)) => println!("{}", text),
        Err(e) => warn!("Unreadable line from server: {}", e),
    }
}

/// Forward stdin to the session until the user leaves or the connection drops
async fn chat(
    session: &ClientSession,
    view: &DirectoryView,
    stdin: &mut Lines<BufReader<Stdin>>,
) -> std::io::Result<Outcome> {
    let mut status = session.watch_status();
    loop {
        tokio::select! {
            _ = status.wait_for(|status| *status == ConnectionStatus::Disconnected) => {
                return Ok(Outcome::Disconnected);
            }
            line = stdin.next_line() => match line? {
                Some(line) => {
                    if !handle_input(session, view, line.trim()) {
                        return Ok(Outcome::Left);
                    }
                }
                None => {
                    session.exit();
                    return Ok(Outcome::Left);
                }
            },
        }
    }
}

/// Sleep before the next connection attempt, still honouring `/exit`
///
/// Returns `false` if the user left while waiting.
async fn wait_before_retry(stdin: &mut Lines<BufReader<Stdin>>) -> std::io::Result<bool> {
    let retry = tokio::time::sleep(RECONNECT_DELAY);
    tokio::pin!(retry);

    loop {
        tokio::select! {
            _ = &mut retry => return Ok(true),
            line = stdin.next_line() => match line?.as_deref().map(str::trim) {
                None | Some(EXIT_COMMAND) => return Ok(false),
                Some(_) => println!("Not connected to the server; message not sent."),
            },
        }
    }
}

/// Act on one line of user input. Returns `false` once the user has left.
fn handle_input(session: &ClientSession, view: &DirectoryView, input: &str) -> bool {
    if input.is_empty() {
        return true;
    }

    let (command, rest) = input.split_once(' ').unwrap_or((input, ""));
    let rest = rest.trim();

    // Send failures are already reported through the event sink
    let _ = match command {
        EXIT_COMMAND => {
            session.exit();
            return false;
        }
        "/nickname" if rest.is_empty() => {
            println!("Usage: /nickname <name>");
            return true;
        }
        "/nickname" => session.change_nickname(rest),
        "/allusers" => {
            view.show_next.store(true, Ordering::SeqCst);
            session.request_directory()
        }
        "/private" => {
            let parsed = rest
                .split_once(' ')
                .and_then(|(id, body)| Some((id.parse::<ConnectionId>().ok()?, body.trim())));
            let Some((target, body)) = parsed else {
                println!("Usage: /private <user id> <message>");
                return true;
            };
            session.send_private(target, body, view.name_of(target))
        }
        _ => session.send(input),
    };

    true
}

fn print_directory(directory: &Directory) {
    if directory.is_empty() {
        println!("No users connected.");
        return;
    }

    println!("{:<10}Nickname", "User ID");
    for entry in &directory.entries {
        println!("{:<10}{}", entry.id.0, entry.name);
    }
}
