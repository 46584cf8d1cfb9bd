/// Terminal chat client
use chatku_core::auth::HttpCredentials;
use chatku_core::chat::{ConnectionState, Message, Roster, Session};
use chatku_core::realtime::TcpTransport;
use chatku_core::validation::validate_display_name;
use chatku_core::{ClientIdentity, Config, ProfileStore};
use colored::*;
use std::env;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let mut profile = ProfileStore::load_or_create(&config.data_dir())?;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    let identity = match profile.identity() {
        Some(identity) => identity,
        None => {
            let Some(name) = ask_name(&mut stdin).await? else {
                return Ok(());
            };
            profile.set_display_name(&name)?;
            ClientIdentity::new(profile.client_id(), name)
        }
    };

    println!(
        "{} Joining {} as {}",
        "→".cyan(),
        config.channel_name.cyan(),
        identity.display_name.bright_white().bold()
    );

    let credentials = Arc::new(HttpCredentials::new(config.auth_url.clone(), config.request_timeout));
    let transport = Arc::new(TcpTransport::new(&config, credentials));
    let session = Arc::new(Session::join(transport, identity, &config).await?);

    let watchers = spawn_watchers(&session).await;
    print_help();

    while let Some(line) = stdin.next_line().await? {
        match Command::parse(&line) {
            Command::Empty => {}
            Command::Quit => break,
            Command::Who => print_roster(&session.roster()),
            Command::Help => print_help(),
            Command::Forget => {
                profile.clone().clear()?;
                println!("{} Profile cleared; you will be asked for a name next time", "✓".green());
            }
            Command::Typing => match session.notify_typing().await {
                Ok(true) => println!("{} Others now see you typing", "…".dimmed()),
                Ok(false) => {}
                Err(e) => eprintln!("{} {}", "✗".red().bold(), e.to_string().red()),
            },
            Command::Unknown(command) => {
                eprintln!("{} Unknown command: {}", "✗".red().bold(), command.red());
            }
            Command::Say(text) => {
                if let Err(e) = session.send(&text).await {
                    eprintln!("{} {}", "✗".red().bold(), e.to_string().red());
                }
            }
        }
    }

    session.leave().await;
    for watcher in watchers {
        watcher.abort();
    }
    println!("{} Bye", "✓".green());
    Ok(())
}

/// One line of stdin
#[derive(Debug, PartialEq)]
enum Command {
    Empty,
    Quit,
    Who,
    Help,
    Forget,
    /// Announce typing; line input has no keystrokes to watch
    Typing,
    Unknown(String),
    Say(String),
}

impl Command {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        match line {
            "" => Command::Empty,
            "/quit" => Command::Quit,
            "/who" => Command::Who,
            "/help" => Command::Help,
            "/forget" => Command::Forget,
            "/typing" => Command::Typing,
            _ if line.starts_with('/') => Command::Unknown(line.to_string()),
            text => Command::Say(text.to_string()),
        }
    }
}

async fn ask_name(stdin: &mut Lines<BufReader<Stdin>>) -> anyhow::Result<Option<String>> {
    loop {
        println!("{}", "What should we call you? (2-20 letters, numbers, spaces)".bright_white());
        let Some(raw) = stdin.next_line().await? else {
            return Ok(None);
        };
        match validate_display_name(&raw) {
            Ok(name) => return Ok(Some(name)),
            Err(e) => eprintln!("{} {}", "✗".red().bold(), e.to_string().red()),
        }
    }
}

fn print_help() {
    println!(
        "  Type to chat. {} lists members, {} shows you typing, {} clears your profile, {} leaves.",
        "/who".cyan(),
        "/typing".cyan(),
        "/forget".cyan(),
        "/quit".cyan()
    );
}

fn print_roster(roster: &Roster) {
    println!("{} {} online", "●".green(), roster.len());
    for member in roster.members() {
        println!("  {} {}", member.display_name.bright_white(), member.client_id.dimmed());
    }
}

fn print_message(message: &Message, own_id: &str) {
    let time = message.sent_at.with_timezone(&chrono::Local).format("%H:%M");
    let author = if message.author_id == own_id {
        message.author_name.green().bold()
    } else {
        message.author_name.cyan().bold()
    };
    println!("{} {} {}", time.to_string().dimmed(), author, message.text);
}

/// Print state, message, roster and typing changes as they happen
async fn spawn_watchers(session: &Arc<Session>) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();

    if let Some(mut states) = session.observe_state().await {
        tasks.push(tokio::spawn(async move {
            while let Some(state) = states.next().await {
                let label = match state {
                    ConnectionState::Connected => state.to_string().green(),
                    ConnectionState::Connecting => state.to_string().yellow(),
                    ConnectionState::Disconnected | ConnectionState::Failed => state.to_string().red(),
                };
                println!("{} {}", "◆".dimmed(), label);
            }
        }));
    }

    let mut feed = session.observe_messages();
    let own_id = session.identity().id.clone();
    tasks.push(tokio::spawn(async move {
        let mut printed = 0;
        loop {
            {
                let snapshot = feed.borrow_and_update();
                if !snapshot.is_loading {
                    for message in snapshot.messages.iter().skip(printed) {
                        print_message(message, &own_id);
                    }
                    printed = snapshot.messages.len();
                }
            }
            if feed.changed().await.is_err() {
                break;
            }
        }
    }));

    let mut roster = session.observe_roster();
    tasks.push(tokio::spawn(async move {
        while roster.changed().await.is_ok() {
            let count = roster.borrow_and_update().len();
            println!("{} {} online", "●".green(), count);
        }
    }));

    let mut typing = session.observe_typing_set();
    let names = session.clone();
    tasks.push(tokio::spawn(async move {
        while typing.changed().await.is_ok() {
            let ids = typing.borrow_and_update().clone();
            if ids.is_empty() {
                continue;
            }
            let roster = names.roster();
            let who: Vec<String> = ids
                .iter()
                .map(|id| {
                    roster
                        .members()
                        .iter()
                        .find(|m| &m.client_id == id)
                        .map(|m| m.display_name.clone())
                        .unwrap_or_else(|| id.clone())
                })
                .collect();
            println!("{} {} typing…", "…".dimmed(), who.join(", ").italic());
        }
    }));

    tasks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("  "), Command::Empty);
        assert_eq!(Command::parse("/typing"), Command::Typing);
        assert_eq!(Command::parse(" /who "), Command::Who);
        assert_eq!(Command::parse("/nope"), Command::Unknown("/nope".to_string()));
        assert_eq!(Command::parse("  hi there "), Command::Say("hi there".to_string()));
    }
}
