// Infinichat command-line client
// A thin consumer of the engine: connects, prints session and conversation
// events, and turns stdin commands into protocol calls.

use anyhow::{bail, Result};
use clap::Parser;
use log::warn;
use std::env;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

mod config;
mod utils;

use infinichat::{
    ChatClient, ClientEvent, ConnectionEvent, ConnectionManager, ConversationManager,
    FontOptions, UserStatus, DEFAULT_PORT,
};

/// Command line arguments for Infinichat
#[derive(Parser, Debug)]
#[command(author, version, about = "Infinichat: a CLI client for the Infinichat protocol.")]
struct Args {
    /// Server hostname; falls back to the saved configuration
    #[arg(long)]
    server: Option<String>,

    /// Server port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Account name; falls back to the saved configuration
    #[arg(long)]
    username: Option<String>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    utils::setup_logging(args.verbose);

    let saved = config::load_config().unwrap_or_else(|e| {
        warn!("could not load configuration: {}", e);
        None
    });

    let server = match args.server.or_else(|| saved.as_ref().map(|c| c.server.clone())) {
        Some(server) => server,
        None => {
            eprintln!("Enter server hostname:");
            utils::read_line()?
        }
    };
    let username = match args.username.or_else(|| saved.as_ref().map(|c| c.username.clone())) {
        Some(username) => username,
        None => {
            eprintln!("Enter username:");
            utils::read_line()?
        }
    };
    let password = match env::var("INFINICHAT_PASSWORD") {
        Ok(password) => password,
        Err(_) => {
            eprintln!("Enter password:");
            utils::read_line()?
        }
    };

    if let Err(e) = config::save_config(&config::ClientConfig {
        server: server.clone(),
        port: args.port,
        username: username.clone(),
    }) {
        warn!("could not save configuration: {}", e);
    }

    let client = ChatClient::new();
    let _conversations = ConversationManager::new(client.clone());
    let connection = ConnectionManager::new(client.clone());

    tokio::spawn(print_client_events(client.subscribe()));
    tokio::spawn(print_connection_events(connection.subscribe()));

    println!("Connecting to {}:{}...", server, args.port);
    let reply = connection.connect(&server, args.port, &username, &password).await?;
    if !reply.success() {
        bail!("login failed: {} {}", reply.code, reply.message);
    }

    client.list_friends().await?;
    client.list_groups().await?;

    print_help();
    let font = FontOptions::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(3, ' ');
        match (parts.next().unwrap_or_default(), parts.next(), parts.next()) {
            ("/quit", _, _) => break,
            ("/friends", _, _) => {
                for friend in client.friends() {
                    println!("  {} ({}) - {}", friend.display_name, friend.name, friend.status);
                }
            }
            ("/groups", _, _) => {
                for group in client.groups() {
                    println!("  {} ({}) - {} member(s)", group.display_name, group.name, group.members.len());
                }
            }
            ("/msg", Some(to), Some(text)) => {
                if let Err(e) = client.chat_user(to, &font, text, None).await {
                    eprintln!("send failed: {}", e);
                }
            }
            ("/gmsg", Some(to), Some(text)) => {
                if let Err(e) = client.chat_group(to, &font, text, None).await {
                    eprintln!("send failed: {}", e);
                }
            }
            ("/add", Some(name), _) => {
                let reply = client.add_friend(name).await?;
                println!("{} {}", reply.code, reply.message);
            }
            ("/status", Some(raw), _) => match parse_status(raw) {
                Some(status) => {
                    let reply = client.change_status(status).await?;
                    println!("{} {}", reply.code, reply.message);
                }
                None => eprintln!("unknown status: {}", raw),
            },
            ("/name", Some(first), rest) => {
                let display_name = match rest {
                    Some(rest) => format!("{} {}", first, rest),
                    None => first.to_string(),
                };
                let reply = client.change_display_name(&display_name).await?;
                println!("{} {}", reply.code, reply.message);
            }
            _ => print_help(),
        }
    }

    client.log_out(Some("client quit")).await?;
    Ok(())
}

fn parse_status(raw: &str) -> Option<UserStatus> {
    match raw.to_ascii_lowercase().as_str() {
        "available" => Some(UserStatus::Available),
        "away" => Some(UserStatus::Away),
        "busy" => Some(UserStatus::Busy),
        "offline" => Some(UserStatus::Offline),
        _ => None,
    }
}

fn print_help() {
    println!("Commands:");
    println!("  /msg <user> <text>     send a direct message");
    println!("  /gmsg <group> <text>   send a group message");
    println!("  /add <user>            add a friend");
    println!("  /status <status>       change status (available/away/busy/offline)");
    println!("  /name <display name>   change display name");
    println!("  /friends               list friends");
    println!("  /groups                list groups");
    println!("  /quit                  log out and exit");
}

async fn print_client_events(mut events: broadcast::Receiver<ClientEvent>) {
    loop {
        match events.recv().await {
            Ok(ClientEvent::UserChat { message }) => {
                println!(
                    "[{}] {}: {}",
                    message.timestamp.format("%H:%M:%S"),
                    message.sender.display_name,
                    message.text
                );
            }
            Ok(ClientEvent::GroupChat { group, message }) => {
                println!(
                    "[{}] {} via {}: {}",
                    message.timestamp.format("%H:%M:%S"),
                    message.sender.display_name,
                    group.display_name,
                    message.text
                );
            }
            Ok(ClientEvent::UserDetails { added, changed }) => {
                for user in added.iter().chain(changed.iter()) {
                    println!("* {} is {}", user.display_name, user.status);
                }
            }
            Ok(ClientEvent::UserTyping { user, starting }) => {
                if starting {
                    println!("* {} is typing...", user.display_name);
                }
            }
            Ok(ClientEvent::StreamError { error }) => {
                eprintln!("! connection error: {}", error);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn print_connection_events(mut events: broadcast::Receiver<ConnectionEvent>) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::SlowConnect) => println!("Still connecting, please wait..."),
            Ok(ConnectionEvent::Retrying { attempt, delay }) => {
                println!("Connection lost; retry {} in {:?}...", attempt, delay);
            }
            Ok(ConnectionEvent::Lost) => println!("Connection lost; trying to reconnect..."),
            Ok(ConnectionEvent::Reconnected) => println!("Reconnected."),
            Ok(ConnectionEvent::Failed { reason }) => println!("Connection failed: {}", reason),
            Ok(ConnectionEvent::Connected) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
