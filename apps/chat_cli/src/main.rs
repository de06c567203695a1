use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use client_core::{config::load_settings, ChatHandle, ClientEvent, SyncClient};
use shared::domain::{ConversationIdentity, Message, MessageId, MessageStatus};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::warn;
use tracing_subscriber::EnvFilter;

const HELP: &str = "\
/older              load older messages
/search <text>      search all conversations
/retry <temp-id>    resend a failed message
/edit <id> <text>   edit a message
/delete <id>        delete a message
/react <id> <emoji> add a reaction
/unreact <id> <e>   remove a reaction
/typing             signal typing
/list               list conversations
/online             list online users
/away, /back        toggle focus
/quit               exit
anything else is sent as a message";

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `server_url` from the config file.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user_id: Option<String>,
    /// Open the direct conversation with this user.
    #[arg(long, conflicts_with = "group")]
    with: Option<String>,
    #[arg(long)]
    group: Option<String>,
    #[arg(long, default_value = "class")]
    group_type: String,
}

enum Flow {
    Continue,
    Quit,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Args::parse();

    let mut settings = load_settings()?;
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(user_id) = args.user_id {
        settings.user_id = user_id;
    }
    if settings.user_id.is_empty() {
        bail!("no user id: pass --user-id or set APP__USER_ID");
    }
    let conversation = match (args.with, args.group) {
        (Some(other), None) => ConversationIdentity::direct(other),
        (None, Some(group)) => ConversationIdentity::group(group, args.group_type),
        _ => bail!("pass either --with <user> or --group <id>"),
    };

    let client = SyncClient::new(settings).context("invalid client settings")?;
    let mut events = BroadcastStream::new(client.subscribe_events());
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => print_event(&event),
                Err(err) => warn!(error = %err, "event stream lagged"),
            }
        }
    });

    client.start().await?;
    client.join_conversation(conversation.clone()).await?;
    for message in client.active_conversation_messages().await {
        print_message(&message);
    }
    println!("joined {conversation}; type a message or /help");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match run_command(&client, line.trim()).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => break,
            Err(err) => eprintln!("error: {err:#}"),
        }
    }

    client.leave_conversation().await;
    client.shutdown().await;
    Ok(())
}

async fn run_command(client: &Arc<SyncClient>, line: &str) -> Result<Flow> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match command {
        "" => {}
        "/quit" => return Ok(Flow::Quit),
        "/help" => println!("{HELP}"),
        "/older" => {
            let added = client.load_older_messages().await?;
            println!("loaded {added} older messages");
        }
        "/search" => {
            for message in client.search_messages(rest).await? {
                print_message(&message);
            }
        }
        "/retry" => {
            let sent = client.retry_message(&MessageId::from(rest)).await?;
            print_message(&sent);
        }
        "/edit" => {
            let (id, content) = rest.split_once(' ').context("usage: /edit <id> <text>")?;
            client.edit_message(&MessageId::from(id), content).await?;
        }
        "/delete" => client.delete_message(&MessageId::from(rest)).await?,
        "/react" => {
            let (id, emoji) = rest.split_once(' ').context("usage: /react <id> <emoji>")?;
            client.add_reaction(&MessageId::from(id), emoji).await?;
        }
        "/unreact" => {
            let (id, emoji) = rest
                .split_once(' ')
                .context("usage: /unreact <id> <emoji>")?;
            client.remove_reaction(&MessageId::from(id), emoji).await?;
        }
        "/typing" => client.start_typing().await,
        "/list" => {
            for state in client.conversations().await {
                let title = state.title.clone().unwrap_or_else(|| state.key().0);
                println!("{title} unread={}", state.unread_count);
            }
            println!("total unread={}", client.unread_count().await);
        }
        "/online" => {
            let users: Vec<String> = client
                .online_users()
                .await
                .into_iter()
                .map(|user| user.0)
                .collect();
            println!("online: {}", users.join(", "));
        }
        "/away" => client.set_focused(false).await?,
        "/back" => client.set_focused(true).await?,
        other if other.starts_with('/') => bail!("unknown command {other}; try /help"),
        _ => {
            client.stop_typing().await;
            let sent = client.send_message(line, None).await?;
            print_message(&sent);
        }
    }
    Ok(Flow::Continue)
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::ConnectionStateChanged(state) => println!("[connection] {state:?}"),
        ClientEvent::Notification(notification) => print_message(&notification.message),
        ClientEvent::MessageFailed { temp_id, reason } => {
            println!("[failed] {temp_id}: {reason} (/retry {temp_id})")
        }
        ClientEvent::Error(err) => eprintln!("[error] {err}"),
        _ => {}
    }
}

fn print_message(message: &Message) {
    let marker = match message.status {
        MessageStatus::Sending => "…",
        MessageStatus::Delivered => "✓",
        MessageStatus::Read => "✓✓",
        MessageStatus::Failed => "!",
    };
    let content = if message.is_deleted {
        "(deleted)"
    } else {
        message.content.as_str()
    };
    let edited = if message.is_edited { " (edited)" } else { "" };
    println!(
        "{} [{}] {}: {content}{edited} {marker}",
        message.sent_at.format("%H:%M"),
        message.id,
        message.sender_name.as_deref().unwrap_or(message.sender_id.as_str()),
    );
}
