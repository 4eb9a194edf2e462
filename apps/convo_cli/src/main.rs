use std::{collections::HashSet, path::Path, sync::Arc};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use shared::domain::{ConversationId, Credential, MessageId, UserId};
use sync_core::{
    load_settings, ConversationSession, Delivery, HttpConversationApi, HttpMediaUploader,
    MediaUpload, Message, SessionDependencies, SyncError, SyncEvent, WebSocketConnector,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: String,
    #[arg(long)]
    conversation_id: i64,
    #[arg(long)]
    user_id: i64,
    #[arg(long, env = "CONVO_TOKEN")]
    token: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();
    let settings = load_settings();
    let credential = Credential::new(args.token);

    let session = ConversationSession::new(
        ConversationId(args.conversation_id),
        UserId(args.user_id),
        credential.clone(),
        SessionDependencies {
            api: Arc::new(HttpConversationApi::new(
                args.server_url.clone(),
                credential.clone(),
                settings.page_size,
            )),
            uploader: Arc::new(HttpMediaUploader::new(args.server_url.clone(), credential)),
            connector: Arc::new(WebSocketConnector::new(args.server_url)),
        },
        settings,
    );

    let events = session.subscribe_events();
    session.open().await?;
    let printer = tokio::spawn(print_events(session.clone(), events));
    println!("commands: /older /edit <id> <text> /delete <id> /react <id> <symbol> /attach <path> /read /archive /unarchive /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Err(err) = run_command(&session, line).await {
            println!("! {err}");
        }
    }

    session.close().await;
    printer.abort();
    Ok(())
}

async fn run_command(session: &Arc<ConversationSession>, line: &str) -> Result<()> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "/older" => {
            if !session.load_older().await? {
                println!("(no older messages)");
            }
        }
        "/edit" => {
            let (id, text) = rest.split_once(' ').ok_or_else(|| anyhow!("usage: /edit <id> <text>"))?;
            session.edit_message(parse_id(id)?, text.to_string()).await?;
        }
        "/delete" => session.delete_message(parse_id(rest)?).await?,
        "/react" => {
            let (id, symbol) = rest
                .split_once(' ')
                .ok_or_else(|| anyhow!("usage: /react <id> <symbol>"))?;
            session.toggle_reaction(parse_id(id)?, symbol.trim()).await?;
        }
        "/attach" => {
            let path = Path::new(rest.trim());
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("read {}", path.display()))?;
            let filename = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "attachment".to_string());
            session
                .send_message(
                    None,
                    Some(MediaUpload {
                        filename,
                        mime_type: None,
                        bytes,
                    }),
                )
                .await?;
        }
        "/read" => session.mark_read().await,
        "/archive" => session.set_archived(true).await?,
        "/unarchive" => session.set_archived(false).await?,
        _ if command.starts_with('/') => return Err(anyhow!("unknown command {command}")),
        _ => {
            match session.send_message(Some(line.to_string()), None).await {
                Ok(_) => {}
                Err(SyncError::SendFailure { .. }) => {
                    println!("! send failed; the message is kept as failed, /delete it to discard")
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
    Ok(())
}

fn parse_id(raw: &str) -> Result<MessageId> {
    let id = raw
        .trim()
        .parse::<i64>()
        .with_context(|| format!("invalid message id {raw:?}"))?;
    Ok(MessageId(id))
}

async fn print_events(session: Arc<ConversationSession>, mut events: broadcast::Receiver<SyncEvent>) {
    let mut printed = HashSet::new();
    loop {
        match events.recv().await {
            Ok(SyncEvent::MessagesChanged { .. }) | Ok(SyncEvent::BackfillApplied { .. }) => {
                print_new_messages(&session, &mut printed).await
            }
            Ok(SyncEvent::ConnectionStateChanged(state)) => println!("-- connection: {state:?}"),
            Ok(SyncEvent::TypingChanged(typers)) => {
                let names: Vec<String> = typers
                    .iter()
                    .map(|typer| {
                        typer
                            .display_name
                            .clone()
                            .unwrap_or_else(|| format!("user {}", typer.user_id))
                    })
                    .collect();
                if !names.is_empty() {
                    println!("-- {} typing", names.join(", "));
                }
            }
            Ok(SyncEvent::MutationFailed { kind, message }) => println!("! {kind} failed: {message}"),
            Ok(SyncEvent::CredentialRejected { code }) => {
                println!("! push credential rejected ({code}); restart with a fresh token")
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "cli: event receiver lagged");
                print_new_messages(&session, &mut printed).await;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn print_new_messages(session: &ConversationSession, printed: &mut HashSet<MessageId>) {
    for message in session.messages().await {
        match message.delivery {
            Delivery::Confirmed if printed.insert(message.id) => println!("{}", render(&message)),
            Delivery::Failed if printed.insert(message.id) => {
                println!("{} [failed]", render(&message))
            }
            _ => {}
        }
    }
}

fn render(message: &Message) -> String {
    let sender = message
        .sender_name
        .clone()
        .unwrap_or_else(|| format!("user {}", message.sender_id));
    let body = if message.deleted {
        "(deleted)".to_string()
    } else {
        match (&message.content, &message.media_url) {
            (Some(content), Some(url)) => format!("{content} [{url}]"),
            (Some(content), None) => content.clone(),
            (None, Some(url)) => format!("[{url}]"),
            (None, None) => String::new(),
        }
    };
    let reactions: Vec<&str> = message
        .reactions
        .iter()
        .map(|reaction| reaction.symbol.as_str())
        .collect();
    let mut line = format!(
        "#{} {} {}: {}",
        message.id,
        message.created_at.format("%H:%M"),
        sender,
        body
    );
    if message.edited_at.is_some() {
        line.push_str(" (edited)");
    }
    if !reactions.is_empty() {
        line.push_str(&format!(" {}", reactions.join(" ")));
    }
    line
}
