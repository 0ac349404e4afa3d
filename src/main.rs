use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use listing_inbox::server::redis_relay::{RedisChangeRelay, RelayHandle};
use listing_inbox::utils::logger::init_logging;
use listing_inbox::{
    latest_message, BindingState, ChatConfig, ConversationId, DocumentStore, InboxSession,
    Message, MessagesQuery, Participant, SessionIdentity, SqliteStore,
};
use log::warn;

#[derive(Parser)]
#[command(
    name = "listing-inbox",
    version,
    about = "Conversations between listing owners and interested buyers"
)]
struct Cli {
    /// Overrides DATABASE_URL
    #[arg(long, value_name = "URL")]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve (or start) the conversation between two users and print its id
    Open {
        #[arg(long)]
        me: String,
        #[arg(long)]
        other: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        photo: Option<String>,
        #[arg(long)]
        other_name: Option<String>,
        #[arg(long)]
        other_photo: Option<String>,
    },
    /// Send a message into a conversation
    Send {
        #[arg(long)]
        conversation: String,
        #[arg(long)]
        from: String,
        #[arg(required = true, trailing_var_arg = true)]
        text: Vec<String>,
    },
    /// Print a conversation's messages, oldest first
    History {
        #[arg(long)]
        conversation: String,
        /// Only the latest message, read from the message collection
        #[arg(long)]
        latest: bool,
    },
    /// List a user's conversations, most recent first
    Inbox {
        #[arg(long)]
        user: String,
    },
    /// Follow a conversation live until Ctrl-C
    Watch {
        #[arg(long)]
        conversation: String,
    },
}

fn participant(id: String, name: Option<String>, photo: Option<String>) -> Participant {
    Participant {
        id,
        display_name: name,
        photo_url: photo,
    }
}

fn print_message(message: &Message) {
    println!(
        "[{}] {}: {}",
        message.created_at.format("%Y-%m-%d %H:%M:%S"),
        message.sender_id,
        message.text
    );
}

async fn start_relay(config: &ChatConfig, store: &SqliteStore) -> Option<RelayHandle> {
    let url = config.redis_url.as_deref()?;
    match RedisChangeRelay::connect(url, &config.redis_channel, store.feed().clone()).await {
        Ok(relay) => Some(relay.start()),
        Err(e) => {
            warn!("Redis relay unavailable, live updates stay local: {}", e);
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = ChatConfig::from_env();
    init_logging(&config.log_level);

    let cli = Cli::parse();
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }

    let sqlite = SqliteStore::open(&config.database_url, config.change_feed_capacity).await?;
    let relay = start_relay(&config, &sqlite).await;
    let store: Arc<dyn DocumentStore> = Arc::new(sqlite);
    let identity = Arc::new(SessionIdentity::new());
    let session = InboxSession::new(store.clone(), identity.clone(), &config);

    match cli.command {
        Command::Open {
            me,
            other,
            name,
            photo,
            other_name,
            other_photo,
        } => {
            identity.sign_in(participant(me, name, photo));
            let id = session
                .open_conversation(&participant(other, other_name, other_photo))
                .await?;
            println!("{}", id);
        }
        Command::Send {
            conversation,
            from,
            text,
        } => {
            identity.sign_in(Participant::new(from));
            let id = ConversationId::from_raw(conversation);
            match session.send(&id, &text.join(" ")).await? {
                Some(message) => println!("sent {}", message.document_path()),
                None => println!("nothing to send"),
            }
        }
        Command::History {
            conversation,
            latest,
        } => {
            let id = ConversationId::from_raw(conversation);
            if latest {
                match latest_message(store.as_ref(), &id).await? {
                    Some(message) => print_message(&message),
                    None => println!("(no messages yet)"),
                }
            } else {
                let messages = store.list_messages(&MessagesQuery::all(id)).await?;
                if messages.is_empty() {
                    println!("(no messages yet)");
                }
                messages.iter().for_each(print_message);
            }
        }
        Command::Inbox { user } => {
            let conversations = store.list_conversations_for(&user).await?;
            if conversations.is_empty() {
                println!("(no conversations)");
            }
            for convo in conversations {
                let other = convo.other_participant(&user).unwrap_or("?");
                let other_name = convo
                    .participant_details
                    .get(other)
                    .and_then(|d| d.display_name.clone())
                    .unwrap_or_else(|| other.to_string());
                println!(
                    "{}  with {}  last: {}",
                    convo.id,
                    other_name,
                    convo.last_message_text.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Watch { conversation } => {
            let id = ConversationId::from_raw(conversation);
            let binding = session.messages(&id);
            let mut changes = binding.changes();
            let mut shown = 0;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    state = changes.recv() => match state {
                        Some(BindingState::Loading) => println!("… loading {}", id),
                        Some(BindingState::Ready(messages)) => {
                            if messages.is_empty() {
                                println!("(no messages yet)");
                            }
                            // Snapshots are complete lists; print only what is new.
                            messages.iter().skip(shown).for_each(print_message);
                            shown = messages.len();
                        }
                        Some(BindingState::Errored(e)) => {
                            println!("error: {}", e);
                            break;
                        }
                        Some(BindingState::Unbound) => {}
                        None => break,
                    }
                }
            }
            binding.dispose();
        }
    }

    if relay.is_some() {
        // Give the relay a moment to publish this process's writes before exit.
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    Ok(())
}
