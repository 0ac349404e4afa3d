// End-to-end run of the two-user scenario against SQLite
use std::sync::Arc;

use listing_inbox::utils::logger::init_logging;
use listing_inbox::{
    BindingState, ChatConfig, DocumentStore, InboxSession, MessagesQuery, Participant,
    SessionIdentity, SqliteStore,
};

const ROUNDS: usize = 15;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ChatConfig::from_env();
    init_logging(&config.log_level);

    // In-memory unless a database URL is given
    let store = match std::env::args().nth(1) {
        Some(url) => SqliteStore::open(&url, config.change_feed_capacity).await?,
        None => SqliteStore::open_in_memory().await?,
    };
    let store: Arc<dyn DocumentStore> = Arc::new(store);

    let alice = Participant::new("u1").with_display_name("Alice");
    let bob = Participant::new("u2").with_display_name("Bob");
    let alice_identity = Arc::new(SessionIdentity::signed_in(alice.clone()));
    let bob_identity = Arc::new(SessionIdentity::signed_in(bob.clone()));
    let alice_session = InboxSession::new(store.clone(), alice_identity, &config);
    let bob_session = InboxSession::new(store.clone(), bob_identity, &config);

    let id = alice_session.open_conversation(&bob).await?;
    anyhow::ensure!(id.as_str() == "u1_u2", "unexpected conversation id {}", id);
    anyhow::ensure!(bob_session.open_conversation(&alice).await? == id, "ids differ per side");
    let doc = bob_session.conversation(&id);
    let convo = doc
        .ready()
        .await?
        .ok_or_else(|| anyhow::anyhow!("conversation {} missing after resolve", id))?;
    println!("conversation {} between {:?}", id, convo.participants);

    let watcher = bob_session.messages(&id);
    let mut changes = watcher.changes();

    for i in 0..ROUNDS {
        let (session, text) = if i % 2 == 0 {
            (&alice_session, format!("Hi there #{}", i + 1))
        } else {
            (&bob_session, format!("Hello back #{}", i + 1))
        };
        session.send(&id, &text).await?;
    }

    // Wait for the watcher to see every message.
    loop {
        match changes.recv().await {
            Some(BindingState::Ready(messages)) if messages.len() == ROUNDS => break,
            Some(BindingState::Errored(e)) => anyhow::bail!("watcher failed: {}", e),
            Some(_) => continue,
            None => anyhow::bail!("watcher closed early"),
        }
    }

    let messages = store.list_messages(&MessagesQuery::all(id.clone())).await?;
    anyhow::ensure!(messages.len() == ROUNDS, "expected {} messages, got {}", ROUNDS, messages.len());
    anyhow::ensure!(
        messages.windows(2).all(|w| w[0].created_at <= w[1].created_at),
        "messages out of order"
    );
    let convo = store
        .get_conversation(&id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("conversation vanished"))?;
    let last = &messages[ROUNDS - 1];
    anyhow::ensure!(
        convo.last_message_sender_id.as_deref() == Some(last.sender_id.as_str()),
        "summary sender does not match the last message"
    );

    println!(
        "OK: {} messages, last from {}: {}",
        messages.len(),
        last.sender_id,
        convo.last_message_text.unwrap_or_default()
    );
    Ok(())
}
