// Store doubles shared by the integration tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use listing_inbox::common::{MessageSummary, NewConversation, NewMessage};
use listing_inbox::{
    Conversation, ConversationId, DocumentStore, MemoryStore, Message, MessagesQuery,
    Participant, SnapshotSender, StoreError, Subscription,
};
use tokio::sync::mpsc::UnboundedReceiver;

pub const WAIT: Duration = Duration::from_secs(2);

pub fn user(id: &str, name: &str) -> Participant {
    Participant::new(id).with_display_name(name)
}

pub fn message(conversation_id: &ConversationId, id: &str, sender_id: &str, text: &str) -> Message {
    Message {
        id: id.to_string(),
        conversation_id: conversation_id.clone(),
        sender_id: sender_id.to_string(),
        text: text.to_string(),
        created_at: Utc::now(),
    }
}

/// Next item from a stream, failing the test instead of hanging.
pub async fn next<T>(rx: &mut UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for the next state")
        .expect("stream closed")
}

/// Skip items until one matches.
pub async fn next_matching<T: std::fmt::Debug>(
    rx: &mut UnboundedReceiver<T>,
    pred: impl Fn(&T) -> bool,
) -> T {
    loop {
        let item = next(rx).await;
        if pred(&item) {
            return item;
        }
    }
}

fn unavailable(what: &str) -> StoreError {
    StoreError::Unavailable(format!("{} failed (injected)", what))
}

/// [`MemoryStore`] with call counters and switchable failures per operation.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
    pub fail_reads: AtomicBool,
    pub fail_create: AtomicBool,
    pub fail_append: AtomicBool,
    pub fail_summary: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn touched(&self) -> usize {
        self.reads() + self.writes()
    }

    fn read(&self, what: &str) -> Result<(), StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(unavailable(what));
        }
        Ok(())
    }

    fn write(&self, flag: &AtomicBool, what: &str) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            return Err(unavailable(what));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, StoreError> {
        self.read("get")?;
        self.inner.get_conversation(id).await
    }

    async fn set_conversation(
        &self,
        conversation: NewConversation,
    ) -> Result<Conversation, StoreError> {
        self.write(&self.fail_create, "create")?;
        self.inner.set_conversation(conversation).await
    }

    async fn update_summary(
        &self,
        id: &ConversationId,
        summary: MessageSummary,
    ) -> Result<(), StoreError> {
        self.write(&self.fail_summary, "summary")?;
        self.inner.update_summary(id, summary).await
    }

    async fn add_message(
        &self,
        id: &ConversationId,
        message: NewMessage,
    ) -> Result<Message, StoreError> {
        self.write(&self.fail_append, "append")?;
        self.inner.add_message(id, message).await
    }

    async fn list_messages(&self, query: &MessagesQuery) -> Result<Vec<Message>, StoreError> {
        self.read("list messages")?;
        self.inner.list_messages(query).await
    }

    async fn list_conversations_for(
        &self,
        user_id: &str,
    ) -> Result<Vec<Conversation>, StoreError> {
        self.read("list conversations")?;
        self.inner.list_conversations_for(user_id).await
    }

    async fn watch_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Subscription<Option<Conversation>>, StoreError> {
        self.inner.watch_conversation(id).await
    }

    async fn watch_messages(
        &self,
        query: MessagesQuery,
    ) -> Result<Subscription<Vec<Message>>, StoreError> {
        self.inner.watch_messages(query).await
    }

    async fn watch_conversations_for(
        &self,
        user_id: &str,
    ) -> Result<Subscription<Vec<Conversation>>, StoreError> {
        self.inner.watch_conversations_for(user_id).await
    }
}

/// Store whose subscriptions are driven by the test: every `watch_*` call hands
/// its producer side to the test instead of a pump.
#[derive(Default)]
pub struct ScriptedStore {
    calls: AtomicUsize,
    pub refuse_subscribe: AtomicBool,
    conversations: Mutex<Vec<(ConversationId, SnapshotSender<Option<Conversation>>)>>,
    messages: Mutex<Vec<(MessagesQuery, SnapshotSender<Vec<Message>>)>>,
    inboxes: Mutex<Vec<(String, SnapshotSender<Vec<Conversation>>)>>,
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call made against this store, reads and writes included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn message_subscriptions(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    /// Wait for the `n`th (zero-based) message subscription.
    pub async fn message_subscription(&self, n: usize) -> (MessagesQuery, SnapshotSender<Vec<Message>>) {
        tokio::time::timeout(WAIT, async {
            loop {
                if let Some(found) = self.messages.lock().unwrap().get(n).cloned() {
                    return found;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("no message subscription arrived")
    }

    pub async fn conversation_subscription(
        &self,
        n: usize,
    ) -> (ConversationId, SnapshotSender<Option<Conversation>>) {
        tokio::time::timeout(WAIT, async {
            loop {
                if let Some(found) = self.conversations.lock().unwrap().get(n).cloned() {
                    return found;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("no conversation subscription arrived")
    }

    fn touch(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentStore for ScriptedStore {
    async fn get_conversation(
        &self,
        _id: &ConversationId,
    ) -> Result<Option<Conversation>, StoreError> {
        self.touch();
        Ok(None)
    }

    async fn set_conversation(
        &self,
        conversation: NewConversation,
    ) -> Result<Conversation, StoreError> {
        self.touch();
        Ok(conversation.into_conversation(Utc::now()))
    }

    async fn update_summary(
        &self,
        _id: &ConversationId,
        _summary: MessageSummary,
    ) -> Result<(), StoreError> {
        self.touch();
        Ok(())
    }

    async fn add_message(
        &self,
        id: &ConversationId,
        message: NewMessage,
    ) -> Result<Message, StoreError> {
        self.touch();
        Ok(Message {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: id.clone(),
            sender_id: message.sender_id,
            text: message.text,
            created_at: Utc::now(),
        })
    }

    async fn list_messages(&self, _query: &MessagesQuery) -> Result<Vec<Message>, StoreError> {
        self.touch();
        Ok(Vec::new())
    }

    async fn list_conversations_for(
        &self,
        _user_id: &str,
    ) -> Result<Vec<Conversation>, StoreError> {
        self.touch();
        Ok(Vec::new())
    }

    async fn watch_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Subscription<Option<Conversation>>, StoreError> {
        self.touch();
        if self.refuse_subscribe.load(Ordering::SeqCst) {
            return Err(StoreError::PermissionDenied(id.document_path()));
        }
        let (sender, subscription) = Subscription::channel();
        self.conversations.lock().unwrap().push((id.clone(), sender));
        Ok(subscription)
    }

    async fn watch_messages(
        &self,
        query: MessagesQuery,
    ) -> Result<Subscription<Vec<Message>>, StoreError> {
        self.touch();
        if self.refuse_subscribe.load(Ordering::SeqCst) {
            return Err(StoreError::PermissionDenied(query.conversation_id.messages_path()));
        }
        let (sender, subscription) = Subscription::channel();
        self.messages.lock().unwrap().push((query, sender));
        Ok(subscription)
    }

    async fn watch_conversations_for(
        &self,
        user_id: &str,
    ) -> Result<Subscription<Vec<Conversation>>, StoreError> {
        self.touch();
        let (sender, subscription) = Subscription::channel();
        self.inboxes.lock().unwrap().push((user_id.to_string(), sender));
        Ok(subscription)
    }
}
