use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use uuid::Uuid;

use crate::common::{
    sort_for_inbox, Conversation, ConversationId, Message, MessageSummary, MessagesQuery,
    NewConversation, NewMessage, StoreError,
};
use crate::server::store::{spawn_snapshot_pump, ChangeEvent, ChangeFeed, DocumentStore, Subscription};

#[derive(Default)]
struct Documents {
    conversations: HashMap<ConversationId, Conversation>,
    // Per conversation, in append order.
    messages: HashMap<ConversationId, Vec<Message>>,
}

/// In-process document store. Used by tests and single-process deployments.
#[derive(Clone, Default)]
pub struct MemoryStore {
    docs: Arc<Mutex<Documents>>,
    feed: ChangeFeed,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_feed(feed: ChangeFeed) -> Self {
        Self {
            docs: Arc::default(),
            feed,
        }
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    pub fn conversation_count(&self) -> usize {
        self.lock().conversations.len()
    }

    pub fn message_count(&self, id: &ConversationId) -> usize {
        self.lock().messages.get(id).map(Vec::len).unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, Documents> {
        // A panic while holding the lock cannot leave a document half-written.
        self.docs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn snapshot_conversation(&self, id: &ConversationId) -> Option<Conversation> {
        self.lock().conversations.get(id).cloned()
    }

    fn snapshot_messages(&self, query: &MessagesQuery) -> Vec<Message> {
        let all = self
            .lock()
            .messages
            .get(&query.conversation_id)
            .cloned()
            .unwrap_or_default();
        query.shape(all)
    }

    fn snapshot_inbox(&self, user_id: &str) -> Vec<Conversation> {
        let mut list: Vec<Conversation> = self
            .lock()
            .conversations
            .values()
            .filter(|c| c.has_participant(user_id))
            .cloned()
            .collect();
        sort_for_inbox(&mut list);
        list
    }
}

/// Server timestamp for a new message, never earlier than the previous one.
fn next_timestamp(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(prev) if prev > now => prev,
        _ => now,
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, StoreError> {
        Ok(self.snapshot_conversation(id))
    }

    async fn set_conversation(
        &self,
        conversation: NewConversation,
    ) -> Result<Conversation, StoreError> {
        let doc = conversation.into_conversation(Utc::now());
        self.lock()
            .conversations
            .insert(doc.id.clone(), doc.clone());
        self.feed.publish(ChangeEvent::ConversationWritten {
            conversation_id: doc.id.clone(),
            participants: doc.participants.clone(),
        });
        Ok(doc)
    }

    async fn update_summary(
        &self,
        id: &ConversationId,
        summary: MessageSummary,
    ) -> Result<(), StoreError> {
        let participants = {
            let mut docs = self.lock();
            let doc = docs
                .conversations
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.document_path()))?;
            doc.last_message_text = Some(summary.last_message_text);
            doc.last_message_at = Some(summary.last_message_at);
            doc.last_message_sender_id = Some(summary.last_message_sender_id);
            doc.participants.clone()
        };
        self.feed.publish(ChangeEvent::ConversationWritten {
            conversation_id: id.clone(),
            participants,
        });
        Ok(())
    }

    async fn add_message(
        &self,
        id: &ConversationId,
        message: NewMessage,
    ) -> Result<Message, StoreError> {
        let stored = {
            let mut docs = self.lock();
            let list = docs.messages.entry(id.clone()).or_default();
            let stored = Message {
                id: Uuid::new_v4().to_string(),
                conversation_id: id.clone(),
                sender_id: message.sender_id,
                text: message.text,
                created_at: next_timestamp(list.last().map(|m| m.created_at)),
            };
            list.push(stored.clone());
            stored
        };
        debug!("[MEMORY] appended {}", stored.document_path());
        self.feed.publish(ChangeEvent::MessageAdded {
            conversation_id: id.clone(),
        });
        Ok(stored)
    }

    async fn list_messages(&self, query: &MessagesQuery) -> Result<Vec<Message>, StoreError> {
        Ok(self.snapshot_messages(query))
    }

    async fn list_conversations_for(
        &self,
        user_id: &str,
    ) -> Result<Vec<Conversation>, StoreError> {
        Ok(self.snapshot_inbox(user_id))
    }

    async fn watch_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Subscription<Option<Conversation>>, StoreError> {
        let store = self.clone();
        let watched = id.clone();
        let target = id.clone();
        Ok(spawn_snapshot_pump(
            id.document_path(),
            self.feed.subscribe(),
            move |ev| ev.touches_conversation(&watched),
            move || {
                let snapshot = store.snapshot_conversation(&target);
                async move { Ok(snapshot) }
            },
        ))
    }

    async fn watch_messages(
        &self,
        query: MessagesQuery,
    ) -> Result<Subscription<Vec<Message>>, StoreError> {
        let store = self.clone();
        let watched = query.conversation_id.clone();
        Ok(spawn_snapshot_pump(
            query.conversation_id.messages_path(),
            self.feed.subscribe(),
            move |ev| ev.touches_messages(&watched),
            move || {
                let snapshot = store.snapshot_messages(&query);
                async move { Ok(snapshot) }
            },
        ))
    }

    async fn watch_conversations_for(
        &self,
        user_id: &str,
    ) -> Result<Subscription<Vec<Conversation>>, StoreError> {
        let store = self.clone();
        let watched = user_id.to_string();
        let target = user_id.to_string();
        Ok(spawn_snapshot_pump(
            format!("inbox:{}", user_id),
            self.feed.subscribe(),
            move |ev| ev.touches_inbox(&watched),
            move || {
                let snapshot = store.snapshot_inbox(&target);
                async move { Ok(snapshot) }
            },
        ))
    }
}
