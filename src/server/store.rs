use std::future::Future;

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::common::{
    Conversation, ConversationId, Message, MessageSummary, MessagesQuery, NewConversation,
    NewMessage, StoreError,
};

/// Document-oriented store the messaging core is written against.
///
/// Conversations live at `conversations/{id}` and messages in the
/// `conversations/{id}/messages` sub-collection. Documents are last-writer-wins,
/// messages are append-only, and the store assigns creation times.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_conversation(&self, id: &ConversationId)
        -> Result<Option<Conversation>, StoreError>;

    /// Full-document overwrite of `conversations/{id}` with a server `createdAt`.
    async fn set_conversation(&self, conversation: NewConversation)
        -> Result<Conversation, StoreError>;

    /// Merge the `lastMessage*` fields into an existing conversation.
    /// Fails with [`StoreError::NotFound`] when the document does not exist.
    async fn update_summary(
        &self,
        id: &ConversationId,
        summary: MessageSummary,
    ) -> Result<(), StoreError>;

    /// Append to the message sub-collection. The store assigns id and `createdAt`.
    async fn add_message(
        &self,
        id: &ConversationId,
        message: NewMessage,
    ) -> Result<Message, StoreError>;

    async fn list_messages(&self, query: &MessagesQuery) -> Result<Vec<Message>, StoreError>;

    /// Conversations containing `user_id`, most recent activity first.
    async fn list_conversations_for(&self, user_id: &str)
        -> Result<Vec<Conversation>, StoreError>;

    async fn watch_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Subscription<Option<Conversation>>, StoreError>;

    async fn watch_messages(
        &self,
        query: MessagesQuery,
    ) -> Result<Subscription<Vec<Message>>, StoreError>;

    async fn watch_conversations_for(
        &self,
        user_id: &str,
    ) -> Result<Subscription<Vec<Conversation>>, StoreError>;
}

/// Receiving half of a live subscription. Dropping it (or calling
/// [`Subscription::cancel`]) unsubscribes.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<Result<T, StoreError>>,
}

/// Producing half of a live subscription.
#[derive(Debug)]
pub struct SnapshotSender<T> {
    tx: mpsc::UnboundedSender<Result<T, StoreError>>,
}

impl<T> Clone for SnapshotSender<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T> Subscription<T> {
    /// A connected sender/subscription pair.
    pub fn channel() -> (SnapshotSender<T>, Subscription<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SnapshotSender { tx }, Subscription { rx })
    }

    /// Next pushed snapshot or error; `None` once the producer is gone.
    pub async fn next(&mut self) -> Option<Result<T, StoreError>> {
        self.rx.recv().await
    }

    pub fn cancel(mut self) {
        self.rx.close();
    }
}

impl<T> SnapshotSender<T> {
    /// Returns false when the subscriber has gone away.
    pub fn push(&self, snapshot: T) -> bool {
        self.tx.send(Ok(snapshot)).is_ok()
    }

    pub fn fail(&self, error: StoreError) -> bool {
        self.tx.send(Err(error)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the subscriber cancels or is dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// A write that live subscriptions may need to observe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEvent {
    ConversationWritten {
        conversation_id: ConversationId,
        participants: Vec<String>,
    },
    MessageAdded {
        conversation_id: ConversationId,
    },
}

impl ChangeEvent {
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            ChangeEvent::ConversationWritten { conversation_id, .. }
            | ChangeEvent::MessageAdded { conversation_id } => conversation_id,
        }
    }

    pub fn touches_conversation(&self, id: &ConversationId) -> bool {
        matches!(self, ChangeEvent::ConversationWritten { conversation_id, .. } if conversation_id == id)
    }

    pub fn touches_messages(&self, id: &ConversationId) -> bool {
        matches!(self, ChangeEvent::MessageAdded { conversation_id } if conversation_id == id)
    }

    pub fn touches_inbox(&self, user_id: &str) -> bool {
        match self {
            ChangeEvent::ConversationWritten { participants, .. } => {
                participants.iter().any(|p| p == user_id)
            }
            ChangeEvent::MessageAdded { .. } => false,
        }
    }
}

/// Where a change was first written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    /// Written by another process and re-emitted by the redis relay.
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub event: ChangeEvent,
    pub origin: ChangeOrigin,
}

/// In-process fan-out of store writes to live subscriptions.
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<Change>,
}

pub const DEFAULT_FEED_CAPACITY: usize = 256;

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: ChangeEvent) {
        self.send(event, ChangeOrigin::Local);
    }

    pub fn publish_remote(&self, event: ChangeEvent) {
        self.send(event, ChangeOrigin::Remote);
    }

    fn send(&self, event: ChangeEvent, origin: ChangeOrigin) {
        // No receivers just means nobody is watching.
        let _ = self.sender.send(Change { event, origin });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Change> {
        self.sender.subscribe()
    }
}

/// Spawn a task that pushes a full snapshot now and again after every relevant
/// change, until the subscriber goes away or a fetch fails.
pub fn spawn_snapshot_pump<T, R, F, Fut>(
    label: String,
    mut changes: broadcast::Receiver<Change>,
    relevant: R,
    fetch: F,
) -> Subscription<T>
where
    T: Send + 'static,
    R: Fn(&ChangeEvent) -> bool + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, StoreError>> + Send + 'static,
{
    let (sender, subscription) = Subscription::channel();
    tokio::spawn(async move {
        debug!("[PUMP] {} subscribed", label);
        if !push_fresh(&label, &sender, &fetch).await {
            return;
        }
        loop {
            tokio::select! {
                _ = sender.closed() => {
                    debug!("[PUMP] {} cancelled by subscriber", label);
                    break;
                }
                event = changes.recv() => match event {
                    Ok(change) if relevant(&change.event) => {
                        if !push_fresh(&label, &sender, &fetch).await {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("[PUMP] {} lagged by {} change events, refreshing", label, skipped);
                        if !push_fresh(&label, &sender, &fetch).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("[PUMP] {} change feed closed", label);
                        sender.fail(StoreError::Closed);
                        break;
                    }
                }
            }
        }
    });
    subscription
}

/// Fetch and push one snapshot. Returns false when the pump should stop.
async fn push_fresh<T, F, Fut>(label: &str, sender: &SnapshotSender<T>, fetch: &F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    match fetch().await {
        Ok(snapshot) => sender.push(snapshot),
        Err(e) => {
            warn!("[PUMP] {} fetch failed: {}", label, e);
            sender.fail(e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn pump_pushes_initial_and_relevant_changes() {
        let feed = ChangeFeed::new(8);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let target = ConversationId::for_pair("a", "b");
        let watched = target.clone();
        let mut sub = spawn_snapshot_pump(
            "test".into(),
            feed.subscribe(),
            move |ev| ev.touches_messages(&watched),
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, StoreError>(n) }
            },
        );
        assert_eq!(sub.next().await, Some(Ok(0)));

        feed.publish(ChangeEvent::MessageAdded {
            conversation_id: ConversationId::for_pair("x", "y"),
        });
        feed.publish(ChangeEvent::MessageAdded {
            conversation_id: target.clone(),
        });
        assert_eq!(sub.next().await, Some(Ok(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn pump_stops_after_fetch_error() {
        let feed = ChangeFeed::new(8);
        let mut sub = spawn_snapshot_pump(
            "failing".into(),
            feed.subscribe(),
            |_| true,
            || async { Err::<(), _>(StoreError::PermissionDenied("rules".into())) },
        );
        assert_eq!(
            sub.next().await,
            Some(Err(StoreError::PermissionDenied("rules".into())))
        );
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn cancelled_subscription_is_seen_by_sender() {
        let (sender, sub) = Subscription::<u32>::channel();
        assert!(sender.push(1));
        sub.cancel();
        sender.closed().await;
        assert!(!sender.push(2));
    }

    #[tokio::test]
    async fn remote_changes_also_refresh_pumps() {
        let feed = ChangeFeed::new(8);
        let mut sub = spawn_snapshot_pump(
            "remote".into(),
            feed.subscribe(),
            |_| true,
            || async { Ok::<_, StoreError>(()) },
        );
        assert_eq!(sub.next().await, Some(Ok(())));
        feed.publish_remote(ChangeEvent::MessageAdded {
            conversation_id: ConversationId::for_pair("a", "b"),
        });
        assert_eq!(sub.next().await, Some(Ok(())));
    }

    #[tokio::test]
    async fn closed_feed_is_reported() {
        let feed = ChangeFeed::new(8);
        let mut sub = spawn_snapshot_pump(
            "orphan".into(),
            feed.subscribe(),
            |_| true,
            || async { Ok::<_, StoreError>(()) },
        );
        assert_eq!(sub.next().await, Some(Ok(())));
        drop(feed);
        assert_eq!(sub.next().await, Some(Err(StoreError::Closed)));
        assert_eq!(sub.next().await, None);
    }

    #[test]
    fn change_event_routing() {
        let id = ConversationId::for_pair("u1", "u2");
        let written = ChangeEvent::ConversationWritten {
            conversation_id: id.clone(),
            participants: vec!["u1".into(), "u2".into()],
        };
        assert!(written.touches_conversation(&id));
        assert!(written.touches_inbox("u2"));
        assert!(!written.touches_inbox("u3"));
        assert!(!written.touches_messages(&id));

        let added = ChangeEvent::MessageAdded {
            conversation_id: id.clone(),
        };
        assert!(added.touches_messages(&id));
        assert!(!added.touches_conversation(&id));
    }
}
