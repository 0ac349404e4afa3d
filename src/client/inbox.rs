use std::ops::Deref;
use std::sync::Arc;

use log::debug;
use tokio::task::JoinHandle;

use crate::client::binding::{ConversationDoc, InboxQuery, LiveBinding};
use crate::client::identity::IdentityProvider;
use crate::common::{ChatError, ChatResult, ConversationId, Message, MessagesQuery, Participant};
use crate::server::config::ChatConfig;
use crate::server::messages::MessageWriter;
use crate::server::resolver::get_or_create_conversation;
use crate::server::store::DocumentStore;

/// Client-side entry point: acts as the signed-in user against an injected store.
pub struct InboxSession {
    store: Arc<dyn DocumentStore>,
    identity: Arc<dyn IdentityProvider>,
    writer: MessageWriter,
}

impl InboxSession {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        identity: Arc<dyn IdentityProvider>,
        config: &ChatConfig,
    ) -> Self {
        Self {
            store,
            identity,
            writer: MessageWriter::new(config.max_message_length),
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn current_user(&self) -> ChatResult<Participant> {
        self.identity.current_user().ok_or(ChatError::NotSignedIn)
    }

    /// Resolve (creating on first contact) the conversation with `other`.
    pub async fn open_conversation(&self, other: &Participant) -> ChatResult<ConversationId> {
        let me = self.current_user()?;
        get_or_create_conversation(self.store.as_ref(), &me, other).await
    }

    /// Send as the signed-in user. Blank text is ignored and returns `Ok(None)`.
    pub async fn send(
        &self,
        conversation_id: &ConversationId,
        text: &str,
    ) -> ChatResult<Option<Message>> {
        let me = self.current_user()?;
        self.writer
            .send(self.store.as_ref(), conversation_id, &me.id, text)
            .await
    }

    pub fn conversation(&self, id: &ConversationId) -> LiveBinding<ConversationDoc> {
        LiveBinding::new(self.store.clone(), Some(ConversationDoc(id.clone())))
    }

    /// Messages of one conversation, oldest first.
    pub fn messages(&self, id: &ConversationId) -> LiveBinding<MessagesQuery> {
        LiveBinding::new(self.store.clone(), Some(MessagesQuery::all(id.clone())))
    }

    /// The signed-in user's conversations. The binding follows auth state: its
    /// query is null (an empty list) while nobody is signed in.
    pub fn inbox(&self) -> InboxBinding {
        let mut auth = self.identity.auth_changes();
        let initial = auth
            .borrow_and_update()
            .as_ref()
            .map(|user| InboxQuery::for_user(&user.id));
        let binding = LiveBinding::new(self.store.clone(), initial);
        let core = binding.core();
        let follower = tokio::spawn(async move {
            while auth.changed().await.is_ok() {
                let query = auth
                    .borrow_and_update()
                    .as_ref()
                    .map(|user| InboxQuery::for_user(&user.id));
                debug!("[INBOX] auth changed, rebinding to {:?}", query);
                core.set_query(query, false);
            }
        });
        InboxBinding { binding, follower }
    }
}

/// Inbox binding plus the task that rebinds it on auth changes.
pub struct InboxBinding {
    binding: LiveBinding<InboxQuery>,
    follower: JoinHandle<()>,
}

impl Deref for InboxBinding {
    type Target = LiveBinding<InboxQuery>;

    fn deref(&self) -> &Self::Target {
        &self.binding
    }
}

impl Drop for InboxBinding {
    fn drop(&mut self) {
        self.follower.abort();
    }
}
