use log::{debug, error};

use crate::common::{
    ChatError, ChatResult, ConversationId, Message, MessagesQuery, NewMessage, StoreError,
    WriteStep,
};
use crate::server::store::DocumentStore;

pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 2048;

/// Appends messages and keeps the conversation's `lastMessage*` summary current.
///
/// The summary is a cache: the append and the summary update are two separate
/// writes, and a failed update leaves the appended message in place. Use
/// [`latest_message`] when the exact latest message matters.
#[derive(Debug, Clone, Copy)]
pub struct MessageWriter {
    max_message_length: usize,
}

impl Default for MessageWriter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_LENGTH)
    }
}

impl MessageWriter {
    pub fn new(max_message_length: usize) -> Self {
        Self { max_message_length }
    }

    pub fn max_message_length(&self) -> usize {
        self.max_message_length
    }

    /// Returns `Ok(None)` without touching the store when `text` is blank.
    /// The stored text is the caller's original, untrimmed value.
    pub async fn send(
        &self,
        store: &dyn DocumentStore,
        conversation_id: &ConversationId,
        sender_id: &str,
        text: &str,
    ) -> ChatResult<Option<Message>> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        let length = text.chars().count();
        if length > self.max_message_length {
            return Err(ChatError::InvalidOperation(format!(
                "message too long ({} chars, max {})",
                length, self.max_message_length
            )));
        }

        let conversation = store
            .get_conversation(conversation_id)
            .await
            .map_err(ChatError::Read)?
            .ok_or_else(|| ChatError::Read(StoreError::NotFound(conversation_id.document_path())))?;
        if !conversation.has_participant(sender_id) {
            return Err(ChatError::InvalidOperation(format!(
                "{} is not a participant of {}",
                sender_id, conversation_id
            )));
        }

        let message = store
            .add_message(
                conversation_id,
                NewMessage {
                    sender_id: sender_id.to_string(),
                    text: text.to_string(),
                },
            )
            .await
            .map_err(|e| {
                error!("[MSG] append to {} failed: {}", conversation_id, e);
                ChatError::write(WriteStep::AppendMessage, e)
            })?;
        debug!("[MSG] {} sent {}", sender_id, message.document_path());

        store
            .update_summary(conversation_id, message.summary())
            .await
            .map_err(|e| {
                error!(
                    "[MSG] summary update for {} failed, {} stays appended: {}",
                    conversation_id, message.id, e
                );
                ChatError::write(WriteStep::UpdateSummary, e)
            })?;

        Ok(Some(message))
    }
}

/// Send with the default length limit.
pub async fn send_message(
    store: &dyn DocumentStore,
    conversation_id: &ConversationId,
    sender_id: &str,
    text: &str,
) -> ChatResult<Option<Message>> {
    MessageWriter::default()
        .send(store, conversation_id, sender_id, text)
        .await
}

/// The authoritative latest message, read from the message collection rather
/// than the conversation summary.
pub async fn latest_message(
    store: &dyn DocumentStore,
    conversation_id: &ConversationId,
) -> ChatResult<Option<Message>> {
    let mut latest = store
        .list_messages(&MessagesQuery::latest(conversation_id.clone()))
        .await
        .map_err(ChatError::Read)?;
    Ok(latest.pop())
}
