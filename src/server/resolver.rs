use log::{debug, info, warn};

use crate::common::{ChatError, ChatResult, ConversationId, NewConversation, Participant, WriteStep};
use crate::server::store::DocumentStore;

/// Canonical id for the pair; computable by either side without a lookup.
pub fn conversation_id_for(a: &str, b: &str) -> ConversationId {
    ConversationId::for_pair(a, b)
}

/// Return the conversation between `current` and `other`, creating it on first contact.
///
/// An existing conversation is returned as-is: no write happens and the stored
/// participant details are not refreshed. Two callers racing on first contact both
/// overwrite the same document id, so the pair still maps to a single record.
pub async fn get_or_create_conversation(
    store: &dyn DocumentStore,
    current: &Participant,
    other: &Participant,
) -> ChatResult<ConversationId> {
    if current.id == other.id {
        return Err(ChatError::InvalidOperation(
            "cannot converse with self".to_string(),
        ));
    }

    let wanted = NewConversation::between(current, other);
    let id = wanted.id.clone();
    if let Some(existing) = store.get_conversation(&id).await.map_err(ChatError::Read)? {
        // Ids containing '_' can derive the same key as a different pair.
        if existing.participants != wanted.participants {
            warn!(
                "[RESOLVER] {} belongs to {:?}, not {} and {}",
                id, existing.participants, current.id, other.id
            );
            return Err(ChatError::InvalidOperation(format!(
                "conversation id {} is taken by another pair",
                id
            )));
        }
        debug!("[RESOLVER] found {}", id.document_path());
        return Ok(id);
    }

    let created = store
        .set_conversation(wanted)
        .await
        .map_err(|e| ChatError::write(WriteStep::CreateConversation, e))?;
    info!(
        "[RESOLVER] created {} for {} and {}",
        created.document_path(),
        current.id,
        other.id
    );
    Ok(created.id)
}
