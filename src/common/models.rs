// Common models shared between the stores, the resolver/writer and the bindings
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Separator between the two participant ids of a canonical conversation id.
pub const CONVERSATION_ID_SEPARATOR: char = '_';

pub const CONVERSATIONS_COLLECTION: &str = "conversations";
pub const MESSAGES_COLLECTION: &str = "messages";

/// Canonical conversation id: both participant ids, sorted ascending, joined by `_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Derive the id for an unordered pair. Either side computes the same value.
    pub fn for_pair(a: &str, b: &str) -> Self {
        let mut ids = [a, b];
        ids.sort();
        Self(format!("{}{}{}", ids[0], CONVERSATION_ID_SEPARATOR, ids[1]))
    }

    /// Wrap an id that was already derived (e.g. read back from storage or a CLI flag).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `conversations/{id}`
    pub fn document_path(&self) -> String {
        format!("{}/{}", CONVERSATIONS_COLLECTION, self.0)
    }

    /// `conversations/{id}/messages`
    pub fn messages_path(&self) -> String {
        format!("{}/{}", self.document_path(), MESSAGES_COLLECTION)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ConversationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A user as supplied by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub display_name: Option<String>,
    #[serde(rename = "photoURL")]
    pub photo_url: Option<String>,
}

impl Participant {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            photo_url: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_photo_url(mut self, url: impl Into<String>) -> Self {
        self.photo_url = Some(url.into());
        self
    }

    pub fn details(&self) -> ParticipantDetails {
        ParticipantDetails {
            display_name: self.display_name.clone(),
            photo_url: self.photo_url.clone(),
        }
    }
}

/// Snapshot of a participant's profile taken when the conversation was created.
/// It is historical: later profile changes are not copied into it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantDetails {
    pub display_name: Option<String>,
    #[serde(rename = "photoURL")]
    pub photo_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    /// Always the two participant ids, sorted.
    pub participants: Vec<String>,
    pub participant_details: BTreeMap<String, ParticipantDetails>,
    pub last_message_text: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_message_sender_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }

    /// The participant that is not `user_id`, if `user_id` is one of the two.
    pub fn other_participant(&self, user_id: &str) -> Option<&str> {
        if !self.has_participant(user_id) {
            return None;
        }
        self.participants
            .iter()
            .map(String::as_str)
            .find(|p| *p != user_id)
    }

    pub fn document_path(&self) -> String {
        self.id.document_path()
    }
}

/// Payload of a create-if-absent write. The store stamps `createdAt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConversation {
    pub id: ConversationId,
    pub participants: Vec<String>,
    pub participant_details: BTreeMap<String, ParticipantDetails>,
}

impl NewConversation {
    pub fn between(current: &Participant, other: &Participant) -> Self {
        let id = ConversationId::for_pair(&current.id, &other.id);
        let mut participants = vec![current.id.clone(), other.id.clone()];
        participants.sort();
        let mut participant_details = BTreeMap::new();
        participant_details.insert(current.id.clone(), current.details());
        participant_details.insert(other.id.clone(), other.details());
        Self {
            id,
            participants,
            participant_details,
        }
    }

    /// Materialize the document as the store will hold it.
    pub fn into_conversation(self, created_at: DateTime<Utc>) -> Conversation {
        Conversation {
            id: self.id,
            participants: self.participants,
            participant_details: self.participant_details,
            last_message_text: None,
            last_message_at: None,
            last_message_sender_id: None,
            created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: ConversationId,
    pub sender_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// `conversations/{conversationId}/messages/{messageId}`
    pub fn document_path(&self) -> String {
        format!("{}/{}", self.conversation_id.messages_path(), self.id)
    }

    pub fn summary(&self) -> MessageSummary {
        MessageSummary {
            last_message_text: self.text.clone(),
            last_message_at: self.created_at,
            last_message_sender_id: self.sender_id.clone(),
        }
    }
}

/// Message payload before the store assigns an id and a creation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: String,
    pub text: String,
}

/// The `lastMessage*` fields merged into a conversation after each append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSummary {
    pub last_message_text: String,
    pub last_message_at: DateTime<Utc>,
    pub last_message_sender_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Query over one conversation's message collection, ordered by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessagesQuery {
    pub conversation_id: ConversationId,
    pub order: SortOrder,
    pub limit: Option<usize>,
}

impl MessagesQuery {
    pub fn all(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            order: SortOrder::Ascending,
            limit: None,
        }
    }

    /// Newest message only.
    pub fn latest(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            order: SortOrder::Descending,
            limit: Some(1),
        }
    }

    /// Order and truncate a full, ascending message list to this query's shape.
    pub fn shape(&self, mut messages: Vec<Message>) -> Vec<Message> {
        if self.order == SortOrder::Descending {
            messages.reverse();
        }
        if let Some(limit) = self.limit {
            messages.truncate(limit);
        }
        messages
    }
}

/// Sort conversations for an inbox: most recent activity first, never-messaged
/// conversations by creation time.
pub fn sort_for_inbox(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| {
        let a_at = a.last_message_at.unwrap_or(a.created_at);
        let b_at = b.last_message_at.unwrap_or(b.created_at);
        b_at.cmp(&a_at).then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn pair_id_is_order_independent() {
        assert_eq!(ConversationId::for_pair("u2", "u1").as_str(), "u1_u2");
        assert_eq!(
            ConversationId::for_pair("alice", "bob"),
            ConversationId::for_pair("bob", "alice")
        );
    }

    #[test]
    fn paths_follow_collection_layout() {
        let id = ConversationId::for_pair("u1", "u2");
        assert_eq!(id.document_path(), "conversations/u1_u2");
        let msg = Message {
            id: "m1".into(),
            conversation_id: id,
            sender_id: "u1".into(),
            text: "hi".into(),
            created_at: Utc::now(),
        };
        assert_eq!(msg.document_path(), "conversations/u1_u2/messages/m1");
    }

    #[test]
    fn new_conversation_snapshots_both_participants() {
        let me = Participant::new("u2").with_display_name("Bea");
        let other = Participant::new("u1").with_photo_url("https://img/u1.png");
        let convo = NewConversation::between(&me, &other);
        assert_eq!(convo.participants, vec!["u1".to_string(), "u2".to_string()]);
        assert_eq!(
            convo.participant_details["u2"].display_name.as_deref(),
            Some("Bea")
        );
        assert_eq!(convo.participant_details["u1"].display_name, None);
        assert_eq!(
            convo.participant_details["u1"].photo_url.as_deref(),
            Some("https://img/u1.png")
        );
    }

    #[test]
    fn conversation_serializes_with_document_field_names() {
        let created = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let convo = NewConversation::between(&Participant::new("u1"), &Participant::new("u2"))
            .into_conversation(created);
        let json = serde_json::to_value(&convo).unwrap();
        assert_eq!(json["id"], "u1_u2");
        assert!(json.get("lastMessageText").is_some());
        assert!(json.get("participantDetails").unwrap().get("u1").unwrap().get("photoURL").is_some());
    }

    #[test]
    fn other_participant_requires_membership() {
        let convo = NewConversation::between(&Participant::new("u1"), &Participant::new("u2"))
            .into_conversation(Utc::now());
        assert_eq!(convo.other_participant("u1"), Some("u2"));
        assert_eq!(convo.other_participant("u3"), None);
    }

    #[test]
    fn inbox_sort_prefers_recent_activity() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut quiet = NewConversation::between(&Participant::new("a"), &Participant::new("b"))
            .into_conversation(t0 + chrono::Duration::minutes(5));
        quiet.last_message_at = None;
        let mut busy = NewConversation::between(&Participant::new("a"), &Participant::new("c"))
            .into_conversation(t0);
        busy.last_message_at = Some(t0 + chrono::Duration::minutes(10));
        let mut list = vec![quiet, busy];
        sort_for_inbox(&mut list);
        assert_eq!(list[0].id.as_str(), "a_c");
        assert_eq!(list[1].id.as_str(), "a_b");
    }
}
