//! Two-party real-time messaging core for the listing marketplace.
//!
//! * [`server::resolver`] derives the canonical conversation for a pair of users
//!   and creates it on first contact
//! * [`server::messages`] appends messages and maintains the conversation summary
//! * [`client::binding`] turns live store subscriptions into observable state
//!
//! Everything runs against an injected [`server::store::DocumentStore`]; the
//! crate ships an in-memory store and a SQLite store with an optional redis
//! relay for cross-process push.
pub mod client;
pub mod common;
pub mod server;
pub mod utils;

pub use client::binding::{BindingState, ConversationDoc, InboxQuery, LiveBinding, LiveQuery, LiveSnapshot};
pub use client::identity::{IdentityProvider, SessionIdentity};
pub use client::inbox::{InboxBinding, InboxSession};
pub use common::{
    ChatError, ChatResult, Conversation, ConversationId, Message, MessagesQuery, Participant,
    ParticipantDetails, StoreError, WriteStep,
};
pub use server::config::ChatConfig;
pub use server::memory::MemoryStore;
pub use server::database::SqliteStore;
pub use server::messages::{latest_message, send_message, MessageWriter};
pub use server::resolver::{conversation_id_for, get_or_create_conversation};
pub use server::store::{DocumentStore, SnapshotSender, Subscription};
