use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::common::{
    Conversation, ConversationId, Message, MessageSummary, MessagesQuery, NewConversation,
    NewMessage, SortOrder, StoreError,
};
use crate::server::store::{spawn_snapshot_pump, ChangeEvent, ChangeFeed, DocumentStore, Subscription};

const BUSY_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        info!("🔗 Connecting to database: {}", database_url);

        let file_path = sqlite_file_path(database_url);
        if let Some(parent) = std::path::Path::new(file_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| sqlx::Error::Configuration(Box::new(e)))?;
                info!("📂 Created database directory: {:?}", parent);
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(BUSY_TIMEOUT_SECS));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        info!("✅ Database connection successful");
        Ok(Self { pool })
    }

    /// Private in-memory database. One connection, kept open for the pool's lifetime,
    /// since every new SQLite memory connection starts empty.
    pub async fn connect_in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        // Conversations: one row per unordered pair, keyed by the canonical id
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                participant_a TEXT NOT NULL,
                participant_b TEXT NOT NULL,
                participant_details TEXT NOT NULL,
                last_message_text TEXT,
                last_message_at INTEGER,
                last_message_sender_id TEXT,
                created_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_conversations_a ON conversations(participant_a);")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_conversations_b ON conversations(participant_b);")
            .execute(&self.pool)
            .await?;

        // Messages: append-only; seq breaks ties between equal timestamps
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                conversation_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                text TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, created_at, seq);")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

/// Strip the `sqlite:` / `sqlite://` scheme and any query string.
fn sqlite_file_path(database_url: &str) -> &str {
    let path = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url);
    match path.find('?') {
        Some(pos) => &path[..pos],
        None => path,
    }
}

fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Serialization(format!("invalid timestamp {}", ms)))
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation, StoreError> {
    let details: String = row.try_get("participant_details")?;
    let last_message_at: Option<i64> = row.try_get("last_message_at")?;
    Ok(Conversation {
        id: ConversationId::from_raw(row.try_get::<String, _>("id")?),
        participants: vec![row.try_get("participant_a")?, row.try_get("participant_b")?],
        participant_details: serde_json::from_str(&details)?,
        last_message_text: row.try_get("last_message_text")?,
        last_message_at: last_message_at.map(millis_to_utc).transpose()?,
        last_message_sender_id: row.try_get("last_message_sender_id")?,
        created_at: millis_to_utc(row.try_get("created_at")?)?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message, StoreError> {
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: ConversationId::from_raw(row.try_get::<String, _>("conversation_id")?),
        sender_id: row.try_get("sender_id")?,
        text: row.try_get("text")?,
        created_at: millis_to_utc(row.try_get("created_at")?)?,
    })
}

/// [`DocumentStore`] on SQLite. Live subscriptions see writes made through this
/// store (and its clones); writes from other processes arrive via the redis relay.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db: Database,
    feed: ChangeFeed,
}

impl SqliteStore {
    pub fn new(db: Database, feed: ChangeFeed) -> Self {
        Self { db, feed }
    }

    /// Connect, run migrations and attach a fresh change feed.
    pub async fn open(database_url: &str, feed_capacity: usize) -> Result<Self, StoreError> {
        let db = Database::connect(database_url).await?;
        db.migrate().await?;
        Ok(Self::new(db, ChangeFeed::new(feed_capacity)))
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let db = Database::connect_in_memory().await?;
        db.migrate().await?;
        Ok(Self::new(db, ChangeFeed::default()))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    async fn fetch_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.db.pool)
            .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn fetch_messages(&self, query: &MessagesQuery) -> Result<Vec<Message>, StoreError> {
        let sql = match query.order {
            SortOrder::Ascending => {
                "SELECT * FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, seq ASC LIMIT ?"
            }
            SortOrder::Descending => {
                "SELECT * FROM messages WHERE conversation_id = ? ORDER BY created_at DESC, seq DESC LIMIT ?"
            }
        };
        // LIMIT -1 means no limit in SQLite
        let limit = query.limit.map(|l| l as i64).unwrap_or(-1);
        let rows = sqlx::query(sql)
            .bind(query.conversation_id.as_str())
            .bind(limit)
            .fetch_all(&self.db.pool)
            .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn fetch_inbox(&self, user_id: &str) -> Result<Vec<Conversation>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM conversations WHERE participant_a = ? OR participant_b = ? \
             ORDER BY COALESCE(last_message_at, created_at) DESC, id ASC",
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.db.pool)
        .await?;
        rows.iter().map(conversation_from_row).collect()
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, StoreError> {
        self.fetch_conversation(id).await
    }

    async fn set_conversation(
        &self,
        conversation: NewConversation,
    ) -> Result<Conversation, StoreError> {
        if conversation.participants.len() != 2 {
            return Err(StoreError::Serialization(format!(
                "conversation {} must have exactly two participants",
                conversation.id
            )));
        }
        // Stored at millisecond precision; return what a read will see.
        let doc = conversation.into_conversation(millis_to_utc(Utc::now().timestamp_millis())?);
        let details = serde_json::to_string(&doc.participant_details)?;
        sqlx::query(
            "INSERT OR REPLACE INTO conversations \
             (id, participant_a, participant_b, participant_details, last_message_text, last_message_at, last_message_sender_id, created_at) \
             VALUES (?, ?, ?, ?, NULL, NULL, NULL, ?)",
        )
        .bind(doc.id.as_str())
        .bind(&doc.participants[0])
        .bind(&doc.participants[1])
        .bind(&details)
        .bind(doc.created_at.timestamp_millis())
        .execute(&self.db.pool)
        .await?;

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
        let row = sqlx::query(
            "UPDATE conversations SET last_message_text = ?, last_message_at = ?, last_message_sender_id = ? \
             WHERE id = ? RETURNING participant_a, participant_b",
        )
        .bind(&summary.last_message_text)
        .bind(summary.last_message_at.timestamp_millis())
        .bind(&summary.last_message_sender_id)
        .bind(id.as_str())
        .fetch_optional(&self.db.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(id.document_path()))?;

        self.feed.publish(ChangeEvent::ConversationWritten {
            conversation_id: id.clone(),
            participants: vec![row.try_get("participant_a")?, row.try_get("participant_b")?],
        });
        Ok(())
    }

    async fn add_message(
        &self,
        id: &ConversationId,
        message: NewMessage,
    ) -> Result<Message, StoreError> {
        // One statement, so the clamp read and the insert share the write lock
        // and concurrent appends queue on the busy timeout instead of failing.
        let message_id = Uuid::new_v4().to_string();
        let created_at: i64 = sqlx::query_scalar(
            "INSERT INTO messages (id, conversation_id, sender_id, text, created_at) \
             SELECT ?, ?, ?, ?, MAX(?, COALESCE((SELECT MAX(created_at) FROM messages WHERE conversation_id = ?), 0)) \
             RETURNING created_at",
        )
        .bind(&message_id)
        .bind(id.as_str())
        .bind(&message.sender_id)
        .bind(&message.text)
        .bind(Utc::now().timestamp_millis())
        .bind(id.as_str())
        .fetch_one(&self.db.pool)
        .await?;

        let stored = Message {
            id: message_id,
            conversation_id: id.clone(),
            sender_id: message.sender_id,
            text: message.text,
            created_at: millis_to_utc(created_at)?,
        };
        debug!("[SQLITE] appended {}", stored.document_path());
        self.feed.publish(ChangeEvent::MessageAdded {
            conversation_id: id.clone(),
        });
        Ok(stored)
    }

    async fn list_messages(&self, query: &MessagesQuery) -> Result<Vec<Message>, StoreError> {
        self.fetch_messages(query).await
    }

    async fn list_conversations_for(
        &self,
        user_id: &str,
    ) -> Result<Vec<Conversation>, StoreError> {
        self.fetch_inbox(user_id).await
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
                let store = store.clone();
                let target = target.clone();
                async move { store.fetch_conversation(&target).await }
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
                let store = store.clone();
                let query = query.clone();
                async move { store.fetch_messages(&query).await }
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
                let store = store.clone();
                let target = target.clone();
                async move { store.fetch_inbox(&target).await }
            },
        ))
    }
}
