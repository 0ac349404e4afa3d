use listing_inbox::server::config::ChatConfig;
use listing_inbox::server::database::Database;
use sqlx::Row;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let db_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| ChatConfig::from_env().database_url);
    println!("Connecting to {}", db_path);
    let db = Database::connect(&db_path).await?;
    db.migrate().await?;

    println!("\n-- conversations --");
    let rows = sqlx::query(
        "SELECT id, participant_a, participant_b, last_message_text, last_message_sender_id, created_at \
         FROM conversations ORDER BY created_at",
    )
    .fetch_all(&db.pool)
    .await?;
    for r in rows.iter() {
        let id: String = r.try_get("id").unwrap_or_default();
        let a: String = r.try_get("participant_a").unwrap_or_default();
        let b: String = r.try_get("participant_b").unwrap_or_default();
        let last_text: Option<String> = r.try_get("last_message_text").unwrap_or(None);
        let last_sender: Option<String> = r.try_get("last_message_sender_id").unwrap_or(None);
        let created_at: i64 = r.try_get("created_at").unwrap_or(0);
        println!(
            "id={} participants=[{}, {}] created_at={} last_sender={} last_len={}",
            id,
            a,
            b,
            created_at,
            last_sender.unwrap_or_default(),
            last_text.map(|t| t.len()).unwrap_or(0)
        );
    }

    println!("\n-- messages (last 10) --");
    let rows = sqlx::query(
        "SELECT seq, id, conversation_id, sender_id, text, created_at FROM messages ORDER BY seq DESC LIMIT 10",
    )
    .fetch_all(&db.pool)
    .await?;
    for r in rows.iter() {
        let seq: i64 = r.try_get("seq").unwrap_or(0);
        let id: String = r.try_get("id").unwrap_or_default();
        let conversation_id: String = r.try_get("conversation_id").unwrap_or_default();
        let sender_id: String = r.try_get("sender_id").unwrap_or_default();
        let text: String = r.try_get("text").unwrap_or_default();
        let created_at: i64 = r.try_get("created_at").unwrap_or(0);
        println!(
            "seq={} id={} conversation_id={} sender_id={} text_len={} created_at={}",
            seq,
            id,
            conversation_id,
            sender_id,
            text.len(),
            created_at
        );
    }

    Ok(())
}
