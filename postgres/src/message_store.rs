//! `PostgresDurableStore`: the system of record for chat messages.

use chatsync_core::{
    BoxFuture, ChatMetadataUpdate, DateTime, DurableStore, DurableStoreError, MessageData,
    MessageQuery, MessageType, SessionHistoryEntry, Utc, WriteOutcome,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

// Newest first; mirrors the in-memory ordering with the tie-breakers
// reversed. `COLLATE "C"` keeps id comparison bytewise.
const NEWEST_FIRST: &str = r#"ORDER BY created_at DESC, (message_type = 'assistant') DESC, id COLLATE "C" DESC"#;

/// `PostgreSQL`-backed [`DurableStore`].
///
/// Message ids are the primary key of `chat_messages`, so re-writing a
/// message after a partial failure is a no-op reported as
/// [`WriteOutcome::Duplicate`].
#[derive(Clone)]
pub struct PostgresDurableStore {
    pool: PgPool,
}

impl PostgresDurableStore {
    /// Connect a pool of at most `max_connections`.
    ///
    /// # Errors
    ///
    /// Returns [`DurableStoreError::Database`] if the database is unreachable.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, DurableStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(database)?;
        tracing::info!(max_connections, "Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations.
    ///
    /// # Errors
    ///
    /// Returns [`DurableStoreError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), DurableStoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DurableStoreError::Database(e.to_string()))?;
        tracing::info!("Database migrations applied");
        Ok(())
    }

    async fn insert_message(&self, chat_id: &str, message: &MessageData) -> Result<WriteOutcome, DurableStoreError> {
        let result = sqlx::query(
            r"
            INSERT INTO chat_messages (id, chat_id, user_id, content, message_type, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            ",
        )
        .bind(&message.id)
        .bind(chat_id)
        .bind(&message.user_id)
        .bind(&message.content)
        .bind(message.message_type.as_str())
        .bind(&message.metadata)
        .bind(message.timestamp)
        .execute(&self.pool)
        .await
        .map_err(database)?;

        let outcome = if result.rows_affected() == 1 {
            WriteOutcome::Inserted
        } else {
            WriteOutcome::Duplicate
        };
        metrics::counter!(
            "chatsync_durable_writes_total",
            "outcome" => match outcome {
                WriteOutcome::Inserted => "inserted",
                WriteOutcome::Duplicate => "duplicate",
            }
        )
        .increment(1);
        Ok(outcome)
    }

    async fn select_messages(&self, chat_id: &str, query: &MessageQuery) -> Result<Vec<MessageData>, DurableStoreError> {
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(query.offset).unwrap_or(i64::MAX);

        let rows = match &query.before_id {
            None => {
                sqlx::query(&format!(
                    r"
                    SELECT id, user_id, content, message_type, metadata, created_at
                    FROM chat_messages
                    WHERE chat_id = $1
                    {NEWEST_FIRST}
                    LIMIT $2 OFFSET $3
                    "
                ))
                .bind(chat_id)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
            }
            Some(before_id) => {
                sqlx::query(&format!(
                    r#"
                    WITH anchor AS (
                        SELECT created_at, (message_type = 'assistant') AS is_assistant, id
                        FROM chat_messages
                        WHERE chat_id = $1 AND id = $2
                    )
                    SELECT m.id, m.user_id, m.content, m.message_type, m.metadata, m.created_at
                    FROM chat_messages m, anchor a
                    WHERE m.chat_id = $1
                      AND (m.created_at, (m.message_type = 'assistant'), m.id COLLATE "C")
                          < (a.created_at, a.is_assistant, a.id COLLATE "C")
                    {NEWEST_FIRST}
                    LIMIT $3 OFFSET $4
                    "#
                ))
                .bind(chat_id)
                .bind(before_id)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(database)?;

        Ok(rows
            .iter()
            .filter_map(|row| match row_to_message(row) {
                Ok(message) => Some(message),
                Err(e) => {
                    tracing::warn!(chat_id, error = %e, "Skipping undecodable message row");
                    None
                }
            })
            .collect())
    }

    async fn upsert_metadata(&self, update: &ChatMetadataUpdate) -> Result<(), DurableStoreError> {
        sqlx::query(
            r"
            INSERT INTO chat_sync_metadata (chat_id, synced_message_count, last_session_id, participant_count, last_synced_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (chat_id) DO UPDATE SET
                synced_message_count = chat_sync_metadata.synced_message_count + EXCLUDED.synced_message_count,
                last_session_id = EXCLUDED.last_session_id,
                participant_count = EXCLUDED.participant_count,
                last_synced_at = EXCLUDED.last_synced_at
            ",
        )
        .bind(&update.chat_id)
        .bind(i64::try_from(update.synced_message_count).unwrap_or(i64::MAX))
        .bind(&update.last_session_id)
        .bind(i32::try_from(update.participant_count).unwrap_or(i32::MAX))
        .bind(update.last_synced_at)
        .execute(&self.pool)
        .await
        .map_err(database)?;
        Ok(())
    }

    async fn upsert_history(&self, entry: &SessionHistoryEntry) -> Result<(), DurableStoreError> {
        sqlx::query(
            r"
            INSERT INTO chat_session_history
                (session_id, chat_id, message_count, participant_count, started_at, ended_at, synced_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (session_id) DO UPDATE SET
                message_count = EXCLUDED.message_count,
                participant_count = EXCLUDED.participant_count,
                ended_at = EXCLUDED.ended_at,
                synced_at = EXCLUDED.synced_at
            ",
        )
        .bind(&entry.session_id)
        .bind(&entry.chat_id)
        .bind(i32::try_from(entry.message_count).unwrap_or(i32::MAX))
        .bind(i32::try_from(entry.participant_count).unwrap_or(i32::MAX))
        .bind(entry.started_at)
        .bind(entry.ended_at)
        .bind(entry.synced_at)
        .execute(&self.pool)
        .await
        .map_err(database)?;
        Ok(())
    }
}

fn database(e: sqlx::Error) -> DurableStoreError {
    DurableStoreError::Database(e.to_string())
}

fn row_to_message(row: &PgRow) -> Result<MessageData, DurableStoreError> {
    let get_err = |e: sqlx::Error| DurableStoreError::Serialization(e.to_string());

    let message_type: String = row.try_get("message_type").map_err(get_err)?;
    let message_type = MessageType::parse(&message_type).ok_or_else(|| {
        DurableStoreError::Serialization(format!("Unknown message type: {message_type}"))
    })?;
    let timestamp: DateTime<Utc> = row.try_get("created_at").map_err(get_err)?;

    Ok(MessageData {
        id: row.try_get("id").map_err(get_err)?,
        content: row.try_get("content").map_err(get_err)?,
        user_id: row.try_get("user_id").map_err(get_err)?,
        timestamp,
        message_type,
        metadata: row.try_get("metadata").map_err(get_err)?,
        synced_to_db: true,
    })
}

impl DurableStore for PostgresDurableStore {
    fn add_message(
        &self,
        chat_id: &str,
        message: &MessageData,
    ) -> BoxFuture<'_, Result<WriteOutcome, DurableStoreError>> {
        let chat_id = chat_id.to_string();
        let message = message.clone();
        Box::pin(async move { self.insert_message(&chat_id, &message).await })
    }

    fn update_chat_metadata(
        &self,
        update: ChatMetadataUpdate,
    ) -> BoxFuture<'_, Result<(), DurableStoreError>> {
        Box::pin(async move { self.upsert_metadata(&update).await })
    }

    fn get_messages(
        &self,
        chat_id: &str,
        query: MessageQuery,
    ) -> BoxFuture<'_, Result<Vec<MessageData>, DurableStoreError>> {
        let chat_id = chat_id.to_string();
        Box::pin(async move { self.select_messages(&chat_id, &query).await })
    }

    fn record_session_history(
        &self,
        entry: SessionHistoryEntry,
    ) -> BoxFuture<'_, Result<(), DurableStoreError>> {
        Box::pin(async move { self.upsert_history(&entry).await })
    }
}

impl std::fmt::Debug for PostgresDurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresDurableStore")
            .field("pool_size", &self.pool.size())
            .finish_non_exhaustive()
    }
}
