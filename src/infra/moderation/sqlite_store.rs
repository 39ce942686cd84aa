// SQLite-backed moderation store.
//
// Tables:
// - forum_posts: Posts with their moderation state
// - forum_topics: Topics, mirroring their first post's moderation state
// - user_moderation_details: Per-user moderation state
// - topic_follows: Which users follow which topics
// - post_moderation_records: Audit trail of moderation actions

use crate::core::moderation::{
    ModerationChangeSet, ModerationState, ModerationStore, Post, PostModerationRecord, StoreError,
    Topic, UserModerationDetail,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;

pub struct SqliteModerationStore {
    pool: Pool<Sqlite>,
}

impl SqliteModerationStore {
    /// Open (or create) the database at `database_url` and run migrations.
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        // Ensure the file exists if it's a file path
        let path_str = database_url.trim_start_matches("sqlite://");
        if !database_url.contains(":memory:") && !Path::new(path_str).exists() {
            if let Some(parent) = Path::new(path_str).parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::File::create(path_str)?;
        }

        let conn_str = if database_url.starts_with("sqlite:") {
            database_url.to_string()
        } else {
            format!("sqlite://{}", database_url)
        };

        let pool = SqlitePoolOptions::new().connect(&conn_str).await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Wrap an existing pool. Call `migrate` before using the store.
    pub fn from_pool(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Run database migrations to create required tables.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS forum_posts (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL,
                topic_id INTEGER NOT NULL,
                content TEXT NOT NULL,
                moderation_state TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_forum_posts_topic_user
                ON forum_posts(topic_id, user_id);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS forum_topics (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL,
                first_post_id INTEGER NOT NULL,
                moderation_state TEXT NOT NULL DEFAULT 'pending'
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_moderation_details (
                user_id INTEGER PRIMARY KEY,
                moderation_state TEXT NOT NULL DEFAULT 'pending',
                moderation_state_changed_at TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS topic_follows (
                user_id INTEGER NOT NULL,
                topic_id INTEGER NOT NULL,
                PRIMARY KEY (user_id, topic_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS post_moderation_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                post_id INTEGER NOT NULL,
                topic_id INTEGER NOT NULL,
                post_user_id INTEGER NOT NULL,
                post_content TEXT NOT NULL,
                moderator_id INTEGER NOT NULL,
                previous_state TEXT NOT NULL,
                moderation_state TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    pub async fn follow_topic(&self, user_id: u64, topic_id: u64) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO topic_follows (user_id, topic_id) VALUES (?, ?)")
            .bind(user_id as i64)
            .bind(topic_id as i64)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    pub async fn unfollow_topic(&self, user_id: u64, topic_id: u64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM topic_follows WHERE user_id = ? AND topic_id = ?")
            .bind(user_id as i64)
            .bind(topic_id as i64)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}

#[async_trait]
impl ModerationStore for SqliteModerationStore {
    async fn get_post(&self, post_id: u64) -> Result<Option<Post>, StoreError> {
        let row = sqlx::query("SELECT * FROM forum_posts WHERE id = ?")
            .bind(post_id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.as_ref().map(row_to_post).transpose()
    }

    async fn get_topic(&self, topic_id: u64) -> Result<Option<Topic>, StoreError> {
        let row = sqlx::query("SELECT * FROM forum_topics WHERE id = ?")
            .bind(topic_id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        if let Some(row) = row {
            Ok(Some(Topic {
                id: row.get::<i64, _>("id") as u64,
                user_id: row.get::<i64, _>("user_id") as u64,
                first_post_id: row.get::<i64, _>("first_post_id") as u64,
                moderation_state: parse_state(row.get("moderation_state"))?,
            }))
        } else {
            Ok(None)
        }
    }

    async fn get_user_detail(
        &self,
        user_id: u64,
    ) -> Result<Option<UserModerationDetail>, StoreError> {
        let row = sqlx::query("SELECT * FROM user_moderation_details WHERE user_id = ?")
            .bind(user_id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        if let Some(row) = row {
            let changed_at: Option<String> = row.get("moderation_state_changed_at");
            Ok(Some(UserModerationDetail {
                user_id,
                moderation_state: parse_state(row.get("moderation_state"))?,
                moderation_state_changed_at: changed_at
                    .as_deref()
                    .map(parse_timestamp)
                    .transpose()?,
            }))
        } else {
            Ok(None)
        }
    }

    async fn update_post(&self, post: Post) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO forum_posts (id, user_id, topic_id, content, moderation_state, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                topic_id = excluded.topic_id,
                content = excluded.content,
                moderation_state = excluded.moderation_state,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(post.id as i64)
        .bind(post.user_id as i64)
        .bind(post.topic_id as i64)
        .bind(&post.content)
        .bind(post.moderation_state.as_str())
        .bind(post.created_at.to_rfc3339())
        .bind(post.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn update_topic(&self, topic: Topic) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO forum_topics (id, user_id, first_post_id, moderation_state)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                first_post_id = excluded.first_post_id,
                moderation_state = excluded.moderation_state
            "#,
        )
        .bind(topic.id as i64)
        .bind(topic.user_id as i64)
        .bind(topic.first_post_id as i64)
        .bind(topic.moderation_state.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn update_user_detail(&self, detail: UserModerationDetail) -> Result<(), StoreError> {
        sqlx::query(UPSERT_USER_DETAIL)
            .bind(detail.user_id as i64)
            .bind(detail.moderation_state.as_str())
            .bind(detail.moderation_state_changed_at.map(|t| t.to_rfc3339()))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn list_posts_by_author_in_topic(
        &self,
        user_id: u64,
        topic_id: u64,
    ) -> Result<Vec<Post>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM forum_posts
            WHERE user_id = ? AND topic_id = ?
            ORDER BY id
            "#,
        )
        .bind(user_id as i64)
        .bind(topic_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter().map(row_to_post).collect()
    }

    async fn list_topic_followers(&self, topic_id: u64) -> Result<Vec<u64>, StoreError> {
        let rows = sqlx::query("SELECT user_id FROM topic_follows WHERE topic_id = ? ORDER BY user_id")
            .bind(topic_id as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(rows
            .iter()
            .map(|row| row.get::<i64, _>("user_id") as u64)
            .collect())
    }

    async fn commit_moderation(&self, changes: &ModerationChangeSet) -> Result<(), StoreError> {
        // Dropping the transaction without committing rolls everything back.
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        for (post_id, state) in &changes.post_states {
            let result = sqlx::query("UPDATE forum_posts SET moderation_state = ? WHERE id = ?")
                .bind(state.as_str())
                .bind(*post_id as i64)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;

            if result.rows_affected() == 0 {
                return Err(StoreError::InvalidData(format!("post {} does not exist", post_id)));
            }
        }

        if let Some((topic_id, user_id)) = changes.block_author_posts {
            sqlx::query(
                "UPDATE forum_posts SET moderation_state = 'blocked' WHERE topic_id = ? AND user_id = ?",
            )
            .bind(topic_id as i64)
            .bind(user_id as i64)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        }

        if let Some((topic_id, state)) = changes.topic_state {
            let result = sqlx::query("UPDATE forum_topics SET moderation_state = ? WHERE id = ?")
                .bind(state.as_str())
                .bind(topic_id as i64)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;

            if result.rows_affected() == 0 {
                return Err(StoreError::InvalidData(format!(
                    "topic {} does not exist",
                    topic_id
                )));
            }
        }

        if let Some(detail) = &changes.user_detail {
            sqlx::query(UPSERT_USER_DETAIL)
                .bind(detail.user_id as i64)
                .bind(detail.moderation_state.as_str())
                .bind(detail.moderation_state_changed_at.map(|t| t.to_rfc3339()))
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }

        let record = &changes.record;
        sqlx::query(
            r#"
            INSERT INTO post_moderation_records (
                post_id, topic_id, post_user_id, post_content, moderator_id,
                previous_state, moderation_state, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.post_id as i64)
        .bind(record.topic_id as i64)
        .bind(record.post_user_id as i64)
        .bind(&record.post_content)
        .bind(record.moderator_id as i64)
        .bind(record.previous_state.as_str())
        .bind(record.moderation_state.as_str())
        .bind(record.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn list_moderation_records(
        &self,
        post_id: u64,
    ) -> Result<Vec<PostModerationRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM post_moderation_records WHERE post_id = ? ORDER BY id")
            .bind(post_id as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(PostModerationRecord {
                post_id: row.get::<i64, _>("post_id") as u64,
                topic_id: row.get::<i64, _>("topic_id") as u64,
                post_user_id: row.get::<i64, _>("post_user_id") as u64,
                post_content: row.get("post_content"),
                moderator_id: row.get::<i64, _>("moderator_id") as u64,
                previous_state: parse_state(row.get("previous_state"))?,
                moderation_state: parse_state(row.get("moderation_state"))?,
                created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
            });
        }
        Ok(records)
    }
}

const UPSERT_USER_DETAIL: &str = r#"
    INSERT INTO user_moderation_details (user_id, moderation_state, moderation_state_changed_at)
    VALUES (?, ?, ?)
    ON CONFLICT(user_id) DO UPDATE SET
        moderation_state = excluded.moderation_state,
        moderation_state_changed_at = excluded.moderation_state_changed_at
"#;

/// SQLITE_BUSY / SQLITE_LOCKED and their extended codes mean another writer
/// holds the database; those are worth retrying.
fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db_err) => {
            let busy = db_err
                .code()
                .map(|code| matches!(code.as_ref(), "5" | "6" | "261" | "262" | "517"))
                .unwrap_or(false);
            if busy {
                StoreError::Conflict(err.to_string())
            } else {
                StoreError::Database(err.to_string())
            }
        }
        sqlx::Error::PoolTimedOut => StoreError::Conflict(err.to_string()),
        _ => StoreError::Database(err.to_string()),
    }
}

fn parse_state(value: String) -> Result<ModerationState, StoreError> {
    value
        .parse::<ModerationState>()
        .map_err(|e| StoreError::InvalidData(e.to_string()))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidData(format!("bad timestamp {:?}: {}", value, e)))
}

fn row_to_post(row: &SqliteRow) -> Result<Post, StoreError> {
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(Post {
        id: row.get::<i64, _>("id") as u64,
        user_id: row.get::<i64, _>("user_id") as u64,
        topic_id: row.get::<i64, _>("topic_id") as u64,
        content: row.get("content"),
        moderation_state: parse_state(row.get("moderation_state"))?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}
