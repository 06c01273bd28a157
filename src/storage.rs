// SQLite persistence for webhook metadata, external accounts, pairing codes
// and conversation logs. Only webhook metadata is stored; credentials stay
// in process memory and are re-populated on workflow activation.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use thiserror::Error;

use crate::llm::Message;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Persisted webhook metadata (no secrets)
#[derive(Debug, Clone)]
pub struct WebhookRow {
    pub workflow_id: String,
    pub user_id: String,
    pub method: String,
    pub auth_type: String,
    pub response_mode: String,
    pub response_template: Option<String>,
    pub response_content_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ExternalAccountRow {
    pub id: i64,
    pub user_id: String,
    pub platform: String,
    pub external_id: String,
    pub external_username: Option<String>,
    pub paired_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct PairingCodeRow {
    pub code: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub attempts: i64,
    pub used: bool,
}

/// Outcome of an atomic pairing-code claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller won the code
    Claimed,
    /// Code exists but is expired, used or out of attempts
    Rejected,
    /// No such code
    Missing,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory database for tests
    pub async fn in_memory() -> StorageResult<Self> {
        // A single connection keeps the in-memory database alive and shared
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> StorageResult<()> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS webhooks (
                workflow_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                method TEXT NOT NULL,
                auth_type TEXT NOT NULL,
                response_mode TEXT NOT NULL,
                response_template TEXT,
                response_content_type TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS external_accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                platform TEXT NOT NULL,
                external_id TEXT NOT NULL,
                external_username TEXT,
                paired_at TEXT NOT NULL,
                last_message_at TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_accounts_platform_external
                ON external_accounts (platform, external_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_accounts_user_platform
                ON external_accounts (user_id, platform);

            CREATE TABLE IF NOT EXISTS pairing_codes (
                code TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                used INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS conversation_logs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_key TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_logs_key ON conversation_logs (conversation_key);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Webhooks
    // ------------------------------------------------------------------

    pub async fn upsert_webhook(&self, row: &WebhookRow) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO webhooks
                (workflow_id, user_id, method, auth_type, response_mode,
                 response_template, response_content_type, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (workflow_id) DO UPDATE SET
                user_id = excluded.user_id,
                method = excluded.method,
                auth_type = excluded.auth_type,
                response_mode = excluded.response_mode,
                response_template = excluded.response_template,
                response_content_type = excluded.response_content_type
            "#,
        )
        .bind(&row.workflow_id)
        .bind(&row.user_id)
        .bind(&row.method)
        .bind(&row.auth_type)
        .bind(&row.response_mode)
        .bind(&row.response_template)
        .bind(&row.response_content_type)
        .bind(row.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_webhook(&self, workflow_id: &str) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM webhooks WHERE workflow_id = ?1")
            .bind(workflow_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_webhooks(&self) -> StorageResult<Vec<WebhookRow>> {
        let rows = sqlx::query(
            "SELECT workflow_id, user_id, method, auth_type, response_mode, \
             response_template, response_content_type, created_at FROM webhooks",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| webhook_from_row(&row)).collect()
    }

    // ------------------------------------------------------------------
    // External accounts
    // ------------------------------------------------------------------

    pub async fn insert_external_account(
        &self,
        user_id: &str,
        platform: &str,
        external_id: &str,
        external_username: Option<&str>,
    ) -> StorageResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO external_accounts
                (user_id, platform, external_id, external_username, paired_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(user_id)
        .bind(platform)
        .bind(external_id)
        .bind(external_username)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_external_account(
        &self,
        platform: &str,
        external_id: &str,
    ) -> StorageResult<Option<ExternalAccountRow>> {
        let row = sqlx::query(
            "SELECT id, user_id, platform, external_id, external_username, paired_at, \
             last_message_at FROM external_accounts WHERE platform = ?1 AND external_id = ?2",
        )
        .bind(platform)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| account_from_row(&r)).transpose()
    }

    pub async fn account_exists_for_user(
        &self,
        user_id: &str,
        platform: &str,
    ) -> StorageResult<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM external_accounts WHERE user_id = ?1 AND platform = ?2",
        )
        .bind(user_id)
        .bind(platform)
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n > 0)
    }

    pub async fn list_external_accounts(
        &self,
        user_id: &str,
    ) -> StorageResult<Vec<ExternalAccountRow>> {
        let rows = sqlx::query(
            "SELECT id, user_id, platform, external_id, external_username, paired_at, \
             last_message_at FROM external_accounts WHERE user_id = ?1 ORDER BY paired_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| account_from_row(&r)).collect()
    }

    /// Delete an account the caller owns; false when absent or not owned
    pub async fn delete_external_account(&self, id: i64, user_id: &str) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM external_accounts WHERE id = ?1 AND user_id = ?2")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn touch_last_message(&self, id: i64) -> StorageResult<()> {
        sqlx::query("UPDATE external_accounts SET last_message_at = ?1 WHERE id = ?2")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pairing codes
    // ------------------------------------------------------------------

    pub async fn insert_pairing_code(
        &self,
        code: &str,
        user_id: &str,
        expires_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO pairing_codes (code, user_id, created_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(code)
        .bind(user_id)
        .bind(Utc::now().to_rfc3339())
        .bind(expires_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_pairing_code(&self, code: &str) -> StorageResult<Option<PairingCodeRow>> {
        let row = sqlx::query(
            "SELECT code, user_id, created_at, expires_at, attempts, used \
             FROM pairing_codes WHERE code = ?1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| pairing_from_row(&r)).transpose()
    }

    /// Every pairing-code row. The table is tiny (few codes per user, 5 min
    /// TTL, periodic sweep), so redemption can scan it instead of running a
    /// point lookup keyed on the guessed value.
    pub async fn list_pairing_codes(&self) -> StorageResult<Vec<PairingCodeRow>> {
        let rows = sqlx::query(
            "SELECT code, user_id, created_at, expires_at, attempts, used FROM pairing_codes",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| pairing_from_row(&r)).collect()
    }

    /// Atomically claim a redeemable code. The single conditional UPDATE is
    /// the arbiter under concurrent redemption: exactly one caller sees a
    /// row change.
    pub async fn claim_pairing_code(
        &self,
        code: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<ClaimOutcome> {
        let result = sqlx::query(
            "UPDATE pairing_codes SET used = 1 \
             WHERE code = ?1 AND used = 0 AND attempts < 5 AND expires_at > ?2",
        )
        .bind(code)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(ClaimOutcome::Claimed);
        }

        match self.get_pairing_code(code).await? {
            Some(_) => Ok(ClaimOutcome::Rejected),
            None => Ok(ClaimOutcome::Missing),
        }
    }

    /// Attempts increment on every failed guess, including guesses against
    /// missing codes for rows that do exist
    pub async fn bump_pairing_attempts(&self, code: &str) -> StorageResult<()> {
        sqlx::query("UPDATE pairing_codes SET attempts = attempts + 1 WHERE code = ?1")
            .bind(code)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_pairing_code(&self, code: &str) -> StorageResult<()> {
        sqlx::query("DELETE FROM pairing_codes WHERE code = ?1")
            .bind(code)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_expired_codes(&self, now: DateTime<Utc>) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM pairing_codes WHERE expires_at <= ?1 OR used = 1")
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Conversation logs
    // ------------------------------------------------------------------

    pub async fn append_conversation(
        &self,
        conversation_key: &str,
        message: &Message,
    ) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO conversation_logs (conversation_key, message, created_at) \
             VALUES (?1, ?2, ?3)",
        )
        .bind(conversation_key)
        .bind(serde_json::to_string(message)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Messages in insertion order, most recent `limit` entries
    pub async fn load_conversation(
        &self,
        conversation_key: &str,
        limit: i64,
    ) -> StorageResult<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT message FROM ( \
                SELECT seq, message FROM conversation_logs \
                WHERE conversation_key = ?1 ORDER BY seq DESC LIMIT ?2 \
             ) ORDER BY seq ASC",
        )
        .bind(conversation_key)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let raw: String = row.try_get("message")?;
                Ok(serde_json::from_str(&raw)?)
            })
            .collect()
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Sqlx(sqlx::Error::Decode(Box::new(e))))
}

fn webhook_from_row(row: &sqlx::sqlite::SqliteRow) -> StorageResult<WebhookRow> {
    let created: String = row.try_get("created_at")?;
    Ok(WebhookRow {
        workflow_id: row.try_get("workflow_id")?,
        user_id: row.try_get("user_id")?,
        method: row.try_get("method")?,
        auth_type: row.try_get("auth_type")?,
        response_mode: row.try_get("response_mode")?,
        response_template: row.try_get("response_template")?,
        response_content_type: row.try_get("response_content_type")?,
        created_at: parse_ts(&created)?,
    })
}

fn account_from_row(row: &sqlx::sqlite::SqliteRow) -> StorageResult<ExternalAccountRow> {
    let paired: String = row.try_get("paired_at")?;
    let last: Option<String> = row.try_get("last_message_at")?;
    Ok(ExternalAccountRow {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        platform: row.try_get("platform")?,
        external_id: row.try_get("external_id")?,
        external_username: row.try_get("external_username")?,
        paired_at: parse_ts(&paired)?,
        last_message_at: last.map(|raw| parse_ts(&raw)).transpose()?,
    })
}

fn pairing_from_row(row: &sqlx::sqlite::SqliteRow) -> StorageResult<PairingCodeRow> {
    let created: String = row.try_get("created_at")?;
    let expires: String = row.try_get("expires_at")?;
    let used: i64 = row.try_get("used")?;
    Ok(PairingCodeRow {
        code: row.try_get("code")?,
        user_id: row.try_get("user_id")?,
        created_at: parse_ts(&created)?,
        expires_at: parse_ts(&expires)?,
        attempts: row.try_get("attempts")?,
        used: used != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ContentPart, Role};
    use chrono::Duration;

    #[tokio::test]
    async fn webhook_round_trip() {
        let store = Store::in_memory().await.unwrap();
        let row = WebhookRow {
            workflow_id: "wf-1".to_string(),
            user_id: "user-1".to_string(),
            method: "POST".to_string(),
            auth_type: "bearer".to_string(),
            response_mode: "immediate".to_string(),
            response_template: None,
            response_content_type: Some("application/json".to_string()),
            created_at: Utc::now(),
        };

        store.upsert_webhook(&row).await.unwrap();
        let listed = store.list_webhooks().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].workflow_id, "wf-1");
        assert_eq!(listed[0].auth_type, "bearer");

        assert!(store.delete_webhook("wf-1").await.unwrap());
        assert!(!store.delete_webhook("wf-1").await.unwrap());
    }

    #[tokio::test]
    async fn external_account_uniqueness() {
        let store = Store::in_memory().await.unwrap();
        store
            .insert_external_account("u1", "telegram", "1234", Some("alice"))
            .await
            .unwrap();

        // Same (platform, external_id) rejected
        assert!(store
            .insert_external_account("u2", "telegram", "1234", None)
            .await
            .is_err());

        // Same (user, platform) rejected
        assert!(store
            .insert_external_account("u1", "telegram", "9999", None)
            .await
            .is_err());

        // Different platform is fine
        store
            .insert_external_account("u1", "discord", "1234", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn account_delete_requires_ownership() {
        let store = Store::in_memory().await.unwrap();
        let id = store
            .insert_external_account("u1", "telegram", "42", None)
            .await
            .unwrap();

        assert!(!store.delete_external_account(id, "intruder").await.unwrap());
        assert!(store.delete_external_account(id, "u1").await.unwrap());
    }

    #[tokio::test]
    async fn pairing_claim_is_single_winner() {
        let store = Store::in_memory().await.unwrap();
        let expires = Utc::now() + Duration::minutes(5);
        store
            .insert_pairing_code("ABCD2345", "u1", expires)
            .await
            .unwrap();

        let now = Utc::now();
        assert_eq!(
            store.claim_pairing_code("ABCD2345", now).await.unwrap(),
            ClaimOutcome::Claimed
        );
        assert_eq!(
            store.claim_pairing_code("ABCD2345", now).await.unwrap(),
            ClaimOutcome::Rejected
        );
        assert_eq!(
            store.claim_pairing_code("ZZZZ9999", now).await.unwrap(),
            ClaimOutcome::Missing
        );
    }

    #[tokio::test]
    async fn expired_code_rejected() {
        let store = Store::in_memory().await.unwrap();
        let expires = Utc::now() - Duration::minutes(1);
        store
            .insert_pairing_code("EXPIRED2", "u1", expires)
            .await
            .unwrap();

        assert_eq!(
            store
                .claim_pairing_code("EXPIRED2", Utc::now())
                .await
                .unwrap(),
            ClaimOutcome::Rejected
        );
    }

    #[tokio::test]
    async fn attempt_exhaustion_blocks_claims() {
        let store = Store::in_memory().await.unwrap();
        let expires = Utc::now() + Duration::minutes(5);
        store
            .insert_pairing_code("GOODCODE", "u1", expires)
            .await
            .unwrap();

        for _ in 0..5 {
            store.bump_pairing_attempts("GOODCODE").await.unwrap();
        }

        assert_eq!(
            store
                .claim_pairing_code("GOODCODE", Utc::now())
                .await
                .unwrap(),
            ClaimOutcome::Rejected
        );
    }

    #[tokio::test]
    async fn conversation_log_round_trip_preserves_order_and_parts() {
        let store = Store::in_memory().await.unwrap();
        let key = "external-telegram-42";

        let mut with_parts = Message::user("");
        with_parts.parts = Some(vec![
            ContentPart::Text {
                text: "look".to_string(),
            },
            ContentPart::Image {
                media_type: "image/png".to_string(),
                data: "AAAA".to_string(),
            },
        ]);

        store
            .append_conversation(key, &Message::user("first"))
            .await
            .unwrap();
        store
            .append_conversation(key, &Message::assistant("second"))
            .await
            .unwrap();
        store.append_conversation(key, &with_parts).await.unwrap();

        let loaded = store.load_conversation(key, 100).await.unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0].content, "first");
        assert_eq!(loaded[1].role, Role::Assistant);
        assert_eq!(
            loaded[2].parts.as_ref().unwrap().len(),
            2,
            "parts must survive the round trip"
        );
    }

    #[tokio::test]
    async fn conversation_log_limit_keeps_most_recent() {
        let store = Store::in_memory().await.unwrap();
        let key = "external-telegram-7";
        for i in 0..10 {
            store
                .append_conversation(key, &Message::user(format!("msg {}", i)))
                .await
                .unwrap();
        }

        let loaded = store.load_conversation(key, 3).await.unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0].content, "msg 7");
        assert_eq!(loaded[2].content, "msg 9");
    }
}
