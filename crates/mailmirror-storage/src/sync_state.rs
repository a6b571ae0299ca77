use crate::mapper::row_to_mailbox_state;
use crate::storage::require_id;
use crate::{Storage, StorageError};
use chrono::Utc;
use mailmirror_core::MailboxState;
use sqlx::SqlitePool;

/// Per-mailbox synchronization cursors.
///
/// Read by the fetcher before talking to the server and written after a fetch
/// completes. Writes are unconditional; the last writer wins.
#[derive(Clone)]
pub struct SyncStateStore {
    pool: SqlitePool,
}

impl SyncStateStore {
    pub fn new(storage: &Storage) -> Self {
        Self {
            pool: storage.pool().clone(),
        }
    }

    pub async fn get(
        &self,
        account_id: &str,
        folder_id: &str,
    ) -> Result<Option<MailboxState>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT account_id, folder_id, mailbox_path, uid_validity, highest_modseq,
                   highest_uid, supports_incremental, updated_at
            FROM mailbox_states
            WHERE account_id = ?1 AND folder_id = ?2
            "#,
        )
        .bind(account_id)
        .bind(folder_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_mailbox_state).transpose()
    }

    /// Upserts `state`, stamping `updated_at` with the current time.
    pub async fn save(&self, state: &MailboxState) -> Result<MailboxState, StorageError> {
        require_id(&state.account_id, "account id")?;
        require_id(&state.folder_id, "folder id")?;

        let mut saved = state.clone();
        saved.updated_at = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO mailbox_states (
              account_id, folder_id, mailbox_path, uid_validity, highest_modseq,
              highest_uid, supports_incremental, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(account_id, folder_id) DO UPDATE SET
              mailbox_path = excluded.mailbox_path,
              uid_validity = excluded.uid_validity,
              highest_modseq = excluded.highest_modseq,
              highest_uid = excluded.highest_uid,
              supports_incremental = excluded.supports_incremental,
              updated_at = excluded.updated_at
            "#,
        )
        .bind(&saved.account_id)
        .bind(&saved.folder_id)
        .bind(&saved.mailbox_path)
        .bind(saved.uid_validity.map(i64::from))
        .bind(saved.highest_modseq.map(|v| v as i64))
        .bind(saved.highest_uid.map(i64::from))
        .bind(saved.supports_incremental as i32)
        .bind(saved.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(saved)
    }

    pub async fn list(&self, account_id: &str) -> Result<Vec<MailboxState>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT account_id, folder_id, mailbox_path, uid_validity, highest_modseq,
                   highest_uid, supports_incremental, updated_at
            FROM mailbox_states
            WHERE account_id = ?1
            ORDER BY mailbox_path ASC
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_mailbox_state).collect()
    }

    pub async fn delete(&self, account_id: &str, folder_id: &str) -> Result<bool, StorageError> {
        let removed = sqlx::query("DELETE FROM mailbox_states WHERE account_id = ?1 AND folder_id = ?2")
            .bind(account_id)
            .bind(folder_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed > 0)
    }
}
