use crate::filter::Clause;
use crate::mapper::{
    row_to_account, row_to_attachment, row_to_folder, row_to_message, MESSAGE_COLUMNS,
};
use crate::threading::refresh_thread_aggregates;
use crate::{schema, StorageError};
use chrono::Utc;
use mailmirror_core::{folder_id_for, Account, FlagChange, MailFolder, MailMessage};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const ID_CHUNK: usize = 200;

#[derive(Debug, Clone)]
pub struct StorageOptions {
    pub max_connections: u32,
    pub busy_timeout: Duration,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            max_connections: 8,
            busy_timeout: Duration::from_secs(30),
        }
    }
}

/// Rows touched by [`Storage::rename_folder_prefix`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PrefixRename {
    pub messages: u64,
    pub folders: u64,
    pub mailbox_states: u64,
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn connect(db_path: &Path, options: StorageOptions) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());
        let connect = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(options.busy_timeout)
            .pragma("temp_store", "memory");

        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections.max(1))
            .connect_with(connect)
            .await?;

        schema::migrate(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Waits for open connections to be returned and closes the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // -- accounts ------------------------------------------------------------

    pub async fn upsert_account(&self, account: &Account) -> Result<(), StorageError> {
        require_id(&account.id, "account id")?;
        let settings = serde_json::to_string(&account.settings)?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO accounts (
              id, display_name, address, avatar_url, settings_json, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            ON CONFLICT(id) DO UPDATE SET
              display_name = excluded.display_name,
              address = excluded.address,
              avatar_url = excluded.avatar_url,
              settings_json = excluded.settings_json,
              updated_at = excluded.updated_at
            "#,
        )
        .bind(&account.id)
        .bind(&account.display_name)
        .bind(&account.address)
        .bind(&account.avatar_url)
        .bind(settings)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_account(&self, account_id: &str) -> Result<Option<Account>, StorageError> {
        let row = sqlx::query(
            "SELECT id, display_name, address, avatar_url, settings_json FROM accounts WHERE id = ?1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_account).transpose()
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, display_name, address, avatar_url, settings_json
            FROM accounts
            ORDER BY address
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_account).collect()
    }

    /// Removes the account and everything stored for it.
    pub async fn delete_account(&self, account_id: &str) -> Result<(), StorageError> {
        require_id(account_id, "account id")?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM messages_fts WHERE rowid IN (SELECT seq FROM messages WHERE account_id = ?1)",
        )
        .bind(account_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM attachments WHERE message_id IN (SELECT id FROM messages WHERE account_id = ?1)",
        )
        .bind(account_id)
        .execute(&mut *tx)
        .await?;
        for table in ["message_references", "messages", "threads", "folders", "mailbox_states"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE account_id = ?1"))
                .bind(account_id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM accounts WHERE id = ?1")
            .bind(account_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        tracing::info!(account_id, "deleted account");
        Ok(())
    }

    // -- folders -------------------------------------------------------------

    /// Stores the current folder list of an account; folders missing from
    /// `folders` are removed.
    pub async fn replace_folders(
        &self,
        account_id: &str,
        folders: &[MailFolder],
    ) -> Result<(), StorageError> {
        require_id(account_id, "account id")?;
        let mut tx = self.pool.begin().await?;

        let mut keep = BTreeSet::new();
        for folder in folders {
            if folder.mailbox_path.is_empty() {
                return Err(StorageError::InvalidInput(format!(
                    "folder `{}` has no mailbox path",
                    folder.id
                )));
            }
            let id = if folder.id.is_empty() {
                folder_id_for(account_id, &folder.mailbox_path)
            } else {
                folder.id.clone()
            };
            let flags = serde_json::to_string(&folder.flags)?;

            sqlx::query(
                r#"
                INSERT INTO folders (
                  id, account_id, mailbox_path, name, parent_id, special_use, flags_json, delimiter
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(id) DO UPDATE SET
                  account_id = excluded.account_id,
                  mailbox_path = excluded.mailbox_path,
                  name = excluded.name,
                  parent_id = excluded.parent_id,
                  special_use = excluded.special_use,
                  flags_json = excluded.flags_json,
                  delimiter = excluded.delimiter
                "#,
            )
            .bind(&id)
            .bind(account_id)
            .bind(&folder.mailbox_path)
            .bind(&folder.name)
            .bind(&folder.parent_id)
            .bind(folder.special_use.map(|s| s.as_str()))
            .bind(flags)
            .bind(&folder.delimiter)
            .execute(&mut *tx)
            .await?;

            keep.insert(id);
        }

        let existing: Vec<String> = sqlx::query_scalar("SELECT id FROM folders WHERE account_id = ?1")
            .bind(account_id)
            .fetch_all(&mut *tx)
            .await?;
        let mut removed = 0_u64;
        for stale in existing.iter().filter(|id| !keep.contains(*id)) {
            removed += sqlx::query("DELETE FROM folders WHERE id = ?1")
                .bind(stale)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        tx.commit().await?;
        tracing::debug!(account_id, stored = keep.len(), removed, "replaced folder list");
        Ok(())
    }

    /// Folders of an account with message counts taken from the message table.
    pub async fn list_folders(&self, account_id: &str) -> Result<Vec<MailFolder>, StorageError> {
        require_id(account_id, "account id")?;
        let rows = sqlx::query(
            r#"
            SELECT
              f.id, f.account_id, f.mailbox_path, f.name, f.parent_id,
              f.special_use, f.flags_json, f.delimiter,
              (SELECT COUNT(*) FROM messages m
                WHERE m.account_id = f.account_id AND m.folder_id = f.id) AS total_count,
              (SELECT COUNT(*) FROM messages m
                WHERE m.account_id = f.account_id AND m.folder_id = f.id AND m.seen = 0) AS unread_count
            FROM folders f
            WHERE f.account_id = ?1
            ORDER BY f.mailbox_path ASC
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_folder).collect()
    }

    // -- messages ------------------------------------------------------------

    pub async fn get_message(&self, message_id: &str) -> Result<Option<MailMessage>, StorageError> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.id = ?1"))
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut messages = vec![row_to_message(&row)?];
        load_attachments(&self.pool, &mut messages).await?;
        Ok(messages.pop())
    }

    /// Deletes messages with their attachments and full-text rows, then
    /// recomputes the aggregates of the threads they belonged to.
    pub async fn delete_messages(
        &self,
        account_id: &str,
        message_ids: &[String],
    ) -> Result<u64, StorageError> {
        require_id(account_id, "account id")?;
        if message_ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let threads = threads_of(&mut *tx, account_id, message_ids).await?;

        let mut deleted = 0;
        for chunk in message_ids.chunks(ID_CHUNK) {
            id_scoped(
                "DELETE FROM messages_fts WHERE rowid IN (SELECT seq FROM messages WHERE account_id = ",
                account_id,
                chunk,
                ")",
            )
            .build()
            .execute(&mut *tx)
            .await?;
            id_scoped(
                "DELETE FROM attachments WHERE message_id IN (SELECT id FROM messages WHERE account_id = ",
                account_id,
                chunk,
                ")",
            )
            .build()
            .execute(&mut *tx)
            .await?;
            id_scoped(
                "DELETE FROM message_references WHERE message_id IN (SELECT id FROM messages WHERE account_id = ",
                account_id,
                chunk,
                ")",
            )
            .build()
            .execute(&mut *tx)
            .await?;
            deleted += id_scoped("DELETE FROM messages WHERE account_id = ", account_id, chunk, "")
                .build()
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        let refreshed = refresh_thread_aggregates(&mut *tx, account_id, Some(&threads)).await?;
        tx.commit().await?;

        tracing::info!(account_id, deleted, threads = refreshed, "deleted messages");
        Ok(deleted)
    }

    /// Applies flag changes the server has already accepted.
    pub async fn update_flags(
        &self,
        account_id: &str,
        message_ids: &[String],
        change: FlagChange,
    ) -> Result<u64, StorageError> {
        require_id(account_id, "account id")?;
        if message_ids.is_empty() || change.is_empty() {
            return Ok(0);
        }

        let as_int = |value: Option<bool>| value.map(|v| v as i64);
        let mut tx = self.pool.begin().await?;
        let mut updated = 0;
        for chunk in message_ids.chunks(ID_CHUNK) {
            let mut builder = QueryBuilder::<Sqlite>::new("UPDATE messages SET seen = COALESCE(");
            builder.push_bind(as_int(change.seen));
            builder.push(", seen), answered = COALESCE(");
            builder.push_bind(as_int(change.answered));
            builder.push(", answered), flagged = COALESCE(");
            builder.push_bind(as_int(change.flagged));
            builder.push(", flagged), deleted = COALESCE(");
            builder.push_bind(as_int(change.deleted));
            builder.push(", deleted), draft = COALESCE(");
            builder.push_bind(as_int(change.draft));
            builder.push(", draft) WHERE account_id = ");
            builder.push_bind(account_id.to_string());
            builder.push(" AND id IN (");
            Clause::default()
                .bind_text_list(chunk.iter().map(String::as_str))
                .push_to(&mut builder);
            builder.push(")");
            updated += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        if change.seen.is_some() {
            let threads = threads_of(&mut *tx, account_id, message_ids).await?;
            refresh_thread_aggregates(&mut *tx, account_id, Some(&threads)).await?;
        }
        tx.commit().await?;
        Ok(updated)
    }

    /// Moves messages to another mailbox. Their ids and thread ids stay.
    pub async fn move_messages(
        &self,
        account_id: &str,
        message_ids: &[String],
        mailbox_path: &str,
    ) -> Result<u64, StorageError> {
        require_id(account_id, "account id")?;
        require_id(mailbox_path, "mailbox path")?;
        let folder_id = folder_id_for(account_id, mailbox_path);

        let mut tx = self.pool.begin().await?;
        let mut moved = 0;
        for chunk in message_ids.chunks(ID_CHUNK) {
            let mut builder = QueryBuilder::<Sqlite>::new("UPDATE messages SET folder_id = ");
            builder.push_bind(folder_id.clone());
            builder.push(", mailbox_path = ");
            builder.push_bind(mailbox_path.to_string());
            builder.push(" WHERE account_id = ");
            builder.push_bind(account_id.to_string());
            builder.push(" AND id IN (");
            Clause::default()
                .bind_text_list(chunk.iter().map(String::as_str))
                .push_to(&mut builder);
            builder.push(")");
            moved += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(moved)
    }

    /// Rewrites mailbox paths starting with `old_prefix` to start with
    /// `new_prefix` on messages, folders and sync state, keeping message ids.
    ///
    /// The match is a plain string prefix: renaming `Work` also rewrites
    /// `Workshop`.
    pub async fn rename_folder_prefix(
        &self,
        account_id: &str,
        old_prefix: &str,
        new_prefix: &str,
    ) -> Result<PrefixRename, StorageError> {
        require_id(account_id, "account id")?;
        require_id(old_prefix, "old mailbox prefix")?;
        require_id(new_prefix, "new mailbox prefix")?;
        if old_prefix == new_prefix {
            return Ok(PrefixRename::default());
        }

        let mut tx = self.pool.begin().await?;
        let mut report = PrefixRename::default();

        for table in ["messages", "mailbox_states"] {
            let affected = sqlx::query(&format!(
                r#"
                UPDATE OR REPLACE {table}
                SET mailbox_path = ?3 || substr(mailbox_path, length(?2) + 1),
                    folder_id = ?1 || ':' || ?3 || substr(mailbox_path, length(?2) + 1)
                WHERE account_id = ?1
                  AND substr(mailbox_path, 1, length(?2)) = ?2
                "#
            ))
            .bind(account_id)
            .bind(old_prefix)
            .bind(new_prefix)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if table == "messages" {
                report.messages = affected;
            } else {
                report.mailbox_states = affected;
            }
        }

        report.folders = rename_folders(&mut *tx, account_id, old_prefix, new_prefix).await?;
        tx.commit().await?;

        tracing::info!(
            account_id,
            old_prefix,
            new_prefix,
            messages = report.messages,
            folders = report.folders,
            "renamed mailbox prefix"
        );
        Ok(report)
    }
}

async fn rename_folders(
    conn: &mut SqliteConnection,
    account_id: &str,
    old_prefix: &str,
    new_prefix: &str,
) -> Result<u64, StorageError> {
    let rows = sqlx::query(
        r#"
        SELECT id, mailbox_path, name, parent_id FROM folders
        WHERE account_id = ?1 AND substr(mailbox_path, 1, length(?2)) = ?2
        "#,
    )
    .bind(account_id)
    .bind(old_prefix)
    .fetch_all(&mut *conn)
    .await?;

    let old_id_prefix = folder_id_for(account_id, old_prefix);
    let new_id_prefix = folder_id_for(account_id, new_prefix);

    let mut renamed = 0;
    for row in rows {
        let id: String = row.try_get("id")?;
        let path: String = row.try_get("mailbox_path")?;
        let name: String = row.try_get("name")?;
        let parent_id: Option<String> = row.try_get("parent_id")?;

        let Some(rest) = path.strip_prefix(old_prefix) else {
            continue;
        };
        let new_path = format!("{new_prefix}{rest}");
        let old_leaf = MailFolder::new(account_id, &path).name;
        let new_leaf = MailFolder::new(account_id, &new_path).name;
        let new_name = if old_leaf != new_leaf { new_leaf } else { name };
        let new_parent = parent_id.map(|parent| match parent.strip_prefix(&old_id_prefix) {
            Some(rest) => format!("{new_id_prefix}{rest}"),
            None => parent,
        });

        renamed += sqlx::query(
            r#"
            UPDATE OR REPLACE folders
            SET id = ?1, mailbox_path = ?2, name = ?3, parent_id = ?4
            WHERE id = ?5
            "#,
        )
        .bind(folder_id_for(account_id, &new_path))
        .bind(&new_path)
        .bind(new_name)
        .bind(new_parent)
        .bind(&id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    }
    Ok(renamed)
}

/// Thread ids currently held by the given messages.
pub(crate) async fn threads_of(
    conn: &mut SqliteConnection,
    account_id: &str,
    message_ids: &[String],
) -> Result<BTreeSet<String>, StorageError> {
    let mut threads = BTreeSet::new();
    for chunk in message_ids.chunks(ID_CHUNK) {
        let rows = id_scoped(
            "SELECT DISTINCT thread_id FROM messages WHERE account_id = ",
            account_id,
            chunk,
            "",
        )
        .build()
        .fetch_all(&mut *conn)
        .await?;
        for row in rows {
            threads.insert(row.try_get::<String, _>("thread_id")?);
        }
    }
    Ok(threads)
}

/// `{prefix}?account AND id IN (?, ...){suffix}`
fn id_scoped(
    prefix: &str,
    account_id: &str,
    ids: &[String],
    suffix: &str,
) -> QueryBuilder<'static, Sqlite> {
    let mut builder = QueryBuilder::new(prefix);
    builder.push_bind(account_id.to_string());
    builder.push(" AND id IN (");
    Clause::default()
        .bind_text_list(ids.iter().map(String::as_str))
        .push_to(&mut builder);
    builder.push(")");
    builder.push(suffix);
    builder
}

/// Fills `attachments` on each message.
pub(crate) async fn load_attachments(
    pool: &SqlitePool,
    messages: &mut [MailMessage],
) -> Result<(), StorageError> {
    if messages.is_empty() {
        return Ok(());
    }

    let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
    let mut by_message: HashMap<String, Vec<_>> = HashMap::new();
    for chunk in ids.chunks(ID_CHUNK) {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT id, message_id, file_name, content_type, size, inline, content_id, url \
             FROM attachments WHERE message_id IN (",
        );
        Clause::default()
            .bind_text_list(chunk.iter().copied())
            .push_to(&mut builder);
        builder.push(") ORDER BY message_id, rowid");

        for row in builder.build().fetch_all(pool).await? {
            let attachment = row_to_attachment(&row)?;
            by_message
                .entry(attachment.message_id.clone())
                .or_default()
                .push(attachment);
        }
    }

    for message in messages.iter_mut() {
        message.attachments = by_message.remove(&message.id).unwrap_or_default();
    }
    Ok(())
}

pub(crate) fn require_id(value: &str, what: &str) -> Result<(), StorageError> {
    if value.trim().is_empty() {
        return Err(StorageError::InvalidInput(format!("{what} is required")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ingest, message, open_storage};
    use crate::SyncStateStore;
    use mailmirror_core::{IngestMode, MailAttachment, MailboxState, SpecialUse};

    #[tokio::test]
    async fn accounts_round_trip_with_settings() {
        let (_dir, storage) = open_storage().await;
        let mut account = Account {
            id: "acct".to_string(),
            display_name: "Work".to_string(),
            address: "me@example.com".to_string(),
            avatar_url: None,
            settings: Default::default(),
        };
        account.settings.default_layout = mailmirror_core::MailLayout::Threads;
        storage.upsert_account(&account).await.expect("upsert");

        account.display_name = "Work mail".to_string();
        storage.upsert_account(&account).await.expect("update");

        let loaded = storage.get_account("acct").await.expect("get").expect("present");
        assert_eq!(loaded, account);
        assert_eq!(storage.list_accounts().await.expect("list").len(), 1);
        assert!(storage.get_account("missing").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn folder_counts_come_from_messages() {
        let (_dir, storage) = open_storage().await;
        let mut inbox = MailFolder::new("acct", "INBOX");
        inbox.special_use = Some(SpecialUse::Inbox);
        let archive = MailFolder::new("acct", "Archive");
        storage
            .replace_folders("acct", &[inbox, archive])
            .await
            .expect("folders");

        let mut read = message("m1", "INBOX", 1_000);
        read.flags.seen = true;
        let unread = message("m2", "INBOX", 2_000);
        ingest(&storage, IngestMode::Merge, None, vec![read, unread]).await;

        let folders = storage.list_folders("acct").await.expect("list");
        let inbox = folders.iter().find(|f| f.mailbox_path == "INBOX").expect("inbox");
        assert_eq!((inbox.total_count, inbox.unread_count), (2, 1));
        assert_eq!(inbox.special_use, Some(SpecialUse::Inbox));
        let archive = folders.iter().find(|f| f.mailbox_path == "Archive").expect("archive");
        assert_eq!((archive.total_count, archive.unread_count), (0, 0));

        storage
            .replace_folders("acct", &[MailFolder::new("acct", "INBOX")])
            .await
            .expect("shrink");
        assert_eq!(storage.list_folders("acct").await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn deleting_a_message_removes_attachments_and_refreshes_its_thread() {
        let (_dir, storage) = open_storage().await;
        let mut root = message("root", "INBOX", 1_000);
        root.message_id = Some("<root@x>".to_string());
        let mut reply = message("reply", "INBOX", 2_000);
        reply.message_id = Some("<reply@x>".to_string());
        reply.in_reply_to = Some("<root@x>".to_string());
        reply.attachments.push(MailAttachment {
            id: String::new(),
            message_id: String::new(),
            file_name: "notes.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            size: 42,
            inline: false,
            content_id: None,
            url: None,
        });
        ingest(&storage, IngestMode::Merge, None, vec![root, reply]).await;

        let deleted = storage
            .delete_messages("acct", &["reply".to_string()])
            .await
            .expect("delete");
        assert_eq!(deleted, 1);

        let attachments: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM attachments")
            .fetch_one(storage.pool())
            .await
            .expect("count");
        assert_eq!(attachments, 0);

        let (count, latest): (i64, String) = sqlx::query_as(
            "SELECT message_count, latest_message_id FROM threads WHERE account_id = 'acct' AND thread_id = '<root@x>'",
        )
        .fetch_one(storage.pool())
        .await
        .expect("aggregate");
        assert_eq!((count, latest.as_str()), (1, "root"));

        storage
            .delete_messages("acct", &["root".to_string()])
            .await
            .expect("delete");
        let threads: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM threads")
            .fetch_one(storage.pool())
            .await
            .expect("count");
        assert_eq!(threads, 0);
        let fts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages_fts")
            .fetch_one(storage.pool())
            .await
            .expect("count");
        assert_eq!(fts, 0);
    }

    #[tokio::test]
    async fn flag_updates_refresh_unread_counts() {
        let (_dir, storage) = open_storage().await;
        let mut first = message("a", "INBOX", 1_000);
        first.message_id = Some("<a@x>".to_string());
        let mut second = message("b", "INBOX", 2_000);
        second.in_reply_to = Some("<a@x>".to_string());
        ingest(&storage, IngestMode::Merge, None, vec![first, second]).await;

        let change = FlagChange {
            seen: Some(true),
            flagged: Some(true),
            ..FlagChange::default()
        };
        let updated = storage
            .update_flags("acct", &["a".to_string(), "b".to_string()], change)
            .await
            .expect("flags");
        assert_eq!(updated, 2);

        let unread: i64 = sqlx::query_scalar("SELECT unread_count FROM threads WHERE thread_id = '<a@x>'")
            .fetch_one(storage.pool())
            .await
            .expect("aggregate");
        assert_eq!(unread, 0);
        let stored = storage.get_message("b").await.expect("get").expect("present");
        assert!(stored.flags.seen && stored.flags.flagged);
        assert!(!stored.flags.answered);
    }

    #[tokio::test]
    async fn moves_keep_identity_and_thread() {
        let (_dir, storage) = open_storage().await;
        let mut original = message("m1", "INBOX", 1_000);
        original.message_id = Some("<m1@x>".to_string());
        ingest(&storage, IngestMode::Merge, None, vec![original]).await;

        let moved = storage
            .move_messages("acct", &["m1".to_string()], "Archive/2024")
            .await
            .expect("move");
        assert_eq!(moved, 1);
        let stored = storage.get_message("m1").await.expect("get").expect("present");
        assert_eq!(stored.folder_id, "acct:Archive/2024");
        assert_eq!(stored.mailbox_path, "Archive/2024");
        assert_eq!(stored.thread_id, "<m1@x>");
    }

    #[tokio::test]
    async fn prefix_rename_rewrites_paths_and_ids() {
        let (_dir, storage) = open_storage().await;
        let mut work = MailFolder::new("acct", "Work");
        work.name = "Work".to_string();
        let mut reports = MailFolder::new("acct", "Work/Reports");
        reports.parent_id = Some(work.id.clone());
        storage
            .replace_folders("acct", &[work, reports, MailFolder::new("acct", "INBOX")])
            .await
            .expect("folders");
        ingest(
            &storage,
            IngestMode::Merge,
            None,
            vec![
                message("w1", "Work", 1_000),
                message("w2", "Work/Reports", 2_000),
                message("i1", "INBOX", 3_000),
            ],
        )
        .await;
        let sync = SyncStateStore::new(&storage);
        sync.save(&MailboxState::new("acct", "Work/Reports"))
            .await
            .expect("state");

        let report = storage
            .rename_folder_prefix("acct", "Work", "Projects")
            .await
            .expect("rename");
        assert_eq!(
            report,
            PrefixRename {
                messages: 2,
                folders: 2,
                mailbox_states: 1
            }
        );

        let w2 = storage.get_message("w2").await.expect("get").expect("present");
        assert_eq!(w2.mailbox_path, "Projects/Reports");
        assert_eq!(w2.folder_id, "acct:Projects/Reports");
        let i1 = storage.get_message("i1").await.expect("get").expect("present");
        assert_eq!(i1.folder_id, "acct:INBOX");

        let folders = storage.list_folders("acct").await.expect("folders");
        let projects = folders.iter().find(|f| f.mailbox_path == "Projects").expect("renamed");
        assert_eq!(projects.name, "Projects");
        assert_eq!(projects.total_count, 1);
        let child = folders
            .iter()
            .find(|f| f.mailbox_path == "Projects/Reports")
            .expect("child");
        assert_eq!(child.parent_id.as_deref(), Some("acct:Projects"));
        assert_eq!(child.name, "Reports");

        assert!(sync.get("acct", "acct:Projects/Reports").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn account_deletion_clears_everything() {
        let (_dir, storage) = open_storage().await;
        storage
            .replace_folders("acct", &[MailFolder::new("acct", "INBOX")])
            .await
            .expect("folders");
        ingest(&storage, IngestMode::Merge, None, vec![message("m1", "INBOX", 1)]).await;

        storage.delete_account("acct").await.expect("delete");
        for table in ["messages", "folders", "threads", "messages_fts"] {
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(storage.pool())
                .await
                .expect("count");
            assert_eq!(count, 0, "{table} not cleared");
        }
    }

    #[tokio::test]
    async fn missing_account_ids_are_rejected() {
        let (_dir, storage) = open_storage().await;
        assert!(matches!(
            storage.list_folders("").await,
            Err(StorageError::InvalidInput(_))
        ));
    }
}
