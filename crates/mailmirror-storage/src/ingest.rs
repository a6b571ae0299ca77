use crate::mapper::{bare_address, encode_keywords, encode_references};
use crate::storage::require_id;
use crate::threading::{refresh_thread_aggregates, rethread, RethreadScope};
use crate::{Storage, StorageError};
use mailmirror_core::{folder_id_for, IngestBatch, IngestMode, IngestReport, MailMessage};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::BTreeSet;

/// Writes fetched message batches and keeps threads consistent with them.
#[derive(Clone)]
pub struct IngestWriter {
    pool: SqlitePool,
}

impl IngestWriter {
    pub fn new(storage: &Storage) -> Self {
        Self {
            pool: storage.pool().clone(),
        }
    }

    /// Applies a batch in one transaction.
    ///
    /// [`IngestMode::Replace`] first removes everything stored for the account
    /// (or only the batch folder when one is named), then rethreads the whole
    /// account. [`IngestMode::Merge`] upserts message by message and only
    /// revisits the written messages, their replies and the threads involved.
    pub async fn ingest(&self, batch: &IngestBatch) -> Result<IngestReport, StorageError> {
        let account_id = batch.account_id.as_str();
        require_id(account_id, "account id")?;
        for message in &batch.messages {
            require_id(&message.id, "message id")?;
            if !message.account_id.is_empty() && message.account_id != account_id {
                return Err(StorageError::InvalidInput(format!(
                    "message `{}` belongs to account `{}`, not `{account_id}`",
                    message.id, message.account_id
                )));
            }
        }

        let mut tx = self.pool.begin().await?;

        if batch.mode == IngestMode::Replace {
            let cleared = clear_scope(&mut *tx, account_id, batch.folder_id.as_deref()).await?;
            tracing::debug!(account_id, folder_id = ?batch.folder_id, cleared, "cleared ingest scope");
        }

        let mut touched_threads = BTreeSet::new();
        for message in &batch.messages {
            let previous =
                write_message(&mut *tx, account_id, batch.folder_id.as_deref(), message).await?;
            if let Some(thread_id) = previous {
                touched_threads.insert(thread_id);
            }
        }

        let (rethreaded, threads_refreshed) = match batch.mode {
            IngestMode::Replace => {
                let outcome = rethread(&mut *tx, account_id, RethreadScope::Account).await?;
                let refreshed = refresh_thread_aggregates(&mut *tx, account_id, None).await?;
                (outcome.changed, refreshed)
            }
            IngestMode::Merge => {
                let ids: Vec<String> = batch.messages.iter().map(|m| m.id.clone()).collect();
                let outcome = rethread(&mut *tx, account_id, RethreadScope::Messages(&ids)).await?;
                touched_threads.extend(outcome.affected_threads);
                touched_threads.retain(|id| !id.is_empty());
                let refreshed =
                    refresh_thread_aggregates(&mut *tx, account_id, Some(&touched_threads)).await?;
                (outcome.changed, refreshed)
            }
        };

        tx.commit().await?;

        let report = IngestReport {
            written: batch.messages.len(),
            rethreaded,
            threads_refreshed,
        };
        tracing::info!(
            account_id,
            mode = ?batch.mode,
            written = report.written,
            rethreaded = report.rethreaded,
            threads_refreshed = report.threads_refreshed,
            "ingested message batch"
        );
        Ok(report)
    }
}

async fn clear_scope(
    conn: &mut SqliteConnection,
    account_id: &str,
    folder_id: Option<&str>,
) -> Result<u64, StorageError> {
    let scope = if folder_id.is_some() {
        "account_id = ?1 AND folder_id = ?2"
    } else {
        "account_id = ?1"
    };

    let statements = [
        format!("DELETE FROM messages_fts WHERE rowid IN (SELECT seq FROM messages WHERE {scope})"),
        format!("DELETE FROM attachments WHERE message_id IN (SELECT id FROM messages WHERE {scope})"),
        format!("DELETE FROM message_references WHERE message_id IN (SELECT id FROM messages WHERE {scope})"),
        format!("DELETE FROM messages WHERE {scope}"),
    ];

    let mut removed = 0;
    for sql in &statements {
        let mut query = sqlx::query(sql).bind(account_id);
        if let Some(folder_id) = folder_id {
            query = query.bind(folder_id);
        }
        removed = query.execute(&mut *conn).await?.rows_affected();
    }
    Ok(removed)
}

/// Upserts one message with its attachments and full-text row.
///
/// Returns the thread id the message had before, if it was already stored.
async fn write_message(
    conn: &mut SqliteConnection,
    account_id: &str,
    batch_folder: Option<&str>,
    message: &MailMessage,
) -> Result<Option<String>, StorageError> {
    let stored: Option<(String, String)> =
        sqlx::query_as("SELECT account_id, thread_id FROM messages WHERE id = ?1")
            .bind(&message.id)
            .fetch_optional(&mut *conn)
            .await?;
    let previous = match stored {
        Some((owner, _)) if owner != account_id => {
            return Err(StorageError::InvalidInput(format!(
                "message id `{}` is already stored for account `{owner}`",
                message.id
            )));
        }
        Some((_, thread_id)) => Some(thread_id),
        None => None,
    };

    let folder_id = if !message.folder_id.is_empty() {
        message.folder_id.clone()
    } else if let Some(folder) = batch_folder {
        folder.to_string()
    } else {
        folder_id_for(account_id, &message.mailbox_path)
    };
    let initial_thread = if !message.thread_id.trim().is_empty() {
        message.thread_id.clone()
    } else {
        message
            .message_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| message.id.clone())
    };
    let references = encode_references(&message.references)?;
    let keywords = encode_keywords(&message.keywords)?;

    sqlx::query(
        r#"
        INSERT INTO messages (
          id, account_id, folder_id, mailbox_path, uid, thread_id, message_id, in_reply_to,
          references_list, subject, from_addr, from_email, to_addr, cc_addr, bcc_addr, preview,
          date_text, date_value, body_text, body_html, priority, seen, answered, flagged,
          deleted, draft, recent, keywords_json, has_source
        ) VALUES (
          ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
          ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29
        )
        ON CONFLICT(id) DO UPDATE SET
          folder_id = excluded.folder_id,
          mailbox_path = excluded.mailbox_path,
          uid = excluded.uid,
          thread_id = CASE WHEN ?30 = '' THEN messages.thread_id ELSE excluded.thread_id END,
          message_id = excluded.message_id,
          in_reply_to = excluded.in_reply_to,
          references_list = excluded.references_list,
          subject = excluded.subject,
          from_addr = excluded.from_addr,
          from_email = excluded.from_email,
          to_addr = excluded.to_addr,
          cc_addr = excluded.cc_addr,
          bcc_addr = excluded.bcc_addr,
          preview = excluded.preview,
          date_text = excluded.date_text,
          date_value = excluded.date_value,
          body_text = excluded.body_text,
          body_html = excluded.body_html,
          priority = excluded.priority,
          seen = excluded.seen,
          answered = excluded.answered,
          flagged = excluded.flagged,
          deleted = excluded.deleted,
          draft = excluded.draft,
          recent = excluded.recent,
          keywords_json = excluded.keywords_json,
          has_source = excluded.has_source
        "#,
    )
    .bind(&message.id)
    .bind(account_id)
    .bind(&folder_id)
    .bind(&message.mailbox_path)
    .bind(message.uid.map(i64::from))
    .bind(&initial_thread)
    .bind(&message.message_id)
    .bind(&message.in_reply_to)
    .bind(references)
    .bind(&message.subject)
    .bind(&message.from)
    .bind(bare_address(&message.from))
    .bind(&message.to)
    .bind(&message.cc)
    .bind(&message.bcc)
    .bind(&message.preview)
    .bind(&message.date)
    .bind(message.date_value)
    .bind(&message.body_text)
    .bind(&message.body_html)
    .bind(&message.priority)
    .bind(message.flags.seen as i32)
    .bind(message.flags.answered as i32)
    .bind(message.flags.flagged as i32)
    .bind(message.flags.deleted as i32)
    .bind(message.flags.draft as i32)
    .bind(message.flags.recent as i32)
    .bind(keywords)
    .bind(message.has_source as i32)
    .bind(message.thread_id.trim())
    .execute(&mut *conn)
    .await?;

    // -- attachments ---------------------------------------------------------

    sqlx::query("DELETE FROM attachments WHERE message_id = ?1")
        .bind(&message.id)
        .execute(&mut *conn)
        .await?;

    for (index, attachment) in message.attachments.iter().enumerate() {
        let id = if attachment.id.is_empty() {
            format!("{}:{index}", message.id)
        } else {
            attachment.id.clone()
        };
        sqlx::query(
            r#"
            INSERT INTO attachments (
              id, message_id, file_name, content_type, size, inline, content_id, url
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(message_id, id) DO UPDATE SET
              file_name = excluded.file_name,
              content_type = excluded.content_type,
              size = excluded.size,
              inline = excluded.inline,
              content_id = excluded.content_id,
              url = excluded.url
            "#,
        )
        .bind(id)
        .bind(&message.id)
        .bind(&attachment.file_name)
        .bind(&attachment.content_type)
        .bind(i64::try_from(attachment.size).unwrap_or(i64::MAX))
        .bind(attachment.inline as i32)
        .bind(&attachment.content_id)
        .bind(&attachment.url)
        .execute(&mut *conn)
        .await?;
    }

    // -- reference index -----------------------------------------------------

    sqlx::query("DELETE FROM message_references WHERE message_id = ?1")
        .bind(&message.id)
        .execute(&mut *conn)
        .await?;

    let referenced: BTreeSet<&str> = message
        .references
        .iter()
        .map(String::as_str)
        .chain(message.in_reply_to.as_deref())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .collect();
    for ref_id in referenced {
        sqlx::query(
            "INSERT OR IGNORE INTO message_references (account_id, ref_id, message_id) VALUES (?1, ?2, ?3)",
        )
        .bind(account_id)
        .bind(ref_id)
        .bind(&message.id)
        .execute(&mut *conn)
        .await?;
    }

    // -- full-text row -------------------------------------------------------

    sqlx::query("DELETE FROM messages_fts WHERE rowid = (SELECT seq FROM messages WHERE id = ?1)")
        .bind(&message.id)
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        r#"
        INSERT INTO messages_fts (rowid, subject, body, from_addr, to_addr, cc_addr, bcc_addr)
        SELECT seq, subject, body_text, from_addr, to_addr, cc_addr, bcc_addr
        FROM messages WHERE id = ?1
        "#,
    )
    .bind(&message.id)
    .execute(&mut *conn)
    .await?;

    Ok(previous)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ingest, message, open_storage, ACCOUNT};
    use mailmirror_core::{MailAttachment, MailMessage};

    async fn snapshot(storage: &Storage) -> Vec<String> {
        let queries = [
            "SELECT json_group_array(json_array(seq, id, folder_id, thread_id, references_list, keywords_json, from_email, seen)) FROM (SELECT * FROM messages ORDER BY id)",
            "SELECT json_group_array(json_array(id, message_id, file_name, size, inline)) FROM (SELECT * FROM attachments ORDER BY id)",
            "SELECT json_group_array(json_array(rowid, subject, body, from_addr, to_addr)) FROM (SELECT rowid, * FROM messages_fts ORDER BY rowid)",
            "SELECT json_group_array(json_array(thread_id, root_message_id, latest_message_id, latest_date, message_count, unread_count)) FROM (SELECT * FROM threads ORDER BY thread_id)",
        ];
        let mut out = Vec::new();
        for sql in queries {
            let value: String = sqlx::query_scalar(sql)
                .fetch_one(storage.pool())
                .await
                .expect("snapshot");
            out.push(value);
        }
        out
    }

    async fn assert_aggregates_match(storage: &Storage) {
        let mismatched: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM (
              SELECT m.thread_id, COUNT(*) AS total,
                     SUM(CASE WHEN m.seen = 0 THEN 1 ELSE 0 END) AS unread
              FROM messages m WHERE m.account_id = 'acct'
              GROUP BY m.thread_id
            ) expected
            LEFT JOIN threads t ON t.account_id = 'acct' AND t.thread_id = expected.thread_id
            WHERE t.thread_id IS NULL
               OR t.message_count != expected.total
               OR t.unread_count != expected.unread
            "#,
        )
        .fetch_one(storage.pool())
        .await
        .expect("compare");
        assert_eq!(mismatched, 0);

        let orphans: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM threads t WHERE NOT EXISTS (SELECT 1 FROM messages m WHERE m.account_id = t.account_id AND m.thread_id = t.thread_id)",
        )
        .fetch_one(storage.pool())
        .await
        .expect("orphans");
        assert_eq!(orphans, 0);
    }

    fn conversation() -> Vec<MailMessage> {
        let mut root = message("1", "INBOX", 1_000);
        root.message_id = Some("<root@x>".to_string());
        root.flags.seen = true;
        root.attachments.push(MailAttachment {
            id: String::new(),
            message_id: String::new(),
            file_name: "plan.txt".to_string(),
            content_type: "text/plain".to_string(),
            size: 12,
            inline: false,
            content_id: None,
            url: None,
        });
        let mut reply = message("2", "INBOX", 2_000);
        reply.message_id = Some("<reply@x>".to_string());
        reply.in_reply_to = Some("<root@x>".to_string());
        reply.references = vec!["<root@x>".to_string()];
        reply.keywords = vec!["$todo".to_string()];
        let mut sent = message("3", "Sent", 3_000);
        sent.message_id = Some("<sent@x>".to_string());
        sent.in_reply_to = Some("<reply@x>".to_string());
        sent.references = vec!["<root@x>".to_string(), "<reply@x>".to_string()];
        let other = message("4", "INBOX", 4_000);
        vec![root, reply, sent, other]
    }

    #[tokio::test]
    async fn merge_reingestion_is_idempotent() {
        let (_dir, storage) = open_storage().await;
        ingest(&storage, IngestMode::Merge, None, conversation()).await;
        let before = snapshot(&storage).await;

        let report = ingest(&storage, IngestMode::Merge, None, conversation()).await;
        assert_eq!(report.rethreaded, 0);
        assert_eq!(snapshot(&storage).await, before);
    }

    #[tokio::test]
    async fn aggregates_follow_every_ingest() {
        let (_dir, storage) = open_storage().await;
        ingest(&storage, IngestMode::Merge, None, conversation()).await;
        assert_aggregates_match(&storage).await;

        let (root_id, latest_id, count, unread): (String, String, i64, i64) = sqlx::query_as(
            "SELECT root_message_id, latest_message_id, message_count, unread_count FROM threads WHERE thread_id = '<root@x>'",
        )
        .fetch_one(storage.pool())
        .await
        .expect("thread");
        assert_eq!((root_id.as_str(), latest_id.as_str()), ("1", "3"));
        assert_eq!((count, unread), (3, 2));

        let mut late = message("5", "INBOX", 5_000);
        late.in_reply_to = Some("<sent@x>".to_string());
        ingest(&storage, IngestMode::Merge, None, vec![late]).await;
        assert_aggregates_match(&storage).await;
    }

    #[tokio::test]
    async fn late_parents_pull_replies_into_their_thread() {
        let (_dir, storage) = open_storage().await;

        let mut reply = message("reply", "INBOX", 3_000);
        reply.message_id = Some("<reply@x>".to_string());
        reply.in_reply_to = Some("<mid@x>".to_string());
        reply.references = vec!["<root@x>".to_string(), "<mid@x>".to_string()];
        ingest(&storage, IngestMode::Merge, None, vec![reply]).await;
        let stored = storage.get_message("reply").await.expect("get").expect("present");
        assert_eq!(stored.thread_id, "<mid@x>");

        let mut middle = message("mid", "INBOX", 2_000);
        middle.message_id = Some("<mid@x>".to_string());
        middle.in_reply_to = Some("<root@x>".to_string());
        middle.references = vec!["<root@x>".to_string()];
        let report = ingest(&storage, IngestMode::Merge, None, vec![middle]).await;
        assert_eq!(report.rethreaded, 2);

        for id in ["reply", "mid"] {
            let stored = storage.get_message(id).await.expect("get").expect("present");
            assert_eq!(stored.thread_id, "<root@x>", "{id}");
        }
        let threads: Vec<(String, i64)> =
            sqlx::query_as("SELECT thread_id, message_count FROM threads ORDER BY thread_id")
                .fetch_all(storage.pool())
                .await
                .expect("threads");
        assert_eq!(threads, vec![("<root@x>".to_string(), 2)]);
    }

    #[tokio::test]
    async fn empty_incoming_thread_ids_keep_the_stored_one() {
        let (_dir, storage) = open_storage().await;
        let mut first = message("m1", "INBOX", 1_000);
        first.thread_id = "server-thread".to_string();
        ingest(&storage, IngestMode::Merge, None, vec![first.clone()]).await;

        first.thread_id = String::new();
        first.subject = "Edited".to_string();
        ingest(&storage, IngestMode::Merge, None, vec![first]).await;

        let stored = storage.get_message("m1").await.expect("get").expect("present");
        assert_eq!(stored.thread_id, "server-thread");
        assert_eq!(stored.subject, "Edited");
    }

    #[tokio::test]
    async fn headerless_messages_thread_on_their_own_id() {
        let (_dir, storage) = open_storage().await;
        ingest(&storage, IngestMode::Merge, None, vec![message("lonely", "INBOX", 1)]).await;
        let stored = storage.get_message("lonely").await.expect("get").expect("present");
        assert_eq!(stored.thread_id, "lonely");
    }

    #[tokio::test]
    async fn replace_clears_only_the_named_folder() {
        let (_dir, storage) = open_storage().await;
        ingest(&storage, IngestMode::Merge, None, conversation()).await;

        let mut fresh = message("9", "INBOX", 9_000);
        fresh.message_id = Some("<fresh@x>".to_string());
        let report = ingest(
            &storage,
            IngestMode::Replace,
            Some(&mailmirror_core::folder_id_for(ACCOUNT, "INBOX")),
            vec![fresh],
        )
        .await;
        assert_eq!(report.written, 1);

        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM messages ORDER BY id")
            .fetch_all(storage.pool())
            .await
            .expect("ids");
        assert_eq!(ids, vec!["3".to_string(), "9".to_string()]);

        let attachments: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM attachments")
            .fetch_one(storage.pool())
            .await
            .expect("count");
        assert_eq!(attachments, 0);
        let fts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages_fts")
            .fetch_one(storage.pool())
            .await
            .expect("count");
        assert_eq!(fts, 2);
        assert_aggregates_match(&storage).await;
    }

    fn part(id: &str, file_name: &str) -> MailAttachment {
        MailAttachment {
            id: id.to_string(),
            message_id: String::new(),
            file_name: file_name.to_string(),
            content_type: "application/pdf".to_string(),
            size: 1,
            inline: false,
            content_id: None,
            url: None,
        }
    }

    #[tokio::test]
    async fn attachment_ids_are_scoped_to_their_message() {
        let (_dir, storage) = open_storage().await;
        let mut a = message("a", "INBOX", 1_000);
        a.attachments.push(part("2", "a.pdf"));
        let mut b = message("b", "INBOX", 2_000);
        b.attachments.push(part("2", "b.pdf"));

        ingest(&storage, IngestMode::Merge, None, vec![a.clone(), b.clone()]).await;
        ingest(&storage, IngestMode::Merge, None, vec![b, a]).await;

        for (id, file_name) in [("a", "a.pdf"), ("b", "b.pdf")] {
            let stored = storage.get_message(id).await.expect("get").expect("present");
            assert_eq!(stored.attachments.len(), 1, "{id}");
            assert_eq!(stored.attachments[0].id, "2");
            assert_eq!(stored.attachments[0].message_id, id);
            assert_eq!(stored.attachments[0].file_name, file_name);
        }
    }

    #[tokio::test]
    async fn ids_stored_for_another_account_are_rejected() {
        let (_dir, storage) = open_storage().await;
        let mut original = message("m1", "INBOX", 1_000);
        original.message_id = Some("<x@y>".to_string());
        ingest(&storage, IngestMode::Merge, None, vec![original]).await;

        let mut intruder = MailMessage::new("m1", "other", "INBOX");
        intruder.subject = "Overwritten".to_string();
        let result = IngestWriter::new(&storage)
            .ingest(&IngestBatch {
                account_id: "other".to_string(),
                folder_id: None,
                mode: IngestMode::Merge,
                messages: vec![intruder],
            })
            .await;
        assert!(matches!(result, Err(StorageError::InvalidInput(_))));

        let kept = storage.get_message("m1").await.expect("get").expect("present");
        assert_eq!(kept.account_id, ACCOUNT);
        assert_eq!(kept.subject, "Subject m1");
        let foreign: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM threads WHERE account_id = 'other'")
            .fetch_one(storage.pool())
            .await
            .expect("count");
        assert_eq!(foreign, 0);
        assert_aggregates_match(&storage).await;
    }

    #[tokio::test]
    async fn reference_cycles_across_batches_share_one_thread() {
        let (_dir, storage) = open_storage().await;
        let mut a = message("a", "INBOX", 1_000);
        a.message_id = Some("<a@x>".to_string());
        a.references = vec!["<b@x>".to_string()];
        ingest(&storage, IngestMode::Merge, None, vec![a]).await;

        let mut b = message("b", "INBOX", 2_000);
        b.message_id = Some("<b@x>".to_string());
        b.references = vec!["<a@x>".to_string()];
        ingest(&storage, IngestMode::Merge, None, vec![b]).await;

        for id in ["a", "b"] {
            let stored = storage.get_message(id).await.expect("get").expect("present");
            assert_eq!(stored.thread_id, "<a@x>", "{id}");
        }
        let threads: Vec<(String, i64)> =
            sqlx::query_as("SELECT thread_id, message_count FROM threads ORDER BY thread_id")
                .fetch_all(storage.pool())
                .await
                .expect("threads");
        assert_eq!(threads, vec![("<a@x>".to_string(), 2)]);
        assert_aggregates_match(&storage).await;
    }

    #[tokio::test]
    async fn reference_index_follows_rewrites() {
        let (_dir, storage) = open_storage().await;
        let indexed = |storage: Storage| async move {
            sqlx::query_scalar::<_, String>(
                "SELECT ref_id FROM message_references WHERE message_id = 'r' ORDER BY ref_id",
            )
            .fetch_all(storage.pool())
            .await
            .expect("references")
        };

        let mut reply = message("r", "INBOX", 1_000);
        reply.in_reply_to = Some("<p@x>".to_string());
        reply.references = vec!["<root@x>".to_string(), " <p@x> ".to_string()];
        ingest(&storage, IngestMode::Merge, None, vec![reply.clone()]).await;
        assert_eq!(indexed(storage.clone()).await, vec!["<p@x>", "<root@x>"]);

        reply.references = vec!["<other@x>".to_string()];
        reply.in_reply_to = None;
        ingest(&storage, IngestMode::Merge, None, vec![reply]).await;
        assert_eq!(indexed(storage.clone()).await, vec!["<other@x>"]);

        storage
            .delete_messages(ACCOUNT, &["r".to_string()])
            .await
            .expect("delete");
        assert!(indexed(storage.clone()).await.is_empty());
    }

    #[tokio::test]
    async fn invalid_batches_write_nothing() {
        let (_dir, storage) = open_storage().await;
        let writer = IngestWriter::new(&storage);

        let mut stray = message("x", "INBOX", 1);
        stray.account_id = "someone-else".to_string();
        let batch = IngestBatch {
            account_id: ACCOUNT.to_string(),
            folder_id: None,
            mode: IngestMode::Merge,
            messages: vec![message("ok", "INBOX", 1), stray],
        };
        assert!(matches!(
            writer.ingest(&batch).await,
            Err(StorageError::InvalidInput(_))
        ));

        let empty_account = IngestBatch {
            account_id: String::new(),
            ..batch
        };
        assert!(writer.ingest(&empty_account).await.is_err());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(storage.pool())
            .await
            .expect("count");
        assert_eq!(count, 0);
    }
}
