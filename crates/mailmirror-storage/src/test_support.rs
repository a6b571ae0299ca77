use crate::{IngestWriter, Storage, StorageOptions};
use mailmirror_core::{IngestBatch, IngestMode, IngestReport, MailMessage};
use tempfile::TempDir;

pub(crate) const ACCOUNT: &str = "acct";

pub(crate) async fn open_storage() -> (TempDir, Storage) {
    let dir = tempfile::tempdir().expect("temp dir");
    let storage = Storage::connect(&dir.path().join("index.sqlite3"), StorageOptions::default())
        .await
        .expect("storage opens");
    (dir, storage)
}

pub(crate) fn message(id: &str, mailbox_path: &str, date_value: i64) -> MailMessage {
    let mut message = MailMessage::new(id, ACCOUNT, mailbox_path);
    message.subject = format!("Subject {id}");
    message.from = "Sender <sender@example.com>".to_string();
    message.to = "Me <me@example.com>".to_string();
    message.body_text = format!("Body of message {id}");
    message.date_value = date_value;
    message
}

pub(crate) async fn ingest(
    storage: &Storage,
    mode: IngestMode,
    folder_id: Option<&str>,
    messages: Vec<MailMessage>,
) -> IngestReport {
    IngestWriter::new(storage)
        .ingest(&IngestBatch {
            account_id: ACCOUNT.to_string(),
            folder_id: folder_id.map(str::to_string),
            mode,
            messages,
        })
        .await
        .expect("batch ingested")
}
