//! Row <-> model conversion and the text encodings of list-valued columns.

use crate::StorageError;
use chrono::{DateTime, Utc};
use mailmirror_core::{
    Account, MailAttachment, MailFlags, MailFolder, MailMessage, MailboxState, ThreadAggregate,
};
use mailparse::MailAddr;
use regex::Regex;
use serde::de::DeserializeOwned;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::sync::OnceLock;

/// Message columns in the order `row_to_message` reads them, qualified by `m`.
pub const MESSAGE_COLUMNS: &str = "m.id, m.account_id, m.folder_id, m.mailbox_path, m.uid, \
     m.thread_id, m.message_id, m.in_reply_to, m.references_list, m.subject, m.from_addr, \
     m.to_addr, m.cc_addr, m.bcc_addr, m.preview, m.date_text, m.date_value, m.body_text, \
     m.body_html, m.priority, m.seen, m.answered, m.flagged, m.deleted, m.draft, m.recent, \
     m.keywords_json, m.has_source";

fn email_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z0-9\-]+")
            .expect("valid email address regex")
    })
}

/// Reads the references column.
///
/// Current rows hold a JSON array; older rows may hold the raw header with
/// whitespace separated ids. Anything unreadable becomes an empty list, which
/// makes the message a thread root rather than failing the read.
pub fn parse_references(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    if trimmed.starts_with('[') {
        return match serde_json::from_str::<Vec<String>>(trimmed) {
            Ok(list) => clean_ids(list),
            Err(err) => {
                tracing::warn!(error = %err, "unreadable references list; treating as root");
                Vec::new()
            }
        };
    }

    clean_ids(trimmed.split_whitespace().map(str::to_string).collect())
}

fn clean_ids(list: Vec<String>) -> Vec<String> {
    list.into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect()
}

pub fn encode_references(references: &[String]) -> Result<String, StorageError> {
    Ok(serde_json::to_string(references)?)
}

pub fn encode_keywords(keywords: &[String]) -> Result<String, StorageError> {
    Ok(serde_json::to_string(keywords)?)
}

pub fn parse_keywords(raw: &str) -> Vec<String> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    serde_json::from_str(raw).unwrap_or_default()
}

/// Lowercase bare address of a From-style header value.
pub fn bare_address(value: &str) -> Option<String> {
    extract_addresses(value)
        .into_iter()
        .next()
        .map(|(_, address)| address)
}

/// Every `(display name, address)` pair in an address list header.
///
/// Structured parsing supplies the `Name <addr>` pairings; anything else in the
/// field shaped like an address is picked up by scanning.
pub fn extract_addresses(value: &str) -> Vec<(Option<String>, String)> {
    if value.trim().is_empty() {
        return Vec::new();
    }

    let mut found = Vec::new();
    if let Ok(list) = mailparse::addrparse(value) {
        for entry in list.iter() {
            match entry {
                MailAddr::Single(info) => {
                    push_address(&mut found, info.display_name.clone(), &info.addr)
                }
                MailAddr::Group(group) => {
                    for info in &group.addrs {
                        push_address(&mut found, info.display_name.clone(), &info.addr);
                    }
                }
            }
        }
    }

    for hit in email_regex().find_iter(value) {
        let addr = hit.as_str().to_lowercase();
        if !found.iter().any(|(_, known)| *known == addr) {
            found.push((None, addr));
        }
    }

    found
}

fn push_address(found: &mut Vec<(Option<String>, String)>, name: Option<String>, addr: &str) {
    let addr = addr.trim().to_lowercase();
    let well_formed = email_regex()
        .find(&addr)
        .map(|hit| hit.start() == 0 && hit.end() == addr.len())
        .unwrap_or(false);
    if !well_formed {
        return;
    }
    let name = name
        .map(|n| n.trim().trim_matches('"').trim().to_string())
        .filter(|n| !n.is_empty() && n.to_lowercase() != addr);
    found.push((name, addr));
}

pub fn row_to_account(row: &SqliteRow) -> Result<Account, StorageError> {
    let settings_raw: String = row.try_get("settings_json")?;
    Ok(Account {
        id: row.try_get("id")?,
        display_name: row.try_get("display_name")?,
        address: row.try_get("address")?,
        avatar_url: row.try_get("avatar_url")?,
        settings: parse_json(&settings_raw, "accounts.settings_json")?,
    })
}

/// Expects `total_count` and `unread_count` computed by the query.
pub fn row_to_folder(row: &SqliteRow) -> Result<MailFolder, StorageError> {
    let flags_raw: String = row.try_get("flags_json")?;
    let special_use: Option<String> = row.try_get("special_use")?;
    Ok(MailFolder {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        mailbox_path: row.try_get("mailbox_path")?,
        name: row.try_get("name")?,
        parent_id: row.try_get("parent_id")?,
        special_use: special_use.and_then(|raw| raw.parse().ok()),
        flags: parse_json(&flags_raw, "folders.flags_json")?,
        delimiter: row.try_get("delimiter")?,
        total_count: to_u32(row.try_get("total_count")?, "folders.total_count")?,
        unread_count: to_u32(row.try_get("unread_count")?, "folders.unread_count")?,
    })
}

/// Attachments are loaded separately.
pub fn row_to_message(row: &SqliteRow) -> Result<MailMessage, StorageError> {
    let uid: Option<i64> = row.try_get("uid")?;
    let references_raw: String = row.try_get("references_list")?;
    let keywords_raw: String = row.try_get("keywords_json")?;

    Ok(MailMessage {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        folder_id: row.try_get("folder_id")?,
        mailbox_path: row.try_get("mailbox_path")?,
        uid: uid.map(|v| to_u32(v, "messages.uid")).transpose()?,
        thread_id: row.try_get("thread_id")?,
        message_id: row.try_get("message_id")?,
        in_reply_to: row.try_get("in_reply_to")?,
        references: parse_references(&references_raw),
        subject: row.try_get("subject")?,
        from: row.try_get("from_addr")?,
        to: row.try_get("to_addr")?,
        cc: row.try_get("cc_addr")?,
        bcc: row.try_get("bcc_addr")?,
        preview: row.try_get("preview")?,
        date: row.try_get("date_text")?,
        date_value: row.try_get("date_value")?,
        body_text: row.try_get("body_text")?,
        body_html: row.try_get("body_html")?,
        priority: row.try_get("priority")?,
        flags: MailFlags {
            seen: flag(row, "seen")?,
            answered: flag(row, "answered")?,
            flagged: flag(row, "flagged")?,
            deleted: flag(row, "deleted")?,
            draft: flag(row, "draft")?,
            recent: flag(row, "recent")?,
        },
        keywords: parse_keywords(&keywords_raw),
        attachments: Vec::new(),
        has_source: flag(row, "has_source")?,
    })
}

pub fn row_to_attachment(row: &SqliteRow) -> Result<MailAttachment, StorageError> {
    let size: i64 = row.try_get("size")?;
    Ok(MailAttachment {
        id: row.try_get("id")?,
        message_id: row.try_get("message_id")?,
        file_name: row.try_get("file_name")?,
        content_type: row.try_get("content_type")?,
        size: u64::try_from(size)
            .map_err(|_| StorageError::Data(format!("invalid size for attachments.size: {size}")))?,
        inline: flag(row, "inline")?,
        content_id: row.try_get("content_id")?,
        url: row.try_get("url")?,
    })
}

pub fn row_to_thread(row: &SqliteRow) -> Result<ThreadAggregate, StorageError> {
    Ok(ThreadAggregate {
        thread_id: row.try_get("thread_id")?,
        account_id: row.try_get("account_id")?,
        root_message_id: row.try_get("root_message_id")?,
        latest_message_id: row.try_get("latest_message_id")?,
        latest_date: row.try_get("latest_date")?,
        message_count: to_u32(row.try_get("message_count")?, "threads.message_count")?,
        unread_count: to_u32(row.try_get("unread_count")?, "threads.unread_count")?,
    })
}

pub fn row_to_mailbox_state(row: &SqliteRow) -> Result<MailboxState, StorageError> {
    let uid_validity: Option<i64> = row.try_get("uid_validity")?;
    let highest_modseq: Option<i64> = row.try_get("highest_modseq")?;
    let highest_uid: Option<i64> = row.try_get("highest_uid")?;
    let updated_raw: String = row.try_get("updated_at")?;

    Ok(MailboxState {
        account_id: row.try_get("account_id")?,
        folder_id: row.try_get("folder_id")?,
        mailbox_path: row.try_get("mailbox_path")?,
        uid_validity: uid_validity
            .map(|v| to_u32(v, "mailbox_states.uid_validity"))
            .transpose()?,
        highest_modseq: highest_modseq
            .map(|v| {
                u64::try_from(v).map_err(|_| {
                    StorageError::Data(format!("invalid value for mailbox_states.highest_modseq: {v}"))
                })
            })
            .transpose()?,
        highest_uid: highest_uid
            .map(|v| to_u32(v, "mailbox_states.highest_uid"))
            .transpose()?,
        supports_incremental: flag(row, "supports_incremental")?,
        // Rows written before timestamps were recorded carry an empty string.
        updated_at: if updated_raw.is_empty() {
            DateTime::<Utc>::default()
        } else {
            parse_datetime(&updated_raw, "mailbox_states.updated_at")?
        },
    })
}

fn flag(row: &SqliteRow, column: &str) -> Result<bool, StorageError> {
    let value: i64 = row.try_get(column)?;
    Ok(value != 0)
}

fn to_u32(value: i64, field: &str) -> Result<u32, StorageError> {
    u32::try_from(value).map_err(|_| StorageError::Data(format!("invalid value for {field}: {value}")))
}

pub(crate) fn parse_datetime(raw: &str, field: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StorageError::Data(format!("invalid datetime for {field}: {err}")))
}

fn parse_json<T>(raw: &str, field: &str) -> Result<T, StorageError>
where
    T: DeserializeOwned,
{
    serde_json::from_str(raw)
        .map_err(|err| StorageError::Data(format!("invalid json for {field}: {err}")))
}
