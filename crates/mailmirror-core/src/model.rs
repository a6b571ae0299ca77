use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Builds the local folder id for a mailbox path of an account.
///
/// The path is kept as its own field on folders and messages; the id is only
/// an opaque key and must never be sliced back into a path.
pub fn folder_id_for(account_id: &str, mailbox_path: &str) -> String {
    format!("{account_id}:{mailbox_path}")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThreadingScope {
    #[default]
    Account,
    Folder,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MailLayout {
    #[default]
    Messages,
    Threads,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Signature {
    pub name: String,
    pub body_text: String,
    #[serde(default)]
    pub body_html: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AccountSettings {
    #[serde(default)]
    pub threading_scope: ThreadingScope,
    #[serde(default)]
    pub default_layout: MailLayout,
    #[serde(default)]
    pub signatures: Vec<Signature>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub id: String,
    pub display_name: String,
    pub address: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub settings: AccountSettings,
}

/// RFC 6154 special-use role of a mailbox.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SpecialUse {
    Inbox,
    All,
    Archive,
    Drafts,
    Flagged,
    Junk,
    Sent,
    Trash,
}

impl SpecialUse {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::All => "all",
            Self::Archive => "archive",
            Self::Drafts => "drafts",
            Self::Flagged => "flagged",
            Self::Junk => "junk",
            Self::Sent => "sent",
            Self::Trash => "trash",
        }
    }
}

impl FromStr for SpecialUse {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let value = raw.trim().trim_start_matches('\\').to_ascii_lowercase();
        match value.as_str() {
            "inbox" => Ok(Self::Inbox),
            "all" => Ok(Self::All),
            "archive" => Ok(Self::Archive),
            "drafts" => Ok(Self::Drafts),
            "flagged" => Ok(Self::Flagged),
            "junk" | "spam" => Ok(Self::Junk),
            "sent" => Ok(Self::Sent),
            "trash" | "deleted" => Ok(Self::Trash),
            _ => Err(format!("unknown special-use tag `{raw}`")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailFolder {
    pub id: String,
    pub account_id: String,
    pub mailbox_path: String,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub special_use: Option<SpecialUse>,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub delimiter: Option<String>,
    /// Computed from message rows whenever folders are read.
    #[serde(default)]
    pub total_count: u32,
    #[serde(default)]
    pub unread_count: u32,
}

impl MailFolder {
    pub fn new(account_id: &str, mailbox_path: &str) -> Self {
        let name = mailbox_path
            .rsplit(['/', '.'])
            .next()
            .unwrap_or(mailbox_path)
            .to_string();
        Self {
            id: folder_id_for(account_id, mailbox_path),
            account_id: account_id.to_string(),
            mailbox_path: mailbox_path.to_string(),
            name,
            parent_id: None,
            special_use: None,
            flags: Vec::new(),
            delimiter: Some("/".to_string()),
            total_count: 0,
            unread_count: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct MailFlags {
    #[serde(default)]
    pub seen: bool,
    #[serde(default)]
    pub answered: bool,
    #[serde(default)]
    pub flagged: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub recent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailAttachment {
    /// Derived from the owning message when left empty.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub message_id: String,
    pub file_name: String,
    pub content_type: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub inline: bool,
    #[serde(default)]
    pub content_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailMessage {
    pub id: String,
    pub account_id: String,
    pub folder_id: String,
    pub mailbox_path: String,
    /// Absent for messages the server has not assigned a UID yet.
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub thread_id: String,
    /// The Message-ID header.
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub cc: String,
    #[serde(default)]
    pub bcc: String,
    #[serde(default)]
    pub preview: String,
    #[serde(default)]
    pub date: String,
    /// Epoch milliseconds. The only value used for ordering and grouping.
    #[serde(default)]
    pub date_value: i64,
    #[serde(default)]
    pub body_text: String,
    #[serde(default)]
    pub body_html: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub flags: MailFlags,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub attachments: Vec<MailAttachment>,
    #[serde(default)]
    pub has_source: bool,
}

impl MailMessage {
    pub fn new(id: &str, account_id: &str, mailbox_path: &str) -> Self {
        Self {
            id: id.to_string(),
            account_id: account_id.to_string(),
            folder_id: folder_id_for(account_id, mailbox_path),
            mailbox_path: mailbox_path.to_string(),
            uid: None,
            thread_id: String::new(),
            message_id: None,
            in_reply_to: None,
            references: Vec::new(),
            subject: String::new(),
            from: String::new(),
            to: String::new(),
            cc: String::new(),
            bcc: String::new(),
            preview: String::new(),
            date: String::new(),
            date_value: 0,
            body_text: String::new(),
            body_html: None,
            priority: None,
            flags: MailFlags::default(),
            keywords: Vec::new(),
            attachments: Vec::new(),
            has_source: false,
        }
    }
}

/// Derived per-thread summary. Never edited directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadAggregate {
    pub thread_id: String,
    pub account_id: String,
    pub root_message_id: String,
    pub latest_message_id: String,
    pub latest_date: i64,
    pub message_count: u32,
    pub unread_count: u32,
}

/// Remote synchronization cursor of one mailbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailboxState {
    pub account_id: String,
    pub folder_id: String,
    pub mailbox_path: String,
    /// UIDVALIDITY as last seen on the server.
    #[serde(default)]
    pub uid_validity: Option<u32>,
    /// HIGHESTMODSEQ as last seen on the server.
    #[serde(default)]
    pub highest_modseq: Option<u64>,
    #[serde(default)]
    pub highest_uid: Option<u32>,
    #[serde(default)]
    pub supports_incremental: bool,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl MailboxState {
    pub fn new(account_id: &str, mailbox_path: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            folder_id: folder_id_for(account_id, mailbox_path),
            mailbox_path: mailbox_path.to_string(),
            uid_validity: None,
            highest_modseq: None,
            highest_uid: None,
            supports_incremental: false,
            updated_at: Utc::now(),
        }
    }

    /// True when the server reports a different UID numbering space than
    /// the one recorded, meaning the local copy of the mailbox is stale.
    pub fn validity_changed(&self, remote_validity: u32) -> bool {
        self.uid_validity
            .map(|stored| stored != remote_validity)
            .unwrap_or(false)
    }
}

impl fmt::Display for SpecialUse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_names_come_from_the_last_path_segment() {
        let folder = MailFolder::new("acct", "INBOX/Work/Reports");
        assert_eq!(folder.id, "acct:INBOX/Work/Reports");
        assert_eq!(folder.name, "Reports");
        assert_eq!(folder.mailbox_path, "INBOX/Work/Reports");
    }

    #[test]
    fn folder_ids_keep_colons_in_paths() {
        let folder = MailFolder::new("acct", "Lists:rust");
        assert_eq!(folder.id, "acct:Lists:rust");
        assert_eq!(folder.mailbox_path, "Lists:rust");
    }

    #[test]
    fn special_use_accepts_imap_attributes() {
        assert_eq!("\\Junk".parse::<SpecialUse>(), Ok(SpecialUse::Junk));
        assert_eq!("Deleted".parse::<SpecialUse>(), Ok(SpecialUse::Trash));
        assert!("\\Noselect".parse::<SpecialUse>().is_err());
    }

    #[test]
    fn validity_change_requires_a_stored_marker() {
        let mut state = MailboxState::new("acct", "INBOX");
        assert!(!state.validity_changed(7));
        state.uid_validity = Some(7);
        assert!(!state.validity_changed(7));
        assert!(state.validity_changed(8));
    }

    #[test]
    fn sparse_message_json_fills_defaults() {
        let raw = r#"{
            "id": "m1",
            "account_id": "acct",
            "folder_id": "acct:INBOX",
            "mailbox_path": "INBOX",
            "subject": "Hello"
        }"#;
        let message: MailMessage = serde_json::from_str(raw).expect("message parsed");
        assert_eq!(message.subject, "Hello");
        assert!(message.references.is_empty());
        assert!(!message.flags.seen);
        assert!(message.thread_id.is_empty());
    }
}
