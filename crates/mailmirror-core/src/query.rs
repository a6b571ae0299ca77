use crate::{MailMessage, ThreadAggregate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_PAGE_SIZE: u32 = 200;
pub const MAX_PAGE_SIZE: u32 = 1000;
pub const DEFAULT_SUGGESTION_SCAN: u32 = 2000;
pub const DEFAULT_SUGGESTION_LIMIT: u32 = 200;

/// Limits and keyword names used by listing and search.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuerySettings {
    pub default_page_size: u32,
    pub max_page_size: u32,
    /// How many of the most recent messages recipient suggestions look at.
    pub suggestion_scan_limit: u32,
    pub default_suggestion_limit: u32,
    pub todo_keyword: String,
    pub pinned_keyword: String,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: MAX_PAGE_SIZE,
            suggestion_scan_limit: DEFAULT_SUGGESTION_SCAN,
            default_suggestion_limit: DEFAULT_SUGGESTION_LIMIT,
            todo_keyword: "$todo".to_string(),
            pinned_keyword: "$pinned".to_string(),
        }
    }
}

impl QuerySettings {
    pub fn paginate(&self, page: u32, page_size: u32) -> Pagination {
        let max = self.max_page_size.max(1);
        let page = page.max(1);
        let page_size = page_size.clamp(1, max);
        Pagination { page, page_size }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
}

impl Pagination {
    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.page_size)
    }

    pub fn has_more(&self, returned: usize, total: u64) -> bool {
        self.offset() + (returned as u64) < total
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SearchField {
    Subject,
    Body,
    Sender,
    Participants,
}

impl FromStr for SearchField {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "subject" => Ok(Self::Subject),
            "body" => Ok(Self::Body),
            "sender" | "from" => Ok(Self::Sender),
            "participants" => Ok(Self::Participants),
            other => Err(format!("unknown search field `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BadgeFilter {
    Unread,
    Flagged,
    Todo,
    Pinned,
    Attachments,
}

impl FromStr for BadgeFilter {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "unread" => Ok(Self::Unread),
            "flagged" | "starred" => Ok(Self::Flagged),
            "todo" | "to-do" => Ok(Self::Todo),
            "pinned" => Ok(Self::Pinned),
            "attachments" | "attachment" => Ok(Self::Attachments),
            other => Err(format!("unknown badge filter `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum GroupMode {
    #[default]
    Date,
    Week,
    Year,
    Domain,
    Sender,
    Folder,
    None,
}

impl GroupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Date => "date",
            Self::Week => "week",
            Self::Year => "year",
            Self::Domain => "domain",
            Self::Sender => "sender",
            Self::Folder => "folder",
            Self::None => "none",
        }
    }
}

impl fmt::Display for GroupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "date" => Ok(Self::Date),
            "week" => Ok(Self::Week),
            "year" => Ok(Self::Year),
            "domain" => Ok(Self::Domain),
            "sender" => Ok(Self::Sender),
            "folder" => Ok(Self::Folder),
            "none" | "" => Ok(Self::None),
            other => Err(format!("unknown grouping mode `{other}`")),
        }
    }
}

/// A listing or search request over the messages of one account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageQuery {
    pub account_id: String,
    #[serde(default)]
    pub folder_id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub fields: Vec<SearchField>,
    #[serde(default)]
    pub badges: Vec<BadgeFilter>,
    #[serde(default)]
    pub attachments_only: bool,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub group_by: GroupMode,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

impl MessageQuery {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            folder_id: None,
            text: String::new(),
            fields: Vec::new(),
            badges: Vec::new(),
            attachments_only: false,
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            group_by: GroupMode::Date,
        }
    }

    pub fn in_folder(mut self, folder_id: impl Into<String>) -> Self {
        self.folder_id = Some(folder_id.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_page(mut self, page: u32, page_size: u32) -> Self {
        self.page = page;
        self.page_size = page_size;
        self
    }

    pub fn grouped_by(mut self, mode: GroupMode) -> Self {
        self.group_by = mode;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListedMessage {
    #[serde(flatten)]
    pub message: MailMessage,
    pub group_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupCount {
    pub key: String,
    pub label: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessagePage {
    pub items: Vec<ListedMessage>,
    pub groups: Vec<GroupCount>,
    pub total: u64,
    pub has_more: bool,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadPage {
    pub threads: Vec<ThreadAggregate>,
    pub items: Vec<ListedMessage>,
    pub groups: Vec<GroupCount>,
    /// Number of threads with at least one matching message.
    pub total: u64,
    /// Number of individual messages matching the filter.
    pub base_count: u64,
    pub has_more: bool,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecipientSuggestion {
    pub name: Option<String>,
    pub address: String,
    pub formatted: String,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum IngestMode {
    /// Full resync: everything in scope is removed before the batch is written.
    Replace,
    #[default]
    Merge,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestBatch {
    pub account_id: String,
    #[serde(default)]
    pub folder_id: Option<String>,
    #[serde(default)]
    pub mode: IngestMode,
    pub messages: Vec<MailMessage>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct IngestReport {
    pub written: usize,
    pub rethreaded: usize,
    pub threads_refreshed: usize,
}

/// Flag changes applied to local copies after the server accepted them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FlagChange {
    #[serde(default)]
    pub seen: Option<bool>,
    #[serde(default)]
    pub answered: Option<bool>,
    #[serde(default)]
    pub flagged: Option<bool>,
    #[serde(default)]
    pub deleted: Option<bool>,
    #[serde(default)]
    pub draft: Option<bool>,
}

impl FlagChange {
    pub fn is_empty(&self) -> bool {
        self.seen.is_none()
            && self.answered.is_none()
            && self.flagged.is_none()
            && self.deleted.is_none()
            && self.draft.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_clamps_page_and_size() {
        let settings = QuerySettings::default();
        assert_eq!(
            settings.paginate(0, 0),
            Pagination {
                page: 1,
                page_size: 1
            }
        );
        assert_eq!(settings.paginate(3, 5000).page_size, MAX_PAGE_SIZE);
        assert_eq!(settings.paginate(3, 50).offset(), 100);
    }

    #[test]
    fn has_more_is_false_on_the_final_page() {
        let settings = QuerySettings::default();
        let total = 45_u64;
        for page_size in 1..=50_u32 {
            let pages = total.div_ceil(u64::from(page_size)) as u32;
            for page in 1..=pages + 1 {
                let window = settings.paginate(page, page_size);
                let remaining = total.saturating_sub(window.offset());
                let returned = remaining.min(u64::from(window.page_size)) as usize;
                let expected = window.offset() + (returned as u64) < total;
                assert_eq!(window.has_more(returned, total), expected);
                if page >= pages {
                    assert!(!window.has_more(returned, total));
                }
            }
        }
    }

    #[test]
    fn group_modes_parse_case_insensitively() {
        assert_eq!("Domain".parse::<GroupMode>(), Ok(GroupMode::Domain));
        assert_eq!("none".parse::<GroupMode>(), Ok(GroupMode::None));
        assert!("color".parse::<GroupMode>().is_err());
        assert_eq!("to-do".parse::<BadgeFilter>(), Ok(BadgeFilter::Todo));
        assert_eq!("from".parse::<SearchField>(), Ok(SearchField::Sender));
    }
}
