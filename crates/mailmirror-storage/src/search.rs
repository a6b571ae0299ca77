use crate::filter::{contains_pattern, Clause, Predicate};
use mailmirror_core::{BadgeFilter, MessageQuery, QuerySettings, SearchField};
use regex::{Captures, Regex};
use std::sync::OnceLock;

/// Full-text columns searched when no field is selected.
const DEFAULT_COLUMNS: [&str; 6] = ["from_addr", "to_addr", "cc_addr", "bcc_addr", "subject", "body"];

const ATTACHMENT_CLAUSE: &str =
    "EXISTS (SELECT 1 FROM attachments a WHERE a.message_id = m.id AND a.inline = 0)";

fn sender_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r#"(?i)(?:^|\s)from:(?:"([^"]*)"|(\S+))"#).expect("valid sender filter regex")
    })
}

/// Output of [`SearchCompiler::compile`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledSearch {
    /// FTS5 match expression over `messages_fts`, if any text remained.
    pub fts_match: Option<String>,
    /// Sender, badge and attachment filters. Always applied.
    pub predicate: Predicate,
}

impl CompiledSearch {
    /// Folds the full-text match into the predicate.
    pub fn into_predicate(self) -> Predicate {
        let mut predicate = self.predicate;
        if let Some(expression) = self.fts_match {
            predicate.and(
                Clause::new("m.seq IN (SELECT rowid FROM messages_fts WHERE messages_fts MATCH ")
                    .bind_text(expression)
                    .sql(")"),
            );
        }
        predicate
    }
}

#[derive(Debug, Clone)]
pub struct SearchCompiler {
    todo_keyword: String,
    pinned_keyword: String,
}

impl SearchCompiler {
    pub fn new(settings: &QuerySettings) -> Self {
        Self {
            todo_keyword: settings.todo_keyword.to_lowercase(),
            pinned_keyword: settings.pinned_keyword.to_lowercase(),
        }
    }

    pub fn compile(&self, query: &MessageQuery) -> CompiledSearch {
        let (senders, remaining) = extract_sender_terms(&query.text);

        let mut predicate = Predicate::new();
        for sender in &senders {
            predicate.and(
                Clause::new("LOWER(m.from_addr) LIKE ")
                    .bind_text(contains_pattern(sender))
                    .sql(" ESCAPE '\\'"),
            );
        }

        let mut wants_attachments = query.attachments_only;
        for badge in &query.badges {
            match badge {
                BadgeFilter::Unread => {
                    predicate.and(Clause::new("m.seen = 0"));
                }
                BadgeFilter::Flagged => {
                    predicate.and(Clause::new("m.flagged = 1"));
                }
                BadgeFilter::Todo => {
                    predicate.and(keyword_clause(&self.todo_keyword));
                }
                BadgeFilter::Pinned => {
                    predicate.and(keyword_clause(&self.pinned_keyword));
                }
                BadgeFilter::Attachments => wants_attachments = true,
            }
        }
        if wants_attachments {
            predicate.and(Clause::new(ATTACHMENT_CLAUSE));
        }

        let fts_match = match_expression(&remaining, &query.fields);
        tracing::debug!(
            senders = senders.len(),
            fts = fts_match.as_deref().unwrap_or(""),
            "compiled search"
        );

        CompiledSearch {
            fts_match,
            predicate,
        }
    }
}

fn keyword_clause(keyword: &str) -> Clause {
    Clause::new("LOWER(m.keywords_json) LIKE ")
        .bind_text(contains_pattern(keyword))
        .sql(" ESCAPE '\\'")
}

/// Splits `from:` terms (bare or quoted) out of the query text.
///
/// Returns the lowercased terms and the text with those tokens removed.
pub fn extract_sender_terms(text: &str) -> (Vec<String>, String) {
    let mut terms = Vec::new();
    let remaining = sender_regex().replace_all(text, |caps: &Captures<'_>| {
        let term = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str().trim().to_lowercase())
            .unwrap_or_default();
        if !term.is_empty() {
            terms.push(term);
        }
        " "
    });
    (terms, remaining.into_owned())
}

/// Builds an FTS5 expression from free text, or `None` if nothing searchable
/// is left.
pub fn match_expression(text: &str, fields: &[SearchField]) -> Option<String> {
    let sanitized: String = text
        .chars()
        .map(|c| if is_word_char(c) || c == '-' { c } else { ' ' })
        .collect();

    let columns = format!("{{{}}}", columns_for(fields).join(" "));
    let parts: Vec<String> = sanitized
        .split_whitespace()
        .filter(|token| token.chars().any(char::is_alphanumeric))
        .map(|token| {
            if token.chars().all(is_word_char) {
                format!("{columns} : \"{token}\"*")
            } else {
                format!("{columns} : \"{token}\"")
            }
        })
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" AND "))
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '@' | '.' | '_' | '+')
}

fn columns_for(fields: &[SearchField]) -> Vec<&'static str> {
    if fields.is_empty() {
        return DEFAULT_COLUMNS.to_vec();
    }
    DEFAULT_COLUMNS
        .into_iter()
        .filter(|column| {
            fields.iter().any(|field| match field {
                SearchField::Subject => *column == "subject",
                SearchField::Body => *column == "body",
                SearchField::Sender => *column == "from_addr",
                SearchField::Participants => {
                    matches!(*column, "from_addr" | "to_addr" | "cc_addr" | "bcc_addr")
                }
            })
        })
        .collect()
}
