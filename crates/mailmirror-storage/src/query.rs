use crate::filter::{Clause, Predicate};
use crate::mapper::{extract_addresses, row_to_message, row_to_thread, MESSAGE_COLUMNS};
use crate::search::SearchCompiler;
use crate::storage::{load_attachments, require_id};
use crate::{Storage, StorageError};
use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, TimeZone, Utc};
use mailmirror_core::{
    GroupCount, GroupMode, ListedMessage, MailMessage, MessagePage, MessageQuery, Pagination,
    QuerySettings, RecipientSuggestion, ThreadAggregate, ThreadPage,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashMap;

const THREAD_COLUMNS: &str = "t.account_id, t.thread_id, t.root_message_id, \
     t.latest_message_id, t.latest_date, t.message_count, t.unread_count";

/// Date group keys and labels in display order.
const DATE_GROUPS: [(&str, &str); 4] = [
    ("today", "Today"),
    ("yesterday", "Yesterday"),
    ("this_week", "This Week"),
    ("older", "Older"),
];

const DOMAIN_KEY: &str = "COALESCE(NULLIF(CASE \
     WHEN instr(COALESCE(m.from_email, ''), '@') > 0 \
       THEN LOWER(substr(m.from_email, instr(m.from_email, '@') + 1)) \
     ELSE '' END, ''), 'Unknown')";

/// ISO 8601 `YYYY-Www` in UTC. The week and its year are those of the
/// Thursday in the same Monday-to-Sunday week.
const ISO_WEEK_KEY: &str = "printf('%s-W%02d', \
     strftime('%Y', m.date_value / 1000, 'unixepoch', 'weekday 0', '-3 days'), \
     (CAST(strftime('%j', m.date_value / 1000, 'unixepoch', 'weekday 0', '-3 days') AS INTEGER) - 1) / 7 + 1)";

/// Local-midnight boundaries used by date grouping, in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateBuckets {
    pub today: i64,
    pub yesterday: i64,
    /// Start of the current week. Weeks start on Monday.
    pub week: i64,
}

impl DateBuckets {
    pub fn at(now: DateTime<Local>) -> Self {
        let today = now.date_naive();
        let yesterday = today.pred_opt().unwrap_or(today);
        let week = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
        Self {
            today: local_midnight(today),
            yesterday: local_midnight(yesterday),
            week: local_midnight(week),
        }
    }
}

fn local_midnight(date: NaiveDate) -> i64 {
    let Some(naive) = date.and_hms_opt(0, 0, 0) else {
        return 0;
    };
    match Local.from_local_datetime(&naive).earliest() {
        Some(start) => start.timestamp_millis(),
        // Midnight skipped by a DST change.
        None => Utc.from_utc_datetime(&naive).timestamp_millis(),
    }
}

/// SQL producing the group key of a message row aliased `m`.
fn group_key_expression(mode: GroupMode, buckets: &DateBuckets) -> Clause {
    match mode {
        GroupMode::Date => Clause::new("CASE WHEN m.date_value >= ")
            .bind_int(buckets.today)
            .sql(" THEN 'today' WHEN m.date_value >= ")
            .bind_int(buckets.yesterday)
            .sql(" THEN 'yesterday' WHEN m.date_value >= ")
            .bind_int(buckets.week)
            .sql(" THEN 'this_week' ELSE 'older' END"),
        GroupMode::Week => Clause::new(ISO_WEEK_KEY),
        GroupMode::Year => Clause::new("strftime('%Y', m.date_value / 1000, 'unixepoch')"),
        GroupMode::Domain => Clause::new(DOMAIN_KEY),
        GroupMode::Sender => Clause::new("m.from_addr"),
        GroupMode::Folder => Clause::new("m.folder_id"),
        GroupMode::None => Clause::new("'all'"),
    }
}

fn group_label(mode: GroupMode, key: &str, folder_names: &HashMap<String, String>) -> String {
    match mode {
        GroupMode::Date => DATE_GROUPS
            .iter()
            .find(|(known, _)| *known == key)
            .map(|(_, label)| label.to_string())
            .unwrap_or_else(|| key.to_string()),
        GroupMode::Folder => folder_names
            .get(key)
            .cloned()
            .unwrap_or_else(|| key.to_string()),
        GroupMode::Sender if key.trim().is_empty() => "Unknown".to_string(),
        GroupMode::None => "All".to_string(),
        _ => key.to_string(),
    }
}

fn sort_groups(mode: GroupMode, groups: &mut [GroupCount]) {
    match mode {
        GroupMode::Date => groups.sort_by_key(|group| {
            DATE_GROUPS
                .iter()
                .position(|(known, _)| *known == group.key)
                .unwrap_or(DATE_GROUPS.len())
        }),
        GroupMode::Week | GroupMode::Year => groups.sort_by(|a, b| b.key.cmp(&a.key)),
        GroupMode::Domain | GroupMode::Sender | GroupMode::Folder => groups.sort_by(|a, b| {
            b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key))
        }),
        GroupMode::None => {}
    }
}

fn offset(window: &Pagination) -> i64 {
    i64::try_from(window.offset()).unwrap_or(i64::MAX)
}

/// Read side of the index: listing, search, grouping and thread views.
#[derive(Clone)]
pub struct QueryEngine {
    pool: SqlitePool,
    settings: QuerySettings,
    compiler: SearchCompiler,
}

impl QueryEngine {
    pub fn new(storage: &Storage, settings: QuerySettings) -> Self {
        let compiler = SearchCompiler::new(&settings);
        Self {
            pool: storage.pool().clone(),
            settings,
            compiler,
        }
    }

    pub fn settings(&self) -> &QuerySettings {
        &self.settings
    }

    /// One page of matching messages, newest first, with the grouping of the
    /// whole result.
    pub async fn list_messages(&self, query: &MessageQuery) -> Result<MessagePage, StorageError> {
        self.list_messages_at(query, Local::now()).await
    }

    pub(crate) async fn list_messages_at(
        &self,
        query: &MessageQuery,
        now: DateTime<Local>,
    ) -> Result<MessagePage, StorageError> {
        let window = self.settings.paginate(query.page, query.page_size);
        let predicate = self.filter(query)?;
        let key = group_key_expression(query.group_by, &DateBuckets::at(now));

        let groups = self
            .count_groups(&query.account_id, query.group_by, &predicate, &key)
            .await?;
        let total: u64 = groups.iter().map(|group| group.count).sum();

        let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {MESSAGE_COLUMNS}, "));
        key.push_to(&mut builder);
        builder.push(" AS group_key FROM messages m");
        predicate.push_where(&mut builder);
        builder.push(" ORDER BY m.date_value DESC, m.id DESC LIMIT ");
        builder.push_bind(i64::from(window.page_size));
        builder.push(" OFFSET ");
        builder.push_bind(offset(&window));
        let rows = builder.build().fetch_all(&self.pool).await?;

        let items = self.listed(&rows).await?;
        Ok(MessagePage {
            has_more: window.has_more(items.len(), total),
            items,
            groups,
            total,
            page: window.page,
            page_size: window.page_size,
        })
    }

    /// One page of threads containing at least one matching message, ordered
    /// by their latest message. Every message of those threads is returned.
    pub async fn list_threads(&self, query: &MessageQuery) -> Result<ThreadPage, StorageError> {
        self.list_threads_at(query, Local::now()).await
    }

    pub(crate) async fn list_threads_at(
        &self,
        query: &MessageQuery,
        now: DateTime<Local>,
    ) -> Result<ThreadPage, StorageError> {
        let window = self.settings.paginate(query.page, query.page_size);
        let predicate = self.filter(query)?;
        let key = group_key_expression(query.group_by, &DateBuckets::at(now));

        let groups = self
            .count_groups(&query.account_id, query.group_by, &predicate, &key)
            .await?;
        let base_count: u64 = groups.iter().map(|group| group.count).sum();

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(DISTINCT m.thread_id) FROM messages m");
        predicate.push_where(&mut count);
        let total = count
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;
        let total = total.max(0) as u64;

        let mut page = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {THREAD_COLUMNS} FROM threads t WHERE t.account_id = "
        ));
        page.push_bind(query.account_id.clone());
        page.push(" AND t.thread_id IN (SELECT m.thread_id FROM messages m");
        predicate.push_where(&mut page);
        page.push(") ORDER BY t.latest_date DESC, t.thread_id DESC LIMIT ");
        page.push_bind(i64::from(window.page_size));
        page.push(" OFFSET ");
        page.push_bind(offset(&window));
        let threads = page
            .build()
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(row_to_thread)
            .collect::<Result<Vec<ThreadAggregate>, _>>()?;

        let items = if threads.is_empty() {
            Vec::new()
        } else {
            let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {MESSAGE_COLUMNS}, "));
            key.push_to(&mut builder);
            builder.push(" AS group_key FROM messages m WHERE m.account_id = ");
            builder.push_bind(query.account_id.clone());
            builder.push(" AND m.thread_id IN (");
            Clause::default()
                .bind_text_list(threads.iter().map(|thread| thread.thread_id.as_str()))
                .push_to(&mut builder);
            builder.push(") ORDER BY m.date_value DESC, m.id DESC");
            let rows = builder.build().fetch_all(&self.pool).await?;
            self.listed(&rows).await?
        };

        Ok(ThreadPage {
            has_more: window.has_more(threads.len(), total),
            threads,
            items,
            groups,
            total,
            base_count,
            page: window.page,
            page_size: window.page_size,
        })
    }

    /// Group counts of every message matching `query`, ignoring pagination.
    pub async fn group_counts(&self, query: &MessageQuery) -> Result<Vec<GroupCount>, StorageError> {
        self.group_counts_at(query, Local::now()).await
    }

    pub(crate) async fn group_counts_at(
        &self,
        query: &MessageQuery,
        now: DateTime<Local>,
    ) -> Result<Vec<GroupCount>, StorageError> {
        let predicate = self.filter(query)?;
        let key = group_key_expression(query.group_by, &DateBuckets::at(now));
        self.count_groups(&query.account_id, query.group_by, &predicate, &key)
            .await
    }

    /// Every message of the named threads and of the threads the named
    /// messages belong to, oldest first.
    pub async fn thread_messages(
        &self,
        account_id: &str,
        thread_ids: &[String],
        message_ids: &[String],
    ) -> Result<Vec<MailMessage>, StorageError> {
        require_id(account_id, "account id")?;
        if thread_ids.is_empty() && message_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut scopes = Vec::new();
        if !thread_ids.is_empty() {
            scopes.push(
                Clause::new("m.thread_id IN (")
                    .bind_text_list(thread_ids.iter().map(String::as_str))
                    .sql(")"),
            );
        }
        if !message_ids.is_empty() {
            scopes.push(
                Clause::new("m.thread_id IN (SELECT s.thread_id FROM messages s WHERE s.account_id = ")
                    .bind_text(account_id)
                    .sql(" AND s.id IN (")
                    .bind_text_list(message_ids.iter().map(String::as_str))
                    .sql("))"),
            );
        }
        let mut either = Clause::default();
        for (idx, scope) in scopes.into_iter().enumerate() {
            if idx > 0 {
                either = either.sql(" OR ");
            }
            either = either.append(scope);
        }
        let predicate = Predicate::new()
            .with(Clause::new("m.account_id = ").bind_text(account_id))
            .with(either);

        let mut builder =
            QueryBuilder::<Sqlite>::new(format!("SELECT {MESSAGE_COLUMNS} FROM messages m"));
        predicate.push_where(&mut builder);
        builder.push(" ORDER BY m.date_value ASC, m.id ASC");
        let rows = builder.build().fetch_all(&self.pool).await?;

        let mut messages = rows
            .iter()
            .map(row_to_message)
            .collect::<Result<Vec<_>, _>>()?;
        load_attachments(&self.pool, &mut messages).await?;
        Ok(messages)
    }

    /// Addresses the account has written to recently, most frequent first.
    pub async fn recipient_suggestions(
        &self,
        account_id: &str,
        query: &str,
        limit: Option<u32>,
    ) -> Result<Vec<RecipientSuggestion>, StorageError> {
        require_id(account_id, "account id")?;
        let limit = limit
            .unwrap_or(self.settings.default_suggestion_limit)
            .max(1) as usize;

        let rows = sqlx::query(
            r#"
            SELECT to_addr, cc_addr, bcc_addr
            FROM messages
            WHERE account_id = ?1
            ORDER BY date_value DESC, id DESC
            LIMIT ?2
            "#,
        )
        .bind(account_id)
        .bind(i64::from(self.settings.suggestion_scan_limit.max(1)))
        .fetch_all(&self.pool)
        .await?;

        let mut ranked: HashMap<String, (Option<String>, u32)> = HashMap::new();
        for row in &rows {
            for column in ["to_addr", "cc_addr", "bcc_addr"] {
                let field: String = row.try_get(column)?;
                for (name, address) in extract_addresses(&field) {
                    let entry = ranked.entry(address).or_insert((None, 0));
                    entry.1 += 1;
                    if entry.0.is_none() {
                        entry.0 = name;
                    }
                }
            }
        }

        let needle = query.trim().to_lowercase();
        let mut suggestions: Vec<RecipientSuggestion> = ranked
            .into_iter()
            .map(|(address, (name, count))| {
                let formatted = match &name {
                    Some(name) => format!("{name} <{address}>"),
                    None => address.clone(),
                };
                RecipientSuggestion {
                    name,
                    address,
                    formatted,
                    count,
                }
            })
            .filter(|suggestion| {
                needle.is_empty()
                    || suggestion.formatted.to_lowercase().contains(&needle)
                    || suggestion.address.contains(&needle)
            })
            .collect();

        suggestions.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.address.cmp(&b.address)));
        suggestions.truncate(limit);
        Ok(suggestions)
    }

    fn filter(&self, query: &MessageQuery) -> Result<Predicate, StorageError> {
        require_id(&query.account_id, "account id")?;

        let mut predicate =
            Predicate::new().with(Clause::new("m.account_id = ").bind_text(query.account_id.as_str()));
        if let Some(folder_id) = query.folder_id.as_deref().filter(|id| !id.is_empty()) {
            predicate.and(Clause::new("m.folder_id = ").bind_text(folder_id));
        }
        predicate.extend(self.compiler.compile(query).into_predicate());
        Ok(predicate)
    }

    async fn count_groups(
        &self,
        account_id: &str,
        mode: GroupMode,
        predicate: &Predicate,
        key: &Clause,
    ) -> Result<Vec<GroupCount>, StorageError> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT ");
        key.push_to(&mut builder);
        builder.push(" AS group_key, COUNT(*) AS total FROM messages m");
        predicate.push_where(&mut builder);
        builder.push(" GROUP BY group_key");
        let rows = builder.build().fetch_all(&self.pool).await?;

        let folder_names = if mode == GroupMode::Folder {
            self.folder_names(account_id).await?
        } else {
            HashMap::new()
        };

        let mut groups = Vec::with_capacity(rows.len());
        for row in &rows {
            let key: Option<String> = row.try_get("group_key")?;
            let key = key.unwrap_or_default();
            let count: i64 = row.try_get("total")?;
            groups.push(GroupCount {
                label: group_label(mode, &key, &folder_names),
                key,
                count: count.max(0) as u64,
            });
        }
        sort_groups(mode, &mut groups);
        Ok(groups)
    }

    async fn folder_names(&self, account_id: &str) -> Result<HashMap<String, String>, StorageError> {
        let rows = sqlx::query("SELECT id, name FROM folders WHERE account_id = ?1")
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?;
        let mut names = HashMap::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.try_get("id")?;
            let name: String = row.try_get("name")?;
            names.insert(id, name);
        }
        Ok(names)
    }

    async fn listed(&self, rows: &[SqliteRow]) -> Result<Vec<ListedMessage>, StorageError> {
        let mut messages = Vec::with_capacity(rows.len());
        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            messages.push(row_to_message(row)?);
            let key: Option<String> = row.try_get("group_key")?;
            keys.push(key.unwrap_or_default());
        }
        load_attachments(&self.pool, &mut messages).await?;

        Ok(messages
            .into_iter()
            .zip(keys)
            .map(|(message, group_key)| ListedMessage { message, group_key })
            .collect())
    }
}
