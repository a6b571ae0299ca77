//! Conversation reconstruction from reference headers.
//!
//! A message joins the thread of the first message it references (References
//! in order, then In-Reply-To). Parents are resolved before children using an
//! explicit stack, so arbitrarily deep chains and reference cycles never
//! recurse. Results are memoized per local message id for the lifetime of a
//! [`ThreadResolver`].

use crate::filter::Clause;
use crate::mapper::parse_references;
use crate::StorageError;
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

const ID_CHUNK: usize = 200;
const MAX_DESCENDANT_ROUNDS: usize = 32;

const NODE_COLUMNS: &str =
    "m.id, m.message_id, m.in_reply_to, m.references_list, m.thread_id, m.date_value";

/// The threading-relevant part of a stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadNode {
    pub id: String,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub thread_id: String,
    pub date_value: i64,
}

impl ThreadNode {
    /// Message-ID, else the stored thread id, else the local id.
    pub fn own_thread_id(&self) -> String {
        non_empty(self.message_id.as_deref())
            .or_else(|| non_empty(Some(self.thread_id.as_str())))
            .unwrap_or(self.id.as_str())
            .to_string()
    }

    /// Thread id of a message none of whose references are stored.
    fn detached_thread_id(&self) -> String {
        if let Some(reply_to) = non_empty(self.in_reply_to.as_deref()) {
            return reply_to.to_string();
        }
        if let Some(first) = self.references.first() {
            return first.clone();
        }
        self.own_thread_id()
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadChange {
    pub id: String,
    pub old_thread_id: String,
    pub new_thread_id: String,
}

/// Finds messages by their Message-ID header.
#[async_trait]
pub trait MessageLookup: Send {
    /// Every message of the account carrying `message_id`, ordered by
    /// `(date_value, id)`.
    async fn by_message_id(
        &mut self,
        account_id: &str,
        message_id: &str,
    ) -> Result<Vec<ThreadNode>, StorageError>;
}

/// Queries the message table directly; used for incremental rethreading.
pub struct SqliteLookup<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> SqliteLookup<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl<'c> MessageLookup for SqliteLookup<'c> {
    async fn by_message_id(
        &mut self,
        account_id: &str,
        message_id: &str,
    ) -> Result<Vec<ThreadNode>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM messages m \
             WHERE m.account_id = ?1 AND m.message_id = ?2 \
             ORDER BY m.date_value ASC, m.id ASC"
        ))
        .bind(account_id)
        .bind(message_id)
        .fetch_all(&mut *self.conn)
        .await?;

        rows.iter().map(row_to_node).collect()
    }
}

/// An in-memory Message-ID index over an already loaded node set.
#[derive(Debug, Default)]
pub struct NodeIndex {
    by_message_id: HashMap<String, Vec<ThreadNode>>,
}

impl NodeIndex {
    pub fn new(nodes: &[ThreadNode]) -> Self {
        let mut by_message_id: HashMap<String, Vec<ThreadNode>> = HashMap::new();
        for node in nodes {
            if let Some(message_id) = non_empty(node.message_id.as_deref()) {
                by_message_id
                    .entry(message_id.to_string())
                    .or_default()
                    .push(node.clone());
            }
        }
        for list in by_message_id.values_mut() {
            list.sort_by(|a, b| (a.date_value, &a.id).cmp(&(b.date_value, &b.id)));
        }
        Self { by_message_id }
    }
}

#[async_trait]
impl MessageLookup for NodeIndex {
    async fn by_message_id(
        &mut self,
        _account_id: &str,
        message_id: &str,
    ) -> Result<Vec<ThreadNode>, StorageError> {
        Ok(self.by_message_id.get(message_id).cloned().unwrap_or_default())
    }
}

struct Frame {
    node: ThreadNode,
    waiting_on: Option<String>,
}

pub struct ThreadResolver<L> {
    account_id: String,
    lookup: L,
    resolved: HashMap<String, String>,
    in_progress: HashSet<String>,
    candidates: HashMap<String, Vec<ThreadNode>>,
}

impl<L: MessageLookup> ThreadResolver<L> {
    pub fn new(account_id: impl Into<String>, lookup: L) -> Self {
        Self {
            account_id: account_id.into(),
            lookup,
            resolved: HashMap::new(),
            in_progress: HashSet::new(),
            candidates: HashMap::new(),
        }
    }

    /// Resolves every node in `(date_value, id)` order and reports the ones
    /// whose stored thread id differs from the resolved one.
    pub async fn resolve_all(
        &mut self,
        mut nodes: Vec<ThreadNode>,
    ) -> Result<Vec<ThreadChange>, StorageError> {
        nodes.sort_by(|a, b| (a.date_value, &a.id).cmp(&(b.date_value, &b.id)));

        let mut changes = Vec::new();
        for node in nodes {
            let resolved = self.resolve(&node).await?;
            if resolved != node.thread_id {
                changes.push(ThreadChange {
                    id: node.id,
                    old_thread_id: node.thread_id,
                    new_thread_id: resolved,
                });
            }
        }
        Ok(changes)
    }

    pub async fn resolve(&mut self, node: &ThreadNode) -> Result<String, StorageError> {
        if let Some(done) = self.resolved.get(&node.id) {
            return Ok(done.clone());
        }

        self.in_progress.insert(node.id.clone());
        let mut stack = vec![Frame {
            node: node.clone(),
            waiting_on: None,
        }];

        while let Some(frame) = stack.last_mut() {
            if let Some(parent_id) = frame.waiting_on.take() {
                let value = match self.resolved.get(&parent_id) {
                    Some(parent_thread) => parent_thread.clone(),
                    None => frame.node.own_thread_id(),
                };
                let id = frame.node.id.clone();
                stack.pop();
                self.finish(id, value);
                continue;
            }

            let current = frame.node.clone();
            match self.parent_of(&current).await? {
                None => {
                    stack.pop();
                    self.finish(current.id.clone(), current.detached_thread_id());
                }
                Some(parent) => {
                    if let Some(done) = self.resolved.get(&parent.id).cloned() {
                        stack.pop();
                        self.finish(current.id, done);
                    } else if self.in_progress.contains(&parent.id) {
                        // Cycle: the parent is still on the stack.
                        stack.pop();
                        self.finish(current.id, parent.own_thread_id());
                    } else {
                        if let Some(frame) = stack.last_mut() {
                            frame.waiting_on = Some(parent.id.clone());
                        }
                        self.in_progress.insert(parent.id.clone());
                        stack.push(Frame {
                            node: parent,
                            waiting_on: None,
                        });
                    }
                }
            }
        }

        Ok(self
            .resolved
            .get(&node.id)
            .cloned()
            .unwrap_or_else(|| node.own_thread_id()))
    }

    fn finish(&mut self, id: String, thread_id: String) {
        self.in_progress.remove(&id);
        self.resolved.insert(id, thread_id);
    }

    async fn parent_of(&mut self, node: &ThreadNode) -> Result<Option<ThreadNode>, StorageError> {
        for reference in &node.references {
            if let Some(parent) = self.first_other(reference, &node.id).await? {
                return Ok(Some(parent));
            }
        }
        if let Some(reply_to) = non_empty(node.in_reply_to.as_deref()) {
            return self.first_other(reply_to, &node.id).await;
        }
        Ok(None)
    }

    /// Earliest message other than `exclude_id` carrying `message_id`.
    async fn first_other(
        &mut self,
        message_id: &str,
        exclude_id: &str,
    ) -> Result<Option<ThreadNode>, StorageError> {
        if !self.candidates.contains_key(message_id) {
            let found = self
                .lookup
                .by_message_id(&self.account_id, message_id)
                .await?;
            self.candidates.insert(message_id.to_string(), found);
        }
        Ok(self
            .candidates
            .get(message_id)
            .and_then(|list| list.iter().find(|candidate| candidate.id != exclude_id))
            .cloned())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum RethreadScope<'a> {
    Account,
    /// The given messages plus every stored message replying to them,
    /// directly or transitively.
    Messages(&'a [String]),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RethreadOutcome {
    pub changed: usize,
    /// Thread ids whose aggregates may now be stale.
    pub affected_threads: BTreeSet<String>,
}

/// Recomputes thread ids for `scope` and writes back the ones that changed.
pub async fn rethread(
    conn: &mut SqliteConnection,
    account_id: &str,
    scope: RethreadScope<'_>,
) -> Result<RethreadOutcome, StorageError> {
    let mut outcome = RethreadOutcome::default();

    let changes = match scope {
        RethreadScope::Account => {
            let nodes = load_account_nodes(conn, account_id).await?;
            let index = NodeIndex::new(&nodes);
            ThreadResolver::new(account_id, index)
                .resolve_all(nodes)
                .await?
        }
        RethreadScope::Messages(ids) => {
            let nodes = load_with_descendants(conn, account_id, ids).await?;
            outcome
                .affected_threads
                .extend(nodes.iter().map(|node| node.thread_id.clone()));
            let mut resolver = ThreadResolver::new(account_id, SqliteLookup::new(&mut *conn));
            resolver.resolve_all(nodes).await?
        }
    };

    for change in &changes {
        sqlx::query("UPDATE messages SET thread_id = ?1 WHERE id = ?2")
            .bind(&change.new_thread_id)
            .bind(&change.id)
            .execute(&mut *conn)
            .await?;
        outcome.affected_threads.insert(change.old_thread_id.clone());
        outcome.affected_threads.insert(change.new_thread_id.clone());
    }
    outcome.affected_threads.retain(|id| !id.is_empty());
    outcome.changed = changes.len();

    if outcome.changed > 0 {
        tracing::debug!(account_id, changed = outcome.changed, "reassigned thread ids");
    }
    Ok(outcome)
}

/// Rebuilds thread aggregate rows from the message table.
///
/// With `thread_ids` only those threads are recomputed; a thread without
/// remaining messages loses its row. Without it the whole account is rebuilt.
/// Returns the number of threads recomputed.
pub async fn refresh_thread_aggregates(
    conn: &mut SqliteConnection,
    account_id: &str,
    thread_ids: Option<&BTreeSet<String>>,
) -> Result<usize, StorageError> {
    let Some(thread_ids) = thread_ids else {
        sqlx::query("DELETE FROM threads WHERE account_id = ?1")
            .bind(account_id)
            .execute(&mut *conn)
            .await?;
        let mut builder = aggregate_insert(account_id);
        builder.push(" GROUP BY m.account_id, m.thread_id");
        let inserted = builder.build().execute(&mut *conn).await?.rows_affected();
        return Ok(inserted as usize);
    };

    let ids: Vec<&String> = thread_ids.iter().collect();
    for chunk in ids.chunks(ID_CHUNK) {
        let in_list = Clause::default().bind_text_list(chunk.iter().map(|id| id.as_str()));

        let mut delete = QueryBuilder::<Sqlite>::new("DELETE FROM threads WHERE account_id = ");
        delete.push_bind(account_id.to_string());
        delete.push(" AND thread_id IN (");
        in_list.push_to(&mut delete);
        delete.push(")");
        delete.build().execute(&mut *conn).await?;

        let mut insert = aggregate_insert(account_id);
        insert.push(" AND m.thread_id IN (");
        in_list.push_to(&mut insert);
        insert.push(") GROUP BY m.account_id, m.thread_id");
        insert.build().execute(&mut *conn).await?;
    }

    Ok(thread_ids.len())
}

fn aggregate_insert(account_id: &str) -> QueryBuilder<'static, Sqlite> {
    let mut builder = QueryBuilder::new(
        r#"
        INSERT INTO threads (
          account_id, thread_id, root_message_id, latest_message_id,
          latest_date, message_count, unread_count
        )
        SELECT m.account_id, m.thread_id,
          (SELECT r.id FROM messages r
            WHERE r.account_id = m.account_id AND r.thread_id = m.thread_id
            ORDER BY r.date_value ASC, r.id ASC LIMIT 1),
          (SELECT l.id FROM messages l
            WHERE l.account_id = m.account_id AND l.thread_id = m.thread_id
            ORDER BY l.date_value DESC, l.id DESC LIMIT 1),
          MAX(m.date_value),
          COUNT(*),
          SUM(CASE WHEN m.seen = 0 THEN 1 ELSE 0 END)
        FROM messages m
        WHERE m.account_id = "#,
    );
    builder.push_bind(account_id.to_string());
    builder
}

async fn load_account_nodes(
    conn: &mut SqliteConnection,
    account_id: &str,
) -> Result<Vec<ThreadNode>, StorageError> {
    let rows = sqlx::query(&format!(
        "SELECT {NODE_COLUMNS} FROM messages m WHERE m.account_id = ?1"
    ))
    .bind(account_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(row_to_node).collect()
}

async fn load_with_descendants(
    conn: &mut SqliteConnection,
    account_id: &str,
    ids: &[String],
) -> Result<Vec<ThreadNode>, StorageError> {
    let mut nodes: BTreeMap<String, ThreadNode> = BTreeMap::new();

    let unique: BTreeSet<&str> = ids.iter().map(String::as_str).collect();
    let unique: Vec<&str> = unique.into_iter().collect();
    for chunk in unique.chunks(ID_CHUNK) {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {NODE_COLUMNS} FROM messages m WHERE m.account_id = "
        ));
        builder.push_bind(account_id.to_string());
        builder.push(" AND m.id IN (");
        Clause::default()
            .bind_text_list(chunk.iter().copied())
            .push_to(&mut builder);
        builder.push(")");
        for row in builder.build().fetch_all(&mut *conn).await? {
            let node = row_to_node(&row)?;
            nodes.insert(node.id.clone(), node);
        }
    }

    let mut expanded: HashSet<String> = HashSet::new();
    for round in 0.. {
        let frontier: Vec<String> = nodes
            .values()
            .filter_map(|node| non_empty(node.message_id.as_deref()))
            .filter(|message_id| !expanded.contains(*message_id))
            .map(str::to_string)
            .collect();
        if frontier.is_empty() {
            break;
        }
        if round == MAX_DESCENDANT_ROUNDS {
            tracing::warn!(
                account_id,
                pending = frontier.len(),
                "reply chain deeper than descendant search; stopping expansion"
            );
            break;
        }

        let before = nodes.len();
        for chunk in frontier.chunks(ID_CHUNK) {
            for node in replies_to(conn, account_id, chunk).await? {
                nodes.entry(node.id.clone()).or_insert(node);
            }
        }
        expanded.extend(frontier);
        if nodes.len() == before {
            break;
        }
    }

    Ok(nodes.into_values().collect())
}

/// Stored messages whose In-Reply-To or References name one of `message_ids`,
/// found through the `message_references` index.
async fn replies_to(
    conn: &mut SqliteConnection,
    account_id: &str,
    message_ids: &[String],
) -> Result<Vec<ThreadNode>, StorageError> {
    let mut builder = QueryBuilder::<Sqlite>::new(format!(
        "SELECT {NODE_COLUMNS} FROM messages m WHERE m.account_id = "
    ));
    builder.push_bind(account_id.to_string());
    builder.push(
        " AND m.id IN (SELECT r.message_id FROM message_references r WHERE r.account_id = ",
    );
    builder.push_bind(account_id.to_string());
    builder.push(" AND r.ref_id IN (");
    Clause::default()
        .bind_text_list(message_ids.iter().map(String::as_str))
        .push_to(&mut builder);
    builder.push("))");

    let rows = builder.build().fetch_all(&mut *conn).await?;
    rows.iter().map(row_to_node).collect()
}

fn row_to_node(row: &SqliteRow) -> Result<ThreadNode, StorageError> {
    let references_raw: String = row.try_get("references_list")?;
    Ok(ThreadNode {
        id: row.try_get("id")?,
        message_id: row.try_get("message_id")?,
        in_reply_to: row.try_get("in_reply_to")?,
        references: parse_references(&references_raw),
        thread_id: row.try_get("thread_id")?,
        date_value: row.try_get("date_value")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, message_id: Option<&str>, date_value: i64) -> ThreadNode {
        ThreadNode {
            id: id.to_string(),
            message_id: message_id.map(str::to_string),
            in_reply_to: None,
            references: Vec::new(),
            thread_id: String::new(),
            date_value,
        }
    }

    fn replying(mut base: ThreadNode, in_reply_to: &str, references: &[&str]) -> ThreadNode {
        base.in_reply_to = Some(in_reply_to.to_string());
        base.references = references.iter().map(|r| r.to_string()).collect();
        base
    }

    async fn resolve_set(nodes: Vec<ThreadNode>) -> HashMap<String, String> {
        let index = NodeIndex::new(&nodes);
        let mut resolver = ThreadResolver::new("acct", index);
        let mut out = HashMap::new();
        let mut ordered = nodes.clone();
        ordered.sort_by(|a, b| (a.date_value, &a.id).cmp(&(b.date_value, &b.id)));
        for n in &ordered {
            out.insert(n.id.clone(), resolver.resolve(n).await.expect("resolve"));
        }
        out
    }

    #[tokio::test]
    async fn replies_join_the_root_thread() {
        let root = node("1", Some("<root@x>"), 10);
        let reply = replying(node("2", Some("<r1@x>"), 20), "<root@x>", &["<root@x>"]);
        let nested = replying(
            node("3", Some("<r2@x>"), 30),
            "<r1@x>",
            &["<root@x>", "<r1@x>"],
        );

        let resolved = resolve_set(vec![nested, reply, root]).await;
        assert_eq!(resolved["1"], "<root@x>");
        assert_eq!(resolved["2"], "<root@x>");
        assert_eq!(resolved["3"], "<root@x>");
    }

    #[tokio::test]
    async fn first_stored_reference_wins() {
        // The thread root is missing locally; the second reference is stored.
        let parent = node("p", Some("<b@x>"), 5);
        let child = replying(node("c", Some("<c@x>"), 9), "<b@x>", &["<a@x>", "<b@x>"]);

        let resolved = resolve_set(vec![parent, child]).await;
        assert_eq!(resolved["p"], "<b@x>");
        assert_eq!(resolved["c"], "<b@x>");
    }

    #[tokio::test]
    async fn unmatched_headers_are_used_verbatim() {
        let orphan = replying(node("o", Some("<o@x>"), 1), "<gone@x>", &["<older@x>"]);
        let refs_only = ThreadNode {
            references: vec!["<first@x>".to_string(), "<second@x>".to_string()],
            ..node("r", Some("<r@x>"), 2)
        };
        let bare = ThreadNode {
            thread_id: "stored".to_string(),
            ..node("b", None, 3)
        };
        let nothing = node("n", None, 4);

        let resolved = resolve_set(vec![orphan, refs_only, bare, nothing]).await;
        assert_eq!(resolved["o"], "<gone@x>");
        assert_eq!(resolved["r"], "<first@x>");
        assert_eq!(resolved["b"], "stored");
        assert_eq!(resolved["n"], "n");
    }

    #[tokio::test]
    async fn reference_cycles_terminate_with_non_empty_ids() {
        let a = replying(node("a", Some("<a@x>"), 1), "<b@x>", &["<b@x>"]);
        let b = replying(node("b", Some("<b@x>"), 2), "<a@x>", &["<a@x>"]);
        let c = replying(node("c", None, 3), "<c-self@x>", &["<a@x>"]);

        let resolved = resolve_set(vec![a, b, c]).await;
        for id in ["a", "b", "c"] {
            assert!(!resolved[id].is_empty(), "{id} resolved to empty");
        }
        assert_eq!(resolved["a"], resolved["b"]);
        assert_eq!(resolved["c"], resolved["a"]);
    }

    #[tokio::test]
    async fn self_references_do_not_loop() {
        let lonely = replying(node("s", Some("<s@x>"), 1), "<s@x>", &["<s@x>"]);
        let resolved = resolve_set(vec![lonely]).await;
        assert_eq!(resolved["s"], "<s@x>");
    }

    #[tokio::test]
    async fn resolution_is_independent_of_input_order() {
        let build = || {
            vec![
                node("1", Some("<root@x>"), 10),
                replying(node("2", Some("<a@x>"), 20), "<root@x>", &["<root@x>"]),
                replying(node("3", Some("<b@x>"), 30), "<a@x>", &["<root@x>", "<a@x>"]),
                replying(node("4", Some("<c@x>"), 30), "<b@x>", &["<b@x>"]),
                node("5", Some("<other@x>"), 15),
            ]
        };
        let forward = resolve_set(build()).await;
        let mut reversed_input = build();
        reversed_input.reverse();
        let backward = resolve_set(reversed_input).await;
        assert_eq!(forward, backward);
        assert_eq!(forward["4"], "<root@x>");
        assert_eq!(forward["5"], "<other@x>");
    }

    #[tokio::test]
    async fn duplicate_message_ids_prefer_the_earliest_copy() {
        let inbox_copy = ThreadNode {
            thread_id: "t-inbox".to_string(),
            references: vec!["<older@x>".to_string()],
            ..node("inbox", Some("<dup@x>"), 50)
        };
        let archive_copy = ThreadNode {
            thread_id: "t-archive".to_string(),
            ..node("archive", Some("<dup@x>"), 40)
        };
        let reply = replying(node("reply", Some("<re@x>"), 60), "<dup@x>", &["<dup@x>"]);

        let index = NodeIndex::new(&[inbox_copy, archive_copy.clone(), reply.clone()]);
        let mut resolver = ThreadResolver::new("acct", index);
        // The archive copy is earliest and has no parents of its own.
        assert_eq!(resolver.resolve(&reply).await.expect("resolve"), "<dup@x>");
        assert_eq!(
            resolver.resolve(&archive_copy).await.expect("resolve"),
            "<dup@x>"
        );
    }

    #[tokio::test]
    async fn resolve_all_reports_only_changes() {
        let root = ThreadNode {
            thread_id: "<root@x>".to_string(),
            ..node("1", Some("<root@x>"), 1)
        };
        let reply = ThreadNode {
            thread_id: "stale".to_string(),
            ..replying(node("2", Some("<r@x>"), 2), "<root@x>", &[])
        };
        let nodes = vec![root, reply];
        let mut resolver = ThreadResolver::new("acct", NodeIndex::new(&nodes));
        let changes = resolver.resolve_all(nodes).await.expect("resolve");
        assert_eq!(
            changes,
            vec![ThreadChange {
                id: "2".to_string(),
                old_thread_id: "stale".to_string(),
                new_thread_id: "<root@x>".to_string(),
            }]
        );
    }
}
