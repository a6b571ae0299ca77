//! Table layout and additive schema evolution.
//!
//! Migrations are applied in order above the version recorded in
//! `PRAGMA user_version`, each in its own transaction. Column additions check
//! `PRAGMA table_info` first so databases that already carry a column (for
//! example from an older build that added it ad hoc) are left alone.

use crate::StorageError;
use sqlx::{Row, SqliteConnection, SqlitePool};

pub const SCHEMA_VERSION: i64 = 5;

/// Columns of `messages_fts`, in declaration order.
pub const FTS_COLUMNS: [&str; 6] = ["subject", "body", "from_addr", "to_addr", "cc_addr", "bcc_addr"];

enum Step {
    Sql(&'static str),
    AddColumn {
        table: &'static str,
        column: &'static str,
        definition: &'static str,
    },
    /// Adds every column of [`TABLE_COLUMNS`] a table lacks.
    RepairColumns,
}

struct Migration {
    version: i64,
    description: &'static str,
    steps: &'static [Step],
}

/// Every non-key column of the current layout with a definition usable by
/// `ALTER TABLE ... ADD COLUMN`.
const TABLE_COLUMNS: &[(&str, &[(&str, &str)])] = &[
    (
        "accounts",
        &[
            ("display_name", "TEXT NOT NULL DEFAULT ''"),
            ("address", "TEXT NOT NULL DEFAULT ''"),
            ("avatar_url", "TEXT"),
            ("settings_json", "TEXT NOT NULL DEFAULT '{}'"),
            ("created_at", "TEXT NOT NULL DEFAULT ''"),
            ("updated_at", "TEXT NOT NULL DEFAULT ''"),
        ],
    ),
    (
        "folders",
        &[
            ("account_id", "TEXT NOT NULL DEFAULT ''"),
            ("mailbox_path", "TEXT NOT NULL DEFAULT ''"),
            ("name", "TEXT NOT NULL DEFAULT ''"),
            ("parent_id", "TEXT"),
            ("special_use", "TEXT"),
            ("flags_json", "TEXT NOT NULL DEFAULT '[]'"),
            ("delimiter", "TEXT"),
        ],
    ),
    (
        "messages",
        &[
            ("account_id", "TEXT NOT NULL DEFAULT ''"),
            ("folder_id", "TEXT NOT NULL DEFAULT ''"),
            ("mailbox_path", "TEXT NOT NULL DEFAULT ''"),
            ("uid", "INTEGER"),
            ("thread_id", "TEXT NOT NULL DEFAULT ''"),
            ("message_id", "TEXT"),
            ("in_reply_to", "TEXT"),
            ("references_list", "TEXT NOT NULL DEFAULT '[]'"),
            ("subject", "TEXT NOT NULL DEFAULT ''"),
            ("from_addr", "TEXT NOT NULL DEFAULT ''"),
            ("from_email", "TEXT"),
            ("to_addr", "TEXT NOT NULL DEFAULT ''"),
            ("cc_addr", "TEXT NOT NULL DEFAULT ''"),
            ("bcc_addr", "TEXT NOT NULL DEFAULT ''"),
            ("preview", "TEXT NOT NULL DEFAULT ''"),
            ("date_text", "TEXT NOT NULL DEFAULT ''"),
            ("date_value", "INTEGER NOT NULL DEFAULT 0"),
            ("body_text", "TEXT NOT NULL DEFAULT ''"),
            ("body_html", "TEXT"),
            ("priority", "TEXT"),
            ("seen", "INTEGER NOT NULL DEFAULT 0"),
            ("answered", "INTEGER NOT NULL DEFAULT 0"),
            ("flagged", "INTEGER NOT NULL DEFAULT 0"),
            ("deleted", "INTEGER NOT NULL DEFAULT 0"),
            ("draft", "INTEGER NOT NULL DEFAULT 0"),
            ("recent", "INTEGER NOT NULL DEFAULT 0"),
            ("keywords_json", "TEXT NOT NULL DEFAULT '[]'"),
            ("has_source", "INTEGER NOT NULL DEFAULT 0"),
        ],
    ),
    (
        "attachments",
        &[
            ("file_name", "TEXT NOT NULL DEFAULT ''"),
            ("content_type", "TEXT NOT NULL DEFAULT 'application/octet-stream'"),
            ("size", "INTEGER NOT NULL DEFAULT 0"),
            ("inline", "INTEGER NOT NULL DEFAULT 0"),
            ("content_id", "TEXT"),
            ("url", "TEXT"),
        ],
    ),
    (
        "threads",
        &[
            ("root_message_id", "TEXT NOT NULL DEFAULT ''"),
            ("latest_message_id", "TEXT NOT NULL DEFAULT ''"),
            ("latest_date", "INTEGER NOT NULL DEFAULT 0"),
            ("message_count", "INTEGER NOT NULL DEFAULT 0"),
            ("unread_count", "INTEGER NOT NULL DEFAULT 0"),
        ],
    ),
    (
        "mailbox_states",
        &[
            ("mailbox_path", "TEXT NOT NULL DEFAULT ''"),
            ("uid_validity", "INTEGER"),
            ("highest_modseq", "INTEGER"),
            ("highest_uid", "INTEGER"),
            ("supports_incremental", "INTEGER NOT NULL DEFAULT 0"),
            ("updated_at", "TEXT NOT NULL DEFAULT ''"),
        ],
    ),
];

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "base tables",
        steps: &[
            Step::Sql(
                r#"
                CREATE TABLE IF NOT EXISTS accounts (
                  id TEXT PRIMARY KEY,
                  display_name TEXT NOT NULL DEFAULT '',
                  address TEXT NOT NULL DEFAULT '',
                  avatar_url TEXT,
                  settings_json TEXT NOT NULL DEFAULT '{}',
                  created_at TEXT NOT NULL,
                  updated_at TEXT NOT NULL
                )
                "#,
            ),
            Step::Sql(
                r#"
                CREATE TABLE IF NOT EXISTS folders (
                  id TEXT PRIMARY KEY,
                  account_id TEXT NOT NULL,
                  name TEXT NOT NULL,
                  parent_id TEXT,
                  special_use TEXT,
                  flags_json TEXT NOT NULL DEFAULT '[]',
                  delimiter TEXT
                )
                "#,
            ),
            Step::Sql(
                r#"
                CREATE TABLE IF NOT EXISTS messages (
                  seq INTEGER PRIMARY KEY AUTOINCREMENT,
                  id TEXT NOT NULL UNIQUE,
                  account_id TEXT NOT NULL,
                  folder_id TEXT NOT NULL,
                  mailbox_path TEXT NOT NULL DEFAULT '',
                  uid INTEGER,
                  thread_id TEXT NOT NULL,
                  message_id TEXT,
                  in_reply_to TEXT,
                  references_list TEXT NOT NULL DEFAULT '[]',
                  subject TEXT NOT NULL DEFAULT '',
                  from_addr TEXT NOT NULL DEFAULT '',
                  to_addr TEXT NOT NULL DEFAULT '',
                  cc_addr TEXT NOT NULL DEFAULT '',
                  bcc_addr TEXT NOT NULL DEFAULT '',
                  preview TEXT NOT NULL DEFAULT '',
                  date_text TEXT NOT NULL DEFAULT '',
                  date_value INTEGER NOT NULL DEFAULT 0,
                  body_text TEXT NOT NULL DEFAULT '',
                  body_html TEXT,
                  seen INTEGER NOT NULL DEFAULT 0,
                  answered INTEGER NOT NULL DEFAULT 0,
                  flagged INTEGER NOT NULL DEFAULT 0,
                  deleted INTEGER NOT NULL DEFAULT 0,
                  draft INTEGER NOT NULL DEFAULT 0,
                  recent INTEGER NOT NULL DEFAULT 0,
                  keywords_json TEXT NOT NULL DEFAULT '[]'
                )
                "#,
            ),
            Step::Sql(
                r#"
                CREATE TABLE IF NOT EXISTS attachments (
                  id TEXT PRIMARY KEY,
                  message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                  file_name TEXT NOT NULL DEFAULT '',
                  content_type TEXT NOT NULL DEFAULT 'application/octet-stream',
                  size INTEGER NOT NULL DEFAULT 0,
                  inline INTEGER NOT NULL DEFAULT 0
                )
                "#,
            ),
            Step::Sql(
                r#"
                CREATE TABLE IF NOT EXISTS threads (
                  account_id TEXT NOT NULL,
                  thread_id TEXT NOT NULL,
                  root_message_id TEXT NOT NULL,
                  latest_message_id TEXT NOT NULL,
                  latest_date INTEGER NOT NULL,
                  message_count INTEGER NOT NULL,
                  unread_count INTEGER NOT NULL,
                  PRIMARY KEY (account_id, thread_id)
                ) WITHOUT ROWID
                "#,
            ),
            Step::Sql(
                r#"
                CREATE TABLE IF NOT EXISTS mailbox_states (
                  account_id TEXT NOT NULL,
                  folder_id TEXT NOT NULL,
                  mailbox_path TEXT NOT NULL,
                  uid_validity INTEGER,
                  highest_modseq INTEGER,
                  highest_uid INTEGER,
                  supports_incremental INTEGER NOT NULL DEFAULT 0,
                  PRIMARY KEY (account_id, folder_id)
                )
                "#,
            ),
            // Tables from older builds may lack columns the indexes need.
            Step::RepairColumns,
            Step::Sql("CREATE INDEX IF NOT EXISTS idx_folders_account ON folders(account_id)"),
            Step::Sql(
                "CREATE INDEX IF NOT EXISTS idx_messages_account_date ON messages(account_id, date_value DESC)",
            ),
            Step::Sql(
                "CREATE INDEX IF NOT EXISTS idx_messages_folder_date ON messages(account_id, folder_id, date_value DESC)",
            ),
            Step::Sql(
                "CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(account_id, thread_id)",
            ),
            Step::Sql(
                "CREATE INDEX IF NOT EXISTS idx_messages_message_id ON messages(account_id, message_id)",
            ),
            Step::Sql(
                "CREATE INDEX IF NOT EXISTS idx_messages_in_reply_to ON messages(account_id, in_reply_to)",
            ),
            Step::Sql(
                "CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments(message_id)",
            ),
            Step::Sql(
                "CREATE INDEX IF NOT EXISTS idx_threads_latest ON threads(account_id, latest_date DESC)",
            ),
        ],
    },
    Migration {
        version: 2,
        description: "sender address column",
        steps: &[
            Step::AddColumn {
                table: "messages",
                column: "from_email",
                definition: "TEXT",
            },
            Step::Sql(
                r#"
                UPDATE messages
                SET from_email = LOWER(TRIM(
                  CASE
                    WHEN instr(from_addr, '<') > 0 AND instr(from_addr, '>') > instr(from_addr, '<')
                      THEN substr(from_addr, instr(from_addr, '<') + 1,
                                  instr(from_addr, '>') - instr(from_addr, '<') - 1)
                    ELSE from_addr
                  END))
                WHERE from_email IS NULL
                "#,
            ),
            Step::Sql(
                "CREATE INDEX IF NOT EXISTS idx_messages_from_email ON messages(account_id, from_email)",
            ),
        ],
    },
    Migration {
        version: 3,
        description: "message priority and source, attachment references",
        steps: &[
            Step::AddColumn {
                table: "messages",
                column: "priority",
                definition: "TEXT",
            },
            Step::AddColumn {
                table: "messages",
                column: "has_source",
                definition: "INTEGER NOT NULL DEFAULT 0",
            },
            Step::AddColumn {
                table: "attachments",
                column: "content_id",
                definition: "TEXT",
            },
            Step::AddColumn {
                table: "attachments",
                column: "url",
                definition: "TEXT",
            },
        ],
    },
    Migration {
        version: 4,
        description: "explicit folder mailbox paths, sync state timestamps",
        steps: &[
            Step::AddColumn {
                table: "folders",
                column: "mailbox_path",
                definition: "TEXT NOT NULL DEFAULT ''",
            },
            // Legacy folder ids are "<account_id>:<mailbox_path>".
            Step::Sql(
                r#"
                UPDATE folders
                SET mailbox_path = substr(id, length(account_id) + 2)
                WHERE mailbox_path = ''
                  AND substr(id, 1, length(account_id) + 1) = account_id || ':'
                "#,
            ),
            Step::AddColumn {
                table: "mailbox_states",
                column: "updated_at",
                definition: "TEXT NOT NULL DEFAULT ''",
            },
        ],
    },
    Migration {
        version: 5,
        description: "attachments keyed per message, reference index",
        steps: &[
            Step::Sql(
                r#"
                CREATE TABLE attachments_v5 (
                  id TEXT NOT NULL,
                  message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                  file_name TEXT NOT NULL DEFAULT '',
                  content_type TEXT NOT NULL DEFAULT 'application/octet-stream',
                  size INTEGER NOT NULL DEFAULT 0,
                  inline INTEGER NOT NULL DEFAULT 0,
                  content_id TEXT,
                  url TEXT,
                  PRIMARY KEY (message_id, id)
                )
                "#,
            ),
            Step::Sql(
                r#"
                INSERT OR IGNORE INTO attachments_v5 (
                  id, message_id, file_name, content_type, size, inline, content_id, url
                )
                SELECT id, message_id, file_name, content_type, size, inline, content_id, url
                FROM attachments
                ORDER BY rowid
                "#,
            ),
            Step::Sql("DROP TABLE attachments"),
            Step::Sql("ALTER TABLE attachments_v5 RENAME TO attachments"),
            Step::Sql(
                "CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments(message_id)",
            ),
            Step::Sql(
                r#"
                CREATE TABLE IF NOT EXISTS message_references (
                  account_id TEXT NOT NULL,
                  ref_id TEXT NOT NULL,
                  message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                  PRIMARY KEY (account_id, ref_id, message_id)
                ) WITHOUT ROWID
                "#,
            ),
            Step::Sql(
                "CREATE INDEX IF NOT EXISTS idx_message_references_message ON message_references(message_id)",
            ),
            // Rows still holding a whitespace separated header are indexed
            // when they are next written.
            Step::Sql(
                r#"
                INSERT OR IGNORE INTO message_references (account_id, ref_id, message_id)
                SELECT m.account_id, TRIM(r.value), m.id
                FROM messages m,
                     json_each(CASE WHEN json_valid(m.references_list)
                                     AND json_type(m.references_list) = 'array'
                                    THEN m.references_list ELSE '[]' END) r
                WHERE r.type = 'text' AND TRIM(r.value) != ''
                "#,
            ),
            Step::Sql(
                r#"
                INSERT OR IGNORE INTO message_references (account_id, ref_id, message_id)
                SELECT account_id, TRIM(in_reply_to), id
                FROM messages
                WHERE in_reply_to IS NOT NULL AND TRIM(in_reply_to) != ''
                "#,
            ),
        ],
    },
];

/// Brings the database up to [`SCHEMA_VERSION`] and repairs the full-text table.
pub async fn migrate(pool: &SqlitePool) -> Result<(), StorageError> {
    let mut conn = pool.acquire().await?;

    let existing: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'messages'",
    )
    .fetch_one(&mut *conn)
    .await?;
    if existing == 0 {
        tracing::info!(version = SCHEMA_VERSION, "initializing empty mailbox index");
    }

    let current: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(&mut *conn)
        .await?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        apply(&mut conn, migration)
            .await
            .map_err(|source| StorageError::Migration {
                version: migration.version,
                source,
            })?;
        tracing::info!(
            version = migration.version,
            description = migration.description,
            "applied schema migration"
        );
    }

    repair_columns(&mut conn)
        .await
        .map_err(|source| StorageError::Migration {
            version: SCHEMA_VERSION,
            source,
        })?;
    ensure_fts(&mut conn)
        .await
        .map_err(|source| StorageError::Migration {
            version: SCHEMA_VERSION,
            source,
        })?;

    Ok(())
}

async fn apply(conn: &mut SqliteConnection, migration: &Migration) -> Result<(), sqlx::Error> {
    let mut tx = sqlx::Connection::begin(&mut *conn).await?;

    for step in migration.steps {
        match step {
            Step::Sql(sql) => {
                sqlx::query(sql).execute(&mut *tx).await?;
            }
            Step::AddColumn {
                table,
                column,
                definition,
            } => {
                add_column(&mut tx, table, column, definition).await?;
            }
            Step::RepairColumns => {
                repair_columns(&mut tx).await?;
            }
        }
    }

    // PRAGMA arguments cannot be bound.
    sqlx::query(&format!("PRAGMA user_version = {}", migration.version))
        .execute(&mut *tx)
        .await?;

    tx.commit().await
}

/// Returns whether the column had to be added.
async fn add_column(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
    definition: &str,
) -> Result<bool, sqlx::Error> {
    let columns = table_columns(conn, table).await?;
    if columns.iter().any(|existing| existing == column) {
        return Ok(false);
    }
    sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"))
        .execute(&mut *conn)
        .await?;
    Ok(true)
}

/// Adds whatever columns of the current layout existing tables lack.
/// Tables that do not exist are left to the migrations that create them.
async fn repair_columns(conn: &mut SqliteConnection) -> Result<usize, sqlx::Error> {
    let mut added = 0;
    for (table, columns) in TABLE_COLUMNS {
        if table_columns(conn, table).await?.is_empty() {
            continue;
        }
        for (column, definition) in columns.iter() {
            if add_column(conn, table, column, definition).await? {
                tracing::warn!(table, column, "added missing column");
                added += 1;
            }
        }
    }
    Ok(added)
}

async fn table_columns(conn: &mut SqliteConnection, table: &str) -> Result<Vec<String>, sqlx::Error> {
    let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
        .fetch_all(&mut *conn)
        .await?;
    rows.iter()
        .map(|row| row.try_get::<String, _>("name"))
        .collect()
}

async fn ensure_fts(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    let columns = table_columns(conn, "messages_fts").await?;
    if columns.iter().map(String::as_str).eq(FTS_COLUMNS) {
        return Ok(());
    }

    let mut tx = sqlx::Connection::begin(&mut *conn).await?;

    if !columns.is_empty() {
        tracing::warn!(
            found = ?columns,
            expected = ?FTS_COLUMNS,
            "full-text table layout changed; rebuilding"
        );
        sqlx::query("DROP TABLE messages_fts")
            .execute(&mut *tx)
            .await?;
    }

    sqlx::query(&format!(
        "CREATE VIRTUAL TABLE messages_fts USING fts5({}, tokenize = 'unicode61 remove_diacritics 2')",
        FTS_COLUMNS.join(", ")
    ))
    .execute(&mut *tx)
    .await?;

    let populated = sqlx::query(
        r#"
        INSERT INTO messages_fts (rowid, subject, body, from_addr, to_addr, cc_addr, bcc_addr)
        SELECT seq, subject, body_text, from_addr, to_addr, cc_addr, bcc_addr FROM messages
        "#,
    )
    .execute(&mut *tx)
    .await?
    .rows_affected();

    tx.commit().await?;
    tracing::info!(rows = populated, "built full-text index");
    Ok(())
}
