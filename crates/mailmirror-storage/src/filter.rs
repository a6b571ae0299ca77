//! Composable SQL predicates.
//!
//! A [`Clause`] is a run of SQL text interleaved with bound values. A
//! [`Predicate`] is a conjunction of clauses. Both render into a
//! [`sqlx::QueryBuilder`], so listing, counting and grouping queries all
//! consume the same filter without re-assembling strings.

use sqlx::{QueryBuilder, Sqlite};

/// Escapes `LIKE` wildcards for use with `ESCAPE '\'`.
pub fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// `%value%` with wildcards escaped.
pub fn contains_pattern(value: &str) -> String {
    format!("%{}%", escape_like(value))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Text(String),
    Int(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Sql(String),
    Bind(SqlValue),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Clause {
    parts: Vec<Part>,
}

impl Clause {
    pub fn new(sql: impl Into<String>) -> Self {
        Self::default().sql(sql)
    }

    pub fn sql(mut self, sql: impl Into<String>) -> Self {
        let sql = sql.into();
        if !sql.is_empty() {
            self.parts.push(Part::Sql(sql));
        }
        self
    }

    pub fn bind_text(mut self, value: impl Into<String>) -> Self {
        self.parts.push(Part::Bind(SqlValue::Text(value.into())));
        self
    }

    pub fn bind_int(mut self, value: i64) -> Self {
        self.parts.push(Part::Bind(SqlValue::Int(value)));
        self
    }

    /// Appends `?, ?, ...` for every value.
    pub fn bind_text_list<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for (idx, value) in values.into_iter().enumerate() {
            if idx > 0 {
                self = self.sql(", ");
            }
            self = self.bind_text(value);
        }
        self
    }

    pub fn append(mut self, other: Clause) -> Self {
        self.parts.extend(other.parts);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn push_to(&self, builder: &mut QueryBuilder<'_, Sqlite>) {
        for part in &self.parts {
            match part {
                Part::Sql(sql) => {
                    builder.push(sql);
                }
                Part::Bind(SqlValue::Text(value)) => {
                    builder.push_bind(value.clone());
                }
                Part::Bind(SqlValue::Int(value)) => {
                    builder.push_bind(*value);
                }
            }
        }
    }

    /// The SQL text with `?` in place of every bound value.
    pub fn to_sql(&self) -> String {
        self.parts
            .iter()
            .map(|part| match part {
                Part::Sql(sql) => sql.as_str(),
                Part::Bind(_) => "?",
            })
            .collect()
    }

    pub fn binds(&self) -> Vec<&SqlValue> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::Bind(value) => Some(value),
                Part::Sql(_) => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Predicate {
    clauses: Vec<Clause>,
}

impl Predicate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn and(&mut self, clause: Clause) -> &mut Self {
        if !clause.is_empty() {
            self.clauses.push(clause);
        }
        self
    }

    pub fn with(mut self, clause: Clause) -> Self {
        self.and(clause);
        self
    }

    pub fn extend(&mut self, other: Predicate) -> &mut Self {
        self.clauses.extend(other.clauses);
        self
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Pushes ` WHERE (a) AND (b)`, or nothing for an empty predicate.
    pub fn push_where(&self, builder: &mut QueryBuilder<'_, Sqlite>) {
        self.push_joined(builder, " WHERE ");
    }

    /// Pushes ` AND (a) AND (b)` for appending to an existing condition.
    pub fn push_and(&self, builder: &mut QueryBuilder<'_, Sqlite>) {
        self.push_joined(builder, " AND ");
    }

    fn push_joined(&self, builder: &mut QueryBuilder<'_, Sqlite>, lead: &str) {
        for (idx, clause) in self.clauses.iter().enumerate() {
            builder.push(if idx == 0 { lead } else { " AND " });
            builder.push("(");
            clause.push_to(builder);
            builder.push(")");
        }
    }

    pub fn to_sql(&self) -> String {
        self.clauses
            .iter()
            .map(|clause| format!("({})", clause.to_sql()))
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clauses_render_placeholders_in_order() {
        let clause = Clause::new("m.account_id = ")
            .bind_text("acct")
            .sql(" AND m.date_value >= ")
            .bind_int(42);
        assert_eq!(clause.to_sql(), "m.account_id = ? AND m.date_value >= ?");
        assert_eq!(
            clause.binds(),
            vec![&SqlValue::Text("acct".into()), &SqlValue::Int(42)]
        );
    }

    #[test]
    fn like_wildcards_are_escaped() {
        assert_eq!(contains_pattern("50%_off\\"), "%50\\%\\_off\\\\%");
        assert_eq!(contains_pattern("plain"), "%plain%");
    }

    #[test]
    fn lists_are_comma_separated() {
        let clause = Clause::new("m.id IN (")
            .bind_text_list(["a", "b", "c"])
            .sql(")");
        assert_eq!(clause.to_sql(), "m.id IN (?, ?, ?)");
        assert_eq!(clause.binds().len(), 3);
    }

    #[test]
    fn empty_clauses_are_skipped() {
        let mut predicate = Predicate::new();
        predicate.and(Clause::default());
        predicate.and(Clause::new("m.seen = 0"));
        assert_eq!(predicate.clauses().len(), 1);
        assert_eq!(predicate.to_sql(), "(m.seen = 0)");
    }

    #[test]
    fn predicates_build_where_clauses() {
        let predicate = Predicate::new()
            .with(Clause::new("m.account_id = ").bind_text("acct"))
            .with(Clause::new("m.flagged = 1"));

        let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM messages m");
        predicate.push_where(&mut builder);
        assert_eq!(
            builder.sql(),
            "SELECT COUNT(*) FROM messages m WHERE (m.account_id = ?) AND (m.flagged = 1)"
        );

        let mut empty = QueryBuilder::<Sqlite>::new("SELECT 1");
        Predicate::new().push_where(&mut empty);
        assert_eq!(empty.sql(), "SELECT 1");
    }
}
