//! Statement classification
//!
//! Only enough SQL is understood to decide between read routing and write
//! broadcast. Comments are stripped and the first keyword decides the kind.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Select,
    /// INSERT, UPDATE or DELETE
    Dml,
    /// INSERT ... ON CONFLICT
    Upsert,
    Merge,
    /// CREATE, ALTER, DROP, RENAME, TRUNCATE
    Ddl,
    /// BEGIN, COMMIT, ROLLBACK
    Transaction,
    /// CALL, EXEC
    Procedure,
    /// SET, USE, PRAGMA
    Admin,
    /// More than one statement in one string
    Multi,
    Other,
}

impl StatementKind {
    pub fn is_read(self) -> bool {
        matches!(self, StatementKind::Select)
    }

    /// Statements broadcast to every node and captured for down nodes
    pub fn is_write(self) -> bool {
        matches!(
            self,
            StatementKind::Dml | StatementKind::Upsert | StatementKind::Merge | StatementKind::Ddl
        )
    }
}

const DML_COMMANDS: &[&str] = &["insert", "update", "delete"];
const DDL_COMMANDS: &[&str] = &["create", "alter", "drop", "rename", "truncate"];
const TX_COMMANDS: &[&str] = &["begin", "commit", "rollback", "start"];
const PROC_COMMANDS: &[&str] = &["call", "exec", "execute"];
const ADMIN_COMMANDS: &[&str] = &["set", "use", "pragma"];

/// Remove `--` line comments and `/* */` block comments
fn strip_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        let next = chars.peek().copied();
        match (c, next) {
            ('-', Some('-')) => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
                out.push(' ');
            }
            _ => out.push(c),
        }
    }

    out
}

pub fn classify(sql: &str) -> StatementKind {
    let clean = strip_comments(sql).trim().to_lowercase();
    let body = clean.trim_end_matches(|c: char| c == ';' || c.is_whitespace());

    if body.is_empty() {
        return StatementKind::Other;
    }
    if body.contains(';') {
        return StatementKind::Multi;
    }

    let first = body
        .split(|c: char| c.is_whitespace() || c == '(')
        .find(|word| !word.is_empty())
        .unwrap_or_default();

    match first {
        "select" | "with" => StatementKind::Select,
        "insert" if body.contains("on conflict") || body.contains("on duplicate key") => {
            StatementKind::Upsert
        }
        word if DML_COMMANDS.contains(&word) => StatementKind::Dml,
        "merge" => StatementKind::Merge,
        word if DDL_COMMANDS.contains(&word) => StatementKind::Ddl,
        word if TX_COMMANDS.contains(&word) => StatementKind::Transaction,
        word if PROC_COMMANDS.contains(&word) => StatementKind::Procedure,
        word if ADMIN_COMMANDS.contains(&word) => StatementKind::Admin,
        _ => StatementKind::Other,
    }
}
