//! Embedded SQL engine wrapper.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite
//! library is required.  Each configured logical database is a separate
//! in-memory connection; durability comes from the replicated log and
//! snapshots, not from the engine's own files.
//!
//! The engine is owned by the state machine.  Committed commands are
//! applied with [`Engine::apply`]; everything else (compiling, previews,
//! reads) runs inside a savepoint that is always rolled back, so it never
//! changes replicated state.

use std::cell::Cell;
use std::collections::BTreeMap;

use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, ToSql};
use serde::{Deserialize, Serialize};

use crate::errors::DbError;

/// Name of the savepoint used for rolled-back previews.
const PREVIEW_SAVEPOINT: &str = "quorumlite_preview";

/// Functions whose result depends on the node or the moment they run,
/// paired with the largest argument count for which that holds.
const NON_DETERMINISTIC: &[(&str, usize)] = &[
    ("random", usize::MAX),
    ("randomblob", usize::MAX),
    ("last_insert_rowid", usize::MAX),
    ("changes", usize::MAX),
    ("total_changes", usize::MAX),
    ("date", 0),
    ("time", 0),
    ("datetime", 0),
    ("julianday", 0),
    ("unixepoch", 0),
    ("strftime", 1),
];

/// Date and time functions that read the clock or the local timezone
/// when given one of [`CLOCK_MODIFIERS`].
const TIME_FUNCTIONS: &[&str] = &[
    "date",
    "time",
    "datetime",
    "julianday",
    "unixepoch",
    "strftime",
    "timediff",
];

const CLOCK_MODIFIERS: &[&str] = &["now", "localtime", "utc"];

const CLOCK_KEYWORDS: &[&str] = &["current_timestamp", "current_date", "current_time"];

/// Keywords after which a name followed by `(` is a table, index or
/// column list rather than a function call.
const OBJECT_KEYWORDS: &[&str] = &[
    "table",
    "into",
    "on",
    "references",
    "exists",
    "update",
    "join",
    "from",
    "index",
    "view",
    "trigger",
];

/// A SQL value as bound to parameters and returned in rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Value::Real(f) => ToSqlOutput::Borrowed(ValueRef::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl From<ValueRef<'_>> for Value {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        }
    }
}

/// One SQL statement with its bound parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlStatement {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl SqlStatement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// A batch of write statements applied atomically to one database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlCommand {
    pub database: String,
    pub statements: Vec<SqlStatement>,
}

/// Outcome of a write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub last_insert_id: i64,
    pub rows_affected: u64,
}

/// Fully materialized result of a read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// How a prepared statement is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Begin,
    Commit,
    Rollback,
    Read,
    Write,
}

/// Compile-time description of a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementInfo {
    pub kind: StatementKind,
    pub param_count: usize,
    pub columns: Vec<String>,
}

/// The set of logical databases served by this node.
pub struct Engine {
    databases: BTreeMap<String, Connection>,
    /// Rowid of the last committed insert per database.  Previews move the
    /// connection's own counter, so it is never read outside a batch.
    last_insert_ids: BTreeMap<String, Cell<i64>>,
}

impl Engine {
    /// Open an empty in-memory database for every configured name.
    pub fn open<S: AsRef<str>>(names: &[S]) -> Result<Self, DbError> {
        let mut databases = BTreeMap::new();
        for name in names {
            databases.insert(name.as_ref().to_string(), open_connection()?);
        }
        let last_insert_ids = insert_ids_for(&databases);
        Ok(Self {
            databases,
            last_insert_ids,
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.databases.keys().map(String::as_str)
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.databases.contains_key(name)
    }

    pub(crate) fn connections(&self) -> impl Iterator<Item = (&str, &Connection)> {
        self.databases.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Swap in a complete new set of databases (snapshot install).
    pub(crate) fn replace_all(&mut self, databases: BTreeMap<String, Connection>) {
        self.last_insert_ids = insert_ids_for(&databases);
        self.databases = databases;
    }

    fn last_insert_id(&self, name: &str) -> Result<&Cell<i64>, DbError> {
        self.last_insert_ids.get(name).ok_or_else(|| DbError::NotFound {
            name: name.to_string(),
        })
    }

    fn conn(&self, name: &str) -> Result<&Connection, DbError> {
        self.databases.get(name).ok_or_else(|| DbError::NotFound {
            name: name.to_string(),
        })
    }

    /// Apply a committed command in a single transaction.  On error the
    /// whole batch is rolled back, identically on every replica.
    pub fn apply(&self, command: &SqlCommand) -> Result<ExecResult, DbError> {
        let conn = self.conn(&command.database)?;
        let committed = self.last_insert_id(&command.database)?;
        let tx = conn.unchecked_transaction()?;
        let result = run_batch(&tx, &command.statements, committed.get())?;
        tx.commit()?;
        committed.set(result.last_insert_id);
        Ok(result)
    }

    /// Compile `sql` after replaying `preamble` (the session's pending
    /// writes), and classify it.
    pub fn describe(
        &self,
        database: &str,
        preamble: &[SqlStatement],
        sql: &str,
    ) -> Result<StatementInfo, DbError> {
        let conn = self.conn(database)?;
        if let Some(kind) = transaction_control(sql)? {
            return Ok(StatementInfo {
                kind,
                param_count: 0,
                columns: Vec::new(),
            });
        }
        with_preview(conn, preamble, false, |conn| {
            let stmt = conn.prepare(sql).map_err(DbError::from_prepare)?;
            let kind = if stmt.readonly() {
                StatementKind::Read
            } else {
                StatementKind::Write
            };
            if kind == StatementKind::Write {
                check_deterministic(sql)?;
            }
            Ok(StatementInfo {
                kind,
                param_count: stmt.parameter_count(),
                columns: stmt.column_names().into_iter().map(String::from).collect(),
            })
        })
    }

    /// Execute `statement` on top of `preamble` and report what it would
    /// do, then roll everything back.
    pub fn preview(
        &self,
        database: &str,
        preamble: &[SqlStatement],
        statement: &SqlStatement,
    ) -> Result<ExecResult, DbError> {
        let conn = self.conn(database)?;
        let committed = self.last_insert_id(database)?.get();
        with_preview(conn, &[], true, |conn| {
            let pending = run_batch(conn, preamble, committed)?;
            run_batch(conn, std::slice::from_ref(statement), pending.last_insert_id)
        })
    }

    /// Run a read-only statement against local state, seeing the
    /// session's pending writes if any.
    pub fn query(
        &self,
        database: &str,
        preamble: &[SqlStatement],
        statement: &SqlStatement,
    ) -> Result<QueryResult, DbError> {
        self.query_limited(database, preamble, statement, usize::MAX)
    }

    /// Like [`Engine::query`], failing with `ResultTooLarge` as soon as the
    /// result grows past `max_rows`.
    pub fn query_limited(
        &self,
        database: &str,
        preamble: &[SqlStatement],
        statement: &SqlStatement,
        max_rows: usize,
    ) -> Result<QueryResult, DbError> {
        let conn = self.conn(database)?;
        with_preview(conn, preamble, false, |conn| {
            let mut stmt = conn.prepare(&statement.sql).map_err(DbError::from_prepare)?;
            let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            let width = stmt.column_count();
            let mut rows = stmt.query(params_from_iter(statement.params.iter()))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                if out.len() == max_rows {
                    return Err(DbError::ResultTooLarge { limit: max_rows });
                }
                let mut values = Vec::with_capacity(width);
                for i in 0..width {
                    values.push(Value::from(row.get_ref(i)?));
                }
                out.push(values);
            }
            Ok(QueryResult { columns, rows: out })
        })
    }

    /// Step a read-only statement to completion without keeping its rows.
    pub fn run_read(
        &self,
        database: &str,
        preamble: &[SqlStatement],
        statement: &SqlStatement,
    ) -> Result<(), DbError> {
        let conn = self.conn(database)?;
        with_preview(conn, preamble, false, |conn| {
            let mut stmt = conn.prepare(&statement.sql).map_err(DbError::from_prepare)?;
            let mut rows = stmt.query(params_from_iter(statement.params.iter()))?;
            while rows.next()?.is_some() {}
            Ok(())
        })
    }
}

/// Open a fresh in-memory connection with the standard pragmas.
pub(crate) fn open_connection() -> Result<Connection, DbError> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

fn insert_ids_for(databases: &BTreeMap<String, Connection>) -> BTreeMap<String, Cell<i64>> {
    databases
        .keys()
        .map(|name| (name.clone(), Cell::new(0)))
        .collect()
}

fn run_statement(conn: &Connection, statement: &SqlStatement) -> Result<usize, DbError> {
    let mut stmt = conn.prepare(&statement.sql).map_err(DbError::from_prepare)?;
    Ok(stmt.execute(params_from_iter(statement.params.iter()))?)
}

/// Run `statements` in order.  The reported insert id starts at
/// `last_insert_id` and only moves when a statement inserts a row.
fn run_batch(
    conn: &Connection,
    statements: &[SqlStatement],
    mut last_insert_id: i64,
) -> Result<ExecResult, DbError> {
    let mut rows_affected = 0u64;
    for statement in statements {
        let changed = run_statement(conn, statement)?;
        rows_affected += changed as u64;
        if changed > 0 && is_insert(&statement.sql) {
            last_insert_id = conn.last_insert_rowid();
        }
    }
    Ok(ExecResult {
        last_insert_id,
        rows_affected,
    })
}

fn is_insert(sql: &str) -> bool {
    let words: Vec<String> = tokenize(sql)
        .into_iter()
        .filter_map(|token| match token {
            Token::Word(word) => Some(word),
            _ => None,
        })
        .collect();
    match words.first().map(String::as_str) {
        Some("insert") | Some("replace") => true,
        Some("with") => words.iter().any(|w| w == "insert" || w == "replace"),
        _ => false,
    }
}

/// Run `f` inside a savepoint that is always rolled back.  Without a
/// preamble and with `force == false` no savepoint is opened.
fn with_preview<T, F>(
    conn: &Connection,
    preamble: &[SqlStatement],
    force: bool,
    f: F,
) -> Result<T, DbError>
where
    F: FnOnce(&Connection) -> Result<T, DbError>,
{
    if preamble.is_empty() && !force {
        return f(conn);
    }
    conn.execute_batch(&format!("SAVEPOINT {PREVIEW_SAVEPOINT}"))?;
    let result = preamble
        .iter()
        .try_for_each(|s| run_statement(conn, s).map(|_| ()))
        .and_then(|_| f(conn));
    conn.execute_batch(&format!(
        "ROLLBACK TO {PREVIEW_SAVEPOINT}; RELEASE {PREVIEW_SAVEPOINT}"
    ))?;
    result
}

/// Classify transaction-control statements by their leading keyword.
/// Returns `Ok(None)` for anything that must be compiled by the engine.
pub fn transaction_control(sql: &str) -> Result<Option<StatementKind>, DbError> {
    let mut words = strip_leading_comments(sql)
        .split(|c: char| c.is_whitespace() || c == ';')
        .filter(|w| !w.is_empty())
        .map(|w| w.to_ascii_uppercase());
    let first = match words.next() {
        Some(word) => word,
        None => return Ok(None),
    };
    match first.as_str() {
        "BEGIN" => Ok(Some(StatementKind::Begin)),
        "COMMIT" | "END" => Ok(Some(StatementKind::Commit)),
        "ROLLBACK" => match words.next().as_deref() {
            None | Some("TRANSACTION") => Ok(Some(StatementKind::Rollback)),
            Some(_) => Err(DbError::Unsupported {
                message: "savepoints are not supported".to_string(),
            }),
        },
        "SAVEPOINT" | "RELEASE" => Err(DbError::Unsupported {
            message: "savepoints are not supported".to_string(),
        }),
        _ => Ok(None),
    }
}

fn strip_leading_comments(mut sql: &str) -> &str {
    loop {
        sql = sql.trim_start();
        if let Some(rest) = sql.strip_prefix("--") {
            sql = rest.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
        } else if let Some(rest) = sql.strip_prefix("/*") {
            sql = rest.split_once("*/").map(|(_, tail)| tail).unwrap_or("");
        } else {
            return sql;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// Bare identifier or keyword, lowercased.
    Word(String),
    /// Contents of a string literal, lowercased.
    Str(String),
    Open,
    Close,
    Comma,
    Other,
}

/// Split SQL into the tokens the checks below care about.  Quoted
/// identifiers and comments never produce words.
fn tokenize(sql: &str) -> Vec<Token> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            _ if c.is_whitespace() => i += 1,
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 2;
            }
            '\'' => {
                let mut literal = String::new();
                i += 1;
                while i < chars.len() {
                    if chars[i] == '\'' {
                        if chars.get(i + 1) == Some(&'\'') {
                            literal.push('\'');
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    literal.push(chars[i]);
                    i += 1;
                }
                i += 1;
                tokens.push(Token::Str(literal.to_ascii_lowercase()));
            }
            '"' | '`' | '[' => {
                let close = if c == '[' { ']' } else { c };
                i += 1;
                while i < chars.len() && chars[i] != close {
                    i += 1;
                }
                i += 1;
                tokens.push(Token::Other);
            }
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            _ if c.is_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(Token::Word(word.to_ascii_lowercase()));
            }
            _ => {
                tokens.push(Token::Other);
                i += 1;
            }
        }
    }
    tokens
}

/// A function call found in a token stream.
struct Call<'a> {
    name: &'a str,
    args: usize,
}

fn calls(tokens: &[Token]) -> Vec<Call<'_>> {
    let mut out = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        let Token::Word(name) = token else { continue };
        if tokens.get(i + 1) != Some(&Token::Open) {
            continue;
        }
        if let Some(Token::Word(prev)) = i.checked_sub(1).and_then(|j| tokens.get(j)) {
            if OBJECT_KEYWORDS.contains(&prev.as_str()) {
                continue;
            }
        }
        out.push(Call {
            name: name.as_str(),
            args: argument_count(&tokens[i + 2..]),
        });
    }
    out
}

/// Number of arguments of a call whose opening parenthesis has just been
/// consumed.
fn argument_count(tokens: &[Token]) -> usize {
    let mut depth = 0usize;
    let mut commas = 0;
    let mut seen = false;
    for token in tokens {
        match token {
            Token::Close if depth == 0 => break,
            Token::Close => depth -= 1,
            Token::Open => {
                depth += 1;
                seen = true;
            }
            Token::Comma if depth == 0 => commas += 1,
            _ => seen = true,
        }
    }
    if seen {
        commas + 1
    } else {
        0
    }
}

fn non_deterministic(what: &str) -> DbError {
    DbError::Unsupported {
        message: format!(
            "non-deterministic expression {what} cannot be replicated; bind the value as a parameter"
        ),
    }
}

/// Reject writes whose effect depends on the node evaluating them: the
/// clock, the local timezone, randomness, or the connection's history.
pub fn check_deterministic(sql: &str) -> Result<(), DbError> {
    let tokens = tokenize(sql);
    let found = calls(&tokens);
    for call in &found {
        let limit = NON_DETERMINISTIC
            .iter()
            .find(|(name, _)| *name == call.name)
            .map(|(_, max_args)| *max_args);
        if matches!(limit, Some(max_args) if call.args <= max_args) {
            return Err(non_deterministic(&format!("{}()", call.name)));
        }
    }
    for token in &tokens {
        if let Token::Word(word) = token {
            if CLOCK_KEYWORDS.contains(&word.as_str()) {
                return Err(non_deterministic(word));
            }
        }
    }
    if found.iter().any(|call| TIME_FUNCTIONS.contains(&call.name)) {
        for token in &tokens {
            if let Token::Str(literal) = token {
                if CLOCK_MODIFIERS.contains(&literal.trim()) {
                    return Err(non_deterministic(&format!("'{literal}'")));
                }
            }
        }
    }
    Ok(())
}

/// Reject clock modifiers smuggled in as bound parameters of a write.
pub fn check_deterministic_params(statement: &SqlStatement) -> Result<(), DbError> {
    let tokens = tokenize(&statement.sql);
    if !calls(&tokens)
        .iter()
        .any(|call| TIME_FUNCTIONS.contains(&call.name))
    {
        return Ok(());
    }
    for param in &statement.params {
        if let Value::Text(text) = param {
            let text = text.trim().to_ascii_lowercase();
            if CLOCK_MODIFIERS.contains(&text.as_str()) {
                return Err(non_deterministic(&format!("parameter '{text}'")));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Engine {
        let engine = Engine::open(&["test"]).unwrap();
        engine
            .apply(&command(&["CREATE TABLE t (n INT)"]))
            .unwrap();
        engine
    }

    fn command(sqls: &[&str]) -> SqlCommand {
        SqlCommand {
            database: "test".to_string(),
            statements: sqls.iter().map(|s| SqlStatement::new(*s, vec![])).collect(),
        }
    }

    fn count(engine: &Engine) -> i64 {
        let result = engine
            .query("test", &[], &SqlStatement::new("SELECT count(*) FROM t", vec![]))
            .unwrap();
        match result.rows[0][0] {
            Value::Integer(n) => n,
            ref other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_apply_reports_rows_and_insert_id() {
        let engine = engine();
        let result = engine
            .apply(&command(&[
                "INSERT INTO t(n) VALUES(1)",
                "INSERT INTO t(n) VALUES(2)",
            ]))
            .unwrap();
        assert_eq!(result.rows_affected, 2);
        assert_eq!(result.last_insert_id, 2);
        assert_eq!(count(&engine), 2);
    }

    #[test]
    fn test_apply_is_atomic() {
        let engine = engine();
        let err = engine
            .apply(&command(&["INSERT INTO t(n) VALUES(1)", "INSERT INTO nope VALUES(1)"]))
            .unwrap_err();
        assert!(matches!(err, DbError::Engine { .. }));
        assert_eq!(count(&engine), 0);
    }

    #[test]
    fn test_unknown_database() {
        let engine = engine();
        let err = engine
            .query("other", &[], &SqlStatement::new("SELECT 1", vec![]))
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound { .. }));
    }

    #[test]
    fn test_describe_classifies() {
        let engine = engine();
        let read = engine.describe("test", &[], "SELECT * FROM t WHERE n = ?").unwrap();
        assert_eq!(read.kind, StatementKind::Read);
        assert_eq!(read.param_count, 1);
        assert_eq!(read.columns, vec!["n".to_string()]);

        let write = engine.describe("test", &[], "INSERT INTO t VALUES(?)").unwrap();
        assert_eq!(write.kind, StatementKind::Write);

        let begin = engine.describe("test", &[], "  -- comment\n begin").unwrap();
        assert_eq!(begin.kind, StatementKind::Begin);
        assert_eq!(
            engine.describe("test", &[], "END TRANSACTION").unwrap().kind,
            StatementKind::Commit
        );
        assert_eq!(
            engine.describe("test", &[], "ROLLBACK").unwrap().kind,
            StatementKind::Rollback
        );
        assert!(matches!(
            engine.describe("test", &[], "SAVEPOINT a"),
            Err(DbError::Unsupported { .. })
        ));
        assert!(matches!(
            engine.describe("test", &[], "ROLLBACK TO a"),
            Err(DbError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_describe_syntax_error() {
        let engine = engine();
        assert!(matches!(
            engine.describe("test", &[], "INSERT INTO"),
            Err(DbError::SyntaxError { .. })
        ));
    }

    #[test]
    fn test_describe_sees_preamble() {
        let engine = engine();
        let preamble = vec![SqlStatement::new("CREATE TABLE later (x INT)", vec![])];
        assert!(engine.describe("test", &[], "SELECT x FROM later").is_err());
        assert!(engine.describe("test", &preamble, "SELECT x FROM later").is_ok());
        // Preview left no trace.
        assert!(engine.describe("test", &[], "SELECT x FROM later").is_err());
    }

    #[test]
    fn test_rejects_non_deterministic_writes() {
        let engine = engine();
        assert!(matches!(
            engine.describe("test", &[], "INSERT INTO t VALUES(random())"),
            Err(DbError::Unsupported { .. })
        ));
        assert!(matches!(
            engine.describe("test", &[], "INSERT INTO t VALUES(strftime('%s', 'now'))"),
            Err(DbError::Unsupported { .. })
        ));
        // Reads may use them freely.
        assert!(engine.describe("test", &[], "SELECT random()").is_ok());
    }

    #[test]
    fn test_rejects_clock_and_connection_state() {
        let engine = engine();
        for sql in [
            "INSERT INTO t VALUES(julianday())",
            "INSERT INTO t VALUES(date())",
            "INSERT INTO t VALUES(time ( ))",
            "INSERT INTO t VALUES(datetime())",
            "INSERT INTO t VALUES(unixepoch())",
            "INSERT INTO t VALUES(strftime('%s'))",
            "INSERT INTO t VALUES(date('2024-01-01', 'localtime'))",
            "INSERT INTO t VALUES(last_insert_rowid())",
            "UPDATE t SET n = changes()",
            "INSERT INTO t VALUES(total_changes())",
            "INSERT INTO t SELECT CURRENT_TIMESTAMP",
            "INSERT INTO t VALUES(abs(random()) % 10)",
        ] {
            assert!(
                matches!(
                    engine.describe("test", &[], sql),
                    Err(DbError::Unsupported { .. })
                ),
                "{sql}"
            );
        }
    }

    #[test]
    fn test_accepts_fixed_times_and_lookalike_names() {
        let engine = engine();
        for sql in [
            "INSERT INTO t VALUES(julianday('2024-01-01'))",
            "INSERT INTO t VALUES(strftime('%Y', '2024-01-01'))",
            "INSERT INTO t VALUES(date(?))",
            "INSERT INTO t VALUES('now')",
            "INSERT INTO t VALUES(length('random()'))",
            "CREATE TABLE changes (date TEXT, \"time\" TEXT)",
        ] {
            assert!(engine.describe("test", &[], sql).is_ok(), "{sql}");
        }
    }

    #[test]
    fn test_rejects_clock_modifier_parameters() {
        let bound = |sql: &str, text: &str| {
            SqlStatement::new(sql, vec![Value::Text(text.to_string())])
        };
        assert!(matches!(
            check_deterministic_params(&bound("INSERT INTO t VALUES(date(?))", " NOW ")),
            Err(DbError::Unsupported { .. })
        ));
        assert!(check_deterministic_params(&bound("INSERT INTO t VALUES(date(?))", "2024-01-01")).is_ok());
        assert!(check_deterministic_params(&bound("INSERT INTO t VALUES(?)", "now")).is_ok());
    }

    /// Replicas applying the same accepted writes at different moments end
    /// up with identical content.
    #[test]
    fn test_accepted_time_writes_converge() {
        let sql = "INSERT INTO t VALUES(julianday('2024-01-01 12:00:00'))";
        check_deterministic(sql).unwrap();
        let a = engine();
        a.apply(&command(&[sql])).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let b = engine();
        b.apply(&command(&[sql])).unwrap();
        let read = SqlStatement::new("SELECT n FROM t", vec![]);
        assert_eq!(
            a.query("test", &[], &read).unwrap(),
            b.query("test", &[], &read).unwrap()
        );
    }

    #[test]
    fn test_insert_id_ignores_discarded_previews() {
        let engine = engine();
        engine
            .apply(&command(&["INSERT INTO t VALUES(1)"]))
            .unwrap();
        let preview = engine
            .preview(
                "test",
                &[SqlStatement::new("INSERT INTO t VALUES(2)", vec![])],
                &SqlStatement::new("INSERT INTO t VALUES(3)", vec![]),
            )
            .unwrap();
        assert_eq!(preview.last_insert_id, 3);

        let result = engine
            .apply(&command(&["UPDATE t SET n = n + 1"]))
            .unwrap();
        assert_eq!(result.rows_affected, 1);
        assert_eq!(result.last_insert_id, 1);

        // A non-inserting preview reports the committed id, not its own
        // rolled-back rows.
        let preview = engine
            .preview(
                "test",
                &[],
                &SqlStatement::new("DELETE FROM t", vec![]),
            )
            .unwrap();
        assert_eq!(preview.last_insert_id, 1);

        let result = engine
            .apply(&command(&["INSERT INTO t VALUES(4)"]))
            .unwrap();
        assert_eq!(result.last_insert_id, 2);
    }

    #[test]
    fn test_preview_rolls_back() {
        let engine = engine();
        let preamble = vec![SqlStatement::new("INSERT INTO t VALUES(1)", vec![])];
        let result = engine
            .preview(
                "test",
                &preamble,
                &SqlStatement::new("INSERT INTO t VALUES(?)", vec![Value::Integer(2)]),
            )
            .unwrap();
        assert_eq!(result.rows_affected, 1);
        assert_eq!(result.last_insert_id, 2);
        assert_eq!(count(&engine), 0);
    }

    #[test]
    fn test_query_values() {
        let engine = Engine::open(&["test"]).unwrap();
        engine
            .apply(&command(&["CREATE TABLE v (a, b, c, d, e)"]))
            .unwrap();
        engine
            .apply(&SqlCommand {
                database: "test".to_string(),
                statements: vec![SqlStatement::new(
                    "INSERT INTO v VALUES(?, ?, ?, ?, ?)",
                    vec![
                        Value::Null,
                        Value::Integer(7),
                        Value::Real(1.5),
                        Value::Text("hi".to_string()),
                        Value::Blob(vec![1, 2]),
                    ],
                )],
            })
            .unwrap();
        let result = engine
            .query("test", &[], &SqlStatement::new("SELECT * FROM v", vec![]))
            .unwrap();
        assert_eq!(result.columns, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(
            result.rows,
            vec![vec![
                Value::Null,
                Value::Integer(7),
                Value::Real(1.5),
                Value::Text("hi".to_string()),
                Value::Blob(vec![1, 2]),
            ]]
        );
    }

    #[test]
    fn test_query_row_limit() {
        let engine = engine();
        engine
            .apply(&command(&[
                "INSERT INTO t VALUES(1)",
                "INSERT INTO t VALUES(2)",
                "INSERT INTO t VALUES(3)",
            ]))
            .unwrap();
        let select = SqlStatement::new("SELECT n FROM t", vec![]);
        assert_eq!(engine.query_limited("test", &[], &select, 3).unwrap().rows.len(), 3);
        assert!(matches!(
            engine.query_limited("test", &[], &select, 2),
            Err(DbError::ResultTooLarge { limit: 2 })
        ));
        engine.run_read("test", &[], &select).unwrap();
    }

    #[test]
    fn test_value_json_shape() {
        let values = vec![Value::Null, Value::Integer(3), Value::Real(2.5), Value::Text("x".into())];
        let json = serde_json::to_string(&values).unwrap();
        assert_eq!(json, r#"[null,3,2.5,"x"]"#);
        let back: Vec<Value> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, values);
    }
}
