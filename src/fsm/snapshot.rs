//! Snapshot serialization: deterministic dump and restore of the
//! embedded databases.
//!
//! A dump lists schema objects and table rows in a fixed order (tables by
//! name, rows by rowid), so two replicas that applied the same log prefix
//! produce identical dumps and identical checksums.

use std::collections::BTreeMap;

use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::engine::{open_connection, Value};
use crate::cluster::membership::Configuration;
use crate::errors::DbError;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Point-in-time copy of the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    /// Index of the last entry reflected in this snapshot.
    pub last_index: u64,
    /// Term of that entry.
    pub last_term: u64,
    /// Node table as of `last_index`.
    pub configuration: Configuration,
    pub databases: BTreeMap<String, DatabaseDump>,
}

/// Logical content of one database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseDump {
    pub tables: Vec<TableDump>,
    /// Indexes, views and triggers, recreated after the rows.
    pub objects: Vec<SchemaObject>,
}

/// One table with its rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDump {
    pub name: String,
    /// `CREATE` statement; `None` for tables SQLite maintains itself.
    pub sql: Option<String>,
    pub columns: Vec<String>,
    /// When set, the first value of every row is the rowid.
    pub with_rowid: bool,
    pub rows: Vec<Vec<Value>>,
}

/// A non-table schema object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaObject {
    pub kind: String,
    pub name: String,
    pub sql: String,
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn is_internal(name: &str) -> bool {
    name.starts_with("sqlite_")
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool, DbError> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, DbError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote(table)))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

/// Dump every table, index, view and trigger of `conn`.
pub fn dump_database(conn: &Connection) -> Result<DatabaseDump, DbError> {
    let mut stmt = conn.prepare(
        "SELECT type, name, sql FROM sqlite_master
         WHERE sql IS NOT NULL
         ORDER BY CASE type WHEN 'table' THEN 0 ELSE 1 END, name",
    )?;
    let entries = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut dump = DatabaseDump::default();
    for (kind, name, sql) in entries {
        if kind != "table" {
            dump.objects.push(SchemaObject { kind, name, sql });
            continue;
        }
        let columns = table_columns(conn, &name)?;
        let with_rowid = !sql.to_ascii_uppercase().contains("WITHOUT ROWID");
        let column_list = columns
            .iter()
            .map(|c| quote(c))
            .collect::<Vec<_>>()
            .join(", ");
        let query = if with_rowid {
            format!("SELECT rowid, {} FROM {} ORDER BY rowid", column_list, quote(&name))
        } else {
            format!("SELECT {} FROM {}", column_list, quote(&name))
        };
        let width = columns.len() + usize::from(with_rowid);
        let mut select = conn.prepare(&query)?;
        let mut rows_out = Vec::new();
        let mut rows = select.query([])?;
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(Value::from(row.get_ref(i)?));
            }
            rows_out.push(values);
        }
        dump.tables.push(TableDump {
            sql: if is_internal(&name) { None } else { Some(sql) },
            name,
            columns,
            with_rowid,
            rows: rows_out,
        });
    }
    Ok(dump)
}

/// Build a fresh connection holding exactly the content of `dump`.
pub fn restore_database(dump: &DatabaseDump) -> Result<Connection, DbError> {
    let conn = open_connection()?;
    conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
    let tx = conn.unchecked_transaction()?;

    for table in &dump.tables {
        if let Some(sql) = &table.sql {
            tx.execute_batch(sql)?;
        }
    }

    // Internal tables (sqlite_sequence) first: later inserts into
    // AUTOINCREMENT tables update their rows instead of creating them.
    let (internal, user): (Vec<&TableDump>, Vec<&TableDump>) =
        dump.tables.iter().partition(|t| t.sql.is_none());
    for table in internal.into_iter().chain(user) {
        if table.rows.is_empty() {
            continue;
        }
        if table.sql.is_none() && !table_exists(&tx, &table.name)? {
            // Statistics tables are only created by ANALYZE.
            continue;
        }
        let mut columns: Vec<String> = table.columns.iter().map(|c| quote(c)).collect();
        if table.with_rowid {
            columns.insert(0, "rowid".to_string());
        }
        let placeholders = vec!["?"; columns.len()].join(", ");
        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(&table.name),
            columns.join(", "),
            placeholders
        );
        let mut stmt = tx.prepare(&insert)?;
        for row in &table.rows {
            stmt.execute(params_from_iter(row.iter()))?;
        }
    }

    for object in &dump.objects {
        tx.execute_batch(&object.sql)?;
    }

    tx.commit()?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

/// Hex SHA-256 over the canonical JSON encoding of `databases`.
pub fn checksum(databases: &BTreeMap<String, DatabaseDump>) -> Result<String, DbError> {
    let bytes = serde_json::to_vec(databases).map_err(anyhow::Error::from)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}
