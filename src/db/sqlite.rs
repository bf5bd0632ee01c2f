// ABOUTME: SQLite implementation of the Database adapter
// ABOUTME: Runs rusqlite calls on the blocking pool behind a shared connection

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rusqlite::{params_from_iter, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::{ColumnInfo, Database, DatabaseKind, ResultSet, SqlValue, Statement};
use crate::utils::quote_ident;

/// SQLite's default SQLITE_MAX_VARIABLE_NUMBER is 32766 since 3.32.
const SQLITE_MAX_PARAMS: usize = 32_000;

/// SQLite database adapter.
///
/// rusqlite connections are not `Sync`, so the connection sits behind a mutex
/// and every call runs on tokio's blocking pool.
#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDatabase {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "wal")
            .context("Failed to enable WAL journal mode")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set SQLite busy timeout")?;
        Ok(Self::from_connection(conn))
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| anyhow!("SQLite connection mutex poisoned"))?;
            f(&mut guard)
        })
        .await
        .context("SQLite task panicked")?
    }
}

fn to_params(params: &[SqlValue]) -> Vec<rusqlite::types::Value> {
    params.iter().map(rusqlite::types::Value::from).collect()
}

fn run_query(conn: &Connection, sql: &str, params: &[rusqlite::types::Value]) -> Result<ResultSet> {
    let mut stmt = conn
        .prepare(sql)
        .with_context(|| format!("Failed to prepare query: {}", sql))?;
    let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let width = columns.len();

    let rows = stmt
        .query_map(params_from_iter(params.iter()), |row| {
            let mut values = Vec::with_capacity(width);
            for idx in 0..width {
                let value: rusqlite::types::Value = row.get(idx)?;
                values.push(SqlValue::from(value));
            }
            Ok(values)
        })
        .with_context(|| format!("Failed to run query: {}", sql))?
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to collect query rows")?;

    Ok(ResultSet { columns, rows })
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<(String, String, bool, Option<String>, i64)>> {
    let sql = format!("PRAGMA table_info({})", quote_ident(table));
    let mut stmt = conn
        .prepare(&sql)
        .with_context(|| format!("Failed to read columns of '{}'", table))?;
    let cols = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)? != 0,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })
        .with_context(|| format!("Failed to query columns of '{}'", table))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to collect columns of '{}'", table))?;
    Ok(cols)
}

#[async_trait]
impl Database for SqliteDatabase {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Sqlite
    }

    fn placeholder(&self, index: usize) -> String {
        format!("?{}", index)
    }

    fn max_bind_parameters(&self) -> usize {
        SQLITE_MAX_PARAMS
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let sql = sql.to_string();
        let params = to_params(params);
        self.with_conn(move |conn| {
            let affected = conn
                .execute(&sql, params_from_iter(params.iter()))
                .with_context(|| format!("Failed to execute: {}", sql))?;
            Ok(affected as u64)
        })
        .await
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<ResultSet> {
        let sql = sql.to_string();
        let params = to_params(params);
        self.with_conn(move |conn| run_query(conn, &sql, &params)).await
    }

    async fn transaction(&self, statements: &[Statement]) -> Result<()> {
        let statements: Vec<(String, Vec<rusqlite::types::Value>)> = statements
            .iter()
            .map(|s| (s.sql.clone(), to_params(&s.params)))
            .collect();

        self.with_conn(move |conn| {
            let tx = conn.transaction().context("Failed to begin transaction")?;
            for (sql, params) in &statements {
                tx.execute(sql, params_from_iter(params.iter()))
                    .with_context(|| format!("Failed to execute in transaction: {}", sql))?;
            }
            tx.commit().context("Failed to commit transaction")?;
            Ok(())
        })
        .await
    }

    async fn get_table_columns(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let table = table.to_string();
        self.with_conn(move |conn| {
            Ok(table_columns(conn, &table)?
                .into_iter()
                .map(|(name, ty, _, _, _)| ColumnInfo::new(name, ty))
                .collect())
        })
        .await
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let rs = run_query(
                conn,
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                &[],
            )?;
            Ok(rs
                .rows
                .into_iter()
                .filter_map(|mut r| match r.pop() {
                    Some(SqlValue::Text(name)) => Some(name),
                    _ => None,
                })
                .collect())
        })
        .await
    }

    async fn clone_table_structure(&self, source: &str, target: &str) -> Result<()> {
        let source = source.to_string();
        let target = target.to_string();
        self.with_conn(move |conn| {
            let cols = table_columns(conn, &source)?;
            if cols.is_empty() {
                anyhow::bail!("Cannot clone '{}': table does not exist", source);
            }

            let pk_count = cols.iter().filter(|c| c.4 > 0).count();
            let mut defs: Vec<String> = cols
                .iter()
                .map(|(name, ty, not_null, default, pk)| {
                    let mut def = format!("{} {}", quote_ident(name), ty);
                    if pk_count == 1 && *pk > 0 {
                        def.push_str(" PRIMARY KEY");
                    }
                    if *not_null {
                        def.push_str(" NOT NULL");
                    }
                    if let Some(default) = default {
                        def.push_str(&format!(" DEFAULT {}", default));
                    }
                    def
                })
                .collect();

            if pk_count > 1 {
                let mut pk_cols: Vec<&(String, String, bool, Option<String>, i64)> =
                    cols.iter().filter(|c| c.4 > 0).collect();
                pk_cols.sort_by_key(|c| c.4);
                let names: Vec<String> = pk_cols.iter().map(|c| quote_ident(&c.0)).collect();
                defs.push(format!("PRIMARY KEY ({})", names.join(", ")));
            }

            let sql = format!("CREATE TABLE {} ({})", quote_ident(&target), defs.join(", "));
            conn.execute(&sql, [])
                .with_context(|| format!("Failed to create '{}' like '{}'", target, source))?;
            Ok(())
        })
        .await
    }

    fn swap_statements(&self, live: &str, staging: &str, backup: &str) -> Vec<String> {
        vec![
            format!(
                "ALTER TABLE {} RENAME TO {}",
                quote_ident(live),
                quote_ident(backup)
            ),
            format!(
                "ALTER TABLE {} RENAME TO {}",
                quote_ident(staging),
                quote_ident(live)
            ),
            format!("DROP TABLE {}", quote_ident(backup)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn db_with_table() -> SqliteDatabase {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.execute(
            "CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT NOT NULL, age TEXT DEFAULT '0')",
            &[],
        )
        .await
        .unwrap();
        db
    }

    #[tokio::test]
    async fn test_execute_and_query() {
        let db = db_with_table().await;
        let affected = db
            .execute(
                "INSERT INTO people (name, age) VALUES (?1, ?2), (?3, ?4)",
                &["ann".into(), "30".into(), "bob".into(), SqlValue::Null],
            )
            .await
            .unwrap();
        assert_eq!(affected, 2);

        let rs = db
            .query("SELECT name, age FROM people ORDER BY id", &[])
            .await
            .unwrap();
        assert_eq!(rs.columns, vec!["name", "age"]);
        assert_eq!(rs.rows[0][0], SqlValue::Text("ann".into()));
        assert_eq!(rs.rows[1][1], SqlValue::Null);
        assert_eq!(db.count_rows("people").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_clone_table_structure_copies_columns_not_rows() {
        let db = db_with_table().await;
        db.execute("INSERT INTO people (name) VALUES ('x')", &[])
            .await
            .unwrap();

        db.clone_table_structure("people", "people_copy").await.unwrap();

        let cols = db.get_table_columns("people_copy").await.unwrap();
        let names: Vec<&str> = cols.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "name", "age"]);
        assert_eq!(db.count_rows("people_copy").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_error() {
        let db = db_with_table().await;
        let result = db
            .transaction(&[
                Statement::new("INSERT INTO people (name) VALUES ('kept?')"),
                Statement::new("INSERT INTO missing_table VALUES (1)"),
            ])
            .await;
        assert!(result.is_err());
        assert_eq!(db.count_rows("people").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_swap_statements_replace_live_table() {
        let db = db_with_table().await;
        db.execute("INSERT INTO people (name) VALUES ('old')", &[])
            .await
            .unwrap();
        db.clone_table_structure("people", "people_next").await.unwrap();
        db.execute("INSERT INTO people_next (name) VALUES ('new1'), ('new2')", &[])
            .await
            .unwrap();

        let statements: Vec<Statement> = db
            .swap_statements("people", "people_next", "people_old")
            .into_iter()
            .map(Statement::new)
            .collect();
        db.transaction(&statements).await.unwrap();

        assert_eq!(db.count_rows("people").await.unwrap(), 2);
        assert!(!db.table_exists("people_next").await.unwrap());
        assert!(!db.table_exists("people_old").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_tables_excludes_system_tables() {
        let db = db_with_table().await;
        let tables = db.list_tables().await.unwrap();
        assert_eq!(tables, vec!["people"]);
    }
}
