// ABOUTME: PostgreSQL implementation of the Database adapter
// ABOUTME: tokio-postgres over native-tls, with typed row decoding and transactional swaps

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, Row};

use super::{ColumnInfo, Database, DatabaseKind, ResultSet, SqlValue, Statement};
use crate::utils::{quote_ident, retry_with_backoff};

/// PostgreSQL has a limit of 65535 parameters per statement; leave some margin.
const PG_MAX_PARAMS: usize = 65_000;

/// Connect to PostgreSQL with TLS support.
///
/// The connection future is driven on a background task; errors on it are
/// logged, and surface to callers as failed queries.
pub async fn connect(url: &str) -> Result<Client> {
    let connector = native_tls::TlsConnector::builder()
        .build()
        .context("Failed to build TLS connector")?;
    let connector = postgres_native_tls::MakeTlsConnector::new(connector);

    let (client, connection) = tokio_postgres::connect(url, connector)
        .await
        .context("Failed to connect to PostgreSQL")?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection error: {}", e);
        }
    });

    Ok(client)
}

/// Connect with retry, for startup against databases that may still be booting.
pub async fn connect_with_retry(url: &str) -> Result<Client> {
    retry_with_backoff(|| connect(url), 3, Duration::from_secs(1)).await
}

/// PostgreSQL database adapter.
///
/// A single client is shared behind an async mutex so that a transaction
/// never interleaves with statements issued by other tasks.
pub struct PostgresDatabase {
    client: Mutex<Client>,
}

impl PostgresDatabase {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = connect_with_retry(url).await?;
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: Client) -> Self {
        Self {
            client: Mutex::new(client),
        }
    }
}

fn param_refs(params: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
}

fn is_text_type(data_type: &str) -> bool {
    matches!(
        data_type,
        "text" | "character varying" | "varchar" | "character" | "char" | "name"
    )
}

/// Decode one column of a row into a dialect-neutral value.
fn row_value(row: &Row, idx: usize, ty: &Type) -> Result<SqlValue> {
    let value = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.into(),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)?
            .map(|v| SqlValue::Integer(v.into()))
            .unwrap_or(SqlValue::Null),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)?
            .map(|v| SqlValue::Integer(v.into()))
            .unwrap_or(SqlValue::Null),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.into(),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)?
            .map(|v| SqlValue::Real(v.into()))
            .unwrap_or(SqlValue::Null),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)?
            .map(SqlValue::Real)
            .unwrap_or(SqlValue::Null),
        Type::NUMERIC => row
            .try_get::<_, Option<rust_decimal::Decimal>>(idx)?
            .map(|v| v.to_string())
            .into(),
        Type::TIMESTAMP => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)?
            .map(|v| v.to_string())
            .into(),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)?
            .map(|v| v.to_rfc3339())
            .into(),
        Type::DATE => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)?
            .map(|v| v.to_string())
            .into(),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map(|v| v.to_string())
            .into(),
        Type::UUID => row
            .try_get::<_, Option<uuid::Uuid>>(idx)?
            .map(|v| v.to_string())
            .into(),
        _ => {
            // For unknown types, try to get as string
            row.try_get::<_, Option<String>>(idx)
                .ok()
                .flatten()
                .into()
        }
    };
    Ok(value)
}

#[async_trait]
impl Database for PostgresDatabase {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Postgres
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn max_bind_parameters(&self) -> usize {
        PG_MAX_PARAMS
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let client = self.client.lock().await;
        client
            .execute(sql, &param_refs(params))
            .await
            .with_context(|| format!("Failed to execute: {}", sql))
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<ResultSet> {
        let client = self.client.lock().await;
        let stmt = client
            .prepare(sql)
            .await
            .with_context(|| format!("Failed to prepare query: {}", sql))?;
        let columns: Vec<String> = stmt.columns().iter().map(|c| c.name().to_string()).collect();
        let types: Vec<Type> = stmt.columns().iter().map(|c| c.type_().clone()).collect();

        let rows = client
            .query(&stmt, &param_refs(params))
            .await
            .with_context(|| format!("Failed to run query: {}", sql))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut values = Vec::with_capacity(types.len());
            for (idx, ty) in types.iter().enumerate() {
                values.push(row_value(row, idx, ty)?);
            }
            out.push(values);
        }

        Ok(ResultSet { columns, rows: out })
    }

    async fn transaction(&self, statements: &[Statement]) -> Result<()> {
        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .context("Failed to begin transaction")?;
        for statement in statements {
            tx.execute(statement.sql.as_str(), &param_refs(&statement.params))
                .await
                .with_context(|| format!("Failed to execute in transaction: {}", statement.sql))?;
        }
        tx.commit().await.context("Failed to commit transaction")?;
        Ok(())
    }

    async fn get_table_columns(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT column_name::text, data_type::text
                 FROM information_schema.columns
                 WHERE table_schema = current_schema() AND table_name = $1
                 ORDER BY ordinal_position",
                &[&table],
            )
            .await
            .with_context(|| format!("Failed to get columns for {}", table))?;

        Ok(rows
            .iter()
            .map(|row| ColumnInfo::new(row.get::<_, String>(0), row.get::<_, String>(1)))
            .collect())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT tablename::text FROM pg_tables WHERE schemaname = current_schema() ORDER BY tablename",
                &[],
            )
            .await
            .context("Failed to list tables")?;

        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn clone_table_structure(&self, source: &str, target: &str) -> Result<()> {
        let sql = format!(
            "CREATE TABLE {} (LIKE {} INCLUDING ALL)",
            quote_ident(target),
            quote_ident(source)
        );
        self.execute(&sql, &[]).await?;
        Ok(())
    }

    /// Sequences owned by the live table (`SERIAL` columns) move to the
    /// staging table first; dropping them with the live table would strip
    /// the defaults the staging table copied.
    fn swap_statements(&self, live: &str, staging: &str, _backup: &str) -> Vec<String> {
        vec![
            reassign_owned_sequences_sql(live, staging),
            format!("DROP TABLE {} CASCADE", quote_ident(live)),
            format!(
                "ALTER TABLE {} RENAME TO {}",
                quote_ident(staging),
                quote_ident(live)
            ),
        ]
    }

    /// Text parameters are cast to each column's declared type, so spreadsheet
    /// cells can land in typed columns.
    fn create_insert_sql(&self, table: &str, columns: &[ColumnInfo], row_count: usize) -> String {
        let quoted: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();

        let num_cols = columns.len();
        let value_rows: Vec<String> = (0..row_count)
            .map(|row_idx| {
                let placeholders: Vec<String> = columns
                    .iter()
                    .enumerate()
                    .map(|(col_idx, col)| {
                        let param = format!("${}", row_idx * num_cols + col_idx + 1);
                        if is_text_type(&col.data_type)
                            || col.data_type == "USER-DEFINED"
                            || col.data_type == "ARRAY"
                        {
                            param
                        } else {
                            format!("CAST({}::text AS {})", param, col.data_type)
                        }
                    })
                    .collect();
                format!("({})", placeholders.join(", "))
            })
            .collect();

        format!(
            "INSERT INTO {} ({}) VALUES {}",
            quote_ident(table),
            quoted.join(", "),
            value_rows.join(", ")
        )
    }
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Hand every sequence owned by a column of `from` to the same-named column
/// of `to`. Columns missing from `to` keep their sequence.
fn reassign_owned_sequences_sql(from: &str, to: &str) -> String {
    format!(
        "DO $$
DECLARE
    owned record;
BEGIN
    FOR owned IN
        SELECT d.objid::regclass::text AS seq, a.attname::text AS col
        FROM pg_depend d
        JOIN pg_class s ON s.oid = d.objid AND s.relkind = 'S'
        JOIN pg_attribute a ON a.attrelid = d.refobjid AND a.attnum = d.refobjsubid
        WHERE d.classid = 'pg_class'::regclass
          AND d.refclassid = 'pg_class'::regclass
          AND d.refobjid = {from}::regclass
          AND d.deptype = 'a'
          AND EXISTS (
              SELECT 1 FROM pg_attribute t
              WHERE t.attrelid = {to}::regclass
                AND t.attname = a.attname
                AND NOT t.attisdropped
          )
    LOOP
        EXECUTE format('ALTER SEQUENCE %s OWNED BY %I.%I', owned.seq, {to_name}, owned.col);
    END LOOP;
END
$$",
        from = quote_literal(&quote_ident(from)),
        to = quote_literal(&quote_ident(to)),
        to_name = quote_literal(to),
    )
}
