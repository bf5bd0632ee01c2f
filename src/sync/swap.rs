// ABOUTME: Table swapper - populate a staging table, then replace the live table atomically
// ABOUTME: Staging/backup names embed a creation timestamp so orphans can be swept by age

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::db::{Database, Statement};
use crate::model::from_millis;

pub const STAGING_PREFIX: &str = "_stg_";
pub const BACKUP_PREFIX: &str = "_bak_";

/// `_stg_<millis hex>_<random>_<live>`; the random part keeps two swaps of
/// the same table in the same millisecond apart.
pub fn staging_table_name(live: &str, now: DateTime<Utc>) -> String {
    let salt: u16 = rand::thread_rng().gen();
    format!(
        "{}{:x}_{:04x}_{}",
        STAGING_PREFIX,
        now.timestamp_millis(),
        salt,
        live
    )
}

pub fn backup_table_name(live: &str, now: DateTime<Utc>) -> String {
    format!("{}{:x}_{}", BACKUP_PREFIX, now.timestamp_millis(), live)
}

/// Creation time embedded in a staging or backup table name.
pub fn scratch_table_created_at(name: &str) -> Option<DateTime<Utc>> {
    let rest = name
        .strip_prefix(STAGING_PREFIX)
        .or_else(|| name.strip_prefix(BACKUP_PREFIX))?;
    let (millis, _) = rest.split_once('_')?;
    let millis = i64::from_str_radix(millis, 16).ok()?;
    from_millis(millis)
}

fn rename_sql(db: &dyn Database, from: &str, to: &str) -> String {
    format!(
        "ALTER TABLE {} RENAME TO {}",
        db.quote_identifier(from),
        db.quote_identifier(to)
    )
}

async fn discard_staging(db: &dyn Database, staging: &str) {
    if let Err(e) = db.drop_table_if_exists(staging).await {
        tracing::warn!(
            "Failed to drop staging table '{}': {:#}; the reaper will remove it",
            staging,
            e
        );
    }
}

/// Make `staging` the live table in one transaction.
///
/// When no live table exists yet, staging is renamed straight to the live name.
pub async fn promote(db: &dyn Database, live: &str, staging: &str) -> Result<()> {
    let statements: Vec<Statement> = if db.table_exists(live).await? {
        let backup = backup_table_name(live, Utc::now());
        db.swap_statements(live, staging, &backup)
            .into_iter()
            .map(Statement::new)
            .collect()
    } else {
        vec![Statement::new(rename_sql(db, staging, live))]
    };

    db.transaction(&statements)
        .await
        .with_context(|| format!("Failed to swap '{}' into '{}'", staging, live))?;
    tracing::debug!("Swapped '{}' into '{}'", staging, live);
    Ok(())
}

async fn populate_and_promote<F, Fut, T>(
    db: &dyn Database,
    live: &str,
    staging: String,
    populate: F,
) -> Result<T>
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let result = async {
        let value = populate(staging.clone()).await?;
        promote(db, live, &staging).await?;
        Ok(value)
    }
    .await;

    if result.is_err() {
        discard_staging(db, &staging).await;
    }
    result
}

/// Replace the contents of `live` with whatever `populate` writes into a
/// staging copy of its structure.
///
/// On any failure the live table is untouched and the staging table is dropped.
pub async fn swap<F, Fut, T>(db: &dyn Database, live: &str, populate: F) -> Result<T>
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let staging = staging_table_name(live, Utc::now());
    if let Err(e) = db.clone_table_structure(live, &staging).await {
        discard_staging(db, &staging).await;
        return Err(e).with_context(|| format!("Failed to create staging table for '{}'", live));
    }
    populate_and_promote(db, live, staging, populate).await
}

/// Create-or-replace `live` as a table of TEXT `columns` filled by `populate`.
pub async fn swap_new_table<F, Fut, T>(
    db: &dyn Database,
    live: &str,
    columns: &[String],
    populate: F,
) -> Result<T>
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let staging = staging_table_name(live, Utc::now());
    let ddl = db.create_text_table_sql(&staging, columns);
    db.execute(&ddl, &[])
        .await
        .with_context(|| format!("Failed to create staging table for '{}'", live))?;
    populate_and_promote(db, live, staging, populate).await
}

/// Drop staging and backup tables created more than `max_age` before `now`.
///
/// Returns the names of the dropped tables.
pub async fn drop_stale_staging_tables(
    db: &dyn Database,
    max_age: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let max_age = chrono::Duration::from_std(max_age).context("Staging max age out of range")?;
    let cutoff = now - max_age;

    let mut dropped = Vec::new();
    for table in db.list_tables().await? {
        let Some(created) = scratch_table_created_at(&table) else {
            continue;
        };
        if created >= cutoff {
            continue;
        }
        db.drop_table_if_exists(&table)
            .await
            .with_context(|| format!("Failed to drop stale staging table '{}'", table))?;
        tracing::info!("Dropped orphaned staging table '{}'", table);
        dropped.push(table);
    }
    Ok(dropped)
}
