// ABOUTME: Utility functions for identifier validation, quoting and retry logic
// ABOUTME: Shared by the database adapters, the sync engine and the scheduler

use anyhow::{bail, Result};
use std::time::Duration;

/// Maximum identifier length accepted for managed tables.
///
/// PostgreSQL truncates identifiers at 63 bytes; staging names add a prefix and
/// a timestamp, so live table names are kept well below that.
pub const MAX_TABLE_NAME_LEN: usize = 40;

/// Retry a function with exponential backoff
///
/// Executes an async operation with automatic retry on failure. Each retry doubles
/// the delay (exponential backoff) to handle transient failures gracefully.
///
/// # Arguments
///
/// * `operation` - Async function to retry (FnMut returning Future\<Output = Result\<T\>\>)
/// * `max_retries` - Maximum number of retry attempts (0 = no retries, just initial attempt)
/// * `initial_delay` - Delay before first retry (doubles each subsequent retry)
///
/// # Returns
///
/// Returns the successful result or the last error after all retries exhausted.
///
/// # Examples
///
/// ```no_run
/// # use anyhow::Result;
/// # use std::time::Duration;
/// # use sheet_sync::utils::retry_with_backoff;
/// # async fn example() -> Result<()> {
/// let result = retry_with_backoff(
///     || async { Ok("connected") },
///     3,
///     Duration::from_secs(1)
/// ).await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T>(
    mut operation: F,
    max_retries: u32,
    initial_delay: Duration,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = initial_delay;
    let mut last_error = None;

    for attempt in 0..=max_retries {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                last_error = Some(e);

                if attempt < max_retries {
                    tracing::warn!(
                        "Operation failed (attempt {}/{}), retrying in {:?}...",
                        attempt + 1,
                        max_retries + 1,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Operation failed after retries")))
}

/// Validate a table name used in dynamically built SQL
///
/// Table names are interpolated into DDL (quoted), so they are restricted to
/// `[A-Za-z_][A-Za-z0-9_]*` and [`MAX_TABLE_NAME_LEN`] characters.
///
/// # Examples
///
/// ```
/// # use sheet_sync::utils::validate_table_name;
/// assert!(validate_table_name("orders_2024").is_ok());
/// assert!(validate_table_name("2024_orders").is_err());
/// assert!(validate_table_name("orders; DROP TABLE x").is_err());
/// ```
pub fn validate_table_name(name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        bail!("Table name cannot be empty or whitespace-only");
    }

    if trimmed.len() != name.len() {
        bail!("Table name '{}' has leading or trailing whitespace", name);
    }

    if name.len() > MAX_TABLE_NAME_LEN {
        bail!(
            "Table name '{}' exceeds maximum length of {} characters",
            name,
            MAX_TABLE_NAME_LEN
        );
    }

    let mut chars = name.chars();
    if let Some(first) = chars.next() {
        if !first.is_ascii_alphabetic() && first != '_' {
            bail!(
                "Table name '{}' must start with a letter or underscore, not '{}'",
                name,
                first
            );
        }
    }

    for ch in chars {
        if !ch.is_ascii_alphanumeric() && ch != '_' {
            bail!(
                "Table name '{}' contains invalid character '{}'. Only letters, digits and underscores are allowed",
                name,
                ch
            );
        }
    }

    Ok(())
}

/// Quote an identifier (table, column) with double quotes
///
/// Both PostgreSQL and SQLite accept ANSI double-quoted identifiers. Embedded
/// quotes are doubled.
///
/// # Examples
///
/// ```
/// # use sheet_sync::utils::quote_ident;
/// assert_eq!(quote_ident("users"), "\"users\"");
/// assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
/// ```
pub fn quote_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('"');
    for ch in identifier.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Turn free-form header text into a column name
///
/// Lowercases, replaces every run of non-alphanumeric characters with a single
/// underscore and trims underscores from both ends. Names starting with a digit
/// get a `col_` prefix. Empty results map to `None`.
///
/// # Examples
///
/// ```
/// # use sheet_sync::utils::sanitize_column_name;
/// assert_eq!(sanitize_column_name("First Name"), Some("first_name".to_string()));
/// assert_eq!(sanitize_column_name("  Price ($)  "), Some("price".to_string()));
/// assert_eq!(sanitize_column_name("2024 total"), Some("col_2024_total".to_string()));
/// assert_eq!(sanitize_column_name("---"), None);
/// ```
pub fn sanitize_column_name(header: &str) -> Option<String> {
    let mut out = String::with_capacity(header.len());
    let mut pending_underscore = false;

    for ch in header.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_underscore && !out.is_empty() {
                out.push('_');
            }
            pending_underscore = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_underscore = true;
        }
    }

    if out.is_empty() {
        return None;
    }

    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert_str(0, "col_");
    }

    out.truncate(63);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_retry_with_backoff_success() {
        let mut attempts = 0;
        let result = retry_with_backoff(
            || {
                attempts += 1;
                async move {
                    if attempts < 3 {
                        anyhow::bail!("Temporary failure")
                    } else {
                        Ok("Success")
                    }
                }
            },
            5,
            Duration::from_millis(10),
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(result.unwrap(), "Success");
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_with_backoff_failure() {
        let mut attempts = 0;
        let result: Result<&str> = retry_with_backoff(
            || {
                attempts += 1;
                async move { anyhow::bail!("Permanent failure") }
            },
            2,
            Duration::from_millis(10),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts, 3); // Initial + 2 retries
    }

    #[test]
    fn test_validate_table_name_valid() {
        assert!(validate_table_name("orders").is_ok());
        assert!(validate_table_name("_private").is_ok());
        assert!(validate_table_name("Sheet1_data").is_ok());
    }

    #[test]
    fn test_validate_table_name_invalid() {
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("   ").is_err());
        assert!(validate_table_name(" orders").is_err());
        assert!(validate_table_name("my-table").is_err());
        assert!(validate_table_name("orders\"; DROP TABLE x; --").is_err());
        assert!(validate_table_name(&"a".repeat(MAX_TABLE_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_sanitize_column_name() {
        assert_eq!(sanitize_column_name("Email"), Some("email".to_string()));
        assert_eq!(
            sanitize_column_name("Order  ID #"),
            Some("order_id".to_string())
        );
        assert_eq!(
            sanitize_column_name("__already_clean__"),
            Some("already_clean".to_string())
        );
        assert_eq!(sanitize_column_name(""), None);
        assert_eq!(sanitize_column_name("9lives"), Some("col_9lives".to_string()));
    }
}
