// ABOUTME: Maps source columns onto destination table columns
// ABOUTME: Header-name matching with positional fallbacks to generic and free columns

use anyhow::{bail, Result};
use std::collections::HashSet;

use crate::db::{ColumnInfo, SqlValue};
use crate::source::Row;
use crate::utils::sanitize_column_name;

/// Columns managed by the database rather than the sheet. They never receive
/// positional data.
pub const SYSTEM_COLUMNS: &[&str] = &["id", "created_at", "updated_at", "_synced_at"];

pub fn is_system_column(name: &str) -> bool {
    SYSTEM_COLUMNS.contains(&name)
}

/// Name given to the destination column for source column `index` (0-based)
/// when the sheet has no usable header.
pub fn generic_column_name(index: usize) -> String {
    format!("col_{}", index + 1)
}

/// Which source column feeds which destination column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMapping {
    /// Destination columns, in table order
    columns: Vec<ColumnInfo>,
    /// Source column index for each destination column
    sources: Vec<usize>,
}

impl ColumnMapping {
    /// Build a mapping from an optional header row.
    ///
    /// For each source column index, in order: an exact match of the sanitised
    /// header text, then the generic `col_N` name for that position, then the
    /// next unused non-system column. A destination column is used at most once.
    /// Unlike a single pass in source column order, exact header matches are
    /// resolved for every column before any fallback runs. A header named
    /// later in the row therefore keeps its column even when an earlier
    /// column would have taken it as its positional fallback.
    pub fn build(header: Option<&Row>, destination: &[ColumnInfo]) -> Result<Self> {
        let width = match header {
            Some(h) if !h.is_empty() => h.len(),
            _ => destination
                .iter()
                .filter(|c| !is_system_column(&c.name))
                .count(),
        };

        let mut assigned: Vec<Option<usize>> = vec![None; width];
        let mut used: HashSet<usize> = HashSet::new();

        if let Some(header) = header {
            for (idx, cell) in header.iter().enumerate() {
                let Some(name) = cell.as_deref().and_then(sanitize_column_name) else {
                    continue;
                };
                if let Some(dest) = destination
                    .iter()
                    .position(|c| c.name == name)
                    .filter(|d| !used.contains(d))
                {
                    assigned[idx] = Some(dest);
                    used.insert(dest);
                }
            }
        }

        for (idx, slot) in assigned.iter_mut().enumerate() {
            if slot.is_some() {
                continue;
            }
            let generic = generic_column_name(idx);
            let dest = destination
                .iter()
                .position(|c| c.name == generic)
                .filter(|d| !used.contains(d))
                .or_else(|| {
                    (0..destination.len())
                        .find(|d| !used.contains(d) && !is_system_column(&destination[*d].name))
                });
            if let Some(dest) = dest {
                *slot = Some(dest);
                used.insert(dest);
            }
        }

        let mut pairs: Vec<(usize, usize)> = assigned
            .iter()
            .enumerate()
            .filter_map(|(src, dest)| dest.map(|d| (d, src)))
            .collect();
        pairs.sort_unstable();

        if pairs.is_empty() {
            bail!("No source column could be mapped to a destination column");
        }

        Ok(Self {
            columns: pairs.iter().map(|(d, _)| destination[*d].clone()).collect(),
            sources: pairs.iter().map(|(_, s)| *s).collect(),
        })
    }

    /// Source column `i` feeds the `i`-th non-system destination column.
    pub fn positional(destination: &[ColumnInfo]) -> Result<Self> {
        let columns: Vec<ColumnInfo> = destination
            .iter()
            .filter(|c| !is_system_column(&c.name))
            .cloned()
            .collect();
        if columns.is_empty() {
            bail!("Destination table has no data columns");
        }
        let sources = (0..columns.len()).collect();
        Ok(Self { columns, sources })
    }

    /// Source column `i` feeds destination column `i`, system names included.
    pub fn direct(destination: &[ColumnInfo]) -> Self {
        Self {
            columns: destination.to_vec(),
            sources: (0..destination.len()).collect(),
        }
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Bind values for one source row. Short rows are padded with nulls and
    /// cells past the mapped columns are dropped.
    pub fn values(&self, row: &Row) -> Vec<SqlValue> {
        self.sources
            .iter()
            .map(|&src| SqlValue::from(row.get(src).cloned().flatten()))
            .collect()
    }
}
