// ABOUTME: Content checksum over row count and sampled first/middle/last rows
// ABOUTME: Cheap proxy for "did the sheet change" used by change detection

use sha2::{Digest, Sha256};

use crate::source::Row;

/// Rows sampled from a sheet for the checksum.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleRows {
    pub first: Row,
    pub middle: Row,
    pub last: Row,
}

impl SampleRows {
    pub fn checksum(&self, row_count: u64) -> String {
        compute_checksum(row_count, &self.first, &self.middle, &self.last)
    }
}

/// Data-row indexes (0-based) of the first, middle and last sample.
pub fn sample_indexes(row_count: u64) -> Option<(u64, u64, u64)> {
    if row_count == 0 {
        return None;
    }
    Some((0, row_count / 2, row_count - 1))
}

fn hash_row(hasher: &mut Sha256, row: &Row) {
    hasher.update((row.len() as u64).to_le_bytes());
    for cell in row {
        match cell {
            None => hasher.update([0u8]),
            Some(value) => {
                hasher.update([1u8]);
                hasher.update((value.len() as u64).to_le_bytes());
                hasher.update(value.as_bytes());
            }
        }
    }
}

/// SHA-256 over `{row_count, first, middle, last}`, hex encoded.
///
/// Every row and cell is length-prefixed so that moving a value between
/// neighbouring cells or rows changes the digest.
pub fn compute_checksum(row_count: u64, first: &Row, middle: &Row, last: &Row) -> String {
    let mut hasher = Sha256::new();
    hasher.update(row_count.to_le_bytes());
    hash_row(&mut hasher, first);
    hash_row(&mut hasher, middle);
    hash_row(&mut hasher, last);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[&str]) -> Row {
        cells
            .iter()
            .map(|c| if c.is_empty() { None } else { Some(c.to_string()) })
            .collect()
    }

    #[test]
    fn test_checksum_is_stable() {
        let a = compute_checksum(3, &row(&["a", "1"]), &row(&["b", "2"]), &row(&["c", "3"]));
        let b = compute_checksum(3, &row(&["a", "1"]), &row(&["b", "2"]), &row(&["c", "3"]));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_checksum_sensitive_to_each_input() {
        let base = compute_checksum(3, &row(&["a"]), &row(&["b"]), &row(&["c"]));
        assert_ne!(base, compute_checksum(4, &row(&["a"]), &row(&["b"]), &row(&["c"])));
        assert_ne!(base, compute_checksum(3, &row(&["x"]), &row(&["b"]), &row(&["c"])));
        assert_ne!(base, compute_checksum(3, &row(&["a"]), &row(&["x"]), &row(&["c"])));
        assert_ne!(base, compute_checksum(3, &row(&["a"]), &row(&["b"]), &row(&["x"])));
    }

    #[test]
    fn test_checksum_distinguishes_cell_boundaries() {
        let joined = compute_checksum(1, &row(&["ab", ""]), &row(&[]), &row(&[]));
        let split = compute_checksum(1, &row(&["a", "b"]), &row(&[]), &row(&[]));
        assert_ne!(joined, split);
    }

    #[test]
    fn test_sample_indexes() {
        assert_eq!(sample_indexes(0), None);
        assert_eq!(sample_indexes(1), Some((0, 0, 0)));
        assert_eq!(sample_indexes(3), Some((0, 1, 2)));
        assert_eq!(sample_indexes(10), Some((0, 5, 9)));
    }
}
