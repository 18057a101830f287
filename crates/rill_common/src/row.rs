//! Row containers and the batch type flowing through push executors.

use crate::types::Value;

/// One ordered tuple of column values.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value(&self, col: usize) -> &Value {
        &self.values[col]
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// A growable collection of rows sharing one schema.
#[derive(Clone, Debug, Default)]
pub struct Rows {
    rows: Vec<Row>,
}

impl Rows {
    pub fn new() -> Self {
        Self { rows: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rows: Vec::with_capacity(capacity),
        }
    }

    pub fn append(&mut self, row: Row) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, idx: usize) -> &Row {
        &self.rows[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }
}

/// One logical mutation within a [`RowsBatch`].
///
/// `prev` is the row before the mutation, `curr` the row after; either index
/// may be absent (`NO_ROW`) for pure inserts and deletes. A delete may carry
/// only key columns in `curr == NO_ROW` form where the table executor
/// resolves the stored row.
#[derive(Clone, Copy, Debug)]
pub struct RowsEntry {
    prev_index: i32,
    curr_index: i32,
}

const NO_ROW: i32 = -1;

impl RowsEntry {
    pub fn new(prev_index: Option<usize>, curr_index: Option<usize>) -> Self {
        Self {
            prev_index: prev_index.map_or(NO_ROW, |i| i as i32),
            curr_index: curr_index.map_or(NO_ROW, |i| i as i32),
        }
    }
}

/// A batch of row mutations handed to a push executor.
#[derive(Clone, Debug)]
pub struct RowsBatch {
    rows: Rows,
    entries: Vec<RowsEntry>,
}

impl RowsBatch {
    pub fn new(rows: Rows, entries: Vec<RowsEntry>) -> Self {
        Self { rows, entries }
    }

    /// Batch where every row is a current row (pure inserts), as produced by
    /// fills and source ingest.
    pub fn from_current(rows: Rows) -> Self {
        let entries = (0..rows.len())
            .map(|i| RowsEntry::new(None, Some(i)))
            .collect();
        Self { rows, entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn previous_row(&self, entry: usize) -> Option<&Row> {
        let idx = self.entries[entry].prev_index;
        (idx != NO_ROW).then(|| self.rows.row(idx as usize))
    }

    pub fn current_row(&self, entry: usize) -> Option<&Row> {
        let idx = self.entries[entry].curr_index;
        (idx != NO_ROW).then(|| self.rows.row(idx as usize))
    }

    pub fn rows(&self) -> &Rows {
        &self.rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(v: i64) -> Row {
        Row::new(vec![Value::Int(v)])
    }

    #[test]
    fn batch_entry_indirection() {
        let mut rows = Rows::new();
        rows.append(row(1)); // prev of entry 0
        rows.append(row(2)); // curr of entry 0
        rows.append(row(3)); // curr of entry 1
        let entries = vec![
            RowsEntry::new(Some(0), Some(1)),
            RowsEntry::new(None, Some(2)),
            RowsEntry::new(Some(2), None),
        ];
        let batch = RowsBatch::new(rows, entries);

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.previous_row(0), Some(&row(1)));
        assert_eq!(batch.current_row(0), Some(&row(2)));
        assert_eq!(batch.previous_row(1), None);
        assert_eq!(batch.current_row(1), Some(&row(3)));
        assert_eq!(batch.current_row(2), None);
    }

    #[test]
    fn from_current_marks_all_inserts() {
        let mut rows = Rows::new();
        rows.append(row(7));
        rows.append(row(8));
        let batch = RowsBatch::from_current(rows);
        assert_eq!(batch.len(), 2);
        for i in 0..batch.len() {
            assert!(batch.previous_row(i).is_none());
            assert!(batch.current_row(i).is_some());
        }
    }
}
