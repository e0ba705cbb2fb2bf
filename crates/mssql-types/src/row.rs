//! Rows and result sets.
//!
//! A [`ResultSet`] is the unit a transport hands back for one statement:
//! column metadata shared by every row, the decoded rows, and the server's
//! affected-row count when it reported one.

use std::fmt;
use std::sync::Arc;

use crate::error::TypeError;
use crate::from_sql::FromSql;
use crate::value::SqlValue;

/// Column metadata describing a result set column.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Column {
    /// Column name (may be empty for unnamed expressions).
    pub name: String,
    /// Column index (0-based).
    pub index: usize,
    /// SQL type name reported by the server, when known.
    pub type_name: Option<String>,
}

impl Column {
    /// Create column metadata.
    pub fn new(name: impl Into<String>, index: usize) -> Self {
        Self {
            name: name.into(),
            index,
            type_name: None,
        }
    }

    /// Attach the server-reported type name.
    #[must_use]
    pub fn with_type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }
}

/// Something that selects a column in a [`Row`]: a position or a name.
pub trait ColumnIndex {
    /// Resolve to a position in `row`.
    fn position(&self, row: &Row) -> Result<usize, TypeError>;
}

impl ColumnIndex for usize {
    fn position(&self, row: &Row) -> Result<usize, TypeError> {
        if *self < row.len() {
            Ok(*self)
        } else {
            Err(TypeError::IndexOutOfBounds {
                index: *self,
                len: row.len(),
            })
        }
    }
}

impl ColumnIndex for &str {
    fn position(&self, row: &Row) -> Result<usize, TypeError> {
        row.columns
            .iter()
            .position(|c| c.name == *self)
            .ok_or_else(|| TypeError::UnknownColumn((*self).to_owned()))
    }
}

/// One decoded row, accessible by position or by column name.
#[derive(Clone, PartialEq)]
pub struct Row {
    columns: Arc<[Column]>,
    values: Vec<SqlValue>,
}

impl Row {
    /// Build a row from shared column metadata and its values.
    ///
    /// Transports are expected to supply exactly one value per column.
    pub fn new(columns: Arc<[Column]>, values: Vec<SqlValue>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Column metadata.
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Borrow the raw value at `idx`.
    pub fn value(&self, idx: impl ColumnIndex) -> Result<&SqlValue, TypeError> {
        let pos = idx.position(self)?;
        Ok(&self.values[pos])
    }

    /// Read and convert the value at `idx`.
    pub fn get<T: FromSql>(&self, idx: impl ColumnIndex) -> Result<T, TypeError> {
        T::from_sql(self.value(idx)?)
    }

    /// Whether a column with this name exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    /// Column names in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Values in column order.
    #[must_use]
    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    /// `(name, value)` pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.keys().zip(self.values.iter())
    }

    /// Consume the row, returning its values.
    #[must_use]
    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in self.iter() {
            map.entry(&name, value);
        }
        map.finish()
    }
}

/// The decoded result of one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    columns: Arc<[Column]>,
    rows: Vec<Row>,
    rows_affected: Option<u64>,
}

impl ResultSet {
    /// Result of a statement that returned rows.
    pub fn new(columns: Vec<Column>, rows: Vec<Vec<SqlValue>>) -> Self {
        let columns: Arc<[Column]> = columns.into();
        let rows = rows
            .into_iter()
            .map(|values| Row::new(Arc::clone(&columns), values))
            .collect();
        Self {
            columns,
            rows,
            rows_affected: None,
        }
    }

    /// Result of a statement that only reported an affected-row count.
    #[must_use]
    pub fn affected(count: u64) -> Self {
        Self {
            rows_affected: Some(count),
            ..Self::default()
        }
    }

    /// Attach the affected-row count reported alongside the rows.
    #[must_use]
    pub fn with_rows_affected(mut self, count: u64) -> Self {
        self.rows_affected = Some(count);
        self
    }

    /// Column metadata.
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Decoded rows.
    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Affected-row count, if the server reported one.
    #[must_use]
    pub fn rows_affected(&self) -> Option<u64> {
        self.rows_affected
    }

    /// Consume the result, returning its rows.
    #[must_use]
    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}
