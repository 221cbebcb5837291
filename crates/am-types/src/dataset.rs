//! Column-oriented dataset abstraction shared by trainers, models and metrics.
//!
//! [`Dataset`] is the narrow interface the experiment core needs: column
//! lookup by name and row iteration. [`DataTable`] is the in-memory
//! implementation used by models to return scored data.

use serde::{Deserialize, Serialize};

use crate::errors::DataError;

/// A typed column of values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Column {
    Bool(Vec<bool>),
    Int(Vec<i64>),
    Float(Vec<f64>),
    Text(Vec<String>),
    /// Fixed-width vectors per row (e.g. per-class scores).
    Vector(Vec<Vec<f64>>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Self::Bool(v) => v.len(),
            Self::Int(v) => v.len(),
            Self::Float(v) => v.len(),
            Self::Text(v) => v.len(),
            Self::Vector(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Vector(_) => "vector",
        }
    }

    /// Value at `row`, or `None` when out of range.
    pub fn get(&self, row: usize) -> Option<Value<'_>> {
        match self {
            Self::Bool(v) => v.get(row).map(|b| Value::Bool(*b)),
            Self::Int(v) => v.get(row).map(|i| Value::Int(*i)),
            Self::Float(v) => v.get(row).map(|f| Value::Float(*f)),
            Self::Text(v) => v.get(row).map(|s| Value::Text(s.as_str())),
            Self::Vector(v) => v.get(row).map(|x| Value::Vector(x.as_slice())),
        }
    }

    /// Numeric view of the column. Only `Float` and `Int` columns qualify.
    pub fn to_f64(&self, name: &str) -> Result<Vec<f64>, DataError> {
        match self {
            Self::Float(v) => Ok(v.clone()),
            Self::Int(v) => Ok(v.iter().map(|i| *i as f64).collect()),
            other => Err(DataError::invalid(
                name,
                format!("expected a numeric column, found {}", other.type_name()),
            )),
        }
    }
}

/// A single cell borrowed from a [`Column`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value<'a> {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(&'a str),
    Vector(&'a [f64]),
}

impl Value<'_> {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }
}

/// Read access to tabular data.
pub trait Dataset: Send + Sync {
    /// Look up a column by name.
    fn column(&self, name: &str) -> Option<&Column>;

    /// Column names in declaration order.
    fn column_names(&self) -> Vec<&str>;

    /// Number of rows.
    fn row_count(&self) -> usize;

    fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Like [`Dataset::column`] but reports a missing column as an error.
    fn require(&self, name: &str) -> Result<&Column, DataError> {
        self.column(name).ok_or_else(|| DataError::MissingColumn {
            column: name.to_string(),
        })
    }
}

impl<'a> dyn Dataset + 'a {
    /// Iterate over rows; each [`Row`] resolves cells by column name.
    pub fn rows(&self) -> Rows<'_> {
        Rows {
            dataset: self,
            next: 0,
        }
    }
}

/// Iterator over the rows of a dataset.
pub struct Rows<'a> {
    dataset: &'a dyn Dataset,
    next: usize,
}

impl<'a> Iterator for Rows<'a> {
    type Item = Row<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.dataset.row_count() {
            return None;
        }
        let row = Row {
            dataset: self.dataset,
            index: self.next,
        };
        self.next += 1;
        Some(row)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.dataset.row_count().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

/// A row view into a dataset.
#[derive(Clone, Copy)]
pub struct Row<'a> {
    dataset: &'a dyn Dataset,
    index: usize,
}

impl<'a> Row<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn get(&self, column: &str) -> Option<Value<'a>> {
        self.dataset.column(column)?.get(self.index)
    }
}

/// In-memory dataset with named, equally sized columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataTable {
    columns: Vec<(String, Column)>,
}

impl DataTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`DataTable::insert`].
    pub fn with_column(
        mut self,
        name: impl Into<String>,
        column: Column,
    ) -> Result<Self, DataError> {
        self.insert(name, column)?;
        Ok(self)
    }

    /// Add a column, replacing any existing column with the same name.
    ///
    /// Every column must have the same length as the ones already present.
    pub fn insert(&mut self, name: impl Into<String>, column: Column) -> Result<(), DataError> {
        let name = name.into();
        let expected = self
            .columns
            .iter()
            .find(|(existing, _)| *existing != name)
            .map(|(_, c)| c.len());
        if let Some(expected) = expected {
            if column.len() != expected {
                return Err(DataError::LengthMismatch {
                    column: name,
                    expected,
                    actual: column.len(),
                });
            }
        }

        match self.columns.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = column,
            None => self.columns.push((name, column)),
        }
        Ok(())
    }

    /// Copy of this table with `column` appended, the usual shape of a model's
    /// scored output.
    pub fn scored(&self, name: impl Into<String>, column: Column) -> Result<Self, DataError> {
        self.clone().with_column(name, column)
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
}

impl Dataset for DataTable {
    fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, column)| column)
    }

    fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|(name, _)| name.as_str()).collect()
    }

    fn row_count(&self) -> usize {
        self.columns.first().map(|(_, c)| c.len()).unwrap_or(0)
    }
}
