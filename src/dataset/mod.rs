// src/dataset/mod.rs

pub mod value;

pub use value::{ColumnKind, Value};

use value::int_fits_f64;

use anyhow::{bail, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// A named, homogeneously typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
}

/// An ordered set of columns plus rows of values aligned to them.
///
/// Every value is coerced to its column's kind, so two rows are equal exactly
/// when every column value matches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
}

/// Borrowed view of one row as an ordered column-name → value mapping.
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    columns: &'a [Column],
    values: &'a [Value],
}

impl<'a> Row<'a> {
    pub fn get(&self, name: &str) -> Option<&'a Value> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .map(|i| &self.values[i])
    }

    pub fn values(&self) -> &'a [Value] {
        self.values
    }
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a dataset from column names and rows, deriving each column's kind
    /// from its values and coercing the values to it.
    pub fn from_rows(names: Vec<String>, mut rows: Vec<Vec<Value>>) -> Result<Self> {
        let width = names.len();
        if let Some(bad) = rows.iter().position(|r| r.len() != width) {
            bail!(
                "row {} has {} values but there are {} columns",
                bad,
                rows[bad].len(),
                width
            );
        }

        let mut kinds = vec![ColumnKind::Null; width];
        for row in &rows {
            for (kind, value) in kinds.iter_mut().zip(row) {
                *kind = kind.widen(value.kind());
            }
        }
        settle_inexact_ints(&rows, &mut kinds);
        coerce_rows(&mut rows, &kinds);

        let columns = names
            .into_iter()
            .zip(kinds)
            .map(|(name, kind)| Column { name, kind })
            .collect();
        Ok(Self { columns, rows })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, idx: usize) -> Option<Row<'_>> {
        self.rows.get(idx).map(|values| Row {
            columns: &self.columns,
            values,
        })
    }

    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> + '_ {
        self.rows.iter().map(move |values| Row {
            columns: &self.columns,
            values,
        })
    }

    /// Concatenate `parts` in order over the union of their columns.
    ///
    /// Columns keep first-seen order, kinds are widened across parts, and a
    /// row missing a column gets `Null` there.
    pub fn concat(parts: Vec<Dataset>) -> Dataset {
        let mut columns: Vec<Column> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut mappings: Vec<Vec<usize>> = Vec::with_capacity(parts.len());

        for part in &parts {
            let mut mapping = Vec::with_capacity(part.columns.len());
            for col in &part.columns {
                let pos = match index.get(&col.name) {
                    Some(&pos) => {
                        columns[pos].kind = columns[pos].kind.widen(col.kind);
                        pos
                    }
                    None => {
                        index.insert(col.name.clone(), columns.len());
                        columns.push(col.clone());
                        columns.len() - 1
                    }
                };
                mapping.push(pos);
            }
            mappings.push(mapping);
        }

        let width = columns.len();
        let total: usize = parts.iter().map(|p| p.rows.len()).sum();
        let mut rows = Vec::with_capacity(total);
        for (part, mapping) in parts.into_iter().zip(mappings) {
            for values in part.rows {
                let mut out = vec![Value::Null; width];
                for (value, &pos) in values.into_iter().zip(&mapping) {
                    out[pos] = value;
                }
                rows.push(out);
            }
        }

        let mut kinds: Vec<ColumnKind> = columns.iter().map(|c| c.kind).collect();
        settle_inexact_ints(&rows, &mut kinds);
        for (col, &kind) in columns.iter_mut().zip(&kinds) {
            col.kind = kind;
        }
        coerce_rows(&mut rows, &kinds);
        Dataset { columns, rows }
    }

    /// Drop rows equal to an earlier row, keeping the first occurrence.
    /// Returns how many rows were removed.
    pub fn dedup(&mut self) -> usize {
        let before = self.rows.len();
        let keep: Vec<bool> = {
            let mut seen: HashSet<&[Value]> = HashSet::with_capacity(before);
            self.rows.iter().map(|r| seen.insert(r.as_slice())).collect()
        };
        let mut flags = keep.into_iter();
        self.rows.retain(|_| flags.next().unwrap_or(false));
        before - self.rows.len()
    }

    /// Row counts grouped by the value of `column`, in first-seen order.
    pub fn count_by(&self, column: &str) -> Vec<(Value, usize)> {
        let Some(idx) = self.column_index(column) else {
            return Vec::new();
        };
        let mut order: Vec<(Value, usize)> = Vec::new();
        let mut slots: HashMap<&Value, usize> = HashMap::new();
        for row in &self.rows {
            let value = &row[idx];
            match slots.get(value) {
                Some(&slot) => order[slot].1 += 1,
                None => {
                    slots.insert(value, order.len());
                    order.push((value.clone(), 1));
                }
            }
        }
        order
    }
}

// Int + Float widens to Float only if every int survives the conversion;
// otherwise distinct ints could collapse into one float.
fn settle_inexact_ints(rows: &[Vec<Value>], kinds: &mut [ColumnKind]) {
    for (idx, kind) in kinds.iter_mut().enumerate() {
        if *kind != ColumnKind::Float {
            continue;
        }
        let inexact = rows
            .iter()
            .any(|row| matches!(row[idx], Value::Int(i) if !int_fits_f64(i)));
        if inexact {
            *kind = ColumnKind::Text;
        }
    }
}

fn coerce_rows(rows: &mut [Vec<Value>], kinds: &[ColumnKind]) {
    for row in rows.iter_mut() {
        for (value, &kind) in row.iter_mut().zip(kinds) {
            if value.kind() != kind && !value.is_null() {
                let v = std::mem::replace(value, Value::Null);
                *value = v.coerce(kind);
            }
        }
    }
}
