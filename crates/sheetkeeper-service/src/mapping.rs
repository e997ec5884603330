//! Conversions between raw grids and the typed rows handed out by a [`Sheet`](crate::Sheet).
//!
//! Everything in here is a pure function of its inputs.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Rows of cell strings as returned by the remote source.
///
/// Trailing empty cells and rows are never materialized, so rows may have different lengths.
pub type Grid = Vec<Vec<String>>;

/// A single data row keyed by column name.
pub type RowObject = BTreeMap<String, String>;

/// A single cell that is sent to the remote source on append.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    /// Leaves the target cell untouched.
    Null,
    Text(String),
    Number(f64),
    Bool(bool),
    /// Sent as text formatted with the configured date format.
    Date(NaiveDateTime),
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_owned())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        CellValue::Text(value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Number(value)
    }
}

/// Integers beyond the exactly representable range of `f64` are sent as text.
impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        const MAX_EXACT: u64 = 1 << f64::MANTISSA_DIGITS;
        if value.unsigned_abs() <= MAX_EXACT {
            CellValue::Number(value as f64)
        } else {
            CellValue::Text(value.to_string())
        }
    }
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        CellValue::Bool(value)
    }
}

impl From<NaiveDateTime> for CellValue {
    fn from(value: NaiveDateTime) -> Self {
        CellValue::Date(value)
    }
}

impl From<serde_json::Value> for CellValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => CellValue::Null,
            Value::Bool(b) => CellValue::Bool(b),
            Value::Number(n) => match n.as_f64() {
                Some(n) => CellValue::Number(n),
                None => CellValue::Text(n.to_string()),
            },
            Value::String(s) => CellValue::Text(s),
            nested => CellValue::Text(nested.to_string()),
        }
    }
}

/// The input of an append.
#[derive(Debug, Clone, PartialEq)]
pub enum NewRow {
    /// Cells already ordered like the sheet's columns.
    Positional(Vec<CellValue>),
    /// Cells keyed by column name, matched case-insensitively.
    Keyed(BTreeMap<String, CellValue>),
}

impl NewRow {
    /// Builds a keyed row from `(column, value)` pairs.
    pub fn keyed<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<CellValue>,
    {
        NewRow::Keyed(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Builds a positional row from cell values.
    pub fn positional<V: Into<CellValue>>(cells: impl IntoIterator<Item = V>) -> Self {
        NewRow::Positional(cells.into_iter().map(Into::into).collect())
    }
}

/// Collapses whitespace runs into a single space and trims both ends.
pub fn sanitize(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// How header cells are turned into field names.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyCase {
    /// Use the sanitized header as is.
    #[default]
    Identity,
    /// `First Name` becomes `first name`.
    Lowercase,
    /// `First Name` becomes `first_name`.
    SnakeCase,
    /// `First Name` becomes `firstName`.
    CamelCase,
}

impl KeyCase {
    pub fn apply(self, header: &str) -> String {
        match self {
            KeyCase::Identity => header.to_owned(),
            KeyCase::Lowercase => header.to_lowercase(),
            KeyCase::SnakeCase => words(header)
                .map(|word| word.to_lowercase())
                .collect::<Vec<_>>()
                .join("_"),
            KeyCase::CamelCase => {
                let mut key = String::with_capacity(header.len());
                for (i, word) in words(header).enumerate() {
                    let word = word.to_lowercase();
                    if i == 0 {
                        key.push_str(&word);
                        continue;
                    }
                    let mut chars = word.chars();
                    if let Some(first) = chars.next() {
                        key.extend(first.to_uppercase());
                        key.push_str(chars.as_str());
                    }
                }
                key
            }
        }
    }
}

fn words(header: &str) -> impl Iterator<Item = &str> {
    header
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
}

/// Extracts column names from the 1-based `header_rows`-th row of `grid`.
///
/// Cells are sanitized and then key-transformed. Empty names are kept so that positions line
/// up with data cells.
pub fn header_names(
    grid: &Grid,
    header_rows: usize,
    sanitize: &dyn Fn(&str) -> String,
    key_transform: &dyn Fn(&str) -> String,
) -> Result<Vec<String>> {
    let header = header_rows
        .checked_sub(1)
        .ok_or(Error::NoHeaderRow)
        .map(|index| grid.get(index))?;

    let names: Vec<String> = header
        .into_iter()
        .flatten()
        .map(|cell| {
            let cell = sanitize(cell.as_str());
            if cell.is_empty() {
                cell
            } else {
                key_transform(cell.as_str())
            }
        })
        .collect();

    if names.iter().all(|name| name.is_empty()) {
        return Err(Error::HeaderEmpty);
    }
    Ok(names)
}

/// Returns all rows below the header, sanitized, that pass `filter`.
pub fn data_rows(
    grid: &Grid,
    header_rows: usize,
    sanitize: &dyn Fn(&str) -> String,
    filter: &dyn Fn(&[String]) -> bool,
) -> Vec<Vec<String>> {
    grid.iter()
        .skip(header_rows)
        .map(|row| {
            row.iter()
                .map(|cell| sanitize(cell.as_str()))
                .collect::<Vec<_>>()
        })
        .filter(|row| filter(row.as_slice()))
        .collect()
}

/// Pairs the cells of `row` with `columns` by position.
///
/// Cells without a column name are dropped. Columns past the end of a short row are absent.
pub fn zip_object(row: &[String], columns: &[String]) -> RowObject {
    row.iter()
        .zip(columns)
        .filter(|(_, name)| !name.is_empty())
        .map(|(cell, name)| (name.clone(), cell.clone()))
        .collect()
}

/// Orders keyed cell values like `columns`.
///
/// Keys and column names are compared lower-cased. Every column matching a key receives its
/// value, columns without a matching key become empty text cells. Fails if not a single key
/// matches a column.
pub fn keyed_to_positional(
    columns: &[String],
    values: BTreeMap<String, CellValue>,
) -> Result<Vec<CellValue>> {
    let values: BTreeMap<String, CellValue> = values
        .into_iter()
        .map(|(key, value)| (key.to_lowercase(), value))
        .collect();

    let mut matched = BTreeSet::new();
    let mut row = Vec::with_capacity(columns.len());
    for column in columns {
        let key = column.to_lowercase();
        match values.get(&key) {
            Some(value) if !column.is_empty() => {
                row.push(value.clone());
                matched.insert(key);
            }
            _ => row.push(CellValue::Text(String::new())),
        }
    }

    if matched.is_empty() {
        return Err(Error::AppendRejected(
            "no key matches a column of the sheet".into(),
        ));
    }
    if matched.len() < values.len() {
        tracing::debug!(
            unmatched = ?values.keys().filter(|key| !matched.contains(*key)).collect::<Vec<_>>(),
            "ignoring keys without a matching column"
        );
    }
    Ok(row)
}

/// Prepares a cell for transmission.
///
/// Dates are formatted with `date_format`, then text is sanitized. Everything else passes
/// through unchanged. Fails if `date_format` is not a valid `strftime` format.
pub fn prepare_cell(
    cell: CellValue,
    sanitize: &dyn Fn(&str) -> String,
    date_format: &str,
) -> Result<CellValue> {
    Ok(match cell {
        CellValue::Text(text) => CellValue::Text(sanitize(&text)),
        CellValue::Date(date) => {
            let mut formatted = String::new();
            write!(formatted, "{}", date.format(date_format)).map_err(|_| {
                Error::AppendRejected(format!("invalid date format `{date_format}`"))
            })?;
            CellValue::Text(sanitize(&formatted))
        }
        other => other,
    })
}
