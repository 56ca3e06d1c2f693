//! In-memory tabular event data.
//!
//! Datasets arrive as JSON arrays of objects or JSON Lines. Cells keep the
//! loose typing of the source so numeric and timestamp coercion can fail
//! per cell instead of per file.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

use crate::columns::{LogicalField, find_column};

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("failed to read dataset {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("dataset is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("dataset record {index} is not a JSON object")]
    NotAnObject { index: usize },
}

/// A single loosely typed value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Cell {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Cell::Null,
            Value::Bool(b) => Cell::Bool(*b),
            Value::Number(n) => n.as_f64().map(Cell::Number).unwrap_or(Cell::Null),
            Value::String(s) => Cell::Text(s.clone()),
            other => Cell::Text(other.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// Numeric coercion. Text that does not parse, and non-finite numbers,
    /// count as missing.
    pub fn as_f64(&self) -> Option<f64> {
        let value = match self {
            Cell::Number(n) => *n,
            Cell::Text(s) => s.trim().parse::<f64>().ok()?,
            Cell::Null | Cell::Bool(_) => return None,
        };
        value.is_finite().then_some(value)
    }

    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            Cell::Text(s) => parse_timestamp(s),
            _ => None,
        }
    }

    /// Stable string form used for grouping, distinct counts and filter
    /// comparison. Nulls have no key.
    pub fn key(&self) -> Option<String> {
        match self {
            Cell::Null => None,
            Cell::Bool(b) => Some(b.to_string()),
            Cell::Number(n) => Some(number_key(*n)),
            Cell::Text(s) => Some(s.clone()),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key() {
            Some(key) => f.write_str(&key),
            None => f.write_str("null"),
        }
    }
}

fn number_key(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

const NAIVE_TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Parse the timestamp shapes the datasets use. Offsets are normalized to
/// UTC and dropped; naive values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.naive_utc());
    }
    for format in NAIVE_TIMESTAMP_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(parsed);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Append a row, padding with nulls or truncating to the column count.
    pub fn push_row(&mut self, mut row: Vec<Cell>) {
        row.resize(self.columns.len(), Cell::Null);
        self.rows.push(row);
    }

    /// Build a table from JSON objects. Columns appear in first-seen order.
    pub fn from_records(records: &[Map<String, Value>]) -> Self {
        let mut columns: Vec<String> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        for record in records {
            for key in record.keys() {
                if seen.insert(key.as_str()) {
                    columns.push(key.clone());
                }
            }
        }

        let rows = records
            .iter()
            .map(|record| {
                columns
                    .iter()
                    .map(|column| record.get(column).map(Cell::from_json).unwrap_or(Cell::Null))
                    .collect()
            })
            .collect();

        Self { columns, rows }
    }

    /// Parse a JSON array of objects, or JSON Lines (one object per line).
    pub fn from_json_str(raw: &str) -> Result<Self, TableError> {
        let trimmed = raw.trim_start();
        let values: Vec<Value> = if trimmed.starts_with('[') {
            serde_json::from_str(trimmed)?
        } else {
            trimmed
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(serde_json::from_str)
                .collect::<Result<_, _>>()?
        };

        let records = values
            .into_iter()
            .enumerate()
            .map(|(index, value)| match value {
                Value::Object(map) => Ok(map),
                _ => Err(TableError::NotAnObject { index }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::from_records(&records))
    }

    pub fn load(path: &Path) -> Result<Self, TableError> {
        let raw = std::fs::read_to_string(path).map_err(|source| TableError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    pub fn find_column(&self, candidates: &[&str]) -> Option<&str> {
        find_column(&self.columns, candidates)
    }

    pub fn resolve(&self, field: LogicalField) -> Option<&str> {
        self.find_column(field.candidates())
    }

    pub fn cell(&self, row: usize, column: usize) -> &Cell {
        self.rows
            .get(row)
            .and_then(|cells| cells.get(column))
            .unwrap_or(&Cell::Null)
    }

    /// Cells of one column; empty when the column does not exist.
    pub fn values<'a>(&'a self, column: &str) -> impl Iterator<Item = &'a Cell> + 'a {
        let index = self.column_index(column);
        self.rows
            .iter()
            .filter_map(move |row| index.and_then(|i| row.get(i)))
    }

    pub fn numeric_values(&self, column: &str) -> Vec<f64> {
        self.values(column).filter_map(Cell::as_f64).collect()
    }

    pub fn distinct_count(&self, column: &str) -> usize {
        self.values(column)
            .filter_map(Cell::key)
            .collect::<HashSet<_>>()
            .len()
    }

    /// Row indices grouped by the key of `column`. Null keys are dropped.
    pub fn group_rows(&self, column: &str) -> BTreeMap<String, Vec<usize>> {
        let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        let Some(index) = self.column_index(column) else {
            return groups;
        };
        for (row_index, row) in self.rows.iter().enumerate() {
            if let Some(key) = row.get(index).and_then(Cell::key) {
                groups.entry(key).or_default().push(row_index);
            }
        }
        groups
    }

    /// Occurrence counts per key of `column`.
    pub fn value_counts(&self, column: &str) -> BTreeMap<String, usize> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for key in self.values(column).filter_map(Cell::key) {
            *counts.entry(key).or_default() += 1;
        }
        counts
    }

    pub fn filter_rows(&self, mut keep: impl FnMut(&[Cell]) -> bool) -> Table {
        Table {
            columns: self.columns.clone(),
            rows: self
                .rows
                .iter()
                .filter(|row| keep(row.as_slice()))
                .cloned()
                .collect(),
        }
    }
}

/// Scalar-or-list filter values, as clients send them.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    fn scalar(value: Value) -> Option<String> {
        match value {
            Value::Null => None,
            Value::String(s) => Some(s),
            Value::Number(n) => Some(match n.as_i64() {
                Some(i) => i.to_string(),
                None => n.as_f64().map(number_key).unwrap_or_else(|| n.to_string()),
            }),
            other => Some(other.to_string()),
        }
    }

    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items.into_iter().filter_map(scalar).collect(),
        other => scalar(other).into_iter().collect(),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TimeRange {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

/// Row filters for slicing a dataset. Each list filter keeps rows whose
/// value is any of the listed values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TableFilters {
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub case_id: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub team: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub resource: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
}

impl TableFilters {
    pub fn is_empty(&self) -> bool {
        self.case_id.is_empty()
            && self.team.is_empty()
            && self.resource.is_empty()
            && self.time_range.is_none()
    }

    pub fn team(team: impl Into<String>) -> Self {
        Self {
            team: vec![team.into()],
            ..Self::default()
        }
    }
}

fn retain_matching(table: Table, field: LogicalField, allowed: &[String]) -> Table {
    if allowed.is_empty() {
        return table;
    }
    let Some(index) = table.resolve(field).and_then(|c| table.column_index(c)) else {
        return table;
    };
    table.filter_rows(|row| {
        row.get(index)
            .and_then(Cell::key)
            .is_some_and(|key| allowed.contains(&key))
    })
}

/// Apply filters. Filters whose column cannot be resolved are ignored.
/// Time bounds drop rows whose start timestamp does not parse.
pub fn filter_table(table: &Table, filters: &TableFilters) -> Table {
    let mut filtered = table.clone();
    filtered = retain_matching(filtered, LogicalField::CaseId, &filters.case_id);
    filtered = retain_matching(filtered, LogicalField::Team, &filters.team);
    filtered = retain_matching(filtered, LogicalField::User, &filters.resource);

    if let Some(range) = &filters.time_range {
        let index = filtered
            .resolve(LogicalField::Start)
            .and_then(|c| filtered.column_index(c));
        if let Some(index) = index {
            let start = range.start.as_deref().and_then(parse_timestamp);
            let end = range.end.as_deref().and_then(parse_timestamp);
            if start.is_some() || end.is_some() {
                filtered = filtered.filter_rows(|row| {
                    let Some(ts) = row.get(index).and_then(Cell::as_timestamp) else {
                        return false;
                    };
                    start.is_none_or(|s| ts >= s) && end.is_none_or(|e| ts <= e)
                });
            }
        }
    }

    filtered
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Table {
        Table::from_json_str(
            &json!([
                {"case_id": "C1", "team": "Sales", "user": "ana", "start_time": "2025-10-01 09:00:00", "duration_seconds": 10},
                {"case_id": "C1", "team": "Sales", "user": "ben", "start_time": "2025-10-01T10:00:00Z", "duration_seconds": "20"},
                {"case_id": 7, "team": "Ops", "user": "ana", "start_time": "not a date", "duration_seconds": null},
            ])
            .to_string(),
        )
        .expect("sample parses")
    }

    #[test]
    fn loads_json_array_with_first_seen_column_order() {
        let table = sample();
        assert_eq!(table.len(), 3);
        assert_eq!(
            table.columns(),
            ["case_id", "team", "user", "start_time", "duration_seconds"]
        );
    }

    #[test]
    fn loads_json_lines() {
        let raw = "{\"a\": 1}\n\n{\"a\": 2, \"b\": \"x\"}\n";
        let table = Table::from_json_str(raw).expect("jsonl parses");
        assert_eq!(table.len(), 2);
        assert_eq!(table.columns(), ["a", "b"]);
        assert!(table.cell(0, 1).is_null());
    }

    #[test]
    fn rejects_non_object_records() {
        let err = Table::from_json_str("[1, 2]").expect_err("numbers are not records");
        assert!(matches!(err, TableError::NotAnObject { index: 0 }));
    }

    #[test]
    fn numeric_coercion_skips_unparseable_cells() {
        let table = sample();
        assert_eq!(table.numeric_values("duration_seconds"), vec![10.0, 20.0]);
        assert_eq!(Cell::Text("abc".into()).as_f64(), None);
        assert_eq!(Cell::Number(f64::NAN).as_f64(), None);
    }

    #[test]
    fn integer_numbers_key_without_fraction() {
        assert_eq!(Cell::Number(7.0).key().as_deref(), Some("7"));
        assert_eq!(Cell::Number(7.5).key().as_deref(), Some("7.5"));
        assert_eq!(Cell::Null.key(), None);
    }

    #[test]
    fn parses_supported_timestamp_shapes() {
        assert!(parse_timestamp("2025-10-01T10:00:00Z").is_some());
        assert!(parse_timestamp("2025-10-01T10:00:00+02:00").is_some());
        assert!(parse_timestamp("2025-10-01 10:00:00.250").is_some());
        assert!(parse_timestamp("2025-10-01T10:00:00").is_some());
        assert!(parse_timestamp("2025-10-01").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn offset_timestamps_normalize_to_utc() {
        let with_offset = parse_timestamp("2025-10-01T12:00:00+02:00");
        let utc = parse_timestamp("2025-10-01 10:00:00");
        assert_eq!(with_offset, utc);
    }

    #[test]
    fn filters_accept_scalar_or_list() {
        let filters: TableFilters =
            serde_json::from_value(json!({"team": "Sales", "case_id": ["C1", 7]})).expect("parses");
        assert_eq!(filters.team, vec!["Sales"]);
        assert_eq!(filters.case_id, vec!["C1", "7"]);
        assert!(filters.resource.is_empty());
    }

    #[test]
    fn filter_by_team_and_numeric_case_id() {
        let table = sample();
        let sales = filter_table(&table, &TableFilters::team("Sales"));
        assert_eq!(sales.len(), 2);

        let by_case = filter_table(
            &table,
            &TableFilters {
                case_id: vec!["7".into()],
                ..TableFilters::default()
            },
        );
        assert_eq!(by_case.len(), 1);
    }

    #[test]
    fn filter_by_resource_uses_user_column() {
        let table = sample();
        let filters = TableFilters {
            resource: vec!["ana".into()],
            ..TableFilters::default()
        };
        assert_eq!(filter_table(&table, &filters).len(), 2);
    }

    #[test]
    fn time_range_drops_unparseable_rows() {
        let table = sample();
        let filters = TableFilters {
            time_range: Some(TimeRange {
                start: Some("2025-10-01 09:30:00".into()),
                end: None,
            }),
            ..TableFilters::default()
        };
        let filtered = filter_table(&table, &filters);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.cell(0, 2), &Cell::Text("ben".into()));
    }

    #[test]
    fn unresolvable_filter_columns_are_ignored() {
        let table = Table::from_json_str(r#"[{"x": 1}, {"x": 2}]"#).expect("parses");
        assert_eq!(filter_table(&table, &TableFilters::team("Sales")).len(), 2);
    }

    #[test]
    fn group_rows_drops_null_keys() {
        let table = Table::from_json_str(r#"[{"k": "a"}, {"k": null}, {"k": "a"}, {"k": "b"}]"#)
            .expect("parses");
        let groups = table.group_rows("k");
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["a"], vec![0, 2]);
    }
}
