use std::{fs, io, path::Path};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use thiserror::Error;

use super::policy;

pub(crate) const TABULAR_EXTENSIONS: &[&str] = &["csv", "xlsx", "xls"];
pub(crate) const IMAGE_EXTENSIONS: &[&str] =
    &["png", "jpg", "jpeg", "gif", "bmp", "ico", "webp"];

pub(crate) const DEFAULT_PAGE_LIMIT: usize = 500;

#[derive(Debug, Error)]
pub(crate) enum PreviewError {
    #[error("failed to read file: {0}")]
    Io(#[from] io::Error),
    #[error("file is not a tabular format")]
    NotTabular,
    #[error("preview not supported for .{0} files")]
    Unsupported(String),
    #[error("malformed tabular data: {0}")]
    Malformed(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
}

pub(crate) fn is_tabular_extension(extension: &str) -> bool {
    TABULAR_EXTENSIONS.contains(&extension)
}

pub(crate) fn is_image_extension(extension: &str) -> bool {
    IMAGE_EXTENSIONS.contains(&extension)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ColumnInfo {
    pub(crate) name: String,
    pub(crate) dtype: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DataframePayload {
    #[serde(rename = "type")]
    pub(crate) kind: &'static str,
    pub(crate) columns: Vec<String>,
    pub(crate) column_info: Vec<ColumnInfo>,
    pub(crate) data: Vec<Map<String, Value>>,
    pub(crate) total_rows: usize,
    pub(crate) offset: usize,
    pub(crate) limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QueryFilter {
    pub(crate) column: String,
    #[serde(default = "default_filter_op")]
    pub(crate) op: String,
    pub(crate) value: String,
}

fn default_filter_op() -> String {
    "contains".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QuerySort {
    pub(crate) column: String,
    #[serde(default = "default_sort_direction")]
    pub(crate) direction: String,
}

fn default_sort_direction() -> String {
    "asc".to_string()
}

#[derive(Debug, Clone)]
pub(crate) struct Dataframe {
    pub(crate) columns: Vec<String>,
    pub(crate) rows: Vec<Vec<String>>,
}

impl Dataframe {
    pub(crate) fn parse_csv(text: &str) -> Result<Self, PreviewError> {
        let mut records = parse_csv_records(text)?;
        if records.is_empty() {
            return Ok(Self {
                columns: Vec::new(),
                rows: Vec::new(),
            });
        }

        let columns = records.remove(0);
        let width = columns.len();
        for row in &mut records {
            row.resize(width, String::new());
        }

        Ok(Self {
            columns,
            rows: records,
        })
    }

    pub(crate) fn column_types(&self) -> Vec<&'static str> {
        (0..self.columns.len())
            .map(|index| infer_column_type(self.rows.iter().map(|row| row[index].as_str())))
            .collect()
    }

    fn column_index(&self, name: &str) -> Result<usize, PreviewError> {
        self.columns
            .iter()
            .position(|column| column == name)
            .ok_or_else(|| PreviewError::UnknownColumn(name.to_string()))
    }
}

fn parse_csv_records(text: &str) -> Result<Vec<Vec<String>>, PreviewError> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();
    let mut saw_any = false;

    while let Some(ch) = chars.next() {
        saw_any = true;
        if in_quotes {
            match ch {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => field.push(ch),
            }
            continue;
        }

        match ch {
            '"' => {
                if field.is_empty() {
                    in_quotes = true;
                } else {
                    field.push('"');
                }
            }
            ',' => {
                record.push(std::mem::take(&mut field));
            }
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                if !(record.len() == 1 && record[0].is_empty()) {
                    records.push(std::mem::take(&mut record));
                } else {
                    record.clear();
                }
            }
            _ => field.push(ch),
        }
    }

    if in_quotes {
        return Err(PreviewError::Malformed("unterminated quoted field".into()));
    }

    if saw_any && (!field.is_empty() || !record.is_empty()) {
        record.push(field);
        records.push(record);
    }

    Ok(records)
}

fn infer_column_type<'a>(values: impl Iterator<Item = &'a str>) -> &'static str {
    let mut saw_value = false;
    let mut all_integer = true;
    let mut all_float = true;
    let mut all_boolean = true;

    for value in values {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            continue;
        }
        saw_value = true;

        if trimmed.parse::<i64>().is_err() {
            all_integer = false;
        }
        if trimmed.parse::<f64>().is_err() {
            all_float = false;
        }
        if !matches!(
            trimmed.to_ascii_lowercase().as_str(),
            "true" | "false"
        ) {
            all_boolean = false;
        }
    }

    if !saw_value {
        return "text";
    }
    if all_boolean {
        return "boolean";
    }
    if all_integer {
        return "integer";
    }
    if all_float {
        return "float";
    }
    "text"
}

fn typed_cell(raw: &str, dtype: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::String(String::new());
    }

    match dtype {
        "integer" => trimmed
            .parse::<i64>()
            .map(|number| Value::Number(number.into()))
            .unwrap_or_else(|_| Value::String(raw.to_string())),
        "float" => trimmed
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(raw.to_string())),
        "boolean" => Value::Bool(trimmed.eq_ignore_ascii_case("true")),
        _ => Value::String(raw.to_string()),
    }
}

fn load_frame(path: &Path) -> Result<Dataframe, PreviewError> {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let extension = policy::extension_of(&name).ok_or(PreviewError::NotTabular)?;

    match extension.as_str() {
        "csv" => {
            let text = fs::read_to_string(path)?;
            Dataframe::parse_csv(&text)
        }
        other if is_tabular_extension(other) => Err(PreviewError::Unsupported(other.to_string())),
        _ => Err(PreviewError::NotTabular),
    }
}

fn build_payload(
    frame: &Dataframe,
    row_indices: &[usize],
    offset: usize,
    limit: usize,
) -> DataframePayload {
    let dtypes = frame.column_types();
    let column_info = frame
        .columns
        .iter()
        .zip(dtypes.iter())
        .map(|(name, dtype)| ColumnInfo {
            name: name.clone(),
            dtype: (*dtype).to_string(),
        })
        .collect();

    let page: Vec<Map<String, Value>> = row_indices
        .iter()
        .skip(offset)
        .take(limit)
        .map(|&row_index| {
            let mut record = Map::new();
            for (column_index, column) in frame.columns.iter().enumerate() {
                record.insert(
                    column.clone(),
                    typed_cell(&frame.rows[row_index][column_index], dtypes[column_index]),
                );
            }
            record
        })
        .collect();

    DataframePayload {
        kind: "dataframe",
        columns: frame.columns.clone(),
        column_info,
        data: page,
        total_rows: row_indices.len(),
        offset,
        limit,
    }
}

pub(crate) fn load_dataframe(
    path: &Path,
    offset: usize,
    limit: usize,
) -> Result<DataframePayload, PreviewError> {
    let frame = load_frame(path)?;
    let all: Vec<usize> = (0..frame.rows.len()).collect();
    Ok(build_payload(&frame, &all, offset, limit))
}

pub(crate) fn query_dataframe(
    path: &Path,
    filters: &[QueryFilter],
    sort: Option<&QuerySort>,
    offset: usize,
    limit: usize,
) -> Result<DataframePayload, PreviewError> {
    let frame = load_frame(path)?;
    let dtypes = frame.column_types();

    let mut selected: Vec<usize> = (0..frame.rows.len()).collect();
    for filter in filters {
        let column = frame.column_index(&filter.column)?;
        selected.retain(|&row| matches_filter(&frame.rows[row][column], filter));
    }

    if let Some(sort) = sort {
        let column = frame.column_index(&sort.column)?;
        let numeric = matches!(dtypes[column], "integer" | "float");
        selected.sort_by(|&a, &b| {
            let left = frame.rows[a][column].trim();
            let right = frame.rows[b][column].trim();
            if numeric {
                let left = left.parse::<f64>().unwrap_or(f64::NAN);
                let right = right.parse::<f64>().unwrap_or(f64::NAN);
                left.partial_cmp(&right).unwrap_or(std::cmp::Ordering::Equal)
            } else {
                left.to_lowercase().cmp(&right.to_lowercase())
            }
        });
        if sort.direction.eq_ignore_ascii_case("desc") {
            selected.reverse();
        }
    }

    Ok(build_payload(&frame, &selected, offset, limit))
}

fn matches_filter(cell: &str, filter: &QueryFilter) -> bool {
    let cell = cell.trim();
    let value = filter.value.trim();

    match filter.op.as_str() {
        "equals" => cell == value,
        "gt" => compare_numeric(cell, value).is_some_and(|ordering| ordering.is_gt()),
        "lt" => compare_numeric(cell, value).is_some_and(|ordering| ordering.is_lt()),
        _ => cell.to_lowercase().contains(&value.to_lowercase()),
    }
}

fn compare_numeric(cell: &str, value: &str) -> Option<std::cmp::Ordering> {
    let cell = cell.parse::<f64>().ok()?;
    let value = value.parse::<f64>().ok()?;
    cell.partial_cmp(&value)
}

#[derive(Debug, Clone)]
pub(crate) struct CsvSummary {
    pub(crate) row_count: usize,
    pub(crate) columns: Vec<(String, String)>,
}

/// Row count and typed column listing for metadata summaries.
pub(crate) fn csv_file_summary(path: &Path) -> Result<CsvSummary, PreviewError> {
    let text = fs::read_to_string(path)?;
    let frame = Dataframe::parse_csv(&text)?;
    let dtypes = frame.column_types();

    Ok(CsvSummary {
        row_count: frame.rows.len(),
        columns: frame
            .columns
            .iter()
            .zip(dtypes.iter())
            .map(|(name, dtype)| (name.clone(), (*dtype).to_string()))
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = "name,age,score,active\nalice,30,91.5,true\nbob,25,88.0,false\n\"smith, carol\",41,77.25,true\n";

    fn sample_file(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("people.csv");
        fs::write(&path, SAMPLE).expect("write sample csv");
        path
    }

    #[test]
    fn csv_parsing_handles_quotes_and_embedded_commas() {
        let frame = Dataframe::parse_csv(SAMPLE).expect("parse csv");
        assert_eq!(frame.columns, vec!["name", "age", "score", "active"]);
        assert_eq!(frame.rows.len(), 3);
        assert_eq!(frame.rows[2][0], "smith, carol");
    }

    #[test]
    fn csv_parsing_handles_escaped_quotes_and_newlines_in_fields() {
        let text = "a,b\n\"say \"\"hi\"\"\",\"line1\nline2\"\n";
        let frame = Dataframe::parse_csv(text).expect("parse csv");
        assert_eq!(frame.rows[0][0], "say \"hi\"");
        assert_eq!(frame.rows[0][1], "line1\nline2");
    }

    #[test]
    fn unterminated_quote_is_malformed() {
        let error = Dataframe::parse_csv("a,b\n\"oops,1\n").expect_err("unterminated quote");
        assert!(matches!(error, PreviewError::Malformed(_)));
    }

    #[test]
    fn column_types_are_inferred_per_column() {
        let frame = Dataframe::parse_csv(SAMPLE).expect("parse csv");
        assert_eq!(frame.column_types(), vec!["text", "integer", "float", "boolean"]);
    }

    #[test]
    fn load_dataframe_pages_and_types_cells() {
        let dir = TempDir::new().expect("temp dir");
        let path = sample_file(&dir);

        let payload = load_dataframe(&path, 1, 1).expect("load dataframe");
        assert_eq!(payload.kind, "dataframe");
        assert_eq!(payload.total_rows, 3);
        assert_eq!(payload.data.len(), 1);
        assert_eq!(payload.data[0]["name"], "bob");
        assert_eq!(payload.data[0]["age"], 25);
        assert_eq!(payload.data[0]["active"], false);
    }

    #[test]
    fn query_filters_then_sorts() {
        let dir = TempDir::new().expect("temp dir");
        let path = sample_file(&dir);

        let filters = vec![QueryFilter {
            column: "active".to_string(),
            op: "equals".to_string(),
            value: "true".to_string(),
        }];
        let sort = QuerySort {
            column: "age".to_string(),
            direction: "desc".to_string(),
        };

        let payload =
            query_dataframe(&path, &filters, Some(&sort), 0, DEFAULT_PAGE_LIMIT).expect("query");
        assert_eq!(payload.total_rows, 2);
        assert_eq!(payload.data[0]["name"], "smith, carol");
        assert_eq!(payload.data[1]["name"], "alice");
    }

    #[test]
    fn query_supports_numeric_comparisons_and_contains() {
        let dir = TempDir::new().expect("temp dir");
        let path = sample_file(&dir);

        let gt = vec![QueryFilter {
            column: "score".to_string(),
            op: "gt".to_string(),
            value: "80".to_string(),
        }];
        let payload = query_dataframe(&path, &gt, None, 0, DEFAULT_PAGE_LIMIT).expect("gt query");
        assert_eq!(payload.total_rows, 2);

        let contains = vec![QueryFilter {
            column: "name".to_string(),
            op: "contains".to_string(),
            value: "SMITH".to_string(),
        }];
        let payload =
            query_dataframe(&path, &contains, None, 0, DEFAULT_PAGE_LIMIT).expect("contains query");
        assert_eq!(payload.total_rows, 1);
    }

    #[test]
    fn unknown_filter_column_is_reported() {
        let dir = TempDir::new().expect("temp dir");
        let path = sample_file(&dir);

        let filters = vec![QueryFilter {
            column: "ghost".to_string(),
            op: "equals".to_string(),
            value: "x".to_string(),
        }];
        let error = query_dataframe(&path, &filters, None, 0, 10).expect_err("unknown column");
        assert!(matches!(error, PreviewError::UnknownColumn(_)));
    }

    #[test]
    fn excel_preview_is_reported_unsupported() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("book.xlsx");
        fs::write(&path, b"PK...").expect("write stub workbook");

        let error = load_dataframe(&path, 0, 10).expect_err("excel preview unsupported");
        assert!(matches!(error, PreviewError::Unsupported(ref ext) if ext == "xlsx"));
    }

    #[test]
    fn summary_reports_rows_and_typed_columns() {
        let dir = TempDir::new().expect("temp dir");
        let path = sample_file(&dir);

        let summary = csv_file_summary(&path).expect("summarize csv");
        assert_eq!(summary.row_count, 3);
        assert_eq!(summary.columns[1], ("age".to_string(), "integer".to_string()));
    }
}
