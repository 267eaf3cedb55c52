//! Record parser.
//!
//! Every upload holds one JSON object per line. Blank lines are dropped, the
//! remaining lines are joined into a single JSON array and decoded, and every
//! record is tagged with the name of the file it came from. Records of all
//! files are then concatenated into one [`Dataset`]; a field missing from a
//! record becomes [`Scalar::Null`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

use crate::error::{DashError, Result};
use crate::upload::{UploadSet, UploadedFile};

/// Column added to every record naming the file it came from.
pub const SOURCE_COLUMN: &str = "_source";

/// One cell of a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    /// Nested arrays and objects are kept as their JSON text.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Scalar::Null,
            Value::Bool(b) => Scalar::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Scalar::Int(i),
                None => n.as_f64().map(Scalar::Float).unwrap_or(Scalar::Null),
            },
            Value::String(s) => Scalar::Text(s.clone()),
            other => Scalar::Text(other.to_string()),
        }
    }

    /// Numeric value for plotting.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(i) => Some(*i as f64),
            Scalar::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }
}

/// Tabular data: the union of all record fields plus [`SOURCE_COLUMN`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Scalar>>,
}

impl Dataset {
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Values of one column, in row order.
    pub fn column(&self, name: &str) -> Option<Vec<&Scalar>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|row| &row[idx]).collect())
    }
}

/// Decode the records of one file.
pub fn parse_records(file: &UploadedFile) -> Result<Vec<Map<String, Value>>> {
    let bytes = file.bytes()?;
    let text = std::str::from_utf8(&bytes).map_err(|e| DashError::MalformedInput {
        source_name: file.name.clone(),
        message: e.to_string(),
    })?;

    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let document = format!("[{}]", lines.join(","));

    serde_json::from_str(&document).map_err(|e| DashError::MalformedInput {
        source_name: file.name.clone(),
        message: e.to_string(),
    })
}

/// Parse every file of an upload set into one dataset.
///
/// Any undecodable file fails the whole request.
pub fn parse_uploads(uploads: &UploadSet) -> Result<Dataset> {
    let mut tagged = Vec::new();
    for file in uploads.files() {
        let records = parse_records(file)?;
        log::debug!("parsed {} records from {}", records.len(), file.name);
        tagged.push((file.name.as_str(), records));
    }
    Ok(concat_records(tagged))
}

/// Outer union of tagged record sets. Columns come out sorted by name.
pub fn concat_records<'a>(
    tagged: impl IntoIterator<Item = (&'a str, Vec<Map<String, Value>>)>,
) -> Dataset {
    let tagged: Vec<_> = tagged.into_iter().collect();

    let mut names = BTreeSet::new();
    for (_, records) in &tagged {
        for record in records {
            names.extend(record.keys().cloned());
        }
    }
    names.insert(SOURCE_COLUMN.to_string());
    let columns: Vec<String> = names.into_iter().collect();

    let total = tagged.iter().map(|(_, r)| r.len()).sum();
    let mut rows = Vec::with_capacity(total);
    for (source, records) in tagged {
        for record in records {
            let row = columns
                .iter()
                .map(|col| {
                    if col == SOURCE_COLUMN {
                        Scalar::Text(source.to_string())
                    } else {
                        record.get(col).map(Scalar::from_json).unwrap_or(Scalar::Null)
                    }
                })
                .collect();
            rows.push(row);
        }
    }

    Dataset { columns, rows }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, text: &str) -> UploadedFile {
        UploadedFile::from_buffer(name, text.as_bytes().to_vec())
    }

    fn parse(files: Vec<UploadedFile>) -> Result<Dataset> {
        let mut tagged = Vec::new();
        for f in &files {
            tagged.push((f.name.as_str(), parse_records(f)?));
        }
        Ok(concat_records(tagged))
    }

    #[test]
    fn blank_lines_are_skipped() {
        let ds = parse(vec![file(
            "a",
            "{\"x\": 1, \"y\": 2}\n\n   \n{\"x\": 3, \"y\": 4}\n\t\n",
        )])
        .unwrap();
        assert_eq!(ds.num_rows(), 2);
        assert_eq!(ds.columns, vec!["_source", "x", "y"]);
        assert_eq!(ds.column("x").unwrap(), vec![&Scalar::Int(1), &Scalar::Int(3)]);
    }

    #[test]
    fn row_count_is_sum_of_non_blank_lines_and_rows_are_tagged() {
        let ds = parse(vec![
            file("first", "{\"v\": 0.5}\n{\"v\": 1.5}\n\n{\"v\": 2.5}\n"),
            file("second", "\n{\"v\": 9}\n"),
        ])
        .unwrap();
        assert_eq!(ds.num_rows(), 4);
        let sources: Vec<_> = ds.column(SOURCE_COLUMN).unwrap();
        assert_eq!(
            sources,
            vec![
                &Scalar::Text("first".into()),
                &Scalar::Text("first".into()),
                &Scalar::Text("first".into()),
                &Scalar::Text("second".into()),
            ]
        );
    }

    #[test]
    fn differing_fields_are_null_filled() {
        let ds = parse(vec![
            file("a", "{\"x\": 1, \"only_a\": true}\n"),
            file("b", "{\"x\": 2, \"only_b\": \"s\"}\n"),
        ])
        .unwrap();
        assert_eq!(ds.columns, vec!["_source", "only_a", "only_b", "x"]);
        assert_eq!(
            ds.column("only_a").unwrap(),
            vec![&Scalar::Bool(true), &Scalar::Null]
        );
        assert_eq!(
            ds.column("only_b").unwrap(),
            vec![&Scalar::Null, &Scalar::Text("s".into())]
        );
    }

    #[test]
    fn malformed_file_fails_whole_request() {
        let err = parse(vec![
            file("good", "{\"x\": 1}\n"),
            file("bad", "{\"x\": 1}\nnot json\n"),
        ])
        .unwrap_err();
        match err {
            DashError::MalformedInput { source_name, .. } => assert_eq!(source_name, "bad"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn non_object_lines_are_malformed() {
        assert!(parse(vec![file("a", "[1, 2]\n")]).is_err());
    }

    #[test]
    fn empty_file_yields_no_rows() {
        let ds = parse(vec![file("a", "\n\n")]).unwrap();
        assert_eq!(ds.num_rows(), 0);
        assert_eq!(ds.columns, vec![SOURCE_COLUMN]);
    }

    #[test]
    fn numbers_keep_integer_and_float_kinds() {
        assert_eq!(Scalar::from_json(&serde_json::json!(3)), Scalar::Int(3));
        assert_eq!(Scalar::from_json(&serde_json::json!(3.25)), Scalar::Float(3.25));
        assert_eq!(
            Scalar::from_json(&serde_json::json!({"k": 1})),
            Scalar::Text("{\"k\":1}".into())
        );
        assert_eq!(Scalar::Text("1".into()).as_f64(), None);
    }
}
