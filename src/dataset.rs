//! Tabular dataset I/O: CSV in, CSV out.
//!
//! Quoting follows RFC 4180: fields may be wrapped in double quotes, a quote
//! inside a quoted field is doubled, and quoted fields may span lines.

use std::path::Path;

use thiserror::Error;

use crate::export::ExportResult;

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("upload is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("dataset has {rows} rows, at least {min} required")]
    TooFewRows { rows: usize, min: usize },

    #[error("row {row} has {got} fields, header has {expected}")]
    Ragged {
        row: usize,
        expected: usize,
        got: usize,
    },

    #[error("unterminated quoted field starting on line {line}")]
    UnterminatedQuote { line: usize },

    #[error("column '{0}' not found")]
    MissingColumn(String),

    #[error("no text column: every column is numeric or empty")]
    NoTextColumn,

    #[error("text column '{0}' is empty in every row")]
    EmptyText(String),

    #[error("dataset has no header row")]
    NoHeader,

    #[error("export references row {row}, dataset has {rows}")]
    RowOutOfRange { row: usize, rows: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Parsed table. Every row has `columns.len()` fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Dataset {
    /// Parse CSV text. Blank lines are skipped.
    pub fn from_csv(input: &str) -> Result<Self, DatasetError> {
        let mut records = parse_records(input)?;
        if records.is_empty() {
            return Err(DatasetError::NoHeader);
        }
        let columns: Vec<String> = records
            .remove(0)
            .into_iter()
            .map(|c| c.trim().to_string())
            .collect();

        for (i, record) in records.iter().enumerate() {
            if record.len() != columns.len() {
                return Err(DatasetError::Ragged {
                    row: i + 1,
                    expected: columns.len(),
                    got: record.len(),
                });
            }
        }

        Ok(Self {
            columns,
            rows: records,
        })
    }

    /// Parse with the upload size limit and minimum row count applied.
    pub fn from_upload(bytes: &[u8], max_bytes: usize, min_rows: usize) -> Result<Self, DatasetError> {
        if bytes.len() > max_bytes {
            return Err(DatasetError::TooLarge {
                size: bytes.len(),
                limit: max_bytes,
            });
        }
        let text = String::from_utf8_lossy(bytes);
        let dataset = Self::from_csv(text.trim_start_matches('\u{feff}'))?;
        if dataset.rows.len() < min_rows {
            return Err(DatasetError::TooFewRows {
                rows: dataset.rows.len(),
                min: min_rows,
            });
        }
        Ok(dataset)
    }

    pub fn from_path(path: &Path, max_bytes: usize, min_rows: usize) -> Result<Self, DatasetError> {
        let bytes = std::fs::read(path)?;
        Self::from_upload(&bytes, max_bytes, min_rows)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Index of the text column: `explicit` if given, else the first
    /// column with at least one non-numeric, non-empty value.
    pub fn text_column(&self, explicit: Option<&str>) -> Result<usize, DatasetError> {
        if let Some(name) = explicit {
            return self
                .column_index(name)
                .ok_or_else(|| DatasetError::MissingColumn(name.to_string()));
        }
        (0..self.columns.len())
            .find(|&col| {
                self.rows.iter().any(|row| {
                    let v = row[col].trim();
                    !v.is_empty() && v.parse::<f64>().is_err()
                })
            })
            .ok_or(DatasetError::NoTextColumn)
    }

    /// Values of the text column. Fails when every value is blank.
    pub fn texts(&self, column: usize) -> Result<Vec<String>, DatasetError> {
        let texts: Vec<String> = self.rows.iter().map(|r| r[column].trim().to_string()).collect();
        if texts.iter().all(|t| t.is_empty()) {
            return Err(DatasetError::EmptyText(self.columns[column].clone()));
        }
        Ok(texts)
    }

    /// Serialize the exported rows, optionally appending `cluster_id` and `weight`.
    pub fn export_csv(&self, export: &ExportResult, annotate: bool) -> Result<String, DatasetError> {
        let mut out = String::new();
        let mut header = self.columns.clone();
        if annotate {
            header.push("cluster_id".into());
            header.push("weight".into());
        }
        write_record(&mut out, &header);

        for row in &export.rows {
            let source = self
                .rows
                .get(row.source_row)
                .ok_or(DatasetError::RowOutOfRange {
                    row: row.source_row,
                    rows: self.rows.len(),
                })?;
            if annotate {
                let mut fields = source.clone();
                fields.push(row.cluster_id.to_string());
                fields.push(format!("{}", row.weight));
                write_record(&mut out, &fields);
            } else {
                write_record(&mut out, source);
            }
        }
        Ok(out)
    }
}

fn parse_records(input: &str) -> Result<Vec<Vec<String>>, DatasetError> {
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut quote_line = 0;
    let mut line = 1;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(c);
                }
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' if field.is_empty() => {
                in_quotes = true;
                quote_line = line;
            }
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                line += 1;
                record.push(std::mem::take(&mut field));
                push_record(&mut records, std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(DatasetError::UnterminatedQuote { line: quote_line });
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        push_record(&mut records, record);
    }
    Ok(records)
}

fn push_record(records: &mut Vec<Vec<String>>, record: Vec<String>) {
    let blank = record.len() == 1 && record[0].trim().is_empty();
    if !blank {
        records.push(record);
    }
}

fn write_record(out: &mut String, fields: &[String]) {
    let line = fields
        .iter()
        .map(|f| escape_field(f))
        .collect::<Vec<_>>()
        .join(",");
    out.push_str(&line);
    out.push('\n');
}

fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{ExportPolicy, ExportedRow};

    const SAMPLE: &str = "id,review,score\n1,\"Great, fast delivery\",5\n2,\"He said \"\"meh\"\"\",3\n\n3,\"multi\nline\",4\n";

    #[test]
    fn parses_quoted_fields() {
        let ds = Dataset::from_csv(SAMPLE).unwrap();
        assert_eq!(ds.columns, vec!["id", "review", "score"]);
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.rows[0][1], "Great, fast delivery");
        assert_eq!(ds.rows[1][1], "He said \"meh\"");
        assert_eq!(ds.rows[2][1], "multi\nline");
    }

    #[test]
    fn detects_text_column() {
        let ds = Dataset::from_csv(SAMPLE).unwrap();
        assert_eq!(ds.text_column(None).unwrap(), 1);
        assert_eq!(ds.text_column(Some("score")).unwrap(), 2);
        assert!(matches!(
            ds.text_column(Some("nope")),
            Err(DatasetError::MissingColumn(_))
        ));

        let numeric = Dataset::from_csv("a,b\n1,2.5\n3,4\n").unwrap();
        assert!(matches!(numeric.text_column(None), Err(DatasetError::NoTextColumn)));
    }

    #[test]
    fn rejects_degenerate_uploads() {
        assert!(matches!(
            Dataset::from_upload(SAMPLE.as_bytes(), 10, 1),
            Err(DatasetError::TooLarge { .. })
        ));
        assert!(matches!(
            Dataset::from_upload(SAMPLE.as_bytes(), DEFAULT_MAX_UPLOAD_BYTES, 50),
            Err(DatasetError::TooFewRows { rows: 3, min: 50 })
        ));
        assert!(matches!(
            Dataset::from_csv("a,b\n1\n"),
            Err(DatasetError::Ragged { row: 1, expected: 2, got: 1 })
        ));
        assert!(matches!(
            Dataset::from_csv("a\n\"open\n"),
            Err(DatasetError::UnterminatedQuote { line: 2 })
        ));

        let blank = Dataset::from_csv("a,b\n1, \n2,\n").unwrap();
        assert!(matches!(blank.texts(1), Err(DatasetError::EmptyText(_))));
    }

    #[test]
    fn writes_annotated_export() {
        let ds = Dataset::from_csv(SAMPLE).unwrap();
        let export = ExportResult {
            policy: ExportPolicy::Weighted,
            seed: 0,
            rows: vec![
                ExportedRow {
                    source_row: 0,
                    cluster_id: 1,
                    weight: 1.5,
                },
                ExportedRow {
                    source_row: 1,
                    cluster_id: -1,
                    weight: 1.0,
                },
            ],
        };
        let csv = ds.export_csv(&export, true).unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("id,review,score,cluster_id,weight"));
        assert_eq!(lines.next(), Some("1,\"Great, fast delivery\",5,1,1.5"));
        assert_eq!(lines.next(), Some("2,\"He said \"\"meh\"\"\",3,-1,1"));

        // Round trip through the parser.
        let reparsed = Dataset::from_csv(&ds.export_csv(&export, false).unwrap()).unwrap();
        assert_eq!(reparsed.rows, ds.rows[..2].to_vec());
    }
}
