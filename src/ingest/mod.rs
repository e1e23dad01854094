//! Loading ingestion batches from files.
//!
//! Three layouts are accepted: a `.json` file holding an array of objects, a
//! `.jsonl` file with one object per line, and a `.csv` file whose header row
//! names the fields. JSON values must be scalars; numbers and booleans are
//! stored as their text form.


use serde_json::Value;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::database::sqlite::models::{Batch, Record};
use crate::{KbError, Result};

/// Read a batch from `path`, choosing the layout by file extension
#[inline]
pub fn load_batch(path: &Path) -> Result<Batch> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    let content = fs::read_to_string(path)?;
    let batch = match extension.as_deref() {
        Some("json") => parse_json(&content)?,
        Some("jsonl" | "ndjson") => parse_json_lines(&content)?,
        Some("csv") => parse_csv(&content, b',')?,
        _ => {
            return Err(KbError::InvalidBatch(format!(
                "Unsupported batch file {}: expected a .json, .jsonl or .csv file",
                path.display()
            )));
        }
    };

    info!("Loaded {} records from {}", batch.len(), path.display());
    Ok(batch)
}

/// Parse a JSON array of objects
#[inline]
pub fn parse_json(content: &str) -> Result<Batch> {
    let value: Value = serde_json::from_str(content)
        .map_err(|e| KbError::InvalidBatch(format!("Failed to parse JSON batch: {}", e)))?;

    let Value::Array(items) = value else {
        return Err(KbError::InvalidBatch(
            "JSON batch must be an array of objects".to_string(),
        ));
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| to_record(item, index + 1))
        .collect::<Result<Vec<_>>>()
        .map(Batch::new)
}

/// Parse one JSON object per line; blank lines are skipped
#[inline]
pub fn parse_json_lines(content: &str) -> Result<Batch> {
    let mut records = Vec::new();

    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let value: Value = serde_json::from_str(line).map_err(|e| {
            KbError::InvalidBatch(format!("Failed to parse line {}: {}", index + 1, e))
        })?;
        records.push(to_record(value, index + 1)?);
    }

    debug!("Parsed {} JSON lines", records.len());
    Ok(Batch::new(records))
}

/// Parse delimited text; the header row supplies the field names
#[inline]
pub fn parse_csv(content: &str, delimiter: u8) -> Result<Batch> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .from_reader(content.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| KbError::InvalidBatch(format!("Failed to read CSV header: {}", e)))?
        .clone();
    if headers.iter().any(|name| name.trim().is_empty()) {
        return Err(KbError::InvalidBatch(
            "CSV header contains an empty column name".to_string(),
        ));
    }

    let mut records = Vec::new();
    for (index, row) in reader.records().enumerate() {
        let row = row.map_err(|e| {
            KbError::InvalidBatch(format!("Failed to parse CSV row {}: {}", index + 1, e))
        })?;

        let mut record = Record::new();
        for (field, value) in headers.iter().zip(row.iter()) {
            record.insert(field.trim(), value);
        }
        records.push(record);
    }

    debug!("Parsed {} CSV rows with {} columns", records.len(), headers.len());
    Ok(Batch::new(records))
}

fn to_record(value: Value, position: usize) -> Result<Record> {
    let Value::Object(fields) = value else {
        return Err(KbError::InvalidBatch(format!(
            "Entry {} is not an object",
            position
        )));
    };

    let mut record = Record::new();

    for (field, value) in fields {
        let text = match value {
            Value::String(text) => text,
            Value::Number(number) => number.to_string(),
            Value::Bool(flag) => flag.to_string(),
            Value::Null => String::new(),
            Value::Array(_) | Value::Object(_) => {
                return Err(KbError::InvalidBatch(format!(
                    "Field {} of entry {} must be a scalar value",
                    field, position
                )));
            }
        };
        record.insert(field, text);
    }

    Ok(record)
}
