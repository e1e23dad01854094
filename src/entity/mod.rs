//! Entity schemas
//!
//! An entity schema describes the domain columns of one knowledge base: which
//! fields a record carries, how they map to SQL columns, how a stored row is
//! read back and how a record is projected into text for embedding.


use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::warn;

use crate::database::sqlite::models::{KnowledgeRow, Record};
use crate::{KbError, Result};

/// A domain field and the SQL column it is stored in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub field: &'static str,
    pub column: &'static str,
    /// Short prefix used when rows are formatted for answers
    pub label: &'static str,
}

pub trait EntitySchema: Send + Sync + Debug {
    /// Name used in configuration (`entity_schema = "..."`)
    fn name(&self) -> &'static str;

    /// Domain columns in declared order
    fn columns(&self) -> &'static [Column];

    fn default_table(&self) -> &'static str;

    #[inline]
    fn from_row(&self, row: &SqliteRow) -> Result<KnowledgeRow> {
        let id: i64 = row
            .try_get("id")
            .map_err(|e| KbError::Database(format!("Failed to read id column: {}", e)))?;
        let version: i64 = row
            .try_get("version")
            .map_err(|e| KbError::Database(format!("Failed to read version column: {}", e)))?;
        let vectorized: bool = row
            .try_get("vectorized")
            .map_err(|e| KbError::Database(format!("Failed to read vectorized column: {}", e)))?;

        let mut record = Record::new();
        for column in self.columns() {
            let value: String = row.try_get(column.column).map_err(|e| {
                KbError::Database(format!("Failed to read column {}: {}", column.column, e))
            })?;
            record.insert(column.field, value);
        }

        Ok(KnowledgeRow {
            id,
            version,
            vectorized,
            record,
        })
    }

    /// `field: value` lines in declared order
    #[inline]
    fn to_document_text(&self, record: &Record) -> String {
        self.columns()
            .iter()
            .map(|column| format!("{}: {}", column.field, record.get(column.field).unwrap_or("")))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[inline]
    fn validate(&self, record: &Record) -> Result<()> {
        let missing: Vec<&str> = self
            .columns()
            .iter()
            .filter(|column| !record.contains(column.field))
            .map(|column| column.field)
            .collect();

        if !missing.is_empty() {
            return Err(KbError::InvalidBatch(format!(
                "record is missing field(s) {} required by schema {}",
                missing.join(", "),
                self.name()
            )));
        }

        if record.len() > self.columns().len() {
            let extra: Vec<&str> = record
                .fields()
                .map(|(field, _)| field)
                .filter(|field| !self.columns().iter().any(|c| c.field == *field))
                .collect();
            warn!(
                "Ignoring field(s) {:?} not declared by schema {}",
                extra,
                self.name()
            );
        }

        Ok(())
    }

    /// Keep only the declared fields
    #[inline]
    fn project(&self, record: &Record) -> Record {
        self.columns()
            .iter()
            .filter_map(|column| record.get(column.field).map(|value| (column.field, value)))
            .collect()
    }

    #[inline]
    fn has_field(&self, field: &str) -> bool {
        self.columns().iter().any(|column| column.field == field)
    }
}

/// Support tickets: a question, a description of the problem and its solution
#[derive(Debug, Clone, Copy, Default)]
pub struct SupportTicket;

impl SupportTicket {
    const COLUMNS: &'static [Column] = &[
        Column {
            field: "Question",
            column: "question",
            label: "Q",
        },
        Column {
            field: "Description",
            column: "description",
            label: "Desc",
        },
        Column {
            field: "Solution",
            column: "solution",
            label: "Sol.",
        },
    ];
}

impl EntitySchema for SupportTicket {
    fn name(&self) -> &'static str {
        "support_ticket"
    }

    fn columns(&self) -> &'static [Column] {
        Self::COLUMNS
    }

    fn default_table(&self) -> &'static str {
        "sample_kbase"
    }
}

/// Plain question/answer pairs
#[derive(Debug, Clone, Copy, Default)]
pub struct QuestionAnswer;

impl QuestionAnswer {
    const COLUMNS: &'static [Column] = &[
        Column {
            field: "Question",
            column: "question",
            label: "Q",
        },
        Column {
            field: "Answer",
            column: "answer",
            label: "A",
        },
    ];
}

impl EntitySchema for QuestionAnswer {
    fn name(&self) -> &'static str {
        "question_answer"
    }

    fn columns(&self) -> &'static [Column] {
        Self::COLUMNS
    }

    fn default_table(&self) -> &'static str {
        "qna_kbase"
    }
}

const KNOWN_SCHEMAS: &[&str] = &["support_ticket", "question_answer"];

#[inline]
pub fn is_known_schema(name: &str) -> bool {
    KNOWN_SCHEMAS.contains(&name)
}

/// Resolve a schema by its configuration name
#[inline]
pub fn schema_for(name: &str) -> Result<Arc<dyn EntitySchema>> {
    match name {
        "support_ticket" => Ok(Arc::new(SupportTicket)),
        "question_answer" => Ok(Arc::new(QuestionAnswer)),
        other => Err(KbError::Config(format!(
            "Unknown entity schema '{}'. Supported schemas: {}",
            other,
            KNOWN_SCHEMAS.join(", ")
        ))),
    }
}
