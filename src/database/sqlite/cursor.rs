use std::collections::VecDeque;
use tracing::{debug, warn};

use super::RelationalEngine;
use super::models::KnowledgeRow;
use crate::{KbError, Result};

const PAGE_SIZE: i64 = 64;

/// Keyset-paginated walk over rows with `vectorized = 0`.
///
/// Rows are yielded in id order. Callers report the outcome of indexing each
/// row; successful rows are flagged immediately, failed rows are left for the
/// next pass. Rows inserted behind the cursor are not revisited.
#[derive(Debug)]
pub struct UnvectorizedCursor<'a> {
    engine: &'a RelationalEngine,
    last_seen: i64,
    buffer: VecDeque<KnowledgeRow>,
    exhausted: bool,
    succeeded: u64,
    failed: u64,
}

impl<'a> UnvectorizedCursor<'a> {
    pub(super) fn new(engine: &'a RelationalEngine) -> Self {
        Self {
            engine,
            last_seen: 0,
            buffer: VecDeque::new(),
            exhausted: !engine.is_configured(),
            succeeded: 0,
            failed: 0,
        }
    }

    #[inline]
    pub async fn next(&mut self) -> Result<Option<KnowledgeRow>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch_page().await?;
        }
        Ok(self.buffer.pop_front())
    }

    async fn fetch_page(&mut self) -> Result<()> {
        let Some(pool) = self.engine.readable_pool().await? else {
            self.exhausted = true;
            return Ok(());
        };

        let sql = format!(
            "SELECT {} FROM {} WHERE vectorized = 0 AND id > ? ORDER BY id LIMIT ?",
            self.engine.select_columns(),
            self.engine.table_name()
        );

        let rows = sqlx::query(&sql)
            .bind(self.last_seen)
            .bind(PAGE_SIZE)
            .fetch_all(pool)
            .await
            .map_err(|e| {
                KbError::Database(format!("Failed to fetch unvectorized rows: {}", e))
            })?;

        if (rows.len() as i64) < PAGE_SIZE {
            self.exhausted = true;
        }

        for row in &rows {
            let row = self.engine.schema().from_row(row)?;
            self.last_seen = row.id;
            self.buffer.push_back(row);
        }

        debug!(
            "Fetched {} unvectorized rows, cursor at id {}",
            rows.len(),
            self.last_seen
        );
        Ok(())
    }

    /// Record the indexing outcome of a row returned by [`Self::next`]
    #[inline]
    pub async fn report(&mut self, row_id: i64, success: bool) -> Result<()> {
        if !success {
            self.failed += 1;
            warn!("Row {} was not vectorized, leaving it for the next pass", row_id);
            return Ok(());
        }

        let Some(pool) = self.engine.pool() else {
            return Ok(());
        };

        sqlx::query(&format!(
            "UPDATE {} SET vectorized = 1 WHERE id = ?",
            self.engine.table_name()
        ))
        .bind(row_id)
        .execute(pool)
        .await
        .map_err(|e| {
            KbError::Database(format!("Failed to flag row {} as vectorized: {}", row_id, e))
        })?;

        self.succeeded += 1;
        Ok(())
    }

    #[inline]
    pub fn succeeded(&self) -> u64 {
        self.succeeded
    }

    #[inline]
    pub fn failed(&self) -> u64 {
        self.failed
    }
}
