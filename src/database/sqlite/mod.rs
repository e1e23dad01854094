use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, Transaction};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::StoreConfig;
use crate::config::settings::validate_identifier;
use crate::entity::EntitySchema;
use crate::{KbError, Result};

use self::models::{Batch, KnowledgeRow, StoredBatch, VersionLedgerEntry, VersionSummary};


pub mod cursor;
pub mod models;

pub use cursor::UnvectorizedCursor;

pub type DbPool = Pool<Sqlite>;

/// Keeps the highest version ever issued per table so rolled back versions are not reused
const LEDGER_TABLE: &str = "kb_version_ledger";

/// Versioned relational storage of knowledge rows.
///
/// Every row carries the version of the batch it was inserted with and a
/// `vectorized` flag that is set once its vector document is indexed. An
/// engine built without a connection string is "unconfigured": reads return
/// nothing and writes fail with [`KbError::StoreFailure`].
#[derive(Debug, Clone)]
pub struct RelationalEngine {
    pool: Option<DbPool>,
    table_name: String,
    schema: Arc<dyn EntitySchema>,
}

impl RelationalEngine {
    #[inline]
    pub async fn connect(config: &StoreConfig, schema: Arc<dyn EntitySchema>) -> Result<Self> {
        let table_name = config
            .table_name
            .clone()
            .unwrap_or_else(|| schema.default_table().to_string());

        match &config.connection_string {
            Some(connection_string) => Self::new(connection_string, &table_name, schema).await,
            None => {
                info!("No connection string configured, relational engine disabled");
                Self::unconfigured(&table_name, schema)
            }
        }
    }

    #[inline]
    pub async fn new(
        connection_string: &str,
        table_name: &str,
        schema: Arc<dyn EntitySchema>,
    ) -> Result<Self> {
        validate_identifier(table_name).map_err(|e| KbError::Config(e.to_string()))?;

        let options = SqliteConnectOptions::from_str(connection_string)
            .map_err(|e| {
                KbError::Config(format!(
                    "Invalid connection string {}: {}",
                    connection_string, e
                ))
            })?
            .create_if_missing(true);

        // Every connection to an in-memory database sees its own empty database
        let max_connections = if connection_string.contains(":memory:")
            || connection_string.contains("mode=memory")
        {
            1
        } else {
            5
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| {
                KbError::Database(format!("Failed to create database connection pool: {}", e))
            })?;

        debug!(
            "Relational engine connected, table {} with schema {}",
            table_name,
            schema.name()
        );

        Ok(Self {
            pool: Some(pool),
            table_name: table_name.to_string(),
            schema,
        })
    }

    #[inline]
    pub fn unconfigured(table_name: &str, schema: Arc<dyn EntitySchema>) -> Result<Self> {
        validate_identifier(table_name).map_err(|e| KbError::Config(e.to_string()))?;
        Ok(Self {
            pool: None,
            table_name: table_name.to_string(),
            schema,
        })
    }

    #[inline]
    pub fn is_configured(&self) -> bool {
        self.pool.is_some()
    }

    #[inline]
    pub fn pool(&self) -> Option<&DbPool> {
        self.pool.as_ref()
    }

    #[inline]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    #[inline]
    pub fn schema(&self) -> &Arc<dyn EntitySchema> {
        &self.schema
    }

    #[inline]
    pub async fn table_exists(&self) -> Result<bool> {
        let Some(pool) = &self.pool else {
            return Ok(false);
        };
        Self::sqlite_table_exists(pool, &self.table_name).await
    }

    async fn sqlite_table_exists(pool: &DbPool, name: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(name)
        .fetch_one(pool)
        .await
        .map_err(|e| KbError::Database(format!("Failed to check for table {}: {}", name, e)))?;

        Ok(count > 0)
    }

    /// Pool to read from, or `None` when there is nothing to read
    async fn readable_pool(&self) -> Result<Option<&DbPool>> {
        let Some(pool) = &self.pool else {
            debug!("Relational engine not configured, skipping read");
            return Ok(None);
        };

        if !Self::sqlite_table_exists(pool, &self.table_name).await? {
            debug!("Table {} does not exist yet, skipping read", self.table_name);
            return Ok(None);
        }

        Ok(Some(pool))
    }

    pub(crate) fn select_columns(&self) -> String {
        let mut columns = vec!["id", "version", "vectorized"];
        columns.extend(self.schema.columns().iter().map(|c| c.column));
        columns.join(", ")
    }

    /// Rows of the current (highest) version, ordered by id
    #[inline]
    pub async fn load(&self) -> Result<Vec<KnowledgeRow>> {
        let Some(pool) = self.readable_pool().await? else {
            return Ok(Vec::new());
        };

        let sql = format!(
            "SELECT {columns} FROM {table} WHERE version = (SELECT MAX(version) FROM {table}) ORDER BY id",
            columns = self.select_columns(),
            table = self.table_name
        );

        let rows = sqlx::query(&sql)
            .fetch_all(pool)
            .await
            .map_err(|e| KbError::Database(format!("Failed to load current version: {}", e)))?;

        let rows = rows
            .iter()
            .map(|row| self.schema.from_row(row))
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Loaded {} rows of the current version from {}",
            rows.len(),
            self.table_name
        );
        Ok(rows)
    }

    #[inline]
    pub async fn current_version(&self) -> Result<Option<i64>> {
        let Some(pool) = self.readable_pool().await? else {
            return Ok(None);
        };

        let sql = format!("SELECT MAX(version) FROM {}", self.table_name);
        sqlx::query_scalar::<_, Option<i64>>(&sql)
            .fetch_one(pool)
            .await
            .map_err(|e| KbError::Database(format!("Failed to read current version: {}", e)))
    }

    /// Insert every row of `batch` under a fresh version, all or nothing.
    ///
    /// Returns the assigned version and the row ids in input order. Any
    /// failure rolls the transaction back and surfaces as
    /// [`KbError::StoreFailure`]; undoing vector-side effects is the caller's job.
    #[inline]
    pub async fn store(&self, batch: &Batch) -> Result<StoredBatch> {
        let Some(pool) = &self.pool else {
            warn!("Relational engine not configured, refusing to store batch");
            return Err(KbError::StoreFailure(
                "relational engine is not configured".to_string(),
            ));
        };

        if batch.is_empty() {
            return Err(KbError::InvalidBatch("batch is empty".to_string()));
        }

        for record in &batch.records {
            self.schema.validate(record)?;
        }

        let mut transaction = pool.begin().await.map_err(|e| {
            error!("Failed to begin store transaction: {}", e);
            KbError::StoreFailure(format!("Failed to begin transaction: {}", e))
        })?;

        match self.insert_batch(&mut transaction, batch).await {
            Ok(stored) => {
                transaction.commit().await.map_err(|e| {
                    error!("Failed to commit batch: {}", e);
                    KbError::StoreFailure(format!("Failed to commit batch: {}", e))
                })?;

                info!(
                    "Stored {} rows as version {} in {}",
                    stored.ids.len(),
                    stored.version,
                    self.table_name
                );
                Ok(stored)
            }
            Err(e) => {
                error!("Failed to store batch, rolling back: {}", e);
                if let Err(rollback_error) = transaction.rollback().await {
                    error!("Failed to roll back store transaction: {}", rollback_error);
                }
                Err(KbError::StoreFailure(e.to_string()))
            }
        }
    }

    async fn insert_batch(
        &self,
        transaction: &mut Transaction<'_, Sqlite>,
        batch: &Batch,
    ) -> std::result::Result<StoredBatch, sqlx::Error> {
        self.ensure_tables(transaction).await?;

        let max_existing: Option<i64> =
            sqlx::query_scalar(&format!("SELECT MAX(version) FROM {}", self.table_name))
                .fetch_one(&mut **transaction)
                .await?;

        let last_issued: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT last_version FROM {} WHERE table_name = ?",
            LEDGER_TABLE
        ))
        .bind(&self.table_name)
        .fetch_optional(&mut **transaction)
        .await?;

        let version = max_existing.max(last_issued).unwrap_or(0) + 1;
        debug!(
            "Assigning version {} (max existing {:?}, last issued {:?})",
            version, max_existing, last_issued
        );

        let columns = self.schema.columns();
        let insert_sql = format!(
            "INSERT INTO {} (version, vectorized, {}) VALUES (?, 0, {})",
            self.table_name,
            columns
                .iter()
                .map(|c| c.column)
                .collect::<Vec<_>>()
                .join(", "),
            vec!["?"; columns.len()].join(", ")
        );

        let mut ids = Vec::with_capacity(batch.len());
        for record in &batch.records {
            let mut query = sqlx::query(&insert_sql).bind(version);
            for column in columns {
                query = query.bind(record.get(column.field).unwrap_or_default());
            }
            let id = query.execute(&mut **transaction).await?.last_insert_rowid();
            ids.push(id);
        }

        sqlx::query(&format!(
            r#"
            INSERT INTO {} (table_name, last_version, issued_at) VALUES (?, ?, ?)
            ON CONFLICT(table_name) DO UPDATE SET
                last_version = excluded.last_version,
                issued_at = excluded.issued_at
            "#,
            LEDGER_TABLE
        ))
        .bind(&self.table_name)
        .bind(version)
        .bind(Utc::now())
        .execute(&mut **transaction)
        .await?;

        Ok(StoredBatch { version, ids })
    }

    async fn ensure_tables(
        &self,
        transaction: &mut Transaction<'_, Sqlite>,
    ) -> std::result::Result<(), sqlx::Error> {
        let domain_columns = self
            .schema
            .columns()
            .iter()
            .map(|c| format!("{} TEXT NOT NULL", c.column))
            .collect::<Vec<_>>()
            .join(",\n                ");

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                version INTEGER NOT NULL,
                vectorized BOOLEAN NOT NULL DEFAULT 0,
                {domain_columns}
            )
            "#,
            table = self.table_name,
        ))
        .execute(&mut **transaction)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {table}_version_idx ON {table} (version)",
            table = self.table_name
        ))
        .execute(&mut **transaction)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                table_name TEXT PRIMARY KEY,
                last_version INTEGER NOT NULL,
                issued_at TEXT NOT NULL
            )
            "#,
            LEDGER_TABLE
        ))
        .execute(&mut **transaction)
        .await?;

        Ok(())
    }

    /// Delete every row of `version`, whatever its vectorized state
    #[inline]
    pub async fn rollback(&self, version: i64) -> Result<u64> {
        let Some(pool) = self.readable_pool().await? else {
            return Ok(0);
        };

        let deleted = Self::delete_where(
            pool,
            &format!("DELETE FROM {} WHERE version = ?", self.table_name),
            version,
        )
        .await
        .map_err(|e| {
            error!("Failed to roll back version {}: {}", version, e);
            KbError::Database(format!("Failed to roll back version {}: {}", version, e))
        })?;

        info!(
            "Rolled back version {} ({} rows) in {}",
            version, deleted, self.table_name
        );
        Ok(deleted)
    }

    /// Delete rows of every version strictly below `current`
    #[inline]
    pub async fn clear_versions_older_than(&self, current: i64) -> Result<u64> {
        let Some(pool) = self.readable_pool().await? else {
            return Ok(0);
        };

        let deleted = Self::delete_where(
            pool,
            &format!("DELETE FROM {} WHERE version < ?", self.table_name),
            current,
        )
        .await
        .map_err(|e| {
            KbError::Database(format!(
                "Failed to clear versions older than {}: {}",
                current, e
            ))
        })?;

        if deleted > 0 {
            info!(
                "Cleared {} rows older than version {} from {}",
                deleted, current, self.table_name
            );
        }
        Ok(deleted)
    }

    async fn delete_where(
        pool: &DbPool,
        sql: &str,
        version: i64,
    ) -> std::result::Result<u64, sqlx::Error> {
        let mut transaction = pool.begin().await?;

        let deleted = match sqlx::query(sql)
            .bind(version)
            .execute(&mut *transaction)
            .await
        {
            Ok(result) => result.rows_affected(),
            Err(e) => {
                transaction.rollback().await?;
                return Err(e);
            }
        };

        transaction.commit().await?;
        Ok(deleted)
    }

    #[inline]
    pub async fn mark_vectorized(&self, version: i64, status: bool) -> Result<u64> {
        let Some(pool) = self.readable_pool().await? else {
            return Ok(0);
        };

        let result = sqlx::query(&format!(
            "UPDATE {} SET vectorized = ? WHERE version = ?",
            self.table_name
        ))
        .bind(status)
        .bind(version)
        .execute(pool)
        .await
        .map_err(|e| {
            KbError::Database(format!(
                "Failed to mark version {} as vectorized: {}",
                version, e
            ))
        })?;

        debug!(
            "Marked {} rows of version {} vectorized={}",
            result.rows_affected(),
            version,
            status
        );
        Ok(result.rows_affected())
    }

    /// Set the flag on individual rows, used when their vector documents went missing
    #[inline]
    pub async fn set_rows_vectorized(&self, ids: &[i64], status: bool) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let Some(pool) = self.readable_pool().await? else {
            return Ok(0);
        };

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "UPDATE {} SET vectorized = ? WHERE id IN ({})",
            self.table_name, placeholders
        );

        let mut query = sqlx::query(&sql).bind(status);
        for id in ids {
            query = query.bind(*id);
        }

        let result = query.execute(pool).await.map_err(|e| {
            KbError::Database(format!("Failed to update vectorized flags: {}", e))
        })?;

        Ok(result.rows_affected())
    }

    /// Cursor over rows whose vector document has not been indexed yet
    #[inline]
    pub fn unvectorized_rows(&self) -> UnvectorizedCursor<'_> {
        UnvectorizedCursor::new(self)
    }

    #[inline]
    pub async fn count_version(&self, version: i64) -> Result<i64> {
        let Some(pool) = self.readable_pool().await? else {
            return Ok(0);
        };

        sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE version = ?",
            self.table_name
        ))
        .bind(version)
        .fetch_one(pool)
        .await
        .map_err(|e| KbError::Database(format!("Failed to count version {}: {}", version, e)))
    }

    /// Row counts per version present in the table, lowest version first
    #[inline]
    pub async fn versions(&self) -> Result<Vec<VersionSummary>> {
        let Some(pool) = self.readable_pool().await? else {
            return Ok(Vec::new());
        };

        let rows: Vec<(i64, i64, i64)> = sqlx::query_as(&format!(
            "SELECT version, COUNT(*), COALESCE(SUM(vectorized), 0) FROM {} GROUP BY version ORDER BY version",
            self.table_name
        ))
        .fetch_all(pool)
        .await
        .map_err(|e| KbError::Database(format!("Failed to summarize versions: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|(version, rows, vectorized_rows)| VersionSummary {
                version,
                rows,
                vectorized_rows,
            })
            .collect())
    }

    /// `(id, version, vectorized)` of every stored row
    #[inline]
    pub async fn row_identities(&self) -> Result<Vec<(i64, i64, bool)>> {
        let Some(pool) = self.readable_pool().await? else {
            return Ok(Vec::new());
        };

        sqlx::query_as(&format!(
            "SELECT id, version, vectorized FROM {} ORDER BY id",
            self.table_name
        ))
        .fetch_all(pool)
        .await
        .map_err(|e| KbError::Database(format!("Failed to list row identities: {}", e)))
    }

    #[inline]
    pub async fn version_ledger(&self) -> Result<Option<VersionLedgerEntry>> {
        let Some(pool) = &self.pool else {
            return Ok(None);
        };

        if !Self::sqlite_table_exists(pool, LEDGER_TABLE).await? {
            return Ok(None);
        }

        let entry: Option<(i64, DateTime<Utc>)> = sqlx::query_as(&format!(
            "SELECT last_version, issued_at FROM {} WHERE table_name = ?",
            LEDGER_TABLE
        ))
        .bind(&self.table_name)
        .fetch_optional(pool)
        .await
        .map_err(|e| KbError::Database(format!("Failed to read version ledger: {}", e)))?;

        Ok(entry.map(|(last_version, issued_at)| VersionLedgerEntry {
            table_name: self.table_name.clone(),
            last_version,
            issued_at,
        }))
    }

    #[inline]
    pub async fn close(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
            debug!("Closed connection pool for {}", self.table_name);
        }
    }
}
