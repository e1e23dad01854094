// LanceDB vector index
// Persistent storage of document embeddings with cosine similarity search


use arrow::array::{
    Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatchIterator, StringArray,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::{
    Connection, DistanceType, Table,
    query::{ExecutableQuery, QueryBase, Select},
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::database::vector_index::{
    Document, DocumentMetadata, MetadataFilter, ScoredDocument, VectorIndex,
};
use crate::embeddings::Embedder;
use crate::{KbError, Result};

/// Vector index backed by one LanceDB table.
///
/// The table is created on the first `add`, sized to the embedder's output.
/// A table whose vector column has a different size is dropped and recreated;
/// the index is derived data and is rebuilt by catch-up vectorization.
pub struct LanceIndex {
    connection: Connection,
    table_name: String,
    db_path: PathBuf,
    embedder: Arc<dyn Embedder>,
    vector_dimension: Mutex<Option<usize>>,
}

impl std::fmt::Debug for LanceIndex {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanceIndex")
            .field("table_name", &self.table_name)
            .field("db_path", &self.db_path)
            .field("embedder", &self.embedder)
            .finish_non_exhaustive()
    }
}

impl LanceIndex {
    #[inline]
    pub async fn open(
        db_path: &Path,
        collection_name: &str,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        debug!("Initializing LanceDB at path: {:?}", db_path);

        std::fs::create_dir_all(db_path).map_err(|e| {
            KbError::VectorIndex(format!("Failed to create vector database directory: {}", e))
        })?;

        let uri = format!("file://{}", db_path.display());

        let connection = match lancedb::connect(&uri).execute().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Failed to connect to LanceDB: {}", e);

                let error_msg = e.to_string().to_lowercase();
                if error_msg.contains("corrupt")
                    || error_msg.contains("invalid")
                    || error_msg.contains("malformed")
                {
                    warn!("Vector database corruption detected, attempting recovery");
                    Self::attempt_corruption_recovery(db_path)?;

                    lancedb::connect(&uri).execute().await.map_err(|e| {
                        KbError::VectorIndex(format!(
                            "Failed to connect to LanceDB after recovery: {}",
                            e
                        ))
                    })?
                } else {
                    return Err(KbError::VectorIndex(format!(
                        "Failed to connect to LanceDB: {}",
                        e
                    )));
                }
            }
        };

        let index = Self {
            connection,
            table_name: collection_name.to_string(),
            db_path: db_path.to_path_buf(),
            embedder,
            vector_dimension: Mutex::new(None),
        };

        if let Some(table) = index.open_table().await? {
            match Self::detect_vector_dimension(&table).await {
                Ok(dim) => {
                    info!("Detected existing vector dimension: {}", dim);
                    *index.vector_dimension.lock().await = Some(dim);
                }
                Err(e) => warn!(
                    "Could not detect vector dimension from existing table: {}",
                    e
                ),
            }
        }

        info!(
            "LanceDB index {} ready at {:?}",
            index.table_name, index.db_path
        );
        Ok(index)
    }

    async fn open_table(&self) -> Result<Option<Table>> {
        let table_names = self
            .connection
            .table_names()
            .execute()
            .await
            .map_err(|e| KbError::VectorIndex(format!("Failed to list tables: {}", e)))?;

        if !table_names.contains(&self.table_name) {
            return Ok(None);
        }

        let table = self
            .connection
            .open_table(&self.table_name)
            .execute()
            .await
            .map_err(|e| KbError::VectorIndex(format!("Failed to open table: {}", e)))?;

        Ok(Some(table))
    }

    async fn detect_vector_dimension(table: &Table) -> Result<usize> {
        let schema = table
            .schema()
            .await
            .map_err(|e| KbError::VectorIndex(format!("Failed to get table schema: {}", e)))?;

        schema
            .fields()
            .iter()
            .find(|field| field.name() == "vector")
            .and_then(|field| match field.data_type() {
                DataType::FixedSizeList(_, size) => Some(*size as usize),
                _ => None,
            })
            .ok_or_else(|| {
                KbError::VectorIndex(
                    "Could not find vector column or determine dimension".to_string(),
                )
            })
    }

    fn create_schema(vector_dim: usize) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    vector_dim as i32,
                ),
                false,
            ),
            Field::new("text", DataType::Utf8, false),
            Field::new("db_id", DataType::Int64, false),
            Field::new("version", DataType::Int64, false),
        ]))
    }

    /// Make sure the table exists with a vector column of `vector_dim`
    async fn ensure_table(&self, vector_dim: usize) -> Result<Table> {
        let mut current = self.vector_dimension.lock().await;

        if let Some(table) = self.open_table().await? {
            if current.is_none() {
                // Never drop a table just because its dimension is not known yet
                let existing = Self::detect_vector_dimension(&table).await?;
                debug!("Read vector dimension {} from table {}", existing, self.table_name);
                *current = Some(existing);
            }

            if *current == Some(vector_dim) {
                return Ok(table);
            }

            warn!(
                "Vector dimension changed from {:?} to {}, recreating table {}",
                *current, vector_dim, self.table_name
            );
            self.connection
                .drop_table(&self.table_name)
                .await
                .map_err(|e| KbError::VectorIndex(format!("Failed to drop table: {}", e)))?;
        }

        let table = self
            .connection
            .create_empty_table(&self.table_name, Self::create_schema(vector_dim))
            .execute()
            .await
            .map_err(|e| KbError::VectorIndex(format!("Failed to create table: {}", e)))?;

        *current = Some(vector_dim);
        info!(
            "Created vector table {} with {} dimensions",
            self.table_name, vector_dim
        );
        Ok(table)
    }

    fn create_record_batch(
        vector_dim: usize,
        ids: &[String],
        documents: &[Document],
        vectors: &[Vec<f32>],
    ) -> Result<RecordBatch> {
        let mut flat_values = Vec::with_capacity(documents.len() * vector_dim);
        for vector in vectors {
            flat_values.extend_from_slice(vector);
        }

        let field = Arc::new(Field::new("item", DataType::Float32, true));
        let vector_array = FixedSizeListArray::try_new(
            field,
            vector_dim as i32,
            Arc::new(Float32Array::from(flat_values)),
            None,
        )
        .map_err(|e| KbError::VectorIndex(format!("Failed to create vector array: {}", e)))?;

        let arrays: Vec<Arc<dyn Array>> = vec![
            Arc::new(StringArray::from_iter_values(ids)),
            Arc::new(vector_array),
            Arc::new(StringArray::from_iter_values(
                documents.iter().map(|d| d.text.as_str()),
            )),
            Arc::new(Int64Array::from_iter_values(
                documents.iter().map(|d| d.metadata.db_id),
            )),
            Arc::new(Int64Array::from_iter_values(
                documents.iter().map(|d| d.metadata.version),
            )),
        ];

        RecordBatch::try_new(Self::create_schema(vector_dim), arrays)
            .map_err(|e| KbError::VectorIndex(format!("Failed to create record batch: {}", e)))
    }

    fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
        batch
            .column_by_name(name)
            .ok_or_else(|| KbError::VectorIndex(format!("Missing {} column", name)))?
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| KbError::VectorIndex(format!("Invalid {} column type", name)))
    }

    fn int64_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int64Array> {
        batch
            .column_by_name(name)
            .ok_or_else(|| KbError::VectorIndex(format!("Missing {} column", name)))?
            .as_any()
            .downcast_ref::<Int64Array>()
            .ok_or_else(|| KbError::VectorIndex(format!("Invalid {} column type", name)))
    }

    fn parse_metadata(batch: &RecordBatch) -> Result<Vec<DocumentMetadata>> {
        let db_ids = Self::int64_column(batch, "db_id")?;
        let versions = Self::int64_column(batch, "version")?;

        Ok((0..batch.num_rows())
            .map(|row| DocumentMetadata {
                db_id: db_ids.value(row),
                version: versions.value(row),
            })
            .collect())
    }

    fn parse_search_batch(batch: &RecordBatch) -> Result<Vec<ScoredDocument>> {
        let texts = Self::string_column(batch, "text")?;
        let metadata = Self::parse_metadata(batch)?;
        let distances = batch
            .column_by_name("_distance")
            .and_then(|col| col.as_any().downcast_ref::<Float32Array>());

        Ok(metadata
            .into_iter()
            .enumerate()
            .map(|(row, metadata)| {
                let distance = distances
                    .map_or(0.0, |d| if d.is_null(row) { 0.0 } else { d.value(row) });

                ScoredDocument {
                    document: Document {
                        text: texts.value(row).to_string(),
                        metadata,
                    },
                    // Cosine distance lies in [0, 2]
                    score: (1.0 - distance).clamp(0.0, 1.0),
                }
            })
            .collect())
    }

    fn attempt_corruption_recovery(db_path: &Path) -> Result<()> {
        warn!("Attempting vector database recovery at {:?}", db_path);

        if db_path.exists() {
            let backup_path = db_path.with_extension("corrupted_backup");
            if let Err(e) = std::fs::rename(db_path, &backup_path) {
                error!("Failed to back up corrupted vector database: {}", e);
            } else {
                info!("Corrupted vector database backed up to {:?}", backup_path);
            }
        }

        if db_path.exists() {
            std::fs::remove_dir_all(db_path).map_err(|e| {
                KbError::VectorIndex(format!("Failed to remove corrupted database: {}", e))
            })?;
        }

        std::fs::create_dir_all(db_path)?;
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for LanceIndex {
    fn name(&self) -> &'static str {
        "lancedb"
    }

    async fn add(&self, documents: Vec<Document>) -> Result<Vec<String>> {
        if documents.is_empty() {
            debug!("No documents to index");
            return Ok(Vec::new());
        }

        let texts: Vec<String> = documents.iter().map(|d| d.text.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;

        if vectors.len() != documents.len() {
            return Err(KbError::VectorIndex(format!(
                "Embedder returned {} vectors for {} documents",
                vectors.len(),
                documents.len()
            )));
        }

        let vector_dim = vectors[0].len();
        if vectors.iter().any(|v| v.len() != vector_dim) {
            return Err(KbError::VectorIndex(
                "Embedder returned vectors of differing sizes".to_string(),
            ));
        }

        let table = self.ensure_table(vector_dim).await?;

        let ids: Vec<String> = documents
            .iter()
            .map(|_| Uuid::new_v4().to_string())
            .collect();
        let record_batch = Self::create_record_batch(vector_dim, &ids, &documents, &vectors)?;

        let schema = record_batch.schema();
        let reader = RecordBatchIterator::new(std::iter::once(Ok(record_batch)), schema);
        table
            .add(reader)
            .execute()
            .await
            .map_err(|e| KbError::VectorIndex(format!("Failed to insert documents: {}", e)))?;

        debug!("Indexed {} documents in {}", ids.len(), self.table_name);
        Ok(ids)
    }

    async fn search(
        &self,
        query: &str,
        filter: Option<&MetadataFilter>,
        k: usize,
    ) -> Result<Vec<ScoredDocument>> {
        if filter.is_some_and(MetadataFilter::matches_nothing) {
            return Ok(Vec::new());
        }

        let Some(table) = self.open_table().await? else {
            debug!("Vector table {} does not exist yet", self.table_name);
            return Ok(Vec::new());
        };

        let query_vector = self.embedder.embed(query).await?;

        let mut search = table
            .vector_search(query_vector.as_slice())
            .map_err(|e| KbError::VectorIndex(format!("Failed to create vector search: {}", e)))?
            .column("vector")
            .distance_type(DistanceType::Cosine)
            .limit(k);

        if let Some(filter) = filter {
            search = search.only_if(filter.to_predicate());
        }

        let mut results = search
            .execute()
            .await
            .map_err(|e| KbError::VectorIndex(format!("Failed to execute search: {}", e)))?;

        let mut hits = Vec::new();
        while let Some(batch) = results
            .try_next()
            .await
            .map_err(|e| KbError::VectorIndex(format!("Failed to read result stream: {}", e)))?
        {
            hits.extend(Self::parse_search_batch(&batch)?);
        }

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        debug!("Vector search returned {} hits", hits.len());
        Ok(hits)
    }

    async fn delete(&self, filter: &MetadataFilter) -> Result<u64> {
        if filter.matches_nothing() {
            return Ok(0);
        }

        let Some(table) = self.open_table().await? else {
            return Ok(0);
        };

        let predicate = filter.to_predicate();
        let matching = table
            .count_rows(Some(predicate.clone()))
            .await
            .map_err(|e| KbError::VectorIndex(format!("Failed to count rows: {}", e)))?;

        if matching == 0 {
            return Ok(0);
        }

        table
            .delete(&predicate)
            .await
            .map_err(|e| KbError::VectorIndex(format!("Failed to delete documents: {}", e)))?;

        info!(
            "Deleted {} documents matching {} from {}",
            matching, predicate, self.table_name
        );
        Ok(matching as u64)
    }

    async fn list_metadata(
        &self,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<DocumentMetadata>> {
        if filter.is_some_and(MetadataFilter::matches_nothing) {
            return Ok(Vec::new());
        }

        let Some(table) = self.open_table().await? else {
            return Ok(Vec::new());
        };

        let predicate = filter.map(MetadataFilter::to_predicate);
        let matching = table
            .count_rows(predicate.clone())
            .await
            .map_err(|e| KbError::VectorIndex(format!("Failed to count rows: {}", e)))?;

        if matching == 0 {
            return Ok(Vec::new());
        }

        // Plain queries stop at a small default limit unless told otherwise
        let mut query = table
            .query()
            .select(Select::columns(&["db_id", "version"]))
            .limit(matching);
        if let Some(predicate) = predicate {
            query = query.only_if(predicate);
        }

        let mut stream = query
            .execute()
            .await
            .map_err(|e| KbError::VectorIndex(format!("Failed to scan table: {}", e)))?;

        let mut metadata = Vec::new();
        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(|e| KbError::VectorIndex(format!("Failed to read scan stream: {}", e)))?
        {
            metadata.extend(Self::parse_metadata(&batch)?);
        }

        if metadata.len() < matching {
            warn!(
                "Scan of {} returned {} of {} documents",
                self.table_name,
                metadata.len(),
                matching
            );
        }
        Ok(metadata)
    }

    async fn count(&self) -> Result<u64> {
        let Some(table) = self.open_table().await? else {
            return Ok(0);
        };

        let count = table
            .count_rows(None)
            .await
            .map_err(|e| KbError::VectorIndex(format!("Failed to count rows: {}", e)))?;

        Ok(count as u64)
    }

    /// Compact data files and prune old Lance versions
    async fn optimize(&self) -> Result<()> {
        let Some(table) = self.open_table().await? else {
            return Ok(());
        };

        table
            .optimize(lancedb::table::OptimizeAction::All)
            .await
            .map_err(|e| KbError::VectorIndex(format!("Failed to optimize table: {}", e)))?;

        info!("Vector table {} optimized", self.table_name);
        Ok(())
    }
}
