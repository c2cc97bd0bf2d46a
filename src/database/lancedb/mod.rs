// LanceDB vector table
// One row per chunk: its vector plus the metadata needed to answer from it

#[cfg(test)]
mod tests;

use arrow::array::{
    Array, FixedSizeListArray, Float32Array, RecordBatchIterator, StringArray, UInt32Array,
    UInt64Array,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{Connection, DistanceType, Table};
use std::fmt::Display;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::database::vector_store::{IndexEntry, Metric, QueryResult, SearchFilter};
use crate::{RagError, Result};

const TABLE_NAME: &str = "chunks";

/// The `chunks` table of one index
pub struct ChunkTable {
    connection: Connection,
    table: Option<Table>,
    dimension: Option<usize>,
}

impl ChunkTable {
    /// Connect to the LanceDB directory at `path`, opening the chunk table if
    /// it was already created
    #[inline]
    pub async fn connect(path: &Path) -> Result<Self> {
        let uri = format!("file://{}", path.display());
        debug!("Connecting to LanceDB at {}", uri);

        let connection = lancedb::connect(&uri)
            .execute()
            .await
            .map_err(database_error("Failed to connect to LanceDB"))?;

        let table_names = connection
            .table_names()
            .execute()
            .await
            .map_err(database_error("Failed to list tables"))?;

        let mut chunks = Self {
            connection,
            table: None,
            dimension: None,
        };

        if table_names.iter().any(|name| name == TABLE_NAME) {
            let table = chunks
                .connection
                .open_table(TABLE_NAME)
                .execute()
                .await
                .map_err(database_error("Failed to open chunk table"))?;
            chunks.dimension = Some(vector_dimension(&table).await?);
            chunks.table = Some(table);
        }

        Ok(chunks)
    }

    #[inline]
    pub fn exists(&self) -> bool {
        self.table.is_some()
    }

    /// Vector length of the table's schema, once created
    #[inline]
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Create the empty table for vectors of `dimension` components
    #[inline]
    pub async fn create(&mut self, dimension: usize) -> Result<()> {
        let schema = schema(dimension)?;
        let table = self
            .connection
            .create_empty_table(TABLE_NAME, schema)
            .execute()
            .await
            .map_err(database_error("Failed to create chunk table"))?;

        info!("Created chunk table with {} dimensions", dimension);
        self.table = Some(table);
        self.dimension = Some(dimension);
        Ok(())
    }

    fn table(&self) -> Result<&Table> {
        self.table
            .as_ref()
            .ok_or_else(|| RagError::Database("chunk table has not been created".to_string()))
    }

    /// Insert entries, replacing rows with the same chunk id
    ///
    /// # Arguments
    /// * `entries` - Validated entries whose vectors match the table dimension
    #[inline]
    pub async fn upsert(&self, entries: &[IndexEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let table = self.table()?;
        let dimension = self
            .dimension
            .ok_or_else(|| RagError::Database("chunk table dimension unknown".to_string()))?;
        let batch = record_batch(entries, dimension)?;
        let schema = batch.schema();
        let reader = RecordBatchIterator::new(std::iter::once(Ok(batch)), schema);

        let mut merge = table.merge_insert(&["chunk_id"]);
        merge
            .when_matched_update_all(None)
            .when_not_matched_insert_all();
        merge
            .execute(Box::new(reader))
            .await
            .map_err(database_error("Failed to upsert chunks"))?;

        debug!("Upserted {} chunk rows", entries.len());
        Ok(())
    }

    /// Nearest rows to `query` by the index metric, closest first
    ///
    /// # Arguments
    /// * `query` - Query vector of the table's dimension
    /// * `limit` - Maximum number of rows to return
    /// * `metric` - Similarity the index was stamped with
    /// * `filter` - Optional restriction to one document or source
    #[inline]
    pub async fn search(
        &self,
        query: &[f32],
        limit: usize,
        metric: Metric,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<QueryResult>> {
        let table = self.table()?;

        let mut search = table
            .vector_search(query)
            .map_err(database_error("Failed to create vector search"))?
            .column("vector")
            .distance_type(distance_type(metric))
            .bypass_vector_index()
            .limit(limit);

        if let Some(filter) = filter {
            search = search.only_if(filter.predicate());
        }

        let mut stream = search
            .execute()
            .await
            .map_err(database_error("Failed to execute search"))?;

        let mut results = Vec::new();
        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(database_error("Failed to read search results"))?
        {
            results.extend(parse_results(&batch)?);
        }

        debug!("Vector search returned {} rows", results.len());
        Ok(results)
    }

    /// Remove every row of a document
    #[inline]
    pub async fn delete_document(&self, document_id: &str) -> Result<()> {
        let Some(table) = &self.table else {
            return Ok(());
        };

        let predicate = format!("document_id = {}", sql_literal(document_id));
        table
            .delete(&predicate)
            .await
            .map_err(database_error("Failed to delete chunks"))?;
        Ok(())
    }

    #[inline]
    pub async fn count(&self) -> Result<usize> {
        let Some(table) = &self.table else {
            return Ok(0);
        };

        table
            .count_rows(None)
            .await
            .map_err(database_error("Failed to count chunks"))
    }

    /// Compact the fragments left behind by many small writes
    #[inline]
    pub async fn optimize(&self) -> Result<()> {
        let Some(table) = &self.table else {
            return Ok(());
        };

        table
            .optimize(lancedb::table::OptimizeAction::All)
            .await
            .map_err(database_error("Failed to optimize chunk table"))?;
        debug!("Chunk table optimized");
        Ok(())
    }
}

impl SearchFilter {
    fn predicate(&self) -> String {
        match self {
            Self::Document(id) => format!("document_id = {}", sql_literal(id)),
            Self::Source(uri) => format!("source_uri = {}", sql_literal(uri)),
        }
    }
}

fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn database_error<E: Display>(context: &'static str) -> impl FnOnce(E) -> RagError {
    move |e| RagError::Database(format!("{}: {}", context, e))
}

/// LanceDB reports distances; scores are `1 - distance` under both metrics
fn distance_type(metric: Metric) -> DistanceType {
    match metric {
        Metric::Cosine => DistanceType::Cosine,
        Metric::InnerProduct => DistanceType::Dot,
    }
}

fn list_dimension(dimension: usize) -> Result<i32> {
    i32::try_from(dimension)
        .map_err(|_| RagError::Validation(format!("dimension {} is too large", dimension)))
}

fn schema(dimension: usize) -> Result<Arc<Schema>> {
    Ok(Arc::new(Schema::new(vec![
        Field::new("chunk_id", DataType::Utf8, false),
        Field::new("document_id", DataType::Utf8, false),
        Field::new("source_uri", DataType::Utf8, false),
        Field::new("ordinal", DataType::UInt64, false),
        Field::new("text", DataType::Utf8, false),
        Field::new("span_start", DataType::UInt64, false),
        Field::new("span_end", DataType::UInt64, false),
        Field::new("page", DataType::UInt32, true),
        Field::new("model_id", DataType::Utf8, false),
        Field::new(
            "vector",
            DataType::FixedSizeList(
                Arc::new(Field::new("item", DataType::Float32, false)),
                list_dimension(dimension)?,
            ),
            false,
        ),
    ])))
}

async fn vector_dimension(table: &Table) -> Result<usize> {
    let schema = table
        .schema()
        .await
        .map_err(database_error("Failed to read chunk table schema"))?;

    schema
        .fields()
        .iter()
        .find(|field| field.name() == "vector")
        .and_then(|field| match field.data_type() {
            DataType::FixedSizeList(_, size) => usize::try_from(*size).ok(),
            _ => None,
        })
        .ok_or_else(|| RagError::Database("chunk table has no vector column".to_string()))
}

fn record_batch(entries: &[IndexEntry], dimension: usize) -> Result<RecordBatch> {
    let mut flat_values = Vec::with_capacity(entries.len() * dimension);
    for entry in entries {
        flat_values.extend_from_slice(&entry.vector);
    }

    let field = Arc::new(Field::new("item", DataType::Float32, false));
    let vectors = FixedSizeListArray::try_new(
        field,
        list_dimension(dimension)?,
        Arc::new(Float32Array::from(flat_values)),
        None,
    )
    .map_err(database_error("Failed to build vector column"))?;

    let columns: Vec<Arc<dyn Array>> = vec![
        Arc::new(StringArray::from_iter_values(
            entries.iter().map(|entry| entry.chunk_id.as_str()),
        )),
        Arc::new(StringArray::from_iter_values(
            entries.iter().map(|entry| entry.document_id.as_str()),
        )),
        Arc::new(StringArray::from_iter_values(
            entries.iter().map(|entry| entry.source_uri.as_str()),
        )),
        Arc::new(UInt64Array::from_iter_values(
            entries.iter().map(|entry| entry.ordinal as u64),
        )),
        Arc::new(StringArray::from_iter_values(
            entries.iter().map(|entry| entry.text.as_str()),
        )),
        Arc::new(UInt64Array::from_iter_values(
            entries.iter().map(|entry| entry.char_span.start as u64),
        )),
        Arc::new(UInt64Array::from_iter_values(
            entries.iter().map(|entry| entry.char_span.end as u64),
        )),
        Arc::new(UInt32Array::from(
            entries.iter().map(|entry| entry.page).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from_iter_values(
            entries.iter().map(|entry| entry.model_id.as_str()),
        )),
        Arc::new(vectors),
    ];

    RecordBatch::try_new(schema(dimension)?, columns)
        .map_err(database_error("Failed to build record batch"))
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .ok_or_else(|| RagError::Database(format!("missing {} column", name)))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| RagError::Database(format!("unexpected type for {} column", name)))
}

fn parse_results(batch: &RecordBatch) -> Result<Vec<QueryResult>> {
    let chunk_ids = column::<StringArray>(batch, "chunk_id")?;
    let document_ids = column::<StringArray>(batch, "document_id")?;
    let source_uris = column::<StringArray>(batch, "source_uri")?;
    let ordinals = column::<UInt64Array>(batch, "ordinal")?;
    let texts = column::<StringArray>(batch, "text")?;
    let pages = column::<UInt32Array>(batch, "page")?;
    let distances = column::<Float32Array>(batch, "_distance")?;

    Ok((0..batch.num_rows())
        .map(|row| QueryResult {
            chunk_id: chunk_ids.value(row).to_string(),
            document_id: document_ids.value(row).to_string(),
            source_uri: source_uris.value(row).to_string(),
            ordinal: ordinals.value(row) as usize,
            text: texts.value(row).to_string(),
            page: (!pages.is_null(row)).then(|| pages.value(row)),
            score: 1.0 - distances.value(row),
        })
        .collect())
}
