// SQLite side of the index
// Holds the manifest and one record per indexed document; vectors live in LanceDB


use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use crate::database::vector_store::Metric;
use crate::loader::SourceKind;

/// What the index knows about an indexed document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentRecord {
    pub source_uri: String,
    pub source_kind: SourceKind,
    /// Changes whenever the document's chunking changes
    pub fingerprint: String,
    pub chunk_count: usize,
    pub indexed_at: DateTime<Utc>,
}

/// Model, metric and dimension every entry of an index is held to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub version: u32,
    pub model_id: String,
    /// Unset until the first entry arrives, unless the embedder knows it upfront
    pub dimension: Option<usize>,
    pub metric: Metric,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct IndexMetadata {
    pool: SqlitePool,
}

impl IndexMetadata {
    /// Open the metadata database at `path` and bring its schema up to date
    ///
    /// # Arguments
    /// * `path` - Location of the database file
    /// * `create` - Whether a missing file may be created
    #[inline]
    pub async fn open(path: &Path, create: bool) -> Result<Self> {
        debug!("Opening index metadata at {}", path.display());

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(create);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;

        sqlx::migrate!("src/database/sqlite/migrations")
            .run(&pool)
            .await
            .context("Failed to run index metadata migrations")?;

        Ok(Self { pool })
    }

    #[inline]
    pub async fn read_manifest(&self) -> Result<Option<Manifest>> {
        let row = sqlx::query(
            r#"
            SELECT version, model_id, dimension, metric, created_at, updated_at
            FROM manifest WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read index manifest")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let version: i64 = row.try_get("version")?;
        let dimension: Option<i64> = row.try_get("dimension")?;
        Ok(Some(Manifest {
            version: u32::try_from(version).context("Manifest version out of range")?,
            model_id: row.try_get("model_id")?,
            dimension: dimension
                .map(usize::try_from)
                .transpose()
                .context("Manifest dimension out of range")?,
            metric: row.try_get("metric")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    #[inline]
    pub async fn write_manifest(&self, manifest: &Manifest) -> Result<()> {
        let dimension = manifest.dimension.map(i64::try_from).transpose()?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO manifest
                (id, version, model_id, dimension, metric, created_at, updated_at)
            VALUES (1, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(i64::from(manifest.version))
        .bind(&manifest.model_id)
        .bind(dimension)
        .bind(manifest.metric)
        .bind(manifest.created_at)
        .bind(manifest.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to write index manifest")?;

        info!(
            "Stamped index manifest: model {}, {:?}",
            manifest.model_id, manifest.metric
        );
        Ok(())
    }

    #[inline]
    pub async fn set_dimension(&self, dimension: usize) -> Result<()> {
        sqlx::query("UPDATE manifest SET dimension = ? WHERE id = 1")
            .bind(i64::try_from(dimension)?)
            .execute(&self.pool)
            .await
            .context("Failed to fix index dimension")?;
        Ok(())
    }

    #[inline]
    pub async fn touch(&self, updated_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE manifest SET updated_at = ? WHERE id = 1")
            .bind(updated_at)
            .execute(&self.pool)
            .await
            .context("Failed to update index timestamp")?;
        Ok(())
    }

    /// Every document record, keyed by document id
    #[inline]
    pub async fn documents(&self) -> Result<BTreeMap<String, DocumentRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT document_id, source_uri, source_kind, fingerprint, chunk_count, indexed_at
            FROM documents
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list indexed documents")?;

        rows.iter()
            .map(|row| -> Result<(String, DocumentRecord)> {
                Ok((row.try_get("document_id")?, document_record(row)?))
            })
            .collect()
    }

    #[inline]
    pub async fn upsert_document(&self, document_id: &str, record: &DocumentRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO documents
                (document_id, source_uri, source_kind, fingerprint, chunk_count, indexed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(document_id)
        .bind(&record.source_uri)
        .bind(record.source_kind)
        .bind(&record.fingerprint)
        .bind(i64::try_from(record.chunk_count)?)
        .bind(record.indexed_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to record document {}", document_id))?;
        Ok(())
    }

    /// Returns whether a record existed
    #[inline]
    pub async fn delete_document(&self, document_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to delete document {}", document_id))?;
        Ok(result.rows_affected() > 0)
    }
}

fn document_record(row: &SqliteRow) -> Result<DocumentRecord> {
    let chunk_count: i64 = row.try_get("chunk_count")?;
    Ok(DocumentRecord {
        source_uri: row.try_get("source_uri")?,
        source_kind: row.try_get("source_kind")?,
        fingerprint: row.try_get("fingerprint")?,
        chunk_count: usize::try_from(chunk_count).context("Chunk count out of range")?,
        indexed_at: row.try_get("indexed_at")?,
    })
}
