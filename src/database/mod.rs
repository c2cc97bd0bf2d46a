// Database module
// The index pairs a LanceDB table for chunk vectors with SQLite for the manifest and document records

pub mod lancedb;
pub mod sqlite;
pub mod vector_store;

pub use vector_store::{
    DocumentRecord, IndexEntry, IndexStatus, Metric, QueryResult, SearchFilter, VectorStore,
};
