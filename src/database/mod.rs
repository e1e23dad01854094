// Database module
// Relational storage of versioned rows and the vector indexes derived from them

pub mod lancedb;
pub mod memory;
pub mod sqlite;
pub mod vector_index;

pub use self::lancedb::LanceIndex;
pub use memory::InMemoryIndex;
pub use sqlite::RelationalEngine;
pub use vector_index::{Document, DocumentMetadata, MetadataFilter, ScoredDocument, VectorIndex};
