pub mod bm25;
pub mod metadata;

pub use bm25::Bm25Index;
pub use metadata::{ChangedDocs, DocRecord, LeafInRange, LeafLocation, LeafRow, MetadataStore, NodeRow};
