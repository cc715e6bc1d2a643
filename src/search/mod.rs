pub mod excerpt;
pub mod hybrid;
pub mod pipeline;
pub mod span_merge;

pub use excerpt::{Excerpt, ExcerptExtractor};
pub use hybrid::{fuse, FusedCandidate, HybridWeights};
pub use pipeline::RetrievalPipeline;
pub use span_merge::{merge_spans, SpanCandidate};
