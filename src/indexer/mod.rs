//! Directory indexing: walk, skip, extract, chunk, embed, store.
pub mod chunker;
pub mod core;
pub mod report;
pub mod skip;

pub use self::core::{IndexingError, IndexingPipeline, relative_key, walk_files};
pub use self::report::{IndexMode, IndexingResult, IndexingSummary};
