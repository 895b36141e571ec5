//! Long-term user memories: prompt context, extraction, background workers

pub mod context;
pub mod extractor;
pub mod worker;

pub use context::{render_memory_context, MEMORY_CONTEXT_LIMIT};
pub use extractor::{ExtractionError, ExtractionReport, MemoryExtractor};
pub use worker::{ExtractionHandler, ExtractionJob, MemoryWorkerPool, JOB_TIMEOUT};
