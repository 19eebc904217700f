//! Core data structures: jobs, transcript segments, chunks, progress events.

pub mod chunk;
pub mod job;
pub mod progress;

pub use chunk::{Chunk, ChunkDraft};
pub use job::{Job, JobStatus, Segment};
pub use progress::{ProgressEvent, Update};
