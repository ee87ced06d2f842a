pub mod codec;
pub mod config;
pub mod error;
pub mod generation;
pub mod logger;
pub mod server;
pub mod storage;
pub mod streamer;
pub mod world;

// Re-export commonly used items
pub use config::StreamerConfig;
pub use error::{Result, StrataError};
pub use generation::{ColumnOutcome, GeneratorRegistry, PassContext, SchedulerStats};
pub use logger::{log, LogSeverity};
pub use storage::{ColumnStore, MemoryColumnStore, StoredKind};
pub use streamer::ChunkStreamer;
pub use world::{ColumnData, ColumnPos, Pass};
