use crate::world::coord::ColumnPos;
use crate::world::pass::Pass;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StrataError>;

#[derive(Debug, Error)]
pub enum StrataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt column data at {pos}: {reason}")]
    LoadCorruption { pos: ColumnPos, reason: String },

    #[error("Generator callback failed for {pos} during {pass:?}: {reason}")]
    GeneratorCallbackFailure {
        pos: ColumnPos,
        pass: Pass,
        reason: String,
    },

    #[error("Request queue is full (capacity {capacity})")]
    QueueCapacityExceeded { capacity: usize },

    #[error("Column {pos} is outside the map")]
    OutOfBounds { pos: ColumnPos },

    #[error("Request queue already holds an entry for this key")]
    DuplicateKey,

    #[error("Scheduler made no progress for {waited_ms} ms\n{diagnostics}")]
    SchedulerStall { waited_ms: u64, diagnostics: String },

    #[error("Not enough disk space: {free} bytes free, {required} required")]
    DiskPressure { free: u64, required: u64 },

    #[error("Timed out waiting for worker threads to pause")]
    PauseTimeout,

    #[error("Scheduler halted after a fatal error: {0}")]
    Halted(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Generator error: {0}")]
    Generator(String),
}

impl StrataError {
    /// Errors that stop the scheduler instead of degrading throughput
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StrataError::LoadCorruption { .. }
                | StrataError::SchedulerStall { .. }
                | StrataError::DiskPressure { .. }
                | StrataError::Halted(_)
        )
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        StrataError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_io_error_conversion() {
        let err: StrataError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert_matches!(err, StrataError::Io(_));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_fatal_classification() {
        let corruption = StrataError::LoadCorruption {
            pos: ColumnPos::new(1, 2, 0),
            reason: "bad tag".to_string(),
        };
        assert!(corruption.is_fatal());
        assert!(!StrataError::QueueCapacityExceeded { capacity: 4 }.is_fatal());
        assert!(format!("{}", corruption).contains("bad tag"));
    }
}
