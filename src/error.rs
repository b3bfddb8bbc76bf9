//! Unified error type for the tabprep library.
//!
//! Library code returns `PrepError`; the CLI wraps it in `anyhow::Result`
//! for context chaining.
//!
//! # Error Categories
//!
//! - **Io**: File system operations (open, read, write, rename)
//! - **Format**: Invalid file contents (manifest magic, dictionary layout)
//! - **Validation**: Invalid parameters or configuration
//! - **Parquet**: Parquet/Arrow encoding and decoding failures
//! - **SchemaMismatch**: Sources disagree on a column name or type
//! - **SourceNotFound**: No input file matched
//! - **EmptyColumn**: An exact statistic was requested on an all-null column
//! - **OutputExists**: Output directory already present without overwrite
//! - **Cancelled**: A stage observed the cancellation token
//! - **Task**: A unit of work failed after exhausting its retries

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Unified error type for the tabprep library.
#[derive(Debug)]
pub enum PrepError {
    /// I/O error with path context.
    Io {
        path: PathBuf,
        operation: &'static str,
        source: std::io::Error,
    },

    /// Invalid file contents (magic, version, structure).
    Format { path: PathBuf, detail: String },

    /// Validation error (invalid parameters, data invariants).
    Validation(String),

    /// Parquet- or Arrow-level error.
    Parquet {
        context: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Two sources (or two in-memory batches) disagree on the schema.
    SchemaMismatch {
        path: PathBuf,
        column: String,
        expected: String,
        actual: String,
    },

    /// No input file matched the given sources.
    SourceNotFound { sources: Vec<PathBuf> },

    /// A column has zero non-null values and an exact statistic was requested.
    EmptyColumn { column: String },

    /// Output directory exists and overwrite was not requested.
    OutputExists { path: PathBuf },

    /// The run was cancelled before completion.
    Cancelled,

    /// A unit of parallel work failed.
    Task {
        stage: String,
        unit: usize,
        attempts: u32,
        source: Box<PrepError>,
    },
}

impl fmt::Display for PrepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrepError::Io {
                path,
                operation,
                source,
            } => {
                write!(
                    f,
                    "I/O error during {} on '{}': {}",
                    operation,
                    path.display(),
                    source
                )
            }
            PrepError::Format { path, detail } => {
                write!(f, "Invalid format in '{}': {}", path.display(), detail)
            }
            PrepError::Validation(msg) => write!(f, "Validation error: {}", msg),
            PrepError::Parquet { context, source } => {
                if let Some(src) = source {
                    write!(f, "Parquet error ({}): {}", context, src)
                } else {
                    write!(f, "Parquet error: {}", context)
                }
            }
            PrepError::SchemaMismatch {
                path,
                column,
                expected,
                actual,
            } => write!(
                f,
                "Schema mismatch in '{}' for column '{}': expected {}, got {}",
                path.display(),
                column,
                expected,
                actual
            ),
            PrepError::SourceNotFound { sources } => {
                let listed: Vec<String> = sources.iter().map(|p| p.display().to_string()).collect();
                write!(f, "No Parquet files found in: {}", listed.join(", "))
            }
            PrepError::EmptyColumn { column } => {
                write!(f, "Column '{}' has no non-null values", column)
            }
            PrepError::OutputExists { path } => write!(
                f,
                "Output '{}' already exists (set overwrite to replace it)",
                path.display()
            ),
            PrepError::Cancelled => write!(f, "Operation cancelled"),
            PrepError::Task {
                stage,
                unit,
                attempts,
                source,
            } => write!(
                f,
                "Stage '{}' failed on partition {} after {} attempt(s): {}",
                stage, unit, attempts, source
            ),
        }
    }
}

impl std::error::Error for PrepError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PrepError::Io { source, .. } => Some(source),
            PrepError::Parquet {
                source: Some(s), ..
            } => Some(s.as_ref()),
            PrepError::Task { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

// ============================================================================
// Conversion traits
// ============================================================================

impl From<std::io::Error> for PrepError {
    fn from(err: std::io::Error) -> Self {
        PrepError::Io {
            path: PathBuf::new(),
            operation: "unknown",
            source: err,
        }
    }
}

impl From<parquet::errors::ParquetError> for PrepError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        PrepError::Parquet {
            context: "parquet operation".to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<arrow::error::ArrowError> for PrepError {
    fn from(err: arrow::error::ArrowError) -> Self {
        PrepError::Parquet {
            context: "arrow operation".to_string(),
            source: Some(Box::new(err)),
        }
    }
}

/// Convenience type alias for Results using PrepError.
pub type Result<T> = std::result::Result<T, PrepError>;

// ============================================================================
// Helper constructors
// ============================================================================

impl PrepError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, operation: &'static str, source: std::io::Error) -> Self {
        PrepError::Io {
            path: path.into(),
            operation,
            source,
        }
    }

    /// Create a format error.
    pub fn format(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        PrepError::Format {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        PrepError::Validation(msg.into())
    }

    /// Create a Parquet error without source.
    pub fn parquet(context: impl Into<String>) -> Self {
        PrepError::Parquet {
            context: context.into(),
            source: None,
        }
    }

    /// Create a schema mismatch error.
    pub fn schema_mismatch(
        path: impl Into<PathBuf>,
        column: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        PrepError::SchemaMismatch {
            path: path.into(),
            column: column.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create an empty column error.
    pub fn empty_column(column: impl Into<String>) -> Self {
        PrepError::EmptyColumn {
            column: column.into(),
        }
    }

    /// Whether retrying the same unit of work with the same inputs may succeed.
    ///
    /// Only interrupted, timed-out and would-block I/O is considered transient.
    /// A `Task` error is transient when its root cause is.
    pub fn is_transient(&self) -> bool {
        match self {
            PrepError::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            PrepError::Task { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Strip `Task` wrappers and return the root error.
    pub fn root_cause(&self) -> &PrepError {
        match self {
            PrepError::Task { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

// ============================================================================
// Thread-safe error capture
// ============================================================================

/// Thread-safe error capture that stores only the first error.
///
/// Parallel stages use this so that the first failing unit wins and the
/// remaining units can observe the failure and stop early.
pub struct FirstErrorCapture {
    has_error: AtomicBool,
    error: Mutex<Option<PrepError>>,
}

impl FirstErrorCapture {
    /// Create a new, empty error capture.
    pub fn new() -> Self {
        Self {
            has_error: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    /// Store an error, but only if no error has been stored yet.
    /// Returns true if this error was stored, false if an error already existed.
    pub fn store(&self, err: PrepError) -> bool {
        if self
            .has_error
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            if let Ok(mut guard) = self.error.lock() {
                *guard = Some(err);
            }
            true
        } else {
            false
        }
    }

    /// Retrieve the stored error, if any.
    pub fn take(&self) -> Option<PrepError> {
        if self.has_error.load(Ordering::SeqCst) {
            self.error.lock().ok().and_then(|mut g| g.take())
        } else {
            None
        }
    }

    /// Check if an error has been stored.
    pub fn has_error(&self) -> bool {
        self.has_error.load(Ordering::SeqCst)
    }
}

impl Default for FirstErrorCapture {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_display() {
        let err = PrepError::io(
            "/data/part.0.parquet",
            "read",
            std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/data/part.0.parquet"));
        assert!(msg.contains("read"));
        assert!(msg.contains("file not found"));
    }

    #[test]
    fn test_schema_mismatch_display() {
        let err = PrepError::schema_mismatch("b.parquet", "x", "Int64", "Utf8");
        let msg = err.to_string();
        assert!(msg.contains("b.parquet"));
        assert!(msg.contains("'x'"));
        assert!(msg.contains("Int64"));
        assert!(msg.contains("Utf8"));
    }

    #[test]
    fn test_source_not_found_lists_sources() {
        let err = PrepError::SourceNotFound {
            sources: vec![PathBuf::from("/a"), PathBuf::from("/b")],
        };
        assert!(err.to_string().contains("/a, /b"));
    }

    #[test]
    fn test_transient_classification() {
        let timed_out = PrepError::io(
            "/x",
            "read",
            std::io::Error::new(std::io::ErrorKind::TimedOut, "slow disk"),
        );
        assert!(timed_out.is_transient());

        let missing = PrepError::io(
            "/x",
            "read",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(!missing.is_transient());
        assert!(!PrepError::validation("bad").is_transient());
        assert!(!PrepError::Cancelled.is_transient());
    }

    #[test]
    fn test_task_error_root_cause_and_source_chain() {
        let err = PrepError::Task {
            stage: "write".to_string(),
            unit: 3,
            attempts: 2,
            source: Box::new(PrepError::empty_column("x")),
        };
        assert!(matches!(err.root_cause(), PrepError::EmptyColumn { .. }));
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("partition 3"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: PrepError = io_err.into();

        match err {
            PrepError::Io { operation, .. } => assert_eq!(operation, "unknown"),
            _ => panic!("Expected Io variant"),
        }
    }

    #[test]
    fn test_first_error_capture_stores_first() {
        let capture = FirstErrorCapture::new();

        assert!(capture.store(PrepError::validation("first error")));
        assert!(!capture.store(PrepError::validation("second error")));

        let err = capture.take().expect("Should have error");
        assert!(err.to_string().contains("first error"));
    }

    #[test]
    fn test_first_error_capture_empty() {
        let capture = FirstErrorCapture::default();
        assert!(capture.take().is_none());
        assert!(!capture.has_error());
    }
}
