//! Ingestion of weekly speed-gauge exports into the raw table

pub mod identity;
pub mod normalizer;
pub mod processor;

use std::fmt;

pub use identity::{DriverDirectory, IdentityResolver, Resolution};
pub use normalizer::{parse_report, parse_report_str, ParsedReport};
pub use processor::{FailedFile, IngestProcessor, IngestReport};

/// Conditions that make a whole export unusable. Nothing from the file is
/// written when one of these is raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    /// No `---` row separating driver rows from the report footer
    MissingSentinel { file: String },
    /// Footer period line absent or not exactly two timestamps
    MalformedPeriod { file: String, found: String },
    /// Required column not present in the header
    MissingColumn { file: String, column: &'static str },
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::MissingSentinel { file } => {
                write!(f, "{}: no '---' separator row", file)
            }
            IngestError::MalformedPeriod { file, found } => {
                write!(f, "{}: malformed reporting period {:?}", file, found)
            }
            IngestError::MissingColumn { file, column } => {
                write!(f, "{}: missing required column '{}'", file, column)
            }
        }
    }
}

impl std::error::Error for IngestError {}
