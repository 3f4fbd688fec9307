//! Analysis error types.
//!
//! Every failure mode has a named variant. Nothing is substituted silently.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Required column '{0}' is missing from the input")]
    MissingColumn(String),

    #[error("No data available: {0}")]
    EmptyResult(String),

    #[error("Not enough distinct {dimension} values to form {bins} quantile bins")]
    InsufficientData { dimension: &'static str, bins: usize },

    #[error("Invalid date '{value}' at row {row}")]
    InvalidDate { row: usize, value: String },

    #[error("Invalid value '{value}' in column '{column}' at row {row}")]
    InvalidValue {
        column: String,
        row: usize,
        value: String,
    },

    #[error("Input has more than {limit} rows")]
    TooManyRows { limit: usize },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Data frame error: {0}")]
    Frame(#[from] polars::prelude::PolarsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to write CSV output: {0}")]
    Export(#[from] csv::Error),
}

impl AnalysisError {
    /// True when the error means "nothing to show" rather than bad input.
    pub fn is_empty_result(&self) -> bool {
        matches!(self, AnalysisError::EmptyResult(_))
    }
}
