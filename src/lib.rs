//! rfm-churn: customer RFM segmentation and product churn analysis
//!
//! This library scores customers by Recency, Frequency and Monetary value,
//! assigns named segments, and builds cohort retention and churn reports for
//! a single product from retail sales transactions.

pub mod churn;
pub mod cli;
pub mod config;
pub mod data;
pub mod error;
pub mod export;
pub mod quantile;
pub mod rfm;
pub mod segment;

// Re-export public items for easier access
pub use churn::{
    analyze_product, compute_churn, compute_cohorts, ChurnFlag, ChurnReport, CohortMatrix,
    CohortRow, MonthlyChurn, ProductChurnAnalysis,
};
pub use cli::Args;
pub use config::{AnalysisConfig, ColumnNames};
pub use data::{
    load_transactions, read_transactions, Transaction, TransactionFilter, TransactionTable,
    YearMonth,
};
pub use error::AnalysisError;
pub use rfm::{compute_rfm, summarize_segments, AsOf, GroupKey, RfmOptions, RfmRecord, SegmentSummary};
pub use segment::Segment;

/// Common result type used throughout the library
pub type Result<T> = std::result::Result<T, AnalysisError>;
