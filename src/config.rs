//! Analysis configuration and the input column-name contract

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::rfm::AsOf;

/// Default upper bound on the number of input rows accepted per upload.
pub const DEFAULT_MAX_ROWS: usize = 1_000_000;

/// Default inactivity threshold, in months, before a customer counts as churned.
pub const DEFAULT_CHURN_THRESHOLD_MONTHS: u32 = 3;

/// Names of the input columns the loader reads.
///
/// The defaults match the sales export format. A dataset with different
/// headers is mapped here, before any row reaches the engines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnNames {
    pub date: String,
    pub invoice: String,
    pub customer: String,
    pub amount: String,
    pub branch: String,
    pub route: String,
    pub category: String,
    pub product: String,
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            date: "date".to_string(),
            invoice: "InvoiceNumber".to_string(),
            customer: "CustomerName".to_string(),
            amount: "NetAmount".to_string(),
            branch: "branch".to_string(),
            route: "route".to_string(),
            category: "SubCategoryName".to_string(),
            product: "StockName".to_string(),
        }
    }
}

impl ColumnNames {
    /// All required column names, in load order.
    pub fn required(&self) -> [&str; 8] {
        [
            self.date.as_str(),
            self.invoice.as_str(),
            self.customer.as_str(),
            self.amount.as_str(),
            self.branch.as_str(),
            self.route.as_str(),
            self.category.as_str(),
            self.product.as_str(),
        ]
    }
}

/// Settings shared by every analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub columns: ColumnNames,
    /// Uploads with more rows than this are rejected.
    pub max_rows: usize,
    pub churn_threshold_months: u32,
    /// Reference date convention for recency.
    pub as_of: AsOf,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            columns: ColumnNames::default(),
            max_rows: DEFAULT_MAX_ROWS,
            churn_threshold_months: DEFAULT_CHURN_THRESHOLD_MONTHS,
            as_of: AsOf::default(),
        }
    }
}

impl AnalysisConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}
