//! Command-line interface definitions and argument parsing

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::AnalysisConfig;
use crate::data::{parse_date, TransactionFilter};
use crate::error::AnalysisError;
use crate::rfm::{AsOf, GroupKey};

/// Customer RFM segmentation and product churn analysis for sales data
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// JSON configuration file (column names, row limit, defaults)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Reject inputs with more rows than this
    #[arg(long, global = true)]
    pub max_rows: Option<usize>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Score customers by recency, frequency and monetary value
    Rfm(RfmArgs),
    /// Cohort retention and churn for one product
    Churn(ChurnArgs),
    /// List categories and products present in the input
    Catalog(CatalogArgs),
}

#[derive(clap::Args, Debug)]
pub struct RfmArgs {
    /// Path to the input CSV file
    #[arg(short, long)]
    pub input: String,

    /// Only include this category ("All" for every category)
    #[arg(long)]
    pub category: Option<String>,

    /// Only include this product ("All" for every product)
    #[arg(short, long)]
    pub product: Option<String>,

    /// Comma-separated group key: branch, route, category, product, customer
    #[arg(short, long, default_value = "branch,route,customer")]
    pub group_by: String,

    /// Reference date convention for recency
    #[arg(long, value_enum)]
    pub as_of: Option<AsOfArg>,

    /// Explicit reference date; overrides --as-of
    #[arg(long)]
    pub as_of_date: Option<String>,

    /// Output file (stdout if omitted)
    #[arg(short, long)]
    pub output: Option<String>,

    #[arg(short, long, value_enum, default_value_t = OutputFormat::Csv)]
    pub format: OutputFormat,

    /// Also print per-segment totals
    #[arg(long)]
    pub summary: bool,
}

#[derive(clap::Args, Debug)]
pub struct ChurnArgs {
    /// Path to the input CSV file
    #[arg(short, long)]
    pub input: String,

    /// Product to analyse
    #[arg(short, long)]
    pub product: String,

    /// Months of inactivity after which a customer counts as churned
    #[arg(short, long)]
    pub threshold: Option<u32>,

    /// Directory for the report files
    #[arg(short, long, default_value = ".")]
    pub output_dir: String,

    #[arg(short, long, value_enum, default_value_t = OutputFormat::Csv)]
    pub format: OutputFormat,
}

#[derive(clap::Args, Debug)]
pub struct CatalogArgs {
    /// Path to the input CSV file
    #[arg(short, long)]
    pub input: String,

    /// Only list products of this category
    #[arg(long)]
    pub category: Option<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsOfArg {
    /// Latest transaction date
    Latest,
    /// One day after the latest transaction date
    DayAfter,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Csv,
    Json,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Json => "json",
        }
    }
}

impl Args {
    /// Configuration file (or defaults) with command-line overrides applied.
    pub fn load_config(&self) -> crate::Result<AnalysisConfig> {
        let mut config = match &self.config {
            Some(path) => AnalysisConfig::from_json_file(path)?,
            None => AnalysisConfig::default(),
        };
        if let Some(max_rows) = self.max_rows {
            config.max_rows = max_rows;
        }
        Ok(config)
    }
}

impl RfmArgs {
    /// Parse the group key list, e.g. "branch,route,customer"
    pub fn parse_group_by(&self) -> crate::Result<Vec<GroupKey>> {
        self.group_by
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(str::parse)
            .collect()
    }

    /// Resolve the as-of convention, falling back to `default` from the config.
    pub fn parse_as_of(&self, default: AsOf) -> crate::Result<AsOf> {
        if let Some(raw) = &self.as_of_date {
            let date = parse_date(raw).ok_or_else(|| {
                AnalysisError::InvalidParameter(format!("invalid --as-of-date '{raw}'"))
            })?;
            return Ok(AsOf::Fixed(date));
        }

        Ok(match self.as_of {
            Some(AsOfArg::Latest) => AsOf::LatestTransaction,
            Some(AsOfArg::DayAfter) => AsOf::DayAfterLatest,
            None => default,
        })
    }

    /// Category/product filter; "All" means no restriction.
    pub fn filter(&self) -> TransactionFilter {
        fn selection(value: &Option<String>) -> Option<String> {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("all"))
                .map(str::to_owned)
        }

        TransactionFilter {
            category: selection(&self.category),
            product: selection(&self.product),
        }
    }
}
