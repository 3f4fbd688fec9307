//! RFM aggregation, quantile scoring and segmentation

use std::fmt;
use std::str::FromStr;

use chrono::{Duration, NaiveDateTime};
use polars::prelude::{col, Expr, IntoLazy, RankMethod, RankOptions, SortMultipleOptions};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ColumnNames;
use crate::data::{
    f64_column, fields, i64_column, string_column, timestamp_micros, TransactionFilter,
    TransactionTable, MICROS_PER_DAY,
};
use crate::error::AnalysisError;
use crate::quantile::qcut;
use crate::segment::Segment;

/// Number of quantile buckets (and distinct scores) per dimension.
pub const SCORE_BINS: usize = 5;

/// Reference date used to measure recency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsOf {
    /// Latest transaction date in the analysed rows.
    #[default]
    LatestTransaction,
    /// One day after the latest transaction, so the most recent buyers have recency 1.
    DayAfterLatest,
    /// An explicit date; must not precede the latest transaction.
    Fixed(NaiveDateTime),
}

impl AsOf {
    /// Resolve to a concrete timestamp given the latest transaction date.
    pub fn resolve(&self, latest: NaiveDateTime) -> crate::Result<NaiveDateTime> {
        match *self {
            AsOf::LatestTransaction => Ok(latest),
            AsOf::DayAfterLatest => Ok(latest + Duration::days(1)),
            AsOf::Fixed(date) if date < latest => Err(AnalysisError::InvalidParameter(format!(
                "as-of date {date} is before the latest transaction {latest}"
            ))),
            AsOf::Fixed(date) => Ok(date),
        }
    }
}

/// A dimension that can be part of the customer-group key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKey {
    Branch,
    Route,
    Category,
    Product,
    Customer,
}

impl GroupKey {
    /// Column of [`TransactionTable::to_frame`] holding this dimension.
    pub fn field(&self) -> &'static str {
        match self {
            GroupKey::Branch => fields::BRANCH,
            GroupKey::Route => fields::ROUTE,
            GroupKey::Category => fields::CATEGORY,
            GroupKey::Product => fields::PRODUCT,
            GroupKey::Customer => fields::CUSTOMER,
        }
    }

    /// Input column this dimension was read from; used as the output header.
    pub fn column_name<'a>(&self, columns: &'a ColumnNames) -> &'a str {
        match self {
            GroupKey::Branch => columns.branch.as_str(),
            GroupKey::Route => columns.route.as_str(),
            GroupKey::Category => columns.category.as_str(),
            GroupKey::Product => columns.product.as_str(),
            GroupKey::Customer => columns.customer.as_str(),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GroupKey::Branch => "branch",
            GroupKey::Route => "route",
            GroupKey::Category => "category",
            GroupKey::Product => "product",
            GroupKey::Customer => "customer",
        };
        f.write_str(name)
    }
}

impl FromStr for GroupKey {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "branch" => Ok(GroupKey::Branch),
            "route" => Ok(GroupKey::Route),
            "category" => Ok(GroupKey::Category),
            "product" => Ok(GroupKey::Product),
            "customer" => Ok(GroupKey::Customer),
            other => Err(AnalysisError::InvalidParameter(format!(
                "unknown group key '{other}' (expected branch, route, category, product or customer)"
            ))),
        }
    }
}

/// Parameters of one RFM run.
#[derive(Debug, Clone, PartialEq)]
pub struct RfmOptions {
    /// Dimensions identifying one aggregation unit.
    pub group_by: Vec<GroupKey>,
    pub as_of: AsOf,
    /// Applied before grouping.
    pub filter: TransactionFilter,
}

impl Default for RfmOptions {
    fn default() -> Self {
        Self {
            group_by: vec![GroupKey::Branch, GroupKey::Route, GroupKey::Customer],
            as_of: AsOf::default(),
            filter: TransactionFilter::default(),
        }
    }
}

/// Scores and segment for one customer-group key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RfmRecord {
    /// Key values, in `RfmOptions::group_by` order.
    pub key: Vec<String>,
    pub recency_days: i64,
    pub frequency: usize,
    pub monetary: f64,
    pub r_score: u8,
    pub f_score: u8,
    pub m_score: u8,
    /// Recency, frequency and monetary digits, e.g. `"545"`.
    pub rfm_code: String,
    pub segment: Segment,
}

/// Per-segment totals over a set of RFM records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentSummary {
    pub segment: Segment,
    pub customers: usize,
    /// Fraction of all records, in [0, 1].
    pub share: f64,
    pub mean_recency_days: f64,
    pub mean_frequency: f64,
    pub mean_monetary: f64,
}

const LAST_PURCHASE: &str = "last_purchase_us";
const FREQUENCY: &str = "frequency";
const FREQUENCY_RANK: &str = "frequency_rank";
const MONETARY: &str = "monetary";

/// Per-key aggregates, one entry per key in key order.
struct Partitions {
    keys: Vec<Vec<String>>,
    last_purchase: Vec<i64>,
    frequency: Vec<i64>,
    frequency_rank: Vec<f64>,
    monetary: Vec<f64>,
}

/// Compute recency, frequency and monetary scores per customer-group key.
///
/// # Arguments
/// * `table` - Validated transactions
/// * `options` - Group key, as-of convention and pre-filter
///
/// # Returns
/// * One `RfmRecord` per key, ordered by key
///
/// # Errors
/// * `EmptyResult` when the filter leaves no rows
/// * `InsufficientData` when a dimension cannot be split into five non-empty-width buckets
pub fn compute_rfm(table: &TransactionTable, options: &RfmOptions) -> crate::Result<Vec<RfmRecord>> {
    if options.group_by.is_empty() {
        return Err(AnalysisError::InvalidParameter(
            "at least one group key is required".to_string(),
        ));
    }
    for (i, key) in options.group_by.iter().enumerate() {
        if options.group_by[..i].contains(key) {
            return Err(AnalysisError::InvalidParameter(format!(
                "group key '{key}' is listed more than once"
            )));
        }
    }

    let filtered;
    let rows = if options.filter.is_empty() {
        table
    } else {
        filtered = table.filter(&options.filter)?;
        &filtered
    };
    let latest = rows.latest_date().ok_or_else(|| {
        AnalysisError::EmptyResult(format!(
            "no transactions match the selected filters ({})",
            options.filter
        ))
    })?;
    let as_of = options.as_of.resolve(latest)?;

    let partitions = partition(rows, &options.group_by)?;
    debug!(
        rows = rows.len(),
        partitions = partitions.keys.len(),
        %as_of,
        "Aggregated RFM partitions"
    );

    let as_of_micros = timestamp_micros(as_of);
    // as_of is never before a partition's last purchase, so this floors.
    let recency: Vec<i64> = partitions
        .last_purchase
        .iter()
        .map(|&last| (as_of_micros - last) / MICROS_PER_DAY)
        .collect();
    let recency_values: Vec<f64> = recency.iter().map(|&days| days as f64).collect();

    let r_bins = score_bins(&recency_values, "recency")?;
    let f_bins = score_bins(&partitions.frequency_rank, "frequency")?;
    let m_bins = score_bins(&partitions.monetary, "monetary")?;

    let records: Vec<RfmRecord> = partitions
        .keys
        .into_iter()
        .enumerate()
        .map(|(i, key)| {
            // Lower recency is better, so recency buckets map to descending scores.
            let r_score = (SCORE_BINS - r_bins[i]) as u8;
            let f_score = (f_bins[i] + 1) as u8;
            let m_score = (m_bins[i] + 1) as u8;

            RfmRecord {
                key,
                recency_days: recency[i],
                frequency: partitions.frequency[i] as usize,
                monetary: partitions.monetary[i],
                r_score,
                f_score,
                m_score,
                rfm_code: format!("{r_score}{f_score}{m_score}"),
                segment: Segment::classify(r_score, f_score, m_score),
            }
        })
        .collect();

    info!(customers = records.len(), "RFM segmentation complete");
    Ok(records)
}

/// Customer count, share and mean metrics per segment, in rule order.
pub fn summarize_segments(records: &[RfmRecord]) -> Vec<SegmentSummary> {
    let total = records.len();

    Segment::ALL
        .iter()
        .filter_map(|&segment| {
            let members: Vec<&RfmRecord> = records.iter().filter(|r| r.segment == segment).collect();
            if members.is_empty() {
                return None;
            }
            let n = members.len() as f64;

            Some(SegmentSummary {
                segment,
                customers: members.len(),
                share: n / total as f64,
                mean_recency_days: members.iter().map(|r| r.recency_days as f64).sum::<f64>() / n,
                mean_frequency: members.iter().map(|r| r.frequency as f64).sum::<f64>() / n,
                mean_monetary: members.iter().map(|r| r.monetary).sum::<f64>() / n,
            })
        })
        .collect()
}

/// Aggregate rows by key; partitions come back sorted by key.
///
/// Frequency ranks use the ordinal method, so equal frequencies are ranked
/// by key order.
fn partition(table: &TransactionTable, group_by: &[GroupKey]) -> crate::Result<Partitions> {
    let keys: Vec<Expr> = group_by.iter().map(|k| col(k.field())).collect();

    let df = table
        .to_frame()?
        .lazy()
        .group_by(keys.clone())
        .agg([
            col(fields::TIMESTAMP).max().alias(LAST_PURCHASE),
            col(fields::INVOICE).n_unique().alias(FREQUENCY),
            col(fields::AMOUNT).sum().alias(MONETARY),
        ])
        .sort_by_exprs(keys, SortMultipleOptions::default())
        .with_column(
            col(FREQUENCY)
                .rank(
                    RankOptions {
                        method: RankMethod::Ordinal,
                        descending: false,
                    },
                    None,
                )
                .alias(FREQUENCY_RANK),
        )
        .collect()?;

    let key_columns = group_by
        .iter()
        .map(|k| string_column(&df, k.field()))
        .collect::<crate::Result<Vec<_>>>()?;
    let keys = (0..df.height())
        .map(|row| key_columns.iter().map(|column| column[row].clone()).collect())
        .collect();

    Ok(Partitions {
        keys,
        last_purchase: i64_column(&df, LAST_PURCHASE)?,
        frequency: i64_column(&df, FREQUENCY)?,
        frequency_rank: f64_column(&df, FREQUENCY_RANK)?,
        monetary: f64_column(&df, MONETARY)?,
    })
}

fn score_bins(values: &[f64], dimension: &'static str) -> crate::Result<Vec<usize>> {
    qcut(values, SCORE_BINS).ok_or(AnalysisError::InsufficientData {
        dimension,
        bins: SCORE_BINS,
    })
}
