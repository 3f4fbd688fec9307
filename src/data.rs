//! Transaction loading using Polars, plus the in-memory transaction table

use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::io::Cursor;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use polars::df;
use polars::prelude::{CsvReadOptions, DataFrame, DataType, SerReader};
use serde::{Serialize, Serializer};
use tracing::{debug, info};

use crate::config::{AnalysisConfig, ColumnNames};
use crate::error::AnalysisError;

/// Timestamp layouts accepted for the date column, tried in order.
const DATETIME_FORMATS: [&str; 7] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"];

const MICROS_PER_SECOND: i64 = 1_000_000;

/// Microseconds in one day.
pub const MICROS_PER_DAY: i64 = 86_400 * MICROS_PER_SECOND;

/// Column names of the frame built by [`TransactionTable::to_frame`].
pub mod fields {
    /// Microseconds since the Unix epoch.
    pub const TIMESTAMP: &str = "timestamp_us";
    /// Calendar month as [`YearMonth::index`](super::YearMonth::index).
    pub const MONTH: &str = "month_index";
    pub const INVOICE: &str = "invoice_id";
    pub const CUSTOMER: &str = "customer_id";
    pub const BRANCH: &str = "branch";
    pub const ROUTE: &str = "route";
    pub const CATEGORY: &str = "category";
    pub const PRODUCT: &str = "product";
    pub const AMOUNT: &str = "amount";
}

/// A single sales line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transaction {
    pub date: NaiveDateTime,
    pub invoice_id: String,
    pub customer_id: String,
    pub branch: String,
    pub route: String,
    pub category: String,
    pub product: String,
    /// Net amount; returns and credits are negative.
    pub amount: f64,
}

/// Calendar month, ordered chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Self {
        Self { year, month }
    }

    pub fn of(date: NaiveDateTime) -> Self {
        Self::new(date.year(), date.month())
    }

    /// Sequential month number; consecutive months differ by one.
    pub fn index(self) -> i32 {
        self.year * 12 + self.month as i32 - 1
    }

    pub fn from_index(index: i32) -> Self {
        Self::new(index.div_euclid(12), index.rem_euclid(12) as u32 + 1)
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl Serialize for YearMonth {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Optional equality filters applied before any aggregation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionFilter {
    pub category: Option<String>,
    pub product: Option<String>,
}

impl TransactionFilter {
    pub fn is_empty(&self) -> bool {
        self.category.is_none() && self.product.is_none()
    }

    pub fn matches(&self, transaction: &Transaction) -> bool {
        self.category
            .as_deref()
            .map_or(true, |category| transaction.category == category)
            && self
                .product
                .as_deref()
                .map_or(true, |product| transaction.product == product)
    }
}

impl fmt::Display for TransactionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "category={}, product={}",
            self.category.as_deref().unwrap_or("All"),
            self.product.as_deref().unwrap_or("All")
        )
    }
}

/// Validated transactions from one upload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionTable {
    transactions: Vec<Transaction>,
}

impl TransactionTable {
    pub fn new(transactions: Vec<Transaction>) -> Self {
        Self { transactions }
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.iter()
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Latest transaction timestamp, `None` for an empty table.
    pub fn latest_date(&self) -> Option<NaiveDateTime> {
        self.transactions.iter().map(|t| t.date).max()
    }

    /// Rows matching `filter`.
    ///
    /// Returns `EmptyResult` when nothing matches, so callers never run an
    /// analysis on an empty selection.
    pub fn filter(&self, filter: &TransactionFilter) -> crate::Result<TransactionTable> {
        let transactions: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();

        if transactions.is_empty() {
            return Err(AnalysisError::EmptyResult(format!(
                "no transactions match the selected filters ({filter})"
            )));
        }

        debug!(rows = transactions.len(), %filter, "Filtered transactions");
        Ok(TransactionTable::new(transactions))
    }

    /// Rows for a single product.
    pub fn for_product(&self, product: &str) -> crate::Result<TransactionTable> {
        self.filter(&TransactionFilter {
            category: None,
            product: Some(product.to_string()),
        })
    }

    /// Sorted distinct categories.
    pub fn categories(&self) -> Vec<String> {
        let categories: BTreeSet<&str> = self.iter().map(|t| t.category.as_str()).collect();
        categories.into_iter().map(str::to_owned).collect()
    }

    /// Sorted distinct products, optionally restricted to one category.
    pub fn products(&self, category: Option<&str>) -> Vec<String> {
        let products: BTreeSet<&str> = self
            .iter()
            .filter(|t| category.map_or(true, |c| t.category == c))
            .map(|t| t.product.as_str())
            .collect();
        products.into_iter().map(str::to_owned).collect()
    }
}

impl TransactionTable {
    /// Columnar view of the rows for aggregation, named after [`fields`].
    pub fn to_frame(&self) -> crate::Result<DataFrame> {
        let rows = &self.transactions;
        let strings = |field: fn(&Transaction) -> &str| rows.iter().map(field).collect::<Vec<&str>>();

        let frame = df!(
            fields::TIMESTAMP => rows.iter().map(|t| timestamp_micros(t.date)).collect::<Vec<i64>>(),
            fields::MONTH => rows.iter().map(|t| YearMonth::of(t.date).index()).collect::<Vec<i32>>(),
            fields::INVOICE => strings(|t| t.invoice_id.as_str()),
            fields::CUSTOMER => strings(|t| t.customer_id.as_str()),
            fields::BRANCH => strings(|t| t.branch.as_str()),
            fields::ROUTE => strings(|t| t.route.as_str()),
            fields::CATEGORY => strings(|t| t.category.as_str()),
            fields::PRODUCT => strings(|t| t.product.as_str()),
            fields::AMOUNT => rows.iter().map(|t| t.amount).collect::<Vec<f64>>(),
        )?;
        Ok(frame)
    }
}

impl FromIterator<Transaction> for TransactionTable {
    fn from_iter<I: IntoIterator<Item = Transaction>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Parse a date column value into a timestamp.
///
/// RFC 3339 values keep their wall-clock time; the offset is dropped.
pub fn parse_date(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();

    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.naive_local());
    }

    DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|format| NaiveDate::parse_from_str(value, format).ok())
                .map(|date| date.and_time(NaiveTime::MIN))
        })
}

/// Load a CSV file of sales lines.
///
/// # Arguments
/// * `file_path` - Path to the CSV file
/// * `config` - Column mapping and row limit
///
/// # Returns
/// * `TransactionTable` with every row validated
pub fn load_transactions(file_path: &str, config: &AnalysisConfig) -> crate::Result<TransactionTable> {
    let file = File::open(file_path)?;
    let df = csv_options(config)
        .into_reader_with_file_handle(file)
        .finish()?;
    table_from_frame(df, config)
}

/// Read CSV bytes (an uploaded file) into a validated transaction table.
pub fn read_transactions(data: Vec<u8>, config: &AnalysisConfig) -> crate::Result<TransactionTable> {
    let df = csv_options(config)
        .into_reader_with_file_handle(Cursor::new(data))
        .finish()?;
    table_from_frame(df, config)
}

/// Microseconds since the Unix epoch, reading the naive time as UTC.
pub fn timestamp_micros(date: NaiveDateTime) -> i64 {
    date.and_utc().timestamp_micros()
}

/// Inverse of [`timestamp_micros`].
pub fn from_timestamp_micros(micros: i64) -> Option<NaiveDateTime> {
    let seconds = micros.div_euclid(MICROS_PER_SECOND);
    let nanos = (micros.rem_euclid(MICROS_PER_SECOND) * 1_000) as u32;
    DateTime::from_timestamp(seconds, nanos).map(|utc| utc.naive_utc())
}

/// Column values as `i64`, casting integer aggregates as needed.
pub(crate) fn i64_column(df: &DataFrame, name: &str) -> crate::Result<Vec<i64>> {
    let series = df.column(name)?.as_materialized_series().cast(&DataType::Int64)?;
    let values = series.i64()?.into_no_null_iter().collect();
    Ok(values)
}

pub(crate) fn f64_column(df: &DataFrame, name: &str) -> crate::Result<Vec<f64>> {
    let series = df.column(name)?.as_materialized_series().cast(&DataType::Float64)?;
    let values = series.f64()?.into_no_null_iter().collect();
    Ok(values)
}

pub(crate) fn string_column(df: &DataFrame, name: &str) -> crate::Result<Vec<String>> {
    let values = df
        .column(name)?
        .as_materialized_series()
        .str()?
        .into_no_null_iter()
        .map(str::to_owned)
        .collect();
    Ok(values)
}

// Every column is read as text so values are validated here, not coerced by inference.
// Reading stops one row past the limit.
fn csv_options(config: &AnalysisConfig) -> CsvReadOptions {
    CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .with_n_rows(Some(config.max_rows.saturating_add(1)))
}

fn table_from_frame(df: DataFrame, config: &AnalysisConfig) -> crate::Result<TransactionTable> {
    if df.height() > config.max_rows {
        return Err(AnalysisError::TooManyRows {
            limit: config.max_rows,
        });
    }

    let table = transactions_from_frame(&df, &config.columns)?;
    info!(rows = table.len(), "Loaded transactions");
    Ok(table)
}

/// Convert a DataFrame of text columns into typed transactions.
fn transactions_from_frame(df: &DataFrame, columns: &ColumnNames) -> crate::Result<TransactionTable> {
    // Fail fast before touching any row.
    for name in columns.required() {
        if df.get_column_index(name).is_none() {
            return Err(AnalysisError::MissingColumn(name.to_string()));
        }
    }

    let dates = text_column(df, &columns.date)?;
    let invoices = text_column(df, &columns.invoice)?;
    let customers = text_column(df, &columns.customer)?;
    let amounts = text_column(df, &columns.amount)?;
    let branches = text_column(df, &columns.branch)?;
    let routes = text_column(df, &columns.route)?;
    let categories = text_column(df, &columns.category)?;
    let products = text_column(df, &columns.product)?;

    let mut transactions = Vec::with_capacity(df.height());
    for index in 0..df.height() {
        let row = index + 1;

        let raw_date = dates[index].as_deref().unwrap_or_default();
        let date = parse_date(raw_date).ok_or_else(|| AnalysisError::InvalidDate {
            row,
            value: raw_date.to_string(),
        })?;

        let raw_amount = required(&amounts[index], &columns.amount, row)?;
        let amount = raw_amount
            .parse::<f64>()
            .ok()
            .filter(|amount| amount.is_finite())
            .ok_or_else(|| AnalysisError::InvalidValue {
                column: columns.amount.clone(),
                row,
                value: raw_amount.to_string(),
            })?;

        transactions.push(Transaction {
            date,
            invoice_id: required(&invoices[index], &columns.invoice, row)?.to_string(),
            customer_id: required(&customers[index], &columns.customer, row)?.to_string(),
            branch: required(&branches[index], &columns.branch, row)?.to_string(),
            route: required(&routes[index], &columns.route, row)?.to_string(),
            category: required(&categories[index], &columns.category, row)?.to_string(),
            product: required(&products[index], &columns.product, row)?.to_string(),
            amount,
        });
    }

    Ok(TransactionTable::new(transactions))
}

/// Extract a column as trimmed text; blank cells become `None`.
fn text_column(df: &DataFrame, name: &str) -> crate::Result<Vec<Option<String>>> {
    let series = df
        .column(name)?
        .as_materialized_series()
        .cast(&DataType::String)?;

    let values = series
        .str()?
        .into_iter()
        .map(|value| {
            value
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_owned)
        })
        .collect();

    Ok(values)
}

fn required<'a>(value: &'a Option<String>, column: &str, row: usize) -> crate::Result<&'a str> {
    value.as_deref().ok_or_else(|| AnalysisError::InvalidValue {
        column: column.to_string(),
        row,
        value: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CSV: &str = "\
date,InvoiceNumber,CustomerName,branch,route,SubCategoryName,StockName,NetAmount
2024-01-05,1001,Alpha Stores,North,R1,Detergents,Soap,120.50
2024-01-20 14:30:00,1002,Beta Mart,North,R2,Detergents,Soap,80
2024-02-11,1003,Alpha Stores,North,R1,Beverages,Tea,-15.25
2024-03-01T09:00:00Z,1004,Gamma Traders,South,R3,Beverages,Coffee,300
";

    fn date(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn load(csv: &str) -> crate::Result<TransactionTable> {
        read_transactions(csv.as_bytes().to_vec(), &AnalysisConfig::default())
    }

    #[test]
    fn test_read_sample_csv() {
        let table = load(SAMPLE_CSV).unwrap();
        assert_eq!(table.len(), 4);

        let first = &table.transactions()[0];
        assert_eq!(first.customer_id, "Alpha Stores");
        assert_eq!(first.invoice_id, "1001");
        assert_eq!(first.date, date(2024, 1, 5));
        assert_eq!(first.amount, 120.50);

        assert_eq!(table.transactions()[2].amount, -15.25);
        assert_eq!(
            table.latest_date(),
            Some(date(2024, 3, 1) + chrono::Duration::hours(9))
        );
    }

    #[test]
    fn test_missing_column_fails_fast() {
        let csv = "date,InvoiceNumber,CustomerName,branch,route,SubCategoryName,StockName\n\
                   2024-01-05,1001,Alpha,North,R1,Detergents,Soap\n";
        match load(csv) {
            Err(AnalysisError::MissingColumn(name)) => assert_eq!(name, "NetAmount"),
            other => panic!("expected MissingColumn, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_date_reports_row() {
        let csv = "date,InvoiceNumber,CustomerName,branch,route,SubCategoryName,StockName,NetAmount\n\
                   2024-01-05,1001,Alpha,North,R1,Detergents,Soap,10\n\
                   not-a-date,1002,Beta,North,R1,Detergents,Soap,10\n";
        match load(csv) {
            Err(AnalysisError::InvalidDate { row, value }) => {
                assert_eq!(row, 2);
                assert_eq!(value, "not-a-date");
            }
            other => panic!("expected InvalidDate, got {other:?}"),
        }
    }

    #[test]
    fn test_blank_customer_is_rejected() {
        let csv = "date,InvoiceNumber,CustomerName,branch,route,SubCategoryName,StockName,NetAmount\n\
                   2024-01-05,1001,,North,R1,Detergents,Soap,10\n";
        assert!(matches!(
            load(csv),
            Err(AnalysisError::InvalidValue { ref column, row: 1, .. }) if column == "CustomerName"
        ));
    }

    #[test]
    fn test_non_numeric_amount_is_rejected() {
        let csv = "date,InvoiceNumber,CustomerName,branch,route,SubCategoryName,StockName,NetAmount\n\
                   2024-01-05,1001,Alpha,North,R1,Detergents,Soap,ten\n";
        assert!(matches!(
            load(csv),
            Err(AnalysisError::InvalidValue { ref value, .. }) if value == "ten"
        ));
    }

    #[test]
    fn test_row_limit() {
        let config = AnalysisConfig {
            max_rows: 3,
            ..AnalysisConfig::default()
        };
        let result = read_transactions(SAMPLE_CSV.as_bytes().to_vec(), &config);
        assert!(matches!(result, Err(AnalysisError::TooManyRows { limit: 3 })));
    }

    #[test]
    fn test_custom_column_names() {
        let csv = "Day,Invoice,Client,Branch,Route,Category,Item,Total\n\
                   2024-01-05,1001,Alpha,North,R1,Detergents,Soap,10\n";
        let config = AnalysisConfig {
            columns: ColumnNames {
                date: "Day".into(),
                invoice: "Invoice".into(),
                customer: "Client".into(),
                amount: "Total".into(),
                branch: "Branch".into(),
                route: "Route".into(),
                category: "Category".into(),
                product: "Item".into(),
            },
            ..AnalysisConfig::default()
        };
        let table = read_transactions(csv.as_bytes().to_vec(), &config).unwrap();
        assert_eq!(table.transactions()[0].customer_id, "Alpha");
    }

    #[test]
    fn test_parse_date_formats() {
        assert_eq!(parse_date("2024-01-05"), Some(date(2024, 1, 5)));
        assert_eq!(parse_date("01/05/2024"), Some(date(2024, 1, 5)));
        assert_eq!(parse_date("2024-01-05 00:00:00"), Some(date(2024, 1, 5)));
        assert_eq!(
            parse_date("2024-01-05T00:00:00.250").map(|d| d.date()),
            Some(date(2024, 1, 5).date())
        );
        assert_eq!(parse_date("2024-02-30"), None);
        assert_eq!(parse_date(""), None);
    }

    #[test]
    fn test_parse_date_without_seconds() {
        let expected = date(2024, 1, 5) + chrono::Duration::minutes(9 * 60 + 5);
        assert_eq!(parse_date("2024-01-05 09:05"), Some(expected));
        assert_eq!(parse_date("2024-01-05T09:05"), Some(expected));
        assert_eq!(parse_date("01/05/2024 09:05"), Some(expected));
    }

    #[test]
    fn test_offset_keeps_wall_clock_month() {
        let parsed = parse_date("2024-03-01T00:30:00+02:00").unwrap();
        assert_eq!(parsed, date(2024, 3, 1) + chrono::Duration::minutes(30));
        assert_eq!(YearMonth::of(parsed), YearMonth::new(2024, 3));

        let csv = "date,InvoiceNumber,CustomerName,branch,route,SubCategoryName,StockName,NetAmount\n\
                   2024-03-01T00:30:00+02:00,1001,Alpha,North,R1,Detergents,Soap,10\n";
        let table = load(csv).unwrap();
        assert_eq!(YearMonth::of(table.transactions()[0].date).to_string(), "2024-03");
    }

    #[test]
    fn test_load_from_file_honours_row_limit() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE_CSV.as_bytes()).unwrap();
        file.flush().unwrap();
        let path = file.path().to_str().unwrap();

        let table = load_transactions(path, &AnalysisConfig::default()).unwrap();
        assert_eq!(table.len(), 4);

        let config = AnalysisConfig {
            max_rows: 2,
            ..AnalysisConfig::default()
        };
        assert!(matches!(
            load_transactions(path, &config),
            Err(AnalysisError::TooManyRows { limit: 2 })
        ));
    }

    #[test]
    fn test_to_frame_columns() {
        let table = load(SAMPLE_CSV).unwrap();
        let frame = table.to_frame().unwrap();

        assert_eq!(frame.height(), 4);
        assert_eq!(
            string_column(&frame, fields::CUSTOMER).unwrap(),
            vec!["Alpha Stores", "Beta Mart", "Alpha Stores", "Gamma Traders"]
        );
        assert_eq!(f64_column(&frame, fields::AMOUNT).unwrap()[2], -15.25);

        let months = i64_column(&frame, fields::MONTH).unwrap();
        assert_eq!(
            YearMonth::from_index(months[3] as i32),
            YearMonth::new(2024, 3)
        );

        let stamps = i64_column(&frame, fields::TIMESTAMP).unwrap();
        assert_eq!(from_timestamp_micros(stamps[1]), Some(table.transactions()[1].date));
    }

    #[test]
    fn test_filter_and_catalog() {
        let table = load(SAMPLE_CSV).unwrap();

        assert_eq!(table.categories(), vec!["Beverages", "Detergents"]);
        assert_eq!(table.products(None), vec!["Coffee", "Soap", "Tea"]);
        assert_eq!(table.products(Some("Beverages")), vec!["Coffee", "Tea"]);

        let soap = table.for_product("Soap").unwrap();
        assert_eq!(soap.len(), 2);

        let filter = TransactionFilter {
            category: Some("Beverages".into()),
            product: Some("Soap".into()),
        };
        assert!(table.filter(&filter).unwrap_err().is_empty_result());
    }

    #[test]
    fn test_year_month() {
        let jan = YearMonth::new(2024, 1);
        assert_eq!(jan.to_string(), "2024-01");
        assert_eq!(YearMonth::new(2024, 3).index() - jan.index(), 2);
        assert_eq!(jan.index() - YearMonth::new(2023, 11).index(), 2);
        assert!(YearMonth::new(2023, 12) < jan);
        assert_eq!(YearMonth::from_index(jan.index() - 1), YearMonth::new(2023, 12));
        assert_eq!(YearMonth::from_index(jan.index()), jan);
    }
}
