//! Cohort retention and churn flags for a single product

use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDateTime;
use polars::df;
use polars::prelude::{col, IntoLazy, SortMultipleOptions};
use serde::Serialize;
use tracing::{debug, info};

use crate::data::{
    f64_column, fields, from_timestamp_micros, i64_column, string_column, timestamp_micros,
    Transaction, TransactionTable, YearMonth, MICROS_PER_DAY,
};
use crate::error::AnalysisError;

/// Days counted as one month when measuring inactivity.
pub const DAYS_PER_MONTH: i64 = 30;

const COHORT: &str = "cohort_index";
const OFFSET: &str = "month_offset";
const ACTIVE: &str = "active_customers";
const LAST_PURCHASE: &str = "last_purchase_us";
const CHURNED: &str = "churned";
const CUSTOMERS: &str = "customers";
const RATE: &str = "rate";

/// Distinct active customers of one cohort, by months since first purchase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CohortRow {
    pub cohort: YearMonth,
    /// Offsets without any activity are absent, not zero.
    pub active_customers: BTreeMap<u32, usize>,
}

impl CohortRow {
    /// Number of customers whose first purchase fell in this cohort month.
    pub fn size(&self) -> usize {
        self.active_customers.get(&0).copied().unwrap_or_default()
    }

    pub fn customers_at(&self, offset: u32) -> Option<usize> {
        self.active_customers.get(&offset).copied()
    }

    /// Percentage of the cohort active at `offset`, rounded to one decimal.
    pub fn retention(&self, offset: u32) -> Option<f64> {
        let size = self.size();
        if size == 0 {
            return None;
        }
        self.customers_at(offset)
            .map(|active| round1(active as f64 / size as f64 * 100.0))
    }
}

/// Cohort month × months-since-first-purchase retention matrix.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CohortMatrix {
    rows: Vec<CohortRow>,
}

impl CohortMatrix {
    /// Rows ordered by cohort month.
    pub fn rows(&self) -> &[CohortRow] {
        &self.rows
    }

    pub fn cohort(&self, cohort: YearMonth) -> Option<&CohortRow> {
        self.rows.iter().find(|row| row.cohort == cohort)
    }

    pub fn customers(&self, cohort: YearMonth, offset: u32) -> Option<usize> {
        self.cohort(cohort)?.customers_at(offset)
    }

    pub fn retention(&self, cohort: YearMonth, offset: u32) -> Option<f64> {
        self.cohort(cohort)?.retention(offset)
    }

    /// Largest offset with data in any cohort.
    pub fn max_offset(&self) -> u32 {
        self.rows
            .iter()
            .filter_map(|row| row.active_customers.keys().next_back().copied())
            .max()
            .unwrap_or_default()
    }
}

/// Inactivity status of one customer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChurnFlag {
    pub customer_id: String,
    pub last_purchase_date: NaiveDateTime,
    pub months_since_last_purchase: i64,
    pub churned: bool,
}

/// Churn rate among customers whose last purchase fell in `month`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyChurn {
    pub month: YearMonth,
    pub customers: usize,
    pub churned: usize,
    /// `churned / customers`, in [0, 1].
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChurnReport {
    /// Reference date inactivity is measured against.
    pub latest_date: NaiveDateTime,
    pub threshold_months: u32,
    /// One flag per customer, ordered by customer id.
    pub customers: Vec<ChurnFlag>,
    /// Ordered by month.
    pub monthly: Vec<MonthlyChurn>,
}

impl ChurnReport {
    pub fn total_customers(&self) -> usize {
        self.customers.len()
    }

    pub fn churned_count(&self) -> usize {
        self.customers.iter().filter(|c| c.churned).count()
    }

    /// Fraction of customers flagged as churned.
    pub fn churned_share(&self) -> f64 {
        if self.customers.is_empty() {
            return 0.0;
        }
        self.churned_count() as f64 / self.total_customers() as f64
    }

    /// Every transaction of a churned customer, in table order.
    pub fn churned_transactions<'a>(&self, table: &'a TransactionTable) -> Vec<&'a Transaction> {
        let churned: HashSet<&str> = self
            .customers
            .iter()
            .filter(|c| c.churned)
            .map(|c| c.customer_id.as_str())
            .collect();

        table
            .iter()
            .filter(|t| churned.contains(t.customer_id.as_str()))
            .collect()
    }
}

/// Cohort retention and churn for one product.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductChurnAnalysis {
    pub product: String,
    pub cohorts: CohortMatrix,
    pub churn: ChurnReport,
}

/// Build the cohort retention matrix.
///
/// Each customer belongs to the month of their earliest transaction; a cell
/// counts the distinct customers of a cohort who bought again that many
/// calendar months later.
pub fn compute_cohorts(table: &TransactionTable) -> crate::Result<CohortMatrix> {
    ensure_not_empty(table)?;

    let df = table
        .to_frame()?
        .lazy()
        .with_column(col(fields::MONTH).min().over([col(fields::CUSTOMER)]).alias(COHORT))
        .with_column((col(fields::MONTH) - col(COHORT)).alias(OFFSET))
        .group_by([col(COHORT), col(OFFSET)])
        .agg([col(fields::CUSTOMER).n_unique().alias(ACTIVE)])
        .sort_by_exprs([col(COHORT), col(OFFSET)], SortMultipleOptions::default())
        .collect()?;

    let cohorts = i64_column(&df, COHORT)?;
    let offsets = i64_column(&df, OFFSET)?;
    let active = i64_column(&df, ACTIVE)?;

    let mut cells: BTreeMap<YearMonth, BTreeMap<u32, usize>> = BTreeMap::new();
    for ((cohort, offset), customers) in cohorts.into_iter().zip(offsets).zip(active) {
        // Non-negative: the cohort month is the customer's earliest month.
        cells
            .entry(YearMonth::from_index(cohort as i32))
            .or_default()
            .insert(offset as u32, customers as usize);
    }

    let rows: Vec<CohortRow> = cells
        .into_iter()
        .map(|(cohort, active_customers)| CohortRow {
            cohort,
            active_customers,
        })
        .collect();

    debug!(cohorts = rows.len(), "Built cohort matrix");
    Ok(CohortMatrix { rows })
}

/// Flag customers inactive for more than `threshold_months`.
///
/// Inactivity is measured from each customer's last purchase to the latest
/// date in the table, in whole 30-day months.
pub fn compute_churn(table: &TransactionTable, threshold_months: u32) -> crate::Result<ChurnReport> {
    let latest_date = table
        .latest_date()
        .ok_or_else(|| AnalysisError::EmptyResult("no transactions for the selected product".to_string()))?;
    let latest_micros = timestamp_micros(latest_date);

    let df = table
        .to_frame()?
        .lazy()
        .group_by([col(fields::CUSTOMER)])
        .agg([col(fields::TIMESTAMP).max().alias(LAST_PURCHASE)])
        .sort_by_exprs([col(fields::CUSTOMER)], SortMultipleOptions::default())
        .collect()?;

    let customer_ids = string_column(&df, fields::CUSTOMER)?;
    let last_purchases = i64_column(&df, LAST_PURCHASE)?;

    let mut customers = Vec::with_capacity(customer_ids.len());
    for (customer_id, last) in customer_ids.into_iter().zip(last_purchases) {
        let last_purchase_date = from_timestamp_micros(last).ok_or_else(|| {
            AnalysisError::InvalidParameter(format!("timestamp {last} is out of range"))
        })?;
        let months = (latest_micros - last) / MICROS_PER_DAY / DAYS_PER_MONTH;

        customers.push(ChurnFlag {
            customer_id,
            last_purchase_date,
            months_since_last_purchase: months,
            churned: months > i64::from(threshold_months),
        });
    }

    let monthly = monthly_churn(&customers)?;

    let report = ChurnReport {
        latest_date,
        threshold_months,
        customers,
        monthly,
    };
    debug!(
        customers = report.total_customers(),
        churned = report.churned_count(),
        threshold_months,
        "Computed churn flags"
    );
    Ok(report)
}

/// Restrict `table` to `product` and run both cohort and churn analysis on it.
pub fn analyze_product(
    table: &TransactionTable,
    product: &str,
    threshold_months: u32,
) -> crate::Result<ProductChurnAnalysis> {
    let rows = table.for_product(product)?;
    let cohorts = compute_cohorts(&rows)?;
    let churn = compute_churn(&rows, threshold_months)?;

    info!(
        product,
        cohorts = cohorts.rows().len(),
        customers = churn.total_customers(),
        churned = churn.churned_count(),
        "Churn analysis complete"
    );

    Ok(ProductChurnAnalysis {
        product: product.to_string(),
        cohorts,
        churn,
    })
}

/// Churn rate per month of last purchase.
fn monthly_churn(customers: &[ChurnFlag]) -> crate::Result<Vec<MonthlyChurn>> {
    let months: Vec<i32> = customers
        .iter()
        .map(|flag| YearMonth::of(flag.last_purchase_date).index())
        .collect();
    let churned: Vec<i64> = customers.iter().map(|flag| i64::from(flag.churned)).collect();

    let df = df!(fields::MONTH => months, CHURNED => churned)?
        .lazy()
        .group_by([col(fields::MONTH)])
        .agg([
            col(CHURNED).count().alias(CUSTOMERS),
            col(CHURNED).sum().alias(CHURNED),
            col(CHURNED).mean().alias(RATE),
        ])
        .sort_by_exprs([col(fields::MONTH)], SortMultipleOptions::default())
        .collect()?;

    let months = i64_column(&df, fields::MONTH)?;
    let counts = i64_column(&df, CUSTOMERS)?;
    let churned = i64_column(&df, CHURNED)?;
    let rates = f64_column(&df, RATE)?;

    Ok(months
        .into_iter()
        .zip(counts)
        .zip(churned)
        .zip(rates)
        .map(|(((month, customers), churned), rate)| MonthlyChurn {
            month: YearMonth::from_index(month as i32),
            customers: customers as usize,
            churned: churned as usize,
            rate,
        })
        .collect())
}

fn ensure_not_empty(table: &TransactionTable) -> crate::Result<()> {
    if table.is_empty() {
        return Err(AnalysisError::EmptyResult(
            "no transactions for the selected product".to_string(),
        ));
    }
    Ok(())
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::HashMap;

    fn at(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn sale(customer: &str, date: NaiveDateTime, product: &str) -> Transaction {
        Transaction {
            date,
            invoice_id: format!("{customer}-{date}"),
            customer_id: customer.to_string(),
            branch: "North".to_string(),
            route: "R1".to_string(),
            category: "Detergents".to_string(),
            product: product.to_string(),
            amount: 10.0,
        }
    }

    /// Ten customers start buying Soap in January 2024; four come back in February.
    fn soap_table() -> TransactionTable {
        let mut rows = Vec::new();
        for i in 1..=10 {
            rows.push(sale(&format!("S{i:02}"), at(2024, 1, 10), "Soap"));
        }
        for i in 1..=4 {
            rows.push(sale(&format!("S{i:02}"), at(2024, 2, 15), "Soap"));
        }
        rows.push(sale("S01", at(2024, 2, 20), "Tea"));
        TransactionTable::new(rows)
    }

    #[test]
    fn test_soap_cohort_retention() {
        let soap = soap_table().for_product("Soap").unwrap();
        let matrix = compute_cohorts(&soap).unwrap();
        let jan = YearMonth::new(2024, 1);

        assert_eq!(matrix.rows().len(), 1);
        assert_eq!(matrix.customers(jan, 0), Some(10));
        assert_eq!(matrix.customers(jan, 1), Some(4));
        assert_eq!(matrix.retention(jan, 0), Some(100.0));
        assert_eq!(matrix.retention(jan, 1), Some(40.0));
        assert_eq!(matrix.retention(jan, 2), None);
        assert_eq!(matrix.max_offset(), 1);
    }

    #[test]
    fn test_cohorts_by_first_purchase_month() {
        let table = TransactionTable::new(vec![
            sale("A", at(2023, 11, 3), "Soap"),
            sale("A", at(2023, 11, 28), "Soap"),
            sale("A", at(2024, 2, 1), "Soap"),
            sale("B", at(2023, 12, 31), "Soap"),
            sale("B", at(2024, 1, 1), "Soap"),
            sale("C", at(2024, 1, 15), "Soap"),
        ]);
        let matrix = compute_cohorts(&table).unwrap();

        let nov = YearMonth::new(2023, 11);
        let dec = YearMonth::new(2023, 12);
        let jan = YearMonth::new(2024, 1);

        let cohorts: Vec<YearMonth> = matrix.rows().iter().map(|r| r.cohort).collect();
        assert_eq!(cohorts, vec![nov, dec, jan]);

        // Repeat purchases within the same month count once.
        assert_eq!(matrix.customers(nov, 0), Some(1));
        assert_eq!(matrix.customers(nov, 1), None);
        assert_eq!(matrix.customers(nov, 3), Some(1));
        // One day later is already the next calendar month.
        assert_eq!(matrix.customers(dec, 1), Some(1));
        assert_eq!(matrix.cohort(jan).unwrap().size(), 1);
    }

    #[test]
    fn test_single_purchase_cohort_has_no_later_cells() {
        let table = TransactionTable::new(vec![sale("Solo", at(2024, 5, 2), "Soap")]);
        let matrix = compute_cohorts(&table).unwrap();
        let may = YearMonth::new(2024, 5);

        assert_eq!(matrix.retention(may, 0), Some(100.0));
        assert_eq!(matrix.retention(may, 1), None);
        assert_eq!(matrix.cohort(may).unwrap().active_customers.len(), 1);
    }

    #[test]
    fn test_baseline_and_percentage_bounds() {
        let table = soap_table();
        let matrix = compute_cohorts(&table).unwrap();

        let mut first_month: HashMap<&str, YearMonth> = HashMap::new();
        for t in table.iter() {
            let month = YearMonth::of(t.date);
            first_month
                .entry(t.customer_id.as_str())
                .and_modify(|m| *m = (*m).min(month))
                .or_insert(month);
        }

        for row in matrix.rows() {
            let expected = first_month.values().filter(|&&m| m == row.cohort).count();
            assert_eq!(row.size(), expected);

            for (&offset, &active) in &row.active_customers {
                assert!(active <= row.size());
                let pct = row.retention(offset).unwrap();
                assert!((0.0..=100.0).contains(&pct));
            }
        }
    }

    #[test]
    fn test_retention_rounds_to_one_decimal() {
        let mut rows: Vec<Transaction> = (1..=3)
            .map(|i| sale(&format!("C{i}"), at(2024, 1, 5), "Soap"))
            .collect();
        rows.push(sale("C1", at(2024, 2, 5), "Soap"));
        let matrix = compute_cohorts(&TransactionTable::new(rows)).unwrap();

        assert_eq!(matrix.retention(YearMonth::new(2024, 1), 1), Some(33.3));
    }

    #[test]
    fn test_ninety_five_days_is_three_months_not_churned() {
        let table = TransactionTable::new(vec![
            sale("Late", at(2024, 1, 1), "Soap"),
            sale("Recent", at(2024, 4, 5), "Soap"),
        ]);

        let report = compute_churn(&table, 3).unwrap();
        let late = &report.customers[0];
        assert_eq!(late.customer_id, "Late");
        assert_eq!(late.months_since_last_purchase, 3);
        assert!(!late.churned);
        assert_eq!(report.churned_count(), 0);

        let report = compute_churn(&table, 2).unwrap();
        assert!(report.customers[0].churned);
        assert!(!report.customers[1].churned);
    }

    #[test]
    fn test_lower_threshold_only_adds_churned_customers() {
        let table = TransactionTable::new(vec![
            sale("A", at(2023, 1, 1), "Soap"),
            sale("B", at(2023, 6, 1), "Soap"),
            sale("C", at(2023, 10, 1), "Soap"),
            sale("D", at(2023, 12, 1), "Soap"),
            sale("E", at(2024, 1, 1), "Soap"),
        ]);

        let mut previous: HashSet<String> = HashSet::new();
        for threshold in (0..=12).rev() {
            let report = compute_churn(&table, threshold).unwrap();
            let churned: HashSet<String> = report
                .customers
                .iter()
                .filter(|c| c.churned)
                .map(|c| c.customer_id.clone())
                .collect();
            assert!(previous.is_subset(&churned));
            previous = churned;
        }
        assert_eq!(previous.len(), 4);
    }

    #[test]
    fn test_monthly_churn_buckets_by_last_purchase() {
        let table = TransactionTable::new(vec![
            sale("A", at(2023, 6, 5), "Soap"),
            sale("B", at(2023, 6, 20), "Soap"),
            sale("B", at(2024, 1, 2), "Soap"),
            sale("C", at(2023, 7, 1), "Soap"),
            sale("D", at(2024, 1, 30), "Soap"),
        ]);
        let report = compute_churn(&table, 3).unwrap();

        let months: Vec<String> = report.monthly.iter().map(|m| m.month.to_string()).collect();
        assert_eq!(months, vec!["2023-06", "2023-07", "2024-01"]);

        let total: usize = report.monthly.iter().map(|m| m.customers).sum();
        assert_eq!(total, report.total_customers());

        assert_eq!(report.monthly[0].customers, 1);
        assert_eq!(report.monthly[0].rate, 1.0);
        assert_eq!(report.monthly[2].customers, 2);
        assert_eq!(report.monthly[2].rate, 0.0);
        assert_eq!(report.churned_count(), 2);
        assert_eq!(report.churned_share(), 0.5);
    }

    #[test]
    fn test_churned_transactions() {
        let table = TransactionTable::new(vec![
            sale("A", at(2023, 1, 1), "Soap"),
            sale("A", at(2023, 1, 9), "Soap"),
            sale("B", at(2024, 1, 1), "Soap"),
        ]);
        let report = compute_churn(&table, 3).unwrap();
        let rows = report.churned_transactions(&table);

        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|t| t.customer_id == "A"));
    }

    #[test]
    fn test_empty_product_is_empty_result() {
        let err = analyze_product(&soap_table(), "Shampoo", 3).unwrap_err();
        assert!(err.is_empty_result());

        let empty = TransactionTable::default();
        assert!(compute_cohorts(&empty).unwrap_err().is_empty_result());
        assert!(compute_churn(&empty, 3).unwrap_err().is_empty_result());
    }

    #[test]
    fn test_analyze_product_scopes_to_product() {
        let analysis = analyze_product(&soap_table(), "Soap", 3).unwrap();
        assert_eq!(analysis.product, "Soap");
        assert_eq!(analysis.churn.total_customers(), 10);
        // The Tea purchase on Feb 20 does not move Soap's reference date.
        assert_eq!(analysis.churn.latest_date, at(2024, 2, 15));
    }
}
