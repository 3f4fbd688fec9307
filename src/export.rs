//! Row-oriented CSV and JSON output of analysis results

use std::io::Write;

use serde::Serialize;

use crate::churn::{ChurnReport, CohortMatrix};
use crate::config::ColumnNames;
use crate::data::{Transaction, YearMonth};
use crate::rfm::{GroupKey, RfmRecord, SegmentSummary};

const RFM_HEADERS: [&str; 8] = [
    "Recency",
    "Frequency",
    "Monetary",
    "R_Score",
    "F_Score",
    "M_Score",
    "RFM_Score",
    "Segment",
];

/// Retention percentages of one cohort, indexed by offset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetentionRow {
    pub cohort: YearMonth,
    pub size: usize,
    /// `None` where the cohort had no activity at that offset.
    pub retention: Vec<Option<f64>>,
}

/// Dense view of the cohort matrix, offsets `0..=max_offset`.
pub fn retention_rows(matrix: &CohortMatrix) -> Vec<RetentionRow> {
    let width = matrix.max_offset();
    matrix
        .rows()
        .iter()
        .map(|row| RetentionRow {
            cohort: row.cohort,
            size: row.size(),
            retention: (0..=width).map(|offset| row.retention(offset)).collect(),
        })
        .collect()
}

/// Write RFM records, one row per key, key columns first.
pub fn write_rfm_csv<W: Write>(
    writer: W,
    records: &[RfmRecord],
    group_by: &[GroupKey],
    columns: &ColumnNames,
) -> crate::Result<()> {
    let mut csv = csv::Writer::from_writer(writer);

    let header = group_by
        .iter()
        .map(|key| key.column_name(columns))
        .chain(RFM_HEADERS);
    csv.write_record(header)?;

    for record in records {
        let fields = record.key.iter().cloned().chain([
            record.recency_days.to_string(),
            record.frequency.to_string(),
            record.monetary.to_string(),
            record.r_score.to_string(),
            record.f_score.to_string(),
            record.m_score.to_string(),
            record.rfm_code.clone(),
            record.segment.to_string(),
        ]);
        csv.write_record(fields)?;
    }

    csv.flush()?;
    Ok(())
}

pub fn write_segment_summary_csv<W: Write>(writer: W, summary: &[SegmentSummary]) -> crate::Result<()> {
    write_rows(writer, summary)
}

/// Write the retention matrix; absent cells are left empty.
pub fn write_retention_csv<W: Write>(writer: W, matrix: &CohortMatrix) -> crate::Result<()> {
    let mut csv = csv::Writer::from_writer(writer);

    let width = matrix.max_offset();
    let header = ["CohortMonth".to_string(), "CohortSize".to_string()]
        .into_iter()
        .chain((0..=width).map(|offset| offset.to_string()));
    csv.write_record(header)?;

    for row in retention_rows(matrix) {
        let fields = [row.cohort.to_string(), row.size.to_string()]
            .into_iter()
            .chain(
                row.retention
                    .iter()
                    .map(|cell| cell.map(|pct| format!("{pct:.1}")).unwrap_or_default()),
            );
        csv.write_record(fields)?;
    }

    csv.flush()?;
    Ok(())
}

pub fn write_churn_flags_csv<W: Write>(writer: W, report: &ChurnReport) -> crate::Result<()> {
    write_rows(writer, &report.customers)
}

pub fn write_monthly_churn_csv<W: Write>(writer: W, report: &ChurnReport) -> crate::Result<()> {
    write_rows(writer, &report.monthly)
}

pub fn write_transactions_csv<W: Write>(writer: W, transactions: &[&Transaction]) -> crate::Result<()> {
    write_rows(writer, transactions)
}

/// Pretty-printed JSON of any result value.
pub fn write_json<W: Write, T: Serialize + ?Sized>(mut writer: W, value: &T) -> crate::Result<()> {
    serde_json::to_writer_pretty(&mut writer, value)?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
}

fn write_rows<W: Write, T: Serialize>(writer: W, rows: &[T]) -> crate::Result<()> {
    let mut csv = csv::Writer::from_writer(writer);
    for row in rows {
        csv.serialize(row)?;
    }
    csv.flush()?;
    Ok(())
}
