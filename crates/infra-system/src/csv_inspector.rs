// Travel history CSV inspector
// Checks an uploaded export is readable; journey reconciliation happens elsewhere

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::BTreeSet;
use tracing::{info, warn};
use transit_core::domain::{ImportBatch, OutcomeFlags};
use transit_core::error::{AppError, Result};
use transit_core::port::BatchProcessor;

pub const SEQUENCE_NUMBER: &str = "Sequence Number";
pub const TRANSACTION_DATE: &str = "Transaction Date";
pub const SITE: &str = "Site";
pub const TRANSACTION_TYPE: &str = "Transaction Type";
pub const REMAINING_TRIPS: &str = "Remaining Trips";
pub const TRANSACTION_VALUE: &str = "Transaction Value";
pub const PAYG_BALANCE: &str = "PAYG Balance";

pub const REQUIRED_COLUMNS: [&str; 7] = [
    SEQUENCE_NUMBER,
    TRANSACTION_DATE,
    SITE,
    TRANSACTION_TYPE,
    REMAINING_TRIPS,
    TRANSACTION_VALUE,
    PAYG_BALANCE,
];

const DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y"];

fn clean_field(field: String) -> String {
    field.replace('\u{00A0}', " ").trim().to_string()
}

/// Split CSV text into records, honouring double quotes and `""` escapes
///
/// Line breaks inside quotes stay part of the field. Blank lines yield no record.
fn split_records(text: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    let mut end_record = |fields: &mut Vec<String>, current: &mut String| {
        fields.push(clean_field(std::mem::take(current)));
        let record = std::mem::take(fields);
        if !(record.len() == 1 && record[0].is_empty()) {
            records.push(record);
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(clean_field(std::mem::take(&mut current))),
            '\r' if !in_quotes && chars.peek() == Some(&'\n') => {}
            '\n' if !in_quotes => end_record(&mut fields, &mut current),
            _ => current.push(c),
        }
    }
    if !current.is_empty() || !fields.is_empty() {
        end_record(&mut fields, &mut current);
    }
    records
}

fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    DATE_TIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(value, f).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|f| NaiveDate::parse_from_str(value, f).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Amounts may carry a currency prefix and thousands separators ("R 1,250.00")
fn parse_amount(value: &str) -> Option<f64> {
    let cleaned: String = value
        .trim_start_matches(['R', 'r'])
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',')
        .collect();
    if cleaned.is_empty() {
        return Some(0.0);
    }
    cleaned.parse().ok()
}

fn parse_count(value: &str) -> Option<i32> {
    if value.is_empty() {
        return Some(0);
    }
    value.parse().ok()
}

struct ColumnIndex([usize; 7]);

impl ColumnIndex {
    fn from_header(header: &[String]) -> Result<Self> {
        let mut positions = [0usize; 7];
        let mut missing = Vec::new();

        for (slot, column) in positions.iter_mut().zip(REQUIRED_COLUMNS) {
            match header.iter().position(|h| h.eq_ignore_ascii_case(column)) {
                Some(i) => *slot = i,
                None => missing.push(column),
            }
        }

        if !missing.is_empty() {
            return Err(AppError::Validation(format!(
                "Travel history header is missing columns: {}",
                missing.join(", ")
            )));
        }
        Ok(Self(positions))
    }

    fn get<'a>(&self, row: &'a [String], column: usize) -> Option<&'a str> {
        row.get(self.0[column]).map(String::as_str)
    }

    /// Sequence number of a well-formed row
    fn validate(&self, row: &[String]) -> Option<i32> {
        let sequence: i32 = self.get(row, 0)?.parse().ok()?;
        parse_timestamp(self.get(row, 1)?)?;
        if self.get(row, 2)?.is_empty() || self.get(row, 3)?.is_empty() {
            return None;
        }
        parse_count(self.get(row, 4)?)?;
        parse_amount(self.get(row, 5)?)?;
        parse_amount(self.get(row, 6)?)?;
        Some(sequence)
    }
}

/// Row counts for one inspected file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InspectionSummary {
    pub unique_rows: usize,
    pub malformed_rows: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CsvHistoryInspector;

impl CsvHistoryInspector {
    pub fn new() -> Self {
        Self
    }

    pub fn inspect(&self, content: &[u8]) -> Result<InspectionSummary> {
        let text = std::str::from_utf8(content)
            .map_err(|e| AppError::Validation(format!("Travel history is not UTF-8: {}", e)))?;
        let text = text.trim_start_matches('\u{feff}');

        let mut records = split_records(text).into_iter();
        let header = records
            .next()
            .ok_or_else(|| AppError::Validation("Travel history file has no header".to_string()))?;
        let columns = ColumnIndex::from_header(&header)?;

        // Later rows win on a repeated sequence number
        let mut sequences = BTreeSet::new();
        let mut malformed_rows = 0;
        for record in records {
            match columns.validate(&record) {
                Some(sequence) => {
                    sequences.insert(sequence);
                }
                None => malformed_rows += 1,
            }
        }

        Ok(InspectionSummary {
            unique_rows: sequences.len(),
            malformed_rows,
        })
    }
}

#[async_trait]
impl BatchProcessor for CsvHistoryInspector {
    async fn process(&self, batch: &ImportBatch, content: Vec<u8>) -> Result<OutcomeFlags> {
        let summary = self.inspect(&content)?;

        if summary.unique_rows == 0 {
            return Err(AppError::Execution(format!(
                "No readable travel history rows in {} ({} malformed)",
                batch.blob_name(),
                summary.malformed_rows
            )));
        }

        let mut flags = OutcomeFlags::NONE;
        if summary.malformed_rows > 0 {
            warn!(
                batch_id = %batch.id(),
                malformed_rows = summary.malformed_rows,
                "Travel history contains malformed rows"
            );
            flags |= OutcomeFlags::PARTIAL_SUCCEEDED;
        }

        info!(
            batch_id = %batch.id(),
            rows = summary.unique_rows,
            malformed_rows = summary.malformed_rows,
            "Travel history inspected"
        );
        Ok(flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio_test::assert_err;
    use uuid::Uuid;

    const HEADER: &str = "Sequence Number,Transaction Date,Site,Transaction Type,Remaining Trips,Transaction Value,PAYG Balance";

    fn batch() -> ImportBatch {
        ImportBatch::create(
            Uuid::now_v7(),
            Uuid::now_v7(),
            "transport-import",
            "history.csv",
            "AB".repeat(32),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_split_records_handles_quotes() {
        assert_eq!(
            split_records(r#"1,"Sandton, Station","say ""hi""",  x "#),
            vec![vec!["1", "Sandton, Station", r#"say "hi""#, "x"]]
        );
    }

    #[test]
    fn test_quoted_line_breaks_stay_in_one_record() {
        let records = split_records("a,\"Park\r\nStation\",b\r\n\r\n  \nc,d");
        assert_eq!(
            records,
            vec![vec!["a", "Park\r\nStation", "b"], vec!["c", "d"]]
        );
    }

    #[test]
    fn test_multi_line_site_counts_as_one_row() {
        let csv = format!(
            "{}\n1,2024-03-01 07:15,\"Sandton\nNorth Entrance\",Check In,0,0,100\n2,2024-03-01 07:45,Park,Check Out,0,-32.10,67.90\n",
            HEADER
        );
        let summary = CsvHistoryInspector::new().inspect(csv.as_bytes()).unwrap();
        assert_eq!(
            summary,
            InspectionSummary {
                unique_rows: 2,
                malformed_rows: 0
            }
        );
    }

    #[tokio::test]
    async fn test_clean_file_has_no_flags() {
        let csv = format!(
            "\u{feff}{}\r\n1,2024-03-01 07:15:00,Sandton,Check In,0,\"R 0.00\",\"R 1,250.50\"\r\n2,2024-03-01 07:45:00,Park,Check Out,0,-32.10,1218.40\r\n",
            HEADER
        );
        let flags = CsvHistoryInspector::new()
            .process(&batch(), csv.into_bytes())
            .await
            .unwrap();
        assert!(flags.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_rows_flag_partial_success() {
        let csv = format!(
            "{}\n1,2024-03-01 07:15,Sandton,Check In,0,0,100\nnot-a-number,yesterday,,,,,\n",
            HEADER
        );
        let flags = CsvHistoryInspector::new()
            .process(&batch(), csv.into_bytes())
            .await
            .unwrap();
        assert!(flags.contains(OutcomeFlags::PARTIAL_SUCCEEDED));
    }

    #[tokio::test]
    async fn test_missing_header_columns_fail() {
        let err = CsvHistoryInspector::new()
            .process(&batch(), b"Date,Amount\n2024-01-01,5\n".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(ref m) if m.contains(SEQUENCE_NUMBER)));
    }

    #[tokio::test]
    async fn test_no_readable_rows_fail() {
        let csv = format!("{}\nbroken,row\n", HEADER);
        let err = CsvHistoryInspector::new()
            .process(&batch(), csv.into_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Execution(_)));

        assert_err!(CsvHistoryInspector::new().inspect(b""));
    }

    #[test]
    fn test_repeated_sequence_numbers_count_once() {
        let csv = format!(
            "{}\n7,2024-03-01,Rosebank,Check In,2,0,0\n7,2024-03-01,Rosebank,Check In,2,0,0\n",
            HEADER.replace("Transaction Date", "Transaction\u{00A0}Date")
        );
        let summary = CsvHistoryInspector::new().inspect(csv.as_bytes()).unwrap();
        assert_eq!(
            summary,
            InspectionSummary {
                unique_rows: 1,
                malformed_rows: 0
            }
        );
    }
}
