use std::path::Path;

use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::Result;
use crate::models::ParsedRow;

/// Columns the statement export must have for a row to be read.
const MIN_COLUMNS: usize = 18;
const COL_DATE: usize = 0;
const COL_COUNTERPARTY: usize = 3;
const COL_AMOUNT: usize = 10;
const COL_REMITTANCE: usize = 17;

/// Parse an amount with either a decimal comma or point. Unparseable
/// values read as zero.
pub fn parse_amount(raw: &str) -> f64 {
    let s = raw.trim().replace('"', "").replace(',', ".");
    s.parse().unwrap_or(0.0)
}

fn clean(field: &str) -> String {
    field.trim().trim_matches('\'').trim().to_string()
}

pub fn compute_checksum(file_path: &Path) -> Result<String> {
    let data = std::fs::read(file_path)?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(hex::encode(hasher.finalize()))
}

/// Read a fixed-column bank statement export. Short rows and rows without a
/// booking date are skipped.
pub fn parse_statement(file_path: &Path) -> Result<Vec<ParsedRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(file_path)?;

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        if record.len() < MIN_COLUMNS || record[COL_DATE].trim().is_empty() {
            debug!(line = line + 1, columns = record.len(), "skipping statement line");
            continue;
        }
        rows.push(ParsedRow {
            date: clean(&record[COL_DATE]),
            amount: parse_amount(&record[COL_AMOUNT]),
            counterparty: clean(&record[COL_COUNTERPARTY]),
            remittance: clean(&record[COL_REMITTANCE]),
        });
    }
    Ok(rows)
}

pub fn already_imported(conn: &Connection, user_id: &str, checksum: &str) -> Result<bool> {
    let mut stmt = conn.prepare("SELECT 1 FROM imports WHERE checksum = ?1 AND user_id = ?2")?;
    Ok(stmt.exists(rusqlite::params![checksum, user_id])?)
}

pub fn record_import(
    conn: &Connection,
    file_path: &Path,
    user_id: &str,
    record_count: usize,
    checksum: &str,
) -> Result<()> {
    let filename = file_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    conn.execute(
        "INSERT INTO imports (filename, user_id, record_count, checksum) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![filename, user_id, record_count as i64, checksum],
    )?;
    info!(file = %filename, user = user_id, record_count, "import recorded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{get_connection, init_db};

    const SALARY: &str = "24-04-2025,NL24ASNB8844501082,NL72RABO0363944990,Anamata B.V.,,,,EUR,314.10,EUR,3637.65,24-04-2025,24-04-2025,8809,OVS,979142,,'5-3215930-01-07-Anamata B.V.-SALARISBETALING PERIODE 4',9,'Salaris'";

    fn write_statement(dir: &Path, lines: &[&str]) -> std::path::PathBuf {
        let path = dir.join("statement.csv");
        std::fs::write(&path, lines.join("\n")).unwrap();
        path
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("-80,68"), -80.68);
        assert_eq!(parse_amount("314.00"), 314.0);
        assert_eq!(parse_amount("abc"), 0.0);
    }

    #[test]
    fn test_parse_statement_reads_fixed_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_statement(dir.path(), &[SALARY]);
        let rows = parse_statement(&path).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].date, "24-04-2025");
        assert_eq!(rows[0].counterparty, "Anamata B.V.");
        assert_eq!(rows[0].amount, 3637.65);
        assert!(rows[0].remittance.starts_with("5-3215930"));
    }

    #[test]
    fn test_short_and_undated_rows_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let undated = SALARY.replacen("24-04-2025", "", 1);
        let path = write_statement(dir.path(), &["a,b,c", &undated, SALARY]);
        assert_eq!(parse_statement(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_file_detection() {
        let dir = tempfile::tempdir().unwrap();
        let conn = get_connection(&dir.path().join("test.db")).unwrap();
        init_db(&conn).unwrap();
        let path = write_statement(dir.path(), &[SALARY]);
        let sum = compute_checksum(&path).unwrap();
        assert_eq!(sum.len(), 64);

        assert!(!already_imported(&conn, "u1", &sum).unwrap());
        record_import(&conn, &path, "u1", 1, &sum).unwrap();
        assert!(already_imported(&conn, "u1", &sum).unwrap());
        assert!(!already_imported(&conn, "u2", &sum).unwrap());
    }
}
