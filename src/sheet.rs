use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info};

use crate::error::{LedgerError, Result};
use crate::models::{ColumnGroup, Payload};

/// Longest description written into a single cell.
pub const MAX_DESCRIPTION_LEN: usize = 500;

pub const HEADERS: [&str; 4] = ["Date", "Amount", "Description", "Category"];

/// The remote tabular store the ledger is appended to.
///
/// Rows are 1-based like the sheet itself; row 1 carries headers.
pub trait SheetBackend: Send + Sync {
    /// Cell values of `group`'s columns for `rows`, or for every row of the
    /// sheet when `rows` is `None`. Missing cells come back as empty strings.
    fn read_range(&self, group: ColumnGroup, rows: Option<RangeInclusive<u32>>) -> Result<Vec<Vec<String>>>;

    /// Write one logical row into `group`'s columns.
    fn write_row(&self, group: ColumnGroup, row: u32, values: &[String]) -> Result<()>;
}

/// Values for one sheet row: date, unsigned amount, description, category.
pub fn format_row(payload: &Payload) -> Vec<String> {
    vec![
        payload.date.trim().to_string(),
        format!("{:.2}", payload.amount.abs()),
        truncate_description(&payload.description),
        payload.category.clone(),
    ]
}

pub fn truncate_description(desc: &str) -> String {
    let desc = desc.trim();
    if desc.is_empty() {
        return "Unknown Transaction".to_string();
    }
    if desc.chars().count() <= MAX_DESCRIPTION_LEN {
        return desc.to_string();
    }
    let kept: String = desc.chars().take(MAX_DESCRIPTION_LEN - 3).collect();
    format!("{kept}...")
}

pub fn is_blank_row(cells: &[String]) -> bool {
    cells.iter().all(|c| c.trim().is_empty())
}

pub(crate) fn slice_grid(grid: &[Vec<String>], group: ColumnGroup, rows: Option<RangeInclusive<u32>>) -> Vec<Vec<String>> {
    let (first, last) = group.columns();
    let rows = rows.unwrap_or(1..=grid.len() as u32);
    rows.map(|r| {
        let line = grid.get(r as usize - 1);
        (first..=last)
            .map(|c| line.and_then(|l| l.get(c)).cloned().unwrap_or_default())
            .collect()
    })
    .collect()
}

pub(crate) fn set_row(grid: &mut Vec<Vec<String>>, group: ColumnGroup, row: u32, values: &[String]) -> Result<()> {
    if row == 0 {
        return Err(LedgerError::InvalidRequest("sheet rows start at 1".into()));
    }
    if values.len() > group.width() {
        return Err(LedgerError::InvalidRequest(format!(
            "{} values do not fit {}",
            values.len(),
            group.range_label(row)
        )));
    }
    let (first, _) = group.columns();
    let idx = row as usize - 1;
    if grid.len() <= idx {
        grid.resize(idx + 1, Vec::new());
    }
    let line = &mut grid[idx];
    if line.len() < first + values.len() {
        line.resize(first + values.len(), String::new());
    }
    for (offset, value) in values.iter().enumerate() {
        line[first + offset] = value.clone();
    }
    Ok(())
}

/// Ledger sheet stored as a CSV grid on disk. Column A is unused, expenses
/// live in B..E and income in G..J.
pub struct CsvSheet {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CsvSheet {
    /// Open an existing sheet. A missing file is a configuration error.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(LedgerError::Config(format!(
                "ledger sheet not found: {}",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    /// Create the sheet with a header row if it does not exist yet.
    pub fn create(path: &Path) -> Result<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut grid = Vec::new();
            let headers: Vec<String> = HEADERS.iter().map(|h| h.to_string()).collect();
            for group in ColumnGroup::ALL {
                set_row(&mut grid, group, 1, &headers)?;
            }
            save_grid(path, &grid)?;
            info!(path = %path.display(), "created ledger sheet");
        }
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        match self.lock.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl SheetBackend for CsvSheet {
    fn read_range(&self, group: ColumnGroup, rows: Option<RangeInclusive<u32>>) -> Result<Vec<Vec<String>>> {
        let _guard = self.guard();
        let grid = load_grid(&self.path)?;
        Ok(slice_grid(&grid, group, rows))
    }

    fn write_row(&self, group: ColumnGroup, row: u32, values: &[String]) -> Result<()> {
        let _guard = self.guard();
        let mut grid = load_grid(&self.path)?;
        set_row(&mut grid, group, row, values)?;
        save_grid(&self.path, &grid)?;
        debug!(range = %group.range_label(row), "sheet row written");
        Ok(())
    }
}

fn load_grid(path: &Path) -> Result<Vec<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;
    let mut grid = Vec::new();
    for record in reader.records() {
        let record = record?;
        grid.push(record.iter().map(|c| c.to_string()).collect());
    }
    Ok(grid)
}

/// Replace the file in one rename so readers never see a half-written sheet.
fn save_grid(path: &Path, grid: &[Vec<String>]) -> Result<()> {
    let tmp = path.with_extension("csv.tmp");
    {
        let mut writer = csv::WriterBuilder::new().flexible(true).from_path(&tmp)?;
        for line in grid {
            if line.is_empty() {
                // csv refuses empty records; a single empty field keeps the row
                writer.write_record([""])?;
            } else {
                writer.write_record(line)?;
            }
        }
        writer.flush()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}
