use std::sync::Arc;

use tracing::{debug, info};

use crate::error::Result;
use crate::models::{ColumnGroup, FIRST_DATA_ROW};
use crate::positions::PositionStore;
use crate::sheet::{is_blank_row, SheetBackend};

/// Next writable row for a column scan: one past the last row holding any
/// non-blank cell, never above row 2.
///
/// Blank rows inside the data do not stop the scan, so a manually cleared
/// row in the history does not pull the cursor back into written rows.
pub fn find_next_row(values: &[Vec<String>]) -> u32 {
    let last_data_row = values
        .iter()
        .enumerate()
        .filter(|(_, cells)| !is_blank_row(cells))
        .map(|(i, _)| i as u32 + 1)
        .last()
        .unwrap_or(0);
    (last_data_row + 1).max(FIRST_DATA_ROW)
}

/// Rebuilds cursors from what the sheet actually contains.
#[derive(Clone)]
pub struct PositionDetector {
    sheet: Arc<dyn SheetBackend>,
}

impl PositionDetector {
    pub fn new(sheet: Arc<dyn SheetBackend>) -> Self {
        Self { sheet }
    }

    pub fn detect(&self, user_id: &str, group: ColumnGroup) -> Result<u32> {
        let values = self.sheet.read_range(group, None)?;
        debug!(user = user_id, %group, rows = values.len(), "scanned column range");
        let next_row = find_next_row(&values);
        info!(user = user_id, %group, next_row, "detected next free row");
        Ok(next_row)
    }

    /// Detect and persist the result as a verified cursor, lifted past open
    /// reservations and past rows handed out while the sheet was read.
    pub fn redetect(&self, user_id: &str, group: ColumnGroup, positions: &PositionStore) -> Result<u32> {
        let seen = positions.get(user_id, group)?;
        let detected = self.detect(user_id, group)?;
        positions.reconcile(user_id, group, detected, &seen)
    }
}
