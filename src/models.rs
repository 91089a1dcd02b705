use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};

/// Row 1 of the sheet holds the column headers.
pub const FIRST_DATA_ROW: u32 = 2;

/// Disjoint column regions of the ledger sheet, each with its own cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnGroup {
    Expense,
    Income,
}

impl ColumnGroup {
    pub const ALL: [ColumnGroup; 2] = [ColumnGroup::Expense, ColumnGroup::Income];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expense => "expense",
            Self::Income => "income",
        }
    }

    /// Zero-based (first, last) column indices, inclusive. Expense is B..E,
    /// income is G..J.
    pub fn columns(&self) -> (usize, usize) {
        match self {
            Self::Expense => (1, 4),
            Self::Income => (6, 9),
        }
    }

    pub fn width(&self) -> usize {
        let (first, last) = self.columns();
        last - first + 1
    }

    /// A1-style label for a single row of this group, e.g. `B5:E5`.
    pub fn range_label(&self, row: u32) -> String {
        let (first, last) = self.columns();
        format!("{}{row}:{}{row}", column_letter(first), column_letter(last))
    }

    /// Income when the signed amount is positive, expense otherwise.
    pub fn for_amount(amount: f64) -> Self {
        if amount > 0.0 {
            Self::Income
        } else {
            Self::Expense
        }
    }
}

fn column_letter(idx: usize) -> char {
    (b'A' + idx as u8) as char
}

impl fmt::Display for ColumnGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColumnGroup {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "expense" | "expenses" => Ok(Self::Expense),
            "income" => Ok(Self::Income),
            other => Err(LedgerError::UnknownGroup(other.to_string())),
        }
    }
}

/// A categorized transaction ready to be written as one sheet row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub date: String,
    /// Signed amount; negative for money going out.
    pub amount: f64,
    pub description: String,
    pub category: String,
}

impl Payload {
    pub fn validate(&self) -> Result<()> {
        if self.date.trim().is_empty() {
            return Err(LedgerError::InvalidRequest("payload has no date".into()));
        }
        if !self.amount.is_finite() {
            return Err(LedgerError::InvalidRequest(format!(
                "payload amount is not a number: {}",
                self.amount
            )));
        }
        if self.category.trim().is_empty() {
            return Err(LedgerError::InvalidRequest("payload has no category".into()));
        }
        Ok(())
    }
}

/// How a pending write resolves its target row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum WriteMode {
    /// Fully categorized; appended at the cursor.
    Direct,
    /// Provisional row written into the row reserved at enqueue time.
    Placeholder { cache_id: String },
    /// Final categorization overwriting a placeholder's reserved row.
    Replacement { cache_id: String, reserved_row: u32 },
}

impl WriteMode {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Placeholder { .. } => "placeholder",
            Self::Replacement { .. } => "replacement",
        }
    }

    pub fn cache_id(&self) -> Option<&str> {
        match self {
            Self::Direct => None,
            Self::Placeholder { cache_id } | Self::Replacement { cache_id, .. } => Some(cache_id),
        }
    }
}

/// Unit of work consumed by the upload worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub user_id: String,
    pub group: ColumnGroup,
    pub payload: Payload,
    pub mode: WriteMode,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingWrite {
    pub fn new(user_id: &str, group: ColumnGroup, payload: Payload, mode: WriteMode) -> Self {
        Self {
            user_id: user_id.to_string(),
            group,
            payload,
            mode,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CursorState {
    pub next_row: u32,
    /// `None` until the cursor has been detected from the sheet at least once.
    pub last_verified_at: Option<DateTime<Utc>>,
}

impl CursorState {
    pub fn is_verified(&self) -> bool {
        self.last_verified_at.is_some()
    }
}

impl Default for CursorState {
    fn default() -> Self {
        Self {
            next_row: FIRST_DATA_ROW,
            last_verified_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub cache_id: String,
    pub user_id: String,
    pub group: ColumnGroup,
    pub row: u32,
    /// The placeholder transaction, kept so a later review can finish it.
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
}

/// A write the worker dropped, kept for an operator-driven retry.
#[derive(Debug, Clone)]
pub struct FailedWrite {
    pub id: i64,
    pub write: PendingWrite,
    pub error: String,
    pub failed_at: String,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub id: i64,
    pub pattern: String,
    pub match_type: String,
    pub group: ColumnGroup,
    pub description: Option<String>,
    pub category: String,
    pub priority: i64,
    pub hit_count: i64,
}

/// Intermediate representation from the statement parser before categorization.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRow {
    pub date: String,
    pub amount: f64,
    pub counterparty: String,
    pub remittance: String,
}

impl ParsedRow {
    /// Fallback sheet description: counterparty and remittance joined.
    pub fn default_description(&self) -> String {
        let parts: Vec<&str> = [self.counterparty.as_str(), self.remittance.as_str()]
            .into_iter()
            .filter(|p| !p.is_empty())
            .collect();
        if parts.is_empty() {
            "Unknown Transaction".to_string()
        } else {
            parts.join(" - ")
        }
    }
}
