use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

use crate::db::{lock, SharedConn};
use crate::error::Result;
use crate::models::{ColumnGroup, CursorState, FIRST_DATA_ROW};
use crate::reservations::highest_reserved_row;

/// Durable per-(user, column group) "next free row" cursors.
///
/// Every mutation is written through to SQLite before returning; losing an
/// increment would let the next append overwrite a row.
#[derive(Clone)]
pub struct PositionStore {
    conn: SharedConn,
}

impl PositionStore {
    pub fn new(conn: SharedConn) -> Self {
        Self { conn }
    }

    /// Persisted cursor, or an unverified cursor at row 2 if none exists.
    pub fn get(&self, user_id: &str, group: ColumnGroup) -> Result<CursorState> {
        read_cursor(&lock(&self.conn), user_id, group)
    }

    /// Overwrite `next_row`, keeping the verification stamp.
    pub fn set(&self, user_id: &str, group: ColumnGroup, next_row: u32) -> Result<()> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        let current = read_cursor(&tx, user_id, group)?;
        write_cursor(&tx, user_id, group, next_row, current.last_verified_at)?;
        tx.commit()?;
        debug!(user = user_id, %group, next_row, "cursor saved");
        Ok(())
    }

    /// Store a cursor reconstructed from the sheet and return the row saved.
    ///
    /// `seen` is the cursor as read before the sheet scan started. The saved
    /// row is lifted past every open reservation, and it only falls below the
    /// current cursor when nothing claimed or reserved a row during the scan.
    pub fn reconcile(&self, user_id: &str, group: ColumnGroup, detected: u32, seen: &CursorState) -> Result<u32> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        let current = read_cursor(&tx, user_id, group)?;

        let mut next_row = detected.max(FIRST_DATA_ROW);
        if let Some(reserved) = highest_reserved_row(&tx, user_id, group)? {
            if reserved >= next_row {
                info!(user = user_id, %group, detected, reserved, "cursor kept past open reservations");
                next_row = reserved + 1;
            }
        }
        if current != *seen && current.next_row > next_row {
            info!(user = user_id, %group, detected, current = current.next_row, "cursor moved during detection; keeping it");
            next_row = current.next_row;
        }

        write_cursor(&tx, user_id, group, next_row, Some(Utc::now()))?;
        tx.commit()?;
        debug!(user = user_id, %group, next_row, "cursor reconciled with sheet");
        Ok(next_row)
    }

    /// Drop the verification stamp so the next use re-detects from the sheet.
    pub fn invalidate(&self, user_id: &str, group: ColumnGroup) -> Result<()> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        let current = read_cursor(&tx, user_id, group)?;
        write_cursor(&tx, user_id, group, current.next_row, None)?;
        tx.commit()?;
        Ok(())
    }

    /// Atomically hand out the cursor row (never below `floor`) and advance
    /// the cursor past it.
    pub fn claim(&self, user_id: &str, group: ColumnGroup, floor: Option<u32>) -> Result<u32> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        let current = read_cursor(&tx, user_id, group)?;
        let row = current.next_row.max(floor.unwrap_or(FIRST_DATA_ROW));
        write_cursor(&tx, user_id, group, row + 1, current.last_verified_at)?;
        tx.commit()?;
        debug!(user = user_id, %group, row, "cursor row claimed");
        Ok(row)
    }
}

pub(crate) fn read_cursor(conn: &Connection, user_id: &str, group: ColumnGroup) -> Result<CursorState> {
    let row: Option<(i64, Option<String>)> = conn
        .query_row(
            "SELECT next_row, last_verified_at FROM cursors WHERE user_id = ?1 AND column_group = ?2",
            rusqlite::params![user_id, group.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(match row {
        Some((next_row, verified)) => CursorState {
            next_row: (next_row.max(FIRST_DATA_ROW as i64)) as u32,
            last_verified_at: verified.as_deref().and_then(parse_timestamp),
        },
        None => CursorState::default(),
    })
}

pub(crate) fn write_cursor(
    conn: &Connection,
    user_id: &str,
    group: ColumnGroup,
    next_row: u32,
    last_verified_at: Option<DateTime<Utc>>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO cursors (user_id, column_group, next_row, last_verified_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT (user_id, column_group) DO UPDATE SET \
         next_row = excluded.next_row, last_verified_at = excluded.last_verified_at, updated_at = excluded.updated_at",
        rusqlite::params![
            user_id,
            group.as_str(),
            next_row.max(FIRST_DATA_ROW),
            last_verified_at.map(|t| t.to_rfc3339()),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
