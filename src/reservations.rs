use chrono::Utc;
use rand::RngCore;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

use crate::db::{lock, SharedConn};
use crate::error::{LedgerError, Result};
use crate::models::{ColumnGroup, Payload, Reservation};
use crate::positions::{parse_timestamp, read_cursor, write_cursor};

/// Binds placeholder cache ids to the sheet rows handed out for them.
#[derive(Clone)]
pub struct ReservationLedger {
    conn: SharedConn,
}

/// Short opaque id correlating a placeholder with its replacement.
pub fn new_cache_id() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl ReservationLedger {
    pub fn new(conn: SharedConn) -> Self {
        Self { conn }
    }

    /// Take the current cursor row for a new placeholder and advance the
    /// cursor past it, in one transaction under the connection lock.
    pub fn reserve(&self, user_id: &str, group: ColumnGroup, payload: &Payload) -> Result<Reservation> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;

        let mut cache_id = new_cache_id();
        while cache_id_exists(&tx, &cache_id)? {
            cache_id = new_cache_id();
        }

        let cursor = read_cursor(&tx, user_id, group)?;
        let row = cursor.next_row;
        let created_at = Utc::now();
        tx.execute(
            "INSERT INTO reservations (cache_id, user_id, column_group, row, payload, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                cache_id,
                user_id,
                group.as_str(),
                row,
                serde_json::to_string(payload)?,
                created_at.to_rfc3339(),
            ],
        )?;
        write_cursor(&tx, user_id, group, row + 1, cursor.last_verified_at)?;
        tx.commit()?;

        info!(user = user_id, %group, row, cache_id = %cache_id, "reserved row for placeholder");
        Ok(Reservation {
            cache_id,
            user_id: user_id.to_string(),
            group,
            row,
            payload: payload.clone(),
            created_at,
        })
    }

    pub fn resolve(&self, cache_id: &str) -> Result<Option<u32>> {
        Ok(self.get(cache_id)?.map(|r| r.row))
    }

    pub fn get(&self, cache_id: &str) -> Result<Option<Reservation>> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT cache_id, user_id, column_group, row, payload, created_at \
             FROM reservations WHERE cache_id = ?1",
        )?;
        let raw = stmt.query_row([cache_id], raw_reservation).optional()?;
        raw.map(decode).transpose()
    }

    /// Remove a reservation. Releasing an unknown id is a no-op; returns
    /// whether anything was removed.
    pub fn release(&self, cache_id: &str) -> Result<bool> {
        let removed = lock(&self.conn).execute("DELETE FROM reservations WHERE cache_id = ?1", [cache_id])?;
        if removed > 0 {
            debug!(cache_id, "reservation released");
        }
        Ok(removed > 0)
    }

    /// Open reservations for a user, oldest first.
    pub fn list(&self, user_id: &str) -> Result<Vec<Reservation>> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT cache_id, user_id, column_group, row, payload, created_at \
             FROM reservations WHERE user_id = ?1 ORDER BY created_at, row",
        )?;
        let raws = stmt
            .query_map([user_id], raw_reservation)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        raws.into_iter().map(decode).collect()
    }

    /// Discard every open reservation of a user. The cursor is not rewound.
    pub fn clear_user(&self, user_id: &str) -> Result<usize> {
        Ok(lock(&self.conn).execute("DELETE FROM reservations WHERE user_id = ?1", [user_id])?)
    }
}

/// Highest row still held by an open reservation of `user_id` in `group`.
pub(crate) fn highest_reserved_row(conn: &Connection, user_id: &str, group: ColumnGroup) -> Result<Option<u32>> {
    let max: Option<i64> = conn.query_row(
        "SELECT MAX(row) FROM reservations WHERE user_id = ?1 AND column_group = ?2",
        rusqlite::params![user_id, group.as_str()],
        |r| r.get(0),
    )?;
    Ok(max.map(|m| m as u32))
}

fn cache_id_exists(conn: &Connection, cache_id: &str) -> Result<bool> {
    let mut stmt = conn.prepare_cached("SELECT 1 FROM reservations WHERE cache_id = ?1")?;
    Ok(stmt.exists([cache_id])?)
}

type RawReservation = (String, String, String, i64, String, String);

fn raw_reservation(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawReservation> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode(raw: RawReservation) -> Result<Reservation> {
    let (cache_id, user_id, group, row, payload, created_at) = raw;
    Ok(Reservation {
        cache_id,
        user_id,
        group: group.parse()?,
        row: row as u32,
        payload: serde_json::from_str(&payload)?,
        created_at: parse_timestamp(&created_at)
            .ok_or_else(|| LedgerError::Other(format!("bad reservation timestamp: {created_at}")))?,
    })
}
