use crate::db::{lock, SharedConn};
use crate::error::Result;
use crate::models::{FailedWrite, PendingWrite};

/// Writes the worker dropped, kept so an operator can retry them.
#[derive(Clone)]
pub struct FailureLog {
    conn: SharedConn,
}

impl FailureLog {
    pub fn new(conn: SharedConn) -> Self {
        Self { conn }
    }

    pub fn record(&self, write: &PendingWrite, error: &str) -> Result<i64> {
        let conn = lock(&self.conn);
        conn.execute(
            "INSERT INTO failed_writes (user_id, column_group, mode, cache_id, write, error) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                write.user_id,
                write.group.as_str(),
                write.mode.label(),
                write.mode.cache_id(),
                serde_json::to_string(write)?,
                error,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list(&self, user_id: &str) -> Result<Vec<FailedWrite>> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT id, write, error, failed_at FROM failed_writes WHERE user_id = ?1 ORDER BY id",
        )?;
        let raws: Vec<(i64, String, String, String)> = stmt
            .query_map([user_id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        raws.into_iter()
            .map(|(id, write, error, failed_at)| -> Result<FailedWrite> {
                Ok(FailedWrite {
                    id,
                    write: serde_json::from_str(&write)?,
                    error,
                    failed_at,
                })
            })
            .collect()
    }

    /// Remove and return a user's failed writes in the order they failed.
    pub fn take(&self, user_id: &str) -> Result<Vec<PendingWrite>> {
        let failed = self.list(user_id)?;
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        for f in &failed {
            tx.execute("DELETE FROM failed_writes WHERE id = ?1", [f.id])?;
        }
        tx.commit()?;
        Ok(failed.into_iter().map(|f| f.write).collect())
    }

    pub fn count(&self, user_id: &str) -> Result<usize> {
        let n: i64 = lock(&self.conn).query_row(
            "SELECT count(*) FROM failed_writes WHERE user_id = ?1",
            [user_id],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    pub fn clear_user(&self, user_id: &str) -> Result<usize> {
        Ok(lock(&self.conn).execute("DELETE FROM failed_writes WHERE user_id = ?1", [user_id])?)
    }
}
