use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cursors (
    user_id TEXT NOT NULL,
    column_group TEXT NOT NULL,
    next_row INTEGER NOT NULL,
    last_verified_at TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (user_id, column_group)
);

CREATE TABLE IF NOT EXISTS reservations (
    cache_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    column_group TEXT NOT NULL,
    row INTEGER NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_reservations_user ON reservations (user_id, column_group);

CREATE TABLE IF NOT EXISTS failed_writes (
    id INTEGER PRIMARY KEY,
    user_id TEXT NOT NULL,
    column_group TEXT NOT NULL,
    mode TEXT NOT NULL,
    cache_id TEXT,
    write TEXT NOT NULL,
    error TEXT NOT NULL,
    failed_at TEXT DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS rules (
    id INTEGER PRIMARY KEY,
    pattern TEXT NOT NULL,
    match_type TEXT DEFAULT 'contains',
    column_group TEXT NOT NULL,
    description TEXT,
    category TEXT NOT NULL,
    priority INTEGER DEFAULT 0,
    hit_count INTEGER DEFAULT 0,
    is_active INTEGER DEFAULT 1,
    created_at TEXT DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS imports (
    id INTEGER PRIMARY KEY,
    filename TEXT NOT NULL,
    user_id TEXT NOT NULL,
    import_date TEXT DEFAULT (datetime('now')),
    record_count INTEGER,
    checksum TEXT
);
";

/// Connection shared by the position store, reservation ledger and failure
/// log. The mutex serializes every cursor read-modify-write.
pub type SharedConn = Arc<Mutex<Connection>>;

pub fn get_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

pub fn open_shared(db_path: &Path) -> Result<SharedConn> {
    let conn = get_connection(db_path)?;
    init_db(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// Lock the shared connection. A panic while holding the lock cannot leave a
/// half-applied SQLite transaction behind, so a poisoned lock is reused.
pub fn lock(conn: &SharedConn) -> MutexGuard<'_, Connection> {
    match conn.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
