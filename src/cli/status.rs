use colored::Colorize;

use crate::db::{lock, open_shared};
use crate::error::Result;
use crate::failures::FailureLog;
use crate::fmt::format_bytes;
use crate::models::ColumnGroup;
use crate::positions::PositionStore;
use crate::reservations::ReservationLedger;
use crate::settings::Settings;

pub fn run(settings: &Settings, user: &str) -> Result<()> {
    let db_path = settings.db_path();
    let sheet_path = settings.sheet_path();

    println!("User:        {user}");
    println!("Data dir:    {}", settings.data_dir);
    println!("Database:    {}", db_path.display());
    println!("Sheet:       {}", sheet_path.display());
    println!("Throttle:    {} ms", settings.min_interval_ms);

    if !db_path.exists() {
        println!();
        println!("Database not found. Run `sheetledger init` to set up.");
        return Ok(());
    }
    println!("DB size:     {}", format_bytes(std::fs::metadata(&db_path)?.len()));
    if !sheet_path.is_file() {
        println!("{}", "Sheet file is missing.".red());
    }

    let conn = open_shared(&db_path)?;
    let positions = PositionStore::new(conn.clone());
    println!();
    for group in ColumnGroup::ALL {
        let cursor = positions.get(user, group)?;
        let verified = match cursor.last_verified_at {
            Some(at) => format!("verified {}", at.format("%Y-%m-%d %H:%M")),
            None => "not verified".yellow().to_string(),
        };
        println!("{:<8}  next row {:<5} {verified}", group.to_string(), cursor.next_row);
    }

    let open = ReservationLedger::new(conn.clone()).list(user)?.len();
    let failed = FailureLog::new(conn.clone()).count(user)?;
    let rules: i64 = lock(&conn).query_row("SELECT count(*) FROM rules WHERE is_active = 1", [], |r| r.get(0))?;
    println!();
    println!("Reservations:  {open}");
    println!("Failed writes: {failed}");
    println!("Rules:         {rules}");
    Ok(())
}
