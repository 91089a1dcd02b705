use comfy_table::{Cell, Table};

use crate::cli::open_db;
use crate::error::Result;
use crate::fmt::{clip, money};
use crate::reservations::ReservationLedger;
use crate::settings::Settings;

pub fn run(settings: &Settings, user: &str) -> Result<()> {
    let ledger = ReservationLedger::new(open_db(settings)?);
    let open = ledger.list(user)?;
    if open.is_empty() {
        println!("No open reservations.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["Cache ID", "Range", "Date", "Amount", "Description", "Reserved"]);
    for r in &open {
        table.add_row(vec![
            Cell::new(&r.cache_id),
            Cell::new(r.group.range_label(r.row)),
            Cell::new(&r.payload.date),
            Cell::new(money(r.payload.amount)),
            Cell::new(clip(&r.payload.description, 40)),
            Cell::new(r.created_at.format("%Y-%m-%d %H:%M")),
        ]);
    }
    println!("Open reservations ({})\n{table}", open.len());
    Ok(())
}
