use comfy_table::{Cell, Table};

use crate::cli::open_db;
use crate::error::Result;
use crate::failures::FailureLog;
use crate::fmt::{clip, money};
use crate::settings::Settings;

pub fn run(settings: &Settings, user: &str) -> Result<()> {
    let failed = FailureLog::new(open_db(settings)?).list(user)?;
    if failed.is_empty() {
        println!("No failed writes.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["ID", "Mode", "Group", "Amount", "Description", "Error", "Failed at"]);
    for f in &failed {
        table.add_row(vec![
            Cell::new(f.id),
            Cell::new(f.write.mode.label()),
            Cell::new(f.write.group),
            Cell::new(money(f.write.payload.amount)),
            Cell::new(clip(&f.write.payload.description, 30)),
            Cell::new(clip(&f.error, 50)),
            Cell::new(&f.failed_at),
        ]);
    }
    println!("Failed writes ({})\n{table}", failed.len());
    println!("Run `sheetledger retry` to queue them again.");
    Ok(())
}
