use std::path::PathBuf;

use colored::Colorize;

use crate::categorizer::categorize;
use crate::cli::{finish, open_db, start_queue_on};
use crate::db::{lock, SharedConn};
use crate::error::Result;
use crate::importer::{already_imported, compute_checksum, parse_statement, record_import};
use crate::models::{ColumnGroup, ParsedRow, Payload};
use crate::queue::UploadQueue;
use crate::settings::Settings;

pub fn run(settings: &Settings, user: &str, file: &str) -> Result<()> {
    let file_path = PathBuf::from(file);
    let conn = open_db(settings)?;

    let checksum = compute_checksum(&file_path)?;
    if already_imported(&lock(&conn), user, &checksum)? {
        println!("This file has already been imported (duplicate checksum).");
        return Ok(());
    }
    let rows = parse_statement(&file_path)?;

    let queue = start_queue_on(settings, conn.clone())?;
    // held rows are reserved as they are queued; a second import would hold them twice
    record_import(&lock(&conn), &file_path, user, rows.len(), &checksum)?;
    println!("{} rows read, uploading...", rows.len());

    let queued = queue_rows(&queue, &conn, settings, user, &rows);
    finish(queue, settings);
    let (matched, held) = queued?;

    println!("{matched} categorized by rules, {held} held for review");
    if held > 0 {
        println!("{}", "Run `sheetledger review` to finish the held rows.".yellow());
    }
    Ok(())
}

/// Queue every parsed row: rule hits as direct writes, the rest as held
/// placeholders. Returns (matched, held).
fn queue_rows(
    queue: &UploadQueue,
    conn: &SharedConn,
    settings: &Settings,
    user: &str,
    rows: &[ParsedRow],
) -> Result<(usize, usize)> {
    let mut matched = 0usize;
    let mut held = 0usize;
    for row in rows {
        let group = ColumnGroup::for_amount(row.amount);
        let hit = categorize(&lock(conn), row)?;
        match hit {
            Some(hit) => {
                queue.enqueue_direct(
                    user,
                    group,
                    Payload {
                        date: row.date.clone(),
                        amount: row.amount,
                        description: hit.description,
                        category: hit.category,
                    },
                )?;
                matched += 1;
            }
            None => {
                queue.enqueue_placeholder(
                    user,
                    group,
                    Payload {
                        date: row.date.clone(),
                        amount: row.amount,
                        description: row.default_description(),
                        category: settings.placeholder_category.clone(),
                    },
                )?;
                held += 1;
            }
        }
    }
    Ok((matched, held))
}
