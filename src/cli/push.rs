use colored::Colorize;

use crate::cli::{finish, resolve_group, start_queue, today};
use crate::error::{LedgerError, Result};
use crate::fmt::money;
use crate::models::Payload;
use crate::settings::Settings;

pub fn direct(
    settings: &Settings,
    user: &str,
    amount: f64,
    description: &str,
    category: &str,
    date: Option<String>,
    group: Option<&str>,
) -> Result<()> {
    let group = resolve_group(group, amount)?;
    let payload = Payload {
        date: date.unwrap_or_else(today),
        amount,
        description: description.to_string(),
        category: category.to_string(),
    };
    let queue = start_queue(settings)?;
    queue.enqueue_direct(user, group, payload)?;
    finish(queue, settings);
    println!("Queued {} {} \u{2192} {category}", group, money(amount));
    Ok(())
}

pub fn hold(
    settings: &Settings,
    user: &str,
    amount: f64,
    description: &str,
    date: Option<String>,
    group: Option<&str>,
) -> Result<()> {
    let group = resolve_group(group, amount)?;
    let payload = Payload {
        date: date.unwrap_or_else(today),
        amount,
        description: description.to_string(),
        category: settings.placeholder_category.clone(),
    };
    let queue = start_queue(settings)?;
    let cache_id = queue.enqueue_placeholder(user, group, payload)?;
    let row = queue.reservation(&cache_id)?.map(|r| r.row);
    finish(queue, settings);
    match row {
        Some(row) => println!("Reserved {} for {}", group.range_label(row), cache_id.bold()),
        None => println!("Reserved a row for {}", cache_id.bold()),
    }
    Ok(())
}

pub fn replace(
    settings: &Settings,
    user: &str,
    cache_id: &str,
    category: &str,
    description: Option<String>,
    amount: Option<f64>,
    date: Option<String>,
) -> Result<()> {
    let queue = start_queue(settings)?;
    let reservation = queue
        .reservation(cache_id)?
        .ok_or_else(|| LedgerError::UnknownReservation(cache_id.to_string()))?;
    let held = reservation.payload;
    let payload = Payload {
        date: date.unwrap_or(held.date),
        amount: amount.unwrap_or(held.amount),
        description: description.unwrap_or(held.description),
        category: category.to_string(),
    };
    queue.enqueue_replacement(user, cache_id, reservation.group, payload)?;
    finish(queue, settings);
    println!(
        "Replaced {} ({cache_id}) \u{2192} {category}",
        reservation.group.range_label(reservation.row)
    );
    Ok(())
}

pub fn discard(settings: &Settings, cache_id: &str) -> Result<()> {
    let conn = crate::cli::open_db(settings)?;
    let ledger = crate::reservations::ReservationLedger::new(conn);
    if ledger.release(cache_id)? {
        println!("Discarded {cache_id}; its row stays on the sheet as it is.");
    } else {
        println!("{}", format!("No open reservation {cache_id}.").yellow());
    }
    Ok(())
}

pub fn retry(settings: &Settings, user: &str) -> Result<()> {
    let queue = start_queue(settings)?;
    let queued = queue.retry_failed(user)?;
    if queued == 0 {
        finish(queue, settings);
        println!("{}", "Nothing to retry.".green());
        return Ok(());
    }
    finish(queue, settings);
    let conn = crate::cli::open_db(settings)?;
    let still = crate::failures::FailureLog::new(conn).count(user)?;
    if still == 0 {
        println!("{}", format!("{queued} writes retried.").green());
    } else {
        println!("{}", format!("{queued} writes retried, {still} failed again.").yellow());
    }
    Ok(())
}
