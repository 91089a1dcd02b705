pub mod backup;
pub mod clear;
pub mod failed;
pub mod import;
pub mod init;
pub mod pending;
pub mod push;
pub mod reset;
pub mod review;
pub mod rules;
pub mod status;

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;

use crate::db::{open_shared, SharedConn};
use crate::error::{LedgerError, Result};
use crate::models::ColumnGroup;
use crate::queue::UploadQueue;
use crate::settings::Settings;
use crate::sheet::CsvSheet;

/// Open the state database, failing with a hint when `init` was never run.
pub(crate) fn open_db(settings: &Settings) -> Result<SharedConn> {
    let db_path = settings.db_path();
    if !db_path.exists() {
        return Err(LedgerError::Config(format!(
            "no database at {}. Run `sheetledger init` first",
            db_path.display()
        )));
    }
    open_shared(&db_path)
}

/// Open the database and sheet and start the upload worker.
pub(crate) fn start_queue(settings: &Settings) -> Result<UploadQueue> {
    start_queue_on(settings, open_db(settings)?)
}

/// Start the upload worker on a connection the caller also uses.
pub(crate) fn start_queue_on(settings: &Settings, conn: SharedConn) -> Result<UploadQueue> {
    let sheet = CsvSheet::open(&settings.sheet_path())?;
    let mut queue = UploadQueue::new(conn, Arc::new(sheet), settings.queue_config());
    queue.start()?;
    Ok(queue)
}

/// Let the worker finish everything queued, then stop it.
pub(crate) fn finish(mut queue: UploadQueue, settings: &Settings) {
    let per_item = Duration::from_millis(settings.min_interval_ms);
    let budget = per_item * (queue.queue_depth() as u32 + 2) + Duration::from_secs(30);
    if !queue.wait_idle(budget) {
        println!(
            "{}",
            format!("{} writes still queued; they were not uploaded.", queue.queue_depth()).yellow()
        );
    }
    queue.stop();
}

/// Column group given on the command line, or the one implied by the sign.
pub(crate) fn resolve_group(group: Option<&str>, amount: f64) -> Result<ColumnGroup> {
    match group {
        Some(g) => g.parse(),
        None => Ok(ColumnGroup::for_amount(amount)),
    }
}

pub(crate) fn today() -> String {
    chrono::Local::now().format("%d-%m-%Y").to_string()
}

#[derive(Parser)]
#[command(
    name = "sheetledger",
    about = "Throttled append queue for bank transactions in a spreadsheet ledger."
)]
pub struct Cli {
    /// User whose cursors and reservations to use (default from settings)
    #[arg(long, global = true)]
    pub user: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create settings, the state database and the ledger sheet.
    Init {
        /// Directory for the state database
        #[arg(long = "data-dir")]
        data_dir: Option<String>,
        /// Ledger sheet file (default: <data-dir>/ledger.csv)
        #[arg(long)]
        sheet: Option<String>,
        /// Minimum gap between sheet calls in milliseconds
        #[arg(long = "min-interval-ms")]
        min_interval_ms: Option<u64>,
    },
    /// Append a categorized transaction.
    Push {
        /// Signed amount; negative is an expense
        #[arg(allow_hyphen_values = true)]
        amount: f64,
        description: String,
        #[arg(long)]
        category: String,
        /// Booking date (default: today)
        #[arg(long)]
        date: Option<String>,
        /// expense or income (default: from the amount's sign)
        #[arg(long)]
        group: Option<String>,
    },
    /// Append a provisional transaction and reserve its row.
    Hold {
        #[arg(allow_hyphen_values = true)]
        amount: f64,
        description: String,
        #[arg(long)]
        date: Option<String>,
        #[arg(long)]
        group: Option<String>,
    },
    /// Overwrite a reserved row with the final transaction.
    Replace {
        /// Id printed by `hold` or listed by `pending`
        cache_id: String,
        #[arg(long)]
        category: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, allow_hyphen_values = true)]
        amount: Option<f64>,
        #[arg(long)]
        date: Option<String>,
    },
    /// Drop a reservation; its row stays as it is on the sheet.
    Discard { cache_id: String },
    /// List open reservations.
    Pending,
    /// Import a bank statement CSV and queue its transactions.
    Import {
        /// Path to the statement export
        file: String,
    },
    /// Interactively finish open reservations.
    Review,
    /// Manage categorization rules.
    Rules {
        #[command(subcommand)]
        command: RulesCommands,
    },
    /// Re-queue writes that failed earlier.
    Retry,
    /// List writes that failed.
    Failed,
    /// Rebuild a cursor from the sheet.
    Reset {
        /// expense or income (default: both)
        #[arg(long)]
        group: Option<String>,
    },
    /// Show cursors, reservations and failures.
    Status,
    /// Discard all reservations and failed writes; cursors are kept.
    Clear {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Back up the state database.
    Backup {
        /// Output path (default: <data_dir>/backups/sheetledger-YYYYMMDD-HHMMSS.db)
        #[arg(long)]
        output: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum RulesCommands {
    /// Add a categorization rule.
    Add {
        /// Pattern matched against remittance and counterparty
        pattern: String,
        #[arg(long)]
        category: String,
        /// expense or income
        #[arg(long, default_value = "expense")]
        group: String,
        /// Description template; {c} is the matched text
        #[arg(long)]
        description: Option<String>,
        /// Match type: contains, starts_with, regex
        #[arg(long = "match-type", default_value = "contains")]
        match_type: String,
        /// Rule priority (higher wins)
        #[arg(long, default_value = "0")]
        priority: i64,
    },
    /// List active rules.
    List,
}
