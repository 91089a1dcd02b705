use std::path::PathBuf;

use crate::db::{get_connection, init_db};
use crate::error::Result;
use crate::settings::{load_settings, save_settings, settings_file_exists, shellexpand_path, DB_FILE};
use crate::sheet::CsvSheet;

pub fn run(data_dir: Option<String>, sheet: Option<String>, min_interval_ms: Option<u64>) -> Result<()> {
    let mut settings = load_settings();

    if let Some(dir) = data_dir {
        settings.data_dir = shellexpand_path(&dir);
        if sheet.is_none() && !settings_file_exists() {
            settings.sheet_path = PathBuf::from(&settings.data_dir)
                .join("ledger.csv")
                .to_string_lossy()
                .to_string();
        }
    }
    if let Some(path) = sheet {
        settings.sheet_path = shellexpand_path(&path);
    }
    if let Some(ms) = min_interval_ms {
        settings.min_interval_ms = ms;
    }

    save_settings(&settings)?;

    let resolved = PathBuf::from(&settings.data_dir);
    std::fs::create_dir_all(&resolved)?;
    let conn = get_connection(&resolved.join(DB_FILE))?;
    init_db(&conn)?;

    let sheet = CsvSheet::create(&settings.sheet_path())?;

    println!("Initialized sheetledger at {}", resolved.display());
    println!("Ledger sheet: {}", sheet.path().display());
    Ok(())
}
