use comfy_table::{Cell, Table};

use crate::categorizer::{add_rule, load_rules};
use crate::cli::open_db;
use crate::db::lock;
use crate::error::Result;
use crate::models::ColumnGroup;
use crate::settings::Settings;

pub fn add(
    settings: &Settings,
    pattern: &str,
    category: &str,
    group: &str,
    description: Option<&str>,
    match_type: &str,
    priority: i64,
) -> Result<()> {
    let group: ColumnGroup = group.parse()?;
    let conn = open_db(settings)?;
    let id = add_rule(&lock(&conn), pattern, match_type, group, description, category, priority)?;
    println!("Added rule {id}: '{pattern}' \u{2192} {category} ({group})");
    Ok(())
}

pub fn list(settings: &Settings) -> Result<()> {
    let conn = open_db(settings)?;
    let rules = load_rules(&lock(&conn), None)?;

    let mut table = Table::new();
    table.set_header(vec!["ID", "Pattern", "Type", "Group", "Description", "Category", "Priority", "Hits"]);
    for rule in rules {
        table.add_row(vec![
            Cell::new(rule.id),
            Cell::new(rule.pattern),
            Cell::new(rule.match_type),
            Cell::new(rule.group),
            Cell::new(rule.description.unwrap_or_default()),
            Cell::new(rule.category),
            Cell::new(rule.priority),
            Cell::new(rule.hit_count),
        ]);
    }
    println!("Rules\n{table}");
    Ok(())
}
