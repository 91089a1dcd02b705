use colored::Colorize;
use comfy_table::{Cell, Table};
use dialoguer::{Confirm, Input};

use crate::categorizer::{add_rule, known_categories};
use crate::cli::{finish, open_db, start_queue_on};
use crate::db::lock;
use crate::error::Result;
use crate::fmt::money;
use crate::models::Payload;
use crate::settings::Settings;

/// Suggested rule pattern: the first two words of the description.
fn suggest_pattern(description: &str) -> String {
    description
        .split_whitespace()
        .take(2)
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn run(settings: &Settings, user: &str) -> Result<()> {
    let conn = open_db(settings)?;
    let queue = start_queue_on(settings, conn.clone())?;
    let open = queue.pending(user)?;

    if open.is_empty() {
        finish(queue, settings);
        println!("{}", "No held transactions to review.".green());
        return Ok(());
    }
    println!("\n{} held transactions to review\n", open.len());

    let mut replaced = 0usize;
    for held in &open {
        let categories = known_categories(&lock(&conn), held.group)?;
        if !categories.is_empty() {
            let mut table = Table::new();
            table.set_header(vec!["#", "Category"]);
            for (i, name) in categories.iter().enumerate() {
                table.add_row(vec![Cell::new(i + 1), Cell::new(name)]);
            }
            println!("{table}");
        }

        println!("{}", "\u{2500}".repeat(60));
        println!("  Row:         {}", held.group.range_label(held.row));
        println!("  Date:        {}", held.payload.date);
        println!("  Description: {}", held.payload.description);
        let amt_str = if held.payload.amount < 0.0 {
            money(held.payload.amount).red().to_string()
        } else {
            money(held.payload.amount).green().to_string()
        };
        println!("  Amount:      {amt_str}");
        println!();

        let choice: String = Input::new()
            .with_prompt("Category # or name (s=skip, q=quit)")
            .interact_text()
            .unwrap_or_else(|_| "s".to_string());
        let choice = choice.trim();

        if choice.eq_ignore_ascii_case("q") {
            println!("{}", "Review paused.".yellow());
            break;
        }
        if choice.eq_ignore_ascii_case("s") || choice.is_empty() {
            continue;
        }
        let category = match choice.parse::<usize>() {
            Ok(n) if n >= 1 && n <= categories.len() => categories[n - 1].clone(),
            Ok(_) => {
                println!("{}", "Invalid choice, skipping.".red());
                continue;
            }
            Err(_) => choice.to_string(),
        };

        let description: String = Input::new()
            .with_prompt("Description")
            .default(held.payload.description.clone())
            .interact_text()
            .unwrap_or_else(|_| held.payload.description.clone());

        let create_rule = Confirm::new()
            .with_prompt("Create rule for future matches?")
            .default(false)
            .interact()
            .unwrap_or(false);
        if create_rule {
            let pattern: String = Input::new()
                .with_prompt("Rule pattern")
                .default(suggest_pattern(&held.payload.description))
                .interact_text()
                .unwrap_or_default();
            if !pattern.trim().is_empty() {
                add_rule(
                    &lock(&conn),
                    pattern.trim(),
                    "contains",
                    held.group,
                    Some(description.as_str()),
                    &category,
                    0,
                )?;
            }
        }

        queue.enqueue_replacement(
            user,
            &held.cache_id,
            held.group,
            Payload {
                description,
                category: category.clone(),
                ..held.payload.clone()
            },
        )?;
        replaced += 1;
        println!("{}", format!("\u{2192} Categorized as {category}").green());
        println!();
    }

    if replaced > 0 {
        println!("Uploading {replaced} replacements...");
    }
    finish(queue, settings);
    println!("{}", "Review complete!".green());
    Ok(())
}
