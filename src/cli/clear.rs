use colored::Colorize;
use dialoguer::Confirm;

use crate::cli::start_queue;
use crate::error::Result;
use crate::settings::Settings;

pub fn run(settings: &Settings, user: &str, yes: bool) -> Result<()> {
    if !yes {
        let go = Confirm::new()
            .with_prompt(format!(
                "Discard all reservations and failed writes for {user}? Sheet rows are left as they are"
            ))
            .default(false)
            .interact()
            .unwrap_or(false);
        if !go {
            println!("Nothing cleared.");
            return Ok(());
        }
    }
    let mut queue = start_queue(settings)?;
    let (reservations, failures) = queue.clear_session(user)?;
    queue.stop();
    println!(
        "{}",
        format!("Cleared {reservations} reservations and {failures} failed writes.").green()
    );
    Ok(())
}
