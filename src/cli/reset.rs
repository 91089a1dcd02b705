use crate::cli::start_queue;
use crate::error::Result;
use crate::models::ColumnGroup;
use crate::settings::Settings;

pub fn run(settings: &Settings, user: &str, group: Option<&str>) -> Result<()> {
    let groups = match group {
        Some(g) => vec![g.parse::<ColumnGroup>()?],
        None => ColumnGroup::ALL.to_vec(),
    };
    let mut queue = start_queue(settings)?;
    for group in groups {
        let next_row = queue.reset_cursor(user, group)?;
        println!("{group}: next row {next_row} ({})", group.range_label(next_row));
    }
    queue.stop();
    Ok(())
}
