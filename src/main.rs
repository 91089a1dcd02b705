mod categorizer;
mod cli;
mod db;
mod detector;
mod error;
mod failures;
mod fmt;
mod importer;
mod models;
mod positions;
mod queue;
mod rate_limit;
mod reservations;
mod settings;
mod sheet;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, RulesCommands};

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    init_logging();
    let cli = Cli::parse();
    let settings = settings::load_settings();
    let user = cli.user.clone().unwrap_or_else(|| settings.user_id.clone());

    let result = match cli.command {
        Commands::Init {
            data_dir,
            sheet,
            min_interval_ms,
        } => cli::init::run(data_dir, sheet, min_interval_ms),
        Commands::Push {
            amount,
            description,
            category,
            date,
            group,
        } => cli::push::direct(&settings, &user, amount, &description, &category, date, group.as_deref()),
        Commands::Hold {
            amount,
            description,
            date,
            group,
        } => cli::push::hold(&settings, &user, amount, &description, date, group.as_deref()),
        Commands::Replace {
            cache_id,
            category,
            description,
            amount,
            date,
        } => cli::push::replace(&settings, &user, &cache_id, &category, description, amount, date),
        Commands::Discard { cache_id } => cli::push::discard(&settings, &cache_id),
        Commands::Pending => cli::pending::run(&settings, &user),
        Commands::Import { file } => cli::import::run(&settings, &user, &file),
        Commands::Review => cli::review::run(&settings, &user),
        Commands::Rules { command } => match command {
            RulesCommands::Add {
                pattern,
                category,
                group,
                description,
                match_type,
                priority,
            } => cli::rules::add(
                &settings,
                &pattern,
                &category,
                &group,
                description.as_deref(),
                &match_type,
                priority,
            ),
            RulesCommands::List => cli::rules::list(&settings),
        },
        Commands::Retry => cli::push::retry(&settings, &user),
        Commands::Failed => cli::failed::run(&settings, &user),
        Commands::Reset { group } => cli::reset::run(&settings, &user, group.as_deref()),
        Commands::Status => cli::status::run(&settings, &user),
        Commands::Clear { yes } => cli::clear::run(&settings, &user, yes),
        Commands::Backup { output } => cli::backup::run(&settings, output),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
