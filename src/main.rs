//! duelstore CLI entry point.

use clap::Parser;
use duelstore::cli::{Cli, Commands, commands, error_hint};
use duelstore::error::Error;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.no_color || !std::io::IsTerminal::is_terminal(&std::io::stdout()) {
        colored::control::set_override(false);
    }

    init_tracing(cli.verbose, cli.quiet);

    let json = cli.json;

    match run(&cli, json) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if json {
                eprintln!("{}", e.to_structured_json());
            } else if !cli.quiet {
                if let Some(hint) = error_hint(&e) {
                    eprintln!("Error: {e}\n  Hint: {hint}");
                } else {
                    eprintln!("Error: {e}");
                }
            }
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    use tracing_subscriber::EnvFilter;

    if quiet {
        return;
    }

    // Honor RUST_LOG if set, otherwise use verbosity flag
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbose {
            0 => EnvFilter::new("warn"),
            1 => EnvFilter::new("info"),
            2 => EnvFilter::new("debug,rusqlite=info"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn run(cli: &Cli, json: bool) -> Result<(), Error> {
    let db = cli.db.as_deref();
    match &cli.command {
        Commands::Version => commands::version::execute(json),
        Commands::Status => commands::status::execute(db, json),
        Commands::Check => commands::check::execute(db, json),
        Commands::Migrate { target } => {
            commands::migrate::execute(db, target.as_deref(), cli.quiet, json)
        }
        Commands::Backup { output } => commands::backup::execute(db, output, cli.quiet, json),
        Commands::Restore(args) => commands::restore::execute(db, args, cli.quiet, json),
    }
}
