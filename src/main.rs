use std::io::{self, Write as _};
use std::process::ExitCode;

use anyhow::Result;
use log::{debug, error, info};

use imap_migrate::args::Args;
use imap_migrate::config::Config;
use imap_migrate::migrate::{CancelFlag, Migrator, Outcome};
use imap_migrate::remote::{Account, ImapTransport};

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse_args();
    match do_main(&args) {
        Ok(code) => code,
        Err(err) => {
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn do_main(args: &Args) -> Result<ExitCode> {
    let config = Config::load(&args.config)?;

    if !args.simulate && !args.yes && !confirm()? {
        info!("migration aborted, use --simulate for a read-only scan");
        return Ok(ExitCode::SUCCESS);
    }

    if dotenvy::dotenv().is_err() {
        debug!("no .env file found, using the process environment");
    }
    let source = ImapTransport::connect(Account::from_env("SOURCE")?, true)?;
    let dest = ImapTransport::connect(Account::from_env("DEST")?, false)?;

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel())?;
    }

    info!(
        "{}",
        if args.simulate {
            "SIMULATION MODE: scanning mailbox"
        } else {
            "LIVE MODE: starting migration"
        }
    );
    let migrator = Migrator::new(&config, source, dest, cancel, args.simulate, args.quiet);
    let summary = migrator.run()?;

    info!("=== FINAL SUMMARY ===");
    info!("migrated messages: {}", summary.processed);
    info!("skipped messages: {} (check the log for details)", summary.skipped);
    info!(
        "total volume: {:.2} MB",
        summary.bytes as f64 / (1024.0 * 1024.0)
    );

    Ok(match summary.outcome {
        Outcome::Completed => ExitCode::SUCCESS,
        // Mirror the conventional SIGINT exit status.
        Outcome::Cancelled => ExitCode::from(130),
    })
}

fn confirm() -> Result<bool> {
    eprint!(
        "WARNING: you are about to migrate messages into the destination mailbox.\n\
         Continue? (yes/no): "
    );
    io::stderr().flush()?;
    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    Ok(matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}
