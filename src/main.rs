use std::fs::File;
use std::io::{BufWriter, Write};

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime};
use clap::Parser;

mod cache;
mod cli;
mod client;
mod comment;
mod crawler;
mod database;
mod deviation;

use crate::cli::Args;
use crate::client::{Client, DEFAULT_BASE_URL};

// Dates on the platform are local to UTC-8.
const PLATFORM_UTC_OFFSET_SECS: i32 = -8 * 3600;

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init();

    let args = Args::parse();

    // Validated before any network access.
    let Some(start_date) = parse_start_date(&args.start_date) else {
        exit_fatal(&format!("{:?}: invalid YYYY-MM-DD date", args.start_date));
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            // Gracefully abort.
            eprintln!("Interrupted by user.");
        }
        outcome = run(&args, start_date) => {
            if let Err(err) = outcome {
                exit_fatal(&format!("{err:#}"));
            }
        }
    }
}

async fn run(args: &Args, start_date: DateTime<FixedOffset>) -> Result<()> {
    let client = Client::connect(DEFAULT_BASE_URL).await?;

    let report = crawler::run(args, start_date, &client).await?;

    println!("Total critiques:   {:>4}", report.total_critiques());
    println!("Valid critiques:   {:>4}", report.valid_critiques());
    println!("Deleted critiques: {:>4}", report.deleted_critiques());

    let file = File::create(&args.report)
        .with_context(|| format!("cannot write {}", args.report.display()))?;
    let mut out = BufWriter::new(file);
    report.dump(&mut out)?;
    out.flush()?;

    Ok(())
}

fn parse_start_date(s: &str) -> Option<DateTime<FixedOffset>> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    let offset = FixedOffset::east_opt(PLATFORM_UTC_OFFSET_SECS)?;

    date.and_time(NaiveTime::MIN)
        .and_local_timezone(offset)
        .single()
}

fn exit_fatal(msg: &str) -> ! {
    eprintln!("Fatal: {msg}");
    std::process::exit(1);
}
