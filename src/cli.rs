use std::path::PathBuf;

use clap::Parser;

fn default_report_path() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_default()
        .join("critmas.csv")
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Extract and measure the length of Critmas critiques")]
pub struct Args {
    /// URL of the Critmas launch journal
    pub journal: String,

    /// Critmas start date, in the format YYYY-MM-DD
    pub start_date: String,

    /// Path and filename to save the CSV report as
    #[arg(short, long, default_value_os_t = default_report_path())]
    pub report: PathBuf,

    /// Re-resolve critiques the existing report already resolved
    #[arg(long, default_value_t = false)]
    pub recheck: bool,
}
