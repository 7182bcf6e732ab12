mod cli;
mod commands;
mod downloader;
mod error;
mod progress;
mod prompt;
mod staging;
mod state;
mod transport;
mod utils;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::cli::UpdatePolicy;
use crate::downloader::DownloadOptions;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URL of the update to download
    #[arg(index = 1)]
    url: String,

    /// File name to save as (the server's Content-Disposition name takes precedence)
    #[arg(short = 'o', long = "file-name")]
    file_name: Option<String>,

    /// Directory to save the download to (defaults to the user's downloads directory)
    #[arg(short = 'd', long = "download-dir")]
    download_dir: Option<PathBuf>,

    /// User-Agent header sent to the server
    #[arg(short = 'A', long = "user-agent")]
    user_agent: Option<String>,

    /// Identifier of the update source reported on completion (defaults to the URL)
    #[arg(long = "url-id")]
    url_id: Option<String>,

    /// Update policy: optional (cancel aborts the download) or mandatory (cancel quits)
    #[arg(long, value_enum, default_value = "optional")]
    policy: UpdatePolicy,

    /// Do not open the downloaded file when done
    #[arg(long = "no-open")]
    no_open: bool,

    /// Seconds without incoming data before the download is abandoned
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Maximum number of redirects to follow
    #[arg(long = "max-redirects", default_value_t = 10)]
    max_redirects: usize,

    /// Rate limit in bytes per second (e.g., 1048576 for 1MB/s)
    #[arg(short = 'r', long = "rate-limit")]
    rate_limit: Option<u32>,

    /// Expected SHA-256 of the file; a mismatch discards the download
    #[arg(long)]
    sha256: Option<String>,

    /// Print the completion report as JSON
    #[arg(long)]
    json: bool,

    /// Verbose logging
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut options = DownloadOptions {
        file_name: args.file_name,
        url_id: args.url_id,
        policy: args.policy,
        inactivity_timeout: Duration::from_secs(args.timeout),
        max_redirects: args.max_redirects,
        rate_limit: args.rate_limit,
        expected_sha256: args.sha256,
        ..DownloadOptions::default()
    };
    if let Some(agent) = args.user_agent {
        options.user_agent = Some(agent);
    }
    if let Some(dir) = args.download_dir {
        options.download_dir = dir;
    }

    // Report an absolute path to whoever installs the update
    if options.download_dir.is_relative() {
        if let Ok(cwd) = std::env::current_dir() {
            options.download_dir = cwd.join(&options.download_dir);
        }
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        crate::commands::run_download(args.url, options, !args.no_open, args.json).await
    })
}
