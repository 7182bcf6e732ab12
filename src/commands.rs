use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use url::Url;

use crate::downloader::{DownloadOptions, Downloader};
use crate::error::DownloadError;
use crate::progress::TransferProgress;
use crate::prompt::TerminalPrompt;
use crate::state::{DownloadFinished, TransferOutcome};
use crate::transport::{HttpTransport, Transport};

pub async fn run_download(
    url: String,
    options: DownloadOptions,
    open_when_done: bool,
    json: bool,
) -> Result<()> {
    let url = Url::parse(&url).with_context(|| format!("Invalid URL: {}", url))?;

    let (cancel_tx, cancel_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if cancel_tx.send(()).await.is_err() {
                break;
            }
        }
    });

    let transport: Arc<dyn Transport> =
        Arc::new(HttpTransport::new().context("Failed to build HTTP client")?);
    let mut downloader = Downloader::new(transport, options)
        .with_prompt(Arc::new(TerminalPrompt))
        .with_credentials(Arc::new(TerminalPrompt))
        .with_progress(TransferProgress::stderr());

    let outcome = downloader
        .run(url.clone(), cancel_rx)
        .await
        .with_context(|| format!("Failed to download {}", url))?;

    report_outcome(outcome, open_when_done, json)
}

fn report_outcome(outcome: TransferOutcome, open_when_done: bool, json: bool) -> Result<()> {
    match outcome {
        TransferOutcome::Committed { url_id, path, bytes } => {
            let report = DownloadFinished::new(url_id, path, bytes);
            if json {
                println!("{}", serde_json::to_string(&report)?);
            } else {
                println!("Downloaded to {}", report.path.display());
            }

            if open_when_done {
                info!("The installer will open separately...");
                if let Err(e) = open_download(&report.path) {
                    // The file is already in place; failing to launch it is not fatal.
                    eprintln!("Error: {}", e);
                }
            }
            Ok(())
        }
        TransferOutcome::Cancelled => {
            println!("Download cancelled");
            Ok(())
        }
        TransferOutcome::Terminated => {
            warn!("Mandatory update cancelled, closing the application");
            std::process::exit(0);
        }
    }
}

/// Hands a committed download to the desktop shell.
pub fn open_download(path: &Path) -> std::result::Result<(), DownloadError> {
    if !path.is_file() {
        return Err(DownloadError::FileNotFoundOnOpen {
            path: path.to_path_buf(),
        });
    }

    info!("Opening update file {}", path.display());
    open::that_detached(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::UpdatePolicy;
    use tempfile::tempdir;

    #[test]
    fn opening_a_missing_download_is_reported() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("setup.exe");

        let err = open_download(&missing).unwrap_err();
        assert!(matches!(err, DownloadError::FileNotFoundOnOpen { ref path } if *path == missing));
        assert!(err.to_string().contains("Cannot find downloaded update"));
    }

    #[test]
    fn cancelled_outcome_is_not_an_error() {
        assert!(report_outcome(TransferOutcome::Cancelled, true, false).is_ok());
    }

    #[tokio::test]
    async fn downloads_over_http_through_a_redirect() {
        let mut server = mockito::Server::new_async().await;
        let _latest = server
            .mock("GET", "/latest")
            .with_status(302)
            .with_header("location", "/releases/2.0/download")
            .create_async()
            .await;
        let _release = server
            .mock("GET", "/releases/2.0/download")
            .with_status(200)
            .with_header("content-disposition", "attachment; filename=\"app-2.0.pkg\"")
            .with_body("installer payload")
            .create_async()
            .await;

        let dir = tempdir().unwrap();
        let options = DownloadOptions {
            download_dir: dir.path().to_path_buf(),
            policy: UpdatePolicy::Optional,
            ..DownloadOptions::default()
        };
        let start = Url::parse(&format!("{}/latest", server.url())).unwrap();

        let mut downloader = Downloader::new(Arc::new(HttpTransport::new().unwrap()), options);
        let (_tx, rx) = mpsc::channel(1);
        let outcome = downloader.run(start.clone(), rx).await.unwrap();

        let expected = dir.path().join("app-2.0.pkg");
        assert_eq!(
            outcome,
            TransferOutcome::Committed {
                url_id: start.to_string(),
                path: expected.clone(),
                bytes: 17,
            }
        );
        assert_eq!(std::fs::read_to_string(&expected).unwrap(), "installer payload");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn http_failure_leaves_no_file() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/broken.bin")
            .with_status(500)
            .create_async()
            .await;

        let dir = tempdir().unwrap();
        let options = DownloadOptions {
            download_dir: dir.path().to_path_buf(),
            ..DownloadOptions::default()
        };
        let url = Url::parse(&format!("{}/broken.bin", server.url())).unwrap();

        let mut downloader = Downloader::new(Arc::new(HttpTransport::new().unwrap()), options);
        let (_tx, rx) = mpsc::channel(1);
        let err = downloader.run(url, rx).await.unwrap_err();

        assert!(matches!(err, DownloadError::Transport { .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
