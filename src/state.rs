use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;
use url::Url;

use crate::staging::StagingFile;
use crate::transport::Credentials;

/// One fetch of one URL. A redirect replaces the whole transfer.
pub struct Transfer {
    pub source_url: Url,
    pub destination_name: Option<String>,
    pub bytes_received: u64,
    pub bytes_total: Option<u64>,
    pub started_at: Instant,
    pub staging: Option<StagingFile>,
    /// Body bytes that arrived before a destination name was known.
    pub pending: Vec<u8>,
    pub credentials: Option<Credentials>,
}

impl Transfer {
    pub fn new(source_url: Url, destination_name: Option<String>) -> Self {
        Self {
            source_url,
            destination_name,
            bytes_received: 0,
            bytes_total: None,
            started_at: Instant::now(),
            staging: None,
            pending: Vec::new(),
            credentials: None,
        }
    }

    /// True once bytes have reached disk; the name is fixed from then on.
    pub fn write_started(&self) -> bool {
        self.staging.is_some()
    }

    pub fn record_progress(&mut self, received: u64, total: Option<u64>) {
        self.bytes_received = self.bytes_received.max(received);
        if let Some(total) = total.filter(|t| *t > 0) {
            self.bytes_total = Some(self.bytes_total.map_or(total, |known| known.max(total)));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Committed {
        url_id: String,
        path: PathBuf,
        bytes: u64,
    },
    Cancelled,
    /// Mandatory update abandoned: the application has to exit.
    Terminated,
}

/// Completion signal handed to the updater controller.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DownloadFinished {
    pub url_id: String,
    pub path: PathBuf,
    pub bytes: u64,
    pub finished_at: DateTime<Local>,
}

impl DownloadFinished {
    pub fn new(url_id: String, path: PathBuf, bytes: u64) -> Self {
        Self {
            url_id,
            path,
            bytes,
            finished_at: Local::now(),
        }
    }
}
