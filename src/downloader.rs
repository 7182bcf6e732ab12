use futures::stream::BoxStream;
use futures::StreamExt;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::cli::UpdatePolicy;
use crate::error::{DownloadError, Result};
use crate::progress::{format_size, TransferProgress};
use crate::prompt::{AutoConfirm, CancelPrompt, CredentialProvider};
use crate::staging::StagingFile;
use crate::state::{Transfer, TransferOutcome};
use crate::transport::{
    CompletionStatus, Credentials, FetchRequest, ResponseMetadata, Transport, TransportEvent,
};
use crate::utils::{
    default_download_dir, filename_from_content_disposition, get_filename_from_url,
    sanitize_filename, DEFAULT_FILE_NAME,
};

const MAX_AUTH_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub download_dir: PathBuf,
    /// Caller-supplied name; a Content-Disposition filename still wins over it.
    pub file_name: Option<String>,
    pub user_agent: Option<String>,
    /// Identifies the update source in the completion report. Defaults to the
    /// first requested URL.
    pub url_id: Option<String>,
    pub policy: UpdatePolicy,
    pub inactivity_timeout: Duration,
    pub max_redirects: usize,
    /// Bytes per second.
    pub rate_limit: Option<u32>,
    pub expected_sha256: Option<String>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            file_name: None,
            user_agent: Some(format!("updl/{}", env!("CARGO_PKG_VERSION"))),
            url_id: None,
            policy: UpdatePolicy::Optional,
            inactivity_timeout: Duration::from_secs(10),
            max_redirects: 10,
            rate_limit: None,
            expected_sha256: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelDecision {
    Continue,
    Abort,
    Terminate,
}

/// Drives one transfer at a time from transport events to a committed file.
pub struct Downloader {
    transport: Arc<dyn Transport>,
    prompt: Arc<dyn CancelPrompt>,
    credential_provider: Arc<dyn CredentialProvider>,
    options: DownloadOptions,
    rate_limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    progress: TransferProgress,
    transfer: Option<Transfer>,
    url_id: String,
    abort: CancellationToken,
    redirects: usize,
    auth_attempts: usize,
    finished: bool,
}

impl Downloader {
    pub fn new(transport: Arc<dyn Transport>, options: DownloadOptions) -> Self {
        let rate_limiter = options
            .rate_limit
            .and_then(NonZeroU32::new)
            .map(|limit| RateLimiter::direct(Quota::per_second(limit)));

        Self {
            transport,
            prompt: Arc::new(AutoConfirm),
            credential_provider: Arc::new(AutoConfirm),
            options,
            rate_limiter,
            progress: TransferProgress::hidden(),
            transfer: None,
            url_id: String::new(),
            abort: CancellationToken::new(),
            redirects: 0,
            auth_attempts: 0,
            finished: false,
        }
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn CancelPrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn with_credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credential_provider = provider;
        self
    }

    pub fn with_progress(mut self, progress: TransferProgress) -> Self {
        self.progress = progress;
        self
    }

    /// Runs a complete transfer of `url`, restarting on redirects and
    /// authentication challenges. Every message on `cancel_requests` is one
    /// user request to stop.
    pub async fn run(
        &mut self,
        url: Url,
        mut cancel_requests: mpsc::Receiver<()>,
    ) -> Result<TransferOutcome> {
        self.redirects = 0;
        self.auth_attempts = 0;
        self.url_id = self.options.url_id.clone().unwrap_or_else(|| url.to_string());

        let mut events = self.start(url).await?;

        loop {
            tokio::select! {
                biased;
                Some(()) = cancel_requests.recv() => {
                    if self.cancel().await == CancelDecision::Terminate {
                        return Ok(TransferOutcome::Terminated);
                    }
                }
                event = events.next() => {
                    let Some(event) = event else {
                        let status = CompletionStatus::Error(
                            "Connection closed before the download finished".to_string(),
                        );
                        return self.on_complete(status).await;
                    };

                    // After a confirmed abort only the end of the fetch matters.
                    if self.abort.is_cancelled() {
                        if ends_fetch(&event) {
                            return self.on_complete(CompletionStatus::Aborted).await;
                        }
                        continue;
                    }

                    match event {
                        TransportEvent::Redirect(target) => {
                            events = self.on_redirect(target).await?;
                        }
                        TransportEvent::AuthenticationRequired { realm } => {
                            events = self.on_authentication_required(realm).await?;
                        }
                        TransportEvent::MetadataReady(metadata) => self.on_metadata(metadata),
                        TransportEvent::DataChunk(chunk) => {
                            if let Err(e) = self.on_data(&chunk).await {
                                self.fail(&e).await;
                                return Err(e);
                            }
                        }
                        TransportEvent::Progress { received, total } => {
                            self.on_progress(received, total)
                        }
                        TransportEvent::Completed(status) => return self.on_complete(status).await,
                    }
                }
            }
        }
    }

    pub async fn start(&mut self, url: Url) -> Result<BoxStream<'static, TransportEvent>> {
        self.start_with(url, None).await
    }

    async fn start_with(
        &mut self,
        url: Url,
        credentials: Option<Credentials>,
    ) -> Result<BoxStream<'static, TransportEvent>> {
        self.discard_staging().await;
        self.transfer = None;
        self.finished = false;
        self.abort = CancellationToken::new();
        self.progress.reset();

        if self.url_id.is_empty() {
            self.url_id = self.options.url_id.clone().unwrap_or_else(|| url.to_string());
        }

        fs::create_dir_all(&self.options.download_dir).await?;

        let name = self.options.file_name.as_deref().map(sanitize_filename);
        let mut transfer = Transfer::new(url.clone(), name);
        transfer.credentials = credentials.clone();
        self.transfer = Some(transfer);

        info!("Downloading {}", url);

        Ok(self.transport.fetch(FetchRequest {
            url,
            user_agent: self.options.user_agent.clone(),
            credentials,
            inactivity_timeout: self.options.inactivity_timeout,
            abort: self.abort.clone(),
        }))
    }

    pub async fn on_redirect(&mut self, target: Url) -> Result<BoxStream<'static, TransportEvent>> {
        self.redirects += 1;
        if self.redirects > self.options.max_redirects {
            let e = DownloadError::transport(format!(
                "Too many redirects (more than {})",
                self.options.max_redirects
            ));
            self.fail(&e).await;
            return Err(e);
        }

        // Credentials only follow redirects that stay on the same origin.
        let credentials = self.transfer.as_ref().and_then(|t| {
            let same_origin = t.source_url.origin() == target.origin();
            t.credentials.clone().filter(|_| same_origin)
        });

        info!("Redirected to {}", target);
        self.start_with(target, credentials).await
    }

    pub async fn on_authentication_required(
        &mut self,
        realm: Option<String>,
    ) -> Result<BoxStream<'static, TransportEvent>> {
        self.auth_attempts += 1;
        let url = match self.transfer.as_ref() {
            Some(transfer) => transfer.source_url.clone(),
            None => return Err(DownloadError::transport("No active transfer")),
        };

        let credentials = if self.auth_attempts > MAX_AUTH_ATTEMPTS {
            None
        } else {
            let provider = self.credential_provider.clone();
            let asked_url = url.clone();
            tokio::task::spawn_blocking(move || provider.credentials(&asked_url, realm.as_deref()))
                .await
                .ok()
                .flatten()
        };

        match credentials {
            Some(credentials) => {
                debug!("Retrying {} as {}", url, credentials.username);
                self.start_with(url, Some(credentials)).await
            }
            None => {
                let e = DownloadError::transport(format!("Authentication required for {}", url));
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    pub fn on_metadata(&mut self, metadata: ResponseMetadata) {
        let Some(transfer) = self.transfer.as_mut() else {
            return;
        };

        if let Some(total) = metadata.content_length {
            transfer.record_progress(transfer.bytes_received, Some(total));
        }

        if let Some(name) = metadata
            .content_disposition
            .as_deref()
            .and_then(filename_from_content_disposition)
        {
            if transfer.write_started() {
                debug!("Ignoring server filename {:?}, writing already started", name);
            } else {
                debug!("Server suggested filename {:?}", name);
                transfer.destination_name = Some(name);
            }
        }

        if transfer.destination_name.is_none() {
            transfer.destination_name = Some(fallback_name(&transfer.source_url));
        }
    }

    pub async fn on_data(&mut self, chunk: &[u8]) -> Result<()> {
        self.throttle(chunk.len()).await;

        let dir = self.options.download_dir.clone();
        let transfer = self
            .transfer
            .as_mut()
            .ok_or_else(|| DownloadError::transport("Data received without an active transfer"))?;

        if transfer.destination_name.is_none() {
            transfer.pending.extend_from_slice(chunk);
            return Ok(());
        }

        let staging = open_staging(transfer, &dir).await?;
        staging.write(chunk).await
    }

    pub fn on_progress(&mut self, received: u64, total: Option<u64>) {
        if let Some(transfer) = self.transfer.as_mut() {
            transfer.record_progress(received, total);
            self.progress.update(
                transfer.bytes_received,
                transfer.bytes_total,
                transfer.started_at.elapsed(),
            );
        }
    }

    pub async fn on_complete(&mut self, status: CompletionStatus) -> Result<TransferOutcome> {
        self.finished = true;
        let Some(mut transfer) = self.transfer.take() else {
            return Err(DownloadError::transport("No active transfer"));
        };

        let status = if self.abort.is_cancelled() {
            CompletionStatus::Aborted
        } else {
            status
        };

        match status {
            CompletionStatus::Error(message) => {
                if let Some(staging) = transfer.staging.take() {
                    staging.discard().await;
                }
                warn!("Download error: {}", message);
                self.progress.abandon("Download failed".to_string());
                Err(DownloadError::Transport { message })
            }
            CompletionStatus::Aborted => {
                if let Some(staging) = transfer.staging.take() {
                    staging.discard().await;
                }
                info!("Download of {} cancelled", transfer.source_url);
                self.progress.abandon("Download cancelled".to_string());
                Ok(TransferOutcome::Cancelled)
            }
            CompletionStatus::Success => {
                if transfer.destination_name.is_none() {
                    transfer.destination_name = Some(fallback_name(&transfer.source_url));
                }

                // Also creates the sink for an empty body.
                if let Err(e) = open_staging(&mut transfer, &self.options.download_dir).await {
                    if let Some(staging) = transfer.staging.take() {
                        staging.discard().await;
                    }
                    self.progress.abandon("Failed to save downloaded file".to_string());
                    return Err(e);
                }

                let Some(staging) = transfer.staging.take() else {
                    return Err(DownloadError::transport("Staging file disappeared"));
                };
                let bytes = staging.written();

                match staging.commit(self.options.expected_sha256.as_deref()).await {
                    Ok(path) => {
                        info!("Saved {} ({})", path.display(), format_size(bytes));
                        self.progress.finish(format!("Downloaded {}", format_size(bytes)));
                        Ok(TransferOutcome::Committed {
                            url_id: self.url_id.clone(),
                            path,
                            bytes,
                        })
                    }
                    Err(e) => {
                        warn!("Failed to save downloaded file: {}", e);
                        self.progress.abandon("Failed to save downloaded file".to_string());
                        Err(e)
                    }
                }
            }
        }
    }

    /// Handles a user request to stop, according to the update policy.
    pub async fn cancel(&mut self) -> CancelDecision {
        let policy = self.options.policy;

        if self.finished || self.transfer.is_none() {
            return match policy {
                UpdatePolicy::Mandatory => CancelDecision::Terminate,
                UpdatePolicy::Optional => CancelDecision::Continue,
            };
        }

        let prompt = self.prompt.clone();
        let decision = tokio::task::spawn_blocking(move || match policy {
            UpdatePolicy::Mandatory if prompt.confirm_terminate() => CancelDecision::Terminate,
            UpdatePolicy::Optional if prompt.confirm_abort() => CancelDecision::Abort,
            _ => CancelDecision::Continue,
        })
        .await
        .unwrap_or(CancelDecision::Continue);

        match decision {
            CancelDecision::Continue => debug!("Cancellation declined"),
            CancelDecision::Abort => {
                info!("Aborting download");
                self.abort.cancel();
            }
            CancelDecision::Terminate => {
                warn!("Mandatory update cancelled, terminating");
                self.abort.cancel();
                self.discard_staging().await;
                self.transfer = None;
                self.finished = true;
                self.progress.abandon("Download cancelled".to_string());
            }
        }

        decision
    }

    async fn fail(&mut self, error: &DownloadError) {
        warn!("{}", error);
        self.abort.cancel();
        self.discard_staging().await;
        self.transfer = None;
        self.finished = true;
        self.progress.abandon("Download failed".to_string());
    }

    async fn discard_staging(&mut self) {
        if let Some(transfer) = self.transfer.as_mut() {
            transfer.pending.clear();
            if let Some(staging) = transfer.staging.take() {
                staging.discard().await;
            }
        }
    }

    async fn throttle(&self, len: usize) {
        let (Some(limiter), Some(limit)) = (&self.rate_limiter, self.options.rate_limit) else {
            return;
        };

        // Never ask for more than the burst size in one go.
        let mut left = len;
        while left > 0 {
            let n = left.min(limit as usize);
            if let Some(n) = NonZeroU32::new(n as u32) {
                if limiter.until_n_ready(n).await.is_err() {
                    return;
                }
            }
            left -= n;
        }
    }
}

/// Opens the staging sink on first use and moves buffered bytes into it.
async fn open_staging<'a>(transfer: &'a mut Transfer, dir: &Path) -> Result<&'a mut StagingFile> {
    let staging = match transfer.staging.take() {
        Some(staging) => staging,
        None => {
            let name = transfer
                .destination_name
                .clone()
                .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string());
            StagingFile::open(dir.join(name)).await?
        }
    };
    let staging = transfer.staging.insert(staging);

    if !transfer.pending.is_empty() {
        let pending = std::mem::take(&mut transfer.pending);
        staging.write(&pending).await?;
    }

    Ok(staging)
}

fn ends_fetch(event: &TransportEvent) -> bool {
    matches!(
        event,
        TransportEvent::Completed(_)
            | TransportEvent::Redirect(_)
            | TransportEvent::AuthenticationRequired { .. }
    )
}

fn fallback_name(url: &Url) -> String {
    get_filename_from_url(url)
        .map(|name| sanitize_filename(&name))
        .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string())
}
