use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::{header, redirect, Client, StatusCode};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: Url,
    pub user_agent: Option<String>,
    pub credentials: Option<Credentials>,
    pub inactivity_timeout: Duration,
    pub abort: CancellationToken,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMetadata {
    pub content_disposition: Option<String>,
    pub content_length: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    Error(String),
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Redirect(Url),
    AuthenticationRequired { realm: Option<String> },
    MetadataReady(ResponseMetadata),
    DataChunk(Bytes),
    Progress { received: u64, total: Option<u64> },
    Completed(CompletionStatus),
}

/// Source of transfer events. A fetch ends with `Completed`, or with
/// `Redirect`/`AuthenticationRequired` when the caller has to restart it.
/// Cancelling `FetchRequest::abort` must lead to `Completed(Aborted)`.
pub trait Transport: Send + Sync {
    fn fetch(&self, request: FetchRequest) -> BoxStream<'static, TransportEvent>;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Redirects are never followed by the client; they come back as events.
    pub fn new() -> reqwest::Result<Self> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self { client })
    }
}

enum FetchState {
    Connect {
        client: Client,
        request: FetchRequest,
    },
    Streaming {
        stream: BoxStream<'static, reqwest::Result<Bytes>>,
        received: u64,
        total: Option<u64>,
        timeout: Duration,
        abort: CancellationToken,
    },
    Finished,
}

impl Transport for HttpTransport {
    fn fetch(&self, request: FetchRequest) -> BoxStream<'static, TransportEvent> {
        let start = FetchState::Connect {
            client: self.client.clone(),
            request,
        };

        stream::unfold(start, |state| async move {
            match state {
                FetchState::Connect { client, request } => Some(connect(client, request).await),
                FetchState::Streaming {
                    mut stream,
                    mut received,
                    total,
                    timeout,
                    abort,
                } => {
                    let next = tokio::select! {
                        biased;
                        _ = abort.cancelled() => {
                            return Some((vec![completed(CompletionStatus::Aborted)], FetchState::Finished));
                        }
                        next = tokio::time::timeout(timeout, stream.next()) => next,
                    };

                    match next {
                        Err(_) => Some((
                            vec![completed(CompletionStatus::Error(format!(
                                "No data received for {:?}",
                                timeout
                            )))],
                            FetchState::Finished,
                        )),
                        Ok(Some(Ok(chunk))) => {
                            received += chunk.len() as u64;
                            Some((
                                vec![
                                    TransportEvent::DataChunk(chunk),
                                    TransportEvent::Progress { received, total },
                                ],
                                FetchState::Streaming {
                                    stream,
                                    received,
                                    total,
                                    timeout,
                                    abort,
                                },
                            ))
                        }
                        Ok(Some(Err(e))) => Some((
                            vec![completed(CompletionStatus::Error(e.to_string()))],
                            FetchState::Finished,
                        )),
                        Ok(None) => Some((vec![completed(CompletionStatus::Success)], FetchState::Finished)),
                    }
                }
                FetchState::Finished => None,
            }
        })
        .flat_map(stream::iter)
        .boxed()
    }
}

async fn connect(client: Client, request: FetchRequest) -> (Vec<TransportEvent>, FetchState) {
    let mut builder = client.get(request.url.clone());
    if let Some(agent) = &request.user_agent {
        builder = builder.header(header::USER_AGENT, agent.as_str());
    }
    if let Some(credentials) = &request.credentials {
        builder = builder.basic_auth(&credentials.username, Some(&credentials.password));
    }

    let sent = tokio::select! {
        biased;
        _ = request.abort.cancelled() => {
            return (vec![completed(CompletionStatus::Aborted)], FetchState::Finished);
        }
        sent = tokio::time::timeout(request.inactivity_timeout, builder.send()) => sent,
    };

    let response = match sent {
        Err(_) => {
            return (
                vec![completed(CompletionStatus::Error(format!(
                    "No response within {:?}",
                    request.inactivity_timeout
                )))],
                FetchState::Finished,
            );
        }
        Ok(Err(e)) => {
            return (vec![completed(CompletionStatus::Error(e.to_string()))], FetchState::Finished);
        }
        Ok(Ok(response)) => response,
    };

    let status = response.status();
    debug!("{} answered {}", request.url, status);

    if status.is_redirection() {
        let target = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|location| request.url.join(location).ok());

        return match target {
            Some(url) => (vec![TransportEvent::Redirect(url)], FetchState::Finished),
            None => (
                vec![completed(CompletionStatus::Error(format!(
                    "Redirect ({}) without a usable Location header",
                    status
                )))],
                FetchState::Finished,
            ),
        };
    }

    if status == StatusCode::UNAUTHORIZED {
        let realm = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_realm);
        return (
            vec![TransportEvent::AuthenticationRequired { realm }],
            FetchState::Finished,
        );
    }

    if !status.is_success() {
        return (
            vec![completed(CompletionStatus::Error(format!("Server returned {}", status)))],
            FetchState::Finished,
        );
    }

    let metadata = ResponseMetadata {
        content_disposition: response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string()),
        content_length: response.content_length(),
    };
    let total = metadata.content_length;

    (
        vec![
            TransportEvent::MetadataReady(metadata),
            TransportEvent::Progress { received: 0, total },
        ],
        FetchState::Streaming {
            stream: response.bytes_stream().boxed(),
            received: 0,
            total,
            timeout: request.inactivity_timeout,
            abort: request.abort,
        },
    )
}

fn completed(status: CompletionStatus) -> TransportEvent {
    TransportEvent::Completed(status)
}

fn parse_realm(challenge: &str) -> Option<String> {
    let pos = challenge.to_ascii_lowercase().find("realm=")?;
    let value = &challenge[pos + "realm=".len()..];
    let value = match value.strip_prefix('"') {
        Some(quoted) => quoted.split('"').next().unwrap_or(quoted),
        None => value.split(',').next().unwrap_or(value),
    };
    Some(value.trim().to_string()).filter(|v| !v.is_empty())
}
