use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Deserialize;
use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

pub const DEFAULT_ENDPOINT: &str = "http://localhost:8000";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub endpoint: String,
    /// Caps a whole JSON reply and any single idle gap of a streamed one.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT)
    }
}

impl ServiceConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim().trim_end_matches('/').to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// One user message handed to the remote assistant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeRequest {
    pub message: String,
}

impl ExchangeRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Service-agnostic reply payload.
///
/// A stream yields any number of `Delta`s followed by at most one terminal event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentEvent {
    Delta(String),
    Done,
    Failed(String),
}

impl FragmentEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub message: String,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status.trim().eq_ignore_ascii_case("healthy")
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ServiceWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ServiceError {
    #[snafu(display("assistant endpoint '{endpoint}' is invalid: {details}"))]
    InvalidEndpoint {
        stage: &'static str,
        endpoint: String,
        details: String,
    },
    #[snafu(display("exchange request has an empty message"))]
    EmptyMessage { stage: &'static str },
    #[snafu(display("failed to build http client on `{stage}`, {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("http request failed on `{stage}`, {source}"))]
    Request {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("assistant reply did not finish within {timeout:?} on `{stage}`"))]
    TimedOut {
        stage: &'static str,
        timeout: Duration,
        source: tokio::time::error::Elapsed,
    },
    #[snafu(display("assistant returned status {status}: {body}"))]
    Status {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to decode assistant reply on `{stage}`, {source}"))]
    DecodeBody {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("assistant reported a failure: {message}"))]
    RemoteFailure {
        stage: &'static str,
        message: String,
    },
}

/// Receiving end of one exchange.
///
/// Dropping the stream signals cancellation to the worker that feeds it.
pub struct FragmentStream {
    events: mpsc::UnboundedReceiver<FragmentEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct FragmentStreamHandle {
    pub stream: FragmentStream,
    pub worker: ServiceWorker,
}

impl FragmentStream {
    pub(crate) fn new(
        events: mpsc::UnboundedReceiver<FragmentEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub async fn recv(&mut self) -> Option<FragmentEvent> {
        self.events.recv().await
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for FragmentStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

pub trait AssistantService: Send + Sync {
    fn id(&self) -> &str;

    /// Starts one exchange. Nothing happens on the wire until `worker` is polled.
    fn open_exchange(&self, request: ExchangeRequest) -> ServiceResult<FragmentStreamHandle>;

    fn health<'a>(&'a self) -> BoxFuture<'a, ServiceResult<HealthStatus>>;

    /// Forgets any server-side conversation identity so the next exchange starts fresh.
    fn reset_conversation(&self) {}
}

/// Creates the channel pair a worker writes fragments into.
pub fn make_fragment_stream() -> (
    mpsc::UnboundedSender<FragmentEvent>,
    FragmentStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        FragmentStream::new(event_rx, cancel_tx),
        cancel_rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_trims_trailing_slashes() {
        let config = ServiceConfig::new("  http://localhost:8000/ ");
        assert_eq!(config.endpoint, "http://localhost:8000");
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
    }

    #[test]
    fn dropping_stream_signals_worker() {
        let (_event_tx, stream, mut cancel_rx) = make_fragment_stream();
        drop(stream);
        assert!(cancel_rx.try_recv().is_ok());
    }

    #[test]
    fn explicit_cancel_fires_once() {
        let (_event_tx, mut stream, mut cancel_rx) = make_fragment_stream();
        assert!(stream.cancel());
        assert!(!stream.cancel());
        assert!(cancel_rx.try_recv().is_ok());
    }

    #[test]
    fn health_status_is_case_insensitive() {
        let status: HealthStatus =
            serde_json::from_str(r#"{"status":"Healthy","message":"ChatBot API is running"}"#)
                .expect("valid health payload");
        assert!(status.is_healthy());
        assert_eq!(status.message, "ChatBot API is running");
    }
}
