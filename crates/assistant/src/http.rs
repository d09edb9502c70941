use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::service::{
    AssistantService, BoxFuture, BuildClientSnafu, DecodeBodySnafu, EmptyMessageSnafu,
    ExchangeRequest, FragmentEvent, FragmentStreamHandle, HealthStatus, InvalidEndpointSnafu,
    RemoteFailureSnafu, RequestSnafu, ServiceConfig, ServiceResult, ServiceWorker, StatusSnafu,
    TimedOutSnafu, make_fragment_stream,
};
use super::wire::{ChatRequest, ChatResponse, ReplyFormat, SseDecoder, SseEvent, Utf8Decoder};

pub const HTTP_SERVICE_ID: &str = "http";

/// Talks to the chat backend over `POST /chat` and `GET /health`.
pub struct HttpAssistant {
    config: ServiceConfig,
    client: reqwest::Client,
    conversation_id: Arc<ArcSwapOption<String>>,
}

/// Everything one exchange worker needs, detached from the service borrow.
struct ExchangeContext {
    client: reqwest::Client,
    chat_url: String,
    message: String,
    request_timeout: Duration,
    conversation_id: Arc<ArcSwapOption<String>>,
}

impl HttpAssistant {
    pub fn new(config: ServiceConfig) -> ServiceResult<Self> {
        ensure!(
            !config.endpoint.is_empty(),
            InvalidEndpointSnafu {
                stage: "http-assistant-new",
                endpoint: config.endpoint.clone(),
                details: "endpoint is empty".to_string(),
            }
        );

        if let Err(error) = reqwest::Url::parse(&config.endpoint) {
            return InvalidEndpointSnafu {
                stage: "parse-endpoint",
                endpoint: config.endpoint.clone(),
                details: error.to_string(),
            }
            .fail();
        }

        // Streamed replies may run long; only idle gaps are bounded on the client.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.request_timeout)
            .build()
            .context(BuildClientSnafu {
                stage: "build-client",
            })?;

        Ok(Self {
            config,
            client,
            conversation_id: Arc::new(ArcSwapOption::empty()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    /// Server-assigned conversation id from the most recent reply, if any.
    pub fn conversation_id(&self) -> Option<String> {
        self.conversation_id
            .load_full()
            .map(|id| id.as_ref().clone())
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.endpoint, path)
    }

    async fn run_exchange_worker(
        context: ExchangeContext,
        event_tx: mpsc::UnboundedSender<FragmentEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let outcome = tokio::select! {
            _ = &mut cancel_rx => {
                // Dropping the in-flight request future aborts the connection.
                tracing::debug!(url = %context.chat_url, "assistant exchange cancelled");
                return;
            }
            outcome = Self::drive_exchange(&context, &event_tx) => outcome,
        };

        match outcome {
            Ok(()) => {
                let _ = event_tx.send(FragmentEvent::Done);
            }
            Err(error) => {
                tracing::warn!(
                    url = %context.chat_url,
                    error = %error,
                    "assistant exchange failed"
                );
                let _ = event_tx.send(FragmentEvent::Failed(error.to_string()));
            }
        }
    }

    async fn drive_exchange(
        context: &ExchangeContext,
        event_tx: &mpsc::UnboundedSender<FragmentEvent>,
    ) -> ServiceResult<()> {
        let session_id = context.conversation_id.load_full();
        let body = ChatRequest {
            message: &context.message,
            session_id: session_id.as_deref().map(String::as_str),
        };

        let response = context
            .client
            .post(&context.chat_url)
            .json(&body)
            .send()
            .await
            .context(RequestSnafu {
                stage: "send-chat-request",
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return StatusSnafu {
                stage: "chat-http-status",
                status: status.as_u16(),
                body,
            }
            .fail();
        }

        let format = ReplyFormat::from_content_type(
            response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok()),
        );
        tracing::debug!(?format, status = status.as_u16(), "assistant reply started");

        match format {
            ReplyFormat::Json => {
                let payload = tokio::time::timeout(context.request_timeout, response.bytes())
                    .await
                    .context(TimedOutSnafu {
                        stage: "read-json-reply",
                        timeout: context.request_timeout,
                    })?
                    .context(RequestSnafu {
                        stage: "read-json-reply",
                    })?;
                let reply: ChatResponse =
                    serde_json::from_slice(&payload).context(DecodeBodySnafu {
                        stage: "decode-json-reply",
                    })?;

                if let Some(session_id) = reply
                    .session_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                {
                    context
                        .conversation_id
                        .store(Some(Arc::new(session_id.to_string())));
                }

                emit_delta(event_tx, reply.reply_text());
                Ok(())
            }
            ReplyFormat::EventStream => {
                let mut decoder = SseDecoder::default();
                let mut body = response.bytes_stream();

                while let Some(chunk) = body.next().await {
                    let chunk = chunk.context(RequestSnafu {
                        stage: "read-event-stream",
                    })?;
                    if apply_sse_events(event_tx, decoder.push(&chunk))? {
                        return Ok(());
                    }
                }

                apply_sse_events(event_tx, decoder.finish())?;
                Ok(())
            }
            ReplyFormat::PlainText => {
                let mut decoder = Utf8Decoder::default();
                let mut body = response.bytes_stream();

                while let Some(chunk) = body.next().await {
                    let chunk = chunk.context(RequestSnafu {
                        stage: "read-text-stream",
                    })?;
                    if !emit_delta(event_tx, &decoder.push(&chunk)) {
                        return Ok(());
                    }
                }

                emit_delta(event_tx, &decoder.finish());
                Ok(())
            }
        }
    }

    async fn fetch_health(&self) -> ServiceResult<HealthStatus> {
        let response = self
            .client
            .get(self.url("health"))
            .timeout(self.config.request_timeout)
            .send()
            .await
            .context(RequestSnafu {
                stage: "send-health-request",
            })?;

        let status = response.status();
        let payload = response.bytes().await.context(RequestSnafu {
            stage: "read-health-response",
        })?;

        if !status.is_success() {
            return StatusSnafu {
                stage: "health-http-status",
                status: status.as_u16(),
                body: String::from_utf8_lossy(&payload).into_owned(),
            }
            .fail();
        }

        serde_json::from_slice(&payload).context(DecodeBodySnafu {
            stage: "decode-health-response",
        })
    }
}

/// Forwards one non-empty delta; returns false once the receiver is gone.
fn emit_delta(event_tx: &mpsc::UnboundedSender<FragmentEvent>, text: &str) -> bool {
    if text.is_empty() {
        return !event_tx.is_closed();
    }
    event_tx.send(FragmentEvent::Delta(text.to_string())).is_ok()
}

/// Returns `Ok(true)` when the stream reached its end marker or the receiver went away.
fn apply_sse_events(
    event_tx: &mpsc::UnboundedSender<FragmentEvent>,
    events: Vec<SseEvent>,
) -> ServiceResult<bool> {
    for event in events {
        match event {
            SseEvent::Data(text) => {
                if !emit_delta(event_tx, &text) {
                    return Ok(true);
                }
            }
            SseEvent::Done => return Ok(true),
            SseEvent::Error(message) => {
                return RemoteFailureSnafu {
                    stage: "event-stream-error",
                    message,
                }
                .fail();
            }
        }
    }
    Ok(false)
}

impl AssistantService for HttpAssistant {
    fn id(&self) -> &str {
        HTTP_SERVICE_ID
    }

    fn open_exchange(&self, request: ExchangeRequest) -> ServiceResult<FragmentStreamHandle> {
        ensure!(
            !request.message.trim().is_empty(),
            EmptyMessageSnafu {
                stage: "open-exchange",
            }
        );

        let context = ExchangeContext {
            client: self.client.clone(),
            chat_url: self.url("chat"),
            message: request.message,
            request_timeout: self.config.request_timeout,
            conversation_id: Arc::clone(&self.conversation_id),
        };

        let (event_tx, stream, cancel_rx) = make_fragment_stream();
        let worker: ServiceWorker =
            Box::pin(Self::run_exchange_worker(context, event_tx, cancel_rx));

        Ok(FragmentStreamHandle { stream, worker })
    }

    fn health<'a>(&'a self) -> BoxFuture<'a, ServiceResult<HealthStatus>> {
        Box::pin(self.fetch_health())
    }

    fn reset_conversation(&self) {
        if self.conversation_id.swap(None).is_some() {
            tracing::debug!(endpoint = %self.config.endpoint, "forgot server conversation id");
        }
    }
}
