//! Test doubles: an in-memory assistant whose fragment streams are fed by the test body,
//! and a one-shot local HTTP backend.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chatline_assistant::{
    AssistantService, BoxFuture, ExchangeRequest, FragmentEvent, FragmentStreamHandle,
    HealthStatus, ServiceError, ServiceResult, ServiceWorker, make_fragment_stream,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

#[derive(Default)]
pub(crate) struct ScriptedService {
    requests: Mutex<Vec<String>>,
    senders: Mutex<Vec<mpsc::UnboundedSender<FragmentEvent>>>,
    open_failure: Mutex<Option<String>>,
    resets: AtomicUsize,
}

impl ScriptedService {
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    /// Feeds an event into the stream opened by the `index`-th exchange.
    pub fn send(&self, index: usize, event: FragmentEvent) {
        let senders = self.senders.lock().unwrap();
        let _ = senders[index].send(event);
    }

    /// Drops every stream sender without a terminal event.
    pub fn close_all(&self) {
        self.senders.lock().unwrap().clear();
    }

    pub fn fail_next_open(&self, message: &str) {
        *self.open_failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

impl AssistantService for ScriptedService {
    fn id(&self) -> &str {
        "scripted"
    }

    fn open_exchange(&self, request: ExchangeRequest) -> ServiceResult<FragmentStreamHandle> {
        self.requests.lock().unwrap().push(request.message);

        if let Some(message) = self.open_failure.lock().unwrap().take() {
            return Err(ServiceError::RemoteFailure {
                stage: "scripted-open",
                message,
            });
        }

        let (event_tx, stream, cancel_rx) = make_fragment_stream();
        self.senders.lock().unwrap().push(event_tx);
        let worker: ServiceWorker = Box::pin(async move {
            let _ = cancel_rx.await;
        });

        Ok(FragmentStreamHandle { stream, worker })
    }

    fn health<'a>(&'a self) -> BoxFuture<'a, ServiceResult<HealthStatus>> {
        Box::pin(async {
            Ok(HealthStatus {
                status: "healthy".to_string(),
                message: "scripted".to_string(),
            })
        })
    }

    fn reset_conversation(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// Serves a single `/chat` connection on localhost and returns the endpoint.
///
/// `reply` is `(content_type, body)`; with `None` the request is read and never answered.
pub(crate) async fn serve_once(reply: Option<(&'static str, &'static str)>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("http://{}", listener.local_addr().unwrap());

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut chunk = [0_u8; 1024];
        while !request_complete(&request) {
            let read = socket.read(&mut chunk).await.unwrap();
            if read == 0 {
                return;
            }
            request.extend_from_slice(&chunk[..read]);
        }

        let Some((content_type, body)) = reply else {
            tokio::time::sleep(Duration::from_secs(5)).await;
            return;
        };
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nConnection: close\r\n\r\n{body}"
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.unwrap();
    });

    endpoint
}

fn request_complete(buffer: &[u8]) -> bool {
    let text = String::from_utf8_lossy(buffer);
    let Some(header_end) = text.find("\r\n\r\n") else {
        return false;
    };
    let content_length = text[..header_end]
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    buffer.len() >= header_end + 4 + content_length
}
