use std::sync::Arc;

use chatline_assistant::{
    AssistantService, ExchangeRequest, FragmentEvent, FragmentStream, UNPROCESSED_REPLY,
};
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use crate::error::{EmptyInputSnafu, LogSnafu, SubmitResult};
use crate::log::{Author, ChangeEvent, LogError, MessageLog, TurnId, TurnStatus};

/// Replaces an assistant turn that failed before any text arrived.
pub const FALLBACK_REPLY: &str = "Error connecting to server.";

/// Appended to partial text when an exchange fails midway.
pub const TRUNCATION_MARKER: &str = "\n\n[response truncated]";

pub(crate) const STREAM_CLOSED_EARLY: &str = "assistant stream ended before a terminal event";

/// Identifier for one request/response exchange.
///
/// This must change on every submit so late fragments of an earlier exchange can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeId(pub u64);

impl ExchangeId {
    /// Creates a typed exchange identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A fragment event tagged with the exchange that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeEvent {
    pub exchange_id: ExchangeId,
    pub payload: FragmentEvent,
}

impl ExchangeEvent {
    pub fn new(exchange_id: ExchangeId, payload: FragmentEvent) -> Self {
        Self {
            exchange_id,
            payload,
        }
    }
}

/// What applying one event did to the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Continue,
    Completed,
    Failed(String),
    Cancelled,
    Stale,
}

impl ExchangeOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::Cancelled)
    }
}

/// The one in-flight exchange. Dropping it stops the fragment pump.
#[derive(Debug)]
pub struct ActiveExchange {
    pub id: ExchangeId,
    pub user_turn_id: TurnId,
    pub assistant_turn_id: TurnId,
    cancelled: bool,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl ActiveExchange {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Marks the exchange cancelled and asks the pump to stop. Best effort.
    pub fn cancel(&mut self) -> bool {
        if self.cancelled {
            return false;
        }
        self.cancelled = true;
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
        true
    }
}

impl Drop for ActiveExchange {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// Opens exchanges against the assistant service and folds their fragments into the log.
pub struct ExchangeController {
    service: Arc<dyn AssistantService>,
    events_tx: mpsc::UnboundedSender<ExchangeEvent>,
    next_exchange_id: u64,
}

impl ExchangeController {
    pub fn new(
        service: Arc<dyn AssistantService>,
        events_tx: mpsc::UnboundedSender<ExchangeEvent>,
    ) -> Self {
        Self {
            service,
            events_tx,
            next_exchange_id: 1,
        }
    }

    pub fn service(&self) -> &Arc<dyn AssistantService> {
        &self.service
    }

    /// Appends the user turn and a streaming assistant placeholder, then starts the exchange.
    ///
    /// Fragments are delivered later as [`ExchangeEvent`]s on the session channel. A
    /// service that refuses to open is reported the same way, as the exchange's only event.
    /// Must be called from within a tokio runtime.
    pub fn begin(
        &mut self,
        log: &mut MessageLog,
        user_text: &str,
        changes: &mut Vec<ChangeEvent>,
    ) -> SubmitResult<ActiveExchange> {
        ensure!(
            !user_text.trim().is_empty(),
            EmptyInputSnafu {
                stage: "begin-exchange",
            }
        );

        let (user_turn_id, assistant_turn_id) = Self::append_turns(log, user_text, changes)
            .context(LogSnafu {
                stage: "append-exchange-turns",
            })?;

        let id = self.allocate_exchange_id();
        let (cancel_tx, cancel_rx) = oneshot::channel();

        match self.service.open_exchange(ExchangeRequest::new(user_text)) {
            Ok(handle) => {
                tokio::spawn(pump_fragments(
                    id,
                    handle.stream,
                    self.events_tx.clone(),
                    cancel_rx,
                ));
                tokio::spawn(handle.worker);
            }
            Err(error) => {
                tracing::warn!(
                    exchange_id = id.0,
                    service = self.service.id(),
                    error = %error,
                    "assistant refused to open exchange"
                );
                let _ = self
                    .events_tx
                    .send(ExchangeEvent::new(id, FragmentEvent::Failed(error.to_string())));
            }
        }

        tracing::debug!(
            exchange_id = id.0,
            user_turn_id = user_turn_id.0,
            assistant_turn_id = assistant_turn_id.0,
            "exchange started"
        );

        Ok(ActiveExchange {
            id,
            user_turn_id,
            assistant_turn_id,
            cancelled: false,
            cancel_tx: Some(cancel_tx),
        })
    }

    /// Applies one event to the assistant turn of `active`.
    pub fn apply(
        log: &mut MessageLog,
        active: &ActiveExchange,
        event: ExchangeEvent,
        changes: &mut Vec<ChangeEvent>,
    ) -> ExchangeOutcome {
        if event.exchange_id != active.id {
            tracing::debug!(
                event_exchange_id = event.exchange_id.0,
                active_exchange_id = active.id.0,
                "dropping stale exchange event"
            );
            return ExchangeOutcome::Stale;
        }

        let turn_id = active.assistant_turn_id;
        if active.is_cancelled() {
            finalize_turn(log, turn_id, changes);
            return ExchangeOutcome::Cancelled;
        }

        match event.payload {
            FragmentEvent::Delta(text) => {
                if text.is_empty() {
                    return ExchangeOutcome::Continue;
                }
                match log.update_content(turn_id, &text) {
                    Ok(()) => changes.push(ChangeEvent::ContentAppended {
                        id: turn_id,
                        delta: text,
                    }),
                    Err(error) => report_log_error(&error),
                }
                ExchangeOutcome::Continue
            }
            FragmentEvent::Done => {
                complete_turn(log, turn_id, changes);
                ExchangeOutcome::Completed
            }
            FragmentEvent::Failed(reason) => {
                fail_turn(log, turn_id, changes);
                ExchangeOutcome::Failed(reason)
            }
        }
    }

    /// Cancels `active` and finalizes its assistant turn with whatever text arrived.
    pub fn stop(
        log: &mut MessageLog,
        active: &mut ActiveExchange,
        changes: &mut Vec<ChangeEvent>,
    ) -> ExchangeOutcome {
        active.cancel();
        finalize_turn(log, active.assistant_turn_id, changes);
        ExchangeOutcome::Cancelled
    }

    fn append_turns(
        log: &mut MessageLog,
        user_text: &str,
        changes: &mut Vec<ChangeEvent>,
    ) -> Result<(TurnId, TurnId), LogError> {
        let user_turn_id = log.append(Author::User, user_text, TurnStatus::Final)?;
        changes.push(ChangeEvent::Appended(user_turn_id));
        let assistant_turn_id = log.append(Author::Assistant, "", TurnStatus::Streaming)?;
        changes.push(ChangeEvent::Appended(assistant_turn_id));
        Ok((user_turn_id, assistant_turn_id))
    }

    fn allocate_exchange_id(&mut self) -> ExchangeId {
        let id = ExchangeId::new(self.next_exchange_id);
        self.next_exchange_id = self.next_exchange_id.saturating_add(1);
        id
    }
}

fn finalize_turn(log: &mut MessageLog, turn_id: TurnId, changes: &mut Vec<ChangeEvent>) {
    let was_streaming = log.get(turn_id).is_some_and(|turn| turn.is_streaming());
    match log.finalize(turn_id) {
        Ok(()) if was_streaming => changes.push(ChangeEvent::Finalized(turn_id)),
        Ok(()) => {}
        Err(error) => report_log_error(&error),
    }
}

/// A reply that ended without any text still leaves a visible answer.
fn complete_turn(log: &mut MessageLog, turn_id: TurnId, changes: &mut Vec<ChangeEvent>) {
    let is_empty = log
        .get(turn_id)
        .is_some_and(|turn| turn.is_streaming() && turn.content.is_empty());
    if is_empty {
        match log.replace_content(turn_id, UNPROCESSED_REPLY) {
            Ok(()) => changes.push(ChangeEvent::ContentReplaced(turn_id)),
            Err(error) => report_log_error(&error),
        }
    }
    finalize_turn(log, turn_id, changes);
}

fn fail_turn(log: &mut MessageLog, turn_id: TurnId, changes: &mut Vec<ChangeEvent>) {
    let has_text = log
        .get(turn_id)
        .is_some_and(|turn| !turn.content.is_empty());

    let result = if has_text {
        log.update_content(turn_id, TRUNCATION_MARKER).map(|()| {
            changes.push(ChangeEvent::ContentAppended {
                id: turn_id,
                delta: TRUNCATION_MARKER.to_string(),
            })
        })
    } else {
        log.replace_content(turn_id, FALLBACK_REPLY)
            .map(|()| changes.push(ChangeEvent::ContentReplaced(turn_id)))
    };

    if let Err(error) = result {
        report_log_error(&error);
    }
    finalize_turn(log, turn_id, changes);
}

fn report_log_error(error: &LogError) {
    tracing::error!(error = %error, "message log contract violated");
}

/// Forwards fragments of one exchange into the session channel until a terminal event,
/// cancellation, or the stream closing.
async fn pump_fragments(
    exchange_id: ExchangeId,
    mut stream: FragmentStream,
    events_tx: mpsc::UnboundedSender<ExchangeEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut cancel_rx => {
                stream.cancel();
                tracing::debug!(exchange_id = exchange_id.0, "fragment pump cancelled");
                return;
            }
            event = stream.recv() => {
                let payload = match event {
                    Some(payload) => payload,
                    None => FragmentEvent::Failed(STREAM_CLOSED_EARLY.to_string()),
                };
                let terminal = payload.is_terminal();
                if events_tx.send(ExchangeEvent::new(exchange_id, payload)).is_err() || terminal {
                    return;
                }
            }
        }
    }
}
