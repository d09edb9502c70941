use std::sync::Arc;

use chatline_assistant::AssistantService;
use tokio::sync::mpsc;

use crate::error::{BusySnafu, SubmitResult};
use crate::exchange::{
    ActiveExchange, ExchangeController, ExchangeEvent, ExchangeId, ExchangeOutcome,
};
use crate::log::{ChangeEvent, MessageLog, Turn, TurnId};

pub const DEFAULT_GREETING: &str = "Hi there, how can I help you?";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub greeting: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            greeting: DEFAULT_GREETING.to_string(),
        }
    }
}

impl SessionConfig {
    pub fn with_greeting(greeting: impl Into<String>) -> Self {
        Self {
            greeting: greeting.into(),
        }
    }
}

/// Session lifecycle. `Exchanging` iff an exchange is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Exchanging(ExchangeId),
}

/// Receiving end of the exchange event channel.
///
/// Whoever drives the session owns this and feeds each event back through
/// [`Session::handle_event`].
pub struct SessionEvents {
    events_rx: mpsc::UnboundedReceiver<ExchangeEvent>,
}

impl SessionEvents {
    pub async fn recv(&mut self) -> Option<ExchangeEvent> {
        self.events_rx.recv().await
    }
}

type ChangeObserver = Box<dyn FnMut(&ChangeEvent) + Send>;

/// Chat session state machine.
///
/// Owns the message log and at most one in-flight exchange. Every flag it exposes is
/// derived from those two on read.
pub struct Session {
    log: MessageLog,
    controller: ExchangeController,
    active: Option<ActiveExchange>,
    last_error: Option<String>,
    greeting: String,
    observers: Vec<ChangeObserver>,
}

impl Session {
    pub fn new(
        service: Arc<dyn AssistantService>,
        config: SessionConfig,
    ) -> (Self, SessionEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Self {
            log: MessageLog::seeded(config.greeting.clone()),
            controller: ExchangeController::new(service, events_tx),
            active: None,
            last_error: None,
            greeting: config.greeting,
            observers: Vec::new(),
        };
        (session, SessionEvents { events_rx })
    }

    /// Registers an observer fired after every log mutation.
    pub fn subscribe(&mut self, observer: impl FnMut(&ChangeEvent) + Send + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn service(&self) -> &Arc<dyn AssistantService> {
        self.controller.service()
    }

    /// Starts an exchange for `text`. Must be called from within a tokio runtime.
    pub fn submit(&mut self, text: &str) -> SubmitResult<ExchangeId> {
        if let Some(active) = &self.active {
            tracing::debug!(active_exchange_id = active.id.0, "submit refused while busy");
            return BusySnafu {
                stage: "submit",
                active: active.id,
            }
            .fail();
        }

        let mut changes = Vec::new();
        let result = self.controller.begin(&mut self.log, text, &mut changes);
        self.notify(&changes);
        let active = result?;

        let id = active.id;
        self.last_error = None;
        self.active = Some(active);
        tracing::info!(exchange_id = id.0, chars = text.chars().count(), "message submitted");
        Ok(id)
    }

    /// Applies one event from [`SessionEvents`]. Events of any exchange other than the
    /// active one are dropped without touching the log.
    pub fn handle_event(&mut self, event: ExchangeEvent) -> ExchangeOutcome {
        let Some(active) = self.active.as_ref() else {
            tracing::debug!(
                exchange_id = event.exchange_id.0,
                "dropping exchange event while idle"
            );
            return ExchangeOutcome::Stale;
        };

        let mut changes = Vec::new();
        let outcome = ExchangeController::apply(&mut self.log, active, event, &mut changes);
        self.notify(&changes);

        match &outcome {
            ExchangeOutcome::Continue | ExchangeOutcome::Stale => {}
            ExchangeOutcome::Completed | ExchangeOutcome::Cancelled => {
                if let Some(active) = self.active.take() {
                    tracing::info!(exchange_id = active.id.0, ?outcome, "exchange finished");
                }
            }
            ExchangeOutcome::Failed(reason) => {
                if let Some(active) = self.active.take() {
                    tracing::warn!(exchange_id = active.id.0, reason = %reason, "exchange failed");
                }
                self.last_error = Some(reason.clone());
            }
        }

        outcome
    }

    /// Stops the in-flight exchange, keeping whatever text already arrived.
    ///
    /// Returns `false` when nothing was in flight.
    pub fn cancel(&mut self) -> bool {
        let Some(mut active) = self.active.take() else {
            return false;
        };

        let mut changes = Vec::new();
        ExchangeController::stop(&mut self.log, &mut active, &mut changes);
        self.notify(&changes);
        tracing::info!(exchange_id = active.id.0, "exchange stopped by user");
        true
    }

    /// Drops the conversation and starts over with a fresh greeting.
    ///
    /// An in-flight exchange is cancelled without waiting for it; its late fragments are
    /// discarded as stale.
    pub fn reset(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.cancel();
            tracing::debug!(exchange_id = active.id.0, "exchange cancelled by reset");
        }

        self.log.reset(self.greeting.clone());
        self.last_error = None;
        self.controller.service().reset_conversation();
        self.notify(&[ChangeEvent::Reset]);
        tracing::info!("session reset");
    }

    pub fn snapshot(&self) -> Vec<Turn> {
        self.log.snapshot()
    }

    pub fn turns(&self) -> &[Turn] {
        self.log.turns()
    }

    pub fn turn(&self, id: TurnId) -> Option<&Turn> {
        self.log.get(id)
    }

    pub fn state(&self) -> SessionState {
        match &self.active {
            Some(active) => SessionState::Exchanging(active.id),
            None => SessionState::Idle,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.active.is_some()
    }

    pub fn is_streaming(&self, id: TurnId) -> bool {
        self.log.get(id).is_some_and(Turn::is_streaming)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// True while loading and no reply text has arrived yet.
    ///
    /// A generic loading indicator should show only in this window; once text streams,
    /// the streaming turn itself signals progress.
    pub fn awaiting_first_fragment(&self) -> bool {
        self.active.as_ref().is_some_and(|active| {
            self.log
                .get(active.assistant_turn_id)
                .is_some_and(|turn| turn.is_streaming() && turn.content.is_empty())
        })
    }

    fn notify(&mut self, changes: &[ChangeEvent]) {
        for change in changes {
            for observer in &mut self.observers {
                observer(change);
            }
        }
    }
}
