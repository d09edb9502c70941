//! Chat session core: the message log, the exchange protocol, and the session state
//! machine that composes them.

mod error;
mod exchange;
mod log;
mod session;

#[cfg(test)]
mod testing;

pub use error::{SubmitError, SubmitResult};
pub use exchange::{
    ActiveExchange, ExchangeController, ExchangeEvent, ExchangeId, ExchangeOutcome,
    FALLBACK_REPLY, TRUNCATION_MARKER,
};
pub use log::{Author, ChangeEvent, LogError, LogResult, MessageLog, Turn, TurnId, TurnStatus};
pub use session::{DEFAULT_GREETING, Session, SessionConfig, SessionEvents, SessionState};
