use snafu::Snafu;

use crate::exchange::ExchangeId;
use crate::log::LogError;

/// Reasons a submit is refused. None of them leaves a new turn in the log.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SubmitError {
    #[snafu(display("message is empty"))]
    EmptyInput { stage: &'static str },
    #[snafu(display("exchange {active} is still in flight"))]
    Busy {
        stage: &'static str,
        active: ExchangeId,
    },
    #[snafu(display("message log rejected the exchange on `{stage}`, {source}"))]
    Log {
        stage: &'static str,
        source: LogError,
    },
}

pub type SubmitResult<T> = Result<T, SubmitError>;
