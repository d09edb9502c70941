pub mod error;
pub mod settings;
pub mod terminal;

pub use error::{AppError, AppResult};
pub use terminal::{Command, TerminalApp};
