//! Line-oriented terminal front end for a chat [`Session`].
//!
//! Reads user lines, drives the session from a single `select!` loop, and renders log
//! changes as they happen. Replies are printed as raw text.

use std::io::Write;
use std::sync::Arc;

use chatline_core::{
    Author, ChangeEvent, ExchangeEvent, ExchangeOutcome, Session, SessionEvents, SubmitError,
    Turn, TurnId,
};
use snafu::ResultExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;

use crate::error::{AppResult, ReadInputSnafu, WriteOutputSnafu};

const ASSISTANT_PREFIX: &str = "assistant> ";
const PENDING_INDICATOR: &str = "...";
const CLEAR_LINE: &str = "\r\x1b[2K";

pub const HELP_TEXT: &str = "\
Type a message and press enter to send it.
  /stop     stop the reply that is streaming
  /reset    start a new conversation
  /health   check the assistant backend
  /history  print the conversation so far
  /help     show this help
  /quit     leave (also /exit)
Start a message with // to send text that begins with /.";

/// One parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Submit(String),
    Stop,
    Reset,
    Health,
    History,
    Help,
    Quit,
    Unknown(String),
    Blank,
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Self::Blank;
        }
        if !trimmed.starts_with('/') {
            return Self::Submit(line.to_string());
        }
        // `//text` sends `/text`.
        if let Some(escaped) = line.trim_start().strip_prefix("//") {
            return Self::Submit(format!("/{escaped}"));
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "/stop" => Self::Stop,
            "/reset" | "/new" => Self::Reset,
            "/health" => Self::Health,
            "/history" => Self::History,
            "/help" | "/?" => Self::Help,
            "/quit" | "/exit" => Self::Quit,
            _ => Self::Unknown(trimmed.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

pub struct TerminalApp<W: Write> {
    session: Session,
    events: SessionEvents,
    changes: mpsc::UnboundedReceiver<ChangeEvent>,
    out: W,
    pending_shown: bool,
}

impl<W: Write> TerminalApp<W> {
    pub fn new(mut session: Session, events: SessionEvents, out: W) -> Self {
        let (changes_tx, changes) = mpsc::unbounded_channel();
        session.subscribe(move |change| {
            let _ = changes_tx.send(change.clone());
        });

        Self {
            session,
            events,
            changes,
            out,
            pending_shown: false,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn into_output(self) -> W {
        self.out
    }

    /// Runs until `/quit` or end of input. A reply still streaming at end of input is
    /// awaited before returning.
    pub async fn run<R>(&mut self, input: R) -> AppResult<()>
    where
        R: AsyncBufRead + Unpin,
    {
        self.print_greeting()?;
        let mut lines = input.lines();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let line = line.context(ReadInputSnafu { stage: "read-line" })?;
                    let Some(line) = line else {
                        self.finish_exchange().await?;
                        break;
                    };
                    if self.handle_line(&line).await? == Flow::Quit {
                        break;
                    }
                }
                Some(event) = self.events.recv() => {
                    self.handle_event(event)?;
                }
            }
        }

        tracing::debug!("terminal session closed");
        Ok(())
    }

    async fn handle_line(&mut self, line: &str) -> AppResult<Flow> {
        match Command::parse(line) {
            Command::Blank => {}
            Command::Submit(text) => self.submit(&text)?,
            Command::Stop => {
                if self.session.cancel() {
                    self.render_changes()?;
                    self.write_line("(stopped)")?;
                } else {
                    self.write_line("nothing to stop")?;
                }
            }
            Command::Reset => {
                self.session.reset();
                self.render_changes()?;
            }
            Command::Health => self.print_health().await?,
            Command::History => self.print_history()?,
            Command::Help => self.write_line(HELP_TEXT)?,
            Command::Quit => {
                self.session.cancel();
                return Ok(Flow::Quit);
            }
            Command::Unknown(command) => {
                self.write_line(&format!("unknown command {command}, try /help"))?;
            }
        }
        Ok(Flow::Continue)
    }

    fn submit(&mut self, text: &str) -> AppResult<()> {
        match self.session.submit(text) {
            Ok(_) => self.render_changes(),
            Err(SubmitError::Busy { .. }) => {
                self.write_line("still answering, wait for the reply or /stop it")
            }
            Err(SubmitError::EmptyInput { .. }) => Ok(()),
            Err(error) => {
                tracing::error!(error = %error, "submit failed");
                self.write_line(&format!("could not send message: {error}"))
            }
        }
    }

    fn handle_event(&mut self, event: ExchangeEvent) -> AppResult<()> {
        let outcome = self.session.handle_event(event);
        self.render_changes()?;
        if let ExchangeOutcome::Failed(reason) = outcome {
            self.write_line(&format!("[error] {reason}"))?;
        }
        Ok(())
    }

    /// Applies events until no exchange is in flight.
    async fn finish_exchange(&mut self) -> AppResult<()> {
        while self.session.is_loading() {
            let Some(event) = self.events.recv().await else {
                break;
            };
            self.handle_event(event)?;
        }
        Ok(())
    }

    fn render_changes(&mut self) -> AppResult<()> {
        while let Ok(change) = self.changes.try_recv() {
            self.render_change(&change)
                .context(WriteOutputSnafu {
                    stage: "render-change",
                })?;
        }
        self.out.flush().context(WriteOutputSnafu {
            stage: "flush-output",
        })
    }

    fn render_change(&mut self, change: &ChangeEvent) -> std::io::Result<()> {
        match change {
            ChangeEvent::Appended(id) => {
                let waiting = self
                    .session
                    .turn(*id)
                    .is_some_and(|turn| turn.author == Author::Assistant && turn.is_streaming());
                if waiting && self.session.awaiting_first_fragment() {
                    write!(self.out, "{ASSISTANT_PREFIX}{PENDING_INDICATOR}")?;
                    self.pending_shown = true;
                }
            }
            ChangeEvent::ContentAppended { delta, .. } => {
                self.clear_pending()?;
                write!(self.out, "{delta}")?;
            }
            ChangeEvent::ContentReplaced(id) => {
                self.clear_pending()?;
                if let Some(turn) = self.session.turn(*id) {
                    write!(self.out, "{}", turn.content)?;
                }
            }
            ChangeEvent::Finalized(_) => {
                self.clear_pending()?;
                writeln!(self.out)?;
            }
            ChangeEvent::Reset => {
                self.pending_shown = false;
                writeln!(self.out, "-- new conversation --")?;
                if let Some(turn) = self.session.turns().last() {
                    writeln!(self.out, "{ASSISTANT_PREFIX}{}", turn.content)?;
                }
            }
        }
        Ok(())
    }

    fn clear_pending(&mut self) -> std::io::Result<()> {
        if self.pending_shown {
            write!(self.out, "{CLEAR_LINE}{ASSISTANT_PREFIX}")?;
            self.pending_shown = false;
        }
        Ok(())
    }

    fn print_greeting(&mut self) -> AppResult<()> {
        let greeting = self
            .session
            .turns()
            .last()
            .map(|turn| turn.content.clone())
            .unwrap_or_default();
        self.write_line(&format!("{ASSISTANT_PREFIX}{greeting}"))
    }

    fn print_history(&mut self) -> AppResult<()> {
        let lines: Vec<String> = self.session.turns().iter().map(format_turn).collect();
        for line in lines {
            self.write_line(&line)?;
        }
        Ok(())
    }

    async fn print_health(&mut self) -> AppResult<()> {
        let service = Arc::clone(self.session.service());
        let line = match service.health().await {
            Ok(health) if health.is_healthy() => format!("backend healthy: {}", health.message),
            Ok(health) => format!("backend reports {}: {}", health.status, health.message),
            Err(error) => {
                tracing::warn!(service = service.id(), error = %error, "health check failed");
                format!("backend unreachable: {error}")
            }
        };
        self.write_line(&line)
    }

    fn write_line(&mut self, line: &str) -> AppResult<()> {
        writeln!(self.out, "{line}")
            .and_then(|()| self.out.flush())
            .context(WriteOutputSnafu {
                stage: "write-line",
            })
    }
}

fn format_turn(turn: &Turn) -> String {
    let author = match turn.author {
        Author::User => "you",
        Author::Assistant => "assistant",
    };
    let marker = if turn.is_streaming() { " (streaming)" } else { "" };
    format!("[{}] {author}{marker}: {}", turn_label(turn.id), turn.content)
}

fn turn_label(id: TurnId) -> String {
    format!("#{id}")
}

#[cfg(test)]
mod tests {
    use chatline_assistant::{
        AssistantService, BoxFuture, ExchangeRequest, FragmentEvent, FragmentStreamHandle,
        HealthStatus, ServiceResult, ServiceWorker, UNPROCESSED_REPLY, make_fragment_stream,
    };
    use chatline_core::{DEFAULT_GREETING, FALLBACK_REPLY, SessionConfig};

    use super::*;

    /// Replies to every message with a fixed list of events, then waits to be cancelled.
    struct CannedService {
        reply: Vec<FragmentEvent>,
    }

    impl CannedService {
        fn new(reply: Vec<FragmentEvent>) -> Arc<Self> {
            Arc::new(Self { reply })
        }
    }

    impl AssistantService for CannedService {
        fn id(&self) -> &str {
            "canned"
        }

        fn open_exchange(&self, _request: ExchangeRequest) -> ServiceResult<FragmentStreamHandle> {
            let (event_tx, stream, cancel_rx) = make_fragment_stream();
            let reply = self.reply.clone();
            let worker: ServiceWorker = Box::pin(async move {
                for event in reply {
                    let _ = event_tx.send(event);
                }
                let _ = cancel_rx.await;
            });
            Ok(FragmentStreamHandle { stream, worker })
        }

        fn health<'a>(&'a self) -> BoxFuture<'a, ServiceResult<HealthStatus>> {
            Box::pin(async {
                Ok(HealthStatus {
                    status: "healthy".to_string(),
                    message: "ChatBot API is running".to_string(),
                })
            })
        }
    }

    fn app(service: Arc<CannedService>) -> TerminalApp<Vec<u8>> {
        let (session, events) = Session::new(service, SessionConfig::default());
        TerminalApp::new(session, events, Vec::new())
    }

    fn output(app: TerminalApp<Vec<u8>>) -> String {
        String::from_utf8(app.into_output()).unwrap()
    }

    fn delta(text: &str) -> FragmentEvent {
        FragmentEvent::Delta(text.to_string())
    }

    #[test]
    fn parses_commands_and_messages() {
        assert_eq!(Command::parse("  "), Command::Blank);
        assert_eq!(Command::parse("hi "), Command::Submit("hi ".to_string()));
        assert_eq!(Command::parse("/STOP"), Command::Stop);
        assert_eq!(Command::parse(" /reset "), Command::Reset);
        assert_eq!(Command::parse("/exit"), Command::Quit);
        assert_eq!(Command::parse("/health"), Command::Health);
        assert_eq!(
            Command::parse("/nope"),
            Command::Unknown("/nope".to_string())
        );
    }

    #[test]
    fn double_slash_sends_text_starting_with_slash() {
        assert_eq!(
            Command::parse("//usr/bin is missing"),
            Command::Submit("/usr/bin is missing".to_string())
        );
        assert_eq!(
            Command::parse("  //reset "),
            Command::Submit("/reset ".to_string())
        );
        assert_eq!(
            Command::parse("/usr/bin is missing"),
            Command::Unknown("/usr/bin is missing".to_string())
        );
    }

    #[tokio::test]
    async fn streams_reply_until_end_of_input() {
        let service = CannedService::new(vec![delta("Hi "), delta("there!"), FragmentEvent::Done]);
        let mut app = app(service);

        app.run(&b"hi\n"[..]).await.unwrap();

        assert!(!app.session().is_loading());
        let text = output(app);
        assert!(text.starts_with(&format!("{ASSISTANT_PREFIX}{DEFAULT_GREETING}\n")));
        assert!(text.contains("Hi there!\n"));
    }

    #[tokio::test]
    async fn reply_without_text_prints_unprocessed_reply() {
        let mut app = app(CannedService::new(vec![FragmentEvent::Done]));

        app.run(&b"hi\n"[..]).await.unwrap();

        assert_eq!(app.session().last_error(), None);
        let text = output(app);
        assert!(text.contains(&format!("{UNPROCESSED_REPLY}\n")));
        assert!(!text.contains(&format!("{ASSISTANT_PREFIX}\n")));
    }

    #[tokio::test]
    async fn failed_reply_prints_fallback_and_error() {
        let service = CannedService::new(vec![FragmentEvent::Failed("refused".to_string())]);
        let mut app = app(service);

        app.handle_line("hi").await.unwrap();
        app.finish_exchange().await.unwrap();

        assert_eq!(app.session().last_error(), Some("refused"));
        let text = output(app);
        assert!(text.contains(FALLBACK_REPLY));
        assert!(text.contains("[error] refused"));
    }

    #[tokio::test]
    async fn stop_keeps_partial_reply() {
        let service = CannedService::new(vec![delta("Partial")]);
        let mut app = app(service);

        app.handle_line("hi").await.unwrap();
        let event = app.events.recv().await.unwrap();
        app.handle_event(event).unwrap();
        app.handle_line("/stop").await.unwrap();

        assert!(!app.session().is_loading());
        assert_eq!(app.session().turns().last().unwrap().content, "Partial");
        let text = output(app);
        assert!(text.contains("Partial\n(stopped)"));
    }

    #[tokio::test]
    async fn busy_submit_is_refused_with_hint() {
        let service = CannedService::new(Vec::new());
        let mut app = app(service);

        app.handle_line("first").await.unwrap();
        app.handle_line("second").await.unwrap();

        assert_eq!(app.session().turns().len(), 3);
        assert!(output(app).contains("still answering"));
    }

    #[tokio::test]
    async fn pending_indicator_is_cleared_by_first_fragment() {
        let service = CannedService::new(vec![delta("Hello"), FragmentEvent::Done]);
        let mut app = app(service);

        app.handle_line("hi").await.unwrap();
        app.finish_exchange().await.unwrap();

        let text = output(app);
        let expected = format!(
            "{ASSISTANT_PREFIX}{PENDING_INDICATOR}{CLEAR_LINE}{ASSISTANT_PREFIX}Hello\n"
        );
        assert!(text.ends_with(&expected));
    }

    #[tokio::test]
    async fn reset_and_history_commands() {
        let service = CannedService::new(vec![delta("Sure"), FragmentEvent::Done]);
        let mut app = app(service);

        app.handle_line("hi").await.unwrap();
        app.finish_exchange().await.unwrap();
        app.handle_line("/history").await.unwrap();
        app.handle_line("/reset").await.unwrap();

        assert_eq!(app.session().turns().len(), 1);
        let text = output(app);
        assert!(text.contains("[#2] you: hi"));
        assert!(text.contains("[#3] assistant: Sure"));
        assert!(text.contains("-- new conversation --"));
    }

    #[tokio::test]
    async fn health_command_reports_backend_state() {
        let mut app = app(CannedService::new(Vec::new()));

        app.handle_line("/health").await.unwrap();

        assert!(output(app).contains("backend healthy: ChatBot API is running"));
    }

    #[tokio::test]
    async fn quit_stops_the_loop() {
        let mut app = app(CannedService::new(Vec::new()));

        app.run(&b"/quit\nnever sent\n"[..]).await.unwrap();

        assert_eq!(app.session().turns().len(), 1);
    }
}
