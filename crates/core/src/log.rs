use snafu::{Snafu, ensure};

/// Stable identifier for one turn.
///
/// Ids strictly increase in creation order and are never reused within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(pub u64);

impl TurnId {
    /// Creates a typed turn identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who wrote a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Author {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnStatus {
    Final,
    Streaming,
}

/// One message in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub id: TurnId,
    pub author: Author,
    pub content: String,
    pub status: TurnStatus,
}

impl Turn {
    pub fn is_streaming(&self) -> bool {
        self.status == TurnStatus::Streaming
    }
}

/// Emitted after every log mutation so a presentation layer can re-render or scroll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Appended(TurnId),
    ContentAppended { id: TurnId, delta: String },
    ContentReplaced(TurnId),
    Finalized(TurnId),
    Reset,
}

/// Contract violations. Reaching one of these means the caller has a bug.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LogError {
    #[snafu(display("turn {id} does not exist"))]
    NotFound { id: TurnId },
    #[snafu(display("turn {id} is in an invalid state: {details}"))]
    InvalidState { id: TurnId, details: String },
}

pub type LogResult<T> = Result<T, LogError>;

/// Ordered, append-only record of turns.
///
/// Log order equals id order equals creation order. At most one turn is
/// `Streaming` at any time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageLog {
    turns: Vec<Turn>,
    next_id: u64,
}

impl MessageLog {
    /// Creates a log holding a single final assistant greeting with id 1.
    pub fn seeded(greeting: impl Into<String>) -> Self {
        let mut log = Self {
            turns: Vec::new(),
            next_id: 1,
        };
        log.push_turn(Author::Assistant, greeting.into(), TurnStatus::Final);
        log
    }

    /// Appends a turn and returns its freshly allocated id.
    pub fn append(
        &mut self,
        author: Author,
        content: impl Into<String>,
        status: TurnStatus,
    ) -> LogResult<TurnId> {
        if let (TurnStatus::Streaming, Some(streaming)) = (status, self.streaming_turn()) {
            return InvalidStateSnafu {
                id: streaming.id,
                details: "another turn is already streaming".to_string(),
            }
            .fail();
        }

        Ok(self.push_turn(author, content.into(), status))
    }

    /// Concatenates `delta` onto a streaming turn.
    pub fn update_content(&mut self, id: TurnId, delta: &str) -> LogResult<()> {
        let turn = self.streaming_turn_mut(id, "cannot append to a final turn")?;
        turn.content.push_str(delta);
        Ok(())
    }

    /// Overwrites the content of a streaming turn.
    pub fn replace_content(&mut self, id: TurnId, text: impl Into<String>) -> LogResult<()> {
        let turn = self.streaming_turn_mut(id, "cannot replace content of a final turn")?;
        turn.content = text.into();
        Ok(())
    }

    /// Moves a turn from `Streaming` to `Final`. Finalizing a final turn is a no-op.
    pub fn finalize(&mut self, id: TurnId) -> LogResult<()> {
        let turn = self.find_mut(id)?;
        turn.status = TurnStatus::Final;
        Ok(())
    }

    /// Drops every turn and seeds a fresh greeting. Returns the greeting id.
    pub fn reset(&mut self, greeting: impl Into<String>) -> TurnId {
        self.turns.clear();
        self.push_turn(Author::Assistant, greeting.into(), TurnStatus::Final)
    }

    /// Read-only copy of the turns in id order.
    pub fn snapshot(&self) -> Vec<Turn> {
        self.turns.clone()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn get(&self, id: TurnId) -> Option<&Turn> {
        self.turns
            .binary_search_by_key(&id, |turn| turn.id)
            .ok()
            .map(|index| &self.turns[index])
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn streaming_turn(&self) -> Option<&Turn> {
        self.turns.iter().rev().find(|turn| turn.is_streaming())
    }

    fn push_turn(&mut self, author: Author, content: String, status: TurnStatus) -> TurnId {
        let id = TurnId::new(self.next_id);
        self.next_id = self.next_id.saturating_add(1);
        self.turns.push(Turn {
            id,
            author,
            content,
            status,
        });
        id
    }

    fn find_mut(&mut self, id: TurnId) -> LogResult<&mut Turn> {
        match self.turns.binary_search_by_key(&id, |turn| turn.id) {
            Ok(index) => Ok(&mut self.turns[index]),
            Err(_) => NotFoundSnafu { id }.fail(),
        }
    }

    fn streaming_turn_mut(&mut self, id: TurnId, details: &str) -> LogResult<&mut Turn> {
        let turn = self.find_mut(id)?;
        ensure!(
            turn.is_streaming(),
            InvalidStateSnafu {
                id,
                details: details.to_string(),
            }
        );
        Ok(turn)
    }
}
