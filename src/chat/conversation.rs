//! Conversation store - ordered chat log with in-place streaming updates

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::llm_engine::provider::{ChatMessage, LlmError, LlmResult, Message, MessageRole};

const EVENT_CAPACITY: usize = 256;

/// Change notification for conversation observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationEvent {
    Appended { index: usize },
    Amended { index: usize },
    ThoughtToggled { index: usize, visible: bool },
    Reset,
}

/// New visible state of the in-progress assistant turn
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnUpdate {
    pub content: String,
    pub thought: Option<String>,
}

/// Ordered, append-only conversation log.
///
/// The first turn is always the system prompt. Only the last assistant turn
/// is ever modified, and only through `amend_last`.
pub struct ConversationStore {
    turns: Vec<Message>,
    initial: Vec<Message>,
    streaming: bool,
    events: broadcast::Sender<ConversationEvent>,
}

impl ConversationStore {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        let initial = vec![Message::system(system_prompt)];
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            turns: initial.clone(),
            initial,
            streaming: false,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: ConversationEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn turns(&self) -> &[Message] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.turns.last()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn append(&mut self, turn: Message) {
        self.turns.push(turn);
        self.notify(ConversationEvent::Appended {
            index: self.turns.len() - 1,
        });
    }

    /// Append an empty assistant turn and mark it as in progress
    pub fn begin_assistant_turn(&mut self) {
        self.append(Message::assistant(""));
        self.streaming = true;
    }

    pub fn end_streaming(&mut self) {
        self.streaming = false;
    }

    /// Update the last turn in place. No-op unless it is an assistant turn.
    pub fn amend_last(&mut self, update: TurnUpdate) -> bool {
        let index = match self.turns.len().checked_sub(1) {
            Some(index) => index,
            None => return false,
        };

        let last = &mut self.turns[index];
        if last.role != MessageRole::Assistant {
            log::debug!("Ignoring amend of non-assistant turn {}", index);
            return false;
        }

        last.content = update.content;
        last.thought = update.thought;
        self.notify(ConversationEvent::Amended { index });
        true
    }

    /// Append text to the last assistant turn's content
    pub fn append_to_last(&mut self, suffix: &str) -> bool {
        match self.turns.last() {
            Some(last) if last.role == MessageRole::Assistant => {
                let update = TurnUpdate {
                    content: format!("{}{}", last.content, suffix),
                    thought: last.thought.clone(),
                };
                self.amend_last(update)
            }
            _ => false,
        }
    }

    /// Flip `show_thought` for one turn; content and thought are untouched
    pub fn toggle_thought_visibility(&mut self, index: usize) -> bool {
        match self.turns.get_mut(index) {
            Some(turn) => {
                turn.show_thought = !turn.show_thought;
                let visible = turn.show_thought;
                self.notify(ConversationEvent::ThoughtToggled { index, visible });
                true
            }
            None => false,
        }
    }

    /// Return to the initial system-prompt-only state
    pub fn reset(&mut self) {
        self.turns = self.initial.clone();
        self.streaming = false;
        self.notify(ConversationEvent::Reset);
    }

    /// Replace the initial state and reset to it
    pub fn reset_to(&mut self, initial: Vec<Message>) -> LlmResult<()> {
        match initial.first() {
            Some(first) if first.role == MessageRole::System => {}
            _ => {
                return Err(LlmError::InvalidRequest(
                    "Conversation must start with a system prompt".to_string(),
                ))
            }
        }
        self.initial = initial;
        self.reset();
        Ok(())
    }

    /// Messages to send to the backend, excluding an in-progress turn
    pub fn history(&self) -> Vec<ChatMessage> {
        let end = if self.streaming {
            self.turns.len().saturating_sub(1)
        } else {
            self.turns.len()
        };
        self.turns[..end].iter().map(ChatMessage::from).collect()
    }
}
