//! Pending multi-question answer state.
//!
//! When a structured question set renders, its questions are parked here
//! keyed by the originating message. Answers are recorded one at a time
//! without submitting; submission formats all collected answers (with
//! explicit placeholders for unanswered questions) and clears the buffer.

use coderelay_chat_protocol::MessageRef;
use dashmap::DashMap;

use crate::provider::UserQuestion;

/// Placeholder submitted for a question the user never answered.
pub const NO_ANSWER: &str = "(no answer)";

/// A question set awaiting answers.
#[derive(Debug, Clone)]
pub struct PendingQuestions {
    pub session_id: String,
    pub questions: Vec<UserQuestion>,
    /// One slot per question, in original order.
    pub answers: Vec<Option<usize>>,
}

impl PendingQuestions {
    /// Whether every question has an answer.
    pub fn complete(&self) -> bool {
        self.answers.iter().all(Option::is_some)
    }

    /// Format the collected answers as one multi-line reply, with explicit
    /// placeholders for anything unanswered, in original question order.
    pub fn format_reply(&self) -> String {
        self.questions
            .iter()
            .zip(&self.answers)
            .map(|(question, answer)| {
                let text = answer
                    .and_then(|i| question.options.get(i))
                    .map(String::as_str)
                    .unwrap_or(NO_ANSWER);
                format!("{}: {}", question.question, text)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn key(message: &MessageRef) -> String {
    format!("{}:{}", message.channel_id, message.message_id)
}

/// Message → pending question set.
#[derive(Default)]
pub struct PendingStore {
    entries: DashMap<String, PendingQuestions>,
}

impl PendingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a freshly rendered question set.
    pub fn insert(&self, message: &MessageRef, session_id: &str, questions: Vec<UserQuestion>) {
        let answers = vec![None; questions.len()];
        self.entries.insert(
            key(message),
            PendingQuestions {
                session_id: session_id.to_string(),
                questions,
                answers,
            },
        );
    }

    /// Record one answer. Returns the updated state, or `None` when the
    /// message has no pending set or the indices are out of range.
    pub fn record(
        &self,
        message: &MessageRef,
        question: usize,
        option: usize,
    ) -> Option<PendingQuestions> {
        let mut entry = self.entries.get_mut(&key(message))?;
        if question >= entry.questions.len() || option >= entry.questions[question].options.len() {
            return None;
        }
        entry.answers[question] = Some(option);
        Some(entry.clone())
    }

    /// Remove and return the pending set for submission. Terminal.
    pub fn take(&self, message: &MessageRef) -> Option<PendingQuestions> {
        self.entries.remove(&key(message)).map(|(_, v)| v)
    }

    /// Peek without removing.
    pub fn get(&self, message: &MessageRef) -> Option<PendingQuestions> {
        self.entries.get(&key(message)).map(|e| e.clone())
    }
}
