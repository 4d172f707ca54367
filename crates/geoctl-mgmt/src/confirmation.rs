use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::io::{BufRead, Write};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Question {
    SkipPreflightChecks,
    PrimaryIsDown,
    RemoveStaleKeys,
}

impl Question {
    pub fn prompt(&self) -> &'static str {
        match self {
            Question::SkipPreflightChecks => "Skip preflight checks?",
            Question::PrimaryIsDown => {
                "Is the current primary node down and unable to accept writes?"
            }
            Question::RemoveStaleKeys => "Remove stale replication keys from this node?",
        }
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prompt())
    }
}

#[derive(Debug, Error)]
pub enum ConfirmationError {
    #[error("failed to read answer: {0}")]
    Io(#[from] std::io::Error),
    #[error("prompt task aborted")]
    Aborted,
}

/// Source of operator answers for questions the request left open.
#[async_trait]
pub trait ConfirmationProvider: Send + Sync {
    async fn confirm(&self, question: Question) -> Result<bool, ConfirmationError>;
}

/// Asks on stderr, reads a line from stdin. Only `y`/`yes` confirm; EOF refuses.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

#[async_trait]
impl ConfirmationProvider for TerminalPrompt {
    async fn confirm(&self, question: Question) -> Result<bool, ConfirmationError> {
        tokio::task::spawn_blocking(move || -> Result<bool, ConfirmationError> {
            let mut stderr = std::io::stderr().lock();
            write!(stderr, "{} [y/N] ", question.prompt())?;
            stderr.flush()?;

            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            Ok(parse_answer(&line))
        })
        .await
        .map_err(|_| ConfirmationError::Aborted)?
    }
}

fn parse_answer(line: &str) -> bool {
    matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Fixed answers. Questions without an answer are refused.
#[derive(Debug, Default)]
pub struct CannedAnswers {
    answers: HashMap<Question, bool>,
    asked: Mutex<Vec<Question>>,
}

impl CannedAnswers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(mut self, question: Question, value: bool) -> Self {
        self.answers.insert(question, value);
        self
    }

    pub fn asked(&self) -> Vec<Question> {
        self.asked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ConfirmationProvider for CannedAnswers {
    async fn confirm(&self, question: Question) -> Result<bool, ConfirmationError> {
        self.asked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(question);
        Ok(self.answers.get(&question).copied().unwrap_or(false))
    }
}
