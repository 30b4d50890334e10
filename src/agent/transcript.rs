//! Conversation transcript and prompt assembly

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::llm::ChatMessage;

/// Default system instruction for the Thought-Code-Observation loop
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a data analyst who solves tasks by writing and running Python.

Work in a loop:
1. Think about what to do next and say it in one or two sentences.
2. Write Python in a single ```python fenced block. It runs as soon as you reply.
3. Read the Observation that comes back (printed output or the error) and continue.

When the task is complete, reply with your final answer and no code block.

Environment:
- Variables you assign persist between code blocks. Functions, classes,
  imported modules and open files do not: re-define or re-import them when
  you need them again.
- Only names a code block newly assigns are carried forward. Re-assigning a
  variable that already exists (x = x + 1) is not kept; assign the result to
  a new name instead (x2 = x + 1).
- json, math, os, re, csv, statistics, datetime and Path are already
  imported; pd, np, plt and sns are available when installed.
- Only printed output is returned, so print what you need to see.
- Workspace paths are available as WORKSPACE_PATH, DATA_DIR, OUTPUT_DIR,
  VIZ_DIR and REPORTS_DIR. Read inputs from DATA_DIR, write intermediate
  files to OUTPUT_DIR, save charts to VIZ_DIR (plt.savefig, never plt.show)
  and write final reports to REPORTS_DIR.
- If DOCUMENT_PATH is set, it points at a document describing how to
  approach the task. Read it first.
"#;

/// Prefix for observation turns in the prompt
pub const OBSERVATION_PREFIX: &str = "Observation: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Human,
    Agent,
    Observation,
}

/// One transcript entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn human(content: impl Into<String>) -> Self {
        Self {
            role: Role::Human,
            content: content.into(),
        }
    }

    pub fn agent(content: impl Into<String>) -> Self {
        Self {
            role: Role::Agent,
            content: content.into(),
        }
    }

    /// Script output, stored without the prompt prefix
    pub fn observation(content: impl Into<String>) -> Self {
        Self {
            role: Role::Observation,
            content: content.into(),
        }
    }

    fn to_message(&self) -> ChatMessage {
        match self.role {
            Role::Human => ChatMessage::user(self.content.clone()),
            Role::Agent => ChatMessage::assistant(self.content.clone()),
            Role::Observation => {
                ChatMessage::user(format!("{}{}", OBSERVATION_PREFIX, self.content))
            }
        }
    }
}

fn document_note(document: &Path) -> String {
    format!(
        "\n\nSupporting document: {}\nRead it before you start; it describes how to approach this task.",
        document.display()
    )
}

/// Messages for one model call
///
/// The document note goes on the most recent human turn of this copy only;
/// the transcript itself is never modified.
pub fn build_prompt(system: &str, transcript: &[Turn], document: Option<&Path>) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(transcript.len() + 1);
    messages.push(ChatMessage::system(system));
    messages.extend(transcript.iter().map(Turn::to_message));

    if let Some(document) = document {
        let last_human = transcript.iter().rposition(|turn| turn.role == Role::Human);
        if let Some(index) = last_human {
            // +1 for the system message
            messages[index + 1].content.push_str(&document_note(document));
        }
    }

    messages
}
