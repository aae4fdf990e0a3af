use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced a conversational turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Assistant,
}

impl std::fmt::Display for Speaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => f.write_str("user"),
            Self::Assistant => f.write_str("assistant"),
        }
    }
}

/// One conversational exchange unit. This is the plaintext that gets
/// encrypted into a context entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Assistant,
            text: text.into(),
        }
    }

    /// Render for summarization input ("user: ...").
    pub fn render(&self) -> String {
        format!("{}: {}", self.speaker, self.text)
    }
}

/// Storage tag for a context entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Verbatim,
    Summary,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Verbatim => f.write_str("verbatim"),
            Self::Summary => f.write_str("summary"),
        }
    }
}

impl std::str::FromStr for EntryKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "verbatim" => Ok(Self::Verbatim),
            "summary" => Ok(Self::Summary),
            other => Err(format!("unknown entry kind: {other}")),
        }
    }
}

/// A decrypted item of the current context window, in ordinal order.
/// This is what response and summarization agents consume.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WindowEntry {
    /// Starting ordinal. For verbatim entries this is the entry's own
    /// position; for a summary it is the start of the replaced range.
    pub ordinal: i64,
    /// End of the covered ordinal range (equals `ordinal` for verbatim).
    pub ordinal_end: i64,
    pub body: WindowBody,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WindowBody {
    Verbatim(Turn),
    Summary(String),
}

impl WindowEntry {
    pub fn kind(&self) -> EntryKind {
        match self.body {
            WindowBody::Verbatim(_) => EntryKind::Verbatim,
            WindowBody::Summary(_) => EntryKind::Summary,
        }
    }

    /// Plain-text rendering for agent input.
    pub fn render(&self) -> String {
        match &self.body {
            WindowBody::Verbatim(turn) => turn.render(),
            WindowBody::Summary(text) => format!("[conversation so far] {text}"),
        }
    }
}
