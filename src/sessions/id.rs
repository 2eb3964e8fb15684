//! Session identifiers and their on-disk file names.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Extension carried by every session log file.
pub const LOG_FILE_EXTENSION: &str = "log";

const MAX_SESSION_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionIdError {
    #[error("session id is empty")]
    Empty,

    #[error("session id exceeds {MAX_SESSION_ID_LEN} characters ({0})")]
    TooLong(usize),

    #[error("session id must not start with '.'")]
    LeadingDot,

    #[error("session id contains invalid character {0:?}")]
    InvalidChar(char),
}

/// Identifier of one streaming session.
///
/// The id doubles as the base name of the session's log file, so only
/// `[A-Za-z0-9._-]` is accepted and a leading dot is rejected (no hidden
/// files, no `..`, no path separators).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn parse(raw: &str) -> Result<Self, SessionIdError> {
        if raw.is_empty() {
            return Err(SessionIdError::Empty);
        }
        let len = raw.chars().count();
        if len > MAX_SESSION_ID_LEN {
            return Err(SessionIdError::TooLong(len));
        }
        if raw.starts_with('.') {
            return Err(SessionIdError::LeadingDot);
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(SessionIdError::InvalidChar(bad));
        }
        Ok(Self(raw.to_string()))
    }

    /// Generate a fresh random id for callers that do not supply one.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Recover the id from a log file name such as `abc-123.log`.
    ///
    /// Returns `None` for anything that is not `<valid id>.log`; the sweep
    /// reports those names as unrecognized instead of deleting them.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(LOG_FILE_EXTENSION)?.strip_suffix('.')?;
        Self::parse(stem).ok()
    }

    pub fn file_name(&self) -> String {
        format!("{}.{LOG_FILE_EXTENSION}", self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = SessionIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_ids() {
        for raw in ["abc", "sess-42", "chat_2024.01.05", "A1b2C3"] {
            let id = SessionId::parse(raw).unwrap();
            assert_eq!(id.as_str(), raw);
        }
    }

    #[test]
    fn rejects_path_like_ids() {
        assert_eq!(SessionId::parse(""), Err(SessionIdError::Empty));
        assert_eq!(SessionId::parse(".hidden"), Err(SessionIdError::LeadingDot));
        assert_eq!(SessionId::parse(".."), Err(SessionIdError::LeadingDot));
        assert_eq!(
            SessionId::parse("a/b"),
            Err(SessionIdError::InvalidChar('/'))
        );
        assert_eq!(
            SessionId::parse("a b"),
            Err(SessionIdError::InvalidChar(' '))
        );
        assert!(matches!(
            SessionId::parse(&"x".repeat(129)),
            Err(SessionIdError::TooLong(129))
        ));
    }

    #[test]
    fn file_name_round_trips_through_parser() {
        let id = SessionId::parse("sess-1").unwrap();
        assert_eq!(id.file_name(), "sess-1.log");
        assert_eq!(SessionId::from_file_name("sess-1.log"), Some(id));
    }

    #[test]
    fn from_file_name_rejects_unexpected_names() {
        assert_eq!(SessionId::from_file_name("notes.txt"), None);
        assert_eq!(SessionId::from_file_name(".log"), None);
        assert_eq!(SessionId::from_file_name("log"), None);
        assert_eq!(SessionId::from_file_name("x.log.tmp"), None);
        assert_eq!(SessionId::from_file_name(".hidden.log"), None);
        assert_eq!(SessionId::from_file_name("bad name.log"), None);
    }

    #[test]
    fn generated_ids_are_valid_and_distinct() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert!(SessionId::parse(a.as_str()).is_ok());
    }

    #[test]
    fn serde_rejects_invalid_ids() {
        let ok: SessionId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(ok.as_str(), "abc");
        assert!(serde_json::from_str::<SessionId>("\"../etc\"").is_err());
    }
}
