use serde::{Deserialize, Serialize};

/// Role of one persisted turn.
///
/// Storage-local on purpose: the in-memory chat model has its own role enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
    Error,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// On-disk history unit: only role and text survive persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedTurn {
    pub role: TurnRole,
    pub content: String,
}

impl PersistedTurn {
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(TurnRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(TurnRole::Assistant, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(TurnRole::Error, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turns_serialize_as_role_content_records() {
        let turns = vec![PersistedTurn::user("hi"), PersistedTurn::error("boom")];
        let encoded = serde_json::to_string(&turns).unwrap();
        assert_eq!(
            encoded,
            r#"[{"role":"user","content":"hi"},{"role":"error","content":"boom"}]"#
        );
    }

    #[test]
    fn unknown_role_string_is_rejected() {
        assert_eq!(TurnRole::parse("assistant"), Some(TurnRole::Assistant));
        assert_eq!(TurnRole::parse("system"), None);
    }
}
