//! Conversation references and history trimming

use crate::llm::{Message, Role};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a user's conversation with one model lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversationRef {
    /// Handle into the in-process session registry
    Session {
        /// Session identifier
        id: Uuid,
    },
    /// Explicit message list resent with every request
    Messages {
        /// Alternating user/assistant turns, oldest first
        history: Vec<Message>,
    },
}

impl ConversationRef {
    /// Stored messages, empty for session handles
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        match self {
            Self::Session { .. } => &[],
            Self::Messages { history } => history,
        }
    }
}

/// Keep at most `max` of the newest messages.
///
/// When `require_user_first` is set, leading assistant messages left over
/// after the cut are dropped too.
#[must_use]
pub fn truncate_history(
    mut history: Vec<Message>,
    max: usize,
    require_user_first: bool,
) -> Vec<Message> {
    if history.len() > max {
        history.drain(..history.len() - max);
    }

    if require_user_first {
        let skip = history
            .iter()
            .take_while(|m| m.role != Role::User)
            .count();
        history.drain(..skip);
    }

    history
}

/// Append a completed exchange and trim the result.
#[must_use]
pub fn append_turn(
    history: Vec<Message>,
    user_message: &str,
    reply: &str,
    max: usize,
    require_user_first: bool,
) -> Vec<Message> {
    let mut history = history;
    history.push(Message::user(user_message));
    history.push(Message::assistant(reply));
    truncate_history(history, max, require_user_first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn alternating(len: usize) -> Vec<Message> {
        (0..len)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user(&format!("q{i}"))
                } else {
                    Message::assistant(&format!("a{i}"))
                }
            })
            .collect()
    }

    #[test]
    fn test_short_history_untouched() {
        let history = alternating(4);
        assert_eq!(truncate_history(history.clone(), 20, true), history);
    }

    #[test]
    fn test_keeps_newest() {
        let history = alternating(24);
        let trimmed = truncate_history(history.clone(), 20, false);
        assert_eq!(trimmed.len(), 20);
        assert_eq!(trimmed, history[4..]);
    }

    #[test]
    fn test_drops_leading_assistant_when_required() {
        let history = alternating(23);
        let trimmed = truncate_history(history, 20, true);
        assert_eq!(trimmed.len(), 19);
        assert_eq!(trimmed[0].role, Role::User);

        let loose = truncate_history(alternating(23), 20, false);
        assert_eq!(loose[0].role, Role::Assistant);
    }

    #[test]
    fn test_append_turn() {
        let history = append_turn(alternating(20), "next", "answer", 20, true);
        assert_eq!(history.len(), 20);
        assert_eq!(history[18], Message::user("next"));
        assert_eq!(history[19], Message::assistant("answer"));
    }

    #[test]
    fn test_conversation_ref_json_shape() -> Result<(), serde_json::Error> {
        let conv = ConversationRef::Messages {
            history: vec![Message::user("hi")],
        };
        let json = serde_json::to_value(&conv)?;
        assert_eq!(json["kind"], "messages");
        assert_eq!(json["history"][0]["role"], "user");
        assert_eq!(serde_json::from_value::<ConversationRef>(json)?, conv);
        Ok(())
    }

    proptest! {
        #[test]
        fn prop_truncation_bounds(len in 0usize..60, max in 1usize..30, user_first: bool) {
            let history = alternating(len);
            let trimmed = truncate_history(history.clone(), max, user_first);

            prop_assert!(trimmed.len() <= max);
            prop_assert!(history.ends_with(&trimmed));
            if user_first {
                prop_assert!(trimmed.first().is_none_or(|m| m.role == Role::User));
            }
        }
    }
}
