//! Per-conversation client state.

use uuid::Uuid;

/// State for one chat conversation: the server-assigned conversation id
/// (empty until the first `message_end` supplies one) and a generated,
/// stable user id. Held by whoever owns the conversation — never global.
#[derive(Debug, Clone)]
pub struct ChatSession {
    conversation_id: String,
    user_id: String,
}

impl ChatSession {
    pub fn new() -> Self {
        Self {
            conversation_id: String::new(),
            user_id: format!("user-{}", Uuid::new_v4()),
        }
    }

    /// Resume a conversation the server already named, e.g. from a relayed
    /// request that carried its own ids.
    pub fn resume(conversation_id: String, user_id: String) -> Self {
        Self {
            conversation_id,
            user_id,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Adopt the id the server supplied, replacing any previous one whole.
    pub fn set_conversation_id(&mut self, id: String) {
        self.conversation_id = id;
    }
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dify::DifyClient;

    #[test]
    fn new_sessions_get_distinct_user_ids() {
        let a = ChatSession::new();
        let b = ChatSession::new();
        assert!(a.user_id().starts_with("user-"));
        assert_ne!(a.user_id(), b.user_id());
        assert!(a.conversation_id().is_empty());
    }

    // The id adopted from message_end must flow into the next request.
    #[test]
    fn adopted_conversation_id_reaches_the_next_request() {
        let mut session = ChatSession::new();
        session.set_conversation_id("abc".to_string());

        let body = DifyClient::request_body(
            "next",
            session.conversation_id(),
            session.user_id(),
            "streaming",
        );
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"conversation_id\":\"abc\""));
    }
}
