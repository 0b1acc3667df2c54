use serde::Deserialize;

use crate::chat::ChatInput;
use crate::context::StyleRule;
use crate::llm::ChatMessage;

/// Client frame. `type` is `chat` (default when a message is present),
/// `stop`, or `set_session`.
#[derive(Debug, Deserialize, Default)]
pub struct WsIncomingMessage {
    #[serde(rename = "type")]
    pub msg_type: Option<String>,
    pub message: Option<String>,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    #[serde(alias = "sessionId")]
    pub session_id: Option<String>,
    #[serde(alias = "botId")]
    pub bot_id: Option<String>,
    pub style_rule: Option<StyleRule>,
    #[serde(alias = "styleRuleId")]
    pub style_rule_id: Option<String>,
}

impl WsIncomingMessage {
    pub fn into_chat_input(self, session_id: Option<String>) -> ChatInput {
        ChatInput {
            message: self.message.unwrap_or_default(),
            history: self.history,
            session_id,
            style_rule: self.style_rule,
            style_rule_id: self.style_rule_id,
            bot_id: self.bot_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_both_key_styles() {
        let frame: WsIncomingMessage = serde_json::from_str(
            r#"{"type":"set_session","sessionId":"abc","bot_id":"sales","styleRuleId":"r1"}"#,
        )
        .unwrap();
        assert_eq!(frame.msg_type.as_deref(), Some("set_session"));
        assert_eq!(frame.session_id.as_deref(), Some("abc"));
        assert_eq!(frame.bot_id.as_deref(), Some("sales"));
        assert_eq!(frame.style_rule_id.as_deref(), Some("r1"));

        let chat: WsIncomingMessage = serde_json::from_str(
            r#"{"message":"hi","history":[{"role":"user","content":"before"}]}"#,
        )
        .unwrap();
        let input = chat.into_chat_input(Some("s1".into()));
        assert_eq!(input.message, "hi");
        assert_eq!(input.history.len(), 1);
        assert_eq!(input.session_id.as_deref(), Some("s1"));
    }
}
