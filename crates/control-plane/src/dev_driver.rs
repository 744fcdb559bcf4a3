// Echo driver for dev mode
//
// Stands in for the model provider when no API key is configured. Replies
// with the last user message and reports word counts as token usage, so runs
// complete end to end with known (zero-priced unless configured) cost.

use async_trait::async_trait;
use runloop_core::{ChatRequest, ChatResponse, ChatRole, DriverError, LlmDriver, TokenUsage};

#[derive(Debug, Clone, Default)]
pub struct EchoDriver;

fn count_tokens(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

#[async_trait]
impl LlmDriver for EchoDriver {
    fn name(&self) -> &str {
        "echo"
    }

    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse, DriverError> {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let text = format!("Echo: {last_user}");

        let prompt_tokens = request
            .messages
            .iter()
            .map(|m| count_tokens(&m.content))
            .sum();

        Ok(ChatResponse {
            usage: Some(TokenUsage {
                prompt_tokens,
                completion_tokens: count_tokens(&text),
            }),
            text,
            model: Some(request.model.clone()),
            finish_reason: Some("stop".to_string()),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runloop_core::ChatMessage;

    #[tokio::test]
    async fn test_echoes_last_user_message() {
        let request = ChatRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![
                ChatMessage::system("be brief"),
                ChatMessage::user("first"),
                ChatMessage::user("hello there"),
            ],
            tools: Vec::new(),
            temperature: None,
            max_tokens: None,
        };
        let response = EchoDriver.chat_completion(&request).await.unwrap();
        assert_eq!(response.text, "Echo: hello there");
        assert!(response.tool_calls.is_empty());
        assert_eq!(
            response.usage,
            Some(TokenUsage {
                prompt_tokens: 5,
                completion_tokens: 3
            })
        );
    }
}
