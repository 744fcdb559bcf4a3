// Unit tests for OpenAI wire conversions

#[cfg(test)]
mod conversion_tests {
    use crate::types::{OpenAiRequest, OpenAiResponse};
    use runloop_core::{ChatMessage, ChatRequest, ToolCall, ToolDefinition};
    use serde_json::json;

    fn request(messages: Vec<ChatMessage>, tools: Vec<ToolDefinition>) -> ChatRequest {
        ChatRequest {
            model: "gpt-4o-mini".to_string(),
            messages,
            tools,
            temperature: Some(0.2),
            max_tokens: None,
        }
    }

    #[test]
    fn test_request_without_tools_omits_field() {
        let body = OpenAiRequest::from(&request(vec![ChatMessage::user("hi")], vec![]));
        let value = serde_json::to_value(&body).unwrap();

        assert_eq!(value["model"], "gpt-4o-mini");
        assert_eq!(value["stream"], false);
        assert!(value.get("tools").is_none());
        assert!(value.get("max_tokens").is_none());
        assert_eq!(value["messages"][0]["role"], "user");
        assert_eq!(value["messages"][0]["content"], "hi");
    }

    #[test]
    fn test_tool_round_in_request() {
        let call = ToolCall {
            id: "call_1".to_string(),
            name: "search".to_string(),
            arguments: json!({"query": "rust"}),
        };
        let messages = vec![
            ChatMessage::user("find rust"),
            ChatMessage::assistant("", vec![call]),
            ChatMessage::tool_result("call_1", r#"{"results":[]}"#),
        ];
        let tools = vec![ToolDefinition {
            name: "search".to_string(),
            description: "Search".to_string(),
            parameters: json!({"type": "object"}),
        }];

        let value = serde_json::to_value(OpenAiRequest::from(&request(messages, tools))).unwrap();

        let assistant = &value["messages"][1];
        assert!(assistant.get("content").is_none());
        assert_eq!(assistant["tool_calls"][0]["type"], "function");
        assert_eq!(
            assistant["tool_calls"][0]["function"]["arguments"],
            r#"{"query":"rust"}"#
        );
        assert_eq!(value["messages"][2]["role"], "tool");
        assert_eq!(value["messages"][2]["tool_call_id"], "call_1");
        assert_eq!(value["tools"][0]["function"]["name"], "search");
    }

    #[test]
    fn test_invalid_arguments_are_kept_verbatim() {
        let response: OpenAiResponse = serde_json::from_value(json!({
            "model": "gpt-4o-mini",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": { "name": "search", "arguments": "{not json" }
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        }))
        .unwrap();

        let calls = response.choices[0].message.tool_calls.as_ref().unwrap();
        let call = calls[0].to_core();
        assert_eq!(call.name, "search");
        assert_eq!(call.arguments, json!("{not json"));
        assert!(response.usage.is_none());
    }
}
