//! Prompt size used by input-token throttles.
//!
//! With the `tokenizer` feature the prompt is encoded with tiktoken on the blocking
//! pool; otherwise the size is estimated from the serialized prompt at four bytes
//! per token. Both understand Anthropic (`system` + content blocks) and OpenAI chat
//! request shapes.

use serde_json::Value;

/// Request fields that reach the model as prompt text.
const PROMPT_FIELDS: [&str; 4] = ["system", "messages", "tools", "tool_choice"];

pub async fn count_input_tokens(model: &str, request: &Value) -> u64 {
    #[cfg(feature = "tokenizer")]
    {
        let model = model.to_string();
        let owned = request.clone();
        match tokio::task::spawn_blocking(move || tiktoken::count_prompt_tokens(&model, &owned))
            .await
        {
            Ok(tokens) => return tokens,
            Err(err) => {
                tracing::warn!(error = %err, "tokenizer task failed, using byte estimate");
            }
        }
    }
    #[cfg(not(feature = "tokenizer"))]
    let _ = model;

    estimate_prompt_tokens(request)
}

/// `ceil(len / 4)` over the serialized prompt fields.
pub fn estimate_prompt_tokens(request: &Value) -> u64 {
    let len: usize = PROMPT_FIELDS
        .iter()
        .filter_map(|field| request.get(*field))
        .map(|value| match value {
            Value::String(text) => text.len(),
            other => serde_json::to_string(other)
                .map(|json| json.len())
                .unwrap_or_default(),
        })
        .sum();
    estimate_tokens_from_len(len)
}

pub fn estimate_tokens_from_len(len: usize) -> u64 {
    if len == 0 {
        return 0;
    }
    (len as u64).saturating_add(3) / 4
}

#[cfg(feature = "tokenizer")]
mod tiktoken {
    use serde_json::Value;
    use tiktoken_rs::{CoreBPE, tokenizer};

    const TOKENS_PER_MESSAGE: u64 = 3;
    const REPLY_PRIMING_TOKENS: u64 = 3;

    pub(super) fn count_prompt_tokens(model: &str, request: &Value) -> u64 {
        let bpe = bpe_for_model(model);
        let mut tokens = REPLY_PRIMING_TOKENS;

        if let Some(system) = request.get("system") {
            tokens = tokens.saturating_add(count_content_tokens(bpe, system));
        }
        if let Some(messages) = request.get("messages").and_then(|value| value.as_array()) {
            for message in messages {
                tokens = tokens.saturating_add(TOKENS_PER_MESSAGE);
                let Some(obj) = message.as_object() else {
                    continue;
                };
                if let Some(role) = obj.get("role").and_then(|value| value.as_str()) {
                    tokens = tokens.saturating_add(encode_len(bpe, role));
                }
                if let Some(content) = obj.get("content") {
                    tokens = tokens.saturating_add(count_content_tokens(bpe, content));
                }
                if let Some(name) = obj.get("name").and_then(|value| value.as_str()) {
                    tokens = tokens.saturating_add(encode_len(bpe, name));
                }
            }
        }
        for field in ["tools", "tool_choice"] {
            if let Some(value) = request.get(field) {
                let json = serde_json::to_string(value).unwrap_or_default();
                tokens = tokens.saturating_add(encode_len(bpe, &json));
            }
        }
        tokens
    }

    fn bpe_for_model(model: &str) -> &'static CoreBPE {
        let tokenizer =
            tokenizer::get_tokenizer(model).unwrap_or(tokenizer::Tokenizer::Cl100kBase);
        match tokenizer {
            tokenizer::Tokenizer::O200kHarmony => tiktoken_rs::o200k_harmony_singleton(),
            tokenizer::Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
            tokenizer::Tokenizer::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
            tokenizer::Tokenizer::R50kBase | tokenizer::Tokenizer::Gpt2 => {
                tiktoken_rs::r50k_base_singleton()
            }
            tokenizer::Tokenizer::P50kBase => tiktoken_rs::p50k_base_singleton(),
            tokenizer::Tokenizer::P50kEdit => tiktoken_rs::p50k_edit_singleton(),
        }
    }

    fn encode_len(bpe: &CoreBPE, text: &str) -> u64 {
        bpe.encode_with_special_tokens(text).len() as u64
    }

    /// Strings, or arrays of `{"type": "text", "text": ...}` blocks. Images and other
    /// non-text blocks count as zero.
    fn count_content_tokens(bpe: &CoreBPE, content: &Value) -> u64 {
        match content {
            Value::String(text) => encode_len(bpe, text),
            Value::Array(parts) => parts
                .iter()
                .map(|part| match part {
                    Value::String(text) => encode_len(bpe, text),
                    Value::Object(obj) => {
                        let is_text = obj
                            .get("type")
                            .and_then(|value| value.as_str())
                            .is_some_and(|kind| kind == "text" || kind == "input_text");
                        match obj.get("text").and_then(|value| value.as_str()) {
                            Some(text) if is_text => encode_len(bpe, text),
                            _ => 0,
                        }
                    }
                    _ => 0,
                })
                .sum(),
            _ => 0,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn counts_anthropic_system_and_text_blocks() {
            let request = serde_json::json!({
                "model": "claude-3-5-sonnet",
                "system": "be brief",
                "messages": [{
                    "role": "user",
                    "content": [
                        {"type": "text", "text": "hello"},
                        {"type": "image", "source": {"type": "base64", "data": "AAAA"}}
                    ]
                }],
            });
            let bpe = bpe_for_model("claude-3-5-sonnet");
            let expected = REPLY_PRIMING_TOKENS
                + encode_len(bpe, "be brief")
                + TOKENS_PER_MESSAGE
                + encode_len(bpe, "user")
                + encode_len(bpe, "hello");

            assert_eq!(count_prompt_tokens("claude-3-5-sonnet", &request), expected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_estimate_rounds_up() {
        assert_eq!(estimate_tokens_from_len(0), 0);
        assert_eq!(estimate_tokens_from_len(1), 1);
        assert_eq!(estimate_tokens_from_len(4), 1);
        assert_eq!(estimate_tokens_from_len(5), 2);
    }

    #[test]
    fn estimate_only_counts_prompt_fields() {
        let request = serde_json::json!({
            "model": "a-very-long-model-name-that-is-not-prompt-text",
            "max_tokens": 4096,
            "system": "abcdefgh",
        });
        assert_eq!(estimate_prompt_tokens(&request), 2);

        let empty = serde_json::json!({"model": "m"});
        assert_eq!(estimate_prompt_tokens(&empty), 0);
    }

    #[tokio::test]
    async fn counts_nonzero_for_real_prompts() {
        let request = serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hello there"}],
        });
        assert!(count_input_tokens("m", &request).await > 0);
    }
}
