use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::{ImageContent, Oracle};

/// Oracle backed by an OpenAI-compatible `/chat/completions` endpoint
#[derive(Clone)]
pub struct OpenAIOracle {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    image_input: bool,
    name: String,
}

impl OpenAIOracle {
    pub fn new(
        api_key: String,
        model: Option<String>,
        base_url: Option<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Result<Self> {
        Self::new_with_name(
            "openai".to_string(),
            api_key,
            model,
            base_url,
            max_tokens,
            temperature,
        )
    }

    pub fn new_with_name(
        name: String,
        api_key: String,
        model: Option<String>,
        base_url: Option<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(anyhow!("OpenAI oracle '{}' requires an api_key", name));
        }
        Ok(Self {
            client: Client::new(),
            api_key,
            model: model.unwrap_or_else(|| "gpt-4o".to_string()),
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            max_tokens,
            temperature,
            image_input: true,
            name,
        })
    }

    /// Enable or disable sending screenshots with prompts
    pub fn with_image_input(mut self, enabled: bool) -> Self {
        self.image_input = enabled;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn create_request_body(&self, prompt: &str, image: Option<&ImageContent>) -> serde_json::Value {
        let content = match image.filter(|_| self.image_input) {
            Some(image) => json!([
                { "type": "text", "text": prompt },
                { "type": "image_url", "image_url": { "url": image.to_data_uri() } },
            ]),
            None => json!(prompt),
        };

        let mut body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": content }],
            "stream": false,
        });

        if let Some(max_tokens) = self.max_tokens {
            body["max_completion_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = self.temperature {
            body["temperature"] = json!(temperature);
        }

        body
    }
}

#[async_trait]
impl Oracle for OpenAIOracle {
    async fn run_prompt(&self, prompt: &str, image: Option<&ImageContent>) -> Result<String> {
        debug!(
            "Sending prompt to {} ({} chars, image: {})",
            self.name,
            prompt.len(),
            image.is_some() && self.image_input
        );

        let body = self.create_request_body(prompt, image);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.base_url))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!("OpenAI API error {}: {}", status, error_text));
        }

        let openai_response: OpenAIResponse = response
            .json()
            .await
            .context("Failed to decode OpenAI response")?;

        if let Some(usage) = &openai_response.usage {
            debug!(
                "OpenAI completion successful: {} prompt / {} completion tokens",
                usage.prompt_tokens, usage.completion_tokens
            );
        }

        openai_response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("OpenAI response contained no message content"))
    }

    fn supports_image_input(&self) -> bool {
        self.image_input
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// OpenAI API response structures
#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oracle() -> OpenAIOracle {
        OpenAIOracle::new("key".to_string(), None, None, Some(512), None).unwrap()
    }

    #[test]
    fn test_empty_api_key_is_rejected() {
        assert!(OpenAIOracle::new(" ".to_string(), None, None, None, None).is_err());
    }

    #[test]
    fn test_text_only_body() {
        let body = oracle().create_request_body("tap login", None);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["content"], "tap login");
        assert_eq!(body["max_completion_tokens"], 512);
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn test_image_body_uses_content_parts() {
        let image = ImageContent::new("image/png", "AAAA".to_string());
        let body = oracle().create_request_body("tap login", Some(&image));
        let parts = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1]["image_url"]["url"], "data:image/png;base64,AAAA");
    }

    #[test]
    fn test_image_dropped_when_disabled() {
        let image = ImageContent::new("image/png", "AAAA".to_string());
        let oracle = oracle().with_image_input(false);
        let body = oracle.create_request_body("tap login", Some(&image));
        assert_eq!(body["messages"][0]["content"], "tap login");
        assert!(!oracle.supports_image_input());
    }
}
