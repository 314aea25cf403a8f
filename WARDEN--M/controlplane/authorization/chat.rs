use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

/// Failures talking to a chat-completions endpoint.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    /// Connection-level failure.
    #[error("http error: {0}")]
    Http(String),
    /// Non-2xx response.
    #[error("endpoint answered {0}")]
    Status(u16),
    /// Response did not contain a JSON verdict.
    #[error("unreadable completion: {0}")]
    Decode(String),
}

#[derive(Debug, Deserialize)]
struct Completion {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: String,
}

/// Minimal OpenAI-compatible client that asks for and parses a JSON object.
#[derive(Debug, Clone)]
pub struct ChatClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl ChatClient {
    /// Creates a client for `{endpoint}/chat/completions`.
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| ChatError::Http(err.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
        })
    }

    /// Model name.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Sends one system + user exchange and returns the JSON object in the reply.
    pub async fn complete_json(&self, system: &str, user: &str) -> Result<Value, ChatError> {
        let body = json!({
            "model": self.model,
            "temperature": 0,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user }
            ]
        });
        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|err| ChatError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ChatError::Status(response.status().as_u16()));
        }
        let completion: Completion = response
            .json()
            .await
            .map_err(|err| ChatError::Decode(err.to_string()))?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| ChatError::Decode("no choices".into()))?;
        extract_json(&content).ok_or_else(|| ChatError::Decode("no JSON object in reply".into()))
    }
}

/// Pulls the outermost JSON object out of a model reply, tolerating prose or fences around it.
#[must_use]
pub fn extract_json(content: &str) -> Option<Value> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str::<Value>(&content[start..=end])
        .ok()
        .filter(Value::is_object)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_json() {
        let reply = "Sure:\n```json\n{\"risk_score\": 0.2, \"passed\": true}\n```";
        let value = extract_json(reply).unwrap();
        assert_eq!(value["passed"], json!(true));
        assert!(extract_json("no verdict").is_none());
        assert!(extract_json("} {").is_none());
    }
}
