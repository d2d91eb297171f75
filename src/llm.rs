//! Text generation through the Gemini `generateContent` REST endpoint.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::LlmConfig;

/// A text-completion backend: one system instruction, one user prompt, one reply.
pub trait LanguageModel {
    fn generate(&self, system_instruction: &str, prompt: &str) -> Result<String>;
}

pub struct GeminiClient {
    api_key: String,
    base_url: String,
    model: String,
    client: Client,
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    #[serde(rename = "systemInstruction")]
    system_instruction: Content,
    contents: Vec<Content>,
}

#[derive(Debug, Serialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: String,
}

impl GeminiClient {
    pub fn new(config: &LlmConfig, model: &str) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| anyhow::anyhow!("GEMINI_API_KEY not found. Check your .env file."))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
        })
    }
}

impl LanguageModel for GeminiClient {
    fn generate(&self, system_instruction: &str, prompt: &str) -> Result<String> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let request = GeminiRequest {
            system_instruction: Content {
                role: None,
                parts: vec![Part {
                    text: system_instruction.to_string(),
                }],
            },
            contents: vec![Content {
                role: Some("user"),
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
        };

        debug!(model = %self.model, "calling Gemini");
        let response = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .with_context(|| format!("Gemini request to model '{}' failed", self.model))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            anyhow::bail!("Gemini API returned {}: {}", status, body);
        }

        let body = response.text().context("Failed to read Gemini response")?;
        response_text(&body)
    }
}

/// Concatenates the text parts of the first candidate.
fn response_text(body: &str) -> Result<String> {
    let parsed: GeminiResponse =
        serde_json::from_str(body).context("Failed to parse Gemini response")?;
    let text: String = parsed
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts.into_iter().map(|p| p.text).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        anyhow::bail!("No content in Gemini response");
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_parts_of_first_candidate() {
        let body = r#"{
            "candidates": [
                {"content": {"parts": [{"text": "Did you know "}, {"text": "octopuses have three hearts?"}], "role": "model"}},
                {"content": {"parts": [{"text": "ignored"}]}}
            ]
        }"#;
        assert_eq!(
            response_text(body).unwrap(),
            "Did you know octopuses have three hearts?"
        );
    }

    #[test]
    fn empty_candidates_are_an_error() {
        assert!(response_text(r#"{"candidates": []}"#).is_err());
        assert!(response_text(r#"{"promptFeedback": {"blockReason": "SAFETY"}}"#).is_err());
    }

    #[test]
    fn request_uses_gemini_field_names() {
        let request = GeminiRequest {
            system_instruction: Content {
                role: None,
                parts: vec![Part {
                    text: "be brief".to_string(),
                }],
            },
            contents: vec![Content {
                role: Some("user"),
                parts: vec![Part {
                    text: "cats".to_string(),
                }],
            }],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "be brief");
        assert!(json["systemInstruction"].get("role").is_none());
        assert_eq!(json["contents"][0]["role"], "user");
    }

    #[test]
    fn missing_key_is_reported() {
        let err = GeminiClient::new(&LlmConfig::default(), "gemini-2.0-flash")
            .err()
            .unwrap();
        assert!(err.to_string().contains("GEMINI_API_KEY"));
    }
}
