use std::collections::BTreeMap;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use url::Url;

use crate::config::Config;
use crate::models::{ExampleData, Extraction};

// ── Constants ────────────────────────────────────────────────────────────────

const USER_AGENT: &str = "invoice-extract-api/1.0";
const ATTRIBUTES_SUFFIX: &str = "_attributes";
const MAX_LOGGED_BODY: usize = 500;

const FORMAT_INSTRUCTIONS: &str = "Respond with JSON of the form {\"extractions\": [...]}. \
Each item maps one extraction class to the exact text span copied from the document, \
and may carry a \"<class>_attributes\" object whose values are strings. \
Use exact text from the document, do not paraphrase, and list extractions in order of appearance.";

// ── Lazy static regexes ──────────────────────────────────────────────────────

static FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").unwrap());

// ── Error type ───────────────────────────────────────────────────────────────

/// Any failure of the remote extraction call. The message is for server logs only.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionServiceError {
    #[error("extraction service rejected the credential ({0})")]
    Auth(u16),
    #[error("extraction service quota or rate limit exceeded")]
    RateLimited,
    #[error("extraction service returned {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("extraction service timed out: {0}")]
    Timeout(String),
    #[error("extraction request failed: {0}")]
    Request(String),
    #[error("model output could not be parsed: {0}")]
    MalformedOutput(String),
}

// ── Extractor ────────────────────────────────────────────────────────────────

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        text: &str,
        prompt: &str,
        examples: &[ExampleData],
    ) -> Result<Vec<Extraction>, ExtractionServiceError>;
}

/// Extraction backed by the Gemini `generateContent` API.
pub struct GeminiExtractor {
    client: reqwest::Client,
    endpoint: Url,
    api_key: String,
    model_id: String,
}

impl GeminiExtractor {
    pub fn new(config: &Config) -> Result<Self, ExtractionServiceError> {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(std::time::Duration::from_secs(5))
            .timeout(config.extraction_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ExtractionServiceError::Request(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: generate_content_url(&config.gemini_base_url, &config.model_id)?,
            api_key: config.api_key.clone(),
            model_id: config.model_id.clone(),
        })
    }
}

#[async_trait]
impl Extractor for GeminiExtractor {
    async fn extract(
        &self,
        text: &str,
        prompt: &str,
        examples: &[ExampleData],
    ) -> Result<Vec<Extraction>, ExtractionServiceError> {
        let body = json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": render_prompt(prompt, examples, text) }]
            }],
            "generationConfig": {
                "temperature": 0.0,
                "responseMimeType": "application/json"
            }
        });

        tracing::debug!(model = %self.model_id, text_len = text.len(), "calling extraction service");

        let response = self
            .client
            .post(self.endpoint.clone())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExtractionServiceError::Timeout(e.to_string())
                } else {
                    ExtractionServiceError::Request(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(match status.as_u16() {
                401 | 403 => ExtractionServiceError::Auth(status.as_u16()),
                429 => ExtractionServiceError::RateLimited,
                code => {
                    let body = response.text().await.unwrap_or_default();
                    ExtractionServiceError::Upstream {
                        status: code,
                        body: body.chars().take(MAX_LOGGED_BODY).collect(),
                    }
                }
            });
        }

        let payload: GenerateContentResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ExtractionServiceError::Timeout(e.to_string())
            } else {
                ExtractionServiceError::MalformedOutput(e.to_string())
            }
        })?;

        let output = payload.into_text()?;
        let extractions = parse_model_output(&output)?;
        tracing::debug!(count = extractions.len(), "extraction service returned");
        Ok(extractions)
    }
}

fn generate_content_url(base: &Url, model_id: &str) -> Result<Url, ExtractionServiceError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(&format!("v1beta/models/{}:generateContent", model_id))
        .map_err(|e| ExtractionServiceError::Request(format!("invalid endpoint: {}", e)))
}

// ── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

impl GenerateContentResponse {
    fn into_text(self) -> Result<String, ExtractionServiceError> {
        let block_reason = self.prompt_feedback.and_then(|f| f.block_reason);
        let candidate = self.candidates.into_iter().next().ok_or_else(|| {
            ExtractionServiceError::MalformedOutput(match block_reason {
                Some(reason) => format!("prompt blocked: {}", reason),
                None => "no candidates in response".to_string(),
            })
        })?;

        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(ExtractionServiceError::MalformedOutput(format!(
                "empty candidate (finish reason: {})",
                candidate.finish_reason.as_deref().unwrap_or("unknown")
            )));
        }
        Ok(text)
    }
}

// ── Prompt rendering ─────────────────────────────────────────────────────────

/// Builds the few-shot prompt: description, worked examples, then the document.
pub fn render_prompt(description: &str, examples: &[ExampleData], text: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str(description.trim());
    prompt.push_str("\n\n");
    prompt.push_str(FORMAT_INSTRUCTIONS);
    prompt.push_str("\n\n");

    if !examples.is_empty() {
        prompt.push_str("Examples\n");
        for example in examples {
            prompt.push_str("Q: ");
            prompt.push_str(dedent(&example.text).trim());
            prompt.push_str("\nA: ```json\n");
            prompt.push_str(&render_answer(&example.extractions));
            prompt.push_str("\n```\n\n");
        }
    }

    prompt.push_str("Q: ");
    prompt.push_str(text);
    prompt.push_str("\nA: ");
    prompt
}

fn render_answer(extractions: &[Extraction]) -> String {
    let items: Vec<Value> = extractions
        .iter()
        .map(|e| {
            let mut item = Map::new();
            item.insert(e.class.clone(), Value::String(e.text.clone()));
            let attributes: Map<String, Value> = e
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            item.insert(format!("{}{}", e.class, ATTRIBUTES_SUFFIX), Value::Object(attributes));
            Value::Object(item)
        })
        .collect();
    serde_json::to_string_pretty(&json!({ "extractions": items }))
        .unwrap_or_else(|_| "{\"extractions\": []}".to_string())
}

// ── Model output parsing ─────────────────────────────────────────────────────

pub fn parse_model_output(raw: &str) -> Result<Vec<Extraction>, ExtractionServiceError> {
    let body = FENCE_RE
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(raw)
        .trim();

    let value: Value = serde_json::from_str(body)
        .map_err(|e| ExtractionServiceError::MalformedOutput(e.to_string()))?;

    let items = match value {
        Value::Object(mut obj) => match obj.remove("extractions") {
            Some(Value::Array(items)) => items,
            Some(Value::Null) => Vec::new(),
            _ => {
                return Err(ExtractionServiceError::MalformedOutput(
                    "expected an \"extractions\" array".to_string(),
                ))
            }
        },
        Value::Array(items) => items,
        _ => {
            return Err(ExtractionServiceError::MalformedOutput(
                "expected a JSON object or array".to_string(),
            ))
        }
    };

    let mut extractions = Vec::with_capacity(items.len());
    for item in items {
        let Value::Object(obj) = item else {
            return Err(ExtractionServiceError::MalformedOutput(
                "extraction item is not an object".to_string(),
            ));
        };
        parse_item(obj, &mut extractions);
    }
    Ok(extractions)
}

fn parse_item(mut obj: Map<String, Value>, out: &mut Vec<Extraction>) {
    // Items echoing our own response shape.
    if let (Some(Value::String(class)), Some(Value::String(text))) = (obj.get("class"), obj.get("text")) {
        let attributes = match obj.get("attributes") {
            Some(Value::Object(attrs)) => flatten_attributes(attrs),
            _ => BTreeMap::new(),
        };
        out.push(Extraction {
            class: class.clone(),
            text: text.clone(),
            attributes,
        });
        return;
    }

    let classes: Vec<String> = obj
        .keys()
        .filter(|k| !k.ends_with(ATTRIBUTES_SUFFIX))
        .cloned()
        .collect();

    for class in classes {
        let text = match obj.remove(&class) {
            Some(Value::String(s)) => s,
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            other => {
                tracing::debug!(%class, value = ?other, "skipping extraction without a text span");
                continue;
            }
        };
        let attributes = match obj.get(&format!("{}{}", class, ATTRIBUTES_SUFFIX)) {
            Some(Value::Object(attrs)) => flatten_attributes(attrs),
            _ => BTreeMap::new(),
        };
        out.push(Extraction { class, text, attributes });
    }
}

fn flatten_attributes(attrs: &Map<String, Value>) -> BTreeMap<String, String> {
    attrs
        .iter()
        .filter_map(|(k, v)| {
            let value = match v {
                Value::Null => return None,
                Value::String(s) => s.clone(),
                Value::Array(values) => values
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(", "),
                other => other.to_string(),
            };
            Some((k.clone(), value))
        })
        .collect()
}

// ── Prompt normalisation ─────────────────────────────────────────────────────

/// Removes whitespace common to the start of every non-blank line.
/// Lines holding only whitespace come out empty.
pub fn dedent(text: &str) -> String {
    let margin = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| &l[..l.len() - l.trim_start().len()])
        .fold(None::<&str>, |acc, indent| match acc {
            None => Some(indent),
            Some(prev) => {
                let common = prev
                    .char_indices()
                    .zip(indent.chars())
                    .take_while(|((_, a), b)| a == b)
                    .last()
                    .map(|((i, c), _)| i + c.len_utf8())
                    .unwrap_or(0);
                Some(&prev[..common])
            }
        })
        .unwrap_or("");

    let mut out = String::with_capacity(text.len());
    for (i, line) in text.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if line.trim().is_empty() {
            continue;
        }
        out.push_str(line.strip_prefix(margin).unwrap_or(line));
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use mockito::Matcher;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::few_shot;

    fn config_for(base_url: &str) -> Config {
        let vars: HashMap<&str, String> = [
            ("GEMINI_API_KEY", "test-key".to_string()),
            ("GEMINI_BASE_URL", base_url.to_string()),
            ("EXTRACTION_TIMEOUT_SECS", "5".to_string()),
        ]
        .into_iter()
        .collect();
        Config::from_lookup(|name| vars.get(name).cloned()).unwrap()
    }

    fn gemini_reply(text: &str) -> String {
        json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": text }] },
                "finishReason": "STOP"
            }]
        })
        .to_string()
    }

    #[test]
    fn dedent_strips_common_margin() {
        let prompt = "\n    Extract invoice fields.\n      Keep amounts verbatim.\n   \n    Done.";
        assert_eq!(
            dedent(prompt),
            "\nExtract invoice fields.\n  Keep amounts verbatim.\n\nDone."
        );
    }

    #[test]
    fn dedent_leaves_unindented_text_alone() {
        assert_eq!(dedent("extract invoice fields"), "extract invoice fields");
        assert_eq!(dedent("a\n\tb"), "a\n\tb");
    }

    #[test]
    fn dedent_ignores_mixed_tabs_and_spaces() {
        assert_eq!(dedent("\tone\n  two"), "\tone\n  two");
    }

    #[test]
    fn prompt_contains_examples_then_document() {
        let examples = few_shot::builtin().unwrap();
        let prompt = render_prompt("extract invoice fields", &examples, "Invoice Number: INV-9");

        let description = prompt.find("extract invoice fields").unwrap();
        let example = prompt.find("Q: Invoice Number: INV-00123").unwrap();
        let document = prompt.rfind("Q: Invoice Number: INV-9").unwrap();
        assert!(description < example && example < document);
        assert!(prompt.contains("\"invoice_number\": \"INV-00123\""));
        assert!(prompt.contains("\"item_attributes\""));
        assert!(prompt.ends_with("A: "));
    }

    #[test]
    fn parses_langextract_style_items() {
        let raw = r#"```json
{"extractions": [
  {"invoice_number": "INV-00123", "invoice_number_attributes": {}},
  {"item": "Office Chair", "item_attributes": {"quantity": 2, "price": "₹5,000.00", "tags": ["a", "b"], "note": null}}
]}
```"#;
        let parsed = parse_model_output(raw).unwrap();
        assert_eq!(
            parsed,
            vec![
                Extraction::new("invoice_number", "INV-00123"),
                Extraction::new("item", "Office Chair")
                    .with_attribute("quantity", "2")
                    .with_attribute("price", "₹5,000.00")
                    .with_attribute("tags", "a, b"),
            ]
        );
    }

    #[test]
    fn keeps_model_order_within_and_across_items() {
        let raw = r#"{"extractions": [
  {"vendor_name": "ABC", "invoice_number": "INV-1", "total_amount": "10"},
  {"item": "Office Chair", "item_attributes": {"quantity": "2"}},
  {"invoice_date": "2025-08-10"},
  {"item": "Delivery Charge"}
]}"#;
        let parsed = parse_model_output(raw).unwrap();
        assert_eq!(
            parsed,
            vec![
                Extraction::new("vendor_name", "ABC"),
                Extraction::new("invoice_number", "INV-1"),
                Extraction::new("total_amount", "10"),
                Extraction::new("item", "Office Chair").with_attribute("quantity", "2"),
                Extraction::new("invoice_date", "2025-08-10"),
                Extraction::new("item", "Delivery Charge"),
            ]
        );
    }

    #[test]
    fn parses_bare_arrays_and_echoed_shape() {
        let raw = r#"[{"class": "vendor_name", "text": "ABC Supplies", "attributes": {"country": "IN"}}]"#;
        let parsed = parse_model_output(raw).unwrap();
        assert_eq!(
            parsed,
            vec![Extraction::new("vendor_name", "ABC Supplies").with_attribute("country", "IN")]
        );
    }

    #[test]
    fn null_extractions_mean_none_found() {
        assert!(parse_model_output(r#"{"extractions": null}"#).unwrap().is_empty());
        assert!(parse_model_output(r#"{"extractions": []}"#).unwrap().is_empty());
    }

    #[test]
    fn rejects_unparseable_output() {
        for raw in ["I could not find anything", r#"{"items": []}"#, "42", r#"["INV-1"]"#] {
            assert!(
                matches!(parse_model_output(raw), Err(ExtractionServiceError::MalformedOutput(_))),
                "{raw}"
            );
        }
    }

    #[test]
    fn endpoint_keeps_base_path() {
        let base = Url::parse("https://proxy.internal/gemini").unwrap();
        let url = generate_content_url(&base, "gemini-2.5-pro").unwrap();
        assert_eq!(
            url.as_str(),
            "https://proxy.internal/gemini/v1beta/models/gemini-2.5-pro:generateContent"
        );
    }

    #[tokio::test]
    async fn sends_credential_and_prompt_and_parses_reply() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1beta/models/gemini-2.5-pro:generateContent")
            .match_header("x-goog-api-key", "test-key")
            .match_body(Matcher::AllOf(vec![
                Matcher::PartialJson(json!({
                    "generationConfig": { "responseMimeType": "application/json" }
                })),
                Matcher::Regex("INV-00123".to_string()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(gemini_reply(r#"{"extractions": [{"invoice_number": "INV-00123"}]}"#))
            .create_async()
            .await;

        let extractor = GeminiExtractor::new(&config_for(&server.url())).unwrap();
        let result = extractor
            .extract("Invoice Number: INV-00123", "extract invoice fields", &[])
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(result, vec![Extraction::new("invoice_number", "INV-00123")]);
    }

    async fn failure_for(status: usize, body: &str) -> ExtractionServiceError {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", Matcher::Any)
            .with_status(status)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await;
        let extractor = GeminiExtractor::new(&config_for(&server.url())).unwrap();
        extractor.extract("text", "prompt", &[]).await.unwrap_err()
    }

    #[tokio::test]
    async fn maps_http_failures() {
        let err = failure_for(403, r#"{"error": {"message": "API key not valid"}}"#).await;
        assert!(matches!(err, ExtractionServiceError::Auth(403)));

        let err = failure_for(429, "{}").await;
        assert!(matches!(err, ExtractionServiceError::RateLimited));

        let err = failure_for(503, "overloaded").await;
        assert!(matches!(err, ExtractionServiceError::Upstream { status: 503, .. }));
    }

    #[tokio::test]
    async fn blocked_or_empty_replies_are_malformed() {
        let err = failure_for(200, r#"{"promptFeedback": {"blockReason": "SAFETY"}}"#).await;
        assert!(err.to_string().contains("SAFETY"));

        let err = failure_for(200, &gemini_reply("Sorry, I can't help with that.")).await;
        assert!(matches!(err, ExtractionServiceError::MalformedOutput(_)));
    }
}
