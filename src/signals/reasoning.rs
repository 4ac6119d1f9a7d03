use crate::http::build_client;
use crate::product::{ProductCategory, PriceSuggestion, QualityTier, SellerAttributes};
use crate::signals::{MarketReference, SignalError};
use eyre::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

const SYSTEM_PROMPT: &str = r#"
You are a resale pricing analyst for a used-clothing marketplace. Given the
seller's declared attributes, the image analysis, and an optional market
reference band for comparable new items, respond with a JSON object:
{"suggested_price": number, "reasoning": string, "market_comparison": string,
"confidence_score": number between 0 and 1, "factors": [string]}.
Used items typically resell at 40-60% of the new price. Output JSON only.
"#;

#[derive(Debug, Clone)]
pub struct ReasoningConfig {
    pub gateway_url: String,
    pub api_key: Option<String>,
    pub function_name: Option<String>,
    pub model: Option<String>,
}

impl ReasoningConfig {
    pub fn from_env() -> Self {
        Self {
            gateway_url: std::env::var("TENSORZERO_GATEWAY_URL").unwrap_or_default(),
            api_key: std::env::var("TENSORZERO_API_KEY").ok(),
            function_name: std::env::var("TENSORZERO_FUNCTION").ok(),
            model: std::env::var("TENSORZERO_MODEL").ok(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            gateway_url: String::new(),
            api_key: None,
            function_name: None,
            model: None,
        }
    }
}

/// Everything the reasoning signal gets to see when asked for a price.
#[derive(Debug, Clone, Serialize)]
pub struct PriceContext {
    pub declared: SellerAttributes,
    pub caption: String,
    pub quality: QualityTier,
    pub condition_score: f32,
    pub category: ProductCategory,
    pub colors: Option<Vec<String>>,
    pub effective_brand: String,
    pub market: Option<MarketReference>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReasoningMessage {
    pub role: String,
    pub content: String,
}

/// Generative pricing signal behind a TensorZero gateway.
pub struct ReasoningClient {
    http: Client,
    config: ReasoningConfig,
}

impl ReasoningClient {
    pub fn new(config: ReasoningConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }

    /// Asks the gateway for a structured price suggestion. Any malformed or
    /// out-of-contract output is an error; the pipeline falls back rather
    /// than passing partial suggestions on to the admin.
    pub async fn suggest_price(&self, context: &PriceContext) -> Result<PriceSuggestion, SignalError> {
        let payload = serde_json::to_value(context)
            .map_err(|err| SignalError::InvalidResponse(err.to_string()))?;
        let messages = vec![
            ReasoningMessage {
                role: "system".into(),
                content: SYSTEM_PROMPT.into(),
            },
            ReasoningMessage {
                role: "user".into(),
                content: payload.to_string(),
            },
        ];
        let text = self.chat(&messages).await?;
        parse_suggestion(&text)
    }

    async fn chat(&self, messages: &[ReasoningMessage]) -> Result<String, SignalError> {
        let gateway = self.config.gateway_url.trim();
        if gateway.is_empty() {
            return Err(SignalError::Unconfigured);
        }

        let function_name = self
            .config
            .function_name
            .as_deref()
            .unwrap_or("price_reasoning");
        let body = json!({
            "function_name": function_name,
            "model_name": self.config.model,
            "input": { "messages": messages },
        });

        let mut request = self.http.post(format!("{gateway}/inference")).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| SignalError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(SignalError::Http(format!("HTTP {}", response.status())));
        }

        let payload: GatewayResponse = response
            .json()
            .await
            .map_err(|err| SignalError::InvalidResponse(err.to_string()))?;
        payload
            .content
            .into_iter()
            .find(|item| item.r#type == "text")
            .map(|item| item.text)
            .ok_or_else(|| SignalError::InvalidResponse("missing text content".into()))
    }
}

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    content: Vec<GatewayContent>,
}

#[derive(Debug, Deserialize)]
struct GatewayContent {
    r#type: String,
    text: String,
}

/// Parses and validates the structured suggestion. Every field is required;
/// the price must be a positive finite number and the confidence must sit
/// in [0, 1].
pub fn parse_suggestion(text: &str) -> Result<PriceSuggestion, SignalError> {
    let cleaned = strip_markdown_fence(text);
    let suggestion: PriceSuggestion = serde_json::from_str(&cleaned)
        .map_err(|err| SignalError::InvalidResponse(err.to_string()))?;
    if !suggestion.suggested_price.is_finite() || suggestion.suggested_price <= 0.0 {
        return Err(SignalError::InvalidResponse(format!(
            "unusable suggested_price: {}",
            suggestion.suggested_price
        )));
    }
    if !(0.0..=1.0).contains(&suggestion.confidence_score) {
        return Err(SignalError::InvalidResponse(format!(
            "confidence out of range: {}",
            suggestion.confidence_score
        )));
    }
    if suggestion.reasoning.trim().is_empty() {
        return Err(SignalError::InvalidResponse("empty reasoning".into()));
    }
    Ok(suggestion)
}

fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const WELL_FORMED: &str = r#"{
        "suggested_price": 720,
        "reasoning": "Popular brand with light wear",
        "market_comparison": "New equivalents sell around 1500",
        "confidence_score": 0.82,
        "factors": ["brand", "condition", "market band"]
    }"#;

    #[test]
    fn parses_plain_json() {
        let suggestion = parse_suggestion(WELL_FORMED).expect("parse");
        assert_eq!(suggestion.suggested_price, 720.0);
        assert_eq!(suggestion.factors.len(), 3);
    }

    #[test]
    fn parses_fenced_json() {
        let fenced = format!("```json\n{WELL_FORMED}\n```");
        let suggestion = parse_suggestion(&fenced).expect("parse");
        assert_eq!(suggestion.confidence_score, 0.82);
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let bad = WELL_FORMED.replace("0.82", "1.7");
        assert!(parse_suggestion(&bad).is_err());
    }

    #[test]
    fn rejects_non_positive_price() {
        let bad = WELL_FORMED.replace("720", "0");
        assert!(parse_suggestion(&bad).is_err());
    }

    #[test]
    fn rejects_prose_output() {
        assert!(parse_suggestion("I think 700 rupees sounds fair.").is_err());
    }
}
