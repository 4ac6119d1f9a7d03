use crate::http::build_client;
use crate::signals::SignalError;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

/// Coarse label plus confidence from the image classification signal.
#[derive(Debug, Clone)]
pub struct Classification {
    pub label: String,
    pub confidence: f32,
}

/// Image classification over the primary photo. Request carries the raw
/// bytes base64-encoded; the endpoint returns `{label, confidence}`.
pub struct VisionClient {
    endpoint: Option<String>,
    api_key: Option<String>,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    label: String,
    confidence: f32,
}

impl VisionClient {
    pub fn new(endpoint: Option<String>, api_key: Option<String>) -> Self {
        Self {
            endpoint,
            api_key,
            http: build_client(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            std::env::var("VISION_ENDPOINT").ok(),
            std::env::var("VISION_API_KEY").ok(),
        )
    }

    pub async fn classify(&self, image: &[u8]) -> Result<Classification, SignalError> {
        let endpoint = self.endpoint.as_deref().ok_or(SignalError::Unconfigured)?;
        let payload: ClassifyResponse =
            post_image(&self.http, endpoint, self.api_key.as_deref(), image).await?;
        if !(0.0..=1.0).contains(&payload.confidence) {
            return Err(SignalError::InvalidResponse(format!(
                "confidence out of range: {}",
                payload.confidence
            )));
        }
        Ok(Classification {
            label: payload.label,
            confidence: payload.confidence,
        })
    }
}

/// Brand OCR over the primary photo; an empty detection is treated as an
/// absent value upstream.
pub struct OcrClient {
    endpoint: Option<String>,
    api_key: Option<String>,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct BrandResponse {
    brand: String,
}

impl OcrClient {
    pub fn new(endpoint: Option<String>, api_key: Option<String>) -> Self {
        Self {
            endpoint,
            api_key,
            http: build_client(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            std::env::var("OCR_ENDPOINT").ok(),
            std::env::var("OCR_API_KEY").ok(),
        )
    }

    pub async fn detect_brand(&self, image: &[u8]) -> Result<String, SignalError> {
        let endpoint = self.endpoint.as_deref().ok_or(SignalError::Unconfigured)?;
        let payload: BrandResponse =
            post_image(&self.http, endpoint, self.api_key.as_deref(), image).await?;
        let brand = payload.brand.trim().to_string();
        if brand.is_empty() {
            return Err(SignalError::InvalidResponse("empty brand".into()));
        }
        Ok(brand)
    }
}

/// Dominant color extraction over the primary photo.
pub struct ColorClient {
    endpoint: Option<String>,
    api_key: Option<String>,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct ColorResponse {
    colors: Vec<String>,
}

impl ColorClient {
    pub fn new(endpoint: Option<String>, api_key: Option<String>) -> Self {
        Self {
            endpoint,
            api_key,
            http: build_client(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            std::env::var("COLOR_ENDPOINT").ok(),
            std::env::var("COLOR_API_KEY").ok(),
        )
    }

    pub async fn dominant_colors(&self, image: &[u8]) -> Result<Vec<String>, SignalError> {
        let endpoint = self.endpoint.as_deref().ok_or(SignalError::Unconfigured)?;
        let payload: ColorResponse =
            post_image(&self.http, endpoint, self.api_key.as_deref(), image).await?;
        let colors: Vec<String> = payload
            .colors
            .into_iter()
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .collect();
        if colors.is_empty() {
            return Err(SignalError::InvalidResponse("no colors detected".into()));
        }
        Ok(colors)
    }
}

async fn post_image<T: serde::de::DeserializeOwned>(
    http: &Client,
    endpoint: &str,
    api_key: Option<&str>,
    image: &[u8],
) -> Result<T, SignalError> {
    let body = json!({ "image": BASE64.encode(image) });
    let mut request = http.post(endpoint).json(&body);
    if let Some(key) = api_key {
        request = request.header("X-API-Key", key);
    }
    let response = request
        .send()
        .await
        .map_err(|err| SignalError::Http(err.to_string()))?;
    if !response.status().is_success() {
        return Err(SignalError::Http(format!("HTTP {}", response.status())));
    }
    response
        .json()
        .await
        .map_err(|err| SignalError::InvalidResponse(err.to_string()))
}
