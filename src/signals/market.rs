use crate::http::build_client;
use crate::product::ProductCategory;
use crate::signals::SignalError;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use urlencoding::encode;

/// Reference price band for comparable new items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketReference {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

/// Market-price lookup keyed by (effective brand, detected category). An
/// empty result set is "no reference", not an error.
pub struct MarketClient {
    endpoint: Option<String>,
    api_key: Option<String>,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    references: Vec<MarketReference>,
}

impl MarketClient {
    pub fn new(endpoint: Option<String>, api_key: Option<String>) -> Self {
        Self {
            endpoint,
            api_key,
            http: build_client(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            std::env::var("MARKET_API_URL").ok(),
            std::env::var("MARKET_API_KEY").ok(),
        )
    }

    pub async fn lookup(
        &self,
        brand: &str,
        category: ProductCategory,
    ) -> Result<Option<MarketReference>, SignalError> {
        let endpoint = self.endpoint.as_deref().ok_or(SignalError::Unconfigured)?;
        let url = format!(
            "{}/prices?brand={}&category={}",
            endpoint.trim_end_matches('/'),
            encode(brand),
            encode(category.label()),
        );
        let mut request = self.http.get(url);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }
        let response = request
            .send()
            .await
            .map_err(|err| SignalError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(SignalError::Http(format!("HTTP {}", response.status())));
        }
        let payload: LookupResponse = response
            .json()
            .await
            .map_err(|err| SignalError::InvalidResponse(err.to_string()))?;
        let reference = payload
            .references
            .into_iter()
            .find(|r| r.avg.is_finite() && r.avg > 0.0);
        Ok(reference)
    }
}
