use crate::http::build_client;
use once_cell::sync::Lazy;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

static GATEWAY_ROOT: Lazy<String> = Lazy::new(|| {
    std::env::var("PAYMENT_GATEWAY_URL").unwrap_or_else(|_| "https://api.razorpay.com".to_string())
});

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Request(String),
    #[error("gateway returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// What checkout hands back to the client so it can open the payment widget.
#[derive(Debug, Clone, Serialize)]
pub struct OrderSession {
    pub gateway_order_id: String,
    pub amount: f64,
    pub currency: String,
    pub key_id: String,
}

/// Razorpay order-session client. Without credentials it runs in offline
/// mode and mints local references, which keeps checkout usable in dev and
/// in tests.
pub struct GatewayClient {
    key_id: Option<String>,
    key_secret: Option<String>,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct GatewayOrderResponse {
    id: String,
}

impl GatewayClient {
    pub fn new(key_id: Option<String>, key_secret: Option<String>) -> Self {
        Self {
            key_id,
            key_secret,
            http: build_client(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            std::env::var("RAZORPAY_KEY_ID").ok(),
            std::env::var("RAZORPAY_KEY_SECRET").ok(),
        )
    }

    pub fn is_offline(&self) -> bool {
        self.key_id.is_none() || self.key_secret.is_none()
    }

    /// Creates a gateway order session for the given rupee amount. The
    /// gateway wants paise, so the amount is scaled and rounded here, once.
    pub async fn create_order_session(
        &self,
        amount: f64,
        receipt: &str,
    ) -> Result<OrderSession, GatewayError> {
        let (Some(key_id), Some(key_secret)) = (&self.key_id, &self.key_secret) else {
            let gateway_order_id = format!("order_local_{}", Uuid::new_v4().simple());
            info!(
                target = "restitch.payments",
                gateway_order_id, "gateway offline, minted local order reference"
            );
            return Ok(OrderSession {
                gateway_order_id,
                amount,
                currency: "INR".to_string(),
                key_id: "offline".to_string(),
            });
        };

        let body = json!({
            "amount": (amount * 100.0).round() as i64,
            "currency": "INR",
            "receipt": receipt,
        });
        let response = self
            .http
            .post(format!("{}/v1/orders", *GATEWAY_ROOT))
            .basic_auth(key_id, Some(key_secret))
            .json(&body)
            .send()
            .await
            .map_err(|err| GatewayError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(GatewayError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let payload: GatewayOrderResponse = response
            .json()
            .await
            .map_err(|err| GatewayError::InvalidResponse(err.to_string()))?;
        Ok(OrderSession {
            gateway_order_id: payload.id,
            amount,
            currency: "INR".to_string(),
            key_id: key_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offline_mode_mints_local_references() {
        let client = GatewayClient::new(None, None);
        assert!(client.is_offline());
        let session = client
            .create_order_session(699.0, "order-receipt-1")
            .await
            .expect("offline session");
        assert!(session.gateway_order_id.starts_with("order_local_"));
        assert_eq!(session.currency, "INR");
        assert_eq!(session.key_id, "offline");

        let second = client
            .create_order_session(699.0, "order-receipt-2")
            .await
            .expect("offline session");
        assert_ne!(session.gateway_order_id, second.gateway_order_id);
    }
}
