use crate::errors::CoreError;
use crate::order::{Address, CartItem};
use crate::pricing::SellerReport;
use crate::product::{
    ListedProduct, PayoutDetails, PickupDetails, Product, ReviewDecision, SellerAttributes,
};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use uuid::Uuid;

/// Wire-level error body shared by every non-2xx response.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub detail: Option<String>,
}

/// An image in a submission: either a URL the client already hosts, or the
/// raw bytes base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImagePayload {
    Url(String),
    Inline {
        data: String,
        #[serde(default)]
        content_type: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub images: Vec<ImagePayload>,
    pub attributes: SellerAttributes,
}

/// Cached verbatim for idempotent replays, hence the Deserialize derive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub product: Product,
    pub seller_report: SellerReport,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcceptOfferRequest {
    pub pickup: PickupDetails,
    pub payout: PayoutDetails,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RejectOfferRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    Approve,
    Reject,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewRequest {
    pub action: ReviewAction,
    #[serde(default)]
    pub final_price: Option<f64>,
    #[serde(default)]
    pub mrp: Option<f64>,
    #[serde(default)]
    pub pricing_type: Option<String>,
    #[serde(default)]
    pub admin_notes: Option<String>,
}

impl ReviewRequest {
    pub fn into_decision(self) -> Result<ReviewDecision, CoreError> {
        match self.action {
            ReviewAction::Approve => {
                let final_price = self
                    .final_price
                    .ok_or_else(|| CoreError::validation("approve requires a final_price"))?;
                Ok(ReviewDecision::Approve {
                    final_price,
                    mrp: self.mrp,
                    pricing_type: self.pricing_type,
                    admin_notes: self.admin_notes,
                })
            }
            ReviewAction::Reject => Ok(ReviewDecision::Reject {
                admin_notes: self.admin_notes,
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EditPriceRequest {
    pub price: f64,
    #[serde(default)]
    pub mrp: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRequest {
    pub cart: Vec<CartItem>,
    pub amount: f64,
    #[serde(default)]
    pub address: Option<Address>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutResponse {
    pub order_id: Uuid,
    pub gateway_order_id: String,
    pub amount: f64,
    pub currency: String,
    pub key_id: String,
}

/// Field names follow the gateway's callback payload.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyPaymentRequest {
    pub razorpay_order_id: String,
    pub razorpay_payment_id: String,
    pub razorpay_signature: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetDefaultAddressRequest {
    pub index: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileResponse {
    pub user_id: String,
    pub email: String,
    pub addresses: Vec<Address>,
}

/// Buyer-facing projection of a listed product; internal pricing analysis
/// and seller details never leave through this view.
#[derive(Debug, Clone, Serialize)]
pub struct ListingView {
    pub id: Uuid,
    pub images: Vec<String>,
    pub listing: ListedProduct,
}

impl ListingView {
    pub fn from_product(product: &Product) -> Option<Self> {
        let listing = product.listed_product.clone()?;
        Some(Self {
            id: product.id,
            images: product.images.clone(),
            listing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_payload_accepts_both_shapes() {
        let url: ImagePayload = serde_json::from_str(r#""https://cdn.example/a.jpg""#).unwrap();
        assert!(matches!(url, ImagePayload::Url(_)));

        let inline: ImagePayload =
            serde_json::from_str(r#"{"data": "aGVsbG8=", "content_type": "image/png"}"#).unwrap();
        assert!(matches!(inline, ImagePayload::Inline { .. }));
    }

    #[test]
    fn approve_without_price_is_rejected() {
        let request = ReviewRequest {
            action: ReviewAction::Approve,
            final_price: None,
            mrp: None,
            pricing_type: None,
            admin_notes: None,
        };
        assert!(matches!(
            request.into_decision(),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn reject_carries_notes_through() {
        let request = ReviewRequest {
            action: ReviewAction::Reject,
            final_price: None,
            mrp: None,
            pricing_type: None,
            admin_notes: Some("stains on the collar".into()),
        };
        let decision = request.into_decision().unwrap();
        assert!(matches!(
            decision,
            ReviewDecision::Reject {
                admin_notes: Some(_)
            }
        ));
    }
}
