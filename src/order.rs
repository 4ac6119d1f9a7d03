use crate::errors::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Created,
    Paid,
    Failed,
}

/// Cart lines carry display prices as strings and may reference either a
/// persisted product id or a static catalog entry; settlement partitions
/// them later, checkout only needs the numbers.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartItem {
    pub product_id: String,
    pub name: String,
    pub price: String,
    pub quantity: u32,
    #[serde(default)]
    pub image: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Address {
    #[serde(default)]
    pub label: Option<String>,
    pub line1: String,
    #[serde(default)]
    pub line2: Option<String>,
    pub city: String,
    pub state: String,
    pub postal_code: String,
    #[serde(default = "Address::default_country")]
    pub country: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

impl Address {
    fn default_country() -> String {
        "IN".to_string()
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub user: String,
    /// Snapshot taken at checkout, deliberately not a reference.
    pub address: Address,
    pub cart: Vec<CartItem>,
    pub amount: f64,
    pub status: OrderStatus,
    pub gateway_order_id: String,
    pub gateway_payment_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn create(
        user: impl Into<String>,
        address: Address,
        cart: Vec<CartItem>,
        amount: f64,
        gateway_order_id: String,
        now: DateTime<Utc>,
    ) -> Result<Self, CoreError> {
        if cart.is_empty() {
            return Err(CoreError::validation("cart must not be empty"));
        }
        if gateway_order_id.trim().is_empty() {
            return Err(CoreError::validation("gateway order reference is required"));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            user: user.into(),
            address,
            cart,
            amount,
            status: OrderStatus::Created,
            gateway_order_id,
            gateway_payment_id: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Idempotent paid transition used by the settlement protocol. Re-applying
    /// on an already-paid order keeps the original payment reference.
    pub fn mark_paid(&self, payment_ref: &str, now: DateTime<Utc>) -> Order {
        let mut next = self.clone();
        if next.status != OrderStatus::Paid {
            next.status = OrderStatus::Paid;
            next.gateway_payment_id = Some(payment_ref.to_string());
            next.updated_at = now;
        }
        next
    }
}

/// Parses display prices such as "₹1,299" or "649.00".
pub fn parse_display_price(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let value: f64 = cleaned.parse().ok()?;
    if value.is_finite() && value >= 0.0 {
        Some(value)
    } else {
        None
    }
}

/// Server-side order total: cart lines plus the convenience fee. The caller
/// compares this against the client-supplied amount and rejects on mismatch
/// rather than silently substituting its own figure.
pub fn expected_amount(cart: &[CartItem], convenience_fee: f64) -> Result<f64, CoreError> {
    let mut total = 0.0;
    for item in cart {
        if item.quantity == 0 {
            return Err(CoreError::validation(format!(
                "cart item `{}` has zero quantity",
                item.name
            )));
        }
        let unit = parse_display_price(&item.price).ok_or_else(|| {
            CoreError::validation(format!(
                "cart item `{}` has an unreadable price `{}`",
                item.name, item.price
            ))
        })?;
        total += unit * f64::from(item.quantity);
    }
    Ok(total + convenience_fee)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn address() -> Address {
        Address {
            label: Some("home".into()),
            line1: "221B Residency Road".into(),
            line2: None,
            city: "Bengaluru".into(),
            state: "KA".into(),
            postal_code: "560025".into(),
            country: "IN".into(),
            phone: Some("+91-9111111111".into()),
            is_default: true,
        }
    }

    pub fn cart_item(product_id: &str, price: &str) -> CartItem {
        CartItem {
            product_id: product_id.to_string(),
            name: "Nike Air Zoom Tee".into(),
            price: price.to_string(),
            quantity: 1,
            image: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn display_prices_parse_with_currency_and_separators() {
        assert_eq!(parse_display_price("₹1,299"), Some(1299.0));
        assert_eq!(parse_display_price("649.00"), Some(649.0));
        assert_eq!(parse_display_price("Rs. 450"), Some(450.0));
        assert_eq!(parse_display_price("free-ish"), None);
    }

    #[test]
    fn expected_amount_sums_lines_plus_fee() {
        let cart = vec![
            cart_item("p-1", "₹650"),
            CartItem {
                quantity: 2,
                ..cart_item("p-2", "100")
            },
        ];
        let total = expected_amount(&cart, 49.0).unwrap();
        assert_eq!(total, 650.0 + 200.0 + 49.0);
    }

    #[test]
    fn expected_amount_rejects_unreadable_prices() {
        let cart = vec![cart_item("p-1", "ask me")];
        let err = expected_amount(&cart, 49.0).expect_err("should reject");
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn mark_paid_keeps_first_payment_reference() {
        let order = Order::create(
            "buyer-1",
            address(),
            vec![cart_item("p-1", "650")],
            699.0,
            "order_demo_123".into(),
            Utc::now(),
        )
        .unwrap();
        let paid = order.mark_paid("pay_001", Utc::now());
        assert_eq!(paid.status, OrderStatus::Paid);
        let again = paid.mark_paid("pay_002", Utc::now());
        assert_eq!(again.gateway_payment_id.as_deref(), Some("pay_001"));
        assert_eq!(again.updated_at, paid.updated_at);
    }
}
