use crate::errors::CoreError;
use crate::order::{Order, OrderStatus};
use crate::store::Store;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tracing::{info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Reconciles an external payment confirmation with the order and the
/// products it references, exactly once, safely under gateway retries and
/// duplicate callbacks. Payment success is never rolled back: a failed
/// product transition downgrades the result to a partial settlement instead.
pub struct Settlement {
    store: Store,
    secret: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementOutcome {
    Settled,
    PartialSettlement,
}

#[derive(Debug, Clone, Serialize)]
pub struct SettlementFailure {
    pub product_ref: String,
    pub reason: String,
}

/// Operator-facing account of what a settlement touched. `failures` is the
/// reconciliation worklist when the outcome is partial.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementReport {
    pub order_id: Uuid,
    pub gateway_order_id: String,
    pub payment_ref: String,
    pub order_was_already_paid: bool,
    pub outcome: SettlementOutcome,
    pub products_marked_sold: Vec<Uuid>,
    pub products_already_sold: Vec<Uuid>,
    pub skipped_static_refs: Vec<String>,
    pub failures: Vec<SettlementFailure>,
}

struct CartSettlement {
    marked_sold: Vec<Uuid>,
    already_sold: Vec<Uuid>,
    skipped_static: Vec<String>,
    failures: Vec<SettlementFailure>,
}

impl Settlement {
    pub fn new(store: Store, secret: impl Into<String>) -> Self {
        Self {
            store,
            secret: secret.into(),
        }
    }

    pub fn from_env(store: Store) -> Self {
        let secret = std::env::var("RAZORPAY_KEY_SECRET")
            .or_else(|_| std::env::var("PAYMENT_SIGNING_SECRET"))
            .unwrap_or_else(|_| "demo-secret".to_string());
        Self::new(store, secret)
    }

    /// Gateway-driven settlement. Signature mismatch aborts before any
    /// mutation; an unknown order reference is terminal and never creates an
    /// order here.
    pub async fn verify_payment(
        &self,
        order_ref: &str,
        payment_ref: &str,
        signature: &str,
    ) -> Result<SettlementReport, CoreError> {
        if !signature_matches(&self.secret, order_ref, payment_ref, signature) {
            warn!(
                target = "restitch.settlement",
                order_ref, "payment signature rejected"
            );
            return Err(CoreError::SignatureInvalid);
        }

        let order = self
            .store
            .find_order_by_gateway_ref(order_ref)
            .await
            .ok_or(CoreError::NotFound("order"))?;

        self.settle(order, payment_ref).await
    }

    /// Administrative override: forces an order to paid and its products to
    /// sold outside the gateway confirmation. A no-op when the order is
    /// already paid, so it can never duplicate side effects.
    pub async fn force_settle(
        &self,
        order_id: Uuid,
        operator: &str,
    ) -> Result<SettlementReport, CoreError> {
        let order = self
            .store
            .get_order(order_id)
            .await
            .ok_or(CoreError::NotFound("order"))?;
        if order.status == OrderStatus::Paid {
            info!(
                target = "restitch.settlement",
                %order_id, operator, "force settle skipped: already paid"
            );
            return Ok(SettlementReport {
                order_id: order.id,
                gateway_order_id: order.gateway_order_id.clone(),
                payment_ref: order.gateway_payment_id.clone().unwrap_or_default(),
                order_was_already_paid: true,
                outcome: SettlementOutcome::Settled,
                products_marked_sold: Vec::new(),
                products_already_sold: Vec::new(),
                skipped_static_refs: Vec::new(),
                failures: Vec::new(),
            });
        }
        info!(
            target = "restitch.settlement",
            %order_id, operator, "manual settlement override"
        );
        let payment_ref = format!("manual:{}", Uuid::new_v4().simple());
        self.settle(order, &payment_ref).await
    }

    async fn settle(
        &self,
        order: Order,
        payment_ref: &str,
    ) -> Result<SettlementReport, CoreError> {
        let now = Utc::now();
        let (previous_status, paid_order) = self
            .store
            .update_order(order.id, |o| Ok(o.mark_paid(payment_ref, now)))
            .await?;
        let order_was_already_paid = previous_status == OrderStatus::Paid;

        let cart = self.settle_cart(&paid_order).await;
        let outcome = if cart.failures.is_empty() {
            SettlementOutcome::Settled
        } else {
            SettlementOutcome::PartialSettlement
        };
        crate::metrics::settlement_result(match outcome {
            SettlementOutcome::Settled => "settled",
            SettlementOutcome::PartialSettlement => "partial",
        });
        info!(
            target = "restitch.settlement",
            order_id = %paid_order.id,
            sold = cart.marked_sold.len(),
            already_sold = cart.already_sold.len(),
            skipped = cart.skipped_static.len(),
            failed = cart.failures.len(),
            "settlement applied"
        );

        Ok(SettlementReport {
            order_id: paid_order.id,
            gateway_order_id: paid_order.gateway_order_id.clone(),
            payment_ref: paid_order
                .gateway_payment_id
                .clone()
                .unwrap_or_else(|| payment_ref.to_string()),
            order_was_already_paid,
            outcome,
            products_marked_sold: cart.marked_sold,
            products_already_sold: cart.already_sold,
            skipped_static_refs: cart.skipped_static,
            failures: cart.failures,
        })
    }

    /// Partitions cart references into persisted products and static catalog
    /// entries; only persisted ones reach the state machine. A product that
    /// is already sold stays untouched, which is what makes redelivery safe.
    async fn settle_cart(&self, order: &Order) -> CartSettlement {
        let now = Utc::now();
        let mut result = CartSettlement {
            marked_sold: Vec::new(),
            already_sold: Vec::new(),
            skipped_static: Vec::new(),
            failures: Vec::new(),
        };
        for item in &order.cart {
            let Ok(product_id) = Uuid::parse_str(&item.product_id) else {
                result.skipped_static.push(item.product_id.clone());
                continue;
            };
            match self
                .store
                .update_product(product_id, |p| p.mark_sold(now).map(|(next, _)| next))
                .await
            {
                Ok(update) => {
                    if update.previous_status == crate::product::ProductStatus::Sold {
                        result.already_sold.push(product_id);
                    } else {
                        result.marked_sold.push(product_id);
                    }
                }
                Err(err) => {
                    warn!(
                        target = "restitch.settlement",
                        order_id = %order.id,
                        product_ref = %item.product_id,
                        error = %err,
                        "product transition failed during settlement"
                    );
                    result.failures.push(SettlementFailure {
                        product_ref: item.product_id.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        result
    }
}

/// Hex HMAC-SHA256 over `order_ref|payment_ref`, the gateway's signing scheme.
pub fn expected_signature(secret: &str, order_ref: &str, payment_ref: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(format!("{order_ref}|{payment_ref}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-effort comparison via `Mac::verify_slice`; a signature that is
/// not valid hex can never match.
pub fn signature_matches(secret: &str, order_ref: &str, payment_ref: &str, provided: &str) -> bool {
    let Ok(decoded) = hex::decode(provided.trim()) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(format!("{order_ref}|{payment_ref}").as_bytes());
    mac.verify_slice(&decoded).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::fixtures as order_fixtures;
    use crate::order::CartItem;
    use crate::product::fixtures as product_fixtures;
    use crate::product::ProductStatus;

    const SECRET: &str = "test-secret";

    async fn seed(store: &Store, cart: Vec<CartItem>) -> Order {
        let order = Order::create(
            "buyer-1",
            order_fixtures::address(),
            cart,
            699.0,
            format!("order_demo_{}", Uuid::new_v4().simple()),
            Utc::now(),
        )
        .unwrap();
        store.insert_order(order.clone()).await.unwrap();
        order
    }

    #[test]
    fn signature_round_trips() {
        let sig = expected_signature(SECRET, "order_1", "pay_1");
        assert!(signature_matches(SECRET, "order_1", "pay_1", &sig));
        assert!(!signature_matches(SECRET, "order_1", "pay_2", &sig));
        assert!(!signature_matches(SECRET, "order_1", "pay_1", "not-hex!"));
    }

    #[tokio::test]
    async fn mixed_cart_settles_persisted_and_skips_static() {
        let store = Store::new();
        let listed = product_fixtures::listed_product("seller-1");
        let product_id = listed.id;
        store.insert_product(listed).await;
        let order = seed(
            &store,
            vec![
                order_fixtures::cart_item(&product_id.to_string(), "650"),
                order_fixtures::cart_item("catalog-tote-bag", "49"),
            ],
        )
        .await;
        let settlement = Settlement::new(store.clone(), SECRET);

        let signature = expected_signature(SECRET, &order.gateway_order_id, "pay_42");
        let report = settlement
            .verify_payment(&order.gateway_order_id, "pay_42", &signature)
            .await
            .expect("settled");

        assert_eq!(report.outcome, SettlementOutcome::Settled);
        assert_eq!(report.products_marked_sold, vec![product_id]);
        assert_eq!(report.skipped_static_refs, vec!["catalog-tote-bag"]);
        assert!(report.failures.is_empty());

        let stored_order = store.get_order(order.id).await.unwrap();
        assert_eq!(stored_order.status, OrderStatus::Paid);
        assert_eq!(stored_order.gateway_payment_id.as_deref(), Some("pay_42"));
        let product = store.get_product(product_id).await.unwrap();
        assert_eq!(product.status, ProductStatus::Sold);
    }

    #[tokio::test]
    async fn bad_signature_mutates_nothing() {
        let store = Store::new();
        let listed = product_fixtures::listed_product("seller-1");
        let product_id = listed.id;
        store.insert_product(listed).await;
        let order = seed(
            &store,
            vec![order_fixtures::cart_item(&product_id.to_string(), "650")],
        )
        .await;
        let settlement = Settlement::new(store.clone(), SECRET);

        let err = settlement
            .verify_payment(&order.gateway_order_id, "pay_42", "deadbeef")
            .await
            .expect_err("should reject");
        assert!(matches!(err, CoreError::SignatureInvalid));

        let stored_order = store.get_order(order.id).await.unwrap();
        assert_eq!(stored_order.status, OrderStatus::Created);
        assert!(stored_order.gateway_payment_id.is_none());
        let product = store.get_product(product_id).await.unwrap();
        assert_eq!(product.status, ProductStatus::Listed);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_a_noop() {
        let store = Store::new();
        let listed = product_fixtures::listed_product("seller-1");
        let product_id = listed.id;
        store.insert_product(listed).await;
        let order = seed(
            &store,
            vec![order_fixtures::cart_item(&product_id.to_string(), "650")],
        )
        .await;
        let settlement = Settlement::new(store.clone(), SECRET);
        let signature = expected_signature(SECRET, &order.gateway_order_id, "pay_42");

        let first = settlement
            .verify_payment(&order.gateway_order_id, "pay_42", &signature)
            .await
            .expect("settled");
        assert!(!first.order_was_already_paid);
        assert_eq!(first.products_marked_sold, vec![product_id]);

        let second = settlement
            .verify_payment(&order.gateway_order_id, "pay_42", &signature)
            .await
            .expect("still ok");
        assert!(second.order_was_already_paid);
        assert!(second.products_marked_sold.is_empty());
        assert_eq!(second.products_already_sold, vec![product_id]);
        assert_eq!(second.outcome, SettlementOutcome::Settled);

        let stored_order = store.get_order(order.id).await.unwrap();
        assert_eq!(stored_order.gateway_payment_id.as_deref(), Some("pay_42"));
    }

    #[tokio::test]
    async fn missing_product_downgrades_to_partial_settlement() {
        let store = Store::new();
        let ghost = Uuid::new_v4();
        let order = seed(
            &store,
            vec![order_fixtures::cart_item(&ghost.to_string(), "650")],
        )
        .await;
        let settlement = Settlement::new(store.clone(), SECRET);
        let signature = expected_signature(SECRET, &order.gateway_order_id, "pay_42");

        let report = settlement
            .verify_payment(&order.gateway_order_id, "pay_42", &signature)
            .await
            .expect("qualified success");
        assert_eq!(report.outcome, SettlementOutcome::PartialSettlement);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].product_ref, ghost.to_string());

        // payment success is never rolled back
        let stored_order = store.get_order(order.id).await.unwrap();
        assert_eq!(stored_order.status, OrderStatus::Paid);
    }

    #[tokio::test]
    async fn unknown_order_reference_is_terminal() {
        let settlement = Settlement::new(Store::new(), SECRET);
        let signature = expected_signature(SECRET, "order_ghost", "pay_1");
        let err = settlement
            .verify_payment("order_ghost", "pay_1", &signature)
            .await
            .expect_err("should reject");
        assert!(matches!(err, CoreError::NotFound("order")));
    }

    #[tokio::test]
    async fn force_settle_is_a_noop_when_already_paid() {
        let store = Store::new();
        let listed = product_fixtures::listed_product("seller-1");
        let product_id = listed.id;
        store.insert_product(listed).await;
        let order = seed(
            &store,
            vec![order_fixtures::cart_item(&product_id.to_string(), "650")],
        )
        .await;
        let settlement = Settlement::new(store.clone(), SECRET);

        let first = settlement
            .force_settle(order.id, "admin@restitch.shop")
            .await
            .expect("forced");
        assert!(!first.order_was_already_paid);
        assert_eq!(first.products_marked_sold, vec![product_id]);
        assert!(first.payment_ref.starts_with("manual:"));

        let second = settlement
            .force_settle(order.id, "admin@restitch.shop")
            .await
            .expect("noop");
        assert!(second.order_was_already_paid);
        assert!(second.products_marked_sold.is_empty());
        assert!(second.failures.is_empty());
    }
}
