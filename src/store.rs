use crate::errors::CoreError;
use crate::order::{Address, Order, OrderStatus};
use crate::product::{Product, ProductStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Shared persistent store. Handlers are stateless; every status transition
/// is applied while holding the write lock for its collection, so racing
/// updates on the same record resolve to exactly one winner and the losers
/// see the post-transition status.
#[derive(Clone, Default)]
pub struct Store {
    products: Arc<RwLock<HashMap<Uuid, Product>>>,
    orders: Arc<RwLock<OrderTable>>,
    users: Arc<RwLock<HashMap<String, UserProfile>>>,
}

#[derive(Default)]
struct OrderTable {
    by_id: HashMap<Uuid, Order>,
    by_gateway_ref: HashMap<String, Uuid>,
}

#[derive(Debug, Clone)]
pub struct UserProfile {
    pub user_id: String,
    pub email: String,
    pub addresses: Vec<Address>,
}

/// Result of a conditional product update; the prior status lets callers
/// distinguish a real transition from an idempotent re-apply.
#[derive(Debug, Clone)]
pub struct ProductUpdate {
    pub previous_status: ProductStatus,
    pub product: Product,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- products ----

    pub async fn insert_product(&self, product: Product) {
        let mut guard = self.products.write().await;
        guard.insert(product.id, product);
    }

    pub async fn get_product(&self, id: Uuid) -> Option<Product> {
        let guard = self.products.read().await;
        guard.get(&id).cloned()
    }

    /// Applies a transition under the write lock. The closure sees the
    /// current snapshot and returns the replacement or a typed rejection;
    /// nothing is written when it rejects.
    pub async fn update_product<F>(&self, id: Uuid, f: F) -> Result<ProductUpdate, CoreError>
    where
        F: FnOnce(&Product) -> Result<Product, CoreError>,
    {
        let mut guard = self.products.write().await;
        let current = guard.get(&id).ok_or(CoreError::NotFound("product"))?;
        let previous_status = current.status;
        let next = f(current)?;
        let product = next.clone();
        guard.insert(id, next);
        Ok(ProductUpdate {
            previous_status,
            product,
        })
    }

    pub async fn products_with_status(&self, statuses: &[ProductStatus]) -> Vec<Product> {
        let guard = self.products.read().await;
        let mut matched: Vec<Product> = guard
            .values()
            .filter(|p| statuses.contains(&p.status))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matched
    }

    /// Admin audit view, most recently touched first.
    pub async fn sold_products(&self) -> Vec<Product> {
        let guard = self.products.read().await;
        let mut sold: Vec<Product> = guard
            .values()
            .filter(|p| p.status == ProductStatus::Sold)
            .cloned()
            .collect();
        sold.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sold
    }

    // ---- orders ----

    /// Inserts an order, enforcing that each gateway order reference maps to
    /// at most one order.
    pub async fn insert_order(&self, order: Order) -> Result<(), CoreError> {
        let mut guard = self.orders.write().await;
        if guard.by_gateway_ref.contains_key(&order.gateway_order_id) {
            return Err(CoreError::validation(format!(
                "gateway order reference `{}` is already in use",
                order.gateway_order_id
            )));
        }
        guard
            .by_gateway_ref
            .insert(order.gateway_order_id.clone(), order.id);
        guard.by_id.insert(order.id, order);
        Ok(())
    }

    pub async fn get_order(&self, id: Uuid) -> Option<Order> {
        let guard = self.orders.read().await;
        guard.by_id.get(&id).cloned()
    }

    pub async fn find_order_by_gateway_ref(&self, gateway_ref: &str) -> Option<Order> {
        let guard = self.orders.read().await;
        let id = guard.by_gateway_ref.get(gateway_ref)?;
        guard.by_id.get(id).cloned()
    }

    pub async fn update_order<F>(&self, id: Uuid, f: F) -> Result<(OrderStatus, Order), CoreError>
    where
        F: FnOnce(&Order) -> Result<Order, CoreError>,
    {
        let mut guard = self.orders.write().await;
        let current = guard.by_id.get(&id).ok_or(CoreError::NotFound("order"))?;
        let previous_status = current.status;
        let next = f(current)?;
        let order = next.clone();
        guard.by_id.insert(id, next);
        Ok((previous_status, order))
    }

    pub async fn orders_for_user(&self, user_id: &str) -> Vec<Order> {
        let guard = self.orders.read().await;
        let mut orders: Vec<Order> = guard
            .by_id
            .values()
            .filter(|o| o.user == user_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        orders
    }

    // ---- users / addresses ----

    pub async fn ensure_user(&self, user_id: &str, email: &str) -> UserProfile {
        let mut guard = self.users.write().await;
        guard
            .entry(user_id.to_string())
            .or_insert_with(|| UserProfile {
                user_id: user_id.to_string(),
                email: email.to_string(),
                addresses: Vec::new(),
            })
            .clone()
    }

    /// Adds an address. The at-most-one-default invariant is enforced here at
    /// the write boundary: a new default clears every other flag in the same
    /// write, and the first address always becomes the default.
    pub async fn add_address(
        &self,
        user_id: &str,
        email: &str,
        mut address: Address,
    ) -> Result<UserProfile, CoreError> {
        let mut guard = self.users.write().await;
        let profile = guard
            .entry(user_id.to_string())
            .or_insert_with(|| UserProfile {
                user_id: user_id.to_string(),
                email: email.to_string(),
                addresses: Vec::new(),
            });
        if profile.addresses.is_empty() {
            address.is_default = true;
        }
        if address.is_default {
            for existing in &mut profile.addresses {
                existing.is_default = false;
            }
        }
        profile.addresses.push(address);
        Ok(profile.clone())
    }

    pub async fn set_default_address(
        &self,
        user_id: &str,
        index: usize,
    ) -> Result<UserProfile, CoreError> {
        let mut guard = self.users.write().await;
        let profile = guard
            .get_mut(user_id)
            .ok_or(CoreError::NotFound("user"))?;
        if index >= profile.addresses.len() {
            return Err(CoreError::NotFound("address"));
        }
        for (pos, address) in profile.addresses.iter_mut().enumerate() {
            address.is_default = pos == index;
        }
        Ok(profile.clone())
    }

    pub async fn default_address(&self, user_id: &str) -> Option<Address> {
        let guard = self.users.read().await;
        guard
            .get(user_id)?
            .addresses
            .iter()
            .find(|a| a.is_default)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::fixtures as order_fixtures;
    use crate::product::fixtures as product_fixtures;
    use crate::product::ReviewDecision;
    use chrono::Utc;

    fn approved_product(seller: &str) -> Product {
        let pending = product_fixtures::pending_product(seller);
        pending
            .accept_offer(
                seller,
                product_fixtures::pickup(),
                product_fixtures::payout(),
                Utc::now(),
            )
            .expect("approved")
    }

    #[tokio::test]
    async fn concurrent_reviews_produce_exactly_one_listing() {
        let store = Store::new();
        let product = approved_product("seller-1");
        let id = product.id;
        store.insert_product(product).await;

        let decision = || ReviewDecision::Approve {
            final_price: 650.0,
            mrp: Some(1000.0),
            pricing_type: None,
            admin_notes: None,
        };

        let store_a = store.clone();
        let store_b = store.clone();
        let a = tokio::spawn(async move {
            store_a
                .update_product(id, |p| p.admin_review(decision(), "admin-a@restitch.shop", Utc::now()))
                .await
        });
        let b = tokio::spawn(async move {
            store_b
                .update_product(id, |p| p.admin_review(decision(), "admin-b@restitch.shop", Utc::now()))
                .await
        });

        let results = [a.await.unwrap(), b.await.unwrap()];
        let wins = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(wins, 1);
        let loss = results.iter().find(|r| r.is_err()).unwrap();
        assert!(matches!(
            loss.as_ref().unwrap_err(),
            CoreError::InvalidState { .. }
        ));

        let stored = store.get_product(id).await.unwrap();
        assert_eq!(stored.status, ProductStatus::Listed);
    }

    #[tokio::test]
    async fn rejected_transition_writes_nothing() {
        let store = Store::new();
        let product = product_fixtures::pending_product("seller-1");
        let id = product.id;
        store.insert_product(product).await;

        let err = store
            .update_product(id, |p| p.edit_price(700.0, None, Utc::now()))
            .await
            .expect_err("should reject");
        assert!(matches!(err, CoreError::InvalidState { .. }));
        let stored = store.get_product(id).await.unwrap();
        assert_eq!(stored.status, ProductStatus::Pending);
    }

    #[tokio::test]
    async fn listed_and_sold_views_are_disjoint() {
        let store = Store::new();
        let listed = product_fixtures::listed_product("seller-1");
        let (sold, _) = product_fixtures::listed_product("seller-2")
            .mark_sold(Utc::now())
            .unwrap();
        store.insert_product(listed.clone()).await;
        store.insert_product(sold.clone()).await;

        let listed_view = store.products_with_status(&[ProductStatus::Listed]).await;
        let sold_view = store.sold_products().await;
        assert_eq!(listed_view.len(), 1);
        assert_eq!(listed_view[0].id, listed.id);
        assert_eq!(sold_view.len(), 1);
        assert_eq!(sold_view[0].id, sold.id);
    }

    #[tokio::test]
    async fn gateway_reference_is_unique_per_order() {
        let store = Store::new();
        let make = || {
            Order::create(
                "buyer-1",
                order_fixtures::address(),
                vec![order_fixtures::cart_item("p-1", "650")],
                699.0,
                "order_demo_1".into(),
                Utc::now(),
            )
            .unwrap()
        };
        store.insert_order(make()).await.unwrap();
        let err = store.insert_order(make()).await.expect_err("should reject");
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn default_address_stays_unique_across_writes() {
        let store = Store::new();
        let first = order_fixtures::address();
        let second = Address {
            label: Some("office".into()),
            is_default: true,
            ..order_fixtures::address()
        };
        store
            .add_address("buyer-1", "buyer@restitch.shop", first)
            .await
            .unwrap();
        let profile = store
            .add_address("buyer-1", "buyer@restitch.shop", second)
            .await
            .unwrap();
        let defaults = profile.addresses.iter().filter(|a| a.is_default).count();
        assert_eq!(defaults, 1);
        assert!(profile.addresses[1].is_default);

        let profile = store.set_default_address("buyer-1", 0).await.unwrap();
        let defaults = profile.addresses.iter().filter(|a| a.is_default).count();
        assert_eq!(defaults, 1);
        assert!(profile.addresses[0].is_default);
    }
}
