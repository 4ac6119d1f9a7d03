use crate::errors::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

/// Product lifecycle. The status field is the single source of truth; every
/// transition below takes the current snapshot and returns either the updated
/// snapshot or a typed rejection, so the state machine is testable without
/// any network or storage layer in play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    Pending,
    Approved,
    Rejected,
    Listed,
    Sold,
}

impl fmt::Display for ProductStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProductStatus::Pending => "pending",
            ProductStatus::Approved => "approved",
            ProductStatus::Rejected => "rejected",
            ProductStatus::Listed => "listed",
            ProductStatus::Sold => "sold",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductCategory {
    Tshirt,
    Shirt,
    Jeans,
    Trousers,
    Dress,
    Skirt,
    Jacket,
    Sweater,
    Shoes,
    Accessories,
    Other,
}

impl ProductCategory {
    pub fn label(&self) -> &'static str {
        match self {
            ProductCategory::Tshirt => "t-shirt",
            ProductCategory::Shirt => "shirt",
            ProductCategory::Jeans => "jeans",
            ProductCategory::Trousers => "trousers",
            ProductCategory::Dress => "dress",
            ProductCategory::Skirt => "skirt",
            ProductCategory::Jacket => "jacket",
            ProductCategory::Sweater => "sweater",
            ProductCategory::Shoes => "shoes",
            ProductCategory::Accessories => "accessories",
            ProductCategory::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
    Kids,
    Unisex,
}

impl Gender {
    pub fn label(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
            Gender::Kids => "kids",
            Gender::Unisex => "unisex",
        }
    }
}

/// Buyer-facing top category, derived from the declared gender on the
/// approve path and nowhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MainCategory {
    Men,
    Women,
    Kids,
    Unisex,
}

impl MainCategory {
    pub fn from_gender(gender: Option<Gender>) -> Self {
        match gender {
            Some(Gender::Male) => MainCategory::Men,
            Some(Gender::Female) => MainCategory::Women,
            Some(Gender::Kids) => MainCategory::Kids,
            Some(Gender::Unisex) | None => MainCategory::Unisex,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl QualityTier {
    pub fn label(&self) -> &'static str {
        match self {
            QualityTier::Excellent => "excellent",
            QualityTier::Good => "good",
            QualityTier::Fair => "fair",
            QualityTier::Poor => "poor",
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SellerAttributes {
    pub article: String,
    pub brand: String,
    pub category: ProductCategory,
    #[serde(default)]
    pub gender: Option<Gender>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub age_months: Option<u32>,
    #[serde(default)]
    pub wear_count: Option<u32>,
    #[serde(default)]
    pub damage: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAnalysis {
    pub caption: String,
    pub quality: QualityTier,
    pub category: ProductCategory,
    pub colors: Option<Vec<String>>,
    pub brand_detected: Option<String>,
    pub condition_score: f32,
    pub features: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSuggestion {
    pub suggested_price: f64,
    pub reasoning: String,
    pub market_comparison: String,
    pub confidence_score: f32,
    pub factors: Vec<String>,
}

/// Frozen at submission time; the admin review reads it, never rewrites it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductAnalysis {
    pub image_analysis: ImageAnalysis,
    pub price_suggestion: PriceSuggestion,
    pub final_recommendation: String,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminReview {
    pub final_price: Option<f64>,
    pub mrp: Option<f64>,
    pub discount_percentage: Option<u32>,
    pub pricing_type: Option<String>,
    pub admin_notes: Option<String>,
    pub reviewed_by: String,
    pub reviewed_at: DateTime<Utc>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickupDetails {
    pub address: String,
    pub city: String,
    pub postal_code: String,
    pub phone: String,
    #[serde(default)]
    pub preferred_slot: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutDetails {
    #[serde(default)]
    pub upi_id: Option<String>,
    #[serde(default)]
    pub bank_account: Option<String>,
    #[serde(default)]
    pub ifsc: Option<String>,
}

impl PayoutDetails {
    fn has_destination(&self) -> bool {
        self.upi_id.as_deref().is_some_and(|v| !v.trim().is_empty())
            || (self
                .bank_account
                .as_deref()
                .is_some_and(|v| !v.trim().is_empty())
                && self.ifsc.as_deref().is_some_and(|v| !v.trim().is_empty()))
    }
}

/// Public listing snapshot. Written exactly once on the approve transition
/// and immutable afterwards except for explicit admin price edits.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListedProduct {
    pub title: String,
    pub description: String,
    pub price: f64,
    pub mrp: Option<f64>,
    pub discount_percentage: Option<u32>,
    pub category: ProductCategory,
    pub tags: Vec<String>,
    pub listed_at: DateTime<Utc>,
    pub main_category: MainCategory,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub seller: String,
    pub attributes: SellerAttributes,
    pub images: Vec<String>,
    pub ai_analysis: ProductAnalysis,
    pub status: ProductStatus,
    pub admin_review: Option<AdminReview>,
    pub pickup_details: Option<PickupDetails>,
    pub payment_details: Option<PayoutDetails>,
    pub listed_product: Option<ListedProduct>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum ReviewDecision {
    Approve {
        final_price: f64,
        mrp: Option<f64>,
        pricing_type: Option<String>,
        admin_notes: Option<String>,
    },
    Reject {
        admin_notes: Option<String>,
    },
}

/// `round((mrp - price) / mrp * 100)`, only meaningful for a positive mrp.
pub fn discount_percentage(mrp: f64, price: f64) -> Option<u32> {
    if mrp <= 0.0 {
        return None;
    }
    Some(((mrp - price) / mrp * 100.0).round() as u32)
}

impl Product {
    /// Creates a pending product. Callers run the pricing pipeline first;
    /// nothing is persisted until this returns Ok, so a failed submission
    /// leaves no partial record behind.
    pub fn submit(
        seller: impl Into<String>,
        attributes: SellerAttributes,
        images: Vec<String>,
        analysis: ProductAnalysis,
        now: DateTime<Utc>,
    ) -> Result<Self, CoreError> {
        if images.is_empty() {
            return Err(CoreError::validation("at least one image is required"));
        }
        if attributes.article.trim().is_empty() {
            return Err(CoreError::validation("article is required"));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            seller: seller.into(),
            attributes,
            images,
            ai_analysis: analysis,
            status: ProductStatus::Pending,
            admin_review: None,
            pickup_details: None,
            payment_details: None,
            listed_product: None,
            created_at: now,
            updated_at: now,
        })
    }

    fn require_owner(&self, caller: &str, action: &'static str) -> Result<(), CoreError> {
        if self.seller != caller {
            return Err(CoreError::forbidden(format!(
                "only the owning seller may {action}"
            )));
        }
        Ok(())
    }

    fn require_status(
        &self,
        expected: ProductStatus,
        action: &'static str,
    ) -> Result<(), CoreError> {
        if self.status != expected {
            return Err(CoreError::InvalidState {
                action,
                status: self.status,
            });
        }
        Ok(())
    }

    /// Seller accepts the AI offer: pending -> approved. Pickup and payout
    /// details must both be present before the product can enter the admin
    /// queue.
    pub fn accept_offer(
        &self,
        caller: &str,
        pickup: PickupDetails,
        payout: PayoutDetails,
        now: DateTime<Utc>,
    ) -> Result<Product, CoreError> {
        self.require_owner(caller, "accept the offer")?;
        self.require_status(ProductStatus::Pending, "accept_offer")?;
        if pickup.address.trim().is_empty() || pickup.phone.trim().is_empty() {
            return Err(CoreError::validation("pickup address and phone are required"));
        }
        if !payout.has_destination() {
            return Err(CoreError::validation(
                "payout details need a UPI id or a bank account with IFSC",
            ));
        }
        let mut next = self.clone();
        next.status = ProductStatus::Approved;
        next.pickup_details = Some(pickup);
        next.payment_details = Some(payout);
        next.updated_at = now;
        Ok(next)
    }

    /// Seller declines the AI offer: pending -> rejected. The optional reason
    /// is kept on the review record with a seller attribution prefix.
    pub fn reject_offer(
        &self,
        caller: &str,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Product, CoreError> {
        self.require_owner(caller, "reject the offer")?;
        self.require_status(ProductStatus::Pending, "reject_offer")?;
        let notes = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .map(|r| format!("seller: {r}"));
        let mut next = self.clone();
        next.status = ProductStatus::Rejected;
        next.admin_review = Some(AdminReview {
            final_price: None,
            mrp: None,
            discount_percentage: None,
            pricing_type: None,
            admin_notes: notes,
            reviewed_by: caller.to_string(),
            reviewed_at: now,
        });
        next.updated_at = now;
        Ok(next)
    }

    /// Admin decision: approved -> listed | rejected. The approve arm is the
    /// only writer of `listed_product` and the only producer of the main
    /// category.
    pub fn admin_review(
        &self,
        decision: ReviewDecision,
        reviewer: &str,
        now: DateTime<Utc>,
    ) -> Result<Product, CoreError> {
        self.require_status(ProductStatus::Approved, "admin_review")?;
        let mut next = self.clone();
        match decision {
            ReviewDecision::Approve {
                final_price,
                mrp,
                pricing_type,
                admin_notes,
            } => {
                if !final_price.is_finite() || final_price <= 0.0 {
                    return Err(CoreError::validation("final_price must be greater than zero"));
                }
                if let Some(m) = mrp
                    && m < final_price
                {
                    return Err(CoreError::validation("mrp must not be below final_price"));
                }
                let discount = mrp.and_then(|m| discount_percentage(m, final_price));
                next.admin_review = Some(AdminReview {
                    final_price: Some(final_price),
                    mrp,
                    discount_percentage: discount,
                    pricing_type,
                    admin_notes,
                    reviewed_by: reviewer.to_string(),
                    reviewed_at: now,
                });
                next.listed_product = Some(self.build_listing(final_price, mrp, discount, now));
                next.status = ProductStatus::Listed;
            }
            ReviewDecision::Reject { admin_notes } => {
                next.admin_review = Some(AdminReview {
                    final_price: None,
                    mrp: None,
                    discount_percentage: None,
                    pricing_type: None,
                    admin_notes,
                    reviewed_by: reviewer.to_string(),
                    reviewed_at: now,
                });
                next.status = ProductStatus::Rejected;
            }
        }
        next.updated_at = now;
        Ok(next)
    }

    /// Admin price correction on a live listing. Keeps the review price and
    /// the listing price in lockstep; the two must never diverge.
    pub fn edit_price(
        &self,
        price: f64,
        mrp: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<Product, CoreError> {
        self.require_status(ProductStatus::Listed, "edit_price")?;
        if !price.is_finite() || price <= 0.0 {
            return Err(CoreError::validation("price must be greater than zero"));
        }
        let mut next = self.clone();
        let review = next
            .admin_review
            .as_mut()
            .ok_or_else(|| CoreError::validation("listed product has no review record"))?;
        let listing = next
            .listed_product
            .as_mut()
            .ok_or_else(|| CoreError::validation("listed product has no listing snapshot"))?;
        let effective_mrp = mrp.or(review.mrp);
        if let Some(m) = effective_mrp
            && m < price
        {
            return Err(CoreError::validation("mrp must not be below price"));
        }
        let discount = effective_mrp.and_then(|m| discount_percentage(m, price));
        review.final_price = Some(price);
        review.mrp = effective_mrp;
        review.discount_percentage = discount;
        listing.price = price;
        listing.mrp = effective_mrp;
        listing.discount_percentage = discount;
        next.updated_at = now;
        Ok(next)
    }

    /// Settlement-driven transition: listed -> sold. Re-applying on an
    /// already-sold product is a no-op so payment confirmations can be
    /// redelivered safely; `changed` tells the caller which case it was.
    pub fn mark_sold(&self, now: DateTime<Utc>) -> Result<(Product, bool), CoreError> {
        match self.status {
            ProductStatus::Sold => Ok((self.clone(), false)),
            ProductStatus::Listed => {
                let mut next = self.clone();
                next.status = ProductStatus::Sold;
                next.updated_at = now;
                Ok((next, true))
            }
            status => Err(CoreError::InvalidState {
                action: "mark_sold",
                status,
            }),
        }
    }

    fn build_listing(
        &self,
        price: f64,
        mrp: Option<f64>,
        discount: Option<u32>,
        now: DateTime<Utc>,
    ) -> ListedProduct {
        let attrs = &self.attributes;
        let analysis = &self.ai_analysis;
        let title = format!("{} {}", attrs.brand.trim(), attrs.article.trim())
            .trim()
            .to_string();
        let description = format!(
            "{}\n\n{}",
            analysis.image_analysis.caption, analysis.price_suggestion.reasoning
        );

        let mut candidates: Vec<String> = vec![
            attrs.brand.clone(),
            attrs.article.clone(),
            attrs
                .gender
                .map(|g| g.label().to_string())
                .unwrap_or_default(),
            analysis.image_analysis.quality.label().to_string(),
        ];
        candidates.extend(analysis.image_analysis.features.iter().cloned());
        let tags = dedupe_tags(candidates.drain(..));

        ListedProduct {
            title,
            description,
            price,
            mrp,
            discount_percentage: discount,
            category: analysis.image_analysis.category,
            tags,
            listed_at: now,
            main_category: MainCategory::from_gender(attrs.gender),
        }
    }
}

fn dedupe_tags(values: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut tags = Vec::new();
    for value in values {
        let trimmed = value.trim().to_string();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_lowercase()) {
            tags.push(trimmed);
        }
    }
    tags
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn attributes() -> SellerAttributes {
        SellerAttributes {
            article: "Air Zoom Tee".into(),
            brand: "Nike".into(),
            category: ProductCategory::Tshirt,
            gender: Some(Gender::Male),
            size: Some("L".into()),
            age_months: Some(8),
            wear_count: Some(12),
            damage: None,
        }
    }

    pub fn analysis() -> ProductAnalysis {
        ProductAnalysis {
            image_analysis: ImageAnalysis {
                caption: "Light blue cotton t-shirt with printed logo".into(),
                quality: QualityTier::Good,
                category: ProductCategory::Tshirt,
                colors: Some(vec!["blue".into(), "white".into()]),
                brand_detected: Some("Nike".into()),
                condition_score: 7.0,
                features: vec!["printed logo".into(), "crew neck".into()],
            },
            price_suggestion: PriceSuggestion {
                suggested_price: 800.0,
                reasoning: "Brand resale demand is steady for this category".into(),
                market_comparison: "Comparable items list between 700 and 950".into(),
                confidence_score: 0.7,
                factors: vec!["brand".into(), "condition".into()],
            },
            final_recommendation: "Moderate confidence; admin review recommended.".into(),
        }
    }

    pub fn pending_product(seller: &str) -> Product {
        Product::submit(
            seller,
            attributes(),
            vec!["media/sha256-abc.jpg".into()],
            analysis(),
            Utc::now(),
        )
        .expect("pending product")
    }

    pub fn pickup() -> PickupDetails {
        PickupDetails {
            address: "14 Lake View Road".into(),
            city: "Pune".into(),
            postal_code: "411001".into(),
            phone: "+91-9000000000".into(),
            preferred_slot: Some("weekday mornings".into()),
        }
    }

    pub fn payout() -> PayoutDetails {
        PayoutDetails {
            upi_id: Some("seller@upi".into()),
            bank_account: None,
            ifsc: None,
        }
    }

    pub fn listed_product(seller: &str) -> Product {
        let pending = pending_product(seller);
        let approved = pending
            .accept_offer(seller, pickup(), payout(), Utc::now())
            .expect("approved");
        approved
            .admin_review(
                ReviewDecision::Approve {
                    final_price: 650.0,
                    mrp: Some(1000.0),
                    pricing_type: Some("fixed".into()),
                    admin_notes: None,
                },
                "admin@restitch.shop",
                Utc::now(),
            )
            .expect("listed")
    }
}
