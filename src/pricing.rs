use crate::product::{
    ImageAnalysis, PriceSuggestion, ProductAnalysis, ProductCategory, QualityTier,
    SellerAttributes,
};
use crate::signals::{MarketReference, PriceContext, SignalSet, best_effort};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::sync::Arc;
use tokio::time::Duration;

/// Used items resell at roughly 40-60% of the new price; the fallback
/// targets the midpoint of that band.
const USED_PRICE_FACTOR: f64 = 0.5;
const FALLBACK_CONFIDENCE: f32 = 0.6;
const NEUTRAL_CONDITION_SCORE: f32 = 7.0;
const GENERIC_FEATURE: &str = "everyday wearable";
const BASELINE_PRICE: f64 = 500.0;
const NO_MARKET_COMPARISON: &str = "No market comparison available.";

const BRAND_PRICE_HINTS: &[(&str, f64)] = &[
    ("nike", 800.0),
    ("adidas", 750.0),
    ("puma", 650.0),
    ("levi", 700.0),
    ("tommy", 900.0),
    ("zara", 600.0),
    ("h&m", 450.0),
    ("uniqlo", 500.0),
];

/// Derives the admin-facing analysis and price suggestion from the primary
/// image and the seller's declared attributes. Never fails: every upstream
/// signal is optional and each step has a deterministic fallback, so
/// classifier or gateway downtime can never block a submission.
pub struct PricingPipeline {
    signals: Arc<SignalSet>,
    budget: Duration,
}

impl PricingPipeline {
    pub fn new(signals: SignalSet) -> Self {
        Self {
            signals: Arc::new(signals),
            budget: signal_budget_from_env(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(SignalSet::from_env())
    }

    /// Pure transformation over the inputs and signal lookups; persistence is
    /// the caller's business and happens only after this returns.
    pub async fn analyze(
        &self,
        primary_image: Option<&[u8]>,
        declared: &SellerAttributes,
    ) -> ProductAnalysis {
        let classification = match primary_image {
            Some(bytes) => {
                best_effort("vision_classify", self.budget, self.signals.vision.classify(bytes))
                    .await
            }
            None => None,
        };

        let (caption, quality, condition_score, category, features) = match &classification {
            Some(c) => {
                let quality = quality_from_confidence(c.confidence);
                let category = category_from_label(&c.label).unwrap_or(declared.category);
                (
                    format!("{} in {} condition", c.label, quality.label()),
                    quality,
                    (c.confidence * 10.0).round().clamp(0.0, 10.0),
                    category,
                    vec![c.label.clone()],
                )
            }
            // Neutral baseline: submissions never block on classifier downtime.
            None => (
                format!(
                    "Pre-owned {} in good overall condition",
                    declared.category.label()
                ),
                QualityTier::Good,
                NEUTRAL_CONDITION_SCORE,
                declared.category,
                vec![GENERIC_FEATURE.to_string()],
            ),
        };

        let brand_detected = match primary_image {
            Some(bytes) => {
                best_effort("brand_ocr", self.budget, self.signals.ocr.detect_brand(bytes)).await
            }
            None => None,
        };
        let colors = match primary_image {
            Some(bytes) => {
                best_effort(
                    "dominant_colors",
                    self.budget,
                    self.signals.color.dominant_colors(bytes),
                )
                .await
            }
            None => None,
        };

        let effective_brand = brand_detected
            .clone()
            .filter(|b| !b.trim().is_empty())
            .unwrap_or_else(|| declared.brand.clone());

        let market = best_effort(
            "market_lookup",
            self.budget,
            self.signals.market.lookup(&effective_brand, category),
        )
        .await
        .flatten();

        let context = PriceContext {
            declared: declared.clone(),
            caption: caption.clone(),
            quality,
            condition_score,
            category,
            colors: colors.clone(),
            effective_brand: effective_brand.clone(),
            market: market.clone(),
        };
        let price_suggestion = match best_effort(
            "price_reasoning",
            self.budget,
            self.signals.reasoning.suggest_price(&context),
        )
        .await
        {
            Some(suggestion) => suggestion,
            None => fallback_suggestion(market.as_ref(), &effective_brand),
        };

        let final_recommendation = recommendation_for(price_suggestion.confidence_score);

        ProductAnalysis {
            image_analysis: ImageAnalysis {
                caption,
                quality,
                category,
                colors,
                brand_detected,
                condition_score,
                features,
            },
            price_suggestion,
            final_recommendation,
        }
    }
}

pub fn quality_from_confidence(confidence: f32) -> QualityTier {
    if confidence > 0.8 {
        QualityTier::Excellent
    } else if confidence > 0.6 {
        QualityTier::Good
    } else if confidence > 0.4 {
        QualityTier::Fair
    } else {
        QualityTier::Poor
    }
}

/// Deterministic price derivation for when the reasoning signal is down or
/// returned something unusable.
pub fn fallback_suggestion(
    market: Option<&MarketReference>,
    effective_brand: &str,
) -> PriceSuggestion {
    let (suggested_price, reasoning, market_comparison) = match market {
        Some(reference) => (
            (reference.avg * USED_PRICE_FACTOR).round(),
            "Priced at half the market average for comparable new items, the midpoint of the \
             typical resale band."
                .to_string(),
            format!(
                "Comparable new items range {:.0}-{:.0} (avg {:.0}).",
                reference.min, reference.max, reference.avg
            ),
        ),
        None => (
            brand_hint_price(effective_brand),
            "No market reference available; priced from brand heuristics.".to_string(),
            NO_MARKET_COMPARISON.to_string(),
        ),
    };
    PriceSuggestion {
        suggested_price,
        reasoning,
        market_comparison,
        confidence_score: FALLBACK_CONFIDENCE,
        factors: vec![
            "deterministic fallback".to_string(),
            "declared attributes".to_string(),
        ],
    }
}

fn brand_hint_price(brand: &str) -> f64 {
    let lowered = brand.to_lowercase();
    for (keyword, price) in BRAND_PRICE_HINTS {
        if lowered.contains(keyword) {
            return *price;
        }
    }
    BASELINE_PRICE
}

/// Advisory tiering for the admin; never gates a transition.
pub fn recommendation_for(confidence: f32) -> String {
    if confidence > 0.8 {
        "High confidence estimate; pricing can be applied as suggested.".to_string()
    } else if confidence > 0.6 {
        "Moderate confidence; admin review recommended.".to_string()
    } else {
        "Low confidence; requires admin review.".to_string()
    }
}

/// Seller-facing simplified view of the analysis, kept apart from the
/// structured admin record.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SellerReport {
    pub condition: String,
    pub suggested_price: f64,
    pub explanation: String,
    pub market_note: Option<String>,
}

pub fn seller_report(analysis: &ProductAnalysis) -> SellerReport {
    let suggestion = &analysis.price_suggestion;
    let market_note = (suggestion.market_comparison != NO_MARKET_COMPARISON)
        .then(|| suggestion.market_comparison.clone());
    SellerReport {
        condition: analysis.image_analysis.quality.label().to_string(),
        suggested_price: suggestion.suggested_price,
        explanation: suggestion.reasoning.clone(),
        market_note,
    }
}

fn category_from_label(label: &str) -> Option<ProductCategory> {
    let lowered = label.to_lowercase();
    let category = if lowered.contains("t-shirt") || lowered.contains("tee") {
        ProductCategory::Tshirt
    } else if lowered.contains("shirt") {
        ProductCategory::Shirt
    } else if lowered.contains("jean") || lowered.contains("denim") {
        ProductCategory::Jeans
    } else if lowered.contains("trouser") || lowered.contains("pant") {
        ProductCategory::Trousers
    } else if lowered.contains("dress") {
        ProductCategory::Dress
    } else if lowered.contains("skirt") {
        ProductCategory::Skirt
    } else if lowered.contains("jacket") || lowered.contains("coat") {
        ProductCategory::Jacket
    } else if lowered.contains("sweater") || lowered.contains("hoodie") {
        ProductCategory::Sweater
    } else if lowered.contains("shoe") || lowered.contains("sneaker") {
        ProductCategory::Shoes
    } else if lowered.contains("bag") || lowered.contains("belt") || lowered.contains("cap") {
        ProductCategory::Accessories
    } else {
        return None;
    };
    Some(category)
}

fn signal_budget_from_env() -> Duration {
    let secs = std::env::var("SIGNAL_BUDGET_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(8);
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::product::fixtures;
    use crate::signals::SignalSet;

    #[test]
    fn quality_thresholds_match_the_tiers() {
        assert_eq!(quality_from_confidence(0.85), QualityTier::Excellent);
        assert_eq!(quality_from_confidence(0.8), QualityTier::Good);
        assert_eq!(quality_from_confidence(0.7), QualityTier::Good);
        assert_eq!(quality_from_confidence(0.5), QualityTier::Fair);
        assert_eq!(quality_from_confidence(0.4), QualityTier::Poor);
        assert_eq!(quality_from_confidence(0.1), QualityTier::Poor);
    }

    #[test]
    fn fallback_uses_half_the_market_average() {
        let reference = MarketReference {
            min: 1000.0,
            max: 2000.0,
            avg: 1500.0,
        };
        let suggestion = fallback_suggestion(Some(&reference), "Nike");
        assert_eq!(suggestion.suggested_price, 750.0);
        assert_eq!(suggestion.confidence_score, 0.6);
    }

    #[test]
    fn fallback_brand_heuristic_is_deterministic() {
        for _ in 0..3 {
            let suggestion = fallback_suggestion(None, "Nike");
            assert_eq!(suggestion.suggested_price, 800.0);
            assert_eq!(suggestion.confidence_score, 0.6);
            assert_eq!(suggestion.market_comparison, NO_MARKET_COMPARISON);
        }
    }

    #[test]
    fn fallback_defaults_to_the_baseline_for_unknown_brands() {
        let suggestion = fallback_suggestion(None, "No Name Tailors");
        assert_eq!(suggestion.suggested_price, BASELINE_PRICE);
    }

    #[test]
    fn recommendation_tiers_split_on_confidence() {
        assert!(recommendation_for(0.9).starts_with("High confidence"));
        assert!(recommendation_for(0.7).starts_with("Moderate confidence"));
        assert!(recommendation_for(0.6).starts_with("Low confidence"));
        assert!(recommendation_for(0.2).starts_with("Low confidence"));
    }

    #[tokio::test]
    async fn analyze_degrades_to_the_neutral_baseline() {
        let pipeline = PricingPipeline::new(SignalSet::disabled());
        let declared = fixtures::attributes();
        let analysis = pipeline.analyze(None, &declared).await;

        assert_eq!(analysis.image_analysis.quality, QualityTier::Good);
        assert_eq!(analysis.image_analysis.condition_score, 7.0);
        assert_eq!(analysis.image_analysis.features, vec![GENERIC_FEATURE]);
        assert!(analysis.image_analysis.brand_detected.is_none());
        // declared brand "Nike" drives the heuristic price
        assert_eq!(analysis.price_suggestion.suggested_price, 800.0);
        assert_eq!(analysis.price_suggestion.confidence_score, 0.6);
        assert!(analysis.final_recommendation.starts_with("Low confidence"));
    }

    #[tokio::test]
    async fn analyze_is_deterministic_given_identical_inputs() {
        let pipeline = PricingPipeline::new(SignalSet::disabled());
        let declared = fixtures::attributes();
        let first = pipeline.analyze(None, &declared).await;
        let second = pipeline.analyze(None, &declared).await;
        assert_eq!(
            first.price_suggestion.suggested_price,
            second.price_suggestion.suggested_price
        );
        assert_eq!(first.image_analysis.caption, second.image_analysis.caption);
        assert_eq!(first.final_recommendation, second.final_recommendation);
    }

    #[test]
    fn seller_report_simplifies_the_analysis() {
        let analysis = fixtures::analysis();
        let report = seller_report(&analysis);
        assert_eq!(report.condition, "good");
        assert_eq!(report.suggested_price, 800.0);
        assert!(report.market_note.is_some());
    }

    #[test]
    fn classifier_labels_map_to_categories() {
        assert_eq!(category_from_label("graphic tee"), Some(ProductCategory::Tshirt));
        assert_eq!(category_from_label("denim jacket"), Some(ProductCategory::Jeans));
        assert_eq!(category_from_label("running sneaker"), Some(ProductCategory::Shoes));
        assert_eq!(category_from_label("mystery object"), None);
    }
}
