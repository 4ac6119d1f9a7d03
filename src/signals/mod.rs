pub mod market;
pub mod reasoning;
pub mod vision;

pub use market::{MarketClient, MarketReference};
pub use reasoning::{PriceContext, ReasoningClient, ReasoningConfig};
pub use vision::{Classification, ColorClient, OcrClient, VisionClient};

use std::future::Future;
use thiserror::Error;
use tokio::time::{Duration, timeout};
use tracing::warn;

/// Failure of an optional external signal. These never propagate to a
/// submitter; the pricing pipeline absorbs them through `best_effort`.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signal endpoint not configured")]
    Unconfigured,
    #[error("request failed: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Every external signal goes through this single degrade point: a bounded
/// time budget, a warning on failure, and a typed `None` instead of an error.
pub async fn best_effort<T, F>(name: &'static str, budget: Duration, fut: F) -> Option<T>
where
    F: Future<Output = Result<T, SignalError>>,
{
    match timeout(budget, fut).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(err)) => {
            warn!(target = "restitch.signals", signal = name, error = %err, "signal_degraded");
            crate::metrics::signal_fallback(name);
            None
        }
        Err(_) => {
            warn!(
                target = "restitch.signals",
                signal = name,
                budget_ms = budget.as_millis() as u64,
                "signal_timed_out"
            );
            crate::metrics::signal_fallback(name);
            None
        }
    }
}

/// The full set of best-effort collaborators the pricing pipeline consumes.
pub struct SignalSet {
    pub vision: VisionClient,
    pub ocr: OcrClient,
    pub color: ColorClient,
    pub market: MarketClient,
    pub reasoning: ReasoningClient,
}

impl SignalSet {
    pub fn from_env() -> Self {
        Self {
            vision: VisionClient::from_env(),
            ocr: OcrClient::from_env(),
            color: ColorClient::from_env(),
            market: MarketClient::from_env(),
            reasoning: ReasoningClient::new(ReasoningConfig::from_env()),
        }
    }

    /// All clients unconfigured; every signal degrades to its fallback.
    pub fn disabled() -> Self {
        Self {
            vision: VisionClient::new(None, None),
            ocr: OcrClient::new(None, None),
            color: ColorClient::new(None, None),
            market: MarketClient::new(None, None),
            reasoning: ReasoningClient::new(ReasoningConfig::disabled()),
        }
    }
}
