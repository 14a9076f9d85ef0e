use serde::{Deserialize, Serialize};

/// Resolved pricing for a request
///
/// Pricing resolution (model tables, group discounts) happens outside
/// the core; the ledger only multiplies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceData {
    /// When set, bill a flat per-call price instead of per-token ratios
    pub use_price: bool,
    /// Flat price in quota units per `quota_per_unit`
    pub model_price: f64,
    /// Per-token multiplier for the model
    pub model_ratio: f64,
    /// Multiplier for the group the request ran under
    pub group_ratio: f64,
    /// Output-token multiplier relative to input
    pub completion_ratio: f64,
    /// Cache-read token multiplier
    pub cache_ratio: f64,
    /// Cache-creation token multiplier (unclassified TTL)
    pub cache_creation_ratio: f64,
    /// Cache-creation multiplier for 5-minute entries
    pub cache_creation_5m_ratio: f64,
    /// Cache-creation multiplier for 1-hour entries
    pub cache_creation_1h_ratio: f64,
}

impl Default for PriceData {
    fn default() -> Self {
        Self {
            use_price: false,
            model_price: 0.0,
            model_ratio: 1.0,
            group_ratio: 1.0,
            completion_ratio: 1.0,
            cache_ratio: 1.0,
            cache_creation_ratio: 1.0,
            cache_creation_5m_ratio: 1.0,
            cache_creation_1h_ratio: 1.0,
        }
    }
}

/// Token usage reported by the upstream after completion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    /// Prompt tokens served from the provider-side cache
    #[serde(default)]
    pub cache_read_tokens: i64,
    /// Prompt tokens written into the provider-side cache (all TTLs)
    #[serde(default)]
    pub cache_creation_tokens: i64,
    /// Cache-creation tokens with a 5-minute TTL
    #[serde(default)]
    pub cache_creation_5m_tokens: i64,
    /// Cache-creation tokens with a 1-hour TTL
    #[serde(default)]
    pub cache_creation_1h_tokens: i64,
}

impl Usage {
    /// Total tokens, used to detect empty (errored) upstream responses
    pub fn total_tokens(&self) -> i64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Total input-side tokens, the basis of the long-context rule
    pub fn total_input_tokens(&self) -> i64 {
        self.prompt_tokens + self.cache_read_tokens + self.cache_creation_tokens
    }
}
